//! Typed translation of CPython stack bytecode.
//!
//! The pipeline turns a [`CodeObject`](quill_bytecode::CodeObject) into a
//! stream of typed, lowered instructions for a backend:
//!
//! - [`op`]: the [`Op`] family with stack effects, targets and lowering
//! - [`flow`]: basic blocks and edges
//! - [`dataflow`]: the fixed point of [`StackMetadata`] over the graph
//! - [`exception`]: static exception regions from handler blocks
//! - [`desugar`] and [`generator`]: the structural rewrites
//! - [`emit`]: the [`Emitter`] interface a backend implements
//! - [`translator`]: orchestration and the [`TranslationCache`]
//!
//! Translation of one function is single-threaded. A [`Translator`] can be
//! shared between threads.

pub mod bitset;
pub mod cache;
pub mod config;
pub mod dataflow;
pub mod desugar;
pub mod emit;
pub mod error;
pub mod exception;
pub mod flow;
pub mod generator;
pub mod metadata;
pub mod op;
pub mod rewrite;
pub mod signature;
pub mod translator;

pub use cache::{FunctionId, TranslationCache, Translated};
pub use config::TranslatorConfig;
pub use emit::{EmitSite, Emitter, ListingEmitter, RecordingEmitter, UnitHeader};
pub use error::{DecodeError, EmissionFailure, EmitError, TranslateError};
pub use exception::{ExceptionRegion, RegionKind};
pub use generator::{GeneratorDescriptor, ResumeState};
pub use metadata::{BlockFrame, BlockKind, SlotType, StackMetadata};
pub use op::lower::Lowering;
pub use op::{BinaryOp, Instr, Op, UnaryOp};
pub use signature::CallSignature;
pub use translator::{Translation, Translator};
