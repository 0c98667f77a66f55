//! Reference backend for the quill translator.
//!
//! The runtime implements [`quill_compiler::Emitter`] to collect each
//! translated function into a [`Program`], then interprets it:
//!
//! ```text
//!   CodeObject ──Translator──▶ ProgramEmitter ──▶ Program ──Frame::run──▶ Value
//!                                                    │
//!                                   generator? ──────┴──▶ Generator (state machine)
//! ```
//!
//! Exceptions are routed through the translated exception regions, and
//! generators run as explicit state machines whose suspended state is only
//! what the translator reported live. Anything the host wants to expose
//! beyond the builtin types comes in through [`NativeObject`].

pub mod builtins;
pub mod error;
pub mod exception;
pub mod frame;
pub mod function;
pub mod generator;
pub mod native;
pub mod ops;
pub mod program;
pub mod runtime;
pub mod value;

pub use error::{RunResult, RuntimeError};
pub use exception::{ExcInfo, ExceptionObject, TraceEntry};
pub use frame::{Frame, MAX_RECURSION_DEPTH};
pub use function::Function;
pub use generator::Generator;
pub use native::{NativeFunction, NativeObject};
pub use program::{Program, ProgramEmitter, Step};
pub use runtime::Runtime;
pub use value::{BoundMethod, Cell, RangeValue, Value};
