//! CPython bytecode for the quill translator.
//!
//! This crate owns everything about the input format and nothing about its
//! meaning:
//!
//! - [`Opcode`] tables for the 3.9 and 3.10 dialects
//! - [`CodeObject`], the compiled-function descriptor, and its [`Constant`] pool
//! - [`InstructionStream`], the decoded instruction list with jumps resolved
//! - [`OffsetMap`] for rewrite passes that insert or remove instructions
//! - [`CodeBuilder`], an assembler with symbolic labels
//!
//! Typing, control flow and lowering live in `quill_compiler`.

mod builder;
mod code;
mod constant;
mod error;
mod opcode;
mod relabel;
mod stream;
mod version;

pub use builder::{CodeBuilder, Label};
pub use code::{CodeFlags, CodeObject, LineTableEntry, disassemble};
pub use constant::Constant;
pub use error::BytecodeError;
pub use opcode::{CompareOp, HAVE_ARGUMENT, JumpKind, Opcode, format_value, make_function};
pub use relabel::OffsetMap;
pub use stream::{Instruction, InstructionDisplay, InstructionStream};
pub use version::PythonVersion;
