//! Bytecode decoding errors.

use thiserror::Error;

use crate::{Opcode, PythonVersion};

/// Failure to decode or assemble an instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("code object has no instructions")]
    Empty,

    #[error("instruction stream has odd length {0} (truncated code unit)")]
    Truncated(usize),

    #[error("unknown opcode {byte} at offset {offset} for python {version}")]
    UnknownOpcode {
        byte: u8,
        offset: u32,
        version: PythonVersion,
    },

    #[error("unsupported opcode {opcode} at offset {offset}")]
    UnsupportedOpcode { opcode: Opcode, offset: u32 },

    #[error("EXTENDED_ARG at offset {0} is not followed by an instruction")]
    DanglingExtendedArg(u32),

    #[error("jump at offset {offset} targets {target}, which is not an instruction")]
    InvalidJumpTarget { offset: u32, target: u32 },

    #[error("label {0} was never bound")]
    UnboundLabel(u32),
}
