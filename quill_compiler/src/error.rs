//! Translation errors.
//!
//! A [`DecodeError`] aborts translation of one function; an
//! [`EmissionFailure`] aborts one compilation unit. Specialization misses are
//! not errors at all and never surface here.

use quill_bytecode::BytecodeError;
use std::sync::Arc;
use thiserror::Error;

/// The function cannot be analysed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    #[error("{opcode} at offset {offset}: index {index} is out of range of {table}")]
    OperandOutOfRange {
        offset: u32,
        opcode: &'static str,
        index: u32,
        table: &'static str,
    },

    #[error("{opcode} at offset {offset}: invalid argument {arg}")]
    InvalidOperand {
        offset: u32,
        opcode: &'static str,
        arg: u32,
    },

    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: u32 },

    #[error("stack depth mismatch at offset {offset}: {expected} vs {found}")]
    DepthMismatch {
        offset: u32,
        expected: usize,
        found: usize,
    },

    #[error("local variable count mismatch at offset {offset}")]
    LocalsMismatch { offset: u32 },

    #[error("handler block stacks disagree at offset {offset}")]
    BlockMismatch { offset: u32 },

    #[error("POP_BLOCK at offset {offset} has no block to pop")]
    NoBlockToPop { offset: u32 },

    #[error("POP_EXCEPT at offset {offset} is not inside an exception handler")]
    NotInExceptHandler { offset: u32 },

    #[error("jump at offset {offset} targets {target}, which is not an instruction")]
    InvalidJumpTarget { offset: u32, target: u32 },

    #[error("execution falls off the end of the code after offset {offset}")]
    FallsOffEnd { offset: u32 },

    #[error("dataflow did not reach a fixed point within {steps} steps")]
    NoFixedPoint { steps: u64 },

    #[error("{0} code objects are not supported")]
    UnsupportedCode(&'static str),
}

/// The emitter rejected the produced artifact.
///
/// Carries the function identity and its instruction dump so the failure can
/// be reported without the code object at hand.
#[derive(Debug, Clone, Error)]
#[error("emission failed for `{function}`: {message}")]
pub struct EmissionFailure {
    /// Qualified name of the function being emitted.
    pub function: Arc<str>,
    /// What the emitter reported.
    pub message: String,
    /// Disassembly of the function.
    pub listing: String,
}

/// An error returned by an [`Emitter`](crate::Emitter) callback.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("{0}")]
    Rejected(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmitError {
    /// Reject the artifact with a message.
    pub fn rejected(message: impl Into<String>) -> Self {
        EmitError::Rejected(message.into())
    }
}

/// Failure to translate one function.
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("cannot translate `{function}`: {source}")]
    Decode {
        function: Arc<str>,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Emission(#[from] EmissionFailure),
}

impl TranslateError {
    /// The decode error, if translation failed during analysis.
    pub fn as_decode(&self) -> Option<&DecodeError> {
        match self {
            TranslateError::Decode { source, .. } => Some(source),
            TranslateError::Emission(_) => None,
        }
    }
}

/// Result alias for analysis passes.
pub type DecodeResult<T> = Result<T, DecodeError>;
