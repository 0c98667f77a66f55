//! Runtime errors.
//!
//! A raised exception inside the interpreted program is an ordinary
//! [`RuntimeError::Exception`]; frames route it through their exception
//! regions and only what escapes the outermost frame reaches the host.

use crate::exception::ExceptionObject;
use crate::value::Value;
use quill_compiler::TranslateError;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a runtime operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An exception escaped the interpreted code.
    #[error("{0}")]
    Exception(Arc<ExceptionObject>),

    /// The generator is exhausted. Carries the return value when it has just
    /// finished, and nothing when it was already exhausted.
    #[error("StopIteration")]
    StopIteration(Option<Value>),

    /// A generator was resumed while it was running.
    #[error("generator already executing")]
    AlreadyRunning,

    /// A function could not be translated.
    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// The emitted program broke an invariant of the interpreter.
    #[error("internal error in `{function}` at offset {offset}: {message}")]
    Internal {
        function: Arc<str>,
        offset: u32,
        message: String,
    },
}

impl RuntimeError {
    /// The escaped exception, if this is one.
    pub fn exception(&self) -> Option<&Arc<ExceptionObject>> {
        match self {
            RuntimeError::Exception(exc) => Some(exc),
            _ => None,
        }
    }

    /// Whether the error can be caught by interpreted code.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, RuntimeError::Translate(_) | RuntimeError::Internal { .. })
    }
}

/// Result alias for runtime operations.
pub type RunResult<T> = Result<T, RuntimeError>;
