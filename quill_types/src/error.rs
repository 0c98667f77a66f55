//! Errors raised while building a type model.

use thiserror::Error;

use crate::TypeId;

/// Failure to register a type or signature.
///
/// These only occur while a model is being assembled; queries on a finished
/// model never fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeModelError {
    #[error("type `{0}` is already registered")]
    DuplicateType(String),

    #[error("unknown base type {0}")]
    UnknownType(TypeId),

    #[error("cannot create a consistent method resolution order for `{0}`")]
    InconsistentMro(String),
}
