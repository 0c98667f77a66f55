//! Method signatures used for overload resolution.

use crate::TypeId;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// One overload of a method.
///
/// `params` excludes the receiver. When `param_names` is present, arguments
/// may also be supplied by keyword.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Type whose method table declares this overload.
    pub owner: TypeId,
    /// Ordered parameter types.
    pub params: SmallVec<[TypeId; 4]>,
    /// Parameter names, parallel to `params`.
    pub param_names: Option<Box<[Arc<str>]>>,
    /// Declared return type.
    pub return_type: TypeId,
}

impl Signature {
    /// Create a positional-only signature. The owner is filled in when the
    /// signature is attached to a type.
    pub fn new(params: &[TypeId], return_type: TypeId) -> Self {
        Self {
            owner: TypeId::OBJECT,
            params: params.iter().copied().collect(),
            param_names: None,
            return_type,
        }
    }

    /// Attach parameter names so the overload accepts keyword arguments.
    pub fn with_names(mut self, names: &[&str]) -> Self {
        debug_assert_eq!(names.len(), self.params.len());
        self.param_names = Some(names.iter().map(|n| Arc::from(*n)).collect());
        self
    }

    /// Number of parameters.
    #[inline]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Index of the parameter named `name`.
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names
            .as_ref()
            .and_then(|names| names.iter().position(|n| &**n == name))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let Some(name) = self.param_names.as_ref().and_then(|n| n.get(i)) {
                write!(f, "{}: ", name)?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {} [{}]", self.return_type, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_index() {
        let sig = Signature::new(&[TypeId::STR, TypeId::INT], TypeId::STR).with_names(&["sep", "n"]);
        assert_eq!(sig.param_index("n"), Some(1));
        assert_eq!(sig.param_index("missing"), None);
        assert_eq!(sig.arity(), 2);
    }

    #[test]
    fn test_positional_signature_has_no_names() {
        let sig = Signature::new(&[TypeId::INT], TypeId::INT);
        assert_eq!(sig.param_index("x"), None);
    }
}
