//! Constant pool entries.

use crate::CodeObject;
use std::fmt;
use std::sync::Arc;

/// A value in a code object's constant pool.
#[derive(Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Constant]>),
    Ellipsis,
    /// A nested function body (consumed by `MAKE_FUNCTION`).
    Code(Arc<CodeObject>),
}

impl Constant {
    /// Build a string constant.
    pub fn str(s: &str) -> Self {
        Constant::Str(Arc::from(s))
    }

    /// Build a tuple constant.
    pub fn tuple(items: impl IntoIterator<Item = Constant>) -> Self {
        Constant::Tuple(items.into_iter().collect())
    }

    /// The string, if this is a string constant.
    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The code object, if this is a nested function body.
    pub fn as_code(&self) -> Option<&Arc<CodeObject>> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Keyword names of a `CALL_FUNCTION_KW` names tuple.
    ///
    /// Returns `None` unless every element is a string.
    pub fn as_str_tuple(&self) -> Option<Arc<[Arc<str>]>> {
        match self {
            Constant::Tuple(items) => items.iter().map(|c| c.as_str().cloned()).collect(),
            _ => None,
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Bool(true) => f.write_str("True"),
            Constant::Bool(false) => f.write_str("False"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Constant::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}", item)?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Constant::Ellipsis => f.write_str("Ellipsis"),
            Constant::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_tuple() {
        let names = Constant::tuple([Constant::str("a"), Constant::str("b")]);
        let names = names.as_str_tuple().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(&*names[1], "b");

        let mixed = Constant::tuple([Constant::str("a"), Constant::Int(1)]);
        assert!(mixed.as_str_tuple().is_none());
        assert!(Constant::Int(1).as_str_tuple().is_none());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", Constant::tuple([Constant::Int(1)])), "(1,)");
        assert_eq!(format!("{:?}", Constant::str("x")), "\"x\"");
        assert_eq!(format!("{:?}", Constant::Bool(true)), "True");
    }
}
