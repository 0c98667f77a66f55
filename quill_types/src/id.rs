//! Type identifiers.
//!
//! Builtin types have fixed ids so that the translator and the reference
//! runtime can name them without a model lookup. User types are allocated
//! from [`TypeId::FIRST_USER_TYPE`] upwards in registration order.

use std::fmt;

/// Identifier of a type registered in a [`TypeModel`](crate::TypeModel).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// The universal type (top of the lattice).
    pub const OBJECT: TypeId = TypeId(0);
    pub const NONE: TypeId = TypeId(1);
    pub const INT: TypeId = TypeId(2);
    pub const BOOL: TypeId = TypeId(3);
    pub const FLOAT: TypeId = TypeId(4);
    pub const STR: TypeId = TypeId(5);
    pub const BYTES: TypeId = TypeId(6);
    pub const TUPLE: TypeId = TypeId(7);
    pub const LIST: TypeId = TypeId(8);
    pub const DICT: TypeId = TypeId(9);
    pub const SET: TypeId = TypeId(10);
    pub const SLICE: TypeId = TypeId(11);
    pub const RANGE: TypeId = TypeId(12);
    /// The metaclass: runtime type of every class object.
    pub const TYPE: TypeId = TypeId(13);
    pub const FUNCTION: TypeId = TypeId(14);
    /// Bound methods and builtin functions.
    pub const METHOD: TypeId = TypeId(15);
    pub const CODE: TypeId = TypeId(16);
    pub const CELL: TypeId = TypeId(17);
    pub const MODULE: TypeId = TypeId(18);
    pub const ITERATOR: TypeId = TypeId(19);
    pub const GENERATOR: TypeId = TypeId(20);
    pub const TRACEBACK: TypeId = TypeId(21);
    /// Pseudo type whose methods are the builtin functions (`len`, `abs`, ...).
    pub const BUILTINS: TypeId = TypeId(22);
    pub const BASE_EXCEPTION: TypeId = TypeId(23);
    pub const EXCEPTION: TypeId = TypeId(24);
    pub const STOP_ITERATION: TypeId = TypeId(25);
    pub const GENERATOR_EXIT: TypeId = TypeId(26);
    pub const ARITHMETIC_ERROR: TypeId = TypeId(27);
    pub const ZERO_DIVISION_ERROR: TypeId = TypeId(28);
    pub const LOOKUP_ERROR: TypeId = TypeId(29);
    pub const KEY_ERROR: TypeId = TypeId(30);
    pub const INDEX_ERROR: TypeId = TypeId(31);
    pub const VALUE_ERROR: TypeId = TypeId(32);
    pub const TYPE_ERROR: TypeId = TypeId(33);
    pub const RUNTIME_ERROR: TypeId = TypeId(34);
    pub const NAME_ERROR: TypeId = TypeId(35);
    pub const UNBOUND_LOCAL_ERROR: TypeId = TypeId(36);
    pub const ATTRIBUTE_ERROR: TypeId = TypeId(37);
    pub const ASSERTION_ERROR: TypeId = TypeId(38);
    pub const NOT_IMPLEMENTED_ERROR: TypeId = TypeId(39);

    /// First id handed out to types registered after the builtins.
    pub const FIRST_USER_TYPE: u32 = 40;

    /// Create a type id from its raw index.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    /// Raw index of this id.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into the model's descriptor table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this id belongs to the fixed builtin range.
    #[inline]
    pub const fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER_TYPE
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_range() {
        assert!(TypeId::OBJECT.is_builtin());
        assert!(TypeId::NOT_IMPLEMENTED_ERROR.is_builtin());
        assert!(!TypeId::from_raw(TypeId::FIRST_USER_TYPE).is_builtin());
    }

    #[test]
    fn test_raw_roundtrip_index() {
        let id = TypeId::from_raw(7);
        assert_eq!(id, TypeId::TUPLE);
        assert_eq!(id.index(), 7);
    }
}
