//! The builtin type hierarchy.
//!
//! Types are registered in [`TypeId`] constant order so the fixed ids line up
//! with the descriptor table.

use crate::{Signature, TypeId, TypeModel};

/// Small helper so the tables below read as declarations.
struct Builtins {
    model: TypeModel,
}

impl Builtins {
    fn class(&mut self, expected: TypeId, name: &str, bases: &[TypeId]) {
        match self.model.register(name, bases) {
            Ok(id) => debug_assert_eq!(id, expected, "builtin `{}` registered out of order", name),
            Err(err) => unreachable!("builtin table is inconsistent: {}", err),
        }
    }

    fn global(&mut self, name: &str, ty: TypeId) {
        let registered = self.model.add_global_class(name, ty);
        debug_assert!(registered.is_ok());
    }

    fn method(&mut self, owner: TypeId, name: &str, params: &[TypeId], ret: TypeId) {
        let added = self.model.add_method(owner, name, Signature::new(params, ret));
        debug_assert!(added.is_ok());
    }

    fn named(&mut self, owner: TypeId, name: &str, params: &[TypeId], names: &[&str], ret: TypeId) {
        let sig = Signature::new(params, ret).with_names(names);
        let added = self.model.add_method(owner, name, sig);
        debug_assert!(added.is_ok());
    }

    fn attribute(&mut self, owner: TypeId, name: &str, ty: TypeId) {
        let added = self.model.add_attribute(owner, name, ty);
        debug_assert!(added.is_ok());
    }

    fn binary(&mut self, owner: TypeId, names: &[&str], rhs: TypeId, ret: TypeId) {
        for name in names {
            self.method(owner, name, &[rhs], ret);
        }
    }
}

const ARITH: &[&str] = &["__add__", "__sub__", "__mul__", "__floordiv__", "__mod__", "__pow__"];
const REFLECTED: &[&str] = &["__radd__", "__rsub__", "__rmul__", "__rfloordiv__", "__rmod__", "__rpow__"];
const BITWISE: &[&str] = &["__and__", "__or__", "__xor__", "__lshift__", "__rshift__"];
const ORDERING: &[&str] = &["__lt__", "__le__", "__gt__", "__ge__"];

impl TypeModel {
    /// A model populated with the builtin types, their common methods and the
    /// builtin functions.
    pub fn with_builtins() -> Self {
        let mut b = Builtins {
            model: TypeModel::new(),
        };
        register_classes(&mut b);
        register_object(&mut b);
        register_numbers(&mut b);
        register_sequences(&mut b);
        register_iteration(&mut b);
        register_exceptions(&mut b);
        register_functions(&mut b);
        b.model
    }
}

fn register_classes(b: &mut Builtins) {
    use TypeId as T;
    b.class(T::NONE, "NoneType", &[]);
    b.class(T::INT, "int", &[]);
    b.class(T::BOOL, "bool", &[T::INT]);
    b.class(T::FLOAT, "float", &[]);
    b.class(T::STR, "str", &[]);
    b.class(T::BYTES, "bytes", &[]);
    b.class(T::TUPLE, "tuple", &[]);
    b.class(T::LIST, "list", &[]);
    b.class(T::DICT, "dict", &[]);
    b.class(T::SET, "set", &[]);
    b.class(T::SLICE, "slice", &[]);
    b.class(T::RANGE, "range", &[]);
    b.class(T::TYPE, "type", &[]);
    b.class(T::FUNCTION, "function", &[]);
    b.class(T::METHOD, "method", &[]);
    b.class(T::CODE, "code", &[]);
    b.class(T::CELL, "cell", &[]);
    b.class(T::MODULE, "module", &[]);
    b.class(T::ITERATOR, "iterator", &[]);
    b.class(T::GENERATOR, "generator", &[T::ITERATOR]);
    b.class(T::TRACEBACK, "traceback", &[]);
    b.class(T::BUILTINS, "builtins", &[]);
    b.class(T::BASE_EXCEPTION, "BaseException", &[]);
    b.class(T::EXCEPTION, "Exception", &[T::BASE_EXCEPTION]);
    b.class(T::STOP_ITERATION, "StopIteration", &[T::EXCEPTION]);
    b.class(T::GENERATOR_EXIT, "GeneratorExit", &[T::BASE_EXCEPTION]);
    b.class(T::ARITHMETIC_ERROR, "ArithmeticError", &[T::EXCEPTION]);
    b.class(T::ZERO_DIVISION_ERROR, "ZeroDivisionError", &[T::ARITHMETIC_ERROR]);
    b.class(T::LOOKUP_ERROR, "LookupError", &[T::EXCEPTION]);
    b.class(T::KEY_ERROR, "KeyError", &[T::LOOKUP_ERROR]);
    b.class(T::INDEX_ERROR, "IndexError", &[T::LOOKUP_ERROR]);
    b.class(T::VALUE_ERROR, "ValueError", &[T::EXCEPTION]);
    b.class(T::TYPE_ERROR, "TypeError", &[T::EXCEPTION]);
    b.class(T::RUNTIME_ERROR, "RuntimeError", &[T::EXCEPTION]);
    b.class(T::NAME_ERROR, "NameError", &[T::EXCEPTION]);
    b.class(T::UNBOUND_LOCAL_ERROR, "UnboundLocalError", &[T::NAME_ERROR]);
    b.class(T::ATTRIBUTE_ERROR, "AttributeError", &[T::EXCEPTION]);
    b.class(T::ASSERTION_ERROR, "AssertionError", &[T::EXCEPTION]);
    b.class(T::NOT_IMPLEMENTED_ERROR, "NotImplementedError", &[T::RUNTIME_ERROR]);

    for ty in [
        T::OBJECT,
        T::INT,
        T::BOOL,
        T::FLOAT,
        T::STR,
        T::BYTES,
        T::TUPLE,
        T::LIST,
        T::DICT,
        T::SET,
        T::SLICE,
        T::RANGE,
        T::TYPE,
    ] {
        let name = b.model.name(ty).to_string();
        b.global(&name, ty);
    }
}

fn register_object(b: &mut Builtins) {
    use TypeId as T;
    b.method(T::OBJECT, "__eq__", &[T::OBJECT], T::BOOL);
    b.method(T::OBJECT, "__ne__", &[T::OBJECT], T::BOOL);
    b.method(T::OBJECT, "__repr__", &[], T::STR);
    b.method(T::OBJECT, "__str__", &[], T::STR);
    b.method(T::OBJECT, "__hash__", &[], T::INT);
    b.attribute(T::OBJECT, "__class__", T::TYPE);
    b.attribute(T::TYPE, "__name__", T::STR);
    b.attribute(T::SLICE, "start", T::OBJECT);
    b.attribute(T::SLICE, "stop", T::OBJECT);
    b.attribute(T::SLICE, "step", T::OBJECT);
}

fn register_numbers(b: &mut Builtins) {
    use TypeId as T;

    // int
    b.binary(T::INT, ARITH, T::INT, T::INT);
    b.binary(T::INT, BITWISE, T::INT, T::INT);
    b.binary(T::INT, ORDERING, T::INT, T::BOOL);
    b.method(T::INT, "__truediv__", &[T::INT], T::FLOAT);
    for name in ["__neg__", "__pos__", "__invert__", "__abs__"] {
        b.method(T::INT, name, &[], T::INT);
    }
    b.method(T::INT, "__bool__", &[], T::BOOL);
    b.method(T::INT, "__float__", &[], T::FLOAT);
    b.method(T::INT, "bit_length", &[], T::INT);

    // bool keeps int arithmetic but narrows the bitwise operators
    for name in ["__and__", "__or__", "__xor__"] {
        b.method(T::BOOL, name, &[T::BOOL], T::BOOL);
    }

    // float
    b.binary(T::FLOAT, ARITH, T::FLOAT, T::FLOAT);
    b.binary(T::FLOAT, ARITH, T::INT, T::FLOAT);
    b.binary(T::FLOAT, REFLECTED, T::INT, T::FLOAT);
    b.binary(T::FLOAT, ORDERING, T::FLOAT, T::BOOL);
    b.binary(T::FLOAT, ORDERING, T::INT, T::BOOL);
    b.method(T::FLOAT, "__truediv__", &[T::FLOAT], T::FLOAT);
    b.method(T::FLOAT, "__truediv__", &[T::INT], T::FLOAT);
    b.method(T::FLOAT, "__rtruediv__", &[T::INT], T::FLOAT);
    for name in ["__neg__", "__pos__", "__abs__"] {
        b.method(T::FLOAT, name, &[], T::FLOAT);
    }
    b.method(T::FLOAT, "__bool__", &[], T::BOOL);
    b.method(T::FLOAT, "is_integer", &[], T::BOOL);
}

fn register_sequences(b: &mut Builtins) {
    use TypeId as T;

    // str
    b.method(T::STR, "__add__", &[T::STR], T::STR);
    b.method(T::STR, "__mul__", &[T::INT], T::STR);
    b.method(T::STR, "__mod__", &[T::OBJECT], T::STR);
    b.method(T::STR, "__getitem__", &[T::INT], T::STR);
    b.method(T::STR, "__getitem__", &[T::SLICE], T::STR);
    b.method(T::STR, "__contains__", &[T::STR], T::BOOL);
    b.binary(T::STR, ORDERING, T::STR, T::BOOL);
    b.method(T::STR, "__len__", &[], T::INT);
    b.method(T::STR, "__iter__", &[], T::ITERATOR);
    for name in ["upper", "lower", "strip", "title"] {
        b.method(T::STR, name, &[], T::STR);
    }
    b.method(T::STR, "join", &[T::OBJECT], T::STR);
    b.method(T::STR, "split", &[], T::LIST);
    b.named(T::STR, "split", &[T::STR], &["sep"], T::LIST);
    b.method(T::STR, "startswith", &[T::STR], T::BOOL);
    b.method(T::STR, "endswith", &[T::STR], T::BOOL);
    b.named(T::STR, "replace", &[T::STR, T::STR], &["old", "new"], T::STR);
    b.method(T::STR, "find", &[T::STR], T::INT);

    // bytes
    b.method(T::BYTES, "__len__", &[], T::INT);
    b.method(T::BYTES, "__getitem__", &[T::INT], T::INT);
    b.method(T::BYTES, "decode", &[], T::STR);

    // tuple
    b.method(T::TUPLE, "__getitem__", &[T::INT], T::OBJECT);
    b.method(T::TUPLE, "__getitem__", &[T::SLICE], T::TUPLE);
    b.method(T::TUPLE, "__add__", &[T::TUPLE], T::TUPLE);
    b.method(T::TUPLE, "__mul__", &[T::INT], T::TUPLE);
    b.method(T::TUPLE, "__contains__", &[T::OBJECT], T::BOOL);
    b.method(T::TUPLE, "__len__", &[], T::INT);
    b.method(T::TUPLE, "__iter__", &[], T::ITERATOR);
    b.method(T::TUPLE, "count", &[T::OBJECT], T::INT);
    b.method(T::TUPLE, "index", &[T::OBJECT], T::INT);

    // list
    b.method(T::LIST, "__getitem__", &[T::INT], T::OBJECT);
    b.method(T::LIST, "__getitem__", &[T::SLICE], T::LIST);
    b.method(T::LIST, "__setitem__", &[T::INT, T::OBJECT], T::NONE);
    b.method(T::LIST, "__delitem__", &[T::INT], T::NONE);
    b.method(T::LIST, "__add__", &[T::LIST], T::LIST);
    b.method(T::LIST, "__iadd__", &[T::OBJECT], T::LIST);
    b.method(T::LIST, "__mul__", &[T::INT], T::LIST);
    b.method(T::LIST, "__contains__", &[T::OBJECT], T::BOOL);
    b.method(T::LIST, "__len__", &[], T::INT);
    b.method(T::LIST, "__iter__", &[], T::ITERATOR);
    b.method(T::LIST, "append", &[T::OBJECT], T::NONE);
    b.method(T::LIST, "extend", &[T::OBJECT], T::NONE);
    b.method(T::LIST, "insert", &[T::INT, T::OBJECT], T::NONE);
    b.method(T::LIST, "pop", &[], T::OBJECT);
    b.method(T::LIST, "pop", &[T::INT], T::OBJECT);
    b.method(T::LIST, "index", &[T::OBJECT], T::INT);
    b.method(T::LIST, "copy", &[], T::LIST);
    b.method(T::LIST, "reverse", &[], T::NONE);
    b.method(T::LIST, "sort", &[], T::NONE);

    // dict
    b.method(T::DICT, "__getitem__", &[T::OBJECT], T::OBJECT);
    b.method(T::DICT, "__setitem__", &[T::OBJECT, T::OBJECT], T::NONE);
    b.method(T::DICT, "__delitem__", &[T::OBJECT], T::NONE);
    b.method(T::DICT, "__contains__", &[T::OBJECT], T::BOOL);
    b.method(T::DICT, "__len__", &[], T::INT);
    b.method(T::DICT, "__iter__", &[], T::ITERATOR);
    b.method(T::DICT, "get", &[T::OBJECT], T::OBJECT);
    b.named(T::DICT, "get", &[T::OBJECT, T::OBJECT], &["key", "default"], T::OBJECT);
    for name in ["keys", "values", "items"] {
        b.method(T::DICT, name, &[], T::ITERATOR);
    }
    b.method(T::DICT, "pop", &[T::OBJECT], T::OBJECT);
    b.method(T::DICT, "copy", &[], T::DICT);

    // set
    b.method(T::SET, "__contains__", &[T::OBJECT], T::BOOL);
    b.method(T::SET, "__len__", &[], T::INT);
    b.method(T::SET, "__iter__", &[], T::ITERATOR);
    for name in ["__or__", "__and__", "__sub__", "__xor__"] {
        b.method(T::SET, name, &[T::SET], T::SET);
    }
    b.method(T::SET, "add", &[T::OBJECT], T::NONE);
    b.method(T::SET, "discard", &[T::OBJECT], T::NONE);

    // range
    b.method(T::RANGE, "__iter__", &[], T::ITERATOR);
    b.method(T::RANGE, "__len__", &[], T::INT);
    b.method(T::RANGE, "__contains__", &[T::OBJECT], T::BOOL);
    b.method(T::RANGE, "__getitem__", &[T::INT], T::INT);
}

fn register_iteration(b: &mut Builtins) {
    use TypeId as T;
    b.method(T::ITERATOR, "__iter__", &[], T::ITERATOR);
    b.method(T::ITERATOR, "__next__", &[], T::OBJECT);
    b.method(T::GENERATOR, "__iter__", &[], T::GENERATOR);
    b.method(T::GENERATOR, "send", &[T::OBJECT], T::OBJECT);
    b.method(T::GENERATOR, "throw", &[T::OBJECT], T::OBJECT);
    b.method(T::GENERATOR, "close", &[], T::NONE);
}

fn register_exceptions(b: &mut Builtins) {
    use TypeId as T;
    b.attribute(T::BASE_EXCEPTION, "args", T::TUPLE);
    b.attribute(T::BASE_EXCEPTION, "__traceback__", T::TRACEBACK);
    b.method(T::BASE_EXCEPTION, "with_traceback", &[T::TRACEBACK], T::BASE_EXCEPTION);
    b.attribute(T::STOP_ITERATION, "value", T::OBJECT);

    for raw in T::BASE_EXCEPTION.raw()..T::FIRST_USER_TYPE {
        let ty = T::from_raw(raw);
        let name = b.model.name(ty).to_string();
        b.global(&name, ty);
    }
}

fn register_functions(b: &mut Builtins) {
    use TypeId as T;
    let f = T::BUILTINS;
    b.method(f, "len", &[T::OBJECT], T::INT);
    b.method(f, "abs", &[T::INT], T::INT);
    b.method(f, "abs", &[T::FLOAT], T::FLOAT);
    b.method(f, "iter", &[T::OBJECT], T::ITERATOR);
    b.method(f, "next", &[T::OBJECT], T::OBJECT);
    b.method(f, "next", &[T::OBJECT, T::OBJECT], T::OBJECT);
    b.method(f, "repr", &[T::OBJECT], T::STR);
    b.method(f, "hash", &[T::OBJECT], T::INT);
    b.method(f, "id", &[T::OBJECT], T::INT);
    b.method(f, "print", &[T::OBJECT], T::NONE);
    b.method(f, "isinstance", &[T::OBJECT, T::OBJECT], T::BOOL);
    b.method(f, "callable", &[T::OBJECT], T::BOOL);
    b.method(f, "hasattr", &[T::OBJECT, T::STR], T::BOOL);
    b.method(f, "getattr", &[T::OBJECT, T::STR], T::OBJECT);
    b.method(f, "min", &[T::OBJECT, T::OBJECT], T::OBJECT);
    b.method(f, "max", &[T::OBJECT, T::OBJECT], T::OBJECT);
    b.method(f, "sum", &[T::OBJECT], T::OBJECT);
    b.method(f, "sorted", &[T::OBJECT], T::LIST);
    b.method(f, "ord", &[T::STR], T::INT);
    b.method(f, "chr", &[T::INT], T::STR);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GlobalBinding;

    #[test]
    fn test_builtin_ids_line_up() {
        let model = TypeModel::with_builtins();
        assert_eq!(model.len(), TypeId::FIRST_USER_TYPE as usize);
        assert_eq!(model.type_by_name("int"), Some(TypeId::INT));
        assert_eq!(model.type_by_name("ValueError"), Some(TypeId::VALUE_ERROR));
        assert_eq!(model.type_by_name("NotImplementedError"), Some(TypeId::NOT_IMPLEMENTED_ERROR));
    }

    #[test]
    fn test_bool_inherits_int_arithmetic() {
        let model = TypeModel::with_builtins();
        assert!(model.is_subtype(TypeId::BOOL, TypeId::INT));
        let sigs = model.lookup_method(TypeId::BOOL, "__add__");
        let hit = model.resolve_overload(&sigs, &[TypeId::BOOL], &[]).unwrap();
        assert_eq!(hit.owner, TypeId::INT);
        assert_eq!(hit.return_type, TypeId::INT);
    }

    #[test]
    fn test_exception_hierarchy() {
        let model = TypeModel::with_builtins();
        assert!(model.is_exception(TypeId::KEY_ERROR));
        assert!(!model.is_exception(TypeId::INT));
        assert_eq!(
            model.common_supertype(TypeId::KEY_ERROR, TypeId::INDEX_ERROR),
            TypeId::LOOKUP_ERROR
        );
        assert_eq!(
            model.common_supertype(TypeId::VALUE_ERROR, TypeId::GENERATOR_EXIT),
            TypeId::BASE_EXCEPTION
        );
    }

    #[test]
    fn test_globals() {
        let model = TypeModel::with_builtins();
        assert_eq!(model.lookup_global("list"), Some(GlobalBinding::Class(TypeId::LIST)));
        assert_eq!(
            model.lookup_global("KeyError"),
            Some(GlobalBinding::Class(TypeId::KEY_ERROR))
        );
        assert_eq!(model.lookup_global("len"), Some(GlobalBinding::Function));
        assert_eq!(model.lookup_global("frobnicate"), None);
    }

    #[test]
    fn test_float_int_mixed_resolution() {
        let model = TypeModel::with_builtins();
        let sigs = model.lookup_method(TypeId::FLOAT, "__radd__");
        let hit = model.resolve_overload(&sigs, &[TypeId::INT], &[]).unwrap();
        assert_eq!(hit.return_type, TypeId::FLOAT);
        // int + float has no int-side overload
        let sigs = model.lookup_method(TypeId::INT, "__add__");
        assert!(model.resolve_overload(&sigs, &[TypeId::FLOAT], &[]).is_none());
    }

    #[test]
    fn test_max_depth() {
        let model = TypeModel::with_builtins();
        // object <- BaseException <- Exception <- ArithmeticError <- ZeroDivisionError
        assert_eq!(model.max_depth(), 4);
    }
}
