//! Runtime values.
//!
//! Immutable values are shared through `Arc`; mutable containers sit behind a
//! `parking_lot::Mutex` so a [`Value`] is `Send + Sync` and can cross into a
//! generator running on another thread.
//!
//! No lock is ever held while control returns to interpreted code. Readers
//! that need to call back into the runtime take a snapshot first.

use crate::exception::{ExceptionObject, TraceEntry};
use crate::function::Function;
use crate::generator::Generator;
use crate::native::NativeObject;
use parking_lot::Mutex;
use quill_bytecode::{CodeObject, Constant};
use quill_types::{TypeId, TypeModel};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

/// A closure cell: a shared, possibly empty slot.
pub type Cell = Arc<Mutex<Option<Value>>>;

/// A fresh cell holding `value`.
pub fn new_cell(value: Option<Value>) -> Cell {
    Arc::new(Mutex::new(value))
}

// =============================================================================
// Value
// =============================================================================

/// A value of the interpreted program.
#[derive(Clone)]
pub enum Value {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Value]>),
    List(Arc<Mutex<Vec<Value>>>),
    /// Insertion-ordered key/value pairs.
    Dict(Arc<Mutex<Vec<(Value, Value)>>>),
    /// Insertion-ordered distinct members.
    Set(Arc<Mutex<Vec<Value>>>),
    Slice(Arc<[Value; 3]>),
    Range(RangeValue),
    Iter(Arc<Mutex<IterState>>),
    /// A builtin class object.
    Class(TypeId),
    Exception(Arc<ExceptionObject>),
    Traceback(Arc<[TraceEntry]>),
    Function(Arc<Function>),
    Method(Arc<BoundMethod>),
    /// A builtin function, by name.
    Builtin(Arc<str>),
    Generator(Arc<Generator>),
    Cell(Cell),
    Code(Arc<CodeObject>),
    Native(Arc<dyn NativeObject>),
}

/// `range(start, stop, step)`; `step` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> i64 {
        let (lo, hi, step) = if self.step > 0 {
            (self.start, self.stop, self.step)
        } else {
            (self.stop, self.start, -self.step)
        };
        if lo >= hi { 0 } else { (hi - lo - 1) / step + 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, n: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= n && n < self.stop
        } else {
            self.stop < n && n <= self.start
        };
        in_bounds && (n - self.start) % self.step == 0
    }

    pub fn get(&self, index: i64) -> Option<i64> {
        let len = self.len();
        let index = if index < 0 { index + len } else { index };
        (0..len).contains(&index).then(|| self.start + index * self.step)
    }
}

/// A method looked up on a receiver, called with the receiver prepended.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Arc<str>,
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::Dict(Arc::new(Mutex::new(pairs)))
    }

    pub fn iter(state: IterState) -> Value {
        Value::Iter(Arc::new(Mutex::new(state)))
    }

    pub fn bound(receiver: Value, name: impl Into<Arc<str>>) -> Value {
        Value::Method(Arc::new(BoundMethod {
            receiver,
            name: name.into(),
        }))
    }

    /// Materialise a constant pool entry.
    pub fn from_constant(constant: &Constant) -> Value {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Bytes(b) => Value::Bytes(b.clone()),
            Constant::Tuple(items) => Value::Tuple(items.iter().map(Value::from_constant).collect()),
            Constant::Ellipsis => Value::Ellipsis,
            Constant::Code(code) => Value::Code(Arc::clone(code)),
        }
    }

    /// The class of the value.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::None => TypeId::NONE,
            Value::Ellipsis => TypeId::OBJECT,
            Value::Bool(_) => TypeId::BOOL,
            Value::Int(_) => TypeId::INT,
            Value::Float(_) => TypeId::FLOAT,
            Value::Str(_) => TypeId::STR,
            Value::Bytes(_) => TypeId::BYTES,
            Value::Tuple(_) => TypeId::TUPLE,
            Value::List(_) => TypeId::LIST,
            Value::Dict(_) => TypeId::DICT,
            Value::Set(_) => TypeId::SET,
            Value::Slice(_) => TypeId::SLICE,
            Value::Range(_) => TypeId::RANGE,
            Value::Iter(_) => TypeId::ITERATOR,
            Value::Class(_) => TypeId::TYPE,
            Value::Exception(e) => e.ty,
            Value::Traceback(_) => TypeId::TRACEBACK,
            Value::Function(_) | Value::Builtin(_) => TypeId::FUNCTION,
            Value::Method(_) => TypeId::METHOD,
            Value::Generator(_) => TypeId::GENERATOR,
            Value::Cell(_) => TypeId::CELL,
            Value::Code(_) => TypeId::CODE,
            Value::Native(n) => n.runtime_type(),
        }
    }

    /// Name of the value's class.
    pub fn type_name<'a>(&'a self, model: &'a TypeModel) -> &'a str {
        match self {
            Value::Native(n) => n.type_name(),
            Value::Ellipsis => "ellipsis",
            Value::Builtin(_) => "builtin_function_or_method",
            other => model.name(other.type_id()),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Truth value testing.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Dict(d) => !d.lock().is_empty(),
            Value::Set(s) => !s.lock().is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Native(n) => n.truthy(),
            _ => true,
        }
    }

    /// Numeric view of `bool`, `int` and `float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view of `bool` and `int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The `is` operator.
    ///
    /// Scalars compare by value, as if every small value were interned.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => Arc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::Slice(a), Value::Slice(b)) => Arc::ptr_eq(a, b),
            (Value::Traceback(a), Value::Traceback(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Arc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Generator(a), Value::Generator(b)) => Arc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Arc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => same_native(a, b),
            _ => false,
        }
    }

    /// Structural equality for builtin values; identity otherwise.
    pub fn py_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return match (self.as_int(), other.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            };
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (x, y) = (a.lock().clone(), b.lock().clone());
                seq_eq(&x, &y)
            }
            (Value::Set(a), Value::Set(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (x, y) = (a.lock().clone(), b.lock().clone());
                x.len() == y.len() && x.iter().all(|v| y.iter().any(|w| v.py_eq(w)))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (x, y) = (a.lock().clone(), b.lock().clone());
                x.len() == y.len()
                    && x.iter()
                        .all(|(k, v)| dict::lookup(&y, k).is_some_and(|w| v.py_eq(&w)))
            }
            (Value::Slice(a), Value::Slice(b)) => seq_eq(&a[..], &b[..]),
            (Value::Method(a), Value::Method(b)) => a.name == b.name && a.receiver.is(&b.receiver),
            _ => self.is(other),
        }
    }

    /// Whether the value can be used as a dict key or set member.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Slice(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => true,
        }
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// `repr(value)`.
    pub fn repr(&self, model: &TypeModel) -> String {
        let mut out = String::new();
        self.write_repr(model, &mut out);
        out
    }

    /// `str(value)`.
    pub fn to_str(&self, model: &TypeModel) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => match &e.args[..] {
                [] => String::new(),
                [single] => single.to_str(model),
                many => Value::Tuple(many.into()).repr(model),
            },
            other => other.repr(model),
        }
    }

    fn write_repr(&self, model: &TypeModel, out: &mut String) {
        match self {
            Value::None => out.push_str("None"),
            Value::Ellipsis => out.push_str("Ellipsis"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Float(f) => out.push_str(&float_repr(*f)),
            Value::Str(s) => out.push_str(&str_repr(s)),
            Value::Bytes(b) => {
                out.push_str("b'");
                for &byte in b.iter() {
                    match byte {
                        b'\\' => out.push_str("\\\\"),
                        b'\'' => out.push_str("\\'"),
                        b'\n' => out.push_str("\\n"),
                        0x20..=0x7e => out.push(byte as char),
                        _ => {
                            let _ = write!(out, "\\x{:02x}", byte);
                        }
                    }
                }
                out.push('\'');
            }
            Value::Tuple(items) => {
                out.push('(');
                write_items(items, model, out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::List(list) => match list.try_lock() {
                Some(items) => {
                    out.push('[');
                    write_items(&items, model, out);
                    out.push(']');
                }
                None => out.push_str("[...]"),
            },
            Value::Set(set) => match set.try_lock() {
                Some(items) if items.is_empty() => out.push_str("set()"),
                Some(items) => {
                    out.push('{');
                    write_items(&items, model, out);
                    out.push('}');
                }
                None => out.push_str("{...}"),
            },
            Value::Dict(dict) => match dict.try_lock() {
                Some(pairs) => {
                    out.push('{');
                    for (i, (k, v)) in pairs.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        k.write_repr(model, out);
                        out.push_str(": ");
                        v.write_repr(model, out);
                    }
                    out.push('}');
                }
                None => out.push_str("{...}"),
            },
            Value::Slice(parts) => {
                out.push_str("slice(");
                write_items(&parts[..], model, out);
                out.push(')');
            }
            Value::Range(r) => {
                if r.step == 1 {
                    let _ = write!(out, "range({}, {})", r.start, r.stop);
                } else {
                    let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
                }
            }
            Value::Iter(_) => out.push_str("<iterator object>"),
            Value::Class(ty) => {
                let _ = write!(out, "<class '{}'>", model.name(*ty));
            }
            Value::Exception(e) => {
                out.push_str(&e.type_name);
                out.push('(');
                write_items(&e.args, model, out);
                out.push(')');
            }
            Value::Traceback(_) => out.push_str("<traceback object>"),
            Value::Function(f) => {
                let _ = write!(out, "<function {}>", f.qualname);
            }
            Value::Method(m) => {
                let _ = write!(out, "<bound method {} of ", m.name);
                m.receiver.write_repr(model, out);
                out.push('>');
            }
            Value::Builtin(name) => {
                let _ = write!(out, "<built-in function {}>", name);
            }
            Value::Generator(g) => {
                let _ = write!(out, "<generator object {}>", g.name());
            }
            Value::Cell(_) => out.push_str("<cell>"),
            Value::Code(code) => {
                let _ = write!(out, "<code object {}>", code.name);
            }
            Value::Native(n) => out.push_str(&n.repr()),
        }
    }
}

fn same_native(a: &Arc<dyn NativeObject>, b: &Arc<dyn NativeObject>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn write_items(items: &[Value], model: &TypeModel, out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(model, out);
    }
}

/// Shortest round-tripping float text, always with a decimal point or
/// exponent.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let text = format!("{}", f);
    if text.contains(['.', 'e']) {
        text
    } else {
        format!("{}.0", text)
    }
}

/// A quoted string literal.
pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Exception(e) => write!(f, "{}", e),
            other => f.write_str(&other.repr(&DEBUG_MODEL)),
        }
    }
}

static DEBUG_MODEL: std::sync::LazyLock<TypeModel> = std::sync::LazyLock::new(TypeModel::with_builtins);

// =============================================================================
// Dict Helpers
// =============================================================================

/// Operations on insertion-ordered pairs, keyed by `py_eq`.
pub mod dict {
    use super::Value;

    pub fn position(pairs: &[(Value, Value)], key: &Value) -> Option<usize> {
        pairs.iter().position(|(k, _)| k.py_eq(key))
    }

    pub fn lookup(pairs: &[(Value, Value)], key: &Value) -> Option<Value> {
        position(pairs, key).map(|i| pairs[i].1.clone())
    }

    /// Insert or overwrite. An existing key keeps its position.
    pub fn insert(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
        match position(pairs, &key) {
            Some(i) => pairs[i].1 = value,
            None => pairs.push((key, value)),
        }
    }

    pub fn remove(pairs: &mut Vec<(Value, Value)>, key: &Value) -> Option<Value> {
        position(pairs, key).map(|i| pairs.remove(i).1)
    }
}

// =============================================================================
// Iterators
// =============================================================================

/// State of a builtin iterator.
#[derive(Debug)]
pub enum IterState {
    /// A snapshot: tuples, strings, dict views, sets.
    Items { items: Arc<[Value]>, index: usize },
    /// A live list; appends during iteration are observed.
    List { list: Arc<Mutex<Vec<Value>>>, index: usize },
    Range { next: i64, stop: i64, step: i64 },
}

impl IterState {
    pub fn items(items: impl Into<Arc<[Value]>>) -> Self {
        IterState::Items {
            items: items.into(),
            index: 0,
        }
    }

    pub fn range(r: RangeValue) -> Self {
        IterState::Range {
            next: r.start,
            stop: r.stop,
            step: r.step,
        }
    }

    /// Advance; `None` once exhausted.
    pub fn next(&mut self) -> Option<Value> {
        match self {
            IterState::Items { items, index } => {
                let item = items.get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterState::List { list, index } => {
                let item = list.lock().get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterState::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let item = *next;
                *next = next.saturating_add(*step);
                Some(Value::Int(item))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::str("1")));
        assert!(Value::tuple([Value::Int(1), Value::str("a")]).py_eq(&Value::tuple([Value::Float(1.0), Value::str("a")])));
    }

    #[test]
    fn test_identity_of_containers() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = Value::list(vec![Value::Int(1)]);
        assert!(a.py_eq(&b));
        assert!(!a.is(&b));
        assert!(a.is(&a.clone()));
    }

    #[test]
    fn test_repr() {
        let model = TypeModel::with_builtins();
        assert_eq!(Value::Float(1.0).repr(&model), "1.0");
        assert_eq!(Value::Float(0.5).repr(&model), "0.5");
        assert_eq!(Value::str("it's").repr(&model), "\"it's\"");
        assert_eq!(Value::tuple([Value::Int(1)]).repr(&model), "(1,)");
        assert_eq!(Value::Class(TypeId::KEY_ERROR).repr(&model), "<class 'KeyError'>");
        let d = Value::dict(vec![(Value::str("k"), Value::None)]);
        assert_eq!(d.repr(&model), "{'k': None}");
    }

    #[test]
    fn test_self_referential_list_repr_terminates() {
        let model = TypeModel::with_builtins();
        let list = Value::list(Vec::new());
        if let Value::List(inner) = &list {
            inner.lock().push(list.clone());
        }
        assert_eq!(list.repr(&model), "[[...]]");
    }

    #[test]
    fn test_range_arithmetic() {
        let r = RangeValue { start: 10, stop: 0, step: -3 };
        assert_eq!(r.len(), 4);
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert_eq!(r.get(-1), Some(1));
        let mut it = IterState::range(r);
        let items: Vec<i64> = std::iter::from_fn(|| it.next()).filter_map(|v| v.as_int()).collect();
        assert_eq!(items, vec![10, 7, 4, 1]);
    }

    #[test]
    fn test_dict_helpers_keep_order() {
        let mut pairs = Vec::new();
        dict::insert(&mut pairs, Value::str("b"), Value::Int(1));
        dict::insert(&mut pairs, Value::str("a"), Value::Int(2));
        dict::insert(&mut pairs, Value::str("b"), Value::Int(3));
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].1.py_eq(&Value::Int(3)));
        assert!(dict::lookup(&pairs, &Value::Float(1.5)).is_none());
        assert!(dict::remove(&mut pairs, &Value::str("a")).is_some());
        assert_eq!(pairs.len(), 1);
    }
}
