//! Operator semantics for builtin values.
//!
//! Integers are 64-bit; a result that does not fit raises `ArithmeticError`
//! instead of promoting. Division and modulo floor toward negative infinity.
//! Host objects take part through their special methods.

use crate::error::RunResult;
use crate::runtime::Runtime;
use crate::value::{IterState, RangeValue, Value, dict};
use quill_bytecode::CompareOp;
use quill_compiler::{BinaryOp, UnaryOp};
use quill_types::TypeId;
use std::cmp::Ordering;
use std::sync::Arc;

// =============================================================================
// Arithmetic
// =============================================================================

pub fn unary(rt: &Runtime, op: UnaryOp, v: &Value) -> RunResult<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!rt.truthy(v)?));
    }
    match (op, v) {
        (UnaryOp::Positive, Value::Bool(b)) => Ok(Value::Int(*b as i64)),
        (UnaryOp::Positive, Value::Int(_) | Value::Float(_)) => Ok(v.clone()),
        (UnaryOp::Negative, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Negative, Value::Int(_) | Value::Bool(_)) => {
            let i = v.as_int().unwrap_or_default();
            i.checked_neg().map(Value::Int).ok_or_else(|| overflow(rt))
        }
        (UnaryOp::Invert, Value::Int(_) | Value::Bool(_)) => Ok(Value::Int(!v.as_int().unwrap_or_default())),
        (_, Value::Native(n)) => match op.dunder() {
            Some(name) if n.has_method(name) => n.call_method(rt, name, &[]),
            _ => Err(bad_unary(rt, op, v)),
        },
        _ => Err(bad_unary(rt, op, v)),
    }
}

fn bad_unary(rt: &Runtime, op: UnaryOp, v: &Value) -> crate::error::RuntimeError {
    let symbol = match op {
        UnaryOp::Positive => "+",
        UnaryOp::Negative => "-",
        UnaryOp::Not => "not",
        UnaryOp::Invert => "~",
    };
    rt.type_error(format!("bad operand type for unary {}: '{}'", symbol, v.type_name(rt.model())))
}

fn overflow(rt: &Runtime) -> crate::error::RuntimeError {
    rt.error(TypeId::ARITHMETIC_ERROR, "integer overflow")
}

/// `l <op> r`, or `l <op>= r` when `inplace`.
pub fn binary(rt: &Runtime, op: BinaryOp, l: &Value, r: &Value, inplace: bool) -> RunResult<Value> {
    if let Some(v) = numeric(rt, op, l, r)? {
        return Ok(v);
    }
    if let Some(v) = sequence(rt, op, l, r, inplace)? {
        return Ok(v);
    }
    if let Value::Native(n) = l {
        let name = if inplace && n.has_method(op.inplace()) {
            op.inplace()
        } else {
            op.dunder()
        };
        if n.has_method(name) {
            return n.call_method(rt, name, std::slice::from_ref(r));
        }
    }
    if let Value::Native(n) = r {
        if n.has_method(op.reflected()) {
            return n.call_method(rt, op.reflected(), std::slice::from_ref(l));
        }
    }
    Err(rt.type_error(format!(
        "unsupported operand type(s) for {}{}: '{}' and '{}'",
        op.symbol(),
        if inplace { "=" } else { "" },
        l.type_name(rt.model()),
        r.type_name(rt.model())
    )))
}

fn numeric(rt: &Runtime, op: BinaryOp, l: &Value, r: &Value) -> RunResult<Option<Value>> {
    if let (Value::Bool(a), Value::Bool(b)) = (l, r) {
        match op {
            BinaryOp::And => return Ok(Some(Value::Bool(a & b))),
            BinaryOp::Or => return Ok(Some(Value::Bool(a | b))),
            BinaryOp::Xor => return Ok(Some(Value::Bool(a ^ b))),
            _ => {}
        }
    }
    if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
        return int_binary(rt, op, a, b).map(Some);
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => float_binary(rt, op, a, b),
        _ => Ok(None),
    }
}

fn int_binary(rt: &Runtime, op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
    let zero = || rt.error(TypeId::ZERO_DIVISION_ERROR, "integer division or modulo by zero");
    let int = |v: Option<i64>| v.map(Value::Int).ok_or_else(|| overflow(rt));
    match op {
        BinaryOp::Add => int(a.checked_add(b)),
        BinaryOp::Subtract => int(a.checked_sub(b)),
        BinaryOp::Multiply => int(a.checked_mul(b)),
        BinaryOp::FloorDivide => {
            if b == 0 {
                return Err(zero());
            }
            int(floor_div(a, b))
        }
        BinaryOp::Modulo => {
            if b == 0 {
                return Err(zero());
            }
            int(floor_mod(a, b))
        }
        BinaryOp::TrueDivide => {
            if b == 0 {
                return Err(rt.error(TypeId::ZERO_DIVISION_ERROR, "division by zero"));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinaryOp::Power => {
            if b < 0 {
                if a == 0 {
                    return Err(rt.error(
                        TypeId::ZERO_DIVISION_ERROR,
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            int(u32::try_from(b).ok().and_then(|e| a.checked_pow(e)))
        }
        BinaryOp::Lshift | BinaryOp::Rshift if b < 0 => Err(rt.error(TypeId::VALUE_ERROR, "negative shift count")),
        BinaryOp::Lshift => {
            if a == 0 {
                return Ok(Value::Int(0));
            }
            let shifted = (b < 64).then(|| a << b).filter(|s| s >> b == a);
            int(shifted)
        }
        BinaryOp::Rshift => Ok(Value::Int(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })),
        BinaryOp::And => Ok(Value::Int(a & b)),
        BinaryOp::Or => Ok(Value::Int(a | b)),
        BinaryOp::Xor => Ok(Value::Int(a ^ b)),
        BinaryOp::MatrixMultiply => Err(rt.type_error("unsupported operand type(s) for @: 'int' and 'int'")),
    }
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) { Some(q - 1) } else { Some(q) }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) { Some(r + b) } else { Some(r) }
}

fn float_binary(rt: &Runtime, op: BinaryOp, a: f64, b: f64) -> RunResult<Option<Value>> {
    let zero = |what: &str| rt.error(TypeId::ZERO_DIVISION_ERROR, format!("float {} by zero", what));
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::TrueDivide => {
            if b == 0.0 {
                return Err(zero("division"));
            }
            a / b
        }
        BinaryOp::FloorDivide => {
            if b == 0.0 {
                return Err(zero("floor division"));
            }
            (a / b).floor()
        }
        BinaryOp::Modulo => {
            if b == 0.0 {
                return Err(zero("modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
        }
        BinaryOp::Power => {
            if a == 0.0 && b < 0.0 {
                return Err(rt.error(
                    TypeId::ZERO_DIVISION_ERROR,
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
        _ => return Ok(None),
    };
    Ok(Some(Value::Float(v)))
}

fn repeat_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn sequence(rt: &Runtime, op: BinaryOp, l: &Value, r: &Value, inplace: bool) -> RunResult<Option<Value>> {
    Ok(Some(match (op, l, r) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Value::Str(Arc::from(format!("{}{}", a, b))),
        (BinaryOp::Add, Value::Bytes(a), Value::Bytes(b)) => Value::Bytes(a.iter().chain(b.iter()).copied().collect()),
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => Value::Tuple(a.iter().chain(b.iter()).cloned().collect()),
        (BinaryOp::Add, Value::List(a), _) if inplace => {
            let extra = rt.collect(r)?;
            a.lock().extend(extra);
            l.clone()
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Value::list(items)
        }
        (BinaryOp::Multiply, Value::Str(s), Value::Int(_) | Value::Bool(_)) => {
            Value::Str(Arc::from(s.repeat(repeat_count(r.as_int().unwrap_or_default()))))
        }
        (BinaryOp::Multiply, Value::Int(_) | Value::Bool(_), Value::Str(_) | Value::Tuple(_) | Value::List(_)) => {
            return sequence(rt, op, r, l, false);
        }
        (BinaryOp::Multiply, Value::Tuple(t), Value::Int(n)) => {
            let n = repeat_count(*n);
            Value::Tuple(t.iter().cloned().cycle().take(t.len() * n).collect())
        }
        (BinaryOp::Multiply, Value::List(list), Value::Int(n)) => {
            let items = list.lock().clone();
            let repeated: Vec<Value> = items.iter().cloned().cycle().take(items.len() * repeat_count(*n)).collect();
            if inplace {
                *list.lock() = repeated;
                l.clone()
            } else {
                Value::list(repeated)
            }
        }
        (BinaryOp::Modulo, Value::Str(fmt), _) => Value::Str(Arc::from(percent_format(rt, fmt, r)?)),
        (BinaryOp::Or, Value::Dict(a), Value::Dict(b)) => {
            let incoming = b.lock().clone();
            if inplace {
                let mut pairs = a.lock();
                for (k, v) in incoming {
                    dict::insert(&mut pairs, k, v);
                }
                drop(pairs);
                l.clone()
            } else {
                let mut pairs = a.lock().clone();
                for (k, v) in incoming {
                    dict::insert(&mut pairs, k, v);
                }
                Value::dict(pairs)
            }
        }
        (BinaryOp::Or | BinaryOp::And | BinaryOp::Subtract | BinaryOp::Xor, Value::Set(a), Value::Set(b)) => {
            let (x, y) = (a.lock().clone(), b.lock().clone());
            let in_y = |v: &Value| y.iter().any(|w| w.py_eq(v));
            let in_x = |v: &Value| x.iter().any(|w| w.py_eq(v));
            let items: Vec<Value> = match op {
                BinaryOp::Or => x.iter().cloned().chain(y.iter().filter(|v| !in_x(v)).cloned()).collect(),
                BinaryOp::And => x.iter().filter(|v| in_y(v)).cloned().collect(),
                BinaryOp::Subtract => x.iter().filter(|v| !in_y(v)).cloned().collect(),
                _ => x
                    .iter()
                    .filter(|v| !in_y(v))
                    .chain(y.iter().filter(|v| !in_x(v)))
                    .cloned()
                    .collect(),
            };
            Value::Set(Arc::new(parking_lot::Mutex::new(items)))
        }
        _ => return Ok(None),
    }))
}

// =============================================================================
// Comparison
// =============================================================================

/// Rich comparison.
pub fn compare(rt: &Runtime, op: CompareOp, l: &Value, r: &Value) -> RunResult<Value> {
    if let Value::Native(n) = l {
        if n.has_method(op.dunder()) {
            return n.call_method(rt, op.dunder(), std::slice::from_ref(r));
        }
    }
    if let Value::Native(n) = r {
        let swapped = op.swapped().dunder();
        if n.has_method(swapped) {
            return n.call_method(rt, swapped, std::slice::from_ref(l));
        }
    }
    let result = match op {
        CompareOp::Eq => l.py_eq(r),
        CompareOp::Ne => !l.py_eq(r),
        _ => match order(rt, l, r, op.symbol())? {
            // unordered floats compare false
            None => false,
            Some(ord) => match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            },
        },
    };
    Ok(Value::Bool(result))
}

/// Total order of two builtin values, `None` for NaN.
pub fn order(rt: &Runtime, l: &Value, r: &Value, symbol: &str) -> RunResult<Option<Ordering>> {
    if let (Some(a), Some(b)) = (l.as_int(), r.as_int()) {
        return Ok(Some(a.cmp(&b)));
    }
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return Ok(a.partial_cmp(&b));
    }
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => seq_order(rt, a, b, symbol),
        (Value::List(a), Value::List(b)) => {
            let (x, y) = (a.lock().clone(), b.lock().clone());
            seq_order(rt, &x, &y, symbol)
        }
        _ => Err(rt.type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            symbol,
            l.type_name(rt.model()),
            r.type_name(rt.model())
        ))),
    }
}

fn seq_order(rt: &Runtime, a: &[Value], b: &[Value], symbol: &str) -> RunResult<Option<Ordering>> {
    for (x, y) in a.iter().zip(b) {
        if !x.py_eq(y) {
            return order(rt, x, y, symbol);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// `item in container`.
pub fn contains(rt: &Runtime, container: &Value, item: &Value) -> RunResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(&**sub)),
            other => Err(rt.type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name(rt.model())
            ))),
        },
        Value::Bytes(b) => match item {
            Value::Int(i) => Ok(u8::try_from(*i).is_ok_and(|byte| b.contains(&byte))),
            Value::Bytes(sub) => Ok(sub.is_empty() || b.windows(sub.len()).any(|w| w == &sub[..])),
            _ => Err(rt.type_error("a bytes-like object is required")),
        },
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::List(items) | Value::Set(items) => {
            let items = items.lock().clone();
            Ok(items.iter().any(|v| v.py_eq(item)))
        }
        Value::Dict(pairs) => Ok(dict::position(&pairs.lock(), item).is_some()),
        Value::Range(r) => Ok(item.as_int().is_some_and(|n| r.contains(n))),
        Value::Native(n) if n.has_method("__contains__") => {
            let result = n.call_method(rt, "__contains__", std::slice::from_ref(item))?;
            rt.truthy(&result)
        }
        Value::Iter(_) | Value::Generator(_) | Value::Native(_) => {
            let it = rt.iter(container)?;
            while let Some(v) = rt.next(&it)? {
                if v.py_eq(item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(rt.type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name(rt.model())
        ))),
    }
}

// =============================================================================
// Length and Subscripts
// =============================================================================

pub fn len(rt: &Runtime, v: &Value) -> RunResult<i64> {
    let n = match v {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(t) => t.len(),
        Value::List(l) | Value::Set(l) => l.lock().len(),
        Value::Dict(d) => d.lock().len(),
        Value::Range(r) => return Ok(r.len()),
        Value::Native(n) if n.has_method("__len__") => {
            let result = n.call_method(rt, "__len__", &[])?;
            return result
                .as_int()
                .ok_or_else(|| rt.type_error("__len__() should return an integer"));
        }
        other => {
            return Err(rt.type_error(format!(
                "object of type '{}' has no len()",
                other.type_name(rt.model())
            )));
        }
    };
    Ok(n as i64)
}

fn index_of(rt: &Runtime, index: i64, len: usize, what: &str) -> RunResult<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    if (0..len).contains(&i) {
        Ok(i as usize)
    } else {
        Err(rt.error(TypeId::INDEX_ERROR, format!("{} index out of range", what)))
    }
}

/// Resolve a slice against a sequence length, as `slice.indices` does.
pub fn slice_indices(rt: &Runtime, parts: &[Value; 3], len: usize) -> RunResult<(i64, i64, i64)> {
    let bound = |v: &Value| -> RunResult<Option<i64>> {
        match v {
            Value::None => Ok(None),
            other => other
                .as_int()
                .map(Some)
                .ok_or_else(|| rt.type_error("slice indices must be integers or None")),
        }
    };
    let step = bound(&parts[2])?.unwrap_or(1);
    if step == 0 {
        return Err(rt.error(TypeId::VALUE_ERROR, "slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |v: Option<i64>, default: i64| -> i64 {
        match v {
            None => default,
            Some(i) if i < 0 => {
                let i = i + len;
                if i < 0 { if step < 0 { -1 } else { 0 } } else { i }
            }
            Some(i) if i >= len => {
                if step < 0 { len - 1 } else { len }
            }
            Some(i) => i,
        }
    };
    let (start_default, stop_default) = if step < 0 { (len - 1, -1) } else { (0, len) };
    let start = clamp(bound(&parts[0])?, start_default);
    let stop = clamp(bound(&parts[1])?, stop_default);
    Ok((start, stop, step))
}

fn slice_positions(start: i64, stop: i64, step: i64) -> Vec<usize> {
    RangeValue { start, stop, step }
        .len()
        .max(0)
        .try_into()
        .map(|n: usize| (0..n).map(|k| (start + k as i64 * step) as usize).collect())
        .unwrap_or_default()
}

/// `container[key]`.
pub fn get_item(rt: &Runtime, container: &Value, key: &Value) -> RunResult<Value> {
    match (container, key) {
        (Value::Tuple(items), Value::Slice(parts)) => {
            let (start, stop, step) = slice_indices(rt, parts, items.len())?;
            Ok(Value::Tuple(slice_positions(start, stop, step).into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::List(list), Value::Slice(parts)) => {
            let items = list.lock().clone();
            let (start, stop, step) = slice_indices(rt, parts, items.len())?;
            Ok(Value::list(slice_positions(start, stop, step).into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Str(s), Value::Slice(parts)) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, stop, step) = slice_indices(rt, parts, chars.len())?;
            let out: String = slice_positions(start, stop, step).into_iter().map(|i| chars[i]).collect();
            Ok(Value::Str(Arc::from(out)))
        }
        (Value::Tuple(items), _) => {
            let i = int_index(rt, key, "tuple")?;
            Ok(items[index_of(rt, i, items.len(), "tuple")?].clone())
        }
        (Value::List(list), _) => {
            let i = int_index(rt, key, "list")?;
            let items = list.lock();
            Ok(items[index_of(rt, i, items.len(), "list")?].clone())
        }
        (Value::Str(s), _) => {
            let i = int_index(rt, key, "string")?;
            let count = s.chars().count();
            let at = index_of(rt, i, count, "string")?;
            Ok(Value::Str(Arc::from(s.chars().nth(at).map(String::from).unwrap_or_default())))
        }
        (Value::Bytes(b), _) => {
            let i = int_index(rt, key, "bytes")?;
            Ok(Value::Int(b[index_of(rt, i, b.len(), "index")?] as i64))
        }
        (Value::Range(r), _) => {
            let i = int_index(rt, key, "range object")?;
            r.get(i)
                .map(Value::Int)
                .ok_or_else(|| rt.error(TypeId::INDEX_ERROR, "range object index out of range"))
        }
        (Value::Dict(pairs), _) => {
            check_hashable(rt, key)?;
            let found = dict::lookup(&pairs.lock(), key);
            found.ok_or_else(|| rt.raise(TypeId::KEY_ERROR, vec![key.clone()]))
        }
        (Value::Native(n), _) if n.has_method("__getitem__") => {
            n.call_method(rt, "__getitem__", std::slice::from_ref(key))
        }
        _ => Err(rt.type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name(rt.model())
        ))),
    }
}

fn int_index(rt: &Runtime, key: &Value, what: &str) -> RunResult<i64> {
    key.as_int().ok_or_else(|| {
        rt.type_error(format!(
            "{} indices must be integers or slices, not {}",
            what,
            key.type_name(rt.model())
        ))
    })
}

pub fn check_hashable(rt: &Runtime, key: &Value) -> RunResult<()> {
    if key.is_hashable() {
        Ok(())
    } else {
        Err(rt.type_error(format!("unhashable type: '{}'", key.type_name(rt.model()))))
    }
}

/// `container[key] = value`.
pub fn set_item(rt: &Runtime, container: &Value, key: &Value, value: Value) -> RunResult<()> {
    match (container, key) {
        (Value::List(list), Value::Slice(parts)) => {
            let replacement = rt.collect(&value)?;
            let mut items = list.lock();
            let (start, stop, step) = slice_indices(rt, parts, items.len())?;
            if step != 1 {
                return Err(rt.error(TypeId::VALUE_ERROR, "extended slice assignment is not supported"));
            }
            let start = start as usize;
            let stop = (stop as usize).max(start);
            items.splice(start..stop, replacement);
            Ok(())
        }
        (Value::List(list), _) => {
            let i = int_index(rt, key, "list")?;
            let mut items = list.lock();
            let at = index_of(rt, i, items.len(), "list assignment")?;
            items[at] = value;
            Ok(())
        }
        (Value::Dict(pairs), _) => {
            check_hashable(rt, key)?;
            dict::insert(&mut pairs.lock(), key.clone(), value);
            Ok(())
        }
        (Value::Native(n), _) if n.has_method("__setitem__") => {
            n.call_method(rt, "__setitem__", &[key.clone(), value]).map(drop)
        }
        _ => Err(rt.type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name(rt.model())
        ))),
    }
}

/// `del container[key]`.
pub fn del_item(rt: &Runtime, container: &Value, key: &Value) -> RunResult<()> {
    match (container, key) {
        (Value::List(list), Value::Slice(parts)) => {
            let mut items = list.lock();
            let (start, stop, step) = slice_indices(rt, parts, items.len())?;
            let mut doomed = slice_positions(start, stop, step);
            doomed.sort_unstable();
            for i in doomed.into_iter().rev() {
                items.remove(i);
            }
            Ok(())
        }
        (Value::List(list), _) => {
            let i = int_index(rt, key, "list")?;
            let mut items = list.lock();
            let at = index_of(rt, i, items.len(), "list assignment")?;
            items.remove(at);
            Ok(())
        }
        (Value::Dict(pairs), _) => {
            let removed = dict::remove(&mut pairs.lock(), key);
            removed.map(drop).ok_or_else(|| rt.raise(TypeId::KEY_ERROR, vec![key.clone()]))
        }
        (Value::Native(n), _) if n.has_method("__delitem__") => {
            n.call_method(rt, "__delitem__", std::slice::from_ref(key)).map(drop)
        }
        _ => Err(rt.type_error(format!(
            "'{}' object does not support item deletion",
            container.type_name(rt.model())
        ))),
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// `iter(v)`.
pub fn iter(rt: &Runtime, v: &Value) -> RunResult<Value> {
    let state = match v {
        Value::Iter(_) | Value::Generator(_) => return Ok(v.clone()),
        Value::List(list) => IterState::List {
            list: Arc::clone(list),
            index: 0,
        },
        Value::Tuple(items) => IterState::items(Arc::clone(items)),
        Value::Str(s) => IterState::items(s.chars().map(|c| Value::Str(Arc::from(c.to_string()))).collect::<Vec<_>>()),
        Value::Bytes(b) => IterState::items(b.iter().map(|&x| Value::Int(x as i64)).collect::<Vec<_>>()),
        Value::Set(items) => IterState::items(items.lock().clone()),
        Value::Dict(pairs) => IterState::items(pairs.lock().iter().map(|(k, _)| k.clone()).collect::<Vec<_>>()),
        Value::Range(r) => IterState::range(*r),
        Value::Native(n) if n.has_method("__iter__") => return n.call_method(rt, "__iter__", &[]),
        Value::Native(n) if n.has_method("__next__") => return Ok(v.clone()),
        other => {
            return Err(rt.type_error(format!(
                "'{}' object is not iterable",
                other.type_name(rt.model())
            )));
        }
    };
    Ok(Value::iter(state))
}

/// Advance an iterator; `None` when it is exhausted.
pub fn next(rt: &Runtime, it: &Value) -> RunResult<Option<Value>> {
    match it {
        Value::Iter(state) => Ok(state.lock().next()),
        Value::Generator(g) => match g.next(rt) {
            Ok(v) => Ok(Some(v)),
            Err(crate::error::RuntimeError::StopIteration(_)) => Ok(None),
            Err(err) => Err(err),
        },
        Value::Native(n) if n.has_method("__next__") => match n.call_method(rt, "__next__", &[]) {
            Ok(v) => Ok(Some(v)),
            Err(err) if rt.is_stop_iteration(&err) => Ok(None),
            Err(err) => Err(err),
        },
        other => Err(rt.type_error(format!(
            "'{}' object is not an iterator",
            other.type_name(rt.model())
        ))),
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// A parsed format specification: `[[fill]align][sign][0][width][,][.precision][type]`.
#[derive(Debug, Default, PartialEq)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Option<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let digits = |i: &mut usize| -> Option<usize> {
        let start = *i;
        while chars.get(*i).is_some_and(char::is_ascii_digit) {
            *i += 1;
        }
        (start != *i).then(|| chars[start..*i].iter().collect::<String>().parse().ok()).flatten()
    };
    out.width = digits(&mut i).unwrap_or(0);
    if chars.get(i) == Some(&',') {
        out.grouping = true;
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        out.precision = Some(digits(&mut i)?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    (i == chars.len()).then_some(out)
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn exponent_form(f: f64, precision: usize, upper: bool) -> String {
    let text = format!("{:.*e}", precision, f);
    let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mantissa, e, if exp < 0 { '-' } else { '+' }, exp.abs())
}

fn general_form(f: f64, precision: usize) -> String {
    let p = precision.max(1);
    if f == 0.0 || !f.is_finite() {
        return crate::value::float_repr(f);
    }
    let exp = f.abs().log10().floor() as i32;
    let trimmed = |s: String| -> String {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    };
    if exp < -4 || exp >= p as i32 {
        let text = exponent_form(f, p - 1, false);
        match text.split_once('e') {
            Some((m, e)) => format!("{}e{}", trimmed(m.to_string()), e),
            None => text,
        }
    } else {
        trimmed(format!("{:.*}", (p as i32 - 1 - exp).max(0) as usize, f))
    }
}

/// `format(value, spec)`.
pub fn format(rt: &Runtime, value: &Value, spec: &str) -> RunResult<String> {
    if spec.is_empty() {
        return rt.to_str(value);
    }
    let bad = || {
        rt.error(
            TypeId::VALUE_ERROR,
            format!("Invalid format specifier '{}' for object of type '{}'", spec, value.type_name(rt.model())),
        )
    };
    let parsed = parse_spec(spec).ok_or_else(bad)?;

    let (body, negative, numeric) = match (value, parsed.kind) {
        (Value::Str(s), None | Some('s')) => {
            let s: String = match parsed.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            (s, false, false)
        }
        (Value::Int(_) | Value::Bool(_), None | Some('d' | 'x' | 'X' | 'o' | 'b' | 'n')) => {
            let i = value.as_int().unwrap_or_default();
            let magnitude = i.unsigned_abs();
            let digits = match parsed.kind {
                Some('x') => format!("{:x}", magnitude),
                Some('X') => format!("{:X}", magnitude),
                Some('o') => format!("{:o}", magnitude),
                Some('b') => format!("{:b}", magnitude),
                _ if parsed.grouping => group_thousands(&magnitude.to_string()),
                _ => magnitude.to_string(),
            };
            (digits, i < 0, true)
        }
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), kind) => {
            let f = value.as_f64().unwrap_or_default();
            let p = parsed.precision.unwrap_or(6);
            let magnitude = f.abs();
            let text = match kind {
                Some('f' | 'F') => format!("{:.*}", p, magnitude),
                Some('e') => exponent_form(magnitude, p, false),
                Some('E') => exponent_form(magnitude, p, true),
                Some('%') => format!("{:.*}%", p, magnitude * 100.0),
                Some('g' | 'G') => general_form(magnitude, p),
                None => match parsed.precision {
                    Some(p) => general_form(magnitude, p),
                    None => crate::value::float_repr(magnitude),
                },
                _ => return Err(bad()),
            };
            let text = if parsed.grouping {
                match text.split_once('.') {
                    Some((int, frac)) => format!("{}.{}", group_thousands(int), frac),
                    None => group_thousands(&text),
                }
            } else {
                text
            };
            (text, f.is_sign_negative() && f != 0.0, true)
        }
        (Value::Native(_), _) | (_, None) => (rt.to_str(value)?, false, false),
        _ => return Err(bad()),
    };

    let sign = match (negative, parsed.sign) {
        (true, _) => "-",
        (false, Some('+')) if numeric => "+",
        (false, Some(' ')) if numeric => " ",
        _ => "",
    };
    let content_len = sign.chars().count() + body.chars().count();
    let pad = parsed.width.saturating_sub(content_len);
    let (fill, align) = if parsed.zero && parsed.align.is_none() && numeric {
        ('0', '=')
    } else {
        (
            parsed.fill.unwrap_or(' '),
            parsed.align.unwrap_or(if numeric { '>' } else { '<' }),
        )
    };
    let fill_str = |n: usize| fill.to_string().repeat(n);
    Ok(match align {
        '<' => format!("{}{}{}", sign, body, fill_str(pad)),
        '^' => format!("{}{}{}{}", fill_str(pad / 2), sign, body, fill_str(pad - pad / 2)),
        '=' => format!("{}{}{}", sign, fill_str(pad), body),
        _ => format!("{}{}{}", fill_str(pad), sign, body),
    })
}

/// `fmt % args` with the `%s`, `%r`, `%d`, `%i`, `%f` and `%%` conversions.
pub fn percent_format(rt: &Runtime, fmt: &str, args: &Value) -> RunResult<String> {
    let args: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut next = args.iter();
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let missing = || rt.type_error("not enough arguments for format string");
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' || d == '-' || d == '+' || d == ' ' {
                spec.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let conversion = chars
            .next()
            .ok_or_else(|| rt.error(TypeId::VALUE_ERROR, "incomplete format"))?;
        let piece = match conversion {
            '%' => "%".to_string(),
            's' => rt.to_str(next.next().ok_or_else(missing)?)?,
            'r' => rt.repr(next.next().ok_or_else(missing)?)?,
            'd' | 'i' => {
                let v = next.next().ok_or_else(missing)?;
                let n = match v {
                    Value::Float(f) => f.trunc() as i64,
                    other => other
                        .as_int()
                        .ok_or_else(|| rt.type_error(format!("%d format: a number is required, not {}", other.type_name(rt.model()))))?,
                };
                n.to_string()
            }
            'f' => {
                let v = next.next().ok_or_else(missing)?;
                let f = v.as_f64().ok_or_else(|| rt.type_error("must be real number"))?;
                let precision = spec.split_once('.').and_then(|(_, p)| p.parse().ok()).unwrap_or(6);
                spec = spec.split_once('.').map(|(w, _)| w.to_string()).unwrap_or(spec);
                format!("{:.*}", precision, f)
            }
            other => {
                return Err(rt.error(
                    TypeId::VALUE_ERROR,
                    format!("unsupported format character '{}'", other),
                ));
            }
        };
        let width: usize = spec.trim_start_matches(['-', '+', ' ']).parse().unwrap_or(0);
        let pad = width.saturating_sub(piece.chars().count());
        if spec.starts_with('-') {
            out.push_str(&piece);
            out.push_str(&" ".repeat(pad));
        } else {
            out.push_str(&" ".repeat(pad));
            out.push_str(&piece);
        }
    }
    if next.next().is_some() {
        return Err(rt.type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> Runtime {
        Runtime::new()
    }

    #[test]
    fn test_floor_semantics() {
        let rt = rt();
        let div = |a, b| binary(&rt, BinaryOp::FloorDivide, &Value::Int(a), &Value::Int(b), false).unwrap();
        let rem = |a, b| binary(&rt, BinaryOp::Modulo, &Value::Int(a), &Value::Int(b), false).unwrap();
        assert!(div(-7, 2).py_eq(&Value::Int(-4)));
        assert!(rem(-7, 2).py_eq(&Value::Int(1)));
        assert!(rem(7, -2).py_eq(&Value::Int(-1)));
        let f = binary(&rt, BinaryOp::Modulo, &Value::Float(-1.0), &Value::Int(3), false).unwrap();
        assert!(f.py_eq(&Value::Float(2.0)));
    }

    #[test]
    fn test_division_by_zero_raises() {
        let rt = rt();
        let err = binary(&rt, BinaryOp::TrueDivide, &Value::Int(1), &Value::Int(0), false).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::ZERO_DIVISION_ERROR);
    }

    #[test]
    fn test_overflow_raises_arithmetic_error() {
        let rt = rt();
        let err = binary(&rt, BinaryOp::Multiply, &Value::Int(i64::MAX), &Value::Int(2), false).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::ARITHMETIC_ERROR);
    }

    #[test]
    fn test_mixed_and_sequence_operands() {
        let rt = rt();
        let v = binary(&rt, BinaryOp::Add, &Value::Int(1), &Value::Float(0.5), false).unwrap();
        assert!(v.py_eq(&Value::Float(1.5)));
        let s = binary(&rt, BinaryOp::Multiply, &Value::Int(3), &Value::str("ab"), false).unwrap();
        assert!(s.py_eq(&Value::str("ababab")));
        let err = binary(&rt, BinaryOp::Add, &Value::Int(1), &Value::str("x"), false).unwrap_err();
        assert!(err.to_string().contains("unsupported operand type(s) for +: 'int' and 'str'"));
    }

    #[test]
    fn test_inplace_add_extends_list() {
        let rt = rt();
        let list = Value::list(vec![Value::Int(1)]);
        let out = binary(&rt, BinaryOp::Add, &list, &Value::tuple([Value::Int(2)]), true).unwrap();
        assert!(out.is(&list));
        assert_eq!(len(&rt, &list).unwrap(), 2);
    }

    #[test]
    fn test_compare_orders_sequences() {
        let rt = rt();
        let a = Value::tuple([Value::Int(1), Value::Int(2)]);
        let b = Value::tuple([Value::Int(1), Value::Int(3)]);
        assert!(compare(&rt, CompareOp::Lt, &a, &b).unwrap().truthy());
        assert!(!compare(&rt, CompareOp::Lt, &Value::Float(f64::NAN), &Value::Int(1)).unwrap().truthy());
        assert!(compare(&rt, CompareOp::Lt, &Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn test_subscripts_and_slices() {
        let rt = rt();
        let list = Value::list((0..6).map(Value::Int).collect());
        let slice = Value::Slice(Arc::new([Value::Int(-1), Value::None, Value::Int(-2)]));
        let picked = get_item(&rt, &list, &slice).unwrap();
        assert_eq!(rt.repr(&picked).unwrap(), "[5, 3, 1]");
        let err = get_item(&rt, &list, &Value::Int(6)).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::INDEX_ERROR);

        let d = Value::dict(Vec::new());
        set_item(&rt, &d, &Value::str("k"), Value::Int(1)).unwrap();
        let missing = get_item(&rt, &d, &Value::str("q")).unwrap_err();
        assert_eq!(missing.exception().unwrap().ty, TypeId::KEY_ERROR);
        assert!(set_item(&rt, &d, &list, Value::None).is_err());
    }

    #[test]
    fn test_format_spec() {
        let rt = rt();
        assert_eq!(format(&rt, &Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format(&rt, &Value::Int(42), ">5").unwrap(), "   42");
        assert_eq!(format(&rt, &Value::Int(-42), "05").unwrap(), "-0042");
        assert_eq!(format(&rt, &Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format(&rt, &Value::Int(255), "x").unwrap(), "ff");
        assert_eq!(format(&rt, &Value::str("ab"), "^6").unwrap(), "  ab  ");
        assert_eq!(format(&rt, &Value::Float(1234.5), "e").unwrap(), "1.234500e+03");
        assert_eq!(format(&rt, &Value::Float(0.25), ".0%").unwrap(), "25%");
        assert!(format(&rt, &Value::str("ab"), "d").is_err());
    }

    #[test]
    fn test_percent_format() {
        let rt = rt();
        let args = Value::tuple([Value::str("x"), Value::Int(3), Value::Float(0.5)]);
        assert_eq!(percent_format(&rt, "%s=%d (%.2f) 100%%", &args).unwrap(), "x=3 (0.50) 100%");
        assert!(percent_format(&rt, "%s %s", &Value::Int(1)).is_err());
    }
}
