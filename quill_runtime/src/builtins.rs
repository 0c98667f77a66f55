//! Builtin functions, constructors and methods of the builtin types.
//!
//! The set mirrors what `TypeModel::with_builtins` declares, so a call the
//! translator lowered to a direct call always lands here. A declared method
//! without an implementation raises `NotImplementedError`.

use crate::error::{RunResult, RuntimeError};
use crate::ops;
use crate::runtime::Runtime;
use crate::value::{RangeValue, Value, dict};
use parking_lot::Mutex;
use quill_bytecode::CompareOp;
use quill_compiler::{BinaryOp, UnaryOp};
use quill_types::TypeId;
use rustc_hash::FxHasher;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

type Kwargs<'a> = &'a [(Arc<str>, Value)];

const BINARY_OPS: [BinaryOp; 13] = [
    BinaryOp::Power,
    BinaryOp::Multiply,
    BinaryOp::MatrixMultiply,
    BinaryOp::FloorDivide,
    BinaryOp::TrueDivide,
    BinaryOp::Modulo,
    BinaryOp::Add,
    BinaryOp::Subtract,
    BinaryOp::Lshift,
    BinaryOp::Rshift,
    BinaryOp::And,
    BinaryOp::Xor,
    BinaryOp::Or,
];

const COMPARE_OPS: [CompareOp; 6] = [
    CompareOp::Lt,
    CompareOp::Le,
    CompareOp::Eq,
    CompareOp::Ne,
    CompareOp::Gt,
    CompareOp::Ge,
];

// =============================================================================
// Argument Helpers
// =============================================================================

fn arity(rt: &Runtime, name: &str, args: &[Value], min: usize, max: usize) -> RunResult<()> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {}", min)
    } else if args.len() < min {
        format!("at least {}", min)
    } else {
        format!("at most {}", max)
    };
    Err(rt.type_error(format!(
        "{}() takes {} argument{} ({} given)",
        name,
        expected,
        if min == max && min == 1 { "" } else { "s" },
        args.len()
    )))
}

fn no_kwargs(rt: &Runtime, name: &str, kwargs: Kwargs<'_>) -> RunResult<()> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(rt.type_error(format!("{}() takes no keyword arguments", name)))
    }
}

/// Pick the named keywords out of `kwargs`, rejecting any other.
fn keywords<const N: usize>(
    rt: &Runtime,
    func: &str,
    kwargs: Kwargs<'_>,
    names: [&str; N],
) -> RunResult<[Option<Value>; N]> {
    let mut out: [Option<Value>; N] = std::array::from_fn(|_| None);
    for (key, value) in kwargs {
        match names.iter().position(|n| **n == **key) {
            Some(i) => out[i] = Some(value.clone()),
            None => {
                return Err(rt.type_error(format!("{}() got an unexpected keyword argument '{}'", func, key)));
            }
        }
    }
    Ok(out)
}

fn int_arg(rt: &Runtime, func: &str, v: &Value) -> RunResult<i64> {
    v.as_int().ok_or_else(|| {
        rt.type_error(format!(
            "{}() argument must be int, not {}",
            func,
            v.type_name(rt.model())
        ))
    })
}

fn str_arg<'a>(rt: &Runtime, func: &str, v: &'a Value) -> RunResult<&'a Arc<str>> {
    v.as_str().ok_or_else(|| {
        rt.type_error(format!(
            "{}() argument must be str, not {}",
            func,
            v.type_name(rt.model())
        ))
    })
}

/// Add `item` to set members unless an equal member exists.
pub fn set_insert(rt: &Runtime, members: &mut Vec<Value>, item: Value) -> RunResult<()> {
    ops::check_hashable(rt, &item)?;
    if !members.iter().any(|m| m.py_eq(&item)) {
        members.push(item);
    }
    Ok(())
}

/// Escape everything outside ASCII, as `ascii()` does.
pub fn ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c as u32 {
            0..=0x7f => out.push(c),
            n @ 0x80..=0xff => out.push_str(&format!("\\x{:02x}", n)),
            n @ 0x100..=0xffff => out.push_str(&format!("\\u{:04x}", n)),
            n => out.push_str(&format!("\\U{:08x}", n)),
        }
    }
    out
}

fn fx_hash(value: impl Hash) -> i64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish() as i64
}

/// Address-like identity of a value.
pub fn identity(v: &Value) -> i64 {
    let addr = match v {
        Value::Str(s) => Arc::as_ptr(s).cast::<()>() as usize,
        Value::Bytes(b) => Arc::as_ptr(b).cast::<()>() as usize,
        Value::Tuple(t) => Arc::as_ptr(t).cast::<()>() as usize,
        Value::List(l) | Value::Set(l) => Arc::as_ptr(l) as usize,
        Value::Dict(d) => Arc::as_ptr(d) as usize,
        Value::Slice(s) => Arc::as_ptr(s) as usize,
        Value::Iter(i) => Arc::as_ptr(i) as usize,
        Value::Exception(e) => Arc::as_ptr(e) as usize,
        Value::Traceback(t) => Arc::as_ptr(t).cast::<()>() as usize,
        Value::Function(f) => Arc::as_ptr(f) as usize,
        Value::Method(m) => Arc::as_ptr(m) as usize,
        Value::Generator(g) => Arc::as_ptr(g) as usize,
        Value::Cell(c) => Arc::as_ptr(c) as usize,
        Value::Code(c) => Arc::as_ptr(c) as usize,
        Value::Native(n) => Arc::as_ptr(n).cast::<()>() as usize,
        Value::None => return fx_hash("None"),
        Value::Ellipsis => return fx_hash("Ellipsis"),
        Value::Bool(b) => return fx_hash(("bool", b)),
        Value::Int(i) => return fx_hash(("int", i)),
        Value::Float(f) => return fx_hash(("float", f.to_bits())),
        Value::Range(r) => return fx_hash(("range", r.start, r.stop, r.step)),
        Value::Class(ty) => return fx_hash(("type", ty.raw())),
        Value::Builtin(name) => return fx_hash(("builtin", name)),
    };
    addr as i64
}

/// `hash(v)`. Equal numbers hash equal across `bool`, `int` and `float`.
pub fn hash(rt: &Runtime, v: &Value) -> RunResult<i64> {
    ops::check_hashable(rt, v)?;
    Ok(match v {
        Value::Bool(_) | Value::Int(_) => v.as_int().unwrap_or_default(),
        Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => *f as i64,
        Value::Float(f) => fx_hash(f.to_bits()),
        Value::Str(s) => fx_hash(&**s),
        Value::Bytes(b) => fx_hash(&**b),
        Value::Tuple(items) => {
            let mut hasher = FxHasher::default();
            for item in items.iter() {
                hasher.write_i64(hash(rt, item)?);
            }
            hasher.finish() as i64
        }
        Value::Native(n) if n.has_method("__hash__") => {
            let h = n.call_method(rt, "__hash__", &[])?;
            h.as_int()
                .ok_or_else(|| rt.type_error("__hash__ method should return an integer"))?
        }
        other => identity(other),
    })
}

/// Sort by `key`, stably; `reverse` flips each comparison.
pub fn sort_values(rt: &Runtime, items: &mut Vec<Value>, key: Option<&Value>, reverse: bool) -> RunResult<()> {
    let keys: Vec<Value> = match key {
        Some(f) if !f.is_none() => items
            .iter()
            .map(|v| rt.call(f, std::slice::from_ref(v)))
            .collect::<RunResult<_>>()?,
        _ => items.clone(),
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut failure: Option<RuntimeError> = None;
    order.sort_by(|&a, &b| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        match ops::order(rt, &keys[a], &keys[b], "<") {
            Ok(Some(ord)) if reverse => ord.reverse(),
            Ok(Some(ord)) => ord,
            Ok(None) => Ordering::Equal,
            Err(err) => {
                failure = Some(err);
                Ordering::Equal
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    let sorted: Vec<Value> = order.into_iter().map(|i| items[i].clone()).collect();
    *items = sorted;
    Ok(())
}

// =============================================================================
// Builtin Functions
// =============================================================================

/// Call the builtin function `name`.
pub fn call_builtin(rt: &Runtime, name: &str, args: &[Value], kwargs: Kwargs<'_>) -> RunResult<Value> {
    match name {
        "print" => return print(rt, args, kwargs),
        "min" | "max" | "sorted" | "sum" => {}
        _ => no_kwargs(rt, name, kwargs)?,
    }
    match name {
        "len" => {
            arity(rt, name, args, 1, 1)?;
            Ok(Value::Int(ops::len(rt, &args[0])?))
        }
        "abs" => {
            arity(rt, name, args, 1, 1)?;
            abs(rt, &args[0])
        }
        "iter" => {
            arity(rt, name, args, 1, 1)?;
            rt.iter(&args[0])
        }
        "next" => {
            arity(rt, name, args, 1, 2)?;
            next(rt, &args[0], args.get(1))
        }
        "repr" => {
            arity(rt, name, args, 1, 1)?;
            Ok(Value::Str(Arc::from(rt.repr(&args[0])?)))
        }
        "hash" => {
            arity(rt, name, args, 1, 1)?;
            Ok(Value::Int(hash(rt, &args[0])?))
        }
        "id" => {
            arity(rt, name, args, 1, 1)?;
            Ok(Value::Int(identity(&args[0])))
        }
        "isinstance" => {
            arity(rt, name, args, 2, 2)?;
            Ok(Value::Bool(isinstance(rt, &args[0], &args[1])?))
        }
        "callable" => {
            arity(rt, name, args, 1, 1)?;
            Ok(Value::Bool(callable(&args[0])))
        }
        "hasattr" => {
            arity(rt, name, args, 2, 2)?;
            let attr = str_arg(rt, name, &args[1])?;
            match rt.get_attr(&args[0], attr) {
                Ok(_) => Ok(Value::Bool(true)),
                Err(RuntimeError::Exception(exc)) if rt.model().is_subtype(exc.ty, TypeId::ATTRIBUTE_ERROR) => {
                    Ok(Value::Bool(false))
                }
                Err(err) => Err(err),
            }
        }
        "getattr" => {
            arity(rt, name, args, 2, 3)?;
            let attr = str_arg(rt, name, &args[1])?;
            match (rt.get_attr(&args[0], attr), args.get(2)) {
                (Err(RuntimeError::Exception(exc)), Some(default))
                    if rt.model().is_subtype(exc.ty, TypeId::ATTRIBUTE_ERROR) =>
                {
                    Ok(default.clone())
                }
                (result, _) => result,
            }
        }
        "min" => extremum(rt, name, args, kwargs, Ordering::Less),
        "max" => extremum(rt, name, args, kwargs, Ordering::Greater),
        "sum" => {
            let [start] = keywords(rt, name, kwargs, ["start"])?;
            arity(rt, name, args, 1, 2)?;
            let mut total = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
            if total.as_str().is_some() {
                return Err(rt.type_error("sum() can't sum strings [use ''.join(seq) instead]"));
            }
            for item in rt.collect(&args[0])? {
                total = ops::binary(rt, BinaryOp::Add, &total, &item, false)?;
            }
            Ok(total)
        }
        "sorted" => {
            let [key, reverse] = keywords(rt, name, kwargs, ["key", "reverse"])?;
            arity(rt, name, args, 1, 1)?;
            let mut items = rt.collect(&args[0])?;
            let reverse = match reverse {
                Some(v) => rt.truthy(&v)?,
                None => false,
            };
            sort_values(rt, &mut items, key.as_ref(), reverse)?;
            Ok(Value::list(items))
        }
        "ord" => {
            arity(rt, name, args, 1, 1)?;
            let s = str_arg(rt, name, &args[0])?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(c as i64)),
                _ => Err(rt.type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
            }
        }
        "chr" => {
            arity(rt, name, args, 1, 1)?;
            let n = int_arg(rt, name, &args[0])?;
            u32::try_from(n)
                .ok()
                .and_then(char::from_u32)
                .map(|c| Value::Str(Arc::from(c.to_string())))
                .ok_or_else(|| rt.error(TypeId::VALUE_ERROR, "chr() arg not in range(0x110000)"))
        }
        other => Err(rt.error(
            TypeId::NOT_IMPLEMENTED_ERROR,
            format!("builtin '{}' is not implemented", other),
        )),
    }
}

fn print(rt: &Runtime, args: &[Value], kwargs: Kwargs<'_>) -> RunResult<Value> {
    let [sep, end] = keywords(rt, "print", kwargs, ["sep", "end"])?;
    let text_of = |v: Option<Value>, default: &str| -> RunResult<String> {
        match v {
            None | Some(Value::None) => Ok(default.to_string()),
            Some(Value::Str(s)) => Ok(s.to_string()),
            Some(other) => Err(rt.type_error(format!(
                "sep and end must be None or a string, not {}",
                other.type_name(rt.model())
            ))),
        }
    };
    let sep = text_of(sep, " ")?;
    let end = text_of(end, "\n")?;
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push_str(&sep);
        }
        line.push_str(&rt.to_str(arg)?);
    }
    line.push_str(&end);
    rt.write(&line);
    Ok(Value::None)
}

fn abs(rt: &Runtime, v: &Value) -> RunResult<Value> {
    match v {
        Value::Int(_) | Value::Bool(_) => v
            .as_int()
            .and_then(i64::checked_abs)
            .map(Value::Int)
            .ok_or_else(|| rt.error(TypeId::ARITHMETIC_ERROR, "integer overflow")),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        Value::Native(n) if n.has_method("__abs__") => n.call_method(rt, "__abs__", &[]),
        other => Err(rt.type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name(rt.model())
        ))),
    }
}

fn next(rt: &Runtime, it: &Value, default: Option<&Value>) -> RunResult<Value> {
    let outcome = match it {
        Value::Generator(g) => g.next(rt),
        Value::Iter(_) | Value::Native(_) => match rt.next(it)? {
            Some(v) => Ok(v),
            None => Err(RuntimeError::StopIteration(None)),
        },
        other => {
            return Err(rt.type_error(format!(
                "'{}' object is not an iterator",
                other.type_name(rt.model())
            )));
        }
    };
    match (outcome, default) {
        (Err(RuntimeError::StopIteration(_)), Some(default)) => Ok(default.clone()),
        (outcome, _) => outcome,
    }
}

fn isinstance(rt: &Runtime, obj: &Value, class: &Value) -> RunResult<bool> {
    match class {
        Value::Class(ty) => Ok(rt.model().is_subtype(obj.type_id(), *ty)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if isinstance(rt, obj, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(rt.type_error("isinstance() arg 2 must be a type or tuple of types")),
    }
}

fn callable(v: &Value) -> bool {
    match v {
        Value::Function(_) | Value::Method(_) | Value::Builtin(_) | Value::Class(_) => true,
        Value::Native(n) => n.runtime_type() == TypeId::FUNCTION || n.has_method("__call__"),
        _ => false,
    }
}

fn extremum(rt: &Runtime, name: &str, args: &[Value], kwargs: Kwargs<'_>, want: Ordering) -> RunResult<Value> {
    let [key, default] = keywords(rt, name, kwargs, ["key", "default"])?;
    if args.is_empty() {
        return Err(rt.type_error(format!("{} expected at least 1 argument, got 0", name)));
    }
    let items = if args.len() == 1 {
        rt.collect(&args[0])?
    } else {
        if default.is_some() {
            return Err(rt.type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                name
            )));
        }
        args.to_vec()
    };
    let key_of = |v: &Value| -> RunResult<Value> {
        match &key {
            Some(f) if !f.is_none() => rt.call(f, std::slice::from_ref(v)),
            _ => Ok(v.clone()),
        }
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = key_of(&item)?;
        let replace = match &best {
            None => true,
            Some((best_key, _)) => {
                let symbol = if want == Ordering::Less { "<" } else { ">" };
                ops::order(rt, &k, best_key, symbol)? == Some(want)
            }
        };
        if replace {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(rt.error(TypeId::VALUE_ERROR, format!("{}() arg is an empty sequence", name))),
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// Call the builtin class `ty`.
pub fn construct(rt: &Runtime, ty: TypeId, args: &[Value], kwargs: Kwargs<'_>) -> RunResult<Value> {
    let model = rt.model();
    let name = model.name(ty).to_string();
    if model.is_exception(ty) {
        no_kwargs(rt, &name, kwargs)?;
        return Ok(Value::Exception(rt.exception(ty, args.to_vec())));
    }
    if ty != TypeId::DICT {
        no_kwargs(rt, &name, kwargs)?;
    }
    match ty {
        TypeId::INT => {
            arity(rt, &name, args, 0, 2)?;
            match (args.first(), args.get(1)) {
                (None, _) => Ok(Value::Int(0)),
                (Some(Value::Str(s)), base) => {
                    let base = match base {
                        Some(b) => int_arg(rt, &name, b)?,
                        None => 10,
                    };
                    parse_int(s, base)
                        .map(Value::Int)
                        .ok_or_else(|| {
                            rt.error(
                                TypeId::VALUE_ERROR,
                                format!("invalid literal for int() with base {}: {}", base, crate::value::str_repr(s)),
                            )
                        })
                }
                (Some(_), Some(_)) => Err(rt.type_error("int() can't convert non-string with explicit base")),
                (Some(Value::Float(f)), None) => {
                    if f.is_nan() {
                        Err(rt.error(TypeId::VALUE_ERROR, "cannot convert float NaN to integer"))
                    } else if !f.is_finite() || f.abs() >= 9.3e18 {
                        Err(rt.error(TypeId::ARITHMETIC_ERROR, "cannot convert float infinity to integer"))
                    } else {
                        Ok(Value::Int(f.trunc() as i64))
                    }
                }
                (Some(v @ (Value::Int(_) | Value::Bool(_))), None) => Ok(Value::Int(v.as_int().unwrap_or_default())),
                (Some(Value::Native(n)), None) if n.has_method("__int__") => n.call_method(rt, "__int__", &[]),
                (Some(other), None) => Err(rt.type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name(model)
                ))),
            }
        }
        TypeId::FLOAT => {
            arity(rt, &name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(s).map(Value::Float).ok_or_else(|| {
                    rt.error(
                        TypeId::VALUE_ERROR,
                        format!("could not convert string to float: {}", crate::value::str_repr(s)),
                    )
                }),
                Some(v) => match v.as_f64() {
                    Some(f) => Ok(Value::Float(f)),
                    None => Err(rt.type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        v.type_name(model)
                    ))),
                },
            }
        }
        TypeId::STR => {
            arity(rt, &name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::str("")),
                Some(v) => Ok(Value::Str(Arc::from(rt.to_str(v)?))),
            }
        }
        TypeId::BOOL => {
            arity(rt, &name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Bool(false)),
                Some(v) => Ok(Value::Bool(rt.truthy(v)?)),
            }
        }
        TypeId::BYTES => {
            arity(rt, &name, args, 0, 2)?;
            match (args.first(), args.get(1)) {
                (None, _) => Ok(Value::Bytes(Arc::from(Vec::new()))),
                (Some(Value::Str(s)), Some(_)) => Ok(Value::Bytes(Arc::from(s.as_bytes()))),
                (Some(Value::Str(_)), None) => Err(rt.type_error("string argument without an encoding")),
                (Some(v), _) => {
                    let mut bytes = Vec::new();
                    for item in rt.collect(v)? {
                        let b = item.as_int().and_then(|i| u8::try_from(i).ok()).ok_or_else(|| {
                            rt.error(TypeId::VALUE_ERROR, "bytes must be in range(0, 256)")
                        })?;
                        bytes.push(b);
                    }
                    Ok(Value::Bytes(bytes.into()))
                }
            }
        }
        TypeId::TUPLE => {
            arity(rt, &name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::tuple([])),
                Some(v @ Value::Tuple(_)) => Ok(v.clone()),
                Some(v) => Ok(Value::Tuple(rt.collect(v)?.into())),
            }
        }
        TypeId::LIST => {
            arity(rt, &name, args, 0, 1)?;
            match args.first() {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(rt.collect(v)?)),
            }
        }
        TypeId::SET => {
            arity(rt, &name, args, 0, 1)?;
            let mut members = Vec::new();
            if let Some(v) = args.first() {
                for item in rt.collect(v)? {
                    set_insert(rt, &mut members, item)?;
                }
            }
            Ok(Value::Set(Arc::new(Mutex::new(members))))
        }
        TypeId::DICT => {
            arity(rt, &name, args, 0, 1)?;
            let mut pairs = Vec::new();
            match args.first() {
                None => {}
                Some(Value::Dict(source)) => pairs = source.lock().clone(),
                Some(v) => {
                    for item in rt.collect(v)? {
                        let kv = rt.collect(&item)?;
                        let [k, v] = <[Value; 2]>::try_from(kv).map_err(|kv| {
                            rt.error(
                                TypeId::VALUE_ERROR,
                                format!("dictionary update sequence element has length {}; 2 is required", kv.len()),
                            )
                        })?;
                        ops::check_hashable(rt, &k)?;
                        dict::insert(&mut pairs, k, v);
                    }
                }
            }
            for (key, value) in kwargs {
                dict::insert(&mut pairs, Value::Str(Arc::clone(key)), value.clone());
            }
            Ok(Value::dict(pairs))
        }
        TypeId::RANGE => {
            arity(rt, &name, args, 1, 3)?;
            let ints = args
                .iter()
                .map(|a| {
                    a.as_int().ok_or_else(|| {
                        rt.type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            a.type_name(model)
                        ))
                    })
                })
                .collect::<RunResult<Vec<i64>>>()?;
            let (start, stop, step) = match ints[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(rt.error(TypeId::VALUE_ERROR, "range() arg 3 must not be zero"));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        TypeId::SLICE => {
            arity(rt, &name, args, 1, 3)?;
            let parts = match args {
                [stop] => [Value::None, stop.clone(), Value::None],
                [start, stop] => [start.clone(), stop.clone(), Value::None],
                [start, stop, step] => [start.clone(), stop.clone(), step.clone()],
                _ => [Value::None, Value::None, Value::None],
            };
            Ok(Value::Slice(Arc::new(parts)))
        }
        TypeId::TYPE => {
            arity(rt, &name, args, 1, 1)?;
            Ok(Value::Class(args[0].type_id()))
        }
        TypeId::OBJECT => Err(rt.error(
            TypeId::NOT_IMPLEMENTED_ERROR,
            "plain object instances are not supported",
        )),
        _ => Err(rt.type_error(format!("cannot create '{}' instances", name))),
    }
}

fn parse_int(s: &str, base: i64) -> Option<i64> {
    let text = s.trim().replace('_', "");
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let (radix, digits) = match (base, digits.get(..2).map(str::to_ascii_lowercase).as_deref()) {
        (0 | 16, Some("0x")) => (16, &digits[2..]),
        (0 | 8, Some("0o")) => (8, &digits[2..]),
        (0 | 2, Some("0b")) => (2, &digits[2..]),
        (0, _) => (10, digits),
        (b @ 2..=36, _) => (b as u32, digits),
        _ => return None,
    };
    if digits.is_empty() || digits.starts_with(['-', '+']) {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_float(s: &str) -> Option<f64> {
    let text = s.trim().to_ascii_lowercase();
    match text.trim_start_matches(['+', '-']) {
        "inf" | "infinity" => Some(if text.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY }),
        "nan" => Some(f64::NAN),
        _ => text.replace('_', "").parse().ok(),
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Whether the builtin type of `receiver` declares method `name`.
pub fn has_type_method(rt: &Runtime, receiver: &Value, name: &str) -> bool {
    !matches!(receiver, Value::Native(_) | Value::Class(_)) && rt.model().has_method(receiver.type_id(), name)
}

/// Data attributes of builtin values.
pub fn get_attr(rt: &Runtime, obj: &Value, name: &str) -> Option<Value> {
    let model = rt.model();
    let found = match (obj, name) {
        (_, "__class__") => Value::Class(obj.type_id()),
        (Value::Exception(exc), "args") => Value::Tuple(Arc::clone(&exc.args)),
        (Value::Exception(exc), "__traceback__") => Value::Traceback(exc.traceback().into()),
        (Value::Exception(exc), "value") if model.is_subtype(exc.ty, TypeId::STOP_ITERATION) => {
            exc.args.first().cloned().unwrap_or(Value::None)
        }
        (Value::Class(ty), "__name__") => Value::str(model.name(*ty)),
        (Value::Slice(parts), "start") => parts[0].clone(),
        (Value::Slice(parts), "stop") => parts[1].clone(),
        (Value::Slice(parts), "step") => parts[2].clone(),
        (Value::Range(r), "start") => Value::Int(r.start),
        (Value::Range(r), "stop") => Value::Int(r.stop),
        (Value::Range(r), "step") => Value::Int(r.step),
        (Value::Function(f), "__name__") => Value::Str(Arc::clone(&f.code.name)),
        (Value::Function(f), "__qualname__") => Value::Str(Arc::clone(&f.qualname)),
        (Value::Function(f), "__code__") => Value::Code(Arc::clone(&f.code)),
        (Value::Function(f), "__defaults__") if !f.defaults.is_empty() => Value::Tuple(Arc::clone(&f.defaults)),
        (Value::Function(_), "__defaults__") => Value::None,
        (Value::Method(m), "__self__") => m.receiver.clone(),
        (Value::Method(m), "__name__") => Value::Str(Arc::clone(&m.name)),
        (Value::Builtin(b), "__name__") => Value::Str(Arc::clone(b)),
        (Value::Generator(g), "__name__") => Value::Str(Arc::clone(g.name())),
        (Value::Cell(c), "cell_contents") => c.lock().clone()?,
        (Value::Code(c), "co_name") => Value::Str(Arc::clone(&c.name)),
        _ => return None,
    };
    Some(found)
}

// =============================================================================
// Methods
// =============================================================================

/// Call method `name` of a builtin value.
pub fn call_type_method(rt: &Runtime, receiver: &Value, name: &str, args: &[Value]) -> RunResult<Value> {
    call_type_method_kw(rt, receiver, name, args, &[])
}

pub fn call_type_method_kw(
    rt: &Runtime,
    receiver: &Value,
    name: &str,
    args: &[Value],
    kwargs: Kwargs<'_>,
) -> RunResult<Value> {
    if let (Value::List(list), "sort") = (receiver, name) {
        let [key, reverse] = keywords(rt, "sort", kwargs, ["key", "reverse"])?;
        arity(rt, name, args, 0, 0)?;
        let mut items = list.lock().clone();
        let reverse = match reverse {
            Some(v) => rt.truthy(&v)?,
            None => false,
        };
        sort_values(rt, &mut items, key.as_ref(), reverse)?;
        *list.lock() = items;
        return Ok(Value::None);
    }
    no_kwargs(rt, name, kwargs)?;
    let result = match receiver {
        Value::Str(s) => str_method(rt, s, name, args)?,
        Value::Bytes(b) if name == "decode" => {
            arity(rt, name, args, 0, 0)?;
            let text = std::str::from_utf8(b)
                .map_err(|e| rt.error(TypeId::VALUE_ERROR, format!("'utf-8' codec can't decode bytes: {}", e)))?;
            Some(Value::str(text))
        }
        Value::Tuple(items) => sequence_method(rt, "tuple", items, name, args)?,
        Value::List(list) => list_method(rt, list, name, args)?,
        Value::Dict(pairs) => dict_method(rt, pairs, name, args)?,
        Value::Set(members) => match name {
            "add" => {
                arity(rt, name, args, 1, 1)?;
                let mut updated = members.lock().clone();
                set_insert(rt, &mut updated, args[0].clone())?;
                *members.lock() = updated;
                Some(Value::None)
            }
            "discard" => {
                arity(rt, name, args, 1, 1)?;
                let mut set = members.lock();
                if let Some(i) = set.iter().position(|m| m.py_eq(&args[0])) {
                    set.remove(i);
                }
                Some(Value::None)
            }
            _ => None,
        },
        Value::Generator(g) => match name {
            "send" => {
                arity(rt, name, args, 1, 1)?;
                Some(g.send(rt, args[0].clone())?)
            }
            "throw" => {
                arity(rt, name, args, 1, 1)?;
                Some(g.throw_value(rt, &args[0])?)
            }
            "close" => {
                arity(rt, name, args, 0, 0)?;
                g.close(rt)?;
                Some(Value::None)
            }
            "__next__" => Some(g.next(rt)?),
            _ => None,
        },
        Value::Exception(exc) if name == "with_traceback" => {
            arity(rt, name, args, 1, 1)?;
            match &args[0] {
                Value::Traceback(entries) => exc.replace_traceback(entries.to_vec()),
                Value::None => exc.replace_traceback(Vec::new()),
                _ => return Err(rt.type_error("__traceback__ must be a traceback or None")),
            }
            Some(receiver.clone())
        }
        Value::Float(f) if name == "is_integer" => Some(Value::Bool(f.is_finite() && f.fract() == 0.0)),
        Value::Int(i) if name == "bit_length" => Some(Value::Int(64 - i.unsigned_abs().leading_zeros() as i64)),
        _ => None,
    };
    if let Some(v) = result {
        return Ok(v);
    }
    if let Some(result) = dunder(rt, receiver, name, args) {
        return result;
    }
    if rt.model().has_method(receiver.type_id(), name) {
        return Err(rt.error(
            TypeId::NOT_IMPLEMENTED_ERROR,
            format!("'{}.{}' is not implemented", receiver.type_name(rt.model()), name),
        ));
    }
    Err(rt.attribute_error(receiver.type_name(rt.model()), name))
}

/// Special methods of builtin values, expressed through the operators.
fn dunder(rt: &Runtime, receiver: &Value, name: &str, args: &[Value]) -> Option<RunResult<Value>> {
    if !name.starts_with("__") {
        return None;
    }
    let one = |f: &dyn Fn(&Value) -> RunResult<Value>| -> RunResult<Value> {
        arity(rt, name, args, 1, 1)?;
        f(&args[0])
    };
    if let Some(op) = COMPARE_OPS.iter().find(|op| op.dunder() == name) {
        return Some(one(&|other| ops::compare(rt, *op, receiver, other)));
    }
    for op in BINARY_OPS {
        if op.dunder() == name {
            return Some(one(&|other| ops::binary(rt, op, receiver, other, false)));
        }
        if op.reflected() == name {
            return Some(one(&|other| ops::binary(rt, op, other, receiver, false)));
        }
        if op.inplace() == name {
            return Some(one(&|other| ops::binary(rt, op, receiver, other, true)));
        }
    }
    let unary = |op: UnaryOp| ops::unary(rt, op, receiver);
    Some(match name {
        "__neg__" => unary(UnaryOp::Negative),
        "__pos__" => unary(UnaryOp::Positive),
        "__invert__" => unary(UnaryOp::Invert),
        "__abs__" => abs(rt, receiver),
        "__bool__" => rt.truthy(receiver).map(Value::Bool),
        "__len__" => ops::len(rt, receiver).map(Value::Int),
        "__contains__" => one(&|item| ops::contains(rt, receiver, item).map(Value::Bool)),
        "__getitem__" => one(&|key| ops::get_item(rt, receiver, key)),
        "__setitem__" => arity(rt, name, args, 2, 2)
            .and_then(|_| ops::set_item(rt, receiver, &args[0], args[1].clone()))
            .map(|_| Value::None),
        "__delitem__" => one(&|key| ops::del_item(rt, receiver, key).map(|_| Value::None)),
        "__iter__" => ops::iter(rt, receiver),
        "__next__" => match ops::next(rt, receiver) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(rt.raise(TypeId::STOP_ITERATION, Vec::new())),
            Err(err) => Err(err),
        },
        "__repr__" => rt.repr(receiver).map(|s| Value::Str(Arc::from(s))),
        "__str__" => rt.to_str(receiver).map(|s| Value::Str(Arc::from(s))),
        "__hash__" => hash(rt, receiver).map(Value::Int),
        "__float__" => receiver
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| rt.type_error("must be real number")),
        "__int__" => receiver
            .as_int()
            .map(Value::Int)
            .ok_or_else(|| rt.type_error("an integer is required")),
        _ => return None,
    })
}

fn str_method(rt: &Runtime, s: &Arc<str>, name: &str, args: &[Value]) -> RunResult<Option<Value>> {
    let text = |v: String| Some(Value::Str(Arc::from(v)));
    Ok(match name {
        "upper" => text(s.to_uppercase()),
        "lower" => text(s.to_lowercase()),
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut in_word = false;
            for c in s.chars() {
                if c.is_alphabetic() {
                    if in_word {
                        out.extend(c.to_lowercase());
                    } else {
                        out.extend(c.to_uppercase());
                    }
                    in_word = true;
                } else {
                    out.push(c);
                    in_word = false;
                }
            }
            text(out)
        }
        "strip" => {
            arity(rt, name, args, 0, 1)?;
            match args.first() {
                None | Some(Value::None) => text(s.trim().to_string()),
                Some(chars) => {
                    let chars: Vec<char> = str_arg(rt, name, chars)?.chars().collect();
                    text(s.trim_matches(|c: char| chars.contains(&c)).to_string())
                }
            }
        }
        "join" => {
            arity(rt, name, args, 1, 1)?;
            let mut out = String::new();
            for (i, item) in rt.collect(&args[0])?.iter().enumerate() {
                let Value::Str(piece) = item else {
                    return Err(rt.type_error(format!(
                        "sequence item {}: expected str instance, {} found",
                        i,
                        item.type_name(rt.model())
                    )));
                };
                if i > 0 {
                    out.push_str(s);
                }
                out.push_str(piece);
            }
            text(out)
        }
        "split" => {
            arity(rt, name, args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
                Some(sep) => {
                    let sep = str_arg(rt, name, sep)?;
                    if sep.is_empty() {
                        return Err(rt.error(TypeId::VALUE_ERROR, "empty separator"));
                    }
                    s.split(&**sep).map(Value::str).collect()
                }
            };
            Some(Value::list(parts))
        }
        "startswith" | "endswith" => {
            arity(rt, name, args, 1, 1)?;
            let candidates: Vec<Value> = match &args[0] {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for candidate in &candidates {
                let affix = str_arg(rt, name, candidate)?;
                hit |= if name == "startswith" {
                    s.starts_with(&**affix)
                } else {
                    s.ends_with(&**affix)
                };
            }
            Some(Value::Bool(hit))
        }
        "replace" => {
            arity(rt, name, args, 2, 2)?;
            let old = str_arg(rt, name, &args[0])?;
            let new = str_arg(rt, name, &args[1])?;
            text(s.replace(&**old, new))
        }
        "find" => {
            arity(rt, name, args, 1, 1)?;
            let sub = str_arg(rt, name, &args[0])?;
            let at = s.find(&**sub).map_or(-1, |byte| s[..byte].chars().count() as i64);
            Some(Value::Int(at))
        }
        _ => None,
    })
}

fn sequence_method(rt: &Runtime, kind: &str, items: &[Value], name: &str, args: &[Value]) -> RunResult<Option<Value>> {
    Ok(match name {
        "count" => {
            arity(rt, name, args, 1, 1)?;
            Some(Value::Int(items.iter().filter(|v| v.py_eq(&args[0])).count() as i64))
        }
        "index" => {
            arity(rt, name, args, 1, 1)?;
            match items.iter().position(|v| v.py_eq(&args[0])) {
                Some(i) => Some(Value::Int(i as i64)),
                None => {
                    let message = if kind == "tuple" {
                        "tuple.index(x): x not in tuple".to_string()
                    } else {
                        format!("{} is not in list", rt.repr(&args[0])?)
                    };
                    return Err(rt.error(TypeId::VALUE_ERROR, message));
                }
            }
        }
        _ => None,
    })
}

fn list_method(rt: &Runtime, list: &Arc<Mutex<Vec<Value>>>, name: &str, args: &[Value]) -> RunResult<Option<Value>> {
    Ok(match name {
        "append" => {
            arity(rt, name, args, 1, 1)?;
            list.lock().push(args[0].clone());
            Some(Value::None)
        }
        "extend" => {
            arity(rt, name, args, 1, 1)?;
            let items = rt.collect(&args[0])?;
            list.lock().extend(items);
            Some(Value::None)
        }
        "insert" => {
            arity(rt, name, args, 2, 2)?;
            let index = int_arg(rt, name, &args[0])?;
            let mut items = list.lock();
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, args[1].clone());
            Some(Value::None)
        }
        "pop" => {
            arity(rt, name, args, 0, 1)?;
            let mut items = list.lock();
            if items.is_empty() {
                return Err(rt.error(TypeId::INDEX_ERROR, "pop from empty list"));
            }
            let len = items.len() as i64;
            let index = match args.first() {
                Some(v) => int_arg(rt, name, v)?,
                None => -1,
            };
            let at = if index < 0 { index + len } else { index };
            if !(0..len).contains(&at) {
                return Err(rt.error(TypeId::INDEX_ERROR, "pop index out of range"));
            }
            Some(items.remove(at as usize))
        }
        "copy" => {
            arity(rt, name, args, 0, 0)?;
            Some(Value::list(list.lock().clone()))
        }
        "reverse" => {
            arity(rt, name, args, 0, 0)?;
            list.lock().reverse();
            Some(Value::None)
        }
        "count" | "index" => {
            let items = list.lock().clone();
            sequence_method(rt, "list", &items, name, args)?
        }
        _ => None,
    })
}

fn dict_method(
    rt: &Runtime,
    pairs: &Arc<Mutex<Vec<(Value, Value)>>>,
    name: &str,
    args: &[Value],
) -> RunResult<Option<Value>> {
    Ok(match name {
        "get" => {
            arity(rt, name, args, 1, 2)?;
            let found = dict::lookup(&pairs.lock(), &args[0]);
            Some(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
        }
        "keys" => Some(Value::list(pairs.lock().iter().map(|(k, _)| k.clone()).collect())),
        "values" => Some(Value::list(pairs.lock().iter().map(|(_, v)| v.clone()).collect())),
        "items" => Some(Value::list(
            pairs
                .lock()
                .iter()
                .map(|(k, v)| Value::tuple([k.clone(), v.clone()]))
                .collect(),
        )),
        "pop" => {
            arity(rt, name, args, 1, 2)?;
            let removed = dict::remove(&mut pairs.lock(), &args[0]);
            match (removed, args.get(1)) {
                (Some(v), _) => Some(v),
                (None, Some(default)) => Some(default.clone()),
                (None, None) => return Err(rt.raise(TypeId::KEY_ERROR, vec![args[0].clone()])),
            }
        }
        "copy" => {
            arity(rt, name, args, 0, 0)?;
            Some(Value::dict(pairs.lock().clone()))
        }
        _ => None,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn call(rt: &Runtime, name: &str, args: &[Value]) -> RunResult<Value> {
        call_builtin(rt, name, args, &[])
    }

    #[test]
    fn test_len_abs_ord_chr() {
        let rt = Runtime::new();
        assert!(call(&rt, "len", &[Value::str("héllo")]).unwrap().py_eq(&Value::Int(5)));
        assert!(call(&rt, "abs", &[Value::Int(-3)]).unwrap().py_eq(&Value::Int(3)));
        assert!(call(&rt, "ord", &[Value::str("A")]).unwrap().py_eq(&Value::Int(65)));
        assert!(call(&rt, "chr", &[Value::Int(97)]).unwrap().py_eq(&Value::str("a")));
        assert!(call(&rt, "ord", &[Value::str("ab")]).is_err());
    }

    #[test]
    fn test_min_max_sum_sorted() {
        let rt = Runtime::new();
        let items = Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert!(call(&rt, "min", std::slice::from_ref(&items)).unwrap().py_eq(&Value::Int(1)));
        assert!(call(&rt, "max", &[Value::Int(4), Value::Int(9)]).unwrap().py_eq(&Value::Int(9)));
        assert!(call(&rt, "sum", std::slice::from_ref(&items)).unwrap().py_eq(&Value::Int(6)));
        let sorted = call_builtin(
            &rt,
            "sorted",
            std::slice::from_ref(&items),
            &[(Arc::from("reverse"), Value::Bool(true))],
        )
        .unwrap();
        assert_eq!(rt.repr(&sorted).unwrap(), "[3, 2, 1]");
        let empty = call(&rt, "max", &[Value::list(Vec::new())]).unwrap_err();
        assert_eq!(empty.exception().unwrap().ty, TypeId::VALUE_ERROR);
    }

    #[test]
    fn test_isinstance_follows_hierarchy() {
        let rt = Runtime::new();
        let yes = call(&rt, "isinstance", &[Value::Bool(true), Value::Class(TypeId::INT)]).unwrap();
        assert!(yes.truthy());
        let exc = Value::Exception(rt.exception(TypeId::KEY_ERROR, Vec::new()));
        let classes = Value::tuple([Value::Class(TypeId::VALUE_ERROR), Value::Class(TypeId::LOOKUP_ERROR)]);
        assert!(call(&rt, "isinstance", &[exc, classes]).unwrap().truthy());
    }

    #[test]
    fn test_print_collects_output() {
        let rt = Runtime::new();
        call_builtin(
            &rt,
            "print",
            &[Value::Int(1), Value::str("a")],
            &[(Arc::from("sep"), Value::str("-"))],
        )
        .unwrap();
        assert_eq!(rt.take_output(), "1-a\n");
    }

    #[test]
    fn test_constructors() {
        let rt = Runtime::new();
        let int = construct(&rt, TypeId::INT, &[Value::str(" -42 ")], &[]).unwrap();
        assert!(int.py_eq(&Value::Int(-42)));
        let hex = construct(&rt, TypeId::INT, &[Value::str("ff"), Value::Int(16)], &[]).unwrap();
        assert!(hex.py_eq(&Value::Int(255)));
        assert!(construct(&rt, TypeId::INT, &[Value::str("x")], &[]).is_err());
        let r = construct(&rt, TypeId::RANGE, &[Value::Int(1), Value::Int(7), Value::Int(2)], &[]).unwrap();
        assert_eq!(rt.repr(&construct(&rt, TypeId::LIST, &[r], &[]).unwrap()).unwrap(), "[1, 3, 5]");
        let exc = construct(&rt, TypeId::VALUE_ERROR, &[Value::str("bad")], &[]).unwrap();
        assert_eq!(rt.to_str(&exc).unwrap(), "bad");
        assert!(construct(&rt, TypeId::NONE, &[], &[]).is_err());
    }

    #[test]
    fn test_string_methods() {
        let rt = Runtime::new();
        let s = Value::str("  hello world ");
        let stripped = call_type_method(&rt, &s, "strip", &[]).unwrap();
        assert!(stripped.py_eq(&Value::str("hello world")));
        let title = call_type_method(&rt, &stripped, "title", &[]).unwrap();
        assert!(title.py_eq(&Value::str("Hello World")));
        let parts = call_type_method(&rt, &stripped, "split", &[]).unwrap();
        let joined = call_type_method(&rt, &Value::str(","), "join", &[parts]).unwrap();
        assert!(joined.py_eq(&Value::str("hello,world")));
        let at = call_type_method(&rt, &stripped, "find", &[Value::str("world")]).unwrap();
        assert!(at.py_eq(&Value::Int(6)));
    }

    #[test]
    fn test_list_and_dict_methods() {
        let rt = Runtime::new();
        let list = Value::list(vec![Value::Int(2), Value::Int(1)]);
        call_type_method(&rt, &list, "append", &[Value::Int(0)]).unwrap();
        call_type_method(&rt, &list, "sort", &[]).unwrap();
        assert_eq!(rt.repr(&list).unwrap(), "[0, 1, 2]");
        let popped = call_type_method(&rt, &list, "pop", &[]).unwrap();
        assert!(popped.py_eq(&Value::Int(2)));

        let d = Value::dict(vec![(Value::str("a"), Value::Int(1))]);
        let missing = call_type_method(&rt, &d, "get", &[Value::str("b"), Value::Int(0)]).unwrap();
        assert!(missing.py_eq(&Value::Int(0)));
        let err = call_type_method(&rt, &d, "pop", &[Value::str("b")]).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::KEY_ERROR);
    }

    #[test]
    fn test_dunders_route_through_operators() {
        let rt = Runtime::new();
        let v = call_type_method(&rt, &Value::Int(2), "__radd__", &[Value::Float(0.5)]).unwrap();
        assert!(v.py_eq(&Value::Float(2.5)));
        let lt = call_type_method(&rt, &Value::str("a"), "__lt__", &[Value::str("b")]).unwrap();
        assert!(lt.truthy());
        let err = call_type_method(&rt, &Value::Int(1), "frobnicate", &[]).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::ATTRIBUTE_ERROR);
    }

    #[test]
    fn test_hash_agrees_with_equality() {
        let rt = Runtime::new();
        assert_eq!(hash(&rt, &Value::Int(1)).unwrap(), hash(&rt, &Value::Float(1.0)).unwrap());
        assert_eq!(hash(&rt, &Value::Bool(true)).unwrap(), 1);
        assert!(hash(&rt, &Value::list(Vec::new())).is_err());
    }
}
