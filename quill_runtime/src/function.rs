//! Function objects and argument binding.

use crate::error::RunResult;
use crate::runtime::Runtime;
use crate::value::{Cell, Value, dict};
use quill_bytecode::{CodeFlags, CodeObject};
use quill_compiler::CallSignature;
use quill_types::TypeId;
use std::fmt;
use std::sync::Arc;

/// A function made by `MAKE_FUNCTION`, or by the host from a code object.
pub struct Function {
    pub code: Arc<CodeObject>,
    pub qualname: Arc<str>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Arc<[Value]>,
    pub kwdefaults: Vec<(Value, Value)>,
    /// Free variable cells, in `co_freevars` order.
    pub closure: Arc<[Cell]>,
    /// The signature the body is translated against.
    pub signature: CallSignature,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("qualname", &self.qualname)
            .field("signature", &self.signature)
            .finish()
    }
}

impl Function {
    /// A plain function over `code` with a dynamic signature.
    pub fn new(code: Arc<CodeObject>) -> Self {
        Self {
            qualname: code.qualname.clone(),
            code,
            defaults: Arc::from(Vec::new()),
            kwdefaults: Vec::new(),
            closure: Arc::from(Vec::new()),
            signature: CallSignature::dynamic(),
        }
    }

    pub fn with_signature(mut self, signature: CallSignature) -> Self {
        self.signature = signature;
        self
    }

    /// Derive the signature from an annotations tuple.
    ///
    /// The tuple alternates names and annotations. Only annotations that are
    /// builtin classes narrow a type; anything else stays `object`.
    pub fn signature_from_annotations(code: &CodeObject, annotations: &[Value]) -> CallSignature {
        let mut params = vec![TypeId::OBJECT; code.total_params()];
        let mut ret = TypeId::OBJECT;
        for pair in annotations.chunks_exact(2) {
            let (Some(name), Value::Class(ty)) = (pair[0].as_str(), &pair[1]) else {
                continue;
            };
            if &**name == "return" {
                ret = *ty;
            } else if let Some(slot) = code.varnames.iter().take(code.total_params()).position(|v| v == name) {
                params[slot] = *ty;
            }
        }
        CallSignature::new(&params, ret)
    }

    /// Bind call arguments to the fast local slots.
    ///
    /// Returns the initial locals: parameters filled, everything else unset.
    pub fn bind(&self, rt: &Runtime, args: &[Value], kwargs: &[(Arc<str>, Value)]) -> RunResult<Vec<Option<Value>>> {
        let code = &*self.code;
        let name = &self.qualname;
        let positional = code.arg_count as usize;
        let kwonly = code.kwonlyarg_count as usize;
        if code.local_count() < code.total_params() {
            return Err(rt.internal(name, 0, "fewer locals than parameters"));
        }
        let mut locals: Vec<Option<Value>> = vec![None; code.local_count()];

        let mut next = positional + kwonly;
        let varargs = code.flags.contains(CodeFlags::VARARGS).then(|| {
            next += 1;
            next - 1
        });
        let varkw = code.flags.contains(CodeFlags::VARKEYWORDS).then_some(next);

        for (slot, arg) in locals.iter_mut().zip(args.iter().take(positional)) {
            *slot = Some(arg.clone());
        }
        let extra: Vec<Value> = args.iter().skip(positional).cloned().collect();
        match varargs {
            Some(slot) => locals[slot] = Some(Value::Tuple(extra.into())),
            None if !extra.is_empty() => {
                return Err(rt.type_error(format!(
                    "{}() takes {} positional arguments but {} were given",
                    name,
                    positional,
                    args.len()
                )));
            }
            None => {}
        }

        let mut extra_kw = Vec::new();
        let keyword_slots = code.posonlyarg_count as usize..positional + kwonly;
        for (key, value) in kwargs {
            let slot = keyword_slots.clone().find(|&i| code.varnames[i] == *key);
            match slot {
                Some(i) if locals[i].is_some() => {
                    return Err(rt.type_error(format!("{}() got multiple values for argument '{}'", name, key)));
                }
                Some(i) => locals[i] = Some(value.clone()),
                None if varkw.is_some() => extra_kw.push((Value::Str(key.clone()), value.clone())),
                None => {
                    return Err(rt.type_error(format!("{}() got an unexpected keyword argument '{}'", name, key)));
                }
            }
        }
        if let Some(slot) = varkw {
            locals[slot] = Some(Value::dict(extra_kw));
        }

        let first_default = positional.saturating_sub(self.defaults.len());
        for i in 0..positional + kwonly {
            if locals[i].is_some() {
                continue;
            }
            let default = if i < positional {
                i.checked_sub(first_default).and_then(|d| self.defaults.get(d)).cloned()
            } else {
                dict::lookup(&self.kwdefaults, &Value::Str(code.varnames[i].clone()))
            };
            match default {
                Some(v) => locals[i] = Some(v),
                None => {
                    return Err(rt.type_error(format!(
                        "{}() missing required argument '{}'",
                        name, code.varnames[i]
                    )));
                }
            }
        }

        self.check_params(rt, &mut locals)?;
        Ok(locals)
    }

    /// Enforce declared parameter types, widening `int` to `float`.
    fn check_params(&self, rt: &Runtime, locals: &mut [Option<Value>]) -> RunResult<()> {
        for (slot, &declared) in self.signature.params.iter().enumerate() {
            let Some(Some(value)) = locals.get_mut(slot) else {
                continue;
            };
            match rt.coerce(value.clone(), declared) {
                Ok(coerced) => *value = coerced,
                Err(_) => {
                    return Err(rt.type_error(format!(
                        "{}() argument '{}' must be {}, not {}",
                        self.qualname,
                        self.code.varnames[slot],
                        rt.model().name(declared),
                        value.type_name(rt.model())
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::CodeBuilder;

    fn code(params: &[&str], flags: CodeFlags, kwonly: u16) -> Arc<CodeObject> {
        let mut b = CodeBuilder::new("f");
        b.set_params(params);
        let mut code = b.finish().unwrap();
        code.flags |= flags;
        code.kwonlyarg_count = kwonly;
        code.arg_count -= kwonly + flags.contains(CodeFlags::VARARGS) as u16 + flags.contains(CodeFlags::VARKEYWORDS) as u16;
        Arc::new(code)
    }

    #[test]
    fn test_defaults_fill_trailing_parameters() {
        let rt = Runtime::new();
        let mut f = Function::new(code(&["a", "b"], CodeFlags::empty(), 0));
        f.defaults = Arc::from(vec![Value::Int(9)]);
        let locals = f.bind(&rt, &[Value::Int(1)], &[]).unwrap();
        assert!(locals[1].as_ref().unwrap().py_eq(&Value::Int(9)));

        let err = f.bind(&rt, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("missing required argument 'a'"));
    }

    #[test]
    fn test_varargs_and_keywords() {
        let rt = Runtime::new();
        let f = Function::new(code(&["a", "args", "kw"], CodeFlags::VARARGS | CodeFlags::VARKEYWORDS, 0));
        let locals = f
            .bind(&rt, &[Value::Int(1), Value::Int(2)], &[(Arc::from("z"), Value::None)])
            .unwrap();
        assert!(matches!(&locals[1], Some(Value::Tuple(t)) if t.len() == 1));
        assert!(matches!(&locals[2], Some(Value::Dict(d)) if d.lock().len() == 1));
    }

    #[test]
    fn test_keyword_binding_errors() {
        let rt = Runtime::new();
        let f = Function::new(code(&["a"], CodeFlags::empty(), 0));
        assert!(f.bind(&rt, &[], &[(Arc::from("a"), Value::None)]).is_ok());
        let dup = f.bind(&rt, &[Value::None], &[(Arc::from("a"), Value::None)]).unwrap_err();
        assert!(dup.to_string().contains("multiple values"));
        let unknown = f.bind(&rt, &[Value::None], &[(Arc::from("q"), Value::None)]).unwrap_err();
        assert!(unknown.to_string().contains("unexpected keyword"));
    }

    #[test]
    fn test_annotations_narrow_signature() {
        let code = code(&["x", "y"], CodeFlags::empty(), 0);
        let annotations = [
            Value::str("x"),
            Value::Class(TypeId::FLOAT),
            Value::str("return"),
            Value::Class(TypeId::STR),
        ];
        let sig = Function::signature_from_annotations(&code, &annotations);
        assert_eq!(sig.params, vec![TypeId::FLOAT, TypeId::OBJECT]);
        assert_eq!(sig.ret, TypeId::STR);

        let rt = Runtime::new();
        let f = Function::new(code).with_signature(sig);
        let locals = f.bind(&rt, &[Value::Int(2), Value::None], &[]).unwrap();
        assert!(matches!(locals[0], Some(Value::Float(x)) if x == 2.0));
        assert!(f.bind(&rt, &[Value::str("no"), Value::None], &[]).is_err());
    }
}
