//! The runtime context.
//!
//! A [`Runtime`] owns the type model, the translator, the cache of
//! translated programs, the global scope and the captured output. Every
//! operation of the interpreter takes it by shared reference; it is `Sync`,
//! so generators may be driven from several threads.
//!
//! Programs are cached per code object and signature. Translation happens
//! on the first call and never again for the same pair.

use crate::builtins;
use crate::error::{RunResult, RuntimeError};
use crate::exception::ExceptionObject;
use crate::frame::{Exit, Frame};
use crate::function::Function;
use crate::generator::Generator;
use crate::ops;
use crate::program::{Program, ProgramEmitter};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use quill_bytecode::CodeObject;
use quill_compiler::{CallSignature, FunctionId, TranslationCache, Translator, TranslatorConfig};
use quill_types::{GlobalBinding, TypeId, TypeModel};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Shared state of an interpreter instance.
pub struct Runtime {
    translator: Translator,
    programs: TranslationCache<Program>,
    /// Module-level bindings. Builtins are not stored here.
    globals: RwLock<FxHashMap<Arc<str>, Value>>,
    output: Mutex<String>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("programs", &self.programs.len())
            .field("globals", &self.globals.read().len())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime over the builtin type model, configured from the environment.
    pub fn new() -> Self {
        Self::with_config(Arc::new(TypeModel::with_builtins()), TranslatorConfig::from_env())
    }

    pub fn with_config(model: Arc<TypeModel>, config: TranslatorConfig) -> Self {
        Self {
            translator: Translator::with_config(model, config),
            programs: TranslationCache::new(),
            globals: RwLock::new(FxHashMap::default()),
            output: Mutex::new(String::new()),
        }
    }

    #[inline]
    pub fn model(&self) -> &TypeModel {
        self.translator.model()
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// Number of programs translated so far.
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// The program for `code` under `signature`, translating it once.
    pub fn program(&self, code: &Arc<CodeObject>, signature: &CallSignature) -> RunResult<Arc<Program>> {
        let id = FunctionId::of(code).for_signature(signature);
        let program = self.programs.get_or_try_insert_with(id, code, || {
            debug!(function = %code.qualname, %id, "translating");
            self.translator.translate(code, signature, &mut ProgramEmitter::new())
        })?;
        Ok(program)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// A function value over `code` with a dynamic signature.
    pub fn function(&self, code: &Arc<CodeObject>) -> Value {
        Value::Function(Arc::new(Function::new(Arc::clone(code))))
    }

    /// Run a module-level code object.
    pub fn run(&self, code: &Arc<CodeObject>) -> RunResult<Value> {
        self.call(&self.function(code), &[])
    }

    pub fn call(&self, callee: &Value, args: &[Value]) -> RunResult<Value> {
        self.call_kw(callee, args, &[])
    }

    /// Call with keyword arguments.
    pub fn call_kw(&self, callee: &Value, args: &[Value], kwargs: &[(Arc<str>, Value)]) -> RunResult<Value> {
        match callee {
            Value::Function(f) => self.call_function(f, args, kwargs),
            Value::Class(ty) => builtins::construct(self, *ty, args, kwargs),
            Value::Builtin(name) => builtins::call_builtin(self, name, args, kwargs),
            Value::Method(m) => match &m.receiver {
                Value::Native(n) => {
                    self.reject_kwargs(&m.name, kwargs)?;
                    n.call_method(self, &m.name, args)
                }
                receiver => builtins::call_type_method_kw(self, receiver, &m.name, args, kwargs),
            },
            Value::Native(n) => {
                self.reject_kwargs(n.type_name(), kwargs)?;
                n.call(self, args)
            }
            other => Err(self.type_error(format!(
                "'{}' object is not callable",
                other.type_name(self.model())
            ))),
        }
    }

    fn call_function(&self, f: &Arc<Function>, args: &[Value], kwargs: &[(Arc<str>, Value)]) -> RunResult<Value> {
        let program = self.program(&f.code, &f.signature)?;
        let locals = f.bind(self, args, kwargs)?;
        let is_generator = program.is_generator();
        let mut frame = Frame::new(self, program, f, locals)?;
        if is_generator {
            return Ok(Value::Generator(Arc::new(Generator::new(frame))));
        }
        match frame.run(self)? {
            Exit::Return(value) => Ok(value),
            Exit::Yield(_) => Err(self.internal(&f.qualname, 0, "a plain function yielded")),
        }
    }

    fn reject_kwargs(&self, name: &str, kwargs: &[(Arc<str>, Value)]) -> RunResult<()> {
        if kwargs.is_empty() {
            Ok(())
        } else {
            Err(self.type_error(format!("{}() takes no keyword arguments", name)))
        }
    }

    /// Call method `name` on `receiver`.
    pub fn call_method(&self, receiver: &Value, name: &str, args: &[Value]) -> RunResult<Value> {
        match receiver {
            Value::Native(n) if n.has_method(name) => n.call_method(self, name, args),
            _ if builtins::has_type_method(self, receiver, name) => {
                builtins::call_type_method(self, receiver, name, args)
            }
            _ => {
                let attr = self.get_attr(receiver, name)?;
                self.call(&attr, args)
            }
        }
    }

    // =========================================================================
    // Globals
    // =========================================================================

    pub fn set_global(&self, name: impl Into<Arc<str>>, value: Value) {
        self.globals.write().insert(name.into(), value);
    }

    /// A module-level binding, ignoring builtins.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.read().get(name).cloned()
    }

    /// Resolve a global name, falling back to builtins.
    pub fn load_global(&self, name: &Arc<str>) -> RunResult<Value> {
        if let Some(v) = self.global(name) {
            return Ok(v);
        }
        match self.model().lookup_global(name) {
            Some(GlobalBinding::Class(ty)) => Ok(Value::Class(ty)),
            Some(GlobalBinding::Function) => Ok(Value::Builtin(Arc::clone(name))),
            None => Err(self.name_error(name)),
        }
    }

    pub fn delete_global(&self, name: &str) -> RunResult<()> {
        match self.globals.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(self.name_error(name)),
        }
    }

    fn name_error(&self, name: &str) -> RuntimeError {
        self.error(TypeId::NAME_ERROR, format!("name '{}' is not defined", name))
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn get_attr(&self, obj: &Value, name: &str) -> RunResult<Value> {
        if let Value::Native(n) = obj {
            if let Some(v) = n.get_attr(self, name)? {
                return Ok(v);
            }
            if n.has_method(name) {
                return Ok(Value::bound(obj.clone(), name));
            }
        }
        if let Some(v) = builtins::get_attr(self, obj, name) {
            return Ok(v);
        }
        if builtins::has_type_method(self, obj, name) {
            return Ok(Value::bound(obj.clone(), name));
        }
        Err(self.attribute_error(obj.type_name(self.model()), name))
    }

    pub fn set_attr(&self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        if let Value::Native(n) = obj {
            if n.set_attr(self, name, value)? {
                return Ok(());
            }
        }
        Err(self.attribute_error(obj.type_name(self.model()), name))
    }

    /// Look a special method up on the type, bypassing data attributes.
    pub fn special(&self, receiver: &Value, name: &str) -> RunResult<Value> {
        let found = match receiver {
            Value::Native(n) => n.has_method(name),
            other => builtins::has_type_method(self, other, name),
        };
        if found {
            Ok(Value::bound(receiver.clone(), name))
        } else {
            Err(self.error(TypeId::ATTRIBUTE_ERROR, name))
        }
    }

    // =========================================================================
    // Iteration and Conversion
    // =========================================================================

    pub fn iter(&self, v: &Value) -> RunResult<Value> {
        ops::iter(self, v)
    }

    /// Advance an iterator; `None` once it is exhausted.
    pub fn next(&self, it: &Value) -> RunResult<Option<Value>> {
        ops::next(self, it)
    }

    /// Drain an iterable into a vector.
    pub fn collect(&self, iterable: &Value) -> RunResult<Vec<Value>> {
        match iterable {
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::List(list) => Ok(list.lock().clone()),
            _ => {
                let it = self.iter(iterable)?;
                let mut items = Vec::new();
                while let Some(item) = self.next(&it)? {
                    items.push(item);
                }
                Ok(items)
            }
        }
    }

    pub fn truthy(&self, v: &Value) -> RunResult<bool> {
        match v {
            Value::Native(n) if n.has_method("__bool__") => match n.call_method(self, "__bool__", &[])? {
                Value::Bool(b) => Ok(b),
                other => Err(self.type_error(format!(
                    "__bool__ should return bool, returned {}",
                    other.type_name(self.model())
                ))),
            },
            Value::Native(n) if n.has_method("__len__") => Ok(ops::len(self, v)? != 0),
            other => Ok(other.truthy()),
        }
    }

    pub fn repr(&self, v: &Value) -> RunResult<String> {
        match v {
            Value::Native(n) if n.has_method("__repr__") => self.text_of(n.call_method(self, "__repr__", &[])?, "__repr__"),
            other => Ok(other.repr(self.model())),
        }
    }

    pub fn to_str(&self, v: &Value) -> RunResult<String> {
        match v {
            Value::Native(n) if n.has_method("__str__") => self.text_of(n.call_method(self, "__str__", &[])?, "__str__"),
            Value::Native(_) => self.repr(v),
            other => Ok(other.to_str(self.model())),
        }
    }

    fn text_of(&self, v: Value, hook: &str) -> RunResult<String> {
        match v {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(self.type_error(format!(
                "{} returned non-string (type {})",
                hook,
                other.type_name(self.model())
            ))),
        }
    }

    /// Check `v` against a declared type, widening `int` and `bool` to `float`.
    pub fn coerce(&self, v: Value, declared: TypeId) -> RunResult<Value> {
        if self.model().is_subtype(v.type_id(), declared) {
            return Ok(v);
        }
        match (&v, declared) {
            (Value::Int(_) | Value::Bool(_), TypeId::FLOAT) => Ok(Value::Float(v.as_f64().unwrap_or_default())),
            _ => Err(self.type_error(format!(
                "expected {}, got {}",
                self.model().name(declared),
                v.type_name(self.model())
            ))),
        }
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// A fresh exception instance.
    pub fn exception(&self, ty: TypeId, args: Vec<Value>) -> Arc<ExceptionObject> {
        ExceptionObject::new(self.model(), ty, args)
    }

    /// Raise `ty(*args)`.
    pub fn raise(&self, ty: TypeId, args: Vec<Value>) -> RuntimeError {
        RuntimeError::Exception(self.exception(ty, args))
    }

    /// Raise `ty(message)`.
    pub fn error(&self, ty: TypeId, message: impl Into<Arc<str>>) -> RuntimeError {
        RuntimeError::Exception(ExceptionObject::with_message(self.model(), ty, message))
    }

    pub fn type_error(&self, message: impl Into<Arc<str>>) -> RuntimeError {
        self.error(TypeId::TYPE_ERROR, message)
    }

    pub fn attribute_error(&self, type_name: &str, attr: &str) -> RuntimeError {
        self.error(
            TypeId::ATTRIBUTE_ERROR,
            format!("'{}' object has no attribute '{}'", type_name, attr),
        )
    }

    pub fn internal(&self, function: &Arc<str>, offset: u32, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Internal {
            function: Arc::clone(function),
            offset,
            message: message.into(),
        }
    }

    /// The exception raised by `raise v`: an instance, or a class called
    /// with no arguments.
    pub fn make_exception(&self, v: &Value) -> RunResult<Arc<ExceptionObject>> {
        match v {
            Value::Exception(exc) => Ok(Arc::clone(exc)),
            Value::Class(ty) if self.model().is_exception(*ty) => Ok(self.exception(*ty, Vec::new())),
            _ => Err(self.type_error("exceptions must derive from BaseException")),
        }
    }

    /// Whether the exception `raised` is caught by the class or tuple of
    /// classes `handler`.
    pub fn exception_matches(&self, raised: &Value, handler: &Value) -> RunResult<bool> {
        let raised_ty = match raised {
            Value::Exception(exc) => exc.ty,
            Value::Class(ty) => *ty,
            other => other.type_id(),
        };
        match handler {
            Value::Class(ty) if self.model().is_exception(*ty) => Ok(self.model().is_subtype(raised_ty, *ty)),
            Value::Tuple(handlers) => {
                for h in handlers.iter() {
                    if self.exception_matches(raised, h)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(self.type_error("catching classes that do not inherit from BaseException is not allowed")),
        }
    }

    /// Whether `err` is a `StopIteration`, as a generator outcome or raised.
    pub fn is_stop_iteration(&self, err: &RuntimeError) -> bool {
        match err {
            RuntimeError::StopIteration(_) => true,
            RuntimeError::Exception(exc) => self.model().is_subtype(exc.ty, TypeId::STOP_ITERATION),
            _ => false,
        }
    }

    /// Turn an error into the exception interpreted code can catch.
    ///
    /// Translation and internal failures are not catchable and come back
    /// unchanged as the error.
    pub fn catchable(&self, err: RuntimeError) -> RunResult<Arc<ExceptionObject>> {
        match err {
            RuntimeError::Exception(exc) => Ok(exc),
            RuntimeError::StopIteration(value) => Ok(self.exception(TypeId::STOP_ITERATION, value.into_iter().collect())),
            RuntimeError::AlreadyRunning => Ok(ExceptionObject::with_message(
                self.model(),
                TypeId::VALUE_ERROR,
                "generator already executing",
            )),
            fatal => Err(fatal),
        }
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Append text to the captured output.
    pub fn write(&self, text: &str) {
        self.output.lock().push_str(text);
    }

    pub fn write_line(&self, line: String) {
        let mut out = self.output.lock();
        out.push_str(&line);
        out.push('\n');
    }

    /// Everything written so far.
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    /// Everything written so far, clearing the buffer.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{CodeBuilder, Constant, Opcode};

    fn constant_function(value: i64) -> Arc<CodeObject> {
        let mut b = CodeBuilder::new("k");
        b.load_const(Constant::Int(value));
        b.emit_op(Opcode::ReturnValue);
        Arc::new(b.finish().unwrap())
    }

    #[test]
    fn test_programs_are_translated_once() {
        let rt = Runtime::new();
        let code = constant_function(7);
        let f = rt.function(&code);
        assert!(rt.call(&f, &[]).unwrap().py_eq(&Value::Int(7)));
        assert!(rt.call(&f, &[]).unwrap().py_eq(&Value::Int(7)));
        assert_eq!(rt.program_count(), 1);
    }

    #[test]
    fn test_same_name_different_constants_run_their_own_program() {
        let rt = Runtime::new();
        let first = {
            let mut b = CodeBuilder::new("main");
            b.load_const(Constant::Int(1));
            b.emit_op(Opcode::ReturnValue);
            Arc::new(b.finish().unwrap())
        };
        let second = {
            let mut b = CodeBuilder::new("main");
            b.load_const(Constant::str("x"));
            b.emit_op(Opcode::ReturnValue);
            Arc::new(b.finish().unwrap())
        };
        assert_eq!(first.code, second.code);
        assert!(rt.run(&first).unwrap().py_eq(&Value::Int(1)));
        assert!(rt.run(&second).unwrap().py_eq(&Value::str("x")));
        assert!(rt.run(&first).unwrap().py_eq(&Value::Int(1)));
        assert_eq!(rt.program_count(), 2);
    }

    #[test]
    fn test_globals_shadow_builtins() {
        let rt = Runtime::new();
        let len: Arc<str> = Arc::from("len");
        assert!(matches!(rt.load_global(&len).unwrap(), Value::Builtin(_)));
        rt.set_global("len", Value::Int(3));
        assert!(rt.load_global(&len).unwrap().py_eq(&Value::Int(3)));
        rt.delete_global("len").unwrap();
        assert!(matches!(rt.load_global(&len).unwrap(), Value::Builtin(_)));

        let err = rt.load_global(&Arc::from("nope")).unwrap_err();
        assert_eq!(err.to_string(), "NameError: name 'nope' is not defined");
    }

    #[test]
    fn test_bound_methods_of_builtin_values() {
        let rt = Runtime::new();
        let upper = rt.get_attr(&Value::str("abc"), "upper").unwrap();
        assert!(rt.call(&upper, &[]).unwrap().py_eq(&Value::str("ABC")));
        let err = rt.get_attr(&Value::Int(1), "upper").unwrap_err();
        assert_eq!(err.to_string(), "AttributeError: 'int' object has no attribute 'upper'");
    }

    #[test]
    fn test_exception_matching() {
        let rt = Runtime::new();
        let raised = Value::Exception(rt.exception(TypeId::KEY_ERROR, Vec::new()));
        assert!(rt.exception_matches(&raised, &Value::Class(TypeId::LOOKUP_ERROR)).unwrap());
        assert!(!rt.exception_matches(&raised, &Value::Class(TypeId::VALUE_ERROR)).unwrap());
        let both = Value::tuple([Value::Class(TypeId::VALUE_ERROR), Value::Class(TypeId::KEY_ERROR)]);
        assert!(rt.exception_matches(&raised, &both).unwrap());
        assert!(rt.exception_matches(&raised, &Value::Class(TypeId::INT)).is_err());
    }

    #[test]
    fn test_coerce_widens_to_float() {
        let rt = Runtime::new();
        assert!(matches!(rt.coerce(Value::Int(2), TypeId::FLOAT).unwrap(), Value::Float(x) if x == 2.0));
        assert!(rt.coerce(Value::Bool(true), TypeId::INT).is_ok());
        assert!(rt.coerce(Value::str("x"), TypeId::INT).is_err());
        assert!(rt.coerce(Value::None, TypeId::OBJECT).is_ok());
    }

    #[test]
    fn test_catchable_keeps_internal_errors_fatal() {
        let rt = Runtime::new();
        let stop = rt.catchable(RuntimeError::StopIteration(Some(Value::Int(4)))).unwrap();
        assert_eq!(stop.ty, TypeId::STOP_ITERATION);
        assert!(stop.args[0].py_eq(&Value::Int(4)));
        let busy = rt.catchable(RuntimeError::AlreadyRunning).unwrap();
        assert_eq!(busy.ty, TypeId::VALUE_ERROR);
        let internal = rt.internal(&Arc::from("f"), 3, "broken");
        assert!(matches!(rt.catchable(internal), Err(RuntimeError::Internal { offset: 3, .. })));
    }
}
