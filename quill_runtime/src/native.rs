//! Host-provided objects.
//!
//! The runtime has no user-defined classes. Anything beyond the builtin value
//! kinds, such as a context manager or a custom iterator, is supplied by the
//! host through [`NativeObject`] and reached by ordinary attribute lookup and
//! method calls from interpreted code.

use crate::error::RunResult;
use crate::runtime::Runtime;
use crate::value::Value;
use quill_types::TypeId;
use std::fmt;
use std::sync::Arc;

/// An object implemented by the host.
pub trait NativeObject: Send + Sync + fmt::Debug {
    /// Class name shown in messages and reprs.
    fn type_name(&self) -> &str;

    /// The nearest builtin class, used for `isinstance` and for typing.
    fn runtime_type(&self) -> TypeId {
        TypeId::OBJECT
    }

    fn repr(&self) -> String {
        format!("<{} object>", self.type_name())
    }

    fn truthy(&self) -> bool {
        true
    }

    /// Whether `name` is a method of the object.
    fn has_method(&self, _name: &str) -> bool {
        false
    }

    /// Call a method reported by [`has_method`](Self::has_method).
    fn call_method(&self, rt: &Runtime, name: &str, _args: &[Value]) -> RunResult<Value> {
        Err(rt.attribute_error(self.type_name(), name))
    }

    /// Read a data attribute; `None` when there is no such attribute.
    fn get_attr(&self, _rt: &Runtime, _name: &str) -> RunResult<Option<Value>> {
        Ok(None)
    }

    /// Write a data attribute; `false` when the object has no such slot.
    fn set_attr(&self, _rt: &Runtime, _name: &str, _value: Value) -> RunResult<bool> {
        Ok(false)
    }

    /// Call the object itself.
    fn call(&self, rt: &Runtime, _args: &[Value]) -> RunResult<Value> {
        Err(rt.type_error(format!("'{}' object is not callable", self.type_name())))
    }
}

// =============================================================================
// Native Function
// =============================================================================

type NativeFn = dyn Fn(&Runtime, &[Value]) -> RunResult<Value> + Send + Sync;

/// A host function callable from interpreted code.
pub struct NativeFunction {
    name: Arc<str>,
    body: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<Arc<str>>,
        body: impl Fn(&Runtime, &[Value]) -> RunResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    /// Wrap as a value.
    pub fn into_value(self) -> Value {
        Value::Native(Arc::new(self))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).finish()
    }
}

impl NativeObject for NativeFunction {
    fn type_name(&self) -> &str {
        "builtin_function_or_method"
    }

    fn runtime_type(&self) -> TypeId {
        TypeId::FUNCTION
    }

    fn repr(&self) -> String {
        format!("<native function {}>", self.name)
    }

    fn call(&self, rt: &Runtime, args: &[Value]) -> RunResult<Value> {
        (self.body)(rt, args)
    }
}
