//! Exception objects and the handled-exception triple.
//!
//! # Stack Layout
//!
//! Entering a handler pushes two triples, each `(traceback, value, type)`
//! bottom to top:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┐
//! │  prefix ...  │ saved triple │ active triple│
//! │  (level)     │ (exc_info)   │ (raised)     │
//! └──────────────┴──────────────┴──────────────┘
//! ```
//!
//! The saved triple is what `POP_EXCEPT` restores into [`ExcInfo`].

use crate::value::Value;
use parking_lot::Mutex;
use quill_types::{TypeId, TypeModel};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Traceback
// =============================================================================

/// One frame an exception passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub function: Arc<str>,
    /// Offset in the translated instruction list.
    pub offset: u32,
    pub line: Option<u32>,
}

// =============================================================================
// Exception Object
// =============================================================================

/// An instance of a `BaseException` subclass.
pub struct ExceptionObject {
    pub ty: TypeId,
    pub type_name: Arc<str>,
    pub args: Arc<[Value]>,
    traceback: Mutex<Vec<TraceEntry>>,
}

impl ExceptionObject {
    pub fn new(model: &TypeModel, ty: TypeId, args: impl Into<Arc<[Value]>>) -> Arc<Self> {
        Arc::new(Self {
            ty,
            type_name: Arc::from(model.name(ty)),
            args: args.into(),
            traceback: Mutex::new(Vec::new()),
        })
    }

    /// An exception with a single string argument.
    pub fn with_message(model: &TypeModel, ty: TypeId, message: impl Into<Arc<str>>) -> Arc<Self> {
        Self::new(model, ty, vec![Value::Str(message.into())])
    }

    /// The first argument rendered as a message, if it is a string.
    pub fn message(&self) -> Option<&str> {
        match self.args.first() {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Record that the exception passed through a frame.
    pub fn record(&self, entry: TraceEntry) {
        self.traceback.lock().push(entry);
    }

    /// The frames recorded so far, innermost first.
    pub fn traceback(&self) -> Vec<TraceEntry> {
        self.traceback.lock().clone()
    }

    /// `with_traceback`: replace the recorded frames.
    pub fn replace_traceback(&self, entries: Vec<TraceEntry>) {
        *self.traceback.lock() = entries;
    }
}

impl fmt::Debug for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionObject")
            .field("type", &self.type_name)
            .field("args", &self.args)
            .finish()
    }
}

impl fmt::Display for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self.args.len()) {
            (Some(msg), 1) => write!(f, "{}: {}", self.type_name, msg),
            (_, 0) => f.write_str(&self.type_name),
            _ => write!(f, "{}{:?}", self.type_name, self.args),
        }
    }
}

// =============================================================================
// Exception Info
// =============================================================================

/// The exception currently being handled, as `sys.exc_info()` sees it.
#[derive(Debug, Clone, Default)]
pub struct ExcInfo {
    pub value: Option<Arc<ExceptionObject>>,
}

impl ExcInfo {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(exc: &Arc<ExceptionObject>) -> Self {
        Self {
            value: Some(Arc::clone(exc)),
        }
    }

    /// The triple as pushed on the operand stack: traceback, value, type.
    pub fn to_stack(&self) -> [Value; 3] {
        match &self.value {
            Some(exc) => [
                Value::Traceback(exc.traceback().into()),
                Value::Exception(Arc::clone(exc)),
                Value::Class(exc.ty),
            ],
            None => [Value::None, Value::None, Value::None],
        }
    }

    /// Read a triple back from the stack, bottom first.
    pub fn from_stack(triple: &[Value]) -> Self {
        match triple.get(1) {
            Some(Value::Exception(exc)) => Self::of(exc),
            _ => Self::empty(),
        }
    }
}
