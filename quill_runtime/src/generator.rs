//! Generator objects.
//!
//! A generator is a translated state machine plus its saved frame. The
//! protocol is `has_next`/`next`/`send`/`throw_value`/`close`:
//!
//! ```text
//!   Created ──next/send──▶ Suspended ◀──┐
//!      │                      │  next/send/throw
//!      │ throw                ├──────────┘
//!      ▼                      ▼ return / escaping exception
//!   Exhausted ◀───────────────┘
//! ```
//!
//! The generator is not reentrant. Every entry point takes the state lock
//! with `try_lock` and keeps it while the frame runs, so a nested or
//! concurrent resumption fails with [`RuntimeError::AlreadyRunning`] instead
//! of blocking.

use crate::error::{RunResult, RuntimeError};
use crate::frame::{Exit, Frame, Resumption, SavedFrame};
use crate::runtime::Runtime;
use crate::value::Value;
use parking_lot::Mutex;
use quill_types::TypeId;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

enum Progress {
    /// Not started; the frame holds the bound arguments.
    Created(Box<Frame>),
    Suspended(SavedFrame),
    Exhausted,
}

struct GeneratorState {
    progress: Progress,
    /// Outcome computed ahead of time by `has_next`.
    lookahead: Option<RunResult<Value>>,
}

/// A running instance of a generator function.
pub struct Generator {
    name: Arc<str>,
    state: Mutex<GeneratorState>,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator").field("name", &self.name).finish()
    }
}

impl Generator {
    /// A generator over a frame that has not run yet.
    pub fn new(frame: Frame) -> Self {
        Self {
            name: Arc::clone(frame.program().name()),
            state: Mutex::new(GeneratorState {
                progress: Progress::Created(Box::new(frame)),
                lookahead: None,
            }),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Whether the generator has finished. A running generator is not.
    pub fn is_exhausted(&self) -> bool {
        self.state
            .try_lock()
            .is_some_and(|state| state.lookahead.is_none() && matches!(state.progress, Progress::Exhausted))
    }

    // =========================================================================
    // Protocol
    // =========================================================================

    /// Whether `next` will produce a value. Runs the generator ahead and
    /// buffers the outcome.
    pub fn has_next(&self, rt: &Runtime) -> RunResult<bool> {
        let mut state = self.state.try_lock().ok_or(RuntimeError::AlreadyRunning)?;
        if state.lookahead.is_none() {
            let outcome = self.step(rt, &mut state, Resumption::Send(Value::None));
            state.lookahead = Some(outcome);
        }
        Ok(!matches!(state.lookahead, Some(Err(RuntimeError::StopIteration(_)))))
    }

    /// Resume with `None`.
    pub fn next(&self, rt: &Runtime) -> RunResult<Value> {
        self.send(rt, Value::None)
    }

    /// Resume, making `value` the result of the pending yield.
    ///
    /// A buffered outcome from `has_next` is returned first and `value` is
    /// dropped, as is the value sent to a generator that has not started.
    pub fn send(&self, rt: &Runtime, value: Value) -> RunResult<Value> {
        let mut state = self.state.try_lock().ok_or(RuntimeError::AlreadyRunning)?;
        if let Some(outcome) = state.lookahead.take() {
            return outcome;
        }
        self.step(rt, &mut state, Resumption::Send(value))
    }

    /// Raise `exception` at the suspension point.
    ///
    /// `exception` is an exception instance or class. Any outcome buffered by
    /// `has_next` is discarded.
    pub fn throw_value(&self, rt: &Runtime, exception: &Value) -> RunResult<Value> {
        let exc = rt.make_exception(exception)?;
        let mut state = self.state.try_lock().ok_or(RuntimeError::AlreadyRunning)?;
        state.lookahead = None;
        self.step(rt, &mut state, Resumption::Throw(exc))
    }

    /// Raise `GeneratorExit` at the suspension point and finish.
    pub fn close(&self, rt: &Runtime) -> RunResult<()> {
        let mut state = self.state.try_lock().ok_or(RuntimeError::AlreadyRunning)?;
        state.lookahead = None;
        if !matches!(state.progress, Progress::Suspended(_)) {
            state.progress = Progress::Exhausted;
            return Ok(());
        }
        let exit = rt.exception(TypeId::GENERATOR_EXIT, Vec::new());
        match self.step(rt, &mut state, Resumption::Throw(exit)) {
            Ok(_) => {
                state.progress = Progress::Exhausted;
                Err(rt.error(TypeId::RUNTIME_ERROR, "generator ignored GeneratorExit"))
            }
            Err(RuntimeError::StopIteration(_)) => Ok(()),
            Err(RuntimeError::Exception(exc)) if exc.ty == TypeId::GENERATOR_EXIT => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Run the frame once. The state lock is held by the caller.
    fn step(&self, rt: &Runtime, state: &mut GeneratorState, resumption: Resumption) -> RunResult<Value> {
        let mut frame = match std::mem::replace(&mut state.progress, Progress::Exhausted) {
            Progress::Created(frame) => match resumption {
                Resumption::Send(_) => *frame,
                Resumption::Throw(exc) => return Err(RuntimeError::Exception(exc)),
            },
            Progress::Suspended(saved) => Frame::resume(saved, resumption),
            Progress::Exhausted => {
                return match resumption {
                    Resumption::Send(_) => Err(RuntimeError::StopIteration(None)),
                    Resumption::Throw(exc) => Err(RuntimeError::Exception(exc)),
                };
            }
        };
        match frame.run(rt) {
            Ok(Exit::Yield(value)) => {
                let saved = frame.suspend()?;
                trace!(generator = %self.name, state = saved.state(), "suspended");
                state.progress = Progress::Suspended(saved);
                Ok(value)
            }
            Ok(Exit::Return(value)) => {
                trace!(generator = %self.name, "exhausted");
                Err(RuntimeError::StopIteration(Some(value)))
            }
            Err(err) if rt.is_stop_iteration(&err) => {
                Err(rt.error(TypeId::RUNTIME_ERROR, "generator raised StopIteration"))
            }
            Err(err) => Err(err),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{CodeBuilder, CodeFlags, Constant, Opcode};

    /// `def g(): yield 1; yield 2; return 3`
    fn two_yields(rt: &Runtime) -> Arc<Generator> {
        let mut b = CodeBuilder::new("g");
        b.add_flags(CodeFlags::GENERATOR);
        b.emit_op(Opcode::GenStart);
        for i in 1..=2 {
            b.load_const(Constant::Int(i));
            b.emit_op(Opcode::YieldValue);
            b.emit_op(Opcode::PopTop);
        }
        b.load_const(Constant::Int(3));
        b.emit_op(Opcode::ReturnValue);
        let code = Arc::new(b.finish().unwrap());
        match rt.call(&rt.function(&code), &[]).unwrap() {
            Value::Generator(g) => g,
            other => panic!("expected a generator, got {:?}", other),
        }
    }

    #[test]
    fn test_yields_then_returns() {
        let rt = Runtime::new();
        let g = two_yields(&rt);
        assert!(g.next(&rt).unwrap().py_eq(&Value::Int(1)));
        assert!(g.next(&rt).unwrap().py_eq(&Value::Int(2)));
        match g.next(&rt) {
            Err(RuntimeError::StopIteration(Some(v))) => assert!(v.py_eq(&Value::Int(3))),
            other => panic!("unexpected {:?}", other),
        }
        assert!(g.is_exhausted());
        assert!(matches!(g.next(&rt), Err(RuntimeError::StopIteration(None))));
    }

    #[test]
    fn test_has_next_buffers_one_outcome() {
        let rt = Runtime::new();
        let g = two_yields(&rt);
        assert!(g.has_next(&rt).unwrap());
        assert!(g.has_next(&rt).unwrap());
        assert!(g.next(&rt).unwrap().py_eq(&Value::Int(1)));
        assert!(g.next(&rt).unwrap().py_eq(&Value::Int(2)));
        assert!(!g.has_next(&rt).unwrap());
        assert!(matches!(g.next(&rt), Err(RuntimeError::StopIteration(Some(_)))));
    }

    #[test]
    fn test_throw_before_start_exhausts() {
        let rt = Runtime::new();
        let g = two_yields(&rt);
        let err = g.throw_value(&rt, &Value::Class(TypeId::VALUE_ERROR)).unwrap_err();
        assert_eq!(err.exception().unwrap().ty, TypeId::VALUE_ERROR);
        assert!(g.is_exhausted());
    }

    #[test]
    fn test_close_suspended_generator() {
        let rt = Runtime::new();
        let g = two_yields(&rt);
        g.next(&rt).unwrap();
        g.close(&rt).unwrap();
        assert!(g.is_exhausted());
        assert!(matches!(g.next(&rt), Err(RuntimeError::StopIteration(None))));
    }
}
