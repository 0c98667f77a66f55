//! Interpreter frames.
//!
//! A [`Frame`] executes one [`Program`] over an operand stack. There is no
//! block stack: `SETUP_FINALLY`/`POP_BLOCK` are elided at translation time and
//! a raised exception is routed by looking up the innermost region covering
//! the faulting offset.
//!
//! # Suspension
//!
//! A generator frame leaves [`Frame::run`] with [`Exit::Yield`]. Only the
//! state register, the live locals of that state, the operand stack, the cells
//! and the handled exception survive in a [`SavedFrame`]. Resumption builds a
//! fresh frame at offset 0 whose `ResumeDispatch` jumps straight to the
//! matching resume point.

use crate::builtins;
use crate::error::{RunResult, RuntimeError};
use crate::exception::{ExcInfo, ExceptionObject, TraceEntry};
use crate::function::Function;
use crate::ops;
use crate::program::{Program, Step};
use crate::runtime::Runtime;
use crate::value::{Cell, Value, dict, new_cell};
use quill_bytecode::{format_value, make_function};
use quill_compiler::exception::region_at;
use quill_compiler::{CallSignature, Lowering, Op};
use quill_types::TypeId;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

/// Maximum nesting of interpreted calls on one thread.
pub const MAX_RECURSION_DEPTH: usize = 500;

thread_local! {
    static DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter(rt: &Runtime) -> RunResult<Self> {
        DEPTH.with(|depth| {
            let n = depth.get();
            if n >= MAX_RECURSION_DEPTH {
                return Err(rt.error(TypeId::RUNTIME_ERROR, "maximum recursion depth exceeded"));
            }
            depth.set(n + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// =============================================================================
// Frame
// =============================================================================

/// How a frame left [`Frame::run`].
#[derive(Debug)]
pub enum Exit {
    Return(Value),
    Yield(Value),
}

/// What the caller hands a generator at a resume point.
#[derive(Debug)]
pub enum Resumption {
    Send(Value),
    Throw(Arc<ExceptionObject>),
}

/// Result of one instruction.
enum Flow {
    Next,
    Jump(u32),
    Return(Value),
    Yield(Value),
}

/// An activation of a translated function.
pub struct Frame {
    program: Arc<Program>,
    locals: Vec<Option<Value>>,
    /// Cell variables, then free variables.
    cells: Vec<Cell>,
    stack: Vec<Value>,
    pc: u32,
    /// Generator state register; 0 on entry.
    state: u32,
    exc_info: ExcInfo,
    resumption: Option<Resumption>,
}

/// The part of a suspended generator frame that outlives the suspension.
pub struct SavedFrame {
    program: Arc<Program>,
    state: u32,
    locals: SmallVec<[(u32, Value); 8]>,
    stack: Vec<Value>,
    cells: Vec<Cell>,
    exc_info: ExcInfo,
}

impl SavedFrame {
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Locals kept across the suspension, by slot.
    pub fn locals(&self) -> &[(u32, Value)] {
        &self.locals
    }
}

impl Frame {
    /// A frame for a call of `function` with already bound `locals`.
    pub fn new(rt: &Runtime, program: Arc<Program>, function: &Function, locals: Vec<Option<Value>>) -> RunResult<Self> {
        let code = &program.code;
        if function.closure.len() != code.freevars.len() {
            return Err(rt.internal(
                program.name(),
                0,
                format!("expected {} closure cells, got {}", code.freevars.len(), function.closure.len()),
            ));
        }
        let params = &code.varnames[..code.total_params().min(code.varnames.len())];
        let mut cells: Vec<Cell> = code
            .cellvars
            .iter()
            .map(|name| {
                // a parameter captured by an inner function starts in its cell
                let initial = params
                    .iter()
                    .position(|p| p == name)
                    .and_then(|slot| locals.get(slot).cloned().flatten());
                new_cell(initial)
            })
            .collect();
        cells.extend(function.closure.iter().cloned());
        Ok(Self {
            program,
            locals,
            cells,
            stack: Vec::new(),
            pc: 0,
            state: 0,
            exc_info: ExcInfo::empty(),
            resumption: None,
        })
    }

    /// Rebuild a suspended frame. Execution restarts at the dispatcher.
    pub fn resume(saved: SavedFrame, resumption: Resumption) -> Self {
        let mut locals = vec![None; saved.program.code.local_count()];
        for (slot, value) in saved.locals {
            if let Some(local) = locals.get_mut(slot as usize) {
                *local = Some(value);
            }
        }
        Self {
            program: saved.program,
            locals,
            cells: saved.cells,
            stack: saved.stack,
            pc: 0,
            state: saved.state,
            exc_info: saved.exc_info,
            resumption: Some(resumption),
        }
    }

    /// Keep what the current suspension point needs.
    pub fn suspend(self) -> RunResult<SavedFrame> {
        let live = match self.suspension_layout() {
            Ok(live) => live,
            Err(message) => return Err(self.internal(message)),
        };
        let locals = live
            .iter()
            .filter_map(|&slot| self.locals.get(slot as usize).cloned().flatten().map(|v| (slot, v)))
            .collect();
        Ok(SavedFrame {
            program: self.program,
            state: self.state,
            locals,
            stack: self.stack,
            cells: self.cells,
            exc_info: self.exc_info,
        })
    }

    /// Live locals of the current state, after checking the stack layout.
    fn suspension_layout(&self) -> Result<Vec<u32>, String> {
        let descriptor = self
            .program
            .generator
            .as_ref()
            .ok_or_else(|| "suspended a frame that is not a generator".to_string())?;
        let state = descriptor
            .state(self.state)
            .ok_or_else(|| format!("unknown resume state {}", self.state))?;
        if state.saved_stack.len() != self.stack.len() {
            return Err(format!(
                "operand stack holds {} values at state {}, layout expects {}",
                self.stack.len(),
                self.state,
                state.saved_stack.len()
            ));
        }
        Ok(state.live_locals.clone())
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    fn internal(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Internal {
            function: Arc::clone(self.program.name()),
            offset: self.pc,
            message: message.into(),
        }
    }

    // =========================================================================
    // Dispatch Loop
    // =========================================================================

    /// Run until the function returns, yields or lets an exception escape.
    pub fn run(&mut self, rt: &Runtime) -> RunResult<Exit> {
        let _depth = DepthGuard::enter(rt)?;
        let program = Arc::clone(&self.program);
        loop {
            let pc = self.pc;
            let step = program
                .step(pc)
                .ok_or_else(|| self.internal("no instruction at offset"))?;
            match self.execute(rt, step) {
                Ok(Flow::Next) => self.pc = pc + 1,
                Ok(Flow::Jump(target)) => self.pc = target,
                Ok(Flow::Return(value)) => return Ok(Exit::Return(value)),
                Ok(Flow::Yield(value)) => return Ok(Exit::Yield(value)),
                Err(err) => {
                    let exc = rt.catchable(err)?;
                    // a reraise keeps the traceback it already has
                    if !matches!(step.op, Op::Reraise { .. }) {
                        exc.record(TraceEntry {
                            function: Arc::clone(program.name()),
                            offset: pc,
                            line: step.line,
                        });
                    }
                    self.unwind(exc)?;
                }
            }
        }
    }

    /// Route `exc` to the handler covering the current offset.
    fn unwind(&mut self, exc: Arc<ExceptionObject>) -> RunResult<()> {
        let program = Arc::clone(&self.program);
        let Some(region) = region_at(&program.regions, self.pc) else {
            trace!(function = %program.name(), offset = self.pc, exception = %exc, "exception escapes frame");
            return Err(RuntimeError::Exception(exc));
        };
        trace!(
            function = %program.name(),
            offset = self.pc,
            handler = region.handler,
            exception = %exc,
            "unwinding"
        );
        if let Some(at) = region.restore_exc_info_at {
            let at = at as usize;
            if let Some(triple) = self.stack.get(at..at + 3) {
                self.exc_info = ExcInfo::from_stack(triple);
            }
        }
        let level = region.level as usize;
        if self.stack.len() < level {
            return Err(self.internal(format!(
                "operand stack holds {} values, handler expects {}",
                self.stack.len(),
                level
            )));
        }
        self.stack.truncate(level);
        self.stack.extend(self.exc_info.to_stack());
        self.exc_info = ExcInfo::of(&exc);
        self.stack.extend(self.exc_info.to_stack());
        self.pc = region.handler;
        Ok(())
    }

    // =========================================================================
    // Stack Helpers
    // =========================================================================

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> RunResult<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.internal("operand stack underflow")),
        }
    }

    fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        match self.stack.len().checked_sub(n) {
            Some(at) => Ok(self.stack.split_off(at)),
            None => Err(self.internal("operand stack underflow")),
        }
    }

    fn peek(&self, depth: usize) -> RunResult<&Value> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|i| &self.stack[i])
            .ok_or_else(|| self.internal("operand stack underflow"))
    }

    /// Move TOS down so it becomes the `n`th entry from the top.
    fn rotate(&mut self, n: usize) -> RunResult<()> {
        if n < 2 {
            return Ok(());
        }
        let top = self.pop()?;
        match self.stack.len().checked_sub(n - 1) {
            Some(at) => {
                self.stack.insert(at, top);
                Ok(())
            }
            None => Err(self.internal("operand stack underflow")),
        }
    }

    /// The collection `i` entries below TOS, after TOS was popped.
    fn target(&self, i: u32) -> RunResult<Value> {
        self.stack
            .len()
            .checked_sub(i as usize)
            .map(|at| self.stack[at].clone())
            .ok_or_else(|| self.internal("operand stack underflow"))
    }

    fn local(&self, rt: &Runtime, slot: u32) -> RunResult<Value> {
        match self.locals.get(slot as usize) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => {
                let name = &self.program.code.varnames[slot as usize];
                Err(rt.error(
                    TypeId::UNBOUND_LOCAL_ERROR,
                    format!("local variable '{}' referenced before assignment", name),
                ))
            }
            None => Err(self.internal(format!("local slot {} out of range", slot))),
        }
    }

    fn local_slot(&mut self, slot: u32) -> RunResult<&mut Option<Value>> {
        if slot as usize >= self.locals.len() {
            return Err(self.internal(format!("local slot {} out of range", slot)));
        }
        Ok(&mut self.locals[slot as usize])
    }

    fn cell(&self, slot: u32) -> RunResult<&Cell> {
        self.cells
            .get(slot as usize)
            .ok_or_else(|| self.internal(format!("cell {} out of range", slot)))
    }

    fn unbound_cell(&self, rt: &Runtime, slot: u32) -> RuntimeError {
        let code = &self.program.code;
        let name = code.closure_name(slot as usize).map(|n| &**n).unwrap_or("?");
        if (slot as usize) < code.cellvars.len() {
            rt.error(
                TypeId::UNBOUND_LOCAL_ERROR,
                format!("local variable '{}' referenced before assignment", name),
            )
        } else {
            rt.error(
                TypeId::NAME_ERROR,
                format!("free variable '{}' referenced before assignment in enclosing scope", name),
            )
        }
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn execute(&mut self, rt: &Runtime, step: &Step) -> RunResult<Flow> {
        if step.lowering == Lowering::Elided {
            return Ok(Flow::Next);
        }
        match &step.op {
            // -----------------------------------------------------------------
            // Stack shuffles
            // -----------------------------------------------------------------
            Op::PopTop => {
                self.pop()?;
            }
            Op::RotTwo => self.rotate(2)?,
            Op::RotThree => self.rotate(3)?,
            Op::RotFour => self.rotate(4)?,
            Op::RotN(n) => self.rotate(*n as usize)?,
            Op::DupTop => {
                let top = self.peek(0)?.clone();
                self.push(top);
            }
            Op::DupTopTwo => {
                let second = self.peek(1)?.clone();
                let top = self.peek(0)?.clone();
                self.push(second);
                self.push(top);
            }
            Op::Nop | Op::GenStart(_) | Op::SetupFinally { .. } | Op::PopBlock => {}

            // -----------------------------------------------------------------
            // Operators
            // -----------------------------------------------------------------
            Op::Unary(op) => {
                let v = self.pop()?;
                self.push(ops::unary(rt, *op, &v)?);
            }
            Op::Binary { op, inplace } => {
                let r = self.pop()?;
                let l = self.pop()?;
                if let Lowering::Specialized { result, .. } = &step.lowering {
                    trace!(op = op.symbol(), result = rt.model().name(*result), "specialized");
                }
                self.push(ops::binary(rt, *op, &l, &r, *inplace)?);
            }
            Op::BinarySubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.push(ops::get_item(rt, &container, &key)?);
            }
            Op::StoreSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                ops::set_item(rt, &container, &key, value)?;
            }
            Op::DeleteSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                ops::del_item(rt, &container, &key)?;
            }
            Op::Compare(op) => {
                let r = self.pop()?;
                let l = self.pop()?;
                self.push(ops::compare(rt, *op, &l, &r)?);
            }
            Op::IsOp { invert } => {
                let r = self.pop()?;
                let l = self.pop()?;
                self.push(Value::Bool(l.is(&r) != *invert));
            }
            Op::ContainsOp { invert } => {
                let container = self.pop()?;
                let item = self.pop()?;
                self.push(Value::Bool(ops::contains(rt, &container, &item)? != *invert));
            }

            // -----------------------------------------------------------------
            // Iteration
            // -----------------------------------------------------------------
            Op::GetIter => {
                let v = self.pop()?;
                self.push(rt.iter(&v)?);
            }
            Op::GetYieldFromIter => {
                let v = self.pop()?;
                let it = match v {
                    Value::Generator(_) => v,
                    other => rt.iter(&other)?,
                };
                self.push(it);
            }
            Op::ForIter { exit } => {
                let it = self.peek(0)?.clone();
                match rt.next(&it)? {
                    Some(v) => self.push(v),
                    None => {
                        self.pop()?;
                        return Ok(Flow::Jump(*exit));
                    }
                }
            }

            // -----------------------------------------------------------------
            // Names and constants
            // -----------------------------------------------------------------
            Op::LoadConst(index) => {
                let constant = self
                    .program
                    .code
                    .constants
                    .get(*index as usize)
                    .ok_or_else(|| self.internal(format!("constant {} out of range", index)))?;
                let v = Value::from_constant(constant);
                self.push(v);
            }
            Op::LoadFast(slot) => {
                let v = self.local(rt, *slot)?;
                self.push(v);
            }
            Op::StoreFast(slot) => {
                let v = self.pop()?;
                *self.local_slot(*slot)? = Some(v);
            }
            Op::DeleteFast(slot) => {
                self.local(rt, *slot)?;
                *self.local_slot(*slot)? = None;
            }
            Op::LoadDeref(slot) | Op::LoadClassDeref(slot) => {
                let v = self.cell(*slot)?.lock().clone();
                match v {
                    Some(v) => self.push(v),
                    None => return Err(self.unbound_cell(rt, *slot)),
                }
            }
            Op::StoreDeref(slot) => {
                let v = self.pop()?;
                *self.cell(*slot)?.lock() = Some(v);
            }
            Op::DeleteDeref(slot) => {
                let old = self.cell(*slot)?.lock().take();
                if old.is_none() {
                    return Err(self.unbound_cell(rt, *slot));
                }
            }
            Op::LoadClosure(slot) => {
                let cell = Arc::clone(self.cell(*slot)?);
                self.push(Value::Cell(cell));
            }
            Op::LoadGlobal(name) | Op::LoadName(name) => {
                let v = rt.load_global(name)?;
                self.push(v);
            }
            Op::StoreGlobal(name) | Op::StoreName(name) => {
                let v = self.pop()?;
                rt.set_global(name.clone(), v);
            }
            Op::DeleteGlobal(name) | Op::DeleteName(name) => rt.delete_global(name)?,
            Op::LoadAttr(name) => {
                let obj = self.pop()?;
                self.push(rt.get_attr(&obj, name)?);
            }
            Op::StoreAttr(name) => {
                let obj = self.pop()?;
                let value = self.pop()?;
                rt.set_attr(&obj, name, value)?;
            }
            Op::DeleteAttr(name) => {
                let obj = self.pop()?;
                return Err(rt.error(
                    TypeId::ATTRIBUTE_ERROR,
                    format!("cannot delete attribute '{}' of '{}' object", name, obj.type_name(rt.model())),
                ));
            }
            Op::LoadMethod(name) => {
                let receiver = self.pop()?;
                let method = rt.get_attr(&receiver, name)?;
                self.push(method);
                self.push(receiver);
            }
            Op::LoadAssertionError => self.push(Value::Class(TypeId::ASSERTION_ERROR)),
            Op::LoadBuildClass | Op::ImportName(_) | Op::ImportFrom(_) | Op::ImportStar | Op::SetupAnnotations => {
                return Err(rt.error(
                    TypeId::NOT_IMPLEMENTED_ERROR,
                    format!("{} is not supported", step.op.name()),
                ));
            }
            Op::PrintExpr => {
                let v = self.pop()?;
                if !v.is_none() {
                    let line = rt.repr(&v)?;
                    rt.write_line(line);
                }
            }

            // -----------------------------------------------------------------
            // Collections
            // -----------------------------------------------------------------
            Op::BuildTuple(n) => {
                let items = self.pop_n(*n as usize)?;
                self.push(Value::Tuple(items.into()));
            }
            Op::BuildList(n) => {
                let items = self.pop_n(*n as usize)?;
                self.push(Value::list(items));
            }
            Op::BuildSet(n) => {
                let items = self.pop_n(*n as usize)?;
                let mut members = Vec::with_capacity(items.len());
                for item in items {
                    builtins::set_insert(rt, &mut members, item)?;
                }
                self.push(Value::Set(Arc::new(parking_lot::Mutex::new(members))));
            }
            Op::BuildMap(n) => {
                let flat = self.pop_n(*n as usize * 2)?;
                let mut pairs = Vec::with_capacity(*n as usize);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    ops::check_hashable(rt, &k)?;
                    dict::insert(&mut pairs, k, v);
                }
                self.push(Value::dict(pairs));
            }
            Op::BuildConstKeyMap(n) => {
                let keys = self.pop()?;
                let values = self.pop_n(*n as usize)?;
                let Value::Tuple(keys) = keys else {
                    return Err(self.internal("BUILD_CONST_KEY_MAP keys are not a tuple"));
                };
                let mut pairs = Vec::with_capacity(values.len());
                for (k, v) in keys.iter().cloned().zip(values) {
                    ops::check_hashable(rt, &k)?;
                    dict::insert(&mut pairs, k, v);
                }
                self.push(Value::dict(pairs));
            }
            Op::BuildString(n) => {
                let pieces = self.pop_n(*n as usize)?;
                let mut out = String::new();
                for piece in &pieces {
                    match piece {
                        Value::Str(s) => out.push_str(s),
                        other => out.push_str(&rt.to_str(other)?),
                    }
                }
                self.push(Value::Str(Arc::from(out)));
            }
            Op::BuildSlice(n) => {
                let step_value = if *n == 3 { self.pop()? } else { Value::None };
                let stop = self.pop()?;
                let start = self.pop()?;
                self.push(Value::Slice(Arc::new([start, stop, step_value])));
            }
            Op::ListToTuple => {
                let v = self.pop()?;
                let items = rt.collect(&v)?;
                self.push(Value::Tuple(items.into()));
            }
            Op::ListAppend(i) => {
                let v = self.pop()?;
                match self.target(*i)? {
                    Value::List(list) => list.lock().push(v),
                    _ => return Err(self.internal("LIST_APPEND target is not a list")),
                }
            }
            Op::SetAdd(i) => {
                let v = self.pop()?;
                match self.target(*i)? {
                    Value::Set(set) => {
                        let mut members = set.lock().clone();
                        builtins::set_insert(rt, &mut members, v)?;
                        *set.lock() = members;
                    }
                    _ => return Err(self.internal("SET_ADD target is not a set")),
                }
            }
            Op::MapAdd(i) => {
                let value = self.pop()?;
                let key = self.pop()?;
                ops::check_hashable(rt, &key)?;
                match self.target(*i)? {
                    Value::Dict(pairs) => dict::insert(&mut pairs.lock(), key, value),
                    _ => return Err(self.internal("MAP_ADD target is not a dict")),
                }
            }
            Op::ListExtend(i) => {
                let iterable = self.pop()?;
                let items = rt.collect(&iterable)?;
                match self.target(*i)? {
                    Value::List(list) => list.lock().extend(items),
                    _ => return Err(self.internal("LIST_EXTEND target is not a list")),
                }
            }
            Op::SetUpdate(i) => {
                let iterable = self.pop()?;
                let items = rt.collect(&iterable)?;
                match self.target(*i)? {
                    Value::Set(set) => {
                        let mut members = set.lock().clone();
                        for item in items {
                            builtins::set_insert(rt, &mut members, item)?;
                        }
                        *set.lock() = members;
                    }
                    _ => return Err(self.internal("SET_UPDATE target is not a set")),
                }
            }
            Op::DictUpdate(i) | Op::DictMerge(i) => {
                let other = self.pop()?;
                let incoming = match &other {
                    Value::Dict(pairs) => pairs.lock().clone(),
                    v => {
                        return Err(rt.type_error(format!("'{}' object is not a mapping", v.type_name(rt.model()))));
                    }
                };
                let Value::Dict(target) = self.target(*i)? else {
                    return Err(self.internal("dict update target is not a dict"));
                };
                let merge = matches!(step.op, Op::DictMerge(_));
                let mut pairs = target.lock();
                for (k, v) in incoming {
                    if merge && dict::position(&pairs, &k).is_some() {
                        drop(pairs);
                        let key = rt.to_str(&k)?;
                        return Err(rt.type_error(format!("got multiple values for keyword argument '{}'", key)));
                    }
                    dict::insert(&mut pairs, k, v);
                }
            }
            Op::UnpackSequence(n) => {
                let seq = self.pop()?;
                let items = rt.collect(&seq)?;
                let n = *n as usize;
                if items.len() != n {
                    let message = if items.len() < n {
                        format!("not enough values to unpack (expected {}, got {})", n, items.len())
                    } else {
                        format!("too many values to unpack (expected {})", n)
                    };
                    return Err(rt.error(TypeId::VALUE_ERROR, message));
                }
                self.stack.extend(items.into_iter().rev());
            }
            Op::UnpackEx { before, after } => {
                let seq = self.pop()?;
                let mut items = rt.collect(&seq)?;
                let (before, after) = (*before as usize, *after as usize);
                if items.len() < before + after {
                    return Err(rt.error(
                        TypeId::VALUE_ERROR,
                        format!(
                            "not enough values to unpack (expected at least {}, got {})",
                            before + after,
                            items.len()
                        ),
                    ));
                }
                let tail = items.split_off(items.len() - after);
                let middle = items.split_off(before);
                self.stack.extend(tail.into_iter().rev());
                self.push(Value::list(middle));
                self.stack.extend(items.into_iter().rev());
            }
            Op::FormatValue(flags) => {
                let spec = if flags & format_value::HAS_SPEC != 0 {
                    match self.pop()? {
                        Value::Str(s) => s,
                        _ => return Err(self.internal("format spec is not a string")),
                    }
                } else {
                    Arc::from("")
                };
                let v = self.pop()?;
                let converted = match flags & format_value::CONVERSION_MASK {
                    format_value::STR => Value::Str(Arc::from(rt.to_str(&v)?)),
                    format_value::REPR => Value::Str(Arc::from(rt.repr(&v)?)),
                    format_value::ASCII => Value::Str(Arc::from(builtins::ascii(&rt.repr(&v)?))),
                    _ => v,
                };
                let text = ops::format(rt, &converted, &spec)?;
                self.push(Value::Str(Arc::from(text)));
            }

            // -----------------------------------------------------------------
            // Calls
            // -----------------------------------------------------------------
            Op::CallFunction(argc) => {
                let args = self.pop_n(*argc as usize)?;
                let callee = self.pop()?;
                let result = match (&step.lowering, &callee) {
                    (Lowering::DirectCall { owner, name, .. }, Value::Builtin(builtin))
                        if *owner == TypeId::BUILTINS && builtin == name =>
                    {
                        builtins::call_builtin(rt, name, &args, &[])?
                    }
                    _ => rt.call(&callee, &args)?,
                };
                self.push(result);
            }
            Op::CallFunctionKw(argc) => {
                let names = self.pop()?;
                let mut args = self.pop_n(*argc as usize)?;
                let callee = self.pop()?;
                let Value::Tuple(names) = names else {
                    return Err(self.internal("keyword names are not a tuple"));
                };
                let positional = args.len().checked_sub(names.len()).ok_or_else(|| self.internal("more keyword names than arguments"))?;
                let values = args.split_off(positional);
                let mut kwargs = Vec::with_capacity(values.len());
                for (name, value) in names.iter().zip(values) {
                    let Value::Str(name) = name else {
                        return Err(self.internal("keyword name is not a string"));
                    };
                    kwargs.push((Arc::clone(name), value));
                }
                self.push(rt.call_kw(&callee, &args, &kwargs)?);
            }
            Op::CallFunctionEx { kwargs } => {
                let mapping = if *kwargs { Some(self.pop()?) } else { None };
                let iterable = self.pop()?;
                let callee = self.pop()?;
                let args = rt.collect(&iterable)?;
                let mut named = Vec::new();
                if let Some(mapping) = mapping {
                    let Value::Dict(pairs) = &mapping else {
                        return Err(rt.type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            mapping.type_name(rt.model())
                        )));
                    };
                    for (k, v) in pairs.lock().iter() {
                        match k {
                            Value::Str(name) => named.push((Arc::clone(name), v.clone())),
                            _ => return Err(rt.type_error("keywords must be strings")),
                        }
                    }
                }
                self.push(rt.call_kw(&callee, &args, &named)?);
            }
            Op::CallMethod(argc) => {
                let args = self.pop_n(*argc as usize)?;
                let receiver = self.pop()?;
                let method = self.pop()?;
                let result = match &step.lowering {
                    Lowering::DirectCall { owner, name, .. }
                        if *owner != TypeId::OBJECT && !matches!(receiver, Value::Native(_)) =>
                    {
                        builtins::call_type_method(rt, &receiver, name, &args)?
                    }
                    _ => rt.call(&method, &args)?,
                };
                self.push(result);
            }
            Op::MakeFunction(flags) => {
                let function = self.make_function(*flags)?;
                self.push(Value::Function(Arc::new(function)));
            }

            // -----------------------------------------------------------------
            // Control flow
            // -----------------------------------------------------------------
            Op::Jump { target } => return Ok(Flow::Jump(*target)),
            Op::PopJumpIf { when, target } => {
                let v = self.pop()?;
                if rt.truthy(&v)? == *when {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::JumpIfOrPop { when, target } => {
                let v = self.peek(0)?.clone();
                if rt.truthy(&v)? == *when {
                    return Ok(Flow::Jump(*target));
                }
                self.pop()?;
            }
            Op::JumpIfNotExcMatch { target } => {
                let right = self.pop()?;
                let left = self.pop()?;
                if !rt.exception_matches(&left, &right)? {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::ReturnValue => {
                let v = self.pop()?;
                let v = match step.lowering {
                    Lowering::Return { checked: true } => self.check_return(rt, v)?,
                    _ => v,
                };
                return Ok(Flow::Return(v));
            }

            // -----------------------------------------------------------------
            // Exception control
            // -----------------------------------------------------------------
            Op::SetupWith { .. } => {
                let manager = self.pop()?;
                let exit = rt.special(&manager, "__exit__")?;
                let enter = rt.special(&manager, "__enter__")?;
                self.push(exit);
                let entered = rt.call(&enter, &[])?;
                self.push(entered);
            }
            Op::PopExcept => {
                let triple = self.pop_n(3)?;
                self.exc_info = ExcInfo::from_stack(&triple);
            }
            Op::Reraise { .. } => {
                let ty = self.pop()?;
                let value = self.pop()?;
                self.pop()?;
                let exc = match value {
                    Value::Exception(exc) => exc,
                    _ => rt.make_exception(&ty)?,
                };
                return Err(RuntimeError::Exception(exc));
            }
            Op::RaiseVarargs(n) => {
                let exc = match n {
                    0 => match &self.exc_info.value {
                        Some(exc) => Arc::clone(exc),
                        None => return Err(rt.error(TypeId::RUNTIME_ERROR, "No active exception to reraise")),
                    },
                    1 => {
                        let v = self.pop()?;
                        rt.make_exception(&v)?
                    }
                    _ => {
                        // the cause is not modelled
                        self.pop()?;
                        let v = self.pop()?;
                        rt.make_exception(&v)?
                    }
                };
                return Err(RuntimeError::Exception(exc));
            }
            Op::WithExceptStart => {
                let exit = self.peek(6)?.clone();
                let args = [self.peek(0)?.clone(), self.peek(1)?.clone(), self.peek(2)?.clone()];
                let result = rt.call(&exit, &args)?;
                self.push(result);
            }

            // -----------------------------------------------------------------
            // Generators
            // -----------------------------------------------------------------
            Op::YieldValue | Op::YieldFrom => {
                return Err(self.internal(format!("{} survived the generator transform", step.op.name())));
            }
            Op::LoadSpecial(name) => {
                let receiver = self.pop()?;
                self.push(rt.special(&receiver, name)?);
            }
            Op::ResumeDispatch { states } => {
                if self.state == 0 {
                    return Ok(Flow::Next);
                }
                let state = self.state;
                return match states.iter().find(|(id, _)| *id == state) {
                    Some(&(_, offset)) => Ok(Flow::Jump(offset)),
                    None => Err(self.internal(format!("no resume point for state {}", state))),
                };
            }
            Op::Suspend { state } => {
                let v = self.pop()?;
                self.state = *state;
                return Ok(Flow::Yield(v));
            }
            Op::ResumePoint { .. } => match self.resumption.take() {
                Some(Resumption::Send(v)) => self.push(v),
                Some(Resumption::Throw(exc)) => return Err(RuntimeError::Exception(exc)),
                None => return Err(self.internal("resume point reached without a resumption")),
            },
            Op::Delegate { state, exit } => return self.delegate(rt, *state, *exit),
        }
        Ok(Flow::Next)
    }

    /// One step of `yield from`.
    fn delegate(&mut self, rt: &Runtime, state: u32, exit: u32) -> RunResult<Flow> {
        let sent = self.pop()?;
        let receiver = self.peek(0)?.clone();
        let outcome = match &receiver {
            Value::Generator(g) if sent.is_none() => g.next(rt),
            Value::Generator(g) => g.send(rt, sent),
            Value::Iter(_) if sent.is_none() => match rt.next(&receiver)? {
                Some(v) => Ok(v),
                None => Err(RuntimeError::StopIteration(None)),
            },
            _ if sent.is_none() => rt.call_method(&receiver, "__next__", &[]),
            _ => rt.call_method(&receiver, "send", &[sent]),
        };
        let result = match outcome {
            Ok(v) => {
                self.state = state;
                return Ok(Flow::Yield(v));
            }
            Err(RuntimeError::StopIteration(v)) => v.unwrap_or(Value::None),
            Err(RuntimeError::Exception(exc)) if rt.model().is_subtype(exc.ty, TypeId::STOP_ITERATION) => {
                exc.args.first().cloned().unwrap_or(Value::None)
            }
            Err(err) => return Err(err),
        };
        self.pop()?;
        self.push(result);
        Ok(Flow::Jump(exit))
    }

    fn check_return(&self, rt: &Runtime, v: Value) -> RunResult<Value> {
        let declared = self.program.signature.ret;
        match rt.coerce(v.clone(), declared) {
            Ok(v) => Ok(v),
            Err(_) => Err(rt.type_error(format!(
                "{}() returned {}, expected {}",
                self.program.name(),
                v.type_name(rt.model()),
                rt.model().name(declared)
            ))),
        }
    }

    fn make_function(&mut self, flags: u32) -> RunResult<Function> {
        let qualname = self.pop()?;
        let code = self.pop()?;
        let (Value::Str(qualname), Value::Code(code)) = (qualname, code) else {
            return Err(self.internal("MAKE_FUNCTION expects a code object and a name"));
        };
        let mut function = Function::new(code);
        function.qualname = qualname;
        if flags & make_function::CLOSURE != 0 {
            let Value::Tuple(cells) = self.pop()? else {
                return Err(self.internal("closure is not a tuple"));
            };
            let mut closure = Vec::with_capacity(cells.len());
            for cell in cells.iter() {
                match cell {
                    Value::Cell(cell) => closure.push(Arc::clone(cell)),
                    _ => return Err(self.internal("closure entry is not a cell")),
                }
            }
            function.closure = closure.into();
        }
        if flags & make_function::ANNOTATIONS != 0 {
            let annotations: Vec<Value> = match self.pop()? {
                Value::Tuple(items) => items.to_vec(),
                Value::Dict(pairs) => pairs.lock().iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect(),
                _ => return Err(self.internal("annotations are neither a tuple nor a dict")),
            };
            function.signature = Function::signature_from_annotations(&function.code, &annotations);
        } else {
            function.signature = CallSignature::dynamic();
        }
        if flags & make_function::KW_DEFAULTS != 0 {
            match self.pop()? {
                Value::Dict(pairs) => function.kwdefaults = pairs.lock().clone(),
                _ => return Err(self.internal("keyword defaults are not a dict")),
            }
        }
        if flags & make_function::DEFAULTS != 0 {
            match self.pop()? {
                Value::Tuple(items) => function.defaults = items,
                _ => return Err(self.internal("defaults are not a tuple")),
            }
        }
        Ok(function)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{CodeBuilder, CodeObject, Constant, Opcode};

    fn run(rt: &Runtime, code: CodeObject) -> RunResult<Value> {
        rt.run(&Arc::new(code))
    }

    #[test]
    fn test_arithmetic_and_locals() {
        let rt = Runtime::new();
        let mut b = CodeBuilder::new("f");
        b.load_const(Constant::Int(6));
        b.store_fast("x");
        b.load_fast("x");
        b.load_const(Constant::Int(7));
        b.emit_op(Opcode::BinaryMultiply);
        b.emit_op(Opcode::ReturnValue);
        let v = run(&rt, b.finish().unwrap()).unwrap();
        assert!(v.py_eq(&Value::Int(42)));
    }

    #[test]
    fn test_unbound_local_raises() {
        let rt = Runtime::new();
        let mut b = CodeBuilder::new("f");
        b.define_local("x");
        b.load_fast("x");
        b.emit_op(Opcode::ReturnValue);
        let err = run(&rt, b.finish().unwrap()).unwrap_err();
        let exc = err.exception().unwrap();
        assert_eq!(exc.ty, TypeId::UNBOUND_LOCAL_ERROR);
        assert_eq!(exc.traceback().len(), 1);
    }

    #[test]
    fn test_rotations_follow_cpython() {
        let rt = Runtime::new();
        let mut b = CodeBuilder::new("f");
        for i in 1..=3 {
            b.load_const(Constant::Int(i));
        }
        b.emit_op(Opcode::RotThree);
        b.emit(Opcode::BuildTuple, 3);
        b.emit_op(Opcode::ReturnValue);
        let v = run(&rt, b.finish().unwrap()).unwrap();
        assert_eq!(rt.repr(&v).unwrap(), "(3, 1, 2)");
    }

    #[test]
    fn test_unpack_pushes_first_item_on_top() {
        let rt = Runtime::new();
        let mut b = CodeBuilder::new("f");
        b.load_const(Constant::tuple([Constant::Int(1), Constant::Int(2)]));
        b.emit(Opcode::UnpackSequence, 2);
        b.store_fast("a");
        b.store_fast("b");
        b.load_fast("a");
        b.load_fast("b");
        b.emit_op(Opcode::BinarySubtract);
        b.emit_op(Opcode::ReturnValue);
        let v = run(&rt, b.finish().unwrap()).unwrap();
        assert!(v.py_eq(&Value::Int(-1)));
    }

    #[test]
    fn test_loop_over_range() {
        let rt = Runtime::new();
        let mut b = CodeBuilder::new("f");
        let head = b.create_label();
        let done = b.create_label();
        b.load_const(Constant::Int(0));
        b.store_fast("total");
        b.load_global("range");
        b.load_const(Constant::Int(5));
        b.emit(Opcode::CallFunction, 1);
        b.emit_op(Opcode::GetIter);
        b.bind_label(head);
        b.emit_jump(Opcode::ForIter, done);
        b.load_fast("total");
        b.emit_op(Opcode::InplaceAdd);
        b.store_fast("total");
        b.emit_jump(Opcode::JumpAbsolute, head);
        b.bind_label(done);
        b.load_fast("total");
        b.emit_op(Opcode::ReturnValue);
        let v = run(&rt, b.finish().unwrap()).unwrap();
        assert!(v.py_eq(&Value::Int(10)));
    }

    #[test]
    fn test_recursion_limit() {
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(|| {
                let rt = Runtime::new();
                let mut b = CodeBuilder::new("again");
                b.load_global("again");
                b.emit(Opcode::CallFunction, 0);
                b.emit_op(Opcode::ReturnValue);
                let code = Arc::new(b.finish().unwrap());
                let f = rt.function(&code);
                rt.set_global("again", f.clone());
                let err = rt.call(&f, &[]).unwrap_err();
                (err, DEPTH.with(|d| d.get()))
            })
            .unwrap();
        let (err, depth) = handle.join().unwrap();
        let exc = err.exception().unwrap();
        assert_eq!(exc.ty, TypeId::RUNTIME_ERROR);
        assert!(exc.to_string().contains("maximum recursion depth"));
        assert_eq!(depth, 0);
    }
}
