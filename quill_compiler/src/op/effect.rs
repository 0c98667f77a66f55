//! Abstract stack effects.
//!
//! [`Op::stack_effect`] maps the state before an instruction to one state per
//! successor. It is pure: every query goes through a [`Typer`], which reads
//! the type model, the code object's tables and the configuration but never
//! writes anything.

use super::{BinaryOp, Op, UnaryOp};
use crate::config::TranslatorConfig;
use crate::error::{DecodeError, DecodeResult};
use crate::metadata::{BlockFrame, BlockKind, SlotType, StackMetadata};
use quill_bytecode::{CodeObject, CompareOp, Constant, format_value, make_function};
use quill_types::{GlobalBinding, Signature, TypeId, TypeModel};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use tracing::trace;

// =============================================================================
// Transfer
// =============================================================================

/// Which successor an outcome flows to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Successor {
    /// The following instruction.
    Next,
    /// The instruction at the given offset.
    Jump(u32),
}

/// The states leaving one instruction, one per successor it can reach.
///
/// An empty transfer means control leaves the function (return or raise).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transfer {
    pub outcomes: SmallVec<[(Successor, StackMetadata); 2]>,
}

impl Transfer {
    /// Control leaves the function.
    pub fn exit() -> Self {
        Self::default()
    }

    /// A single fall-through outcome.
    pub fn next(state: StackMetadata) -> Self {
        Transfer {
            outcomes: smallvec![(Successor::Next, state)],
        }
    }

    /// A single jump outcome.
    pub fn jump(target: u32, state: StackMetadata) -> Self {
        Transfer {
            outcomes: smallvec![(Successor::Jump(target), state)],
        }
    }

    /// Fall through with `next`, or jump to `target` with `taken`.
    pub fn branch(next: StackMetadata, target: u32, taken: StackMetadata) -> Self {
        Transfer {
            outcomes: smallvec![(Successor::Next, next), (Successor::Jump(target), taken)],
        }
    }

    /// The fall-through state, if any.
    pub fn fallthrough(&self) -> Option<&StackMetadata> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == Successor::Next)
            .map(|(_, state)| state)
    }
}

// =============================================================================
// Typer
// =============================================================================

/// A method call resolved to exactly one overload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Runtime type of the receiver the lookup started from.
    pub receiver: TypeId,
    /// Method name.
    pub name: Arc<str>,
    /// The single matching overload.
    pub signature: Arc<Signature>,
}

impl Resolved {
    /// The narrowed result slot.
    pub fn result(&self) -> SlotType {
        SlotType::Instance(self.signature.return_type)
    }
}

/// What a call instruction invokes, as far as it is statically known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A class object is called: the result is a fresh instance.
    Construct(TypeId),
    /// A known method or builtin with a single matching overload.
    Method(Resolved),
    /// Nothing is known; dispatch stays dynamic.
    Dynamic,
}

impl CallTarget {
    /// The result slot of the call.
    pub fn result(&self) -> SlotType {
        match self {
            CallTarget::Construct(ty) => SlotType::Instance(*ty),
            CallTarget::Method(resolved) => resolved.result(),
            CallTarget::Dynamic => SlotType::OBJECT,
        }
    }
}

/// Read-only context for typing instructions of one function.
#[derive(Clone, Copy)]
pub struct Typer<'a> {
    pub model: &'a TypeModel,
    pub code: &'a CodeObject,
    pub config: &'a TranslatorConfig,
}

impl<'a> Typer<'a> {
    pub fn new(model: &'a TypeModel, code: &'a CodeObject, config: &'a TranslatorConfig) -> Self {
        Self {
            model,
            code,
            config,
        }
    }

    /// Slot type of constant `index`.
    pub fn const_slot(&self, index: u32) -> SlotType {
        let ty = match self.code.constants.get(index as usize) {
            Some(Constant::None) => TypeId::NONE,
            Some(Constant::Bool(_)) => TypeId::BOOL,
            Some(Constant::Int(_)) => TypeId::INT,
            Some(Constant::Float(_)) => TypeId::FLOAT,
            Some(Constant::Str(_)) => TypeId::STR,
            Some(Constant::Bytes(_)) => TypeId::BYTES,
            Some(Constant::Tuple(_)) => TypeId::TUPLE,
            Some(Constant::Code(_)) => TypeId::CODE,
            Some(Constant::Ellipsis) | None => TypeId::OBJECT,
        };
        SlotType::Instance(ty)
    }

    /// Slot type of a global (or module-level) name.
    pub fn global_slot(&self, name: &Arc<str>) -> SlotType {
        if !self.config.assume_builtins {
            return SlotType::OBJECT;
        }
        match self.model.lookup_global(name) {
            Some(GlobalBinding::Class(ty)) => SlotType::Class(ty),
            Some(GlobalBinding::Function) => SlotType::Method {
                receiver: TypeId::BUILTINS,
                name: name.clone(),
            },
            None => SlotType::OBJECT,
        }
    }

    /// Slot type of `obj.name`.
    pub fn attr_slot(&self, obj: &SlotType, name: &Arc<str>) -> SlotType {
        if !self.config.specialize {
            return SlotType::OBJECT;
        }
        let ty = obj.runtime_type();
        if self.model.has_method(ty, name) {
            return SlotType::Method {
                receiver: ty,
                name: name.clone(),
            };
        }
        match self.model.lookup_attribute(ty, name) {
            Some(attr) => SlotType::Instance(attr),
            None => SlotType::OBJECT,
        }
    }

    /// Resolve `receiver.name(*args)` to one overload.
    pub fn resolve_method(
        &self,
        receiver: TypeId,
        name: &str,
        args: &[SlotType],
        kw_names: &[Arc<str>],
    ) -> Option<Resolved> {
        if !self.config.specialize {
            return None;
        }
        let signatures = self.model.lookup_method(receiver, name);
        if signatures.is_empty() {
            return None;
        }
        let arg_types: SmallVec<[TypeId; 4]> = args.iter().map(SlotType::runtime_type).collect();
        match self.model.resolve_overload(&signatures, &arg_types, kw_names) {
            Some(signature) => Some(Resolved {
                receiver,
                name: Arc::from(name),
                signature,
            }),
            None => {
                trace!(
                    receiver = %self.model.name(receiver),
                    method = name,
                    candidates = signatures.len(),
                    "specialization miss"
                );
                None
            }
        }
    }

    /// Resolve a binary operator, trying the in-place, forward and reflected
    /// methods in the language's order.
    pub fn resolve_binary(&self, op: BinaryOp, inplace: bool, lhs: &SlotType, rhs: &SlotType) -> Option<Resolved> {
        let (l, r) = (lhs.runtime_type(), rhs.runtime_type());
        if inplace {
            if let Some(found) = self.resolve_method(l, op.inplace(), std::slice::from_ref(rhs), &[]) {
                return Some(found);
            }
        }
        let forward = || self.resolve_method(l, op.dunder(), std::slice::from_ref(rhs), &[]);
        let reflected = || self.resolve_method(r, op.reflected(), std::slice::from_ref(lhs), &[]);

        // A subclass operand overriding the reflected method goes first.
        let subclass_first = l != r && self.model.is_subtype(r, l) && self.model.has_method(r, op.reflected());
        if subclass_first {
            reflected().or_else(forward)
        } else {
            forward().or_else(reflected)
        }
    }

    /// Resolve a rich comparison, falling back to the swapped operator on the
    /// right operand.
    pub fn resolve_compare(&self, op: CompareOp, lhs: &SlotType, rhs: &SlotType) -> Option<Resolved> {
        self.resolve_method(lhs.runtime_type(), op.dunder(), std::slice::from_ref(rhs), &[])
            .or_else(|| {
                self.resolve_method(
                    rhs.runtime_type(),
                    op.swapped().dunder(),
                    std::slice::from_ref(lhs),
                    &[],
                )
            })
    }

    /// Resolve a unary operator.
    pub fn resolve_unary(&self, op: UnaryOp, operand: &SlotType) -> Option<Resolved> {
        let name = op.dunder()?;
        self.resolve_method(operand.runtime_type(), name, &[], &[])
    }

    /// What calling `callee` with `args` invokes.
    pub fn resolve_call(&self, callee: &SlotType, args: &[SlotType], kw_names: &[Arc<str>]) -> CallTarget {
        if !self.config.specialize {
            return CallTarget::Dynamic;
        }
        match callee {
            // `type(x)` returns a class, not an instance of `type`
            SlotType::Class(ty) if *ty == TypeId::TYPE => CallTarget::Dynamic,
            SlotType::Class(ty) => CallTarget::Construct(*ty),
            SlotType::Method { receiver, name } => self
                .resolve_method(*receiver, name, args, kw_names)
                .map_or(CallTarget::Dynamic, CallTarget::Method),
            SlotType::Instance(_) => CallTarget::Dynamic,
        }
    }

    /// Result slot of an iterator's `__next__`.
    pub fn next_slot(&self, iterator: &SlotType) -> SlotType {
        self.resolve_method(iterator.runtime_type(), "__next__", &[], &[])
            .map_or(SlotType::OBJECT, |r| r.result())
    }
}

fn result_or_object(resolved: Option<Resolved>) -> SlotType {
    resolved.map_or(SlotType::OBJECT, |r| r.result())
}

fn push_n(state: &mut StackMetadata, n: u32, slot: SlotType) {
    for _ in 0..n {
        state.push(slot.clone());
    }
}

// =============================================================================
// Stack Effects
// =============================================================================

impl Op {
    /// The states after this op, one per successor, given the state before.
    pub fn stack_effect(&self, offset: u32, before: &StackMetadata, typer: &Typer<'_>) -> DecodeResult<Transfer> {
        let mut s = before.clone();
        s.pending_kw_names = None;
        let model = typer.model;

        match self {
            // -----------------------------------------------------------------
            // Stack shuffles
            // -----------------------------------------------------------------
            Op::PopTop => {
                s.pop(offset)?;
            }
            Op::RotTwo => s.rotate(2, offset)?,
            Op::RotThree => s.rotate(3, offset)?,
            Op::RotFour => s.rotate(4, offset)?,
            Op::RotN(n) => s.rotate(*n as usize, offset)?,
            Op::DupTop => {
                let top = s.peek(0, offset)?.clone();
                s.push(top);
            }
            Op::DupTopTwo => {
                let second = s.peek(1, offset)?.clone();
                let top = s.peek(0, offset)?.clone();
                s.push(second);
                s.push(top);
            }
            Op::Nop | Op::GenStart(_) | Op::SetupAnnotations | Op::ResumeDispatch { .. } => {}

            // -----------------------------------------------------------------
            // Operators
            // -----------------------------------------------------------------
            Op::Unary(UnaryOp::Not) => {
                s.pop(offset)?;
                s.push(SlotType::Instance(TypeId::BOOL));
            }
            Op::Unary(op) => {
                let v = s.pop(offset)?;
                s.push(result_or_object(typer.resolve_unary(*op, &v)));
            }
            Op::Binary { op, inplace } => {
                let rhs = s.pop(offset)?;
                let lhs = s.pop(offset)?;
                s.push(result_or_object(typer.resolve_binary(*op, *inplace, &lhs, &rhs)));
            }
            Op::BinarySubscr => {
                let index = s.pop(offset)?;
                let container = s.pop(offset)?;
                let resolved = typer.resolve_method(
                    container.runtime_type(),
                    "__getitem__",
                    std::slice::from_ref(&index),
                    &[],
                );
                s.push(result_or_object(resolved));
            }
            Op::StoreSubscr => {
                s.pop_n(3, offset)?;
            }
            Op::DeleteSubscr => {
                s.pop_n(2, offset)?;
            }
            Op::Compare(op) => {
                let rhs = s.pop(offset)?;
                let lhs = s.pop(offset)?;
                s.push(result_or_object(typer.resolve_compare(*op, &lhs, &rhs)));
            }
            Op::IsOp { .. } | Op::ContainsOp { .. } => {
                s.pop_n(2, offset)?;
                s.push(SlotType::Instance(TypeId::BOOL));
            }

            // -----------------------------------------------------------------
            // Iteration
            // -----------------------------------------------------------------
            Op::GetIter => {
                let v = s.pop(offset)?;
                s.push(result_or_object(typer.resolve_method(v.runtime_type(), "__iter__", &[], &[])));
            }
            Op::GetYieldFromIter => {
                let v = s.pop(offset)?;
                if model.is_subtype(v.runtime_type(), TypeId::GENERATOR) {
                    s.push(v);
                } else {
                    s.push(result_or_object(typer.resolve_method(v.runtime_type(), "__iter__", &[], &[])));
                }
            }
            Op::ForIter { exit } => {
                let item = typer.next_slot(s.peek(0, offset)?);
                let mut done = s.clone();
                done.pop(offset)?;
                s.push(item);
                return Ok(Transfer::branch(s, *exit, done));
            }

            // -----------------------------------------------------------------
            // Names and constants
            // -----------------------------------------------------------------
            Op::LoadConst(index) => {
                s.push(typer.const_slot(*index));
                s.pending_kw_names = typer
                    .code
                    .constants
                    .get(*index as usize)
                    .and_then(Constant::as_str_tuple);
            }
            Op::LoadFast(index) => {
                let slot = local(&s.locals, *index, offset)?.clone().unwrap_or(SlotType::OBJECT);
                s.push(slot);
            }
            Op::StoreFast(index) => {
                let v = s.pop(offset)?;
                *local_mut(&mut s.locals, *index, offset)? = Some(v);
            }
            Op::DeleteFast(index) => {
                *local_mut(&mut s.locals, *index, offset)? = None;
            }
            Op::LoadDeref(index) | Op::LoadClassDeref(index) => {
                local(&s.cells, *index, offset)?;
                // another scope may rebind the cell at any time
                s.push(SlotType::OBJECT);
            }
            Op::StoreDeref(index) => {
                let v = s.pop(offset)?;
                *local_mut(&mut s.cells, *index, offset)? = Some(v);
            }
            Op::DeleteDeref(index) => {
                *local_mut(&mut s.cells, *index, offset)? = None;
            }
            Op::LoadClosure(index) => {
                local(&s.cells, *index, offset)?;
                s.push(SlotType::Instance(TypeId::CELL));
            }
            Op::LoadGlobal(name) | Op::LoadName(name) => s.push(typer.global_slot(name)),
            Op::StoreGlobal(_) | Op::StoreName(_) => {
                s.pop(offset)?;
            }
            Op::DeleteGlobal(_) | Op::DeleteName(_) => {}
            Op::LoadAttr(name) => {
                let obj = s.pop(offset)?;
                s.push(typer.attr_slot(&obj, name));
            }
            Op::StoreAttr(_) => {
                s.pop_n(2, offset)?;
            }
            Op::DeleteAttr(_) => {
                s.pop(offset)?;
            }
            Op::LoadMethod(name) => {
                let receiver = s.pop(offset)?;
                s.push(SlotType::Method {
                    receiver: receiver.runtime_type(),
                    name: name.clone(),
                });
                s.push(receiver);
            }
            Op::LoadBuildClass => s.push(SlotType::Instance(TypeId::FUNCTION)),
            Op::LoadAssertionError => s.push(SlotType::Class(TypeId::ASSERTION_ERROR)),
            Op::ImportName(_) => {
                s.pop_n(2, offset)?;
                s.push(SlotType::Instance(TypeId::MODULE));
            }
            Op::ImportFrom(_) => {
                s.peek(0, offset)?;
                s.push(SlotType::OBJECT);
            }
            Op::ImportStar | Op::PrintExpr => {
                s.pop(offset)?;
            }

            // -----------------------------------------------------------------
            // Collections
            // -----------------------------------------------------------------
            Op::BuildTuple(n) => build(&mut s, *n as usize, TypeId::TUPLE, offset)?,
            Op::BuildList(n) => build(&mut s, *n as usize, TypeId::LIST, offset)?,
            Op::BuildSet(n) => build(&mut s, *n as usize, TypeId::SET, offset)?,
            Op::BuildMap(n) => build(&mut s, 2 * *n as usize, TypeId::DICT, offset)?,
            Op::BuildConstKeyMap(n) => build(&mut s, *n as usize + 1, TypeId::DICT, offset)?,
            Op::BuildString(n) => build(&mut s, *n as usize, TypeId::STR, offset)?,
            Op::BuildSlice(n) => build(&mut s, *n as usize, TypeId::SLICE, offset)?,
            Op::ListToTuple => build(&mut s, 1, TypeId::TUPLE, offset)?,
            Op::ListAppend(depth)
            | Op::SetAdd(depth)
            | Op::ListExtend(depth)
            | Op::SetUpdate(depth)
            | Op::DictMerge(depth)
            | Op::DictUpdate(depth) => {
                s.pop(offset)?;
                s.peek((*depth as usize).saturating_sub(1), offset)?;
            }
            Op::MapAdd(depth) => {
                s.pop_n(2, offset)?;
                s.peek((*depth as usize).saturating_sub(1), offset)?;
            }
            Op::UnpackSequence(n) => {
                s.pop(offset)?;
                push_n(&mut s, *n, SlotType::OBJECT);
            }
            Op::UnpackEx { before: head, after } => {
                s.pop(offset)?;
                push_n(&mut s, *after, SlotType::OBJECT);
                s.push(SlotType::Instance(TypeId::LIST));
                push_n(&mut s, *head, SlotType::OBJECT);
            }
            Op::FormatValue(flags) => {
                let n = if flags & format_value::HAS_SPEC != 0 { 2 } else { 1 };
                build(&mut s, n, TypeId::STR, offset)?;
            }

            // -----------------------------------------------------------------
            // Calls
            // -----------------------------------------------------------------
            Op::CallFunction(argc) => {
                let args = s.pop_n(*argc as usize, offset)?;
                let callee = s.pop(offset)?;
                s.push(typer.resolve_call(&callee, &args, &[]).result());
            }
            Op::CallFunctionKw(argc) => {
                s.pop(offset)?;
                let args = s.pop_n(*argc as usize, offset)?;
                let callee = s.pop(offset)?;
                let result = match &before.pending_kw_names {
                    Some(names) => typer.resolve_call(&callee, &args, names).result(),
                    None => match typer.resolve_call(&callee, &[], &[]) {
                        CallTarget::Construct(ty) => SlotType::Instance(ty),
                        _ => SlotType::OBJECT,
                    },
                };
                s.push(result);
            }
            Op::CallFunctionEx { kwargs } => {
                if *kwargs {
                    s.pop(offset)?;
                }
                s.pop(offset)?;
                let callee = s.pop(offset)?;
                let result = match typer.resolve_call(&callee, &[], &[]) {
                    CallTarget::Construct(ty) => SlotType::Instance(ty),
                    _ => SlotType::OBJECT,
                };
                s.push(result);
            }
            Op::CallMethod(argc) => {
                let args = s.pop_n(*argc as usize, offset)?;
                s.pop(offset)?;
                let method = s.pop(offset)?;
                s.push(typer.resolve_call(&method, &args, &[]).result());
            }
            Op::MakeFunction(flags) => {
                let extras = [
                    make_function::DEFAULTS,
                    make_function::KW_DEFAULTS,
                    make_function::ANNOTATIONS,
                    make_function::CLOSURE,
                ]
                .iter()
                .filter(|&&bit| flags & bit != 0)
                .count();
                build(&mut s, 2 + extras, TypeId::FUNCTION, offset)?;
            }

            // -----------------------------------------------------------------
            // Control flow
            // -----------------------------------------------------------------
            Op::Jump { target } => return Ok(Transfer::jump(*target, s)),
            Op::PopJumpIf { target, .. } => {
                s.pop(offset)?;
                return Ok(Transfer::branch(s.clone(), *target, s));
            }
            Op::JumpIfOrPop { target, .. } => {
                let kept = s.clone();
                s.pop(offset)?;
                return Ok(Transfer::branch(s, *target, kept));
            }
            Op::JumpIfNotExcMatch { target } => {
                s.pop_n(2, offset)?;
                return Ok(Transfer::branch(s.clone(), *target, s));
            }
            Op::ReturnValue => {
                s.pop(offset)?;
                return Ok(Transfer::exit());
            }

            // -----------------------------------------------------------------
            // Exception control
            // -----------------------------------------------------------------
            Op::SetupFinally {
                handler,
                kind,
                reserve,
            } => {
                let level = s
                    .depth()
                    .checked_sub(*reserve as usize)
                    .ok_or(DecodeError::StackUnderflow { offset })? as u32;
                let taken = handler_entry(&s, level, offset)?;
                s.blocks.push(BlockFrame::Finally {
                    handler: *handler,
                    level,
                    kind: *kind,
                });
                return Ok(Transfer::branch(s, *handler, taken));
            }
            Op::SetupWith { handler } => {
                let manager = s.pop(offset)?;
                let ty = manager.runtime_type();
                s.push(SlotType::method(ty, "__exit__"));
                let level = s.depth() as u32;
                let taken = handler_entry(&s, level, offset)?;
                s.blocks.push(BlockFrame::Finally {
                    handler: *handler,
                    level,
                    kind: BlockKind::With,
                });
                s.push(result_or_object(typer.resolve_method(ty, "__enter__", &[], &[])));
                return Ok(Transfer::branch(s, *handler, taken));
            }
            Op::PopBlock => match s.blocks.pop() {
                Some(BlockFrame::Finally { .. }) => {}
                _ => return Err(DecodeError::NoBlockToPop { offset }),
            },
            Op::PopExcept => {
                match s.blocks.pop() {
                    Some(BlockFrame::ExceptHandler { .. }) => {}
                    _ => return Err(DecodeError::NotInExceptHandler { offset }),
                }
                s.pop_n(3, offset)?;
            }
            Op::Reraise { .. } => {
                s.pop_n(3, offset)?;
                return Ok(Transfer::exit());
            }
            Op::RaiseVarargs(n) => {
                s.pop_n(*n as usize, offset)?;
                return Ok(Transfer::exit());
            }
            Op::WithExceptStart => {
                let exit = s.peek(6, offset)?.clone();
                let args = [
                    s.peek(0, offset)?.clone(),
                    s.peek(1, offset)?.clone(),
                    s.peek(2, offset)?.clone(),
                ];
                s.push(typer.resolve_call(&exit, &args, &[]).result());
            }

            // -----------------------------------------------------------------
            // Generators
            // -----------------------------------------------------------------
            Op::YieldValue => {
                s.pop(offset)?;
                s.push(SlotType::OBJECT);
            }
            Op::YieldFrom => {
                s.pop_n(2, offset)?;
                s.push(SlotType::OBJECT);
            }
            Op::LoadSpecial(name) => {
                let receiver = s.pop(offset)?;
                s.push(SlotType::Method {
                    receiver: receiver.runtime_type(),
                    name: name.clone(),
                });
            }
            Op::Suspend { .. } => {
                s.pop(offset)?;
            }
            Op::ResumePoint { .. } => s.push(SlotType::OBJECT),
            Op::Delegate { exit, .. } => {
                s.pop(offset)?;
                let mut done = s.clone();
                done.pop(offset)?;
                done.push(SlotType::OBJECT);
                return Ok(Transfer::branch(s, *exit, done));
            }
        }

        Ok(Transfer::next(s))
    }
}

/// State delivered to a handler established at `level` by a block pushed on
/// top of `state`.
fn handler_entry(state: &StackMetadata, level: u32, offset: u32) -> DecodeResult<StackMetadata> {
    let mut entry = state.clone();
    entry.truncate(level, offset)?;
    entry.enter_handler(level);
    Ok(entry)
}

fn build(state: &mut StackMetadata, n: usize, ty: TypeId, offset: u32) -> DecodeResult<()> {
    state.pop_n(n, offset)?;
    state.push(SlotType::Instance(ty));
    Ok(())
}

fn local(vars: &[Option<SlotType>], index: u32, offset: u32) -> DecodeResult<&Option<SlotType>> {
    vars.get(index as usize).ok_or(DecodeError::LocalsMismatch { offset })
}

fn local_mut(vars: &mut [Option<SlotType>], index: u32, offset: u32) -> DecodeResult<&mut Option<SlotType>> {
    vars.get_mut(index as usize)
        .ok_or(DecodeError::LocalsMismatch { offset })
}

// =============================================================================
// Tests
// =============================================================================
