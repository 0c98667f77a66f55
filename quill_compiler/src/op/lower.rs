//! Lowering decisions handed to the emitter.
//!
//! Lowering runs only after the fixed point is known, so every fact used here
//! holds on all paths reaching the instruction. That is what makes
//! [`Lowering::Specialized`] and [`Lowering::DirectCall`] safe to act on.

use super::effect::{CallTarget, Typer};
use super::{Instr, Op, UnaryOp};
use crate::emit::{EmitSite, Emitter};
use crate::error::EmitError;
use crate::metadata::{SlotType, StackMetadata};
use quill_types::{Signature, TypeId};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

/// How the emitter should realise one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lowering {
    /// Bookkeeping fully resolved at translation time; emit nothing.
    Elided,
    /// Generic dynamic dispatch.
    Dynamic,
    /// Operand types are proven; the result has the given type.
    Specialized {
        operands: SmallVec<[TypeId; 3]>,
        result: TypeId,
    },
    /// Call the named overload directly.
    DirectCall {
        owner: TypeId,
        name: Arc<str>,
        signature: Arc<Signature>,
    },
    /// Return TOS; `checked` when it must be converted to the declared
    /// return type.
    Return { checked: bool },
    /// Save live state and leave with the given resume state.
    Suspend { state: u32 },
    /// Re-enter at the given state.
    Resume { state: u32 },
}

fn operand_types(state: &StackMetadata, n: usize) -> SmallVec<[TypeId; 3]> {
    let at = state.stack.len().saturating_sub(n);
    state.stack[at..].iter().map(SlotType::runtime_type).collect()
}

impl Op {
    /// Decide how to lower this op given its final before-state.
    ///
    /// `ret` is the declared return type of the function being translated.
    pub fn lowering(&self, before: &StackMetadata, typer: &Typer<'_>, ret: TypeId) -> Lowering {
        let top = |n: usize| before.stack.len().checked_sub(n + 1).map(|i| &before.stack[i]);
        let specialized = |n: usize, result: TypeId| Lowering::Specialized {
            operands: operand_types(before, n),
            result,
        };

        match self {
            Op::Nop | Op::GenStart(_) | Op::SetupFinally { .. } | Op::PopBlock => Lowering::Elided,

            Op::Unary(UnaryOp::Not) => specialized(1, TypeId::BOOL),
            Op::Unary(op) => match top(0).and_then(|v| typer.resolve_unary(*op, v)) {
                Some(r) => specialized(1, r.signature.return_type),
                None => Lowering::Dynamic,
            },
            Op::Binary { op, inplace } => match (top(1), top(0)) {
                (Some(l), Some(r)) => match typer.resolve_binary(*op, *inplace, l, r) {
                    Some(r) => specialized(2, r.signature.return_type),
                    None => Lowering::Dynamic,
                },
                _ => Lowering::Dynamic,
            },
            Op::Compare(op) => match (top(1), top(0)) {
                (Some(l), Some(r)) => match typer.resolve_compare(*op, l, r) {
                    Some(r) => specialized(2, r.signature.return_type),
                    None => Lowering::Dynamic,
                },
                _ => Lowering::Dynamic,
            },
            Op::BinarySubscr => match (top(1), top(0)) {
                (Some(c), Some(i)) => {
                    match typer.resolve_method(c.runtime_type(), "__getitem__", std::slice::from_ref(i), &[]) {
                        Some(r) => specialized(2, r.signature.return_type),
                        None => Lowering::Dynamic,
                    }
                }
                _ => Lowering::Dynamic,
            },
            Op::IsOp { .. } => specialized(2, TypeId::BOOL),

            Op::CallFunction(argc) | Op::CallMethod(argc) => {
                let argc = *argc as usize;
                let depth = before.depth();
                let callee_at = match self {
                    Op::CallMethod(_) => depth.checked_sub(argc + 2),
                    _ => depth.checked_sub(argc + 1),
                };
                let Some(callee_at) = callee_at else {
                    return Lowering::Dynamic;
                };
                let args = &before.stack[depth - argc..];
                match typer.resolve_call(&before.stack[callee_at], args, &[]) {
                    CallTarget::Method(r) => Lowering::DirectCall {
                        owner: r.signature.owner,
                        name: r.name,
                        signature: r.signature,
                    },
                    CallTarget::Construct(ty) => Lowering::Specialized {
                        operands: args.iter().map(SlotType::runtime_type).collect(),
                        result: ty,
                    },
                    CallTarget::Dynamic => Lowering::Dynamic,
                }
            }

            Op::ReturnValue => {
                let checked = match top(0) {
                    Some(v) => ret != TypeId::OBJECT && !typer.model.is_subtype(v.runtime_type(), ret),
                    None => true,
                };
                Lowering::Return { checked }
            }

            Op::Suspend { state } | Op::Delegate { state, .. } => Lowering::Suspend { state: *state },
            Op::ResumePoint { state } => Lowering::Resume { state: *state },

            Op::LoadConst(index) => Lowering::Specialized {
                operands: smallvec![],
                result: typer.const_slot(*index).runtime_type(),
            },

            _ => Lowering::Dynamic,
        }
    }
}

impl Instr {
    /// Hand this instruction to the emitter with its lowering.
    pub fn emit<E: Emitter + ?Sized>(
        &self,
        before: &StackMetadata,
        typer: &Typer<'_>,
        ret: TypeId,
        emitter: &mut E,
    ) -> Result<(), EmitError> {
        let lowering = self.op.lowering(before, typer, ret);
        emitter.emit(EmitSite {
            instr: self,
            before,
            lowering,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
