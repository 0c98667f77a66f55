//! The opcode family.
//!
//! Every decoded instruction becomes one [`Op`]. Operands are resolved at
//! decode time: names and constants are checked against the code object's
//! tables, jump operands are absolute offsets. The variant set is closed and
//! dispatched with exhaustive `match`; the stack effect lives in
//! [`effect`](self::effect) and lowering in [`lower`](self::lower).
//!
//! Synthetic variants (`LoadSpecial`, `ResumeDispatch`, `Suspend`,
//! `ResumePoint`, `Delegate`) never come out of the decoder; the desugaring
//! and generator passes introduce them.

pub mod effect;
pub mod lower;

use crate::error::{DecodeError, DecodeResult};
use crate::metadata::BlockKind;
use quill_bytecode::{BytecodeError, CodeObject, CompareOp, Instruction, OffsetMap, Opcode};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Operator Enums
// =============================================================================

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

impl UnaryOp {
    /// The special method implementing the operator. `not` has none: it
    /// always produces a `bool` through truth testing.
    pub const fn dunder(self) -> Option<&'static str> {
        match self {
            UnaryOp::Positive => Some("__pos__"),
            UnaryOp::Negative => Some("__neg__"),
            UnaryOp::Not => None,
            UnaryOp::Invert => Some("__invert__"),
        }
    }
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Power,
    Multiply,
    MatrixMultiply,
    FloorDivide,
    TrueDivide,
    Modulo,
    Add,
    Subtract,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

impl BinaryOp {
    /// Forward special method, e.g. `__add__`.
    pub const fn dunder(self) -> &'static str {
        match self {
            BinaryOp::Power => "__pow__",
            BinaryOp::Multiply => "__mul__",
            BinaryOp::MatrixMultiply => "__matmul__",
            BinaryOp::FloorDivide => "__floordiv__",
            BinaryOp::TrueDivide => "__truediv__",
            BinaryOp::Modulo => "__mod__",
            BinaryOp::Add => "__add__",
            BinaryOp::Subtract => "__sub__",
            BinaryOp::Lshift => "__lshift__",
            BinaryOp::Rshift => "__rshift__",
            BinaryOp::And => "__and__",
            BinaryOp::Xor => "__xor__",
            BinaryOp::Or => "__or__",
        }
    }

    /// Reflected special method, e.g. `__radd__`.
    pub const fn reflected(self) -> &'static str {
        match self {
            BinaryOp::Power => "__rpow__",
            BinaryOp::Multiply => "__rmul__",
            BinaryOp::MatrixMultiply => "__rmatmul__",
            BinaryOp::FloorDivide => "__rfloordiv__",
            BinaryOp::TrueDivide => "__rtruediv__",
            BinaryOp::Modulo => "__rmod__",
            BinaryOp::Add => "__radd__",
            BinaryOp::Subtract => "__rsub__",
            BinaryOp::Lshift => "__rlshift__",
            BinaryOp::Rshift => "__rrshift__",
            BinaryOp::And => "__rand__",
            BinaryOp::Xor => "__rxor__",
            BinaryOp::Or => "__ror__",
        }
    }

    /// In-place special method, e.g. `__iadd__`.
    pub const fn inplace(self) -> &'static str {
        match self {
            BinaryOp::Power => "__ipow__",
            BinaryOp::Multiply => "__imul__",
            BinaryOp::MatrixMultiply => "__imatmul__",
            BinaryOp::FloorDivide => "__ifloordiv__",
            BinaryOp::TrueDivide => "__itruediv__",
            BinaryOp::Modulo => "__imod__",
            BinaryOp::Add => "__iadd__",
            BinaryOp::Subtract => "__isub__",
            BinaryOp::Lshift => "__ilshift__",
            BinaryOp::Rshift => "__irshift__",
            BinaryOp::And => "__iand__",
            BinaryOp::Xor => "__ixor__",
            BinaryOp::Or => "__ior__",
        }
    }

    /// Operator symbol.
    pub const fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Power => "**",
            BinaryOp::Multiply => "*",
            BinaryOp::MatrixMultiply => "@",
            BinaryOp::FloorDivide => "//",
            BinaryOp::TrueDivide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Lshift => "<<",
            BinaryOp::Rshift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Xor => "^",
            BinaryOp::Or => "|",
        }
    }

    fn from_opcode(opcode: Opcode) -> Option<(BinaryOp, bool)> {
        use Opcode as O;
        Some(match opcode {
            O::BinaryPower => (BinaryOp::Power, false),
            O::BinaryMultiply => (BinaryOp::Multiply, false),
            O::BinaryMatrixMultiply => (BinaryOp::MatrixMultiply, false),
            O::BinaryFloorDivide => (BinaryOp::FloorDivide, false),
            O::BinaryTrueDivide => (BinaryOp::TrueDivide, false),
            O::BinaryModulo => (BinaryOp::Modulo, false),
            O::BinaryAdd => (BinaryOp::Add, false),
            O::BinarySubtract => (BinaryOp::Subtract, false),
            O::BinaryLshift => (BinaryOp::Lshift, false),
            O::BinaryRshift => (BinaryOp::Rshift, false),
            O::BinaryAnd => (BinaryOp::And, false),
            O::BinaryXor => (BinaryOp::Xor, false),
            O::BinaryOr => (BinaryOp::Or, false),
            O::InplacePower => (BinaryOp::Power, true),
            O::InplaceMultiply => (BinaryOp::Multiply, true),
            O::InplaceMatrixMultiply => (BinaryOp::MatrixMultiply, true),
            O::InplaceFloorDivide => (BinaryOp::FloorDivide, true),
            O::InplaceTrueDivide => (BinaryOp::TrueDivide, true),
            O::InplaceModulo => (BinaryOp::Modulo, true),
            O::InplaceAdd => (BinaryOp::Add, true),
            O::InplaceSubtract => (BinaryOp::Subtract, true),
            O::InplaceLshift => (BinaryOp::Lshift, true),
            O::InplaceRshift => (BinaryOp::Rshift, true),
            O::InplaceAnd => (BinaryOp::And, true),
            O::InplaceXor => (BinaryOp::Xor, true),
            O::InplaceOr => (BinaryOp::Or, true),
            _ => return None,
        })
    }
}

// =============================================================================
// Op
// =============================================================================

/// One instruction with its operands resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // Stack shuffles
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    /// Move TOS down to position `n` (3.10).
    RotN(u32),
    DupTop,
    DupTopTwo,
    Nop,

    // Operators
    Unary(UnaryOp),
    Binary { op: BinaryOp, inplace: bool },
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    Compare(CompareOp),
    IsOp { invert: bool },
    ContainsOp { invert: bool },

    // Iteration
    GetIter,
    GetYieldFromIter,
    /// Push the next item, or pop the iterator and jump to `exit`.
    ForIter { exit: u32 },

    // Names and constants
    LoadConst(u32),
    LoadFast(u32),
    StoreFast(u32),
    DeleteFast(u32),
    LoadDeref(u32),
    StoreDeref(u32),
    DeleteDeref(u32),
    LoadClosure(u32),
    LoadClassDeref(u32),
    LoadGlobal(Arc<str>),
    StoreGlobal(Arc<str>),
    DeleteGlobal(Arc<str>),
    LoadName(Arc<str>),
    StoreName(Arc<str>),
    DeleteName(Arc<str>),
    LoadAttr(Arc<str>),
    StoreAttr(Arc<str>),
    DeleteAttr(Arc<str>),
    LoadMethod(Arc<str>),
    LoadBuildClass,
    LoadAssertionError,
    ImportName(Arc<str>),
    ImportFrom(Arc<str>),
    ImportStar,
    SetupAnnotations,
    PrintExpr,

    // Collections
    BuildTuple(u32),
    BuildList(u32),
    BuildSet(u32),
    BuildMap(u32),
    BuildConstKeyMap(u32),
    BuildString(u32),
    BuildSlice(u32),
    ListToTuple,
    ListAppend(u32),
    SetAdd(u32),
    MapAdd(u32),
    ListExtend(u32),
    SetUpdate(u32),
    DictMerge(u32),
    DictUpdate(u32),
    UnpackSequence(u32),
    UnpackEx { before: u32, after: u32 },
    FormatValue(u32),

    // Calls
    CallFunction(u32),
    CallFunctionKw(u32),
    CallFunctionEx { kwargs: bool },
    CallMethod(u32),
    MakeFunction(u32),

    // Control flow
    Jump { target: u32 },
    PopJumpIf { when: bool, target: u32 },
    JumpIfOrPop { when: bool, target: u32 },
    JumpIfNotExcMatch { target: u32 },
    ReturnValue,

    // Exception control
    /// Push a protected block. `reserve` slots pushed after the block is
    /// established stay outside its stack level.
    SetupFinally {
        handler: u32,
        kind: BlockKind,
        reserve: u32,
    },
    SetupWith { handler: u32 },
    PopBlock,
    PopExcept,
    Reraise { restore_lasti: bool },
    RaiseVarargs(u32),
    WithExceptStart,

    // Generators
    YieldValue,
    YieldFrom,
    GenStart(u32),

    // Synthetic
    /// Look a special method up on the type of TOS and bind it.
    LoadSpecial(Arc<str>),
    /// Single resumption entry point: `(state, resume offset)` pairs.
    ResumeDispatch { states: Arc<[(u32, u32)]> },
    /// Save live state and hand TOS to the caller.
    Suspend { state: u32 },
    /// Continue after a suspension: push the sent value or raise the thrown
    /// exception.
    ResumePoint { state: u32 },
    /// One step of `yield from`: send TOS to the receiver below it and
    /// suspend on a yielded value, or jump to `exit` with the result.
    Delegate { state: u32, exit: u32 },
}

impl Op {
    // =========================================================================
    // Decoding
    // =========================================================================

    /// Resolve a decoded instruction against its code object.
    pub fn decode(inst: &Instruction, code: &CodeObject) -> DecodeResult<Op> {
        use Opcode as O;
        let offset = inst.offset;
        let arg = inst.arg;
        let opcode = inst.opcode;

        let target = || {
            inst.target.ok_or(DecodeError::InvalidOperand {
                offset,
                opcode: opcode.name(),
                arg,
            })
        };
        let name = || -> DecodeResult<Arc<str>> {
            code.names
                .get(arg as usize)
                .cloned()
                .ok_or(DecodeError::OperandOutOfRange {
                    offset,
                    opcode: opcode.name(),
                    index: arg,
                    table: "names",
                })
        };
        let local = || -> DecodeResult<u32> {
            if (arg as usize) < code.varnames.len() {
                Ok(arg)
            } else {
                Err(DecodeError::OperandOutOfRange {
                    offset,
                    opcode: opcode.name(),
                    index: arg,
                    table: "varnames",
                })
            }
        };
        let cell = || -> DecodeResult<u32> {
            if (arg as usize) < code.closure_size() {
                Ok(arg)
            } else {
                Err(DecodeError::OperandOutOfRange {
                    offset,
                    opcode: opcode.name(),
                    index: arg,
                    table: "cells",
                })
            }
        };
        let invalid = || DecodeError::InvalidOperand {
            offset,
            opcode: opcode.name(),
            arg,
        };

        Ok(match opcode {
            O::PopTop => Op::PopTop,
            O::RotTwo => Op::RotTwo,
            O::RotThree => Op::RotThree,
            O::RotFour => Op::RotFour,
            O::RotN => {
                if arg == 0 {
                    return Err(invalid());
                }
                Op::RotN(arg)
            }
            O::DupTop => Op::DupTop,
            O::DupTopTwo => Op::DupTopTwo,
            O::Nop => Op::Nop,

            O::UnaryPositive => Op::Unary(UnaryOp::Positive),
            O::UnaryNegative => Op::Unary(UnaryOp::Negative),
            O::UnaryNot => Op::Unary(UnaryOp::Not),
            O::UnaryInvert => Op::Unary(UnaryOp::Invert),
            O::BinarySubscr => Op::BinarySubscr,
            O::StoreSubscr => Op::StoreSubscr,
            O::DeleteSubscr => Op::DeleteSubscr,
            O::CompareOp => Op::Compare(CompareOp::from_arg(arg).ok_or_else(invalid)?),
            O::IsOp | O::ContainsOp => {
                if arg > 1 {
                    return Err(invalid());
                }
                let invert = arg == 1;
                if opcode == O::IsOp {
                    Op::IsOp { invert }
                } else {
                    Op::ContainsOp { invert }
                }
            }

            O::GetIter => Op::GetIter,
            O::GetYieldFromIter => Op::GetYieldFromIter,
            O::ForIter => Op::ForIter { exit: target()? },

            O::LoadConst => {
                if arg as usize >= code.constants.len() {
                    return Err(DecodeError::OperandOutOfRange {
                        offset,
                        opcode: opcode.name(),
                        index: arg,
                        table: "constants",
                    });
                }
                Op::LoadConst(arg)
            }
            O::LoadFast => Op::LoadFast(local()?),
            O::StoreFast => Op::StoreFast(local()?),
            O::DeleteFast => Op::DeleteFast(local()?),
            O::LoadDeref => Op::LoadDeref(cell()?),
            O::StoreDeref => Op::StoreDeref(cell()?),
            O::DeleteDeref => Op::DeleteDeref(cell()?),
            O::LoadClosure => Op::LoadClosure(cell()?),
            O::LoadClassderef => Op::LoadClassDeref(cell()?),
            O::LoadGlobal => Op::LoadGlobal(name()?),
            O::StoreGlobal => Op::StoreGlobal(name()?),
            O::DeleteGlobal => Op::DeleteGlobal(name()?),
            O::LoadName => Op::LoadName(name()?),
            O::StoreName => Op::StoreName(name()?),
            O::DeleteName => Op::DeleteName(name()?),
            O::LoadAttr => Op::LoadAttr(name()?),
            O::StoreAttr => Op::StoreAttr(name()?),
            O::DeleteAttr => Op::DeleteAttr(name()?),
            O::LoadMethod => Op::LoadMethod(name()?),
            O::LoadBuildClass => Op::LoadBuildClass,
            O::LoadAssertionError => Op::LoadAssertionError,
            O::ImportName => Op::ImportName(name()?),
            O::ImportFrom => Op::ImportFrom(name()?),
            O::ImportStar => Op::ImportStar,
            O::SetupAnnotations => Op::SetupAnnotations,
            O::PrintExpr => Op::PrintExpr,

            O::BuildTuple => Op::BuildTuple(arg),
            O::BuildList => Op::BuildList(arg),
            O::BuildSet => Op::BuildSet(arg),
            O::BuildMap => Op::BuildMap(arg),
            O::BuildConstKeyMap => Op::BuildConstKeyMap(arg),
            O::BuildString => Op::BuildString(arg),
            O::BuildSlice => {
                if arg != 2 && arg != 3 {
                    return Err(invalid());
                }
                Op::BuildSlice(arg)
            }
            O::ListToTuple => Op::ListToTuple,
            O::ListAppend => Op::ListAppend(arg),
            O::SetAdd => Op::SetAdd(arg),
            O::MapAdd => Op::MapAdd(arg),
            O::ListExtend => Op::ListExtend(arg),
            O::SetUpdate => Op::SetUpdate(arg),
            O::DictMerge => Op::DictMerge(arg),
            O::DictUpdate => Op::DictUpdate(arg),
            O::UnpackSequence => Op::UnpackSequence(arg),
            O::UnpackEx => Op::UnpackEx {
                before: arg & 0xff,
                after: arg >> 8,
            },
            O::FormatValue => Op::FormatValue(arg),

            O::CallFunction => Op::CallFunction(arg),
            O::CallFunctionKw => Op::CallFunctionKw(arg),
            O::CallFunctionEx => Op::CallFunctionEx {
                kwargs: arg & 1 != 0,
            },
            O::CallMethod => Op::CallMethod(arg),
            O::MakeFunction => Op::MakeFunction(arg),

            O::JumpForward | O::JumpAbsolute => Op::Jump { target: target()? },
            O::PopJumpIfFalse => Op::PopJumpIf {
                when: false,
                target: target()?,
            },
            O::PopJumpIfTrue => Op::PopJumpIf {
                when: true,
                target: target()?,
            },
            O::JumpIfFalseOrPop => Op::JumpIfOrPop {
                when: false,
                target: target()?,
            },
            O::JumpIfTrueOrPop => Op::JumpIfOrPop {
                when: true,
                target: target()?,
            },
            O::JumpIfNotExcMatch => Op::JumpIfNotExcMatch { target: target()? },
            O::ReturnValue => Op::ReturnValue,

            O::SetupFinally => Op::SetupFinally {
                handler: target()?,
                kind: BlockKind::Try,
                reserve: 0,
            },
            O::SetupWith => Op::SetupWith { handler: target()? },
            O::PopBlock => Op::PopBlock,
            O::PopExcept => Op::PopExcept,
            O::Reraise39 => Op::Reraise {
                restore_lasti: false,
            },
            O::Reraise => Op::Reraise {
                restore_lasti: arg != 0,
            },
            O::RaiseVarargs => {
                if arg > 2 {
                    return Err(invalid());
                }
                Op::RaiseVarargs(arg)
            }
            O::WithExceptStart => Op::WithExceptStart,

            O::YieldValue => Op::YieldValue,
            O::YieldFrom => Op::YieldFrom,
            O::GenStart => Op::GenStart(arg),

            O::GetLen
            | O::MatchMapping
            | O::MatchSequence
            | O::MatchKeys
            | O::MatchClass
            | O::CopyDictWithoutKeys
            | O::GetAiter
            | O::GetAnext
            | O::BeforeAsyncWith
            | O::EndAsyncFor
            | O::GetAwaitable
            | O::SetupAsyncWith
            | O::ExtendedArg => {
                return Err(BytecodeError::UnsupportedOpcode { opcode, offset }.into());
            }

            O::BinaryPower
            | O::BinaryMultiply
            | O::BinaryMatrixMultiply
            | O::BinaryFloorDivide
            | O::BinaryTrueDivide
            | O::BinaryModulo
            | O::BinaryAdd
            | O::BinarySubtract
            | O::BinaryLshift
            | O::BinaryRshift
            | O::BinaryAnd
            | O::BinaryXor
            | O::BinaryOr
            | O::InplacePower
            | O::InplaceMultiply
            | O::InplaceMatrixMultiply
            | O::InplaceFloorDivide
            | O::InplaceTrueDivide
            | O::InplaceModulo
            | O::InplaceAdd
            | O::InplaceSubtract
            | O::InplaceLshift
            | O::InplaceRshift
            | O::InplaceAnd
            | O::InplaceXor
            | O::InplaceOr => {
                let (op, inplace) = BinaryOp::from_opcode(opcode).ok_or_else(invalid)?;
                Op::Binary { op, inplace }
            }
        })
    }

    // =========================================================================
    // Control Flow Queries
    // =========================================================================

    /// Whether execution never falls through to the next instruction.
    pub fn is_forced_jump(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. } | Op::ReturnValue | Op::Reraise { .. } | Op::RaiseVarargs(_)
        )
    }

    /// Conditional or unconditional branch target, excluding handlers.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Op::Jump { target }
            | Op::PopJumpIf { target, .. }
            | Op::JumpIfOrPop { target, .. }
            | Op::JumpIfNotExcMatch { target } => Some(*target),
            Op::ForIter { exit } | Op::Delegate { exit, .. } => Some(*exit),
            _ => None,
        }
    }

    /// Handler entry established by this instruction.
    pub fn handler_target(&self) -> Option<u32> {
        match self {
            Op::SetupFinally { handler, .. } | Op::SetupWith { handler } => Some(*handler),
            _ => None,
        }
    }

    /// Every offset this op names, in a stable order.
    pub fn targets(&self) -> SmallVec<[u32; 2]> {
        let mut out = SmallVec::new();
        if let Some(t) = self.branch_target() {
            out.push(t);
        }
        if let Some(t) = self.handler_target() {
            out.push(t);
        }
        if let Op::ResumeDispatch { states } = self {
            out.extend(states.iter().map(|&(_, t)| t));
        }
        out
    }

    /// Whether the instruction can end in its fall-through successor by
    /// handing control to the generator's caller.
    pub fn suspends(&self) -> bool {
        matches!(self, Op::Suspend { .. } | Op::Delegate { .. })
    }

    /// Whether executing the op may raise an exception.
    pub fn may_raise(&self) -> bool {
        !matches!(
            self,
            Op::PopTop
                | Op::RotTwo
                | Op::RotThree
                | Op::RotFour
                | Op::RotN(_)
                | Op::DupTop
                | Op::DupTopTwo
                | Op::Nop
                | Op::LoadConst(_)
                | Op::StoreFast(_)
                | Op::LoadClosure(_)
                | Op::Jump { .. }
                | Op::SetupFinally { .. }
                | Op::PopBlock
                | Op::PopExcept
                | Op::ReturnValue
                | Op::ResumeDispatch { .. }
                | Op::Suspend { .. }
                | Op::GenStart(_)
                | Op::BuildTuple(_)
                | Op::BuildList(_)
                | Op::BuildSlice(_)
                | Op::ListToTuple
        )
    }

    // =========================================================================
    // Relabelling
    // =========================================================================

    /// A copy of the op with every offset mapped through `map`.
    ///
    /// Returns the first old offset missing from the map as the error.
    pub fn relabel(&self, map: &OffsetMap) -> Result<Op, u32> {
        let m = |old: u32| map.get(old).ok_or(old);
        Ok(match self {
            Op::ForIter { exit } => Op::ForIter { exit: m(*exit)? },
            Op::Jump { target } => Op::Jump { target: m(*target)? },
            Op::PopJumpIf { when, target } => Op::PopJumpIf {
                when: *when,
                target: m(*target)?,
            },
            Op::JumpIfOrPop { when, target } => Op::JumpIfOrPop {
                when: *when,
                target: m(*target)?,
            },
            Op::JumpIfNotExcMatch { target } => Op::JumpIfNotExcMatch {
                target: m(*target)?,
            },
            Op::SetupFinally {
                handler,
                kind,
                reserve,
            } => Op::SetupFinally {
                handler: m(*handler)?,
                kind: *kind,
                reserve: *reserve,
            },
            Op::SetupWith { handler } => Op::SetupWith {
                handler: m(*handler)?,
            },
            Op::Delegate { state, exit } => Op::Delegate {
                state: *state,
                exit: m(*exit)?,
            },
            Op::ResumeDispatch { states } => Op::ResumeDispatch {
                states: states
                    .iter()
                    .map(|&(s, t)| m(t).map(|t| (s, t)))
                    .collect::<Result<_, _>>()?,
            },
            other => other.clone(),
        })
    }

    // =========================================================================
    // Display
    // =========================================================================

    /// Mnemonic, matching CPython's where one exists.
    pub fn name(&self) -> &'static str {
        match self {
            Op::PopTop => "POP_TOP",
            Op::RotTwo => "ROT_TWO",
            Op::RotThree => "ROT_THREE",
            Op::RotFour => "ROT_FOUR",
            Op::RotN(_) => "ROT_N",
            Op::DupTop => "DUP_TOP",
            Op::DupTopTwo => "DUP_TOP_TWO",
            Op::Nop => "NOP",
            Op::Unary(UnaryOp::Positive) => "UNARY_POSITIVE",
            Op::Unary(UnaryOp::Negative) => "UNARY_NEGATIVE",
            Op::Unary(UnaryOp::Not) => "UNARY_NOT",
            Op::Unary(UnaryOp::Invert) => "UNARY_INVERT",
            Op::Binary { inplace: false, .. } => "BINARY_OP",
            Op::Binary { inplace: true, .. } => "INPLACE_OP",
            Op::BinarySubscr => "BINARY_SUBSCR",
            Op::StoreSubscr => "STORE_SUBSCR",
            Op::DeleteSubscr => "DELETE_SUBSCR",
            Op::Compare(_) => "COMPARE_OP",
            Op::IsOp { .. } => "IS_OP",
            Op::ContainsOp { .. } => "CONTAINS_OP",
            Op::GetIter => "GET_ITER",
            Op::GetYieldFromIter => "GET_YIELD_FROM_ITER",
            Op::ForIter { .. } => "FOR_ITER",
            Op::LoadConst(_) => "LOAD_CONST",
            Op::LoadFast(_) => "LOAD_FAST",
            Op::StoreFast(_) => "STORE_FAST",
            Op::DeleteFast(_) => "DELETE_FAST",
            Op::LoadDeref(_) => "LOAD_DEREF",
            Op::StoreDeref(_) => "STORE_DEREF",
            Op::DeleteDeref(_) => "DELETE_DEREF",
            Op::LoadClosure(_) => "LOAD_CLOSURE",
            Op::LoadClassDeref(_) => "LOAD_CLASSDEREF",
            Op::LoadGlobal(_) => "LOAD_GLOBAL",
            Op::StoreGlobal(_) => "STORE_GLOBAL",
            Op::DeleteGlobal(_) => "DELETE_GLOBAL",
            Op::LoadName(_) => "LOAD_NAME",
            Op::StoreName(_) => "STORE_NAME",
            Op::DeleteName(_) => "DELETE_NAME",
            Op::LoadAttr(_) => "LOAD_ATTR",
            Op::StoreAttr(_) => "STORE_ATTR",
            Op::DeleteAttr(_) => "DELETE_ATTR",
            Op::LoadMethod(_) => "LOAD_METHOD",
            Op::LoadBuildClass => "LOAD_BUILD_CLASS",
            Op::LoadAssertionError => "LOAD_ASSERTION_ERROR",
            Op::ImportName(_) => "IMPORT_NAME",
            Op::ImportFrom(_) => "IMPORT_FROM",
            Op::ImportStar => "IMPORT_STAR",
            Op::SetupAnnotations => "SETUP_ANNOTATIONS",
            Op::PrintExpr => "PRINT_EXPR",
            Op::BuildTuple(_) => "BUILD_TUPLE",
            Op::BuildList(_) => "BUILD_LIST",
            Op::BuildSet(_) => "BUILD_SET",
            Op::BuildMap(_) => "BUILD_MAP",
            Op::BuildConstKeyMap(_) => "BUILD_CONST_KEY_MAP",
            Op::BuildString(_) => "BUILD_STRING",
            Op::BuildSlice(_) => "BUILD_SLICE",
            Op::ListToTuple => "LIST_TO_TUPLE",
            Op::ListAppend(_) => "LIST_APPEND",
            Op::SetAdd(_) => "SET_ADD",
            Op::MapAdd(_) => "MAP_ADD",
            Op::ListExtend(_) => "LIST_EXTEND",
            Op::SetUpdate(_) => "SET_UPDATE",
            Op::DictMerge(_) => "DICT_MERGE",
            Op::DictUpdate(_) => "DICT_UPDATE",
            Op::UnpackSequence(_) => "UNPACK_SEQUENCE",
            Op::UnpackEx { .. } => "UNPACK_EX",
            Op::FormatValue(_) => "FORMAT_VALUE",
            Op::CallFunction(_) => "CALL_FUNCTION",
            Op::CallFunctionKw(_) => "CALL_FUNCTION_KW",
            Op::CallFunctionEx { .. } => "CALL_FUNCTION_EX",
            Op::CallMethod(_) => "CALL_METHOD",
            Op::MakeFunction(_) => "MAKE_FUNCTION",
            Op::Jump { .. } => "JUMP",
            Op::PopJumpIf { when: false, .. } => "POP_JUMP_IF_FALSE",
            Op::PopJumpIf { when: true, .. } => "POP_JUMP_IF_TRUE",
            Op::JumpIfOrPop { when: false, .. } => "JUMP_IF_FALSE_OR_POP",
            Op::JumpIfOrPop { when: true, .. } => "JUMP_IF_TRUE_OR_POP",
            Op::JumpIfNotExcMatch { .. } => "JUMP_IF_NOT_EXC_MATCH",
            Op::ReturnValue => "RETURN_VALUE",
            Op::SetupFinally { .. } => "SETUP_FINALLY",
            Op::SetupWith { .. } => "SETUP_WITH",
            Op::PopBlock => "POP_BLOCK",
            Op::PopExcept => "POP_EXCEPT",
            Op::Reraise { .. } => "RERAISE",
            Op::RaiseVarargs(_) => "RAISE_VARARGS",
            Op::WithExceptStart => "WITH_EXCEPT_START",
            Op::YieldValue => "YIELD_VALUE",
            Op::YieldFrom => "YIELD_FROM",
            Op::GenStart(_) => "GEN_START",
            Op::LoadSpecial(_) => "LOAD_SPECIAL",
            Op::ResumeDispatch { .. } => "RESUME_DISPATCH",
            Op::Suspend { .. } => "SUSPEND",
            Op::ResumePoint { .. } => "RESUME_POINT",
            Op::Delegate { .. } => "DELEGATE",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Op::RotN(n)
            | Op::LoadConst(n)
            | Op::LoadFast(n)
            | Op::StoreFast(n)
            | Op::DeleteFast(n)
            | Op::LoadDeref(n)
            | Op::StoreDeref(n)
            | Op::DeleteDeref(n)
            | Op::LoadClosure(n)
            | Op::LoadClassDeref(n)
            | Op::BuildTuple(n)
            | Op::BuildList(n)
            | Op::BuildSet(n)
            | Op::BuildMap(n)
            | Op::BuildConstKeyMap(n)
            | Op::BuildString(n)
            | Op::BuildSlice(n)
            | Op::ListAppend(n)
            | Op::SetAdd(n)
            | Op::MapAdd(n)
            | Op::ListExtend(n)
            | Op::SetUpdate(n)
            | Op::DictMerge(n)
            | Op::DictUpdate(n)
            | Op::UnpackSequence(n)
            | Op::FormatValue(n)
            | Op::CallFunction(n)
            | Op::CallFunctionKw(n)
            | Op::CallMethod(n)
            | Op::MakeFunction(n)
            | Op::RaiseVarargs(n)
            | Op::GenStart(n) => write!(f, "{:<24} {}", name, n),
            Op::LoadGlobal(s)
            | Op::StoreGlobal(s)
            | Op::DeleteGlobal(s)
            | Op::LoadName(s)
            | Op::StoreName(s)
            | Op::DeleteName(s)
            | Op::LoadAttr(s)
            | Op::StoreAttr(s)
            | Op::DeleteAttr(s)
            | Op::LoadMethod(s)
            | Op::ImportName(s)
            | Op::ImportFrom(s)
            | Op::LoadSpecial(s) => write!(f, "{:<24} {}", name, s),
            Op::Binary { op, .. } => write!(f, "{:<24} {}", name, op.symbol()),
            Op::Compare(op) => write!(f, "{:<24} {}", name, op.symbol()),
            Op::IsOp { invert } | Op::ContainsOp { invert } => {
                write!(f, "{:<24} {}", name, u8::from(*invert))
            }
            Op::UnpackEx { before, after } => write!(f, "{:<24} {} {}", name, before, after),
            Op::CallFunctionEx { kwargs } => write!(f, "{:<24} {}", name, u8::from(*kwargs)),
            Op::Reraise { restore_lasti } => write!(f, "{:<24} {}", name, u8::from(*restore_lasti)),
            Op::SetupFinally {
                handler,
                kind,
                reserve,
            } => write!(f, "{:<24} to {} ({:?}, reserve {})", name, handler, kind, reserve),
            Op::ResumeDispatch { states } => {
                write!(f, "{:<24}", name)?;
                for (state, target) in states.iter() {
                    write!(f, " {}->{}", state, target)?;
                }
                Ok(())
            }
            Op::Suspend { state } | Op::ResumePoint { state } => {
                write!(f, "{:<24} {}", name, state)
            }
            Op::Delegate { state, exit } => write!(f, "{:<24} {} (exit {})", name, state, exit),
            _ => match self.branch_target().or(self.handler_target()) {
                Some(target) => write!(f, "{:<24} to {}", name, target),
                None => f.write_str(name),
            },
        }
    }
}

// =============================================================================
// Instr
// =============================================================================

/// An op at its position in a function body.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// Dense position in the function body.
    pub offset: u32,
    pub op: Op,
    /// Source line, when known.
    pub line: Option<u32>,
    /// Offset of the originating instruction in the raw bytecode, `None` for
    /// synthetic instructions.
    pub origin: Option<u32>,
    /// Whether some op names this instruction as a target.
    pub is_jump_target: bool,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_jump_target { ">>" } else { "  " };
        write!(f, "{} {:>4} {}", marker, self.offset, self.op)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{Constant, InstructionStream, PythonVersion};

    fn code(words: &[(Opcode, u8)]) -> CodeObject {
        let mut code = CodeObject::new("f", "f.py");
        code.version = PythonVersion::V3_10;
        code.code = words.iter().flat_map(|&(op, arg)| [op.byte(), arg]).collect();
        code.constants = vec![Constant::None].into_boxed_slice();
        code.names = vec![Arc::from("x")].into_boxed_slice();
        code.varnames = vec![Arc::from("a")].into_boxed_slice();
        code
    }

    fn decode_all(code: &CodeObject) -> DecodeResult<Vec<Op>> {
        let stream = InstructionStream::decode(code)?;
        stream.iter().map(|inst| Op::decode(inst, code)).collect()
    }

    #[test]
    fn test_decode_resolves_names() {
        let c = code(&[
            (Opcode::LoadGlobal, 0),
            (Opcode::LoadAttr, 0),
            (Opcode::ReturnValue, 0),
        ]);
        let ops = decode_all(&c).unwrap();
        assert_eq!(ops[0], Op::LoadGlobal(Arc::from("x")));
        assert_eq!(ops[1], Op::LoadAttr(Arc::from("x")));
    }

    #[test]
    fn test_decode_operand_out_of_range() {
        let c = code(&[(Opcode::LoadConst, 3), (Opcode::ReturnValue, 0)]);
        assert_eq!(
            decode_all(&c),
            Err(DecodeError::OperandOutOfRange {
                offset: 0,
                opcode: "LOAD_CONST",
                index: 3,
                table: "constants",
            })
        );

        let c = code(&[(Opcode::LoadFast, 1), (Opcode::ReturnValue, 0)]);
        assert!(matches!(
            decode_all(&c),
            Err(DecodeError::OperandOutOfRange { table: "varnames", .. })
        ));
    }

    #[test]
    fn test_decode_binary_families() {
        let c = code(&[
            (Opcode::LoadFast, 0),
            (Opcode::LoadFast, 0),
            (Opcode::InplaceAdd, 0),
            (Opcode::ReturnValue, 0),
        ]);
        let ops = decode_all(&c).unwrap();
        assert_eq!(
            ops[2],
            Op::Binary {
                op: BinaryOp::Add,
                inplace: true
            }
        );
    }

    #[test]
    fn test_decode_invalid_compare() {
        let c = code(&[(Opcode::CompareOp, 9), (Opcode::ReturnValue, 0)]);
        assert!(matches!(decode_all(&c), Err(DecodeError::InvalidOperand { arg: 9, .. })));
    }

    #[test]
    fn test_reraise_by_version() {
        let mut c = code(&[(Opcode::Reraise39, 0)]);
        c.version = PythonVersion::V3_9;
        assert_eq!(
            decode_all(&c).unwrap()[0],
            Op::Reraise {
                restore_lasti: false
            }
        );
        let c = code(&[(Opcode::Reraise, 1)]);
        assert_eq!(
            decode_all(&c).unwrap()[0],
            Op::Reraise {
                restore_lasti: true
            }
        );
    }

    #[test]
    fn test_forced_jumps_and_raise() {
        assert!(Op::ReturnValue.is_forced_jump());
        assert!(Op::Jump { target: 0 }.is_forced_jump());
        assert!(!Op::PopJumpIf { when: true, target: 0 }.is_forced_jump());
        assert!(!Op::LoadConst(0).may_raise());
        assert!(Op::LoadFast(0).may_raise());
        assert!(Op::CallFunction(0).may_raise());
    }

    #[test]
    fn test_relabel_maps_every_target() {
        let mut map = OffsetMap::new();
        map.insert(4, 9);
        map.insert(6, 12);
        let op = Op::SetupFinally {
            handler: 6,
            kind: BlockKind::With,
            reserve: 1,
        };
        assert_eq!(
            op.relabel(&map),
            Ok(Op::SetupFinally {
                handler: 12,
                kind: BlockKind::With,
                reserve: 1
            })
        );
        let dispatch = Op::ResumeDispatch {
            states: Arc::from(vec![(1, 4), (2, 6)]),
        };
        assert_eq!(dispatch.relabel(&map).unwrap().targets().as_slice(), &[9, 12]);
        assert_eq!(Op::Jump { target: 5 }.relabel(&map), Err(5));
        assert_eq!(Op::PopTop.relabel(&map), Ok(Op::PopTop));
    }

    #[test]
    fn test_display() {
        assert_eq!(Op::ReturnValue.to_string(), "RETURN_VALUE");
        assert!(Op::Jump { target: 7 }.to_string().ends_with("to 7"));
        assert!(Op::LoadAttr(Arc::from("y")).to_string().ends_with(" y"));
    }
}
