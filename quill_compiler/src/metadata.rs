//! Abstract machine state: the per-instruction stack metadata.
//!
//! # Lattice
//!
//! ```text
//!          None (unknown local)           <- top, locals only
//!              |
//!        Instance(object)
//!        /           \
//!  Instance(type)   Instance(method)   Instance(int) ...
//!       |                 |                 |
//!   Class(T)        Method{T, name}    Instance(bool)
//!
//!          dead                           <- bottom, whole state
//! ```
//!
//! Joining two instance types takes their common supertype, which is always
//! a strict ancestor of at least one side unless they are equal. Ascent is
//! therefore bounded by the model's inheritance depth plus the two extra
//! levels above (`Class`/`Method` to their runtime type, and locals to
//! unknown).

use crate::error::{DecodeError, DecodeResult};
use quill_types::{TypeId, TypeModel};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Slot Types
// =============================================================================

/// The inferred type of one stack slot or variable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// A value whose type is (a subtype of) the given type.
    Instance(TypeId),
    /// The class object itself. Calling it constructs an instance.
    Class(TypeId),
    /// A method of a known receiver type, or a builtin function when the
    /// receiver is [`TypeId::BUILTINS`].
    Method { receiver: TypeId, name: Arc<str> },
}

impl SlotType {
    /// The universal type.
    pub const OBJECT: SlotType = SlotType::Instance(TypeId::OBJECT);

    /// Shorthand for `Instance(ty)`.
    #[inline]
    pub const fn instance(ty: TypeId) -> Self {
        SlotType::Instance(ty)
    }

    /// Shorthand for a method slot.
    pub fn method(receiver: TypeId, name: &str) -> Self {
        SlotType::Method {
            receiver,
            name: Arc::from(name),
        }
    }

    /// The type of the value at run time.
    pub fn runtime_type(&self) -> TypeId {
        match self {
            SlotType::Instance(ty) => *ty,
            SlotType::Class(_) => TypeId::TYPE,
            SlotType::Method { .. } => TypeId::METHOD,
        }
    }

    /// Whether nothing is known beyond `object`.
    #[inline]
    pub fn is_object(&self) -> bool {
        *self == SlotType::OBJECT
    }

    /// Least upper bound of two slots.
    pub fn join(&self, other: &SlotType, model: &TypeModel) -> SlotType {
        if self == other {
            return self.clone();
        }
        SlotType::Instance(model.common_supertype(self.runtime_type(), other.runtime_type()))
    }

    /// Whether `self` is at or below `other` in the lattice.
    pub fn is_within(&self, other: &SlotType, model: &TypeModel) -> bool {
        self.join(other, model) == *other
    }

    /// Human-readable rendering using the model's type names.
    pub fn describe(&self, model: &TypeModel) -> String {
        match self {
            SlotType::Instance(ty) => model.name(*ty).to_string(),
            SlotType::Class(ty) => format!("type[{}]", model.name(*ty)),
            SlotType::Method { receiver, name } => format!("{}.{}", model.name(*receiver), name),
        }
    }
}

impl fmt::Debug for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Instance(ty) => write!(f, "{}", ty),
            SlotType::Class(ty) => write!(f, "type[{}]", ty),
            SlotType::Method { receiver, name } => write!(f, "{}.{}", receiver, name),
        }
    }
}

// =============================================================================
// Handler Blocks
// =============================================================================

/// Which construct established a protected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// `SETUP_FINALLY` from a `try` statement.
    Try,
    /// `SETUP_WITH`, or its desugared form.
    With,
}

/// One entry of the abstract handler-block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockFrame {
    /// A protected region: exceptions unwind to `handler` with the operand
    /// stack cut back to `level`.
    Finally {
        handler: u32,
        level: u32,
        kind: BlockKind,
    },
    /// An exception is being handled; the saved exception info occupies
    /// stack slots `level..level + 3`.
    ExceptHandler { level: u32 },
}

impl BlockFrame {
    /// Stack level recorded by the block.
    pub fn level(&self) -> u32 {
        match self {
            BlockFrame::Finally { level, .. } | BlockFrame::ExceptHandler { level } => *level,
        }
    }
}

/// Where an exception raised under a given state is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwind {
    /// Handler entry offset.
    pub handler: u32,
    /// Stack level the operand stack is cut back to.
    pub level: u32,
    /// Kind of block that established the handler.
    pub kind: BlockKind,
    /// Level of the outermost except-handler block dropped on the way, whose
    /// saved exception info must be restored.
    pub restore_exc_info_at: Option<u32>,
}

// =============================================================================
// Stack Metadata
// =============================================================================

/// Inferred abstract machine state before (or after) one instruction.
#[derive(Clone, PartialEq, Eq)]
pub struct StackMetadata {
    /// Operand stack, bottom first.
    pub stack: SmallVec<[SlotType; 8]>,
    /// Fast locals by slot; `None` means unassigned or unknown.
    pub locals: Box<[Option<SlotType>]>,
    /// Closure cells (cell variables, then free variables).
    pub cells: Box<[Option<SlotType>]>,
    /// Handler-block stack, outermost first.
    pub blocks: SmallVec<[BlockFrame; 4]>,
    /// No execution reaches this state.
    pub dead: bool,
    /// Keyword names loaded for an upcoming `CALL_FUNCTION_KW`.
    pub pending_kw_names: Option<Arc<[Arc<str>]>>,
}

/// The fixed handler-entry stack suffix: the previously handled exception
/// (saved for restoration) under the active one.
pub fn exception_sextuple() -> [SlotType; 6] {
    let triple = [
        SlotType::Instance(TypeId::TRACEBACK),
        SlotType::Instance(TypeId::BASE_EXCEPTION),
        SlotType::Instance(TypeId::TYPE),
    ];
    [
        triple[0].clone(),
        triple[1].clone(),
        triple[2].clone(),
        triple[0].clone(),
        triple[1].clone(),
        triple[2].clone(),
    ]
}

impl StackMetadata {
    /// The bottom state: unreachable.
    pub fn dead(locals: usize, cells: usize) -> Self {
        Self {
            stack: SmallVec::new(),
            locals: vec![None; locals].into_boxed_slice(),
            cells: vec![None; cells].into_boxed_slice(),
            blocks: SmallVec::new(),
            dead: true,
            pending_kw_names: None,
        }
    }

    /// A live state with an empty stack and the given locals.
    pub fn entry(locals: Vec<Option<SlotType>>, cells: usize) -> Self {
        Self {
            stack: SmallVec::new(),
            locals: locals.into_boxed_slice(),
            cells: vec![None; cells].into_boxed_slice(),
            blocks: SmallVec::new(),
            dead: false,
            pending_kw_names: None,
        }
    }

    /// Operand stack depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push a slot.
    #[inline]
    pub fn push(&mut self, slot: SlotType) {
        self.stack.push(slot);
    }

    /// Pop the top slot.
    pub fn pop(&mut self, offset: u32) -> DecodeResult<SlotType> {
        self.stack.pop().ok_or(DecodeError::StackUnderflow { offset })
    }

    /// Pop `n` slots, returned bottom first.
    pub fn pop_n(&mut self, n: usize, offset: u32) -> DecodeResult<SmallVec<[SlotType; 4]>> {
        if n > self.stack.len() {
            return Err(DecodeError::StackUnderflow { offset });
        }
        let at = self.stack.len() - n;
        Ok(self.stack.drain(at..).collect())
    }

    /// The slot `n` below the top (`0` is the top).
    pub fn peek(&self, n: usize, offset: u32) -> DecodeResult<&SlotType> {
        self.stack
            .len()
            .checked_sub(n + 1)
            .map(|i| &self.stack[i])
            .ok_or(DecodeError::StackUnderflow { offset })
    }

    /// Move the top slot down so that it becomes the `n`-th from the top.
    pub fn rotate(&mut self, n: usize, offset: u32) -> DecodeResult<()> {
        if n == 0 || n > self.stack.len() {
            return Err(DecodeError::StackUnderflow { offset });
        }
        let top = self.pop(offset)?;
        let at = self.stack.len() + 1 - n;
        self.stack.insert(at, top);
        Ok(())
    }

    /// Truncate the stack to `level` slots.
    pub fn truncate(&mut self, level: u32, offset: u32) -> DecodeResult<()> {
        if level as usize > self.stack.len() {
            return Err(DecodeError::StackUnderflow { offset });
        }
        self.stack.truncate(level as usize);
        Ok(())
    }

    // =========================================================================
    // Exception Routing
    // =========================================================================

    /// Where an exception raised in this state unwinds to, if anywhere
    /// inside the function.
    pub fn unwind(&self) -> Option<Unwind> {
        let mut restore = None;
        for frame in self.blocks.iter().rev() {
            match *frame {
                BlockFrame::ExceptHandler { level } => restore = Some(level),
                BlockFrame::Finally {
                    handler,
                    level,
                    kind,
                } => {
                    return Some(Unwind {
                        handler,
                        level,
                        kind,
                        restore_exc_info_at: restore,
                    });
                }
            }
        }
        None
    }

    /// The state delivered to the handler when an exception is raised here.
    ///
    /// Blocks above the innermost protected block are dropped along with it,
    /// the stack is cut back to the block's level, an except-handler block is
    /// pushed and the exception sextuple lands on top.
    pub fn exception_state(&self, offset: u32) -> DecodeResult<Option<(u32, StackMetadata)>> {
        let Some(index) = self
            .blocks
            .iter()
            .rposition(|b| matches!(b, BlockFrame::Finally { .. }))
        else {
            return Ok(None);
        };
        let BlockFrame::Finally { handler, level, .. } = self.blocks[index] else {
            return Ok(None);
        };

        let mut state = self.clone();
        state.blocks.truncate(index);
        state.truncate(level, offset)?;
        state.enter_handler(level);
        Ok(Some((handler, state)))
    }

    /// Push the except-handler block and the exception sextuple.
    pub(crate) fn enter_handler(&mut self, level: u32) {
        self.blocks.push(BlockFrame::ExceptHandler { level });
        self.stack.extend(exception_sextuple());
        self.pending_kw_names = None;
    }

    // =========================================================================
    // Join
    // =========================================================================

    /// Pointwise join of two states reaching the same offset.
    pub fn join(&self, other: &StackMetadata, model: &TypeModel, offset: u32) -> DecodeResult<StackMetadata> {
        if self.dead {
            return Ok(other.clone());
        }
        if other.dead {
            return Ok(self.clone());
        }
        if self.stack.len() != other.stack.len() {
            return Err(DecodeError::DepthMismatch {
                offset,
                expected: self.stack.len(),
                found: other.stack.len(),
            });
        }
        if self.locals.len() != other.locals.len() || self.cells.len() != other.cells.len() {
            return Err(DecodeError::LocalsMismatch { offset });
        }
        if self.blocks != other.blocks {
            return Err(DecodeError::BlockMismatch { offset });
        }

        let join_var = |a: &Option<SlotType>, b: &Option<SlotType>| match (a, b) {
            (Some(a), Some(b)) => Some(a.join(b, model)),
            _ => None,
        };

        Ok(StackMetadata {
            stack: self
                .stack
                .iter()
                .zip(&other.stack)
                .map(|(a, b)| a.join(b, model))
                .collect(),
            locals: self
                .locals
                .iter()
                .zip(other.locals.iter())
                .map(|(a, b)| join_var(a, b))
                .collect(),
            cells: self
                .cells
                .iter()
                .zip(other.cells.iter())
                .map(|(a, b)| join_var(a, b))
                .collect(),
            blocks: self.blocks.clone(),
            dead: false,
            pending_kw_names: if self.pending_kw_names == other.pending_kw_names {
                self.pending_kw_names.clone()
            } else {
                None
            },
        })
    }

    /// Join `other` into `self`; returns whether `self` changed.
    pub fn join_from(&mut self, other: &StackMetadata, model: &TypeModel, offset: u32) -> DecodeResult<bool> {
        let joined = self.join(other, model, offset)?;
        if joined == *self {
            return Ok(false);
        }
        *self = joined;
        Ok(true)
    }

    /// Whether `self` is at or below `other` in the lattice.
    pub fn is_within(&self, other: &StackMetadata, model: &TypeModel) -> bool {
        match self.join(other, model, 0) {
            Ok(joined) => joined == *other,
            Err(_) => false,
        }
    }

    /// Render the operand stack with type names, e.g. `[int, str]`.
    pub fn describe_stack(&self, model: &TypeModel) -> String {
        let items: Vec<String> = self.stack.iter().map(|s| s.describe(model)).collect();
        format!("[{}]", items.join(", "))
    }
}

impl fmt::Debug for StackMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dead {
            return f.write_str("<dead>");
        }
        f.debug_struct("StackMetadata")
            .field("stack", &self.stack)
            .field("locals", &self.locals)
            .field("blocks", &self.blocks)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
