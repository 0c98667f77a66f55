//! Control-flow graph over a dense instruction list.
//!
//! # Structure
//!
//! Basic blocks are maximal instruction runs between leaders. Leaders are the
//! entry, every offset named by some op (branch targets, handler entries,
//! resume points) and every instruction following one that can transfer
//! control elsewhere.
//!
//! Explicit edges are derived from the ops when the graph is built.
//! Exception edges from individual may-raise instructions depend on the
//! handler-block stack, so they are added after the dataflow has computed it
//! (see [`FlowGraph::add_exception_edges`]).

use crate::bitset::BitSet;
use crate::error::{DecodeError, DecodeResult};
use crate::op::{Instr, Op};
use std::fmt;

// =============================================================================
// Edges and Blocks
// =============================================================================

/// Why control can move from one block to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Falls through to the next instruction.
    Fallthrough,
    /// Conditional or unconditional jump.
    Branch,
    /// An exception raised in the source block is delivered to the handler.
    Exception,
    /// The resume dispatcher re-enters a suspended generator. Carries no
    /// state: the state comes from the matching yield edge.
    Resume,
    /// A suspension point falls through to its resume point.
    Yield,
}

/// Block identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// The entry block.
    pub const ENTRY: BlockId = BlockId(0);

    #[inline]
    pub const fn new(index: u32) -> Self {
        BlockId(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A basic block in the flow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Offset of the first instruction.
    pub start: u32,
    /// Offset one past the last instruction.
    pub end: u32,
    /// Successor blocks with the edge kind.
    pub successors: Vec<(BlockId, EdgeKind)>,
    /// Predecessor blocks with the edge kind.
    pub predecessors: Vec<(BlockId, EdgeKind)>,
}

impl BasicBlock {
    /// Offsets covered by the block.
    pub fn offsets(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }

    /// Offset of the last instruction.
    pub fn last(&self) -> u32 {
        self.end - 1
    }
}

// =============================================================================
// Flow Graph
// =============================================================================

/// Basic blocks and edges of one function body.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    blocks: Vec<BasicBlock>,
    /// Block containing each instruction.
    block_of: Vec<BlockId>,
    /// Reverse postorder from the entry.
    rpo: Vec<BlockId>,
    reachable: BitSet,
}

/// Whether the instruction after `op` starts a new block.
fn ends_block(op: &Op) -> bool {
    op.is_forced_jump() || op.suspends() || !op.targets().is_empty()
}

impl FlowGraph {
    /// Build the graph's blocks and explicit edges.
    pub fn build(instrs: &[Instr]) -> DecodeResult<Self> {
        let len = instrs.len();
        if len == 0 {
            return Err(DecodeError::Bytecode(quill_bytecode::BytecodeError::Empty));
        }

        let mut leaders = BitSet::with_capacity(len + 1);
        leaders.insert(0);
        for instr in instrs {
            for target in instr.op.targets() {
                if target as usize >= len {
                    return Err(DecodeError::InvalidJumpTarget {
                        offset: instr.offset,
                        target,
                    });
                }
                leaders.insert(target as usize);
            }
            if matches!(instr.op, Op::ResumePoint { .. }) {
                leaders.insert(instr.offset as usize);
            }
            if ends_block(&instr.op) {
                leaders.insert(instr.offset as usize + 1);
            }
        }

        let starts: Vec<u32> = leaders.iter().filter(|&i| i < len).map(|i| i as u32).collect();
        let mut blocks = Vec::with_capacity(starts.len());
        let mut block_of = Vec::with_capacity(len);
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(len as u32);
            block_of.extend(std::iter::repeat_n(BlockId(i as u32), (end - start) as usize));
            blocks.push(BasicBlock {
                start,
                end,
                successors: Vec::new(),
                predecessors: Vec::new(),
            });
        }

        let mut graph = FlowGraph {
            blocks,
            block_of,
            rpo: Vec::new(),
            reachable: BitSet::new(),
        };

        for b in 0..graph.blocks.len() {
            let from = BlockId(b as u32);
            let last = &instrs[graph.blocks[b].last() as usize];
            let next = last.offset + 1;
            if !last.op.is_forced_jump() && (next as usize) < len {
                let kind = if last.op.suspends() {
                    EdgeKind::Yield
                } else {
                    EdgeKind::Fallthrough
                };
                graph.add_edge(from, graph.block_of[next as usize], kind);
            }
            if let Some(target) = last.op.branch_target() {
                graph.add_edge(from, graph.block_of[target as usize], EdgeKind::Branch);
            }
            if let Some(handler) = last.op.handler_target() {
                graph.add_edge(from, graph.block_of[handler as usize], EdgeKind::Exception);
            }
            if let Op::ResumeDispatch { states } = &last.op {
                for &(_, target) in states.iter() {
                    graph.add_edge(from, graph.block_of[target as usize], EdgeKind::Resume);
                }
            }
        }

        graph.compute_rpo();
        Ok(graph)
    }

    /// Add an edge, ignoring duplicates.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        let succs = &mut self.blocks[from.index()].successors;
        if !succs.contains(&(to, kind)) {
            succs.push((to, kind));
            self.blocks[to.index()].predecessors.push((from, kind));
        }
    }

    /// Add the exception edges discovered by the dataflow, as
    /// `(raising offset, handler offset)` pairs, and recompute the order.
    pub fn add_exception_edges(&mut self, edges: &[(u32, u32)]) {
        for &(from, handler) in edges {
            let (Some(&a), Some(&b)) = (
                self.block_of.get(from as usize),
                self.block_of.get(handler as usize),
            ) else {
                continue;
            };
            self.add_edge(a, b, EdgeKind::Exception);
        }
        self.compute_rpo();
    }

    fn compute_rpo(&mut self) {
        let mut visited = BitSet::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());

        // iterative DFS: (block, next successor index)
        let mut stack = vec![(BlockId::ENTRY, 0usize)];
        visited.insert(0);
        while let Some((block, i)) = stack.last_mut() {
            let succs = &self.blocks[block.index()].successors;
            if let Some(&(succ, _)) = succs.get(*i) {
                *i += 1;
                if visited.insert(succ.index()) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(*block);
                stack.pop();
            }
        }

        postorder.reverse();
        self.rpo = postorder;
        self.reachable = visited;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All blocks, in offset order.
    #[inline]
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// A block by id.
    #[inline]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    /// Block containing the instruction at `offset`.
    #[inline]
    pub fn block_of(&self, offset: u32) -> BlockId {
        self.block_of[offset as usize]
    }

    /// Number of blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the graph has no blocks (never true for a built graph).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks in reverse postorder from the entry.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Whether some path of explicit or exception edges reaches `block`.
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.contains(block.index())
    }

    /// Whether `offset` is the first instruction of its block.
    pub fn is_leader(&self, offset: u32) -> bool {
        self.blocks[self.block_of(offset).index()].start == offset
    }
}

// =============================================================================
// Tests
// =============================================================================
