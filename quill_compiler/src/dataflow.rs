//! Forward fixed-point inference of stack metadata.
//!
//! # Algorithm Overview
//!
//! 1. Every block starts dead (bottom) except the entry, which gets the
//!    state derived from the call signature
//! 2. Process the worklist in FIFO order:
//!    - Run each instruction's stack effect, recording the before-state
//!    - Join every outcome into the entry state of its target block
//!    - Join the handler-entry state of each may-raise instruction into its
//!      innermost handler
//!    - Re-queue a block whenever its entry state rises
//! 3. Stop when the worklist drains, or fail once the step bound is exceeded
//!
//! # Key Properties
//!
//! - **Monotonic**: block entry states only rise in the join order
//! - **Bounded**: the lattice height is the model's inheritance depth plus
//!   two, so each slot of each block can rise a bounded number of times
//! - **Deterministic**: FIFO order over a deterministic graph

use crate::bitset::BitSet;
use crate::error::{DecodeError, DecodeResult};
use crate::flow::{BlockId, FlowGraph};
use crate::metadata::StackMetadata;
use crate::op::Instr;
use crate::op::effect::{Successor, Typer};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, trace};

/// The fixed point of one function body.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Before-state of every instruction; dead for unreachable ones.
    pub states: Vec<StackMetadata>,
    /// `(raising offset, handler offset)` pairs, sorted.
    pub exception_edges: Vec<(u32, u32)>,
    /// Block visits performed.
    pub steps: u64,
}

impl Analysis {
    /// Whether the instruction at `offset` is reachable.
    pub fn is_reachable(&self, offset: u32) -> bool {
        self.states.get(offset as usize).is_some_and(|s| !s.dead)
    }
}

/// The step bound for a function: blocks × (1 + slots × (height)).
pub fn step_bound(graph: &FlowGraph, instrs: &[Instr], entry: &StackMetadata, typer: &Typer<'_>) -> u64 {
    if let Some(steps) = typer.config.max_dataflow_steps {
        return steps;
    }
    let slots = (entry.locals.len() + entry.cells.len() + instrs.len() + 1) as u64;
    let height = u64::from(typer.model.max_depth()) + 2;
    (graph.len() as u64).saturating_mul(1 + slots.saturating_mul(height))
}

/// Run the analysis to its fixed point.
pub fn analyze(
    instrs: &[Instr],
    graph: &FlowGraph,
    entry: StackMetadata,
    typer: &Typer<'_>,
) -> DecodeResult<Analysis> {
    let bound = step_bound(graph, instrs, &entry, typer);
    let mut solver = Solver {
        instrs,
        graph,
        typer,
        block_in: vec![StackMetadata::dead(entry.locals.len(), entry.cells.len()); graph.len()],
        states: vec![StackMetadata::dead(entry.locals.len(), entry.cells.len()); instrs.len()],
        worklist: VecDeque::new(),
        queued: BitSet::with_capacity(graph.len()),
        exception_edges: BTreeSet::new(),
    };

    solver.block_in[BlockId::ENTRY.index()] = entry;
    solver.enqueue(BlockId::ENTRY);

    let mut steps: u64 = 0;
    while let Some(block) = solver.worklist.pop_front() {
        solver.queued.remove(block.index());
        steps += 1;
        if steps > bound {
            return Err(DecodeError::NoFixedPoint { steps: bound });
        }
        solver.visit(block)?;
    }

    let unreachable = solver.states.iter().filter(|s| s.dead).count();
    if unreachable > 0 {
        debug!(unreachable, "instructions never reached");
    }
    trace!(steps, bound, "dataflow converged");

    Ok(Analysis {
        states: solver.states,
        exception_edges: solver.exception_edges.into_iter().collect(),
        steps,
    })
}

struct Solver<'a, 't> {
    instrs: &'a [Instr],
    graph: &'a FlowGraph,
    typer: &'a Typer<'t>,
    block_in: Vec<StackMetadata>,
    states: Vec<StackMetadata>,
    worklist: VecDeque<BlockId>,
    queued: BitSet,
    exception_edges: BTreeSet<(u32, u32)>,
}

impl Solver<'_, '_> {
    fn enqueue(&mut self, block: BlockId) {
        if self.queued.insert(block.index()) {
            self.worklist.push_back(block);
        }
    }

    /// Join `state` into the entry of the block starting at `target`.
    fn propagate(&mut self, from: u32, target: u32, state: &StackMetadata) -> DecodeResult<()> {
        if target as usize >= self.instrs.len() {
            return Err(DecodeError::FallsOffEnd { offset: from });
        }
        if !self.graph.is_leader(target) {
            return Err(DecodeError::InvalidJumpTarget { offset: from, target });
        }
        let block = self.graph.block_of(target);
        let changed = self.block_in[block.index()].join_from(state, self.typer.model, target)?;
        if changed {
            self.enqueue(block);
        }
        Ok(())
    }

    fn visit(&mut self, block: BlockId) -> DecodeResult<()> {
        let instrs = self.instrs;
        let range = self.graph.block(block).offsets();
        let last = range.end - 1;
        let mut state = self.block_in[block.index()].clone();

        for offset in range {
            self.states[offset as usize] = state.clone();
            if state.dead {
                return Ok(());
            }
            let op = &instrs[offset as usize].op;

            if op.may_raise() {
                if let Some((handler, entry)) = state.exception_state(offset)? {
                    self.exception_edges.insert((offset, handler));
                    self.propagate(offset, handler, &entry)?;
                }
            }

            let transfer = op.stack_effect(offset, &state, self.typer)?;
            let mut fallthrough = None;
            for (successor, out) in transfer.outcomes {
                match successor {
                    Successor::Jump(target) => self.propagate(offset, target, &out)?,
                    Successor::Next if offset == last => self.propagate(offset, offset + 1, &out)?,
                    Successor::Next => fallthrough = Some(out),
                }
            }
            match fallthrough {
                Some(next) => state = next,
                None => return Ok(()),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorConfig;
    use crate::metadata::{BlockKind, SlotType, exception_sextuple};
    use crate::op::{BinaryOp, Op};
    use quill_bytecode::{CodeObject, CompareOp, Constant};
    use quill_types::{TypeId, TypeModel};
    use std::sync::Arc;

    fn body(ops: Vec<Op>) -> Vec<Instr> {
        let mut instrs: Vec<Instr> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| Instr {
                offset: i as u32,
                op,
                line: None,
                origin: Some(i as u32),
                is_jump_target: false,
            })
            .collect();
        crate::rewrite::mark_jump_targets(&mut instrs);
        instrs
    }

    fn code() -> CodeObject {
        let mut code = CodeObject::new("f", "f.py");
        code.constants = vec![Constant::Int(1), Constant::str("s"), Constant::None].into_boxed_slice();
        code.varnames = vec![Arc::from("x")].into_boxed_slice();
        code
    }

    fn run(ops: Vec<Op>, config: &TranslatorConfig) -> DecodeResult<Analysis> {
        let model = TypeModel::with_builtins();
        let code = code();
        let typer = Typer::new(&model, &code, config);
        let instrs = body(ops);
        let graph = FlowGraph::build(&instrs)?;
        analyze(&instrs, &graph, StackMetadata::entry(vec![None], 0), &typer)
    }

    #[test]
    fn test_loop_widens_local() {
        // x = 1; if cond: x = "s"; return x
        let analysis = run(
            vec![
                Op::LoadConst(0),
                Op::StoreFast(0),
                Op::LoadGlobal(Arc::from("cond")),
                Op::PopJumpIf { when: false, target: 6 },
                Op::LoadConst(1),
                Op::StoreFast(0),
                Op::LoadFast(0),
                Op::ReturnValue,
            ],
            &TranslatorConfig::default(),
        );
        let analysis = analysis.unwrap();
        assert_eq!(analysis.states[6].locals[0], Some(SlotType::OBJECT));
        assert_eq!(
            analysis.states[4].locals[0],
            Some(SlotType::Instance(TypeId::INT))
        );
    }

    #[test]
    fn test_back_edge_converges() {
        // i = 1; loop: i = i + 1; jump loop (no exit)
        let analysis = run(
            vec![
                Op::LoadConst(0),
                Op::StoreFast(0),
                Op::LoadFast(0),
                Op::LoadConst(0),
                Op::Binary {
                    op: BinaryOp::Add,
                    inplace: false,
                },
                Op::StoreFast(0),
                Op::Jump { target: 2 },
            ],
            &TranslatorConfig::default(),
        )
        .unwrap();
        assert_eq!(analysis.states[2].locals[0], Some(SlotType::Instance(TypeId::INT)));
        assert!(analysis.steps <= 4);
    }

    #[test]
    fn test_depth_mismatch_at_join() {
        let err = run(
            vec![
                Op::LoadGlobal(Arc::from("c")),
                Op::PopJumpIf { when: true, target: 3 },
                Op::LoadConst(0),
                Op::LoadConst(0),
                Op::ReturnValue,
            ],
            &TranslatorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::DepthMismatch { offset: 3, .. }));
    }

    #[test]
    fn test_falls_off_end() {
        let err = run(vec![Op::LoadConst(0), Op::PopTop], &TranslatorConfig::default()).unwrap_err();
        assert_eq!(err, DecodeError::FallsOffEnd { offset: 1 });
    }

    #[test]
    fn test_step_bound_enforced() {
        let config = TranslatorConfig::default().with_max_dataflow_steps(1);
        let err = run(
            vec![
                Op::LoadGlobal(Arc::from("c")),
                Op::PopJumpIf { when: true, target: 0 },
                Op::LoadConst(0),
                Op::ReturnValue,
            ],
            &config,
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::NoFixedPoint { steps: 1 });
    }

    #[test]
    fn test_unreachable_is_dead() {
        let analysis = run(
            vec![Op::LoadConst(0), Op::ReturnValue, Op::LoadConst(1), Op::ReturnValue],
            &TranslatorConfig::default(),
        )
        .unwrap();
        assert!(analysis.is_reachable(1));
        assert!(!analysis.is_reachable(2));
    }

    #[test]
    fn test_exception_edge_from_deep_stack() {
        // try: f(1, 2, 3) except: pass
        let analysis = run(
            vec![
                Op::LoadConst(0),
                Op::SetupFinally {
                    handler: 8,
                    kind: BlockKind::Try,
                    reserve: 0,
                },
                Op::LoadGlobal(Arc::from("f")),
                Op::LoadConst(0),
                Op::LoadConst(0),
                Op::CallFunction(2),
                Op::ReturnValue,
                Op::Nop,
                Op::PopTop,
                Op::PopTop,
                Op::PopTop,
                Op::PopExcept,
                Op::ReturnValue,
            ],
            &TranslatorConfig::default(),
        )
        .unwrap();
        assert!(analysis.exception_edges.contains(&(5, 8)));
        let handler = &analysis.states[8];
        assert_eq!(handler.depth(), 7);
        assert_eq!(handler.stack[0], SlotType::Instance(TypeId::INT));
        assert_eq!(&handler.stack[1..], &exception_sextuple());
        assert!(!analysis.is_reachable(7));
    }

    #[test]
    fn test_compare_branch_example() {
        let analysis = run(
            vec![
                Op::LoadConst(0),
                Op::LoadConst(0),
                Op::Compare(CompareOp::Lt),
                Op::PopJumpIf { when: false, target: 6 },
                Op::LoadConst(1),
                Op::ReturnValue,
                Op::LoadConst(1),
                Op::ReturnValue,
            ],
            &TranslatorConfig::default(),
        )
        .unwrap();
        assert_eq!(analysis.states[3].stack.as_slice(), &[SlotType::Instance(TypeId::BOOL)]);
        assert_eq!(analysis.states[5].stack.as_slice(), &[SlotType::Instance(TypeId::STR)]);
        assert_eq!(analysis.states[7].stack.as_slice(), &[SlotType::Instance(TypeId::STR)]);
    }
}
