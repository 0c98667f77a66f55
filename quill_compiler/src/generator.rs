//! Generator-to-state-machine transform.
//!
//! A generator frame cannot keep a native call stack across a yield, so the
//! body is rewritten around an explicit state register:
//!
//! ```text
//!                      RESUME_DISPATCH  1 -> a, 2 -> b
//! ...                  ...
//! YIELD_VALUE    ==>   SUSPEND          1
//!                  a:  RESUME_POINT     1
//! ...                  ...
//! YIELD_FROM     ==>  L: DELEGATE       2 (exit E)
//!                  b:  RESUME_POINT     2
//!                      JUMP             L
//!                  E:  ...
//! ```
//!
//! State 0 is the entry. The dispatcher falls through on it and jumps to the
//! matching resume point otherwise. Every state records which locals are
//! live across the suspension and the operand stack that must be saved with
//! them, so a backend can lift exactly those into persistent fields.

use crate::bitset::BitSet;
use crate::dataflow::Analysis;
use crate::error::DecodeResult;
use crate::flow::{EdgeKind, FlowGraph};
use crate::metadata::SlotType;
use crate::op::{Instr, Op};
use crate::rewrite::{Rewriter, mark_jump_targets};
use quill_bytecode::OffsetMap;
use smallvec::SmallVec;
use std::sync::Arc;

// =============================================================================
// Descriptor
// =============================================================================

/// One suspension point of a generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    /// State register value while suspended here. Never 0.
    pub id: u32,
    /// Offset of the `Suspend` or `Delegate` instruction.
    pub suspend: u32,
    /// Offset of the matching `ResumePoint`.
    pub resume: u32,
    /// Local slots live after resumption.
    pub live_locals: Vec<u32>,
    /// Operand stack carried across the suspension, bottom first.
    pub saved_stack: SmallVec<[SlotType; 4]>,
    /// `yield from`: the sub-iterator is the top of the saved stack.
    pub delegates: bool,
}

/// Layout of a generator state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorDescriptor {
    /// Suspension points, ordered by state id.
    pub states: Vec<ResumeState>,
}

impl GeneratorDescriptor {
    /// Number of states including the entry.
    pub fn state_count(&self) -> usize {
        self.states.len() + 1
    }

    /// The suspension point with the given state id.
    pub fn state(&self, id: u32) -> Option<&ResumeState> {
        id.checked_sub(1).and_then(|i| self.states.get(i as usize))
    }

    /// Largest saved stack over all states.
    pub fn max_saved_stack(&self) -> usize {
        self.states.iter().map(|s| s.saved_stack.len()).max().unwrap_or(0)
    }
}

// =============================================================================
// Transform
// =============================================================================

/// Rewrite yield points into suspend/resume pairs behind a dispatcher.
///
/// Returns the new list and the map from old to new offsets. Old offset 0
/// maps past the dispatcher, so a loop back to the top never re-dispatches.
pub fn transform(instrs: &[Instr]) -> DecodeResult<(Vec<Instr>, OffsetMap)> {
    let mut rw = Rewriter::new();
    rw.push(
        Op::ResumeDispatch {
            states: Arc::from(Vec::new()),
        },
        instrs.first().and_then(|i| i.line),
        None,
    );

    let mut next_state = 1u32;
    for instr in instrs {
        rw.begin(instr.offset);
        match instr.op {
            // the state machine never receives an initial sent value
            Op::GenStart(_) => {}
            Op::YieldValue => {
                let state = next_state;
                next_state += 1;
                rw.push(Op::Suspend { state }, instr.line, instr.origin);
                rw.push(Op::ResumePoint { state }, instr.line, instr.origin);
            }
            Op::YieldFrom => {
                let state = next_state;
                next_state += 1;
                rw.push(
                    Op::Delegate {
                        state,
                        exit: instr.offset + 1,
                    },
                    instr.line,
                    instr.origin,
                );
                rw.push(Op::ResumePoint { state }, instr.line, instr.origin);
                rw.push(Op::Jump { target: instr.offset }, instr.line, instr.origin);
            }
            ref op => {
                rw.push(op.clone(), instr.line, instr.origin);
            }
        }
    }

    let (mut out, map) = rw.finish()?;
    let states: Vec<(u32, u32)> = out
        .iter()
        .filter_map(|i| match i.op {
            Op::ResumePoint { state } => Some((state, i.offset)),
            _ => None,
        })
        .collect();
    out[0].op = Op::ResumeDispatch {
        states: Arc::from(states),
    };
    mark_jump_targets(&mut out);
    Ok((out, map))
}

/// Build the descriptor of a transformed body from its final analysis.
///
/// `graph` must already carry the exception edges of `analysis`.
pub fn describe(instrs: &[Instr], graph: &FlowGraph, analysis: &Analysis, locals: usize) -> GeneratorDescriptor {
    let live = live_in(instrs, graph, &analysis.exception_edges, locals);
    let mut states = Vec::new();
    for (i, instr) in instrs.iter().enumerate() {
        let Op::ResumePoint { state } = instr.op else {
            continue;
        };
        let Some(suspend) = i.checked_sub(1) else {
            continue;
        };
        states.push(ResumeState {
            id: state,
            suspend: suspend as u32,
            resume: instr.offset,
            live_locals: live[i].iter().map(|slot| slot as u32).collect(),
            saved_stack: analysis.states[i].stack.iter().cloned().collect(),
            delegates: matches!(instrs[suspend].op, Op::Delegate { .. }),
        });
    }
    states.sort_by_key(|s| s.id);
    GeneratorDescriptor { states }
}

// =============================================================================
// Liveness
// =============================================================================

fn uses_and_defs(op: &Op) -> (Option<u32>, Option<u32>) {
    match *op {
        Op::LoadFast(slot) | Op::DeleteFast(slot) => (Some(slot), None),
        Op::StoreFast(slot) => (None, Some(slot)),
        _ => (None, None),
    }
}

/// Handler offsets reached by an exception raised at each instruction.
type Raises = Vec<SmallVec<[u32; 1]>>;

/// Run one block backwards from its live-out set, optionally recording the
/// live-in set of every instruction.
///
/// An instruction that may raise into a handler also needs whatever the
/// handler reads, before its own definition takes effect.
fn transfer(
    instrs: &[Instr],
    graph: &FlowGraph,
    block: usize,
    out: &BitSet,
    block_in: &[BitSet],
    raises: &Raises,
    mut record: Option<&mut [BitSet]>,
) -> BitSet {
    let mut live = out.clone();
    for offset in graph.blocks()[block].offsets().rev() {
        let (used, defined) = uses_and_defs(&instrs[offset as usize].op);
        if let Some(slot) = defined {
            live.remove(slot as usize);
        }
        for &handler in &raises[offset as usize] {
            live.union_with(&block_in[graph.block_of(handler).index()]);
        }
        if let Some(slot) = used {
            live.insert(slot as usize);
        }
        if let Some(states) = record.as_mut() {
            states[offset as usize] = live.clone();
        }
    }
    live
}

/// Backward liveness of fast locals; live-in set per instruction.
///
/// `exception_edges` are the `(raising offset, handler)` pairs of the final
/// analysis. Each raising instruction flows into its handler on its own, so
/// a local read only by an `except` body stays live across every yield the
/// `try` covers, even when the protected code reassigns it later in the
/// same block.
pub fn live_in(instrs: &[Instr], graph: &FlowGraph, exception_edges: &[(u32, u32)], locals: usize) -> Vec<BitSet> {
    let blocks = graph.blocks();
    let mut raises: Raises = vec![SmallVec::new(); instrs.len()];
    for &(from, handler) in exception_edges {
        raises[from as usize].push(handler);
    }
    let mut block_in = vec![BitSet::with_capacity(locals); blocks.len()];
    // exception successors are accounted for per instruction
    let live_out = |block: usize, block_in: &[BitSet]| -> BitSet {
        let mut out = BitSet::with_capacity(locals);
        for &(succ, kind) in &blocks[block].successors {
            if kind != EdgeKind::Exception {
                out.union_with(&block_in[succ.index()]);
            }
        }
        out
    };

    // postorder converges fastest for a backward problem
    let order: Vec<usize> = graph.rpo().iter().rev().map(|b| b.index()).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            let out = live_out(b, &block_in);
            let live = transfer(instrs, graph, b, &out, &block_in, &raises, None);
            changed |= block_in[b].union_with(&live);
        }
    }

    let mut per_instr = vec![BitSet::new(); instrs.len()];
    for &b in &order {
        let out = live_out(b, &block_in);
        transfer(instrs, graph, b, &out, &block_in, &raises, Some(&mut per_instr));
    }
    per_instr
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorConfig;
    use crate::dataflow::analyze;
    use crate::metadata::{BlockKind, StackMetadata};
    use crate::op::effect::Typer;
    use quill_bytecode::{CodeObject, Constant};
    use quill_types::TypeModel;

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
        mark_jump_targets(&mut instrs);
        instrs
    }

    struct Pipeline {
        instrs: Vec<Instr>,
        graph: FlowGraph,
        analysis: Analysis,
    }

    fn run(ops: Vec<Op>, locals: usize) -> Pipeline {
        let model = TypeModel::with_builtins();
        let mut code = CodeObject::new("g", "g.py");
        code.constants = vec![Constant::Int(1), Constant::str("s"), Constant::None].into_boxed_slice();
        let config = TranslatorConfig::default();
        let typer = Typer::new(&model, &code, &config);

        let (instrs, _) = transform(&body(ops)).unwrap();
        let mut graph = FlowGraph::build(&instrs).unwrap();
        let analysis = analyze(&instrs, &graph, StackMetadata::entry(vec![None; locals], 0), &typer).unwrap();
        graph.add_exception_edges(&analysis.exception_edges);
        Pipeline {
            instrs,
            graph,
            analysis,
        }
    }

    #[test]
    fn test_yield_value_shape() {
        // x = 1; yield x; return None
        let (instrs, map) = transform(&body(vec![
            Op::GenStart(0),
            Op::LoadConst(0),
            Op::StoreFast(0),
            Op::LoadFast(0),
            Op::YieldValue,
            Op::PopTop,
            Op::LoadConst(2),
            Op::ReturnValue,
        ]))
        .unwrap();

        assert_eq!(
            instrs[0].op,
            Op::ResumeDispatch {
                states: Arc::from(vec![(1, 5)])
            }
        );
        assert_eq!(instrs[4].op, Op::Suspend { state: 1 });
        assert_eq!(instrs[5].op, Op::ResumePoint { state: 1 });
        assert!(instrs[5].is_jump_target);
        assert!(!instrs.iter().any(|i| matches!(i.op, Op::GenStart(_))));
        // GEN_START's offset forwards past the dispatcher
        assert_eq!(map.get(0), Some(1));
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(5), Some(6));
    }

    #[test]
    fn test_yield_from_loop() {
        let (instrs, map) = transform(&body(vec![
            Op::LoadGlobal(Arc::from("it")), // 0
            Op::GetYieldFromIter,            // 1
            Op::LoadConst(2),                // 2
            Op::YieldFrom,                   // 3
            Op::ReturnValue,                 // 4
        ]))
        .unwrap();
        assert_eq!(instrs[4].op, Op::Delegate { state: 1, exit: 7 });
        assert_eq!(instrs[5].op, Op::ResumePoint { state: 1 });
        assert_eq!(instrs[6].op, Op::Jump { target: 4 });
        assert_eq!(instrs[7].op, Op::ReturnValue);
        assert_eq!(map.get(3), Some(4));
        assert!(instrs[4].is_jump_target);
        assert!(instrs[7].is_jump_target);
    }

    #[test]
    fn test_descriptor_liveness_and_saved_stack() {
        // a = 1; b = "s"; yield a; yield b; return None
        let p = run(
            vec![
                Op::LoadConst(0),
                Op::StoreFast(0),
                Op::LoadConst(1),
                Op::StoreFast(1),
                Op::LoadFast(0),
                Op::YieldValue,
                Op::PopTop,
                Op::LoadFast(1),
                Op::YieldValue,
                Op::PopTop,
                Op::LoadConst(2),
                Op::ReturnValue,
            ],
            2,
        );
        let desc = describe(&p.instrs, &p.graph, &p.analysis, 2);
        assert_eq!(desc.state_count(), 3);
        let first = desc.state(1).unwrap();
        assert_eq!(first.live_locals, vec![1]);
        assert!(first.saved_stack.is_empty());
        assert!(!first.delegates);
        let second = desc.state(2).unwrap();
        assert!(second.live_locals.is_empty());
        assert!(desc.state(3).is_none());
        assert!(desc.state(0).is_none());
    }

    #[test]
    fn test_delegate_saves_iterator() {
        let p = run(
            vec![
                Op::LoadConst(1),
                Op::GetYieldFromIter,
                Op::LoadConst(2),
                Op::YieldFrom,
                Op::ReturnValue,
            ],
            0,
        );
        let desc = describe(&p.instrs, &p.graph, &p.analysis, 0);
        let state = desc.state(1).unwrap();
        assert!(state.delegates);
        assert_eq!(state.saved_stack.len(), 1);
        assert_eq!(desc.max_saved_stack(), 1);
        // the resume point sees the iterator plus the sent value
        assert_eq!(p.analysis.states[state.resume as usize + 1].depth(), 2);
    }

    #[test]
    fn test_handler_locals_live_across_yield() {
        // x = "s"; try: yield 1 except: return x
        let p = run(
            vec![
                Op::LoadConst(1), // 0
                Op::StoreFast(0), // 1
                Op::SetupFinally {
                    handler: 9,
                    kind: BlockKind::Try,
                    reserve: 0,
                }, // 2
                Op::LoadConst(0),  // 3
                Op::YieldValue,    // 4
                Op::PopTop,        // 5
                Op::PopBlock,      // 6
                Op::LoadConst(2),  // 7
                Op::ReturnValue,   // 8
                Op::LoadFast(0),   // 9 handler
                Op::ReturnValue,   // 10
            ],
            1,
        );
        let desc = describe(&p.instrs, &p.graph, &p.analysis, 1);
        let state = desc.state(1).unwrap();
        assert_eq!(state.live_locals, vec![0]);
        // the resume point raises thrown exceptions into the handler
        assert!(p.analysis.exception_edges.contains(&(state.resume, 11)));
    }

    #[test]
    fn test_handler_local_survives_reassignment_in_same_block() {
        // x = 1; try: yield 1; x = "s"; yield 1 except: return x
        let p = run(
            vec![
                Op::LoadConst(0), // 0
                Op::StoreFast(0), // 1
                Op::SetupFinally {
                    handler: 14,
                    kind: BlockKind::Try,
                    reserve: 0,
                }, // 2
                Op::LoadConst(0),  // 3
                Op::YieldValue,    // 4
                Op::PopTop,        // 5
                Op::LoadConst(1),  // 6
                Op::StoreFast(0),  // 7
                Op::LoadConst(0),  // 8
                Op::YieldValue,    // 9
                Op::PopTop,        // 10
                Op::PopBlock,      // 11
                Op::LoadConst(2),  // 12
                Op::ReturnValue,   // 13
                Op::LoadFast(0),   // 14 handler
                Op::ReturnValue,   // 15
            ],
            1,
        );
        let desc = describe(&p.instrs, &p.graph, &p.analysis, 1);
        let first = desc.state(1).unwrap();
        let second = desc.state(2).unwrap();
        // the store between the yields sits in the first resume point's block
        assert_eq!(
            p.graph.block_of(first.resume),
            p.graph.block_of(second.suspend)
        );
        assert_eq!(first.live_locals, vec![0]);
        assert_eq!(second.live_locals, vec![0]);
    }
}
