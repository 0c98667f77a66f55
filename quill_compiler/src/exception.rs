//! Static exception regions.
//!
//! The raw bytecode only pushes and pops handler blocks; which handler
//! catches an exception at a given offset is a property of the block stack
//! there. After the fixed point that stack is known everywhere, so the
//! dynamic block stack can be replaced by a table: contiguous runs of
//! offsets with the same unwind target become one [`ExceptionRegion`].

use crate::dataflow::Analysis;
use crate::metadata::{BlockFrame, BlockKind, StackMetadata};
use crate::op::{Instr, Op};

/// What kind of handler a region unwinds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// An `except` clause: matches the exception type, or catches all.
    Except,
    /// A `finally` clause: runs and reraises.
    Finally,
    /// The exit path of a `with` statement.
    With,
}

/// A protected range of instructions and where its exceptions go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// First protected offset.
    pub start: u32,
    /// One past the last protected offset.
    pub end: u32,
    /// Handler entry.
    pub handler: u32,
    /// Operand stack level the handler expects below the exception sextuple.
    pub level: u32,
    pub kind: RegionKind,
    /// Level of the saved exception info to restore while unwinding out of
    /// an enclosing `except` body.
    pub restore_exc_info_at: Option<u32>,
    /// Handler of the nearest enclosing `finally` clause.
    pub finally_entry: Option<u32>,
}

impl ExceptionRegion {
    /// Whether `offset` is protected by this region.
    #[inline]
    pub fn contains(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Classify the handler at `handler`, established by a block of `kind`.
pub fn classify_handler(instrs: &[Instr], handler: u32, kind: BlockKind) -> RegionKind {
    if kind == BlockKind::With {
        return RegionKind::With;
    }
    let head = instrs.iter().skip(handler as usize).take(3);
    let matches_type = head.clone().any(|i| matches!(i.op, Op::JumpIfNotExcMatch { .. }));
    let pops_all = head.clone().count() == 3 && head.clone().all(|i| i.op == Op::PopTop);
    if matches_type || pops_all {
        RegionKind::Except
    } else {
        RegionKind::Finally
    }
}

fn finally_entry(instrs: &[Instr], state: &StackMetadata) -> Option<u32> {
    let innermost = state
        .blocks
        .iter()
        .rposition(|b| matches!(b, BlockFrame::Finally { .. }))?;
    state.blocks[..innermost].iter().rev().find_map(|frame| match *frame {
        BlockFrame::Finally { handler, kind, .. }
            if classify_handler(instrs, handler, kind) == RegionKind::Finally =>
        {
            Some(handler)
        }
        _ => None,
    })
}

/// Build the region table from the final analysis.
///
/// Regions are sorted by start offset and never overlap.
pub fn build_regions(instrs: &[Instr], analysis: &Analysis) -> Vec<ExceptionRegion> {
    let mut regions: Vec<ExceptionRegion> = Vec::new();
    let mut open: Option<ExceptionRegion> = None;

    for (offset, state) in analysis.states.iter().enumerate() {
        let offset = offset as u32;
        let current = if state.dead {
            None
        } else {
            state.unwind().map(|u| ExceptionRegion {
                start: offset,
                end: offset + 1,
                handler: u.handler,
                level: u.level,
                kind: classify_handler(instrs, u.handler, u.kind),
                restore_exc_info_at: u.restore_exc_info_at,
                finally_entry: finally_entry(instrs, state),
            })
        };

        match (&mut open, current) {
            (Some(run), Some(next))
                if run.handler == next.handler
                    && run.level == next.level
                    && run.restore_exc_info_at == next.restore_exc_info_at
                    && run.finally_entry == next.finally_entry =>
            {
                run.end = offset + 1;
            }
            (_, next) => {
                if let Some(done) = open.take() {
                    regions.push(done);
                }
                open = next;
            }
        }
    }
    regions.extend(open);
    regions
}

/// The region protecting `offset`, if any.
pub fn region_at(regions: &[ExceptionRegion], offset: u32) -> Option<&ExceptionRegion> {
    let index = regions.partition_point(|r| r.end <= offset);
    regions.get(index).filter(|r| r.contains(offset))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorConfig;
    use crate::dataflow::analyze;
    use crate::flow::FlowGraph;
    use crate::op::effect::Typer;
    use quill_bytecode::{CodeObject, Constant};
    use quill_types::TypeModel;
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

    fn regions_of(ops: Vec<Op>) -> Vec<ExceptionRegion> {
        let model = TypeModel::with_builtins();
        let mut code = CodeObject::new("f", "f.py");
        code.constants = vec![Constant::None].into_boxed_slice();
        let config = TranslatorConfig::default();
        let typer = Typer::new(&model, &code, &config);
        let instrs = body(ops);
        let graph = FlowGraph::build(&instrs).unwrap();
        let analysis = analyze(&instrs, &graph, StackMetadata::entry(Vec::new(), 0), &typer).unwrap();
        build_regions(&instrs, &analysis)
    }

    fn setup(handler: u32) -> Op {
        Op::SetupFinally {
            handler,
            kind: BlockKind::Try,
            reserve: 0,
        }
    }

    #[test]
    fn test_try_except_region() {
        // try: f() except E: pass
        let regions = regions_of(vec![
            setup(6),                             // 0
            Op::LoadGlobal(Arc::from("f")),       // 1
            Op::CallFunction(0),                  // 2
            Op::PopTop,                           // 3
            Op::PopBlock,                         // 4
            Op::Jump { target: 15 },              // 5
            Op::DupTop,                           // 6 handler
            Op::LoadGlobal(Arc::from("E")),       // 7
            Op::JumpIfNotExcMatch { target: 14 }, // 8
            Op::PopTop,                           // 9
            Op::PopTop,                           // 10
            Op::PopTop,                           // 11
            Op::PopExcept,                        // 12
            Op::Jump { target: 15 },              // 13
            Op::Reraise { restore_lasti: false }, // 14
            Op::LoadConst(0),                     // 15
            Op::ReturnValue,                      // 16
        ]);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!((r.start, r.end), (1, 5));
        assert_eq!(r.handler, 6);
        assert_eq!(r.level, 0);
        assert_eq!(r.kind, RegionKind::Except);
        assert_eq!(r.restore_exc_info_at, None);
        assert_eq!(r.finally_entry, None);
        assert!(region_at(&regions, 2).is_some());
        assert!(region_at(&regions, 0).is_none());
        assert!(region_at(&regions, 5).is_none());
    }

    #[test]
    fn test_nested_finally_entry() {
        // try: (try: f() except: pass) finally: g()
        let regions = regions_of(vec![
            setup(15),                            // 0 outer finally
            setup(7),                             // 1 inner except
            Op::LoadGlobal(Arc::from("f")),       // 2
            Op::CallFunction(0),                  // 3
            Op::PopTop,                           // 4
            Op::PopBlock,                         // 5
            Op::Jump { target: 12 },              // 6
            Op::PopTop,                           // 7 bare except
            Op::PopTop,                           // 8
            Op::PopTop,                           // 9
            Op::PopExcept,                        // 10
            Op::Jump { target: 12 },              // 11
            Op::PopBlock,                         // 12
            Op::LoadConst(0),                     // 13
            Op::ReturnValue,                      // 14
            Op::LoadGlobal(Arc::from("g")),       // 15 finally handler
            Op::CallFunction(0),                  // 16
            Op::PopTop,                           // 17
            Op::Reraise { restore_lasti: false }, // 18
        ]);
        let inner = region_at(&regions, 2).unwrap();
        assert_eq!(inner.handler, 7);
        assert_eq!(inner.kind, RegionKind::Except);
        assert_eq!(inner.finally_entry, Some(15));

        // inside the except body the outer finally catches, and the saved
        // exception info must be restored on the way out
        let body = region_at(&regions, 8).unwrap();
        assert_eq!(body.handler, 15);
        assert_eq!(body.kind, RegionKind::Finally);
        assert_eq!(body.restore_exc_info_at, Some(0));
        assert_eq!(body.finally_entry, None);

        let after = region_at(&regions, 12).unwrap();
        assert_eq!(after.handler, 15);
        assert_eq!(after.restore_exc_info_at, None);
        assert!(region_at(&regions, 13).is_none());
    }

    #[test]
    fn test_with_handler_classified_by_block_kind() {
        let instrs = vec![Instr {
            offset: 0,
            op: Op::PopTop,
            line: None,
            origin: None,
            is_jump_target: false,
        }];
        assert_eq!(classify_handler(&instrs, 0, BlockKind::With), RegionKind::With);
        assert_eq!(classify_handler(&instrs, 0, BlockKind::Try), RegionKind::Finally);
    }
}
