//! `with` statement desugaring.
//!
//! `SETUP_WITH` does four things at once: it looks up both hooks, calls the
//! enter hook and protects the block. The pass spells that out so the hook
//! lookups and the call go through ordinary typing and lowering:
//!
//! ```text
//! SETUP_WITH  L        DUP_TOP
//!                      LOAD_SPECIAL     __exit__
//!              ==>     ROT_TWO
//!                      LOAD_SPECIAL     __enter__
//!                      CALL_FUNCTION    0
//!                      SETUP_FINALLY    L (with, reserve 1)
//! ```
//!
//! The protected level excludes the enter result, exactly as `SETUP_WITH`
//! leaves it.

use crate::error::DecodeResult;
use crate::metadata::BlockKind;
use crate::op::{Instr, Op};
use crate::rewrite::Rewriter;
use quill_bytecode::OffsetMap;
use std::sync::Arc;

/// Whether the body contains a `SETUP_WITH` to expand.
pub fn has_with(instrs: &[Instr]) -> bool {
    instrs.iter().any(|i| matches!(i.op, Op::SetupWith { .. }))
}

/// Expand every `SETUP_WITH` in place of the original instruction.
///
/// Returns the new list and the map from old to new offsets.
pub fn desugar_with(instrs: &[Instr]) -> DecodeResult<(Vec<Instr>, OffsetMap)> {
    let exit: Arc<str> = Arc::from("__exit__");
    let enter: Arc<str> = Arc::from("__enter__");

    let mut rw = Rewriter::new();
    for instr in instrs {
        rw.begin(instr.offset);
        match &instr.op {
            &Op::SetupWith { handler } => {
                let expansion = [
                    Op::DupTop,
                    Op::LoadSpecial(exit.clone()),
                    Op::RotTwo,
                    Op::LoadSpecial(enter.clone()),
                    Op::CallFunction(0),
                    Op::SetupFinally {
                        handler,
                        kind: BlockKind::With,
                        reserve: 1,
                    },
                ];
                for op in expansion {
                    rw.push(op, instr.line, instr.origin);
                }
            }
            op => {
                rw.push(op.clone(), instr.line, instr.origin);
            }
        }
    }
    rw.finish()
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
    use crate::metadata::{BlockFrame, SlotType, StackMetadata};
    use crate::op::effect::Typer;
    use quill_bytecode::{CodeObject, Constant};
    use quill_types::{TypeId, TypeModel};

    fn body(ops: Vec<Op>) -> Vec<Instr> {
        let mut instrs: Vec<Instr> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| Instr {
                offset: i as u32,
                op,
                line: Some(i as u32 + 1),
                origin: Some(i as u32),
                is_jump_target: false,
            })
            .collect();
        crate::rewrite::mark_jump_targets(&mut instrs);
        instrs
    }

    /// with "s" as v: pass
    fn with_body() -> Vec<Instr> {
        body(vec![
            Op::LoadConst(0),                        // 0
            Op::SetupWith { handler: 6 },            // 1
            Op::StoreFast(0),                        // 2
            Op::PopBlock,                            // 3
            Op::LoadConst(1),                        // 4
            Op::ReturnValue,                         // 5
            Op::WithExceptStart,                     // 6 handler
            Op::PopJumpIf { when: true, target: 9 }, // 7
            Op::Reraise { restore_lasti: true },     // 8
            Op::PopTop,                              // 9
            Op::PopTop,                              // 10
            Op::PopTop,                              // 11
            Op::PopExcept,                           // 12
            Op::PopTop,                              // 13
            Op::LoadConst(1),                        // 14
            Op::ReturnValue,                         // 15
        ])
    }

    #[test]
    fn test_expansion_shape() {
        let (instrs, map) = desugar_with(&with_body()).unwrap();
        assert_eq!(instrs.len(), 21);
        let names: Vec<&str> = instrs[1..7].iter().map(|i| i.op.name()).collect();
        assert_eq!(
            names,
            ["DUP_TOP", "LOAD_SPECIAL", "ROT_TWO", "LOAD_SPECIAL", "CALL_FUNCTION", "SETUP_FINALLY"]
        );
        assert!(instrs[1..7].iter().all(|i| i.line == Some(2) && i.origin == Some(1)));
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), Some(7));
        assert_eq!(map.get(14), Some(19));
    }

    #[test]
    fn test_targets_relabelled() {
        let (instrs, map) = desugar_with(&with_body()).unwrap();
        assert_eq!(
            instrs[6].op,
            Op::SetupFinally {
                handler: 11,
                kind: BlockKind::With,
                reserve: 1
            }
        );
        assert_eq!(instrs[12].op, Op::PopJumpIf { when: true, target: 14 });
        assert_eq!(map.get(9), Some(14));
        assert!(instrs[11].is_jump_target);
        assert!(instrs[14].is_jump_target);
    }

    #[test]
    fn test_desugared_typing_matches_setup_with() {
        let model = TypeModel::with_builtins();
        let mut code = CodeObject::new("f", "f.py");
        code.constants = vec![Constant::str("s"), Constant::None].into_boxed_slice();
        let config = TranslatorConfig::default();
        let typer = Typer::new(&model, &code, &config);

        let run = |instrs: &[Instr]| {
            let graph = FlowGraph::build(instrs).unwrap();
            analyze(instrs, &graph, StackMetadata::entry(vec![None], 0), &typer).unwrap()
        };

        let original = with_body();
        let (desugared, map) = desugar_with(&original).unwrap();
        let before = run(&original);
        let after = run(&desugared);

        for instr in &original {
            let new = map.get(instr.offset).unwrap();
            let (a, b) = (&before.states[instr.offset as usize], &after.states[new as usize]);
            assert_eq!(a.stack, b.stack, "stack differs at {}", instr.offset);
            let levels = |s: &StackMetadata| s.blocks.iter().map(|b| b.level()).collect::<Vec<_>>();
            assert_eq!(levels(a), levels(b), "blocks differ at {}", instr.offset);
        }

        let body = &after.states[7];
        assert_eq!(body.stack[0], SlotType::method(TypeId::STR, "__exit__"));
        assert_eq!(
            body.blocks.as_slice(),
            &[BlockFrame::Finally {
                handler: 11,
                level: 1,
                kind: BlockKind::With
            }]
        );
    }

    #[test]
    fn test_has_with() {
        assert!(has_with(&with_body()));
        assert!(!has_with(&body(vec![Op::LoadConst(0), Op::ReturnValue])));
    }
}
