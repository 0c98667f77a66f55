//! Pure rewrite passes over instruction lists.
//!
//! A [`Rewriter`] builds a fresh instruction list while recording where each
//! old offset landed. Ops are pushed with their targets still in the old
//! offset space; [`Rewriter::finish`] maps every target through the
//! [`OffsetMap`] in one step, so no pass ever patches offsets in place.

use crate::error::{DecodeError, DecodeResult};
use crate::op::{Instr, Op};
use quill_bytecode::{CodeObject, InstructionStream, OffsetMap};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Builder for a rewritten instruction list.
#[derive(Debug, Default)]
pub struct Rewriter {
    out: Vec<Instr>,
    map: OffsetMap,
    pending: SmallVec<[u32; 2]>,
}

impl Rewriter {
    /// Create an empty rewriter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start translating the old instruction at `old`.
    ///
    /// The old offset maps to the next instruction pushed. Beginning several
    /// offsets before a push maps all of them there, which is how removed
    /// instructions forward their incoming jumps.
    pub fn begin(&mut self, old: u32) {
        self.pending.push(old);
    }

    /// Append an op whose targets are old offsets. Returns its new offset.
    pub fn push(&mut self, op: Op, line: Option<u32>, origin: Option<u32>) -> u32 {
        let offset = self.out.len() as u32;
        for old in self.pending.drain(..) {
            self.map.insert(old, offset);
        }
        self.out.push(Instr {
            offset,
            op,
            line,
            origin,
            is_jump_target: false,
        });
        offset
    }

    /// Number of instructions pushed so far.
    pub fn len(&self) -> usize {
        self.out.len()
    }

    /// Whether nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Relabel every target and return the new list with the offset map.
    pub fn finish(self) -> DecodeResult<(Vec<Instr>, OffsetMap)> {
        let Rewriter { out, map, .. } = self;
        let mut instrs = out
            .into_iter()
            .map(|instr| {
                let op = instr.op.relabel(&map).map_err(|target| DecodeError::InvalidJumpTarget {
                    offset: instr.offset,
                    target,
                })?;
                Ok(Instr { op, ..instr })
            })
            .collect::<DecodeResult<Vec<_>>>()?;
        mark_jump_targets(&mut instrs);
        Ok((instrs, map))
    }
}

/// Recompute `is_jump_target` from the ops' targets.
pub fn mark_jump_targets(instrs: &mut [Instr]) {
    let targets: FxHashSet<u32> = instrs.iter().flat_map(|i| i.op.targets()).collect();
    for instr in instrs.iter_mut() {
        instr.is_jump_target = targets.contains(&instr.offset);
    }
}

/// Decode a code object into a dense instruction list.
///
/// Offsets become instruction indices; the returned map takes raw code-unit
/// offsets to them.
pub fn decode_body(code: &CodeObject) -> DecodeResult<(Vec<Instr>, OffsetMap)> {
    if let Some(kind) = code.unsupported_kind() {
        return Err(DecodeError::UnsupportedCode(kind));
    }
    let stream = InstructionStream::decode(code)?;
    let mut rw = Rewriter::new();
    for inst in &stream {
        rw.begin(inst.offset);
        rw.push(Op::decode(inst, code)?, inst.line, Some(inst.offset));
    }
    rw.finish()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{Constant, Opcode, PythonVersion};

    #[test]
    fn test_insert_shifts_targets() {
        let mut rw = Rewriter::new();
        rw.begin(0);
        rw.push(Op::Jump { target: 2 }, None, Some(0));
        rw.begin(1);
        rw.push(Op::Nop, None, None);
        rw.push(Op::Nop, None, None);
        rw.begin(2);
        rw.push(Op::ReturnValue, None, Some(2));
        let (instrs, map) = rw.finish().unwrap();
        assert_eq!(instrs[0].op, Op::Jump { target: 3 });
        assert!(instrs[3].is_jump_target);
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), Some(3));
    }

    #[test]
    fn test_removed_instruction_forwards() {
        let mut rw = Rewriter::new();
        rw.begin(0);
        rw.push(Op::Jump { target: 1 }, None, Some(0));
        // old 1 is dropped
        rw.begin(1);
        rw.begin(2);
        rw.push(Op::ReturnValue, None, Some(2));
        let (instrs, _) = rw.finish().unwrap();
        assert_eq!(instrs[0].op, Op::Jump { target: 1 });
        assert_eq!(instrs.len(), 2);
    }

    #[test]
    fn test_dangling_target() {
        let mut rw = Rewriter::new();
        rw.begin(0);
        rw.push(Op::Jump { target: 7 }, None, Some(0));
        assert_eq!(
            rw.finish().unwrap_err(),
            DecodeError::InvalidJumpTarget { offset: 0, target: 7 }
        );
    }

    #[test]
    fn test_decode_body_is_dense() {
        let mut code = CodeObject::new("f", "f.py");
        code.version = PythonVersion::V3_9;
        code.constants = vec![Constant::None].into_boxed_slice();
        code.code = [
            (Opcode::ExtendedArg, 0),
            (Opcode::LoadConst, 0),
            (Opcode::PopJumpIfFalse, 8),
            (Opcode::LoadConst, 0),
            (Opcode::ReturnValue, 0),
        ]
        .iter()
        .flat_map(|&(op, arg)| [op.byte(), arg])
        .collect();
        let (instrs, map) = decode_body(&code).unwrap();
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[1].op, Op::PopJumpIf { when: false, target: 3 });
        assert_eq!(instrs[1].origin, Some(2));
        assert_eq!(map.get(4), Some(3));
    }
}
