//! Decoded instruction streams.
//!
//! Decoding folds `EXTENDED_ARG` prefixes into the instruction they extend,
//! resolves every jump operand to an absolute code-unit offset and marks the
//! instructions that are jump targets.
//!
//! Offsets are measured in code units (one 16-bit word per unit) for both
//! dialects, so downstream passes never see the 3.9/3.10 operand difference.
//! A folded instruction's offset is that of its first prefix, which is where
//! CPython's own jumps point.

use crate::{BytecodeError, CodeObject, CompareOp, JumpKind, Opcode, PythonVersion};
use std::fmt;

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset in code units.
    pub offset: u32,
    /// The opcode.
    pub opcode: Opcode,
    /// Immediate argument with `EXTENDED_ARG` prefixes folded in.
    pub arg: u32,
    /// Code units occupied, prefixes included.
    pub size: u32,
    /// Absolute target offset, for jump opcodes.
    pub target: Option<u32>,
    /// Whether some jump lands on this instruction.
    pub is_jump_target: bool,
    /// Source line, when the code object has a line table.
    pub line: Option<u32>,
}

impl Instruction {
    /// Offset of the instruction that follows this one.
    #[inline]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    /// Render the instruction with its argument resolved against `code`.
    pub fn display<'a>(&'a self, code: &'a CodeObject) -> InstructionDisplay<'a> {
        InstructionDisplay { inst: self, code }
    }
}

/// Display adapter produced by [`Instruction::display`].
pub struct InstructionDisplay<'a> {
    inst: &'a Instruction,
    code: &'a CodeObject,
}

impl fmt::Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.inst;
        let code = self.code;
        if !inst.opcode.has_arg() {
            return write!(f, "{}", inst.opcode);
        }
        write!(f, "{:<24} {}", inst.opcode.name(), inst.arg)?;
        let idx = inst.arg as usize;
        match inst.opcode {
            Opcode::LoadConst => {
                if let Some(c) = code.constants.get(idx) {
                    write!(f, " ({:?})", c)?;
                }
            }
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                if let Some(name) = code.varnames.get(idx) {
                    write!(f, " ({})", name)?;
                }
            }
            Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClosure
            | Opcode::LoadClassderef => {
                if let Some(name) = code.closure_name(idx) {
                    write!(f, " ({})", name)?;
                }
            }
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::LoadMethod
            | Opcode::ImportName
            | Opcode::ImportFrom => {
                if let Some(name) = code.names.get(idx) {
                    write!(f, " ({})", name)?;
                }
            }
            Opcode::CompareOp => {
                if let Some(op) = CompareOp::from_arg(inst.arg) {
                    write!(f, " ({})", op.symbol())?;
                }
            }
            _ => {}
        }
        if let Some(target) = inst.target {
            write!(f, " (to {})", target)?;
        }
        Ok(())
    }
}

/// An immutable, decoded instruction list in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionStream {
    version: PythonVersion,
    instructions: Box<[Instruction]>,
}

impl InstructionStream {
    /// Decode the instruction words of `code`.
    pub fn decode(code: &CodeObject) -> Result<Self, BytecodeError> {
        let bytes = &code.code;
        if bytes.len() % 2 != 0 {
            return Err(BytecodeError::Truncated(bytes.len()));
        }
        if bytes.is_empty() {
            return Err(BytecodeError::Empty);
        }
        let version = code.version;

        let mut instructions = Vec::with_capacity(bytes.len() / 2);
        let mut ext: u32 = 0;
        let mut start: Option<u32> = None;

        for (unit, word) in bytes.chunks_exact(2).enumerate() {
            let unit = unit as u32;
            let (byte, arg_byte) = (word[0], word[1] as u32);
            let opcode = Opcode::from_byte(byte, version).ok_or(BytecodeError::UnknownOpcode {
                byte,
                offset: unit,
                version,
            })?;

            if opcode == Opcode::ExtendedArg {
                start.get_or_insert(unit);
                ext = (ext | arg_byte) << 8;
                continue;
            }

            let offset = start.take().unwrap_or(unit);
            if !opcode.is_supported() {
                return Err(BytecodeError::UnsupportedOpcode { opcode, offset });
            }
            let arg = if opcode.has_arg() { ext | arg_byte } else { 0 };
            ext = 0;

            let target = match opcode.jump_kind() {
                Some(kind) => Some(resolve_jump(version, kind, unit, arg, offset)?),
                None => None,
            };

            instructions.push(Instruction {
                offset,
                opcode,
                arg,
                size: unit + 1 - offset,
                target,
                is_jump_target: false,
                line: code.line_for_offset(offset),
            });
        }

        if let Some(offset) = start {
            return Err(BytecodeError::DanglingExtendedArg(offset));
        }

        let targets: Vec<(u32, u32)> = instructions
            .iter()
            .filter_map(|inst| inst.target.map(|t| (inst.offset, t)))
            .collect();
        for (offset, target) in targets {
            let index = instructions
                .binary_search_by_key(&target, |inst| inst.offset)
                .map_err(|_| BytecodeError::InvalidJumpTarget { offset, target })?;
            instructions[index].is_jump_target = true;
        }

        Ok(InstructionStream {
            version,
            instructions: instructions.into_boxed_slice(),
        })
    }

    /// The dialect the stream was decoded from.
    #[inline]
    pub fn version(&self) -> PythonVersion {
        self.version
    }

    /// All instructions, in offset order.
    #[inline]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Iterate over the instructions.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Number of instructions.
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the stream is empty (never true for a decoded stream).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Index of the instruction at `offset`.
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |inst| inst.offset)
            .ok()
    }

    /// The instruction at `offset`.
    pub fn get(&self, offset: u32) -> Option<&Instruction> {
        self.index_of(offset).map(|i| &self.instructions[i])
    }

    /// Offset one past the last instruction.
    pub fn end_offset(&self) -> u32 {
        self.instructions.last().map_or(0, Instruction::next_offset)
    }
}

impl<'a> IntoIterator for &'a InstructionStream {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

/// Resolve a jump operand to an absolute code-unit offset.
///
/// Relative jumps count from the word after the opcode, not from the first
/// `EXTENDED_ARG` prefix.
fn resolve_jump(
    version: PythonVersion,
    kind: JumpKind,
    unit: u32,
    arg: u32,
    offset: u32,
) -> Result<u32, BytecodeError> {
    if version == PythonVersion::V3_9 && arg % 2 != 0 {
        return Err(BytecodeError::InvalidJumpTarget {
            offset,
            target: arg,
        });
    }
    let target = version.jump_arg_to_units(arg).and_then(|units| match kind {
        JumpKind::Relative => units.checked_add(unit + 1),
        JumpKind::Absolute => Some(units),
    });
    target.ok_or(BytecodeError::InvalidJumpTarget {
        offset,
        target: arg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Constant;

    fn code(version: PythonVersion, words: &[(Opcode, u8)]) -> CodeObject {
        let mut code = CodeObject::new("t", "t.py");
        code.version = version;
        code.code = words.iter().flat_map(|&(op, arg)| [op.byte(), arg]).collect();
        code.constants = vec![Constant::None].into_boxed_slice();
        code
    }

    #[test]
    fn test_decode_simple() {
        let c = code(
            PythonVersion::V3_10,
            &[(Opcode::LoadConst, 0), (Opcode::ReturnValue, 0)],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.instructions()[1].offset, 1);
        assert_eq!(stream.end_offset(), 2);
    }

    #[test]
    fn test_extended_arg_folding() {
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::ExtendedArg, 1),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
            ],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        let first = stream.instructions()[0];
        assert_eq!(first.opcode, Opcode::LoadConst);
        assert_eq!(first.arg, 258);
        assert_eq!(first.offset, 0);
        assert_eq!(first.size, 2);
        assert_eq!(stream.instructions()[1].offset, 2);
    }

    #[test]
    fn test_jump_units_per_version() {
        // 3.10 counts instructions
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 3),
                (Opcode::Nop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        assert_eq!(stream.instructions()[1].target, Some(3));
        assert!(stream.get(3).unwrap().is_jump_target);

        // 3.9 counts bytes
        let c = code(
            PythonVersion::V3_9,
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 6),
                (Opcode::Nop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        assert_eq!(stream.instructions()[1].target, Some(3));
    }

    #[test]
    fn test_relative_jump() {
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::JumpForward, 1),
                (Opcode::Nop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        assert_eq!(stream.instructions()[0].target, Some(2));
    }

    #[test]
    fn test_jump_into_nothing() {
        let c = code(
            PythonVersion::V3_10,
            &[(Opcode::JumpAbsolute, 9), (Opcode::ReturnValue, 0)],
        );
        assert_eq!(
            InstructionStream::decode(&c),
            Err(BytecodeError::InvalidJumpTarget {
                offset: 0,
                target: 9
            })
        );
    }

    #[test]
    fn test_jump_into_prefix_middle() {
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::JumpAbsolute, 2),
                (Opcode::ExtendedArg, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
        );
        assert!(matches!(
            InstructionStream::decode(&c),
            Err(BytecodeError::InvalidJumpTarget { target: 2, .. })
        ));
    }

    #[test]
    fn test_oversized_jump_operand_is_rejected() {
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::ExtendedArg, 0xff),
                (Opcode::ExtendedArg, 0xff),
                (Opcode::ExtendedArg, 0xff),
                (Opcode::JumpForward, 0xff),
            ],
        );
        assert_eq!(
            InstructionStream::decode(&c).unwrap_err(),
            BytecodeError::InvalidJumpTarget {
                offset: 0,
                target: u32::MAX
            }
        );

        // fits in the operand but lands far past the end
        let c = code(
            PythonVersion::V3_10,
            &[
                (Opcode::ExtendedArg, 0x7f),
                (Opcode::ExtendedArg, 0xff),
                (Opcode::ExtendedArg, 0xff),
                (Opcode::JumpAbsolute, 0xff),
            ],
        );
        assert!(matches!(
            InstructionStream::decode(&c),
            Err(BytecodeError::InvalidJumpTarget { offset: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_and_unsupported() {
        let c = code(PythonVersion::V3_9, &[(Opcode::GenStart, 0)]);
        assert!(matches!(
            InstructionStream::decode(&c),
            Err(BytecodeError::UnknownOpcode { byte: 129, .. })
        ));

        let c = code(PythonVersion::V3_10, &[(Opcode::GetAwaitable, 0)]);
        assert_eq!(
            InstructionStream::decode(&c),
            Err(BytecodeError::UnsupportedOpcode {
                opcode: Opcode::GetAwaitable,
                offset: 0
            })
        );
    }

    #[test]
    fn test_truncated_and_dangling() {
        let mut c = code(PythonVersion::V3_10, &[(Opcode::ReturnValue, 0)]);
        c.code = vec![Opcode::ReturnValue.byte()].into_boxed_slice();
        assert_eq!(InstructionStream::decode(&c), Err(BytecodeError::Truncated(1)));

        let c = code(PythonVersion::V3_10, &[(Opcode::ExtendedArg, 1)]);
        assert_eq!(
            InstructionStream::decode(&c),
            Err(BytecodeError::DanglingExtendedArg(0))
        );
    }

    #[test]
    fn test_display_resolves_names() {
        let c = code(
            PythonVersion::V3_10,
            &[(Opcode::LoadConst, 0), (Opcode::ReturnValue, 0)],
        );
        let stream = InstructionStream::decode(&c).unwrap();
        let text = stream.instructions()[0].display(&c).to_string();
        assert!(text.starts_with("LOAD_CONST"));
        assert!(text.ends_with("(None)"));
    }
}
