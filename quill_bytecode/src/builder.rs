//! Code object assembler.
//!
//! The `CodeBuilder` emits raw CPython instruction words with symbolic jump
//! labels, managing the constant, name and local tables. It is how hosts and
//! tests construct code objects without a Python compiler at hand.
//!
//! # Example
//! ```
//! use quill_bytecode::{CodeBuilder, Constant, Opcode};
//!
//! let mut b = CodeBuilder::new("answer");
//! b.load_const(Constant::Int(42));
//! b.emit_op(Opcode::ReturnValue);
//! let code = b.finish().unwrap();
//! assert_eq!(code.len_units(), 2);
//! ```

use crate::{BytecodeError, CodeFlags, CodeObject, CompareOp, Constant, JumpKind, LineTableEntry};
use crate::{Opcode, PythonVersion};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A label for jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy)]
enum Operand {
    Imm(u32),
    Label(Label),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    opcode: Opcode,
    operand: Operand,
    line: u32,
}

/// Key type for constant deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Bool(bool),
    Int(i64),
    /// Float bits for exact comparison.
    Float(u64),
    Str(Arc<str>),
}

impl ConstantKey {
    fn from_constant(value: &Constant) -> Option<Self> {
        // Only scalar constants are deduplicated
        match value {
            Constant::None => Some(ConstantKey::None),
            Constant::Bool(b) => Some(ConstantKey::Bool(*b)),
            Constant::Int(i) => Some(ConstantKey::Int(*i)),
            Constant::Float(f) => Some(ConstantKey::Float(f.to_bits())),
            Constant::Str(s) => Some(ConstantKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// Builder for constructing code objects.
pub struct CodeBuilder {
    name: Arc<str>,
    qualname: Arc<str>,
    filename: Arc<str>,
    first_lineno: u32,
    current_line: u32,
    version: PythonVersion,

    items: Vec<Pending>,

    constants: Vec<Constant>,
    constant_map: FxHashMap<ConstantKey, u32>,

    varnames: Vec<Arc<str>>,
    names: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,

    arg_count: u16,
    posonlyarg_count: u16,
    kwonlyarg_count: u16,
    flags: CodeFlags,

    next_label: u32,
    labels: FxHashMap<Label, usize>,
}

impl CodeBuilder {
    /// Create a new builder targeting the default dialect.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            filename: "<unknown>".into(),
            first_lineno: 1,
            current_line: 1,
            version: PythonVersion::default(),
            items: Vec::new(),
            constants: Vec::new(),
            constant_map: FxHashMap::default(),
            varnames: Vec::new(),
            names: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            arg_count: 0,
            posonlyarg_count: 0,
            kwonlyarg_count: 0,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            next_label: 0,
            labels: FxHashMap::default(),
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the qualified name.
    pub fn set_qualname(&mut self, qualname: impl Into<Arc<str>>) {
        self.qualname = qualname.into();
    }

    /// Set the filename.
    pub fn set_filename(&mut self, filename: impl Into<Arc<str>>) {
        self.filename = filename.into();
    }

    /// Set the first line number.
    pub fn set_first_lineno(&mut self, line: u32) {
        self.first_lineno = line;
        self.current_line = line;
    }

    /// Set the current line number for subsequent instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Set the bytecode dialect.
    pub fn set_version(&mut self, version: PythonVersion) {
        self.version = version;
    }

    /// Declare positional parameters. They become the first locals.
    pub fn set_params(&mut self, params: &[&str]) {
        for p in params {
            self.define_local(*p);
        }
        self.arg_count = params.len() as u16;
    }

    /// Set the number of positional-only parameters.
    pub fn set_posonlyarg_count(&mut self, count: u16) {
        self.posonlyarg_count = count;
    }

    /// Set the number of keyword-only parameters.
    pub fn set_kwonlyarg_count(&mut self, count: u16) {
        self.kwonlyarg_count = count;
    }

    /// Add code flags.
    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags |= flags;
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Add a constant, deduplicating scalars.
    pub fn add_constant(&mut self, value: Constant) -> u32 {
        let key = ConstantKey::from_constant(&value);
        if let Some(idx) = key.as_ref().and_then(|k| self.constant_map.get(k)) {
            return *idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        if let Some(k) = key {
            self.constant_map.insert(k, idx);
        }
        idx
    }

    /// Define (or look up) a local variable slot.
    pub fn define_local(&mut self, name: impl Into<Arc<str>>) -> u32 {
        intern(&mut self.varnames, name.into())
    }

    /// Add (or look up) a global/attribute name.
    pub fn add_name(&mut self, name: impl Into<Arc<str>>) -> u32 {
        intern(&mut self.names, name.into())
    }

    /// Add a cell variable. Cells must be declared before free variables are
    /// referenced, as closure indices put cells first.
    pub fn add_cellvar(&mut self, name: impl Into<Arc<str>>) -> u32 {
        intern(&mut self.cellvars, name.into())
    }

    /// Add a free variable; returns its closure index.
    pub fn add_freevar(&mut self, name: impl Into<Arc<str>>) -> u32 {
        self.cellvars.len() as u32 + intern(&mut self.freevars, name.into())
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a new label for a jump target.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Mark the next emitted instruction as the target for a label.
    pub fn bind_label(&mut self, label: Label) {
        self.labels.insert(label, self.items.len());
    }

    // =========================================================================
    // Instruction Emission
    // =========================================================================

    /// Emit an instruction with an immediate argument.
    pub fn emit(&mut self, opcode: Opcode, arg: u32) {
        self.items.push(Pending {
            opcode,
            operand: Operand::Imm(if opcode.has_arg() { arg } else { 0 }),
            line: self.current_line,
        });
    }

    /// Emit an instruction without an argument.
    pub fn emit_op(&mut self, opcode: Opcode) {
        self.emit(opcode, 0);
    }

    /// Emit a jump to `label`.
    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(opcode.jump_kind().is_some(), "{} is not a jump", opcode);
        self.items.push(Pending {
            opcode,
            operand: Operand::Label(label),
            line: self.current_line,
        });
    }

    /// `LOAD_CONST` of a (deduplicated) constant.
    pub fn load_const(&mut self, value: Constant) {
        let idx = self.add_constant(value);
        self.emit(Opcode::LoadConst, idx);
    }

    /// `LOAD_FAST` of a named local.
    pub fn load_fast(&mut self, name: &str) {
        let slot = self.define_local(name);
        self.emit(Opcode::LoadFast, slot);
    }

    /// `STORE_FAST` to a named local.
    pub fn store_fast(&mut self, name: &str) {
        let slot = self.define_local(name);
        self.emit(Opcode::StoreFast, slot);
    }

    /// `LOAD_GLOBAL` of a name.
    pub fn load_global(&mut self, name: &str) {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadGlobal, idx);
    }

    /// `LOAD_ATTR` of a name.
    pub fn load_attr(&mut self, name: &str) {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadAttr, idx);
    }

    /// `LOAD_METHOD` of a name.
    pub fn load_method(&mut self, name: &str) {
        let idx = self.add_name(name);
        self.emit(Opcode::LoadMethod, idx);
    }

    /// `COMPARE_OP`.
    pub fn compare(&mut self, op: CompareOp) {
        self.emit(Opcode::CompareOp, op as u32);
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.items.len()
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Lay out the instructions and return the code object.
    pub fn finish(mut self) -> Result<CodeObject, BytecodeError> {
        let version = self.version;
        let targets: Vec<Option<usize>> = self
            .items
            .iter()
            .map(|item| match item.operand {
                Operand::Imm(_) => Ok(None),
                Operand::Label(label) => self
                    .labels
                    .get(&label)
                    .copied()
                    .map(Some)
                    .ok_or(BytecodeError::UnboundLabel(label.0)),
            })
            .collect::<Result<_, _>>()?;

        // Jump operands depend on offsets, which depend on EXTENDED_ARG
        // prefixes; sizes only grow, so this settles.
        let mut sizes: Vec<u32> = self
            .items
            .iter()
            .map(|item| match item.operand {
                Operand::Imm(arg) => 1 + prefix_count(arg),
                Operand::Label(_) => 1,
            })
            .collect();
        let (offsets, args) = loop {
            let offsets = prefix_sums(&sizes);
            let mut args = Vec::with_capacity(self.items.len());
            let mut changed = false;
            for (i, item) in self.items.iter().enumerate() {
                let arg = match (item.operand, targets[i]) {
                    (Operand::Label(_), Some(t)) => {
                        let target = offsets[t];
                        let next = offsets[i] + sizes[i];
                        let units = match item.opcode.jump_kind() {
                            Some(JumpKind::Relative) => {
                                target.checked_sub(next).ok_or(BytecodeError::InvalidJumpTarget {
                                    offset: offsets[i],
                                    target,
                                })?
                            }
                            _ => target,
                        };
                        version
                            .units_to_jump_arg(units)
                            .ok_or(BytecodeError::InvalidJumpTarget {
                                offset: offsets[i],
                                target,
                            })?
                    }
                    (Operand::Imm(arg), _) => arg,
                    (Operand::Label(label), None) => return Err(BytecodeError::UnboundLabel(label.0)),
                };
                let size = 1 + prefix_count(arg);
                if size > sizes[i] {
                    sizes[i] = size;
                    changed = true;
                }
                args.push(arg);
            }
            if !changed {
                break (offsets, args);
            }
        };

        let mut code = Vec::new();
        let mut line_table: Vec<LineTableEntry> = Vec::new();
        for (i, item) in self.items.iter().enumerate() {
            let arg = args[i];
            for shift in (1..sizes[i]).rev() {
                code.push(Opcode::ExtendedArg.byte());
                code.push((arg >> (8 * shift)) as u8);
            }
            code.push(item.opcode.byte());
            code.push(arg as u8);

            let end = offsets[i] + sizes[i];
            match line_table.last_mut() {
                Some(entry) if entry.line == item.line => entry.end = end,
                _ => line_table.push(LineTableEntry {
                    start: offsets[i],
                    end,
                    line: item.line,
                }),
            }
        }

        if self
            .items
            .iter()
            .any(|item| matches!(item.opcode, Opcode::YieldValue | Opcode::YieldFrom))
        {
            self.flags |= CodeFlags::GENERATOR;
        }
        if self.cellvars.is_empty() && self.freevars.is_empty() {
            self.flags |= CodeFlags::NOFREE;
        }

        Ok(CodeObject {
            name: self.name,
            qualname: self.qualname,
            filename: self.filename,
            first_lineno: self.first_lineno,
            version,
            code: code.into_boxed_slice(),
            constants: self.constants.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            varnames: self.varnames.into_boxed_slice(),
            cellvars: self.cellvars.into_boxed_slice(),
            freevars: self.freevars.into_boxed_slice(),
            arg_count: self.arg_count,
            posonlyarg_count: self.posonlyarg_count,
            kwonlyarg_count: self.kwonlyarg_count,
            flags: self.flags,
            line_table: line_table.into_boxed_slice(),
        })
    }
}

fn intern(table: &mut Vec<Arc<str>>, name: Arc<str>) -> u32 {
    if let Some(idx) = table.iter().position(|n| *n == name) {
        return idx as u32;
    }
    table.push(name);
    (table.len() - 1) as u32
}

/// Number of `EXTENDED_ARG` prefixes needed for `arg`.
fn prefix_count(arg: u32) -> u32 {
    match arg {
        0..=0xFF => 0,
        0x100..=0xFFFF => 1,
        0x1_0000..=0xFF_FFFF => 2,
        _ => 3,
    }
}

fn prefix_sums(sizes: &[u32]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0;
    for size in sizes {
        offsets.push(acc);
        acc += size;
    }
    // Labels bound after the last instruction resolve to the end offset.
    offsets.push(acc);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstructionStream;

    #[test]
    fn test_simple_function() {
        let mut b = CodeBuilder::new("add");
        b.set_filename("test.py");
        b.set_params(&["x", "y"]);
        b.load_fast("x");
        b.load_fast("y");
        b.emit_op(Opcode::BinaryAdd);
        b.emit_op(Opcode::ReturnValue);
        let code = b.finish().unwrap();

        assert_eq!(&*code.name, "add");
        assert_eq!(code.arg_count, 2);
        assert_eq!(code.len_units(), 4);
        assert!(code.flags.contains(CodeFlags::NOFREE));
    }

    #[test]
    fn test_constant_deduplication() {
        let mut b = CodeBuilder::new("test");
        let idx1 = b.add_constant(Constant::Int(42));
        let idx2 = b.add_constant(Constant::Int(42));
        let idx3 = b.add_constant(Constant::Int(100));
        assert_eq!(idx1, idx2);
        assert_ne!(idx1, idx3);
    }

    #[test]
    fn test_labels_resolve_per_version() {
        for version in [PythonVersion::V3_9, PythonVersion::V3_10] {
            let mut b = CodeBuilder::new("loop");
            b.set_version(version);
            let top = b.create_label();
            let end = b.create_label();
            b.bind_label(top);
            b.load_fast("x");
            b.emit_jump(Opcode::PopJumpIfFalse, end);
            b.emit_jump(Opcode::JumpAbsolute, top);
            b.bind_label(end);
            b.load_const(Constant::None);
            b.emit_op(Opcode::ReturnValue);
            let code = b.finish().unwrap();

            let stream = InstructionStream::decode(&code).unwrap();
            let insts = stream.instructions();
            assert_eq!(insts[1].target, Some(3));
            assert_eq!(insts[2].target, Some(0));
            assert!(insts[0].is_jump_target);
        }
    }

    #[test]
    fn test_extended_arg_layout() {
        let mut b = CodeBuilder::new("big");
        for i in 0..300 {
            b.add_constant(Constant::Int(i));
        }
        let end = b.create_label();
        b.emit_jump(Opcode::JumpForward, end);
        b.load_const(Constant::Int(299));
        b.bind_label(end);
        b.load_const(Constant::None);
        b.emit_op(Opcode::ReturnValue);
        let code = b.finish().unwrap();

        let stream = InstructionStream::decode(&code).unwrap();
        let insts = stream.instructions();
        assert_eq!(insts[1].arg, 299);
        assert_eq!(insts[1].size, 2);
        assert_eq!(insts[0].target, Some(insts[2].offset));
    }

    #[test]
    fn test_backward_relative_jump_rejected() {
        let mut b = CodeBuilder::new("bad");
        let top = b.create_label();
        b.bind_label(top);
        b.emit_op(Opcode::Nop);
        b.emit_jump(Opcode::JumpForward, top);
        assert!(matches!(b.finish(), Err(BytecodeError::InvalidJumpTarget { .. })));
    }

    #[test]
    fn test_unbound_label() {
        let mut b = CodeBuilder::new("bad");
        let nowhere = b.create_label();
        b.emit_jump(Opcode::JumpAbsolute, nowhere);
        assert_eq!(b.finish().err(), Some(BytecodeError::UnboundLabel(0)));
    }

    #[test]
    fn test_generator_flag_inferred() {
        let mut b = CodeBuilder::new("g");
        b.load_const(Constant::Int(1));
        b.emit_op(Opcode::YieldValue);
        b.emit_op(Opcode::PopTop);
        b.load_const(Constant::None);
        b.emit_op(Opcode::ReturnValue);
        let code = b.finish().unwrap();
        assert!(code.is_generator());
    }

    #[test]
    fn test_line_table() {
        let mut b = CodeBuilder::new("f");
        b.set_first_lineno(10);
        b.load_const(Constant::None);
        b.set_line(11);
        b.emit_op(Opcode::ReturnValue);
        let code = b.finish().unwrap();
        assert_eq!(code.line_for_offset(0), Some(10));
        assert_eq!(code.line_for_offset(1), Some(11));
    }
}
