//! Code object representation for compiled functions.
//!
//! A `CodeObject` is the compiled-function descriptor handed to the
//! translator: raw instruction words plus the tables those instructions index
//! into. Code objects are immutable once created and shared behind `Arc`.

use crate::{Constant, InstructionStream, PythonVersion};
use bitflags::bitflags;
use std::fmt::Write;
use std::sync::Arc;

/// A compiled code object representing a function or module.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Function name (or `<module>` for module-level code).
    pub name: Arc<str>,

    /// Qualified name (includes enclosing class/function names).
    pub qualname: Arc<str>,

    /// Filename where this code was defined.
    pub filename: Arc<str>,

    /// First line number in source.
    pub first_lineno: u32,

    /// Bytecode dialect.
    pub version: PythonVersion,

    /// Raw instruction bytes, two per code unit.
    pub code: Box<[u8]>,

    /// Constant pool (indexed by `LOAD_CONST`).
    pub constants: Box<[Constant]>,

    /// Global/attribute name strings (indexed by `LOAD_GLOBAL`, `LOAD_ATTR`, ...).
    pub names: Box<[Arc<str>]>,

    /// Local variable names; the first entries are the parameters.
    pub varnames: Box<[Arc<str>]>,

    /// Cell variable names (locals captured by nested functions).
    pub cellvars: Box<[Arc<str>]>,

    /// Free variable names (captured from enclosing scope).
    pub freevars: Box<[Arc<str>]>,

    /// Number of positional parameters (including positional-only).
    pub arg_count: u16,

    /// Number of positional-only parameters.
    pub posonlyarg_count: u16,

    /// Number of keyword-only parameters.
    pub kwonlyarg_count: u16,

    /// Code flags.
    pub flags: CodeFlags,

    /// Line number table (code unit ranges to source lines).
    pub line_table: Box<[LineTableEntry]>,
}

bitflags! {
    /// Code object flags, using CPython's bit assignments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CodeFlags: u32 {
        /// Locals are fast slots.
        const OPTIMIZED = 0x0001;
        /// A fresh locals dict is created per call.
        const NEWLOCALS = 0x0002;
        /// Function uses *args.
        const VARARGS = 0x0004;
        /// Function uses **kwargs.
        const VARKEYWORDS = 0x0008;
        /// Function is nested.
        const NESTED = 0x0010;
        /// Function is a generator.
        const GENERATOR = 0x0020;
        /// Function has no free or cell variables.
        const NOFREE = 0x0040;
        // `async def` and `@types.coroutine` bodies; decoding rejects them.
        const COROUTINE = 0x0080;
        const ITERABLE_COROUTINE = 0x0100;
        const ASYNC_GENERATOR = 0x0200;
    }
}

/// Line table entry mapping code unit ranges to source lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineTableEntry {
    /// Starting code unit (inclusive).
    pub start: u32,
    /// Ending code unit (exclusive).
    pub end: u32,
    /// Source line number.
    pub line: u32,
}

impl CodeObject {
    /// Create a new empty code object.
    pub fn new(name: impl Into<Arc<str>>, filename: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        CodeObject {
            qualname: name.clone(),
            name,
            filename: filename.into(),
            first_lineno: 1,
            version: PythonVersion::default(),
            code: Box::new([]),
            constants: Box::new([]),
            names: Box::new([]),
            varnames: Box::new([]),
            cellvars: Box::new([]),
            freevars: Box::new([]),
            arg_count: 0,
            posonlyarg_count: 0,
            kwonlyarg_count: 0,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            line_table: Box::new([]),
        }
    }

    /// Number of code units.
    #[inline]
    pub fn len_units(&self) -> usize {
        self.code.len() / 2
    }

    /// Get the line number for a given code unit.
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.line_table
            .iter()
            .find(|entry| entry.start <= offset && offset < entry.end)
            .map(|entry| entry.line)
    }

    /// Check if this is a generator function.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// The kind of body the translator has no model for, judged by flags.
    ///
    /// Async bodies suspend on awaitables rather than yields, which the
    /// state-machine transform does not cover.
    pub fn unsupported_kind(&self) -> Option<&'static str> {
        if self.flags.contains(CodeFlags::ASYNC_GENERATOR) {
            Some("async generator")
        } else if self.flags.intersects(CodeFlags::COROUTINE | CodeFlags::ITERABLE_COROUTINE) {
            Some("coroutine")
        } else {
            None
        }
    }

    /// Total parameter count, including `*args` and `**kwargs` slots.
    pub fn total_params(&self) -> usize {
        let mut n = self.arg_count as usize + self.kwonlyarg_count as usize;
        if self.flags.contains(CodeFlags::VARARGS) {
            n += 1;
        }
        if self.flags.contains(CodeFlags::VARKEYWORDS) {
            n += 1;
        }
        n
    }

    /// Number of fast local slots.
    #[inline]
    pub fn local_count(&self) -> usize {
        self.varnames.len()
    }

    /// Number of closure slots (cell variables, then free variables).
    #[inline]
    pub fn closure_size(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Name of closure slot `index` (cell variables first).
    pub fn closure_name(&self, index: usize) -> Option<&Arc<str>> {
        if index < self.cellvars.len() {
            self.cellvars.get(index)
        } else {
            self.freevars.get(index - self.cellvars.len())
        }
    }
}

/// Disassemble a code object to a string.
///
/// Undecodable streams still produce the header and a raw word dump, so the
/// result is always usable in an error report.
pub fn disassemble(code: &CodeObject) -> String {
    let mut output = String::new();
    // Writing to a String cannot fail.
    let _ = write_listing(code, &mut output);
    output
}

fn write_listing(code: &CodeObject, output: &mut String) -> std::fmt::Result {
    writeln!(output, "Code object: {}", code.qualname)?;
    writeln!(output, "  File: {}", code.filename)?;
    writeln!(output, "  First line: {}", code.first_lineno)?;
    writeln!(output, "  Version: {}", code.version)?;
    writeln!(
        output,
        "  Args: {} (pos-only: {}, kw-only: {})",
        code.arg_count, code.posonlyarg_count, code.kwonlyarg_count
    )?;
    writeln!(output, "  Flags: {:08x}", code.flags.bits())?;

    if !code.constants.is_empty() {
        writeln!(output, "\nConstants:")?;
        for (i, c) in code.constants.iter().enumerate() {
            writeln!(output, "  {:4}: {:?}", i, c)?;
        }
    }

    if !code.names.is_empty() {
        writeln!(output, "\nNames:")?;
        for (i, n) in code.names.iter().enumerate() {
            writeln!(output, "  {:4}: {}", i, n)?;
        }
    }

    if !code.varnames.is_empty() {
        writeln!(output, "\nLocals:")?;
        for (i, l) in code.varnames.iter().enumerate() {
            writeln!(output, "  {:4}: {}", i, l)?;
        }
    }

    if code.closure_size() > 0 {
        writeln!(output, "\nCells:")?;
        for i in 0..code.closure_size() {
            if let Some(name) = code.closure_name(i) {
                writeln!(output, "  {:4}: {}", i, name)?;
            }
        }
    }

    writeln!(output, "\nDisassembly:")?;
    match InstructionStream::decode(code) {
        Ok(stream) => {
            for inst in stream.iter() {
                let line_str = inst.line.map_or("    ".to_string(), |l| format!("{:4}", l));
                let marker = if inst.is_jump_target { ">>" } else { "  " };
                writeln!(output, "{} {} {:4}: {}", line_str, marker, inst.offset, inst.display(code))?;
            }
        }
        Err(err) => {
            writeln!(output, "  <undecodable: {}>", err)?;
            for (i, word) in code.code.chunks(2).enumerate() {
                let arg = word.get(1).copied().unwrap_or(0);
                writeln!(output, "  {:4}: {:3} {:3}", i, word[0], arg)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_use_cpython_bits() {
        assert_eq!(CodeFlags::GENERATOR.bits(), 0x20);
        let plain_generator = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS | CodeFlags::GENERATOR | CodeFlags::NOFREE;
        assert_eq!(CodeFlags::from_bits(0x63), Some(plain_generator));
    }

    #[test]
    fn test_async_bodies_are_flagged_unsupported() {
        let mut code = CodeObject::new("f", "f.py");
        code.flags |= CodeFlags::GENERATOR;
        assert_eq!(code.unsupported_kind(), None);
        code.flags |= CodeFlags::ASYNC_GENERATOR;
        assert_eq!(code.unsupported_kind(), Some("async generator"));
        code.flags = CodeFlags::ITERABLE_COROUTINE;
        assert_eq!(code.unsupported_kind(), Some("coroutine"));
    }

    #[test]
    fn test_code_object_new() {
        let code = CodeObject::new("test_func", "test.py");
        assert_eq!(&*code.name, "test_func");
        assert_eq!(&*code.filename, "test.py");
        assert_eq!(code.len_units(), 0);
        assert!(!code.is_generator());
    }

    #[test]
    fn test_line_table_lookup() {
        let mut code = CodeObject::new("test", "test.py");
        code.line_table = vec![
            LineTableEntry {
                start: 0,
                end: 5,
                line: 10,
            },
            LineTableEntry {
                start: 5,
                end: 10,
                line: 15,
            },
        ]
        .into_boxed_slice();

        assert_eq!(code.line_for_offset(0), Some(10));
        assert_eq!(code.line_for_offset(4), Some(10));
        assert_eq!(code.line_for_offset(5), Some(15));
        assert_eq!(code.line_for_offset(10), None);
    }

    #[test]
    fn test_total_params() {
        let mut code = CodeObject::new("f", "t.py");
        code.arg_count = 2;
        code.kwonlyarg_count = 1;
        code.flags |= CodeFlags::VARARGS;
        assert_eq!(code.total_params(), 4);
    }

    #[test]
    fn test_closure_names() {
        let mut code = CodeObject::new("f", "t.py");
        code.cellvars = vec![Arc::from("a")].into_boxed_slice();
        code.freevars = vec![Arc::from("b")].into_boxed_slice();
        assert_eq!(code.closure_name(0).map(|s| &**s), Some("a"));
        assert_eq!(code.closure_name(1).map(|s| &**s), Some("b"));
        assert_eq!(code.closure_name(2), None);
    }

    #[test]
    fn test_disassemble_undecodable() {
        let mut code = CodeObject::new("bad", "t.py");
        code.code = vec![0u8, 0].into_boxed_slice();
        let text = disassemble(&code);
        assert!(text.contains("undecodable"));
        assert!(text.contains("Code object: bad"));
    }
}
