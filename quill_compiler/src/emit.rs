//! The emitter interface and two diagnostic emitters.
//!
//! Code generation proper belongs to a backend. The translator drives any
//! [`Emitter`] through one compilation unit:
//!
//! 1. [`Emitter::begin`] with the [`UnitHeader`]
//! 2. [`Emitter::emit`] once per reachable instruction, in program order,
//!    with its final before-state and [`Lowering`]
//! 3. [`Emitter::finish`], producing the backend's artifact
//!
//! Every state an emitter sees is a post-fixed-point value.

use crate::cache::FunctionId;
use crate::error::EmitError;
use crate::exception::ExceptionRegion;
use crate::generator::GeneratorDescriptor;
use crate::metadata::StackMetadata;
use crate::op::Instr;
use crate::op::lower::Lowering;
use crate::signature::CallSignature;
use quill_bytecode::CodeObject;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Interface
// =============================================================================

/// Everything about a unit that is known before its first instruction.
#[derive(Debug, Clone, Copy)]
pub struct UnitHeader<'a> {
    pub id: FunctionId,
    pub code: &'a Arc<CodeObject>,
    pub signature: &'a CallSignature,
    /// Static exception table, sorted by start offset.
    pub regions: &'a [ExceptionRegion],
    /// Present for generator functions.
    pub generator: Option<&'a GeneratorDescriptor>,
    /// Length of the translated instruction list, reachable or not.
    pub instruction_count: usize,
}

/// One instruction handed to the emitter.
#[derive(Debug, Clone)]
pub struct EmitSite<'a> {
    pub instr: &'a Instr,
    /// Final state before the instruction.
    pub before: &'a StackMetadata,
    pub lowering: Lowering,
}

/// A code-emission backend.
pub trait Emitter {
    /// What a finished unit produces.
    type Output;

    /// Start a unit.
    fn begin(&mut self, header: &UnitHeader<'_>) -> Result<(), EmitError>;

    /// Emit one reachable instruction.
    fn emit(&mut self, site: EmitSite<'_>) -> Result<(), EmitError>;

    /// Finish the unit.
    fn finish(&mut self) -> Result<Self::Output, EmitError>;
}

// =============================================================================
// Listing Emitter
// =============================================================================

/// Writes a human-readable listing of the typed instruction stream.
///
/// Not a stable format. The writer is buffered and flushed on drop, so the
/// file is closed on every exit path.
pub struct ListingEmitter<W: Write> {
    out: W,
    lines: usize,
}

impl<W: Write> ListingEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) -> Result<(), EmitError> {
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }
}

impl ListingEmitter<BufWriter<File>> {
    /// A listing written to a fresh file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, EmitError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> Emitter for ListingEmitter<W> {
    /// Number of lines written.
    type Output = usize;

    fn begin(&mut self, header: &UnitHeader<'_>) -> Result<(), EmitError> {
        self.lines = 0;
        self.line(format_args!(
            "unit {} ({}:{}) {:?}",
            header.code.qualname, header.code.filename, header.code.first_lineno, header.id
        ))?;
        for region in header.regions {
            self.line(format_args!(
                "  region {}..{} -> {} level {} {:?}",
                region.start, region.end, region.handler, region.level, region.kind
            ))?;
        }
        if let Some(generator) = header.generator {
            for state in &generator.states {
                self.line(format_args!(
                    "  state {} resume {} live {:?} saved {:?}",
                    state.id, state.resume, state.live_locals, state.saved_stack
                ))?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, site: EmitSite<'_>) -> Result<(), EmitError> {
        self.line(format_args!(
            "{:<48} ; {:?} {:?}",
            site.instr.to_string(),
            site.before.stack,
            site.lowering
        ))
    }

    fn finish(&mut self) -> Result<usize, EmitError> {
        self.out.flush()?;
        Ok(self.lines)
    }
}

// =============================================================================
// Recording Emitter
// =============================================================================

/// One recorded emission.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSite {
    pub instr: Instr,
    pub before: StackMetadata,
    pub lowering: Lowering,
}

/// Everything a [`RecordingEmitter`] saw for one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    pub id: Option<FunctionId>,
    pub regions: Vec<ExceptionRegion>,
    pub generator: Option<GeneratorDescriptor>,
    pub sites: Vec<RecordedSite>,
}

impl Recording {
    /// The recorded site for `offset`, if it was emitted.
    pub fn site(&self, offset: u32) -> Option<&RecordedSite> {
        self.sites.iter().find(|s| s.instr.offset == offset)
    }
}

/// Keeps every call it receives. For tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    current: Recording,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emitter for RecordingEmitter {
    type Output = Recording;

    fn begin(&mut self, header: &UnitHeader<'_>) -> Result<(), EmitError> {
        self.current = Recording {
            id: Some(header.id),
            regions: header.regions.to_vec(),
            generator: header.generator.cloned(),
            sites: Vec::with_capacity(header.instruction_count),
        };
        Ok(())
    }

    fn emit(&mut self, site: EmitSite<'_>) -> Result<(), EmitError> {
        self.current.sites.push(RecordedSite {
            instr: site.instr.clone(),
            before: site.before.clone(),
            lowering: site.lowering,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<Recording, EmitError> {
        Ok(std::mem::take(&mut self.current))
    }
}
