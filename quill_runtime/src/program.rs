//! The executable form of a translated function.
//!
//! [`ProgramEmitter`] is the runtime's [`Emitter`]: it keeps every emitted
//! instruction together with its lowering, indexed by offset, so the
//! interpreter can jump anywhere in constant time. Unreachable offsets stay
//! empty; reaching one is an internal error.

use quill_bytecode::CodeObject;
use quill_compiler::{
    CallSignature, EmitError, EmitSite, Emitter, ExceptionRegion, FunctionId, GeneratorDescriptor, Lowering, Op,
    Translated, UnitHeader,
};
use std::sync::Arc;
use tracing::trace;

/// One executable instruction.
#[derive(Debug, Clone)]
pub struct Step {
    pub op: Op,
    pub lowering: Lowering,
    pub line: Option<u32>,
}

/// A translated function ready to run.
#[derive(Debug)]
pub struct Program {
    pub id: FunctionId,
    pub code: Arc<CodeObject>,
    pub signature: CallSignature,
    /// Indexed by offset; `None` for unreachable instructions.
    pub steps: Box<[Option<Step>]>,
    pub regions: Box<[ExceptionRegion]>,
    pub generator: Option<GeneratorDescriptor>,
}

impl Program {
    #[inline]
    pub fn step(&self, offset: u32) -> Option<&Step> {
        self.steps.get(offset as usize).and_then(Option::as_ref)
    }

    pub fn name(&self) -> &Arc<str> {
        &self.code.qualname
    }

    pub fn is_generator(&self) -> bool {
        self.generator.is_some()
    }
}

impl Translated for Program {
    fn source(&self) -> &Arc<CodeObject> {
        &self.code
    }
}

// =============================================================================
// Emitter
// =============================================================================

struct Pending {
    id: FunctionId,
    code: Arc<CodeObject>,
    signature: CallSignature,
    steps: Vec<Option<Step>>,
    regions: Box<[ExceptionRegion]>,
    generator: Option<GeneratorDescriptor>,
}

/// Builds a [`Program`] from the emitter stream.
#[derive(Default)]
pub struct ProgramEmitter {
    pending: Option<Pending>,
}

impl ProgramEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Emitter for ProgramEmitter {
    type Output = Program;

    fn begin(&mut self, header: &UnitHeader<'_>) -> Result<(), EmitError> {
        if header.regions.iter().any(|r| r.handler as usize >= header.instruction_count) {
            return Err(EmitError::rejected("exception handler outside the function body"));
        }
        self.pending = Some(Pending {
            id: header.id,
            code: Arc::clone(header.code),
            signature: header.signature.clone(),
            steps: vec![None; header.instruction_count],
            regions: header.regions.into(),
            generator: header.generator.cloned(),
        });
        Ok(())
    }

    fn emit(&mut self, site: EmitSite<'_>) -> Result<(), EmitError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| EmitError::rejected("instruction emitted outside a unit"))?;
        let offset = site.instr.offset;
        let slot = pending
            .steps
            .get_mut(offset as usize)
            .ok_or_else(|| EmitError::rejected(format!("offset {} past the end of the unit", offset)))?;
        if slot.is_some() {
            return Err(EmitError::rejected(format!("offset {} emitted twice", offset)));
        }
        trace!(offset, op = site.instr.op.name(), lowering = ?site.lowering, "step");
        *slot = Some(Step {
            op: site.instr.op.clone(),
            lowering: site.lowering,
            line: site.instr.line,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<Program, EmitError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| EmitError::rejected("finish without begin"))?;
        Ok(Program {
            id: pending.id,
            code: pending.code,
            signature: pending.signature,
            steps: pending.steps.into_boxed_slice(),
            regions: pending.regions,
            generator: pending.generator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_bytecode::{CodeBuilder, Constant, Opcode};
    use quill_compiler::{CallSignature, TranslateError, Translator};
    use quill_types::TypeModel;

    #[test]
    fn test_program_keeps_lowering_per_offset() {
        let mut b = CodeBuilder::new("f");
        b.load_const(Constant::Int(1));
        b.emit_op(Opcode::ReturnValue);
        let code = Arc::new(b.finish().unwrap());

        let t = Translator::new(Arc::new(TypeModel::with_builtins()));
        let program = t
            .translate(&code, &CallSignature::dynamic(), &mut ProgramEmitter::new())
            .unwrap();
        assert_eq!(program.steps.len(), 2);
        assert_eq!(program.step(0).unwrap().op, Op::LoadConst(0));
        assert_eq!(program.step(1).unwrap().lowering, Lowering::Return { checked: false });
        assert!(program.step(2).is_none());
        assert!(!program.is_generator());
    }

    #[test]
    fn test_finish_without_begin_is_rejected() {
        let mut emitter = ProgramEmitter::new();
        assert!(matches!(emitter.finish(), Err(EmitError::Rejected(_))));
    }

    #[test]
    fn test_unreachable_offsets_stay_empty() {
        let mut b = CodeBuilder::new("g");
        b.load_const(Constant::None);
        b.emit_op(Opcode::ReturnValue);
        b.load_const(Constant::Int(2));
        b.emit_op(Opcode::ReturnValue);
        let code = Arc::new(b.finish().unwrap());

        let t = Translator::new(Arc::new(TypeModel::with_builtins()));
        let program: Result<Program, TranslateError> =
            t.translate(&code, &CallSignature::dynamic(), &mut ProgramEmitter::new());
        let program = program.unwrap();
        assert!(program.step(1).is_some());
        assert!(program.step(2).is_none());
        assert!(program.step(3).is_none());
    }
}
