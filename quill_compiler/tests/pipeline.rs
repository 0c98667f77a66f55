//! End-to-end tests of the translation pipeline on assembled functions.

use quill_bytecode::{CodeBuilder, CodeObject, CompareOp, Constant, InstructionStream, Opcode, PythonVersion};
use quill_compiler::metadata::exception_sextuple;
use quill_compiler::{
    CallSignature, ListingEmitter, Op, RecordingEmitter, RegionKind, SlotType, Translator, TranslatorConfig,
};
use quill_types::{TypeId, TypeModel};
use std::sync::Arc;
use std::thread;

// =============================================================================
// Fixtures
// =============================================================================

fn translator() -> Translator {
    Translator::with_config(Arc::new(TypeModel::with_builtins()), TranslatorConfig::default())
}

/// `return "yes" if 1 < 2 else "no"` in the given dialect.
fn compare(version: PythonVersion) -> Arc<CodeObject> {
    let mut b = CodeBuilder::new("compare");
    b.set_version(version);
    let otherwise = b.create_label();
    b.load_const(Constant::Int(1));
    b.load_const(Constant::Int(2));
    b.compare(CompareOp::Lt);
    b.emit_jump(Opcode::PopJumpIfFalse, otherwise);
    b.load_const(Constant::str("yes"));
    b.emit_op(Opcode::ReturnValue);
    b.bind_label(otherwise);
    b.load_const(Constant::str("no"));
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().unwrap())
}

/// ```python
/// for x in xs:
///     try:
///         print(x + 2)
///     except:
///         pass
/// ```
fn try_in_loop() -> Arc<CodeObject> {
    let mut b = CodeBuilder::new("try_in_loop");
    let top = b.create_label();
    let end = b.create_label();
    let handler = b.create_label();
    b.load_global("xs");
    b.emit_op(Opcode::GetIter);
    b.bind_label(top);
    b.emit_jump(Opcode::ForIter, end);
    b.store_fast("x");
    b.emit_jump(Opcode::SetupFinally, handler);
    b.load_global("print");
    b.load_fast("x");
    b.load_const(Constant::Int(2));
    b.emit_op(Opcode::BinaryAdd);
    b.emit(Opcode::CallFunction, 1);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopBlock);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind_label(handler);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopExcept);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind_label(end);
    b.load_const(Constant::None);
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().unwrap())
}

/// ```python
/// def g(cm, xs):
///     with cm:
///         for x in xs:
///             yield x
/// ```
fn generator_with_loop() -> Arc<CodeObject> {
    let mut b = CodeBuilder::new("g");
    b.set_params(&["cm", "xs"]);
    let handler = b.create_label();
    let top = b.create_label();
    let end = b.create_label();
    let suppress = b.create_label();

    b.emit(Opcode::GenStart, 0);
    b.load_fast("cm");
    b.emit_jump(Opcode::SetupWith, handler);
    b.emit_op(Opcode::PopTop);
    b.load_fast("xs");
    b.emit_op(Opcode::GetIter);
    b.bind_label(top);
    b.emit_jump(Opcode::ForIter, end);
    b.store_fast("x");
    b.load_fast("x");
    b.emit_op(Opcode::YieldValue);
    b.emit_op(Opcode::PopTop);
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind_label(end);
    b.emit_op(Opcode::PopBlock);
    b.load_const(Constant::None);
    b.emit_op(Opcode::DupTop);
    b.emit_op(Opcode::DupTop);
    b.emit(Opcode::CallFunction, 3);
    b.emit_op(Opcode::PopTop);
    b.load_const(Constant::None);
    b.emit_op(Opcode::ReturnValue);

    b.bind_label(handler);
    b.emit_op(Opcode::WithExceptStart);
    b.emit_jump(Opcode::PopJumpIfTrue, suppress);
    b.emit(Opcode::Reraise, 1);
    b.bind_label(suppress);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopTop);
    b.emit_op(Opcode::PopExcept);
    b.emit_op(Opcode::PopTop);
    b.load_const(Constant::None);
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().unwrap())
}

// =============================================================================
// Typing
// =============================================================================

#[test]
fn test_compare_example_in_both_dialects() {
    let t = translator();
    let int = SlotType::Instance(TypeId::INT);
    let str_ = SlotType::Instance(TypeId::STR);
    let expected: Vec<Vec<SlotType>> = vec![
        vec![],
        vec![int.clone()],
        vec![int.clone(), int],
        vec![SlotType::Instance(TypeId::BOOL)],
        vec![],
        vec![str_.clone()],
        vec![],
        vec![str_],
    ];
    for version in [PythonVersion::V3_9, PythonVersion::V3_10] {
        let translation = t.analyze(&compare(version), &CallSignature::dynamic()).unwrap();
        let stacks: Vec<Vec<SlotType>> = translation
            .analysis
            .states
            .iter()
            .map(|s| s.stack.to_vec())
            .collect();
        assert_eq!(stacks, expected, "{}", version);
        assert_eq!(translation.reachable_count(), 8);
    }
}

#[test]
fn test_specialization_can_be_disabled() {
    let t = Translator::with_config(
        Arc::new(TypeModel::with_builtins()),
        TranslatorConfig::default().with_specialize(false),
    );
    let translation = t
        .analyze(&compare(PythonVersion::V3_10), &CallSignature::dynamic())
        .unwrap();
    // constants are still typed, the comparison result is not
    assert_eq!(translation.analysis.states[2].stack[0], SlotType::Instance(TypeId::INT));
    assert_eq!(translation.analysis.states[3].stack[0], SlotType::OBJECT);
}

#[test]
fn test_analysis_is_deterministic() {
    let code = generator_with_loop();
    let a = translator().analyze(&code, &CallSignature::dynamic()).unwrap();
    let b = translator().analyze(&code, &CallSignature::dynamic()).unwrap();
    assert_eq!(a.instrs, b.instrs);
    assert_eq!(a.analysis.states, b.analysis.states);
    assert_eq!(a.regions, b.regions);
    assert_eq!(a.generator, b.generator);

    let t = translator();
    let first = t.translate(&code, &CallSignature::dynamic(), &mut RecordingEmitter::new()).unwrap();
    let second = translator()
        .translate(&code, &CallSignature::dynamic(), &mut RecordingEmitter::new())
        .unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_handler_entry_carries_sextuple_over_prefix() {
    let t = translator();
    let translation = t.analyze(&try_in_loop(), &CallSignature::dynamic()).unwrap();

    assert_eq!(translation.regions.len(), 1);
    let region = &translation.regions[0];
    assert_eq!(region.kind, RegionKind::Except);
    assert_eq!(region.level, 1);

    // the raise sites inside the region sit at depths 0 to 3 above the prefix
    let depths: Vec<usize> = (region.start..region.end)
        .map(|o| translation.state(o).unwrap().depth())
        .collect();
    assert_eq!(depths.iter().max(), Some(&4));

    let entry = translation.state(region.handler).unwrap();
    assert_eq!(entry.depth(), 7);
    assert_eq!(&entry.stack[1..], &exception_sextuple()[..]);
}

#[test]
fn test_exception_edges_only_from_raising_instructions() {
    let t = translator();
    let translation = t.analyze(&try_in_loop(), &CallSignature::dynamic()).unwrap();
    let handler = translation.regions[0].handler;
    for &(from, to) in &translation.analysis.exception_edges {
        assert_eq!(to, handler);
        assert!(translation.instrs[from as usize].op.may_raise(), "{}", translation.instrs[from as usize]);
    }
    assert!(!translation.analysis.exception_edges.is_empty());
}

// =============================================================================
// Rewrites
// =============================================================================

#[test]
fn test_rewrites_relabel_every_branch() {
    let code = generator_with_loop();
    let t = translator();
    let translation = t.analyze(&code, &CallSignature::dynamic()).unwrap();
    let len = translation.instrs.len() as u32;

    for instr in &translation.instrs {
        for target in instr.op.targets() {
            assert!(target < len, "{} targets past the end", instr);
        }
    }

    let raw = InstructionStream::decode(&code).unwrap();
    for inst in raw.iter() {
        let relabelled = matches!(
            inst.opcode,
            Opcode::JumpAbsolute | Opcode::ForIter | Opcode::PopJumpIfTrue
        );
        if !relabelled {
            continue;
        }
        let at = translation.offsets.get(inst.offset).unwrap();
        let target = inst.target.and_then(|t| translation.offsets.get(t));
        assert_eq!(translation.instrs[at as usize].op.branch_target(), target, "{:?}", inst);
    }
}

#[test]
fn test_generator_with_statement_layout() {
    let t = translator();
    let translation = t.analyze(&generator_with_loop(), &CallSignature::dynamic()).unwrap();

    assert!(translation.instrs.iter().all(|i| !matches!(i.op, Op::GenStart(_) | Op::SetupWith { .. })));
    assert!(matches!(translation.instrs[0].op, Op::ResumeDispatch { .. }));

    let desc = translation.generator.as_ref().unwrap();
    assert_eq!(desc.state_count(), 2);
    let state = desc.state(1).unwrap();
    // `xs` and `cm` are dead once the loop runs; `x` is stored before reuse
    assert!(state.live_locals.is_empty());
    // the exit hook and the loop iterator cross the yield
    assert_eq!(state.saved_stack.len(), 2);
    assert_eq!(state.saved_stack[0].runtime_type(), TypeId::METHOD);

    // the resume point raises into the with handler
    let region = translation
        .regions
        .iter()
        .find(|r| r.contains(state.resume))
        .unwrap();
    assert_eq!(region.kind, RegionKind::With);
}

// =============================================================================
// Emission
// =============================================================================

#[test]
fn test_listing_emitter_output() {
    let t = translator();
    let code = try_in_loop();
    let mut emitter = ListingEmitter::new(Vec::new());
    let lines = t.translate(&code, &CallSignature::dynamic(), &mut emitter).unwrap();
    let translation = t.translation(&code, &CallSignature::dynamic()).unwrap();
    assert_eq!(lines, 1 + translation.regions.len() + translation.reachable_count());

    let text = String::from_utf8(emitter.into_inner()).unwrap();
    assert!(text.starts_with("unit try_in_loop"));
    assert!(text.contains("JUMP_IF_NOT_EXC_MATCH") || text.contains("POP_EXCEPT"));
    assert!(text.contains("RETURN_VALUE"));
}

#[test]
fn test_concurrent_translation_shares_one_artifact() {
    let t = Arc::new(translator());
    let code = generator_with_loop();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let t = Arc::clone(&t);
            let code = Arc::clone(&code);
            thread::spawn(move || t.translation(&code, &CallSignature::dynamic()).unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(t.cache().len(), 1);
}
