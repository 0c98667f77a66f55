//! Translation Pipeline Benchmarks
//!
//! Measures the analysis half of the pipeline on synthetic functions whose
//! shape can be scaled.
//!
//! # Benchmark Categories
//!
//! 1. **Dataflow**: fixed point over a loop with a growing number of
//!    branches that widen a local between `int` and `float`
//! 2. **Exception Regions**: nested `try` bodies, region reconstruction
//! 3. **Generators**: state machine transform plus liveness
//! 4. **Cache**: cost of a translation cache hit

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quill_bytecode::{CodeBuilder, CodeObject, CompareOp, Constant, Opcode};
use quill_compiler::{CallSignature, Translator, TranslatorConfig};
use quill_types::TypeModel;
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

/// `for i in range(n)` with `branches` if/else blocks in the body.
fn branchy_loop(branches: usize) -> Arc<CodeObject> {
    let mut b = CodeBuilder::new(format!("loop_{}", branches));
    b.set_params(&["n"]);
    b.load_const(Constant::Int(0));
    b.store_fast("total");
    b.load_global("range");
    b.load_fast("n");
    b.emit(Opcode::CallFunction, 1);
    b.emit_op(Opcode::GetIter);

    let top = b.create_label();
    let end = b.create_label();
    b.bind_label(top);
    b.emit_jump(Opcode::ForIter, end);
    b.store_fast("i");
    for k in 0..branches {
        let otherwise = b.create_label();
        let next = b.create_label();
        b.load_fast("i");
        b.load_const(Constant::Int(k as i64));
        b.compare(CompareOp::Lt);
        b.emit_jump(Opcode::PopJumpIfFalse, otherwise);
        b.load_fast("total");
        b.load_fast("i");
        b.emit_op(Opcode::InplaceAdd);
        b.store_fast("total");
        b.emit_jump(Opcode::JumpForward, next);
        b.bind_label(otherwise);
        b.load_fast("total");
        b.load_const(Constant::Float(1.0));
        b.emit_op(Opcode::InplaceSubtract);
        b.store_fast("total");
        b.bind_label(next);
    }
    b.emit_jump(Opcode::JumpAbsolute, top);
    b.bind_label(end);
    b.load_fast("total");
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().expect("benchmark function assembles"))
}

/// `depth` nested `try: ... except: pass` statements around a call.
fn nested_try(depth: usize) -> Arc<CodeObject> {
    let mut b = CodeBuilder::new(format!("try_{}", depth));
    let mut handlers = Vec::new();
    for _ in 0..depth {
        let handler = b.create_label();
        b.emit_jump(Opcode::SetupFinally, handler);
        handlers.push(handler);
    }
    b.load_global("len");
    b.load_global("xs");
    b.emit(Opcode::CallFunction, 1);
    b.emit_op(Opcode::PopTop);

    // unwind inside out: each level pops its block, then skips its handler
    for handler in handlers.into_iter().rev() {
        let done = b.create_label();
        b.emit_op(Opcode::PopBlock);
        b.emit_jump(Opcode::JumpForward, done);
        b.bind_label(handler);
        b.emit_op(Opcode::PopTop);
        b.emit_op(Opcode::PopTop);
        b.emit_op(Opcode::PopTop);
        b.emit_op(Opcode::PopExcept);
        b.bind_label(done);
        b.emit_op(Opcode::Nop);
    }
    b.load_const(Constant::None);
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().expect("benchmark function assembles"))
}

/// A generator with `yields` sequential yields of a running total.
fn counting_generator(yields: usize) -> Arc<CodeObject> {
    let mut b = CodeBuilder::new(format!("gen_{}", yields));
    b.set_params(&["step"]);
    b.emit(Opcode::GenStart, 0);
    b.load_const(Constant::Int(0));
    b.store_fast("acc");
    for _ in 0..yields {
        b.load_fast("acc");
        b.load_fast("step");
        b.emit_op(Opcode::InplaceAdd);
        b.store_fast("acc");
        b.load_fast("acc");
        b.emit_op(Opcode::YieldValue);
        b.emit_op(Opcode::PopTop);
    }
    b.load_const(Constant::None);
    b.emit_op(Opcode::ReturnValue);
    Arc::new(b.finish().expect("benchmark function assembles"))
}

fn translator() -> Translator {
    Translator::with_config(Arc::new(TypeModel::with_builtins()), TranslatorConfig::default())
}

// =============================================================================
// Dataflow Benchmarks
// =============================================================================

fn bench_dataflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataflow");
    let t = translator();
    let sig = CallSignature::dynamic();

    for branches in [1usize, 8, 32, 128] {
        let code = branchy_loop(branches);
        group.throughput(Throughput::Elements(code.len_units() as u64));
        group.bench_with_input(BenchmarkId::new("branchy_loop", branches), &code, |b, code| {
            b.iter(|| black_box(t.analyze(code, &sig).expect("analysis succeeds")))
        });
    }

    group.finish();
}

// =============================================================================
// Exception Region Benchmarks
// =============================================================================

fn bench_regions(c: &mut Criterion) {
    let mut group = c.benchmark_group("exception_regions");
    let t = translator();
    let sig = CallSignature::dynamic();

    for depth in [1usize, 4, 16] {
        let code = nested_try(depth);
        group.bench_with_input(BenchmarkId::new("nested_try", depth), &code, |b, code| {
            b.iter(|| {
                let translation = t.analyze(code, &sig).expect("analysis succeeds");
                black_box(translation.regions.len())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Generator Benchmarks
// =============================================================================

fn bench_generators(c: &mut Criterion) {
    let mut group = c.benchmark_group("generators");
    let t = translator();
    let sig = CallSignature::dynamic();

    for yields in [1usize, 16, 64] {
        let code = counting_generator(yields);
        group.bench_with_input(BenchmarkId::new("state_machine", yields), &code, |b, code| {
            b.iter(|| {
                let translation = t.analyze(code, &sig).expect("analysis succeeds");
                black_box(translation.generator.map(|g| g.state_count()))
            })
        });
    }

    group.finish();
}

// =============================================================================
// Cache Benchmarks
// =============================================================================

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("translation_cache");
    let t = translator();
    let sig = CallSignature::dynamic();
    let code = branchy_loop(32);
    let _ = t.translation(&code, &sig);

    group.bench_function("hit", |b| {
        b.iter(|| black_box(t.translation(&code, &sig).expect("cached")))
    });

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    pipeline_benches,
    bench_dataflow,
    bench_regions,
    bench_generators,
    bench_cache,
);

criterion_main!(pipeline_benches);
