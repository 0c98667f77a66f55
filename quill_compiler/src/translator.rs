//! One function's translation pipeline.
//!
//! # Pipeline
//!
//! ```text
//! decode -> graph -> dataflow (validation)
//!        -> desugar with -> generator transform
//!        -> graph -> dataflow (final) -> exception edges
//!        -> exception regions -> liveness (generators) -> emit
//! ```
//!
//! Everything up to emission is pure and backend independent; the result is
//! a [`Translation`], cached per function identity and signature. Emission
//! replays a translation into any [`Emitter`].

use crate::cache::{FunctionId, TranslationCache, Translated};
use crate::config::TranslatorConfig;
use crate::dataflow::{Analysis, analyze};
use crate::desugar::{desugar_with, has_with};
use crate::emit::{Emitter, UnitHeader};
use crate::error::{DecodeResult, EmissionFailure, EmitError, TranslateError};
use crate::exception::{ExceptionRegion, build_regions};
use crate::flow::FlowGraph;
use crate::generator::{self, GeneratorDescriptor};
use crate::metadata::StackMetadata;
use crate::op::Instr;
use crate::op::effect::Typer;
use crate::rewrite::decode_body;
use crate::signature::CallSignature;
use quill_bytecode::{CodeObject, OffsetMap, disassemble};
use quill_types::{TypeId, TypeModel};
use std::sync::Arc;
use tracing::{debug, instrument};

// =============================================================================
// Translation
// =============================================================================

/// The analysed form of one function, ready for emission.
#[derive(Debug)]
pub struct Translation {
    pub id: FunctionId,
    pub code: Arc<CodeObject>,
    pub signature: CallSignature,
    /// Final instruction list, after every rewrite.
    pub instrs: Vec<Instr>,
    /// Raw code-unit offsets to final offsets.
    pub offsets: OffsetMap,
    /// Final graph, including exception edges.
    pub graph: FlowGraph,
    /// Final fixed point over `instrs`.
    pub analysis: Analysis,
    pub regions: Vec<ExceptionRegion>,
    pub generator: Option<GeneratorDescriptor>,
}

impl Translation {
    /// Final before-state of the instruction at `offset`.
    pub fn state(&self, offset: u32) -> Option<&StackMetadata> {
        self.analysis.states.get(offset as usize)
    }

    /// Number of reachable instructions.
    pub fn reachable_count(&self) -> usize {
        self.analysis.states.iter().filter(|s| !s.dead).count()
    }

    /// Typed listing of the final instructions, for diagnostics.
    pub fn listing(&self, model: &TypeModel) -> String {
        let mut out = String::new();
        for (instr, state) in self.instrs.iter().zip(&self.analysis.states) {
            let stack = if state.dead {
                "<unreachable>".to_string()
            } else {
                state.describe_stack(model)
            };
            out.push_str(&format!("{:<48} ; {}\n", instr.to_string(), stack));
        }
        out
    }
}

impl Translated for Translation {
    fn source(&self) -> &Arc<CodeObject> {
        &self.code
    }
}

// =============================================================================
// Translator
// =============================================================================

/// Translates code objects against a shared type model.
///
/// Safe to share between threads; independent functions may be translated
/// concurrently.
#[derive(Debug)]
pub struct Translator {
    model: Arc<TypeModel>,
    config: TranslatorConfig,
    cache: TranslationCache<Translation>,
}

impl Translator {
    /// A translator configured from the environment.
    pub fn new(model: Arc<TypeModel>) -> Self {
        Self::with_config(model, TranslatorConfig::from_env())
    }

    pub fn with_config(model: Arc<TypeModel>, config: TranslatorConfig) -> Self {
        Self {
            model,
            config,
            cache: TranslationCache::new(),
        }
    }

    #[inline]
    pub fn model(&self) -> &Arc<TypeModel> {
        &self.model
    }

    #[inline]
    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Translations cached so far.
    pub fn cache(&self) -> &TranslationCache<Translation> {
        &self.cache
    }

    /// The analysed form of `code` under `signature`, from the cache when
    /// available.
    pub fn translation(&self, code: &Arc<CodeObject>, signature: &CallSignature) -> Result<Arc<Translation>, TranslateError> {
        let key = FunctionId::of(code).for_signature(signature);
        self.cache
            .get_or_try_insert_with(key, code, || self.analyze(code, signature))
    }

    /// Translate `code` and emit it.
    pub fn translate<E: Emitter + ?Sized>(
        &self,
        code: &Arc<CodeObject>,
        signature: &CallSignature,
        emitter: &mut E,
    ) -> Result<E::Output, TranslateError> {
        let translation = self.translation(code, signature)?;
        self.emit(&translation, emitter)
    }

    /// Run the analysis pipeline, bypassing the cache.
    #[instrument(skip_all, fields(function = %code.qualname))]
    pub fn analyze(&self, code: &Arc<CodeObject>, signature: &CallSignature) -> Result<Translation, TranslateError> {
        self.run_pipeline(code, signature)
            .map_err(|source| TranslateError::Decode {
                function: code.qualname.clone(),
                source,
            })
    }

    fn run_pipeline(&self, code: &Arc<CodeObject>, signature: &CallSignature) -> DecodeResult<Translation> {
        let typer = Typer::new(&self.model, code, &self.config);
        let entry = StackMetadata::entry(signature.entry_locals(code), code.closure_size());

        let (mut instrs, mut offsets) = decode_body(code)?;
        let graph = FlowGraph::build(&instrs)?;
        let mut analysis = analyze(&instrs, &graph, entry.clone(), &typer)?;
        let mut graph = Some(graph);

        if self.config.desugar_with && has_with(&instrs) {
            let (rewritten, map) = desugar_with(&instrs)?;
            offsets = offsets.then(&map);
            instrs = rewritten;
            graph = None;
        }
        let is_generator = code.is_generator();
        if is_generator {
            let (rewritten, map) = generator::transform(&instrs)?;
            offsets = offsets.then(&map);
            instrs = rewritten;
            graph = None;
        }

        let mut graph = match graph {
            Some(graph) => graph,
            None => {
                let graph = FlowGraph::build(&instrs)?;
                analysis = analyze(&instrs, &graph, entry, &typer)?;
                graph
            }
        };
        graph.add_exception_edges(&analysis.exception_edges);

        let regions = build_regions(&instrs, &analysis);
        let generator =
            is_generator.then(|| generator::describe(&instrs, &graph, &analysis, code.local_count()));

        debug!(
            instructions = instrs.len(),
            blocks = graph.len(),
            steps = analysis.steps,
            regions = regions.len(),
            "function analysed"
        );

        Ok(Translation {
            id: FunctionId::of(code),
            code: Arc::clone(code),
            signature: signature.clone(),
            instrs,
            offsets,
            graph,
            analysis,
            regions,
            generator,
        })
    }

    /// Replay a translation into an emitter.
    ///
    /// Unreachable instructions are skipped. Any emitter error aborts the
    /// unit and is reported with the function's disassembly.
    pub fn emit<E: Emitter + ?Sized>(&self, translation: &Translation, emitter: &mut E) -> Result<E::Output, TranslateError> {
        self.emit_unit(translation, emitter).map_err(|err| {
            TranslateError::Emission(EmissionFailure {
                function: translation.code.qualname.clone(),
                message: err.to_string(),
                listing: disassemble(&translation.code),
            })
        })
    }

    fn emit_unit<E: Emitter + ?Sized>(&self, translation: &Translation, emitter: &mut E) -> Result<E::Output, EmitError> {
        let typer = Typer::new(&self.model, &translation.code, &self.config);
        // a generator's return value travels in StopIteration, unconverted
        let ret = if translation.generator.is_some() {
            TypeId::OBJECT
        } else {
            translation.signature.ret
        };

        emitter.begin(&UnitHeader {
            id: translation.id,
            code: &translation.code,
            signature: &translation.signature,
            regions: &translation.regions,
            generator: translation.generator.as_ref(),
            instruction_count: translation.instrs.len(),
        })?;

        for (instr, before) in translation.instrs.iter().zip(&translation.analysis.states) {
            if before.dead {
                debug!(offset = instr.offset, op = instr.op.name(), "skipping unreachable instruction");
                continue;
            }
            instr.emit(before, &typer, ret, emitter)?;
        }
        emitter.finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
