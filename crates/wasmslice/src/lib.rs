//! wasmslice — intra-procedural static analysis and backward slicing for
//! WebAssembly.
//!
//! The pipeline converts each function of a pre-parsed module into a
//! control-flow graph in SSA form, runs a forward abstract-interpretation
//! fixpoint over it, derives use-def, control- and memory-dependence
//! relations, and computes backward slices that are again structurally
//! valid CFGs.

pub mod analysis;
pub mod ir;
pub mod parser;
pub mod slice;

use anyhow::{bail, Context, Result};

use analysis::spec::Spec;
use analysis::summary::Summaries;
use ir::builder::{build_cfg, FunctionContext};
use ir::translate::{translate_body, TranslationContext};
use ir::{Cfg, Label, LabelFactory};
use parser::{parse_function_operators, ImportKind, ParsedModule};

/// Configuration of the analyses. Passed explicitly through every entry
/// point; immutable for the duration of one analysis.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Locals flow through `local.get/set/tee` without minting fresh vars.
    pub propagate_locals: bool,
    /// Same for globals.
    pub propagate_globals: bool,
    /// Constants collapse to `Const` vars instead of fresh defining vars.
    pub use_const: bool,
    /// The slicer keeps every instruction of a block that contains at
    /// least one kept instruction.
    pub keep_entire_blocks: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            propagate_locals: true,
            propagate_globals: true,
            use_const: true,
            keep_entire_blocks: false,
        }
    }
}

/// Per-function and per-type call arities of a module.
fn translation_context(module: &ParsedModule) -> TranslationContext {
    let type_arities: Vec<(usize, usize)> = module
        .types
        .iter()
        .map(|t| (t.params.len(), t.results.len()))
        .collect();
    let mut func_arities = Vec::new();
    for import in &module.imports {
        if let ImportKind::Function(type_idx) = import.kind {
            func_arities.push(
                type_arities
                    .get(type_idx as usize)
                    .copied()
                    .unwrap_or((0, 0)),
            );
        }
    }
    for function in &module.functions {
        func_arities.push(
            type_arities
                .get(function.type_idx as usize)
                .copied()
                .unwrap_or((0, 0)),
        );
    }
    TranslationContext {
        func_arities,
        type_arities,
    }
}

/// Build the CFG of every local function in the module.
pub fn build_cfgs(module: &ParsedModule) -> Result<Vec<Cfg<()>>> {
    let ctx = translation_context(module);
    let global_types = module.global_types();
    let mut cfgs = Vec::with_capacity(module.functions.len());

    for (i, function) in module.functions.iter().enumerate() {
        let func_idx = module.num_imported_functions + i as u32;
        let signature = module
            .types
            .get(function.type_idx as usize)
            .with_context(|| format!("function {} has no type", func_idx))?;
        if signature.results.len() > 1 {
            bail!(
                "unsupported: function {} returns {} values",
                func_idx,
                signature.results.len()
            );
        }

        let operators = parse_function_operators(&function.body)
            .with_context(|| format!("decoding body of function {}", func_idx))?;
        let mut factory = LabelFactory::new();
        let body = translate_body(&operators, &mut factory, &ctx)
            .with_context(|| format!("translating function {}", func_idx))?;

        let export = module.function_export(func_idx);
        let cfg = build_cfg(
            FunctionContext {
                func_idx,
                exported: export.is_some(),
                name: export
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| format!("func_{}", func_idx)),
                global_types: global_types.clone(),
                arg_types: signature.params.clone(),
                local_types: function.locals.clone(),
                return_types: signature.results.clone(),
            },
            &body,
            &mut factory,
        )
        .with_context(|| format!("building CFG of function {}", func_idx))?;
        cfgs.push(cfg);
    }
    Ok(cfgs)
}

/// Spec inference over one function.
pub fn annotate(
    cfg: &Cfg<()>,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<Cfg<Spec>> {
    analysis::transfer::annotate(cfg, options, summaries)
}

/// Backward slice of `cfg` at `criterion`, validated by re-annotation.
pub fn slice_function(
    cfg: &Cfg<Spec>,
    criterion: Label,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<Cfg<()>> {
    let sliced = slice::slice(cfg, criterion, options, summaries)?;
    slice::validate_slice(&sliced, options, summaries)
        .context("slicer post-condition failed on the sliced CFG")?;
    Ok(sliced)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
