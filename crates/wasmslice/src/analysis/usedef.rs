//! Def/use tables over annotated instructions and the derived use-def
//! chains.
//!
//! `instr_defs`/`instr_uses` are pure readings of the `Spec` annotations:
//! an instruction defines the variables that carry its own label in the
//! after-state and uses the top of its before-stack according to its arity
//! (plus the local/global it reads, plus a merge block's incoming
//! variables). `use_def_chains` maps every `(use site, variable)` pair to
//! the unique definition of that variable; SSA guarantees uniqueness and a
//! second definition of the same variable is reported as a broken
//! invariant.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::analysis::spec::{new_merge_variables, Spec};
use crate::ir::{BlockContent, Cfg, Control, Data, Instr, Label, Prim, Var};
use crate::AnalysisOptions;

// ─── Definitions ─────────────────────────────────────────────────────────────

/// Where a variable got its value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Definition {
    /// Defined by the instruction with this label.
    Instruction(Label, Var),
    /// Live at function entry (parameter local, zero local, global).
    Entry(Var),
    /// A literal constant.
    Constant(Prim),
}

/// Map from `(use site, used variable)` to the definition of the variable.
pub type UseDefChains = BTreeMap<(Label, Var), Definition>;

// ─── Per-instruction tables ──────────────────────────────────────────────────

/// Variables defined by the instruction at `label`: those named by its own
/// label in the after-state, or a merge block's fresh merge variables.
pub fn instr_defs(
    cfg: &Cfg<Spec>,
    label: Label,
    options: &AnalysisOptions,
) -> Result<Vec<Var>> {
    let block_idx = cfg.block_of(label)?;
    let block = cfg.find_block(block_idx)?;
    if let BlockContent::Merge(_) = block.content {
        let pairs = new_merge_variables(cfg, block_idx)?;
        let mut defs: Vec<Var> = Vec::new();
        for (_, merge_var) in pairs {
            if !defs.contains(&merge_var) {
                defs.push(merge_var);
            }
        }
        return Ok(defs);
    }

    let own = |v: Var| matches!(v, Var::Instr(l) if l == label);
    match cfg.find_instr(label)? {
        Instr::Data(d) => {
            let mut defs = Vec::new();
            let (_, pushes) = d.op.arity();
            if pushes == 1 {
                if let Ok(top) = d.after.peek(0) {
                    if own(top) {
                        defs.push(top);
                    }
                }
            }
            match d.op {
                Data::LocalSet(i) | Data::LocalTee(i) if !options.propagate_locals => {
                    if let Some(&slot) = d.after.locals.get(i as usize) {
                        if own(slot) && !defs.contains(&slot) {
                            defs.push(slot);
                        }
                    }
                }
                Data::GlobalSet(i) if !options.propagate_globals => {
                    if let Some(&slot) = d.after.globals.get(i as usize) {
                        if own(slot) && !defs.contains(&slot) {
                            defs.push(slot);
                        }
                    }
                }
                _ => {}
            }
            Ok(defs)
        }
        Instr::Control(c) => match &c.op {
            Control::Call { arity, .. } | Control::CallIndirect { arity, .. } => {
                let mut defs = Vec::new();
                if arity.1 == 1 {
                    if let Ok(top) = c.after.peek(0) {
                        if own(top) {
                            defs.push(top);
                        }
                    }
                }
                // Clobbered globals are renamed to the call's variable.
                for &slot in &c.after.globals {
                    if own(slot) && !defs.contains(&slot) {
                        defs.push(slot);
                    }
                }
                Ok(defs)
            }
            _ => Ok(Vec::new()),
        },
    }
}

/// Variables read by the instruction at `label`: the top of the
/// before-stack per its arity, the accessed local/global for get
/// operations, a merge block's incoming variables, and the returned values
/// at the exit merge.
pub fn instr_uses(cfg: &Cfg<Spec>, label: Label) -> Result<Vec<Var>> {
    let block_idx = cfg.block_of(label)?;
    let block = cfg.find_block(block_idx)?;
    if let BlockContent::Merge(_) = block.content {
        let mut uses: Vec<Var> = Vec::new();
        for (incoming, _) in new_merge_variables(cfg, block_idx)? {
            if !uses.contains(&incoming) {
                uses.push(incoming);
            }
        }
        if block_idx == cfg.exit_block {
            for n in 0..cfg.return_types.len() {
                if let Ok(v) = block.before.peek(n) {
                    if !uses.contains(&v) {
                        uses.push(v);
                    }
                }
            }
        }
        return Ok(uses);
    }

    match cfg.find_instr(label)? {
        Instr::Data(d) => {
            // Dead code keeps the empty annotation; it has no uses.
            let (pops, _) = d.op.arity();
            let mut uses = Vec::new();
            for n in 0..pops.min(d.before.stack_height()) {
                uses.push(d.before.peek(n)?);
            }
            match d.op {
                Data::LocalGet(i) => {
                    if let Some(&v) = d.before.locals.get(i as usize) {
                        uses.push(v);
                    }
                }
                Data::GlobalGet(i) => {
                    if let Some(&v) = d.before.globals.get(i as usize) {
                        uses.push(v);
                    }
                }
                _ => {}
            }
            Ok(uses)
        }
        Instr::Control(c) => {
            let mut uses = Vec::new();
            let pops = match &c.op {
                Control::If { .. } | Control::BrIf(_) | Control::BrTable { .. } => 1,
                Control::Call { arity, .. } => arity.0,
                Control::CallIndirect { arity, .. } => arity.0 + 1,
                Control::Return => cfg.return_types.len(),
                _ => 0,
            };
            for n in 0..pops.min(c.before.stack_height()) {
                uses.push(c.before.peek(n)?);
            }
            Ok(uses)
        }
    }
}

// ─── Chains ──────────────────────────────────────────────────────────────────

/// Resolve a variable to its definition against the definition map built
/// from `instr_defs`.
fn definition_of(defs: &BTreeMap<Var, Definition>, var: Var) -> Result<Definition> {
    if let Some(d) = defs.get(&var) {
        return Ok(d.clone());
    }
    match var {
        Var::Const(p) => Ok(Definition::Constant(p)),
        Var::Local(_) | Var::Global(_) => Ok(Definition::Entry(var)),
        Var::Instr(_) | Var::Merge(_, _) => {
            bail!("use of {} without a definition", var)
        }
    }
}

/// Build the use-def chains of an annotated CFG: every `(use site, var)`
/// pair mapped to the unique definition of the variable.
pub fn use_def_chains(cfg: &Cfg<Spec>, options: &AnalysisOptions) -> Result<UseDefChains> {
    // Definition map, with the SSA single-definition check.
    let mut defs: BTreeMap<Var, Definition> = BTreeMap::new();
    for &label in cfg.instructions.keys() {
        for var in instr_defs(cfg, label, options)? {
            let definition = Definition::Instruction(label, var);
            if let Some(previous) = defs.insert(var, definition) {
                if previous != Definition::Instruction(label, var) {
                    bail!("variable {} defined more than once", var);
                }
            }
        }
    }

    let mut chains: UseDefChains = BTreeMap::new();
    for &label in cfg.instructions.keys() {
        for var in instr_uses(cfg, label)? {
            chains.insert((label, var), definition_of(&defs, var)?);
        }
    }
    Ok(chains)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::summary::Summaries;
    use crate::analysis::transfer::annotate;
    use crate::ir::builder::{build_cfg, FunctionContext};
    use crate::ir::translate::{translate_body, TranslationContext};
    use crate::ir::types::{LabelFactory, Section, ValType};
    use wasmparser::Operator;

    fn annotated(
        ops: Vec<Operator>,
        args: Vec<ValType>,
        returns: Vec<ValType>,
        options: &AnalysisOptions,
    ) -> Cfg<Spec> {
        let mut factory = LabelFactory::new();
        let body =
            translate_body(&ops, &mut factory, &TranslationContext::default()).unwrap();
        let cfg = build_cfg(
            FunctionContext {
                func_idx: 0,
                exported: false,
                name: "f".to_string(),
                global_types: vec![],
                arg_types: args,
                local_types: vec![],
                return_types: returns,
            },
            &body,
            &mut factory,
        )
        .unwrap();
        annotate(&cfg, options, &Summaries::new()).unwrap()
    }

    fn function_label(id: u32) -> Label {
        Label {
            section: Section::Function,
            id,
        }
    }

    #[test]
    fn add_of_two_locals_uses_entry_definitions() {
        // local.get 0; local.get 1; i32.add; with an i32 result.
        let cfg = annotated(
            vec![
                Operator::LocalGet { local_index: 0 },
                Operator::LocalGet { local_index: 1 },
                Operator::I32Add,
                Operator::End,
            ],
            vec![ValType::I32, ValType::I32],
            vec![ValType::I32],
            &AnalysisOptions::default(),
        );
        let chains = use_def_chains(&cfg, &AnalysisOptions::default()).unwrap();
        let add = function_label(2);
        assert_eq!(
            chains.get(&(add, Var::Local(0))),
            Some(&Definition::Entry(Var::Local(0)))
        );
        assert_eq!(
            chains.get(&(add, Var::Local(1))),
            Some(&Definition::Entry(Var::Local(1)))
        );
        // The exit merge uses the add's value.
        let exit_label = cfg
            .find_block(cfg.exit_block)
            .unwrap()
            .labels()[0];
        assert_eq!(
            chains.get(&(exit_label, Var::Instr(add))),
            Some(&Definition::Instruction(add, Var::Instr(add)))
        );
    }

    #[test]
    fn defs_follow_propagation_options() {
        let ops = || {
            vec![
                Operator::I32Const { value: 7 },
                Operator::LocalSet { local_index: 0 },
                Operator::End,
            ]
        };
        // With propagation, local.set defines nothing: the constant is
        // propagated into the slot.
        let with = AnalysisOptions::default();
        let cfg = annotated(ops(), vec![ValType::I32], vec![], &with);
        assert!(instr_defs(&cfg, function_label(1), &with).unwrap().is_empty());

        // Without propagation, local.set names the slot after itself.
        let without = AnalysisOptions {
            propagate_locals: false,
            ..AnalysisOptions::default()
        };
        let cfg = annotated(ops(), vec![ValType::I32], vec![], &without);
        assert_eq!(
            instr_defs(&cfg, function_label(1), &without).unwrap(),
            vec![Var::Instr(function_label(1))]
        );
    }

    #[test]
    fn store_has_no_defs_and_two_uses() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Store {
                    memarg: wasmparser::MemArg {
                        align: 2,
                        max_align: 2,
                        offset: 0,
                        memory: 0,
                    },
                },
                Operator::End,
            ],
            vec![],
            vec![],
            &AnalysisOptions::default(),
        );
        let store = function_label(2);
        assert!(instr_defs(&cfg, store, &AnalysisOptions::default())
            .unwrap()
            .is_empty());
        let uses = instr_uses(&cfg, store).unwrap();
        assert_eq!(
            uses,
            vec![
                Var::Instr(function_label(1)),
                Var::Instr(function_label(0))
            ]
        );
    }

    #[test]
    fn merge_block_defines_merge_vars_and_uses_incoming() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::If {
                    blockty: wasmparser::BlockType::Type(wasmparser::ValType::I32),
                },
                Operator::MemorySize { mem: 0 },
                Operator::Else,
                Operator::MemorySize { mem: 0 },
                Operator::End,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
            &AnalysisOptions::default(),
        );
        let join = cfg
            .basic_blocks
            .values()
            .find(|b| b.is_merge() && b.idx != cfg.exit_block && cfg.in_degree(b.idx) == 2)
            .unwrap();
        let label = join.labels()[0];
        let defs = instr_defs(&cfg, label, &AnalysisOptions::default()).unwrap();
        assert_eq!(defs.len(), 1);
        assert!(matches!(defs[0], Var::Merge(b, _) if b == join.idx));
        let uses = instr_uses(&cfg, label).unwrap();
        assert_eq!(
            uses,
            vec![
                Var::Instr(function_label(2)),
                Var::Instr(function_label(3))
            ]
        );
    }

    #[test]
    fn chains_are_unique_per_variable() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
            &AnalysisOptions::default(),
        );
        let chains = use_def_chains(&cfg, &AnalysisOptions::default()).unwrap();
        // Every resolved definition of an Instr var points at its label.
        for ((_, var), def) in &chains {
            if let Var::Instr(l) = var {
                assert_eq!(def, &Definition::Instruction(*l, *var));
            }
        }
    }
}
