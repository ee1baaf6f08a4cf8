//! Backward program slicing.
//!
//! `instructions_to_keep` computes the transitive dependence closure of a
//! criterion instruction under use-def, control and memory dependences.
//! `slice` then rebuilds a fresh, unannotated CFG containing exactly the
//! kept instructions plus synthetic dummies, such that the static stack
//! height matches along every edge and every join is guarded by a merge
//! block. The result re-annotates cleanly; `validate_slice` is that
//! post-condition check.
//!
//! ## Phases
//!
//! 1. Dependence closure over `InSlice` items. An item may carry a *reason*
//!    variable: at a merge block it selects which incoming arm to trace, at
//!    a predicate block it names the branch condition.
//! 2. Block-level reconstruction: kept data blocks are rebuilt from their
//!    kept instructions with push/drop padding restoring the block's
//!    original boundary heights; removed blocks are cut out with their
//!    predecessors rewired (branch tags preserved); a removed entry block
//!    is replaced by a dummy with the same net stack effect.
//! 3. Inter-block stack repair on every surviving edge whose endpoint
//!    heights disagree: pad the target data block when all its
//!    predecessors agree, else insert an intermediate dummy block.
//! 4. Merge restoration: any non-merge block left with several
//!    predecessors gets a fresh merge block gathering them.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use log::debug;

use crate::analysis::control_deps::control_dependencies;
use crate::analysis::mem_deps::memory_dependencies;
use crate::analysis::spec::{new_merge_variables, Spec};
use crate::analysis::summary::Summaries;
use crate::analysis::transfer::{annotate, check_stack_heights};
use crate::analysis::usedef::{instr_uses, use_def_chains, Definition};
use crate::ir::{
    BasicBlock, BlockContent, BlockId, Cfg, Data, DataInstr, Label, Prim, Section, Var,
};
use crate::AnalysisOptions;

// ─── Phase 1: dependence closure ─────────────────────────────────────────────

/// Worklist item: an instruction to pull into the slice, with an optional
/// variable restricting which of its dependences matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct InSlice {
    label: Label,
    reason: Option<Var>,
}

/// The labels of all instructions the criterion transitively depends on
/// (the criterion included).
pub fn instructions_to_keep(
    cfg: &Cfg<Spec>,
    criterion: Label,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<BTreeSet<Label>> {
    cfg.find_instr(criterion)
        .with_context(|| format!("slice criterion {} does not exist", criterion))?;

    let chains = use_def_chains(cfg, options)?;
    let cdeps = control_dependencies(cfg)?;
    let mdeps = memory_dependencies(cfg, summaries)?;

    let mut kept: BTreeSet<Label> = BTreeSet::new();
    let mut processed: BTreeSet<InSlice> = BTreeSet::new();
    let mut worklist = vec![InSlice {
        label: criterion,
        reason: None,
    }];

    while let Some(item) = worklist.pop() {
        if !processed.insert(item) {
            continue;
        }
        kept.insert(item.label);
        let block_idx = cfg.block_of(item.label)?;

        // Uses of the item. A merge with a reason only contributes the
        // incoming arms of that one merge variable.
        let uses: Vec<Var> = match item.reason {
            Some(reason) if item.label.is_merge() => new_merge_variables(cfg, block_idx)?
                .into_iter()
                .filter(|(_, merge_var)| *merge_var == reason)
                .map(|(incoming, _)| incoming)
                .collect(),
            _ => instr_uses(cfg, item.label)?,
        };

        for used in uses {
            match chains.get(&(item.label, used)) {
                Some(Definition::Instruction(def_label, _)) => {
                    worklist.push(InSlice {
                        label: *def_label,
                        reason: def_label.is_merge().then_some(used),
                    });
                }
                // Entry and constant definitions have no defining site.
                Some(Definition::Entry(_)) | Some(Definition::Constant(_)) => {}
                None => bail!("use of {} at {} has no def chain", used, item.label),
            }
        }

        // Whether the item executes at all is decided by the predicates its
        // block is control-dependent on.
        if let Some(preds) = cdeps.get(&block_idx) {
            for &(pred_label, pred_var) in preds {
                worklist.push(InSlice {
                    label: pred_label,
                    reason: Some(pred_var),
                });
            }
        }

        // Stores feeding this instruction's loads.
        if let Some(stores) = mdeps.get(&item.label) {
            for &store in stores {
                worklist.push(InSlice {
                    label: store,
                    reason: None,
                });
            }
        }
    }
    Ok(kept)
}

// ─── Synthetic labels and padding ────────────────────────────────────────────

/// Mints dummy and merge labels that do not collide with the input CFG.
struct SyntheticLabels {
    next_dummy: u32,
    next_merge: u32,
}

impl SyntheticLabels {
    fn for_cfg<A: Clone>(cfg: &Cfg<A>) -> Self {
        let next_merge = cfg
            .instructions
            .keys()
            .filter(|l| l.section == Section::Merge)
            .map(|l| l.id + 1)
            .max()
            .unwrap_or(0);
        let next_dummy = cfg
            .instructions
            .keys()
            .filter(|l| l.section == Section::Dummy)
            .map(|l| l.id + 1)
            .max()
            .unwrap_or(0);
        SyntheticLabels {
            next_dummy,
            next_merge,
        }
    }

    fn dummy(&mut self) -> Label {
        let id = self.next_dummy;
        self.next_dummy += 1;
        Label {
            section: Section::Dummy,
            id,
        }
    }

    fn merge(&mut self) -> Label {
        let id = self.next_merge;
        self.next_merge += 1;
        Label {
            section: Section::Merge,
            id,
        }
    }
}

/// Dummy instructions changing the stack height from `from` to `to`:
/// `i32.const 0` to push, `drop` to pop.
fn padding(labels: &mut SyntheticLabels, from: usize, to: usize) -> Vec<DataInstr<()>> {
    let mut instrs = Vec::new();
    let mut height = from;
    while height < to {
        instrs.push(DataInstr {
            label: labels.dummy(),
            op: Data::Const(Prim::I32(0)),
            before: (),
            after: (),
        });
        height += 1;
    }
    while height > to {
        instrs.push(DataInstr {
            label: labels.dummy(),
            op: Data::Drop,
            before: (),
            after: (),
        });
        height -= 1;
    }
    instrs
}

// ─── Phases 2–4: slice construction ──────────────────────────────────────────

/// Remove one specific `(src, dst, tag)` edge occurrence.
fn remove_one_edge(cfg: &mut Cfg<()>, src: BlockId, dst: BlockId, tag: Option<bool>) {
    if let Some(out) = cfg.edges.get_mut(&src) {
        if let Some(pos) = out.iter().position(|e| *e == (dst, tag)) {
            out.remove(pos);
        }
    }
    if let Some(inc) = cfg.back_edges.get_mut(&dst) {
        if let Some(pos) = inc.iter().position(|e| *e == (src, tag)) {
            inc.remove(pos);
        }
    }
}

/// Is this block part of the slice skeleton?
///
/// Data blocks survive when they contain a kept instruction; merge blocks
/// always survive (they are the loop- and block-exit markers a later
/// re-structuring needs); control blocks survive when kept or when they
/// fork directly into a surviving merge.
fn block_in_slice(cfg: &Cfg<Spec>, idx: BlockId, kept: &BTreeSet<Label>) -> bool {
    if idx == cfg.exit_block {
        return true;
    }
    let block = match cfg.basic_blocks.get(&idx) {
        Some(b) => b,
        None => return false,
    };
    match &block.content {
        BlockContent::Data(instrs) => instrs.iter().any(|d| kept.contains(&d.label)),
        BlockContent::Merge(_) => true,
        BlockContent::Control(c) => {
            if kept.contains(&c.label) {
                return true;
            }
            let succs = cfg.successors(idx);
            succs.len() > 1
                && succs.iter().any(|&(s, _)| {
                    cfg.basic_blocks
                        .get(&s)
                        .map(|b| b.is_merge())
                        .unwrap_or(false)
                })
        }
    }
}

/// Backward slice: a fresh CFG with unit annotations whose non-dummy
/// instructions are exactly the dependence closure of `criterion`.
pub fn slice(
    cfg: &Cfg<Spec>,
    criterion: Label,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<Cfg<()>> {
    let mut kept = instructions_to_keep(cfg, criterion, options, summaries)?;
    if options.keep_entire_blocks {
        for block in cfg.basic_blocks.values() {
            if block.labels().iter().any(|l| kept.contains(l)) {
                kept.extend(block.labels());
            }
        }
    }
    debug!(
        "slice of {} in function {}: {} instructions kept",
        criterion,
        cfg.func_idx,
        kept.len()
    );

    let mut labels = SyntheticLabels::for_cfg(cfg);
    let mut out: Cfg<()> = cfg.clear_annotations();

    // Original boundary stack heights, extended as synthetic blocks appear.
    let mut heights: BTreeMap<BlockId, (usize, usize)> = BTreeMap::new();
    for (&idx, block) in &cfg.basic_blocks {
        heights.insert(
            idx,
            (
                block.before.stack_height(),
                if idx == cfg.exit_block {
                    block.before.stack_height()
                } else {
                    block.after.stack_height()
                },
            ),
        );
    }
    let mut next_block = out.next_block_id().0;
    let mut fresh_block = || {
        let id = BlockId(next_block);
        next_block += 1;
        id
    };

    // ─── Phase 2a: rebuild kept data blocks with local padding ──────────
    for (&idx, block) in &cfg.basic_blocks {
        let in_slice = block_in_slice(cfg, idx, &kept);
        if !in_slice {
            continue;
        }
        if let BlockContent::Data(instrs) = &block.content {
            let mut rebuilt: Vec<DataInstr<()>> = Vec::new();
            let mut height = block.before.stack_height();
            for d in instrs {
                if !kept.contains(&d.label) {
                    continue;
                }
                rebuilt.extend(padding(&mut labels, height, d.before.stack_height()));
                rebuilt.push(DataInstr {
                    label: d.label,
                    op: d.op.clone(),
                    before: (),
                    after: (),
                });
                height = d.after.stack_height();
            }
            rebuilt.extend(padding(&mut labels, height, block.after.stack_height()));
            if let Some(b) = out.basic_blocks.get_mut(&idx) {
                b.content = BlockContent::Data(rebuilt);
            }
        }
    }

    // ─── Phase 2b: drop blocks outside the slice, rewiring edges ────────
    let removable: Vec<BlockId> = cfg
        .basic_blocks
        .keys()
        .copied()
        .filter(|&idx| !block_in_slice(cfg, idx, &kept) && idx != cfg.entry_block)
        .collect();
    for idx in removable {
        let preds: Vec<(BlockId, Option<bool>)> = out.predecessors(idx).to_vec();
        let succs: Vec<(BlockId, Option<bool>)> = out.successors(idx).to_vec();
        out.remove_block(idx);
        for &(pred, pred_tag) in &preds {
            for &(succ, _) in &succs {
                if pred == idx || succ == idx {
                    continue;
                }
                out.add_edge(pred, succ, pred_tag);
            }
        }
    }

    // ─── Phase 2c: a removed entry becomes a dummy with the same net
    // effect ────────────────────────────────────────────────────────────
    if !block_in_slice(cfg, cfg.entry_block, &kept) {
        let (h_in, h_out) = heights[&cfg.entry_block];
        let rebuilt = padding(&mut labels, h_in, h_out);
        if let Some(b) = out.basic_blocks.get_mut(&cfg.entry_block) {
            b.content = BlockContent::Data(rebuilt);
        }
    }

    // ─── Phase 3: inter-block stack repair ──────────────────────────────
    let edge_snapshot: Vec<(BlockId, BlockId, Option<bool>)> = out
        .edges
        .iter()
        .flat_map(|(&src, outs)| outs.iter().map(move |&(dst, tag)| (src, dst, tag)))
        .collect();
    for (src, dst, tag) in edge_snapshot {
        let h_out = heights[&src].1;
        let h_in = heights[&dst].0;
        if dst == out.exit_block {
            // The exit tolerates surplus below the returned values, as in
            // the original function.
            if h_out >= h_in {
                continue;
            }
        } else if h_out == h_in {
            continue;
        }

        let is_data = matches!(
            out.basic_blocks.get(&dst).map(|b| &b.content),
            Some(BlockContent::Data(_))
        );
        let preds_agree = {
            let preds = out.predecessors(dst);
            preds
                .iter()
                .all(|&(p, _)| heights.get(&p).map(|h| h.1) == Some(h_out))
        };
        if is_data && preds_agree {
            let pad = padding(&mut labels, h_out, h_in);
            if let Some(b) = out.basic_blocks.get_mut(&dst) {
                if let BlockContent::Data(instrs) = &mut b.content {
                    let mut rebuilt = pad;
                    rebuilt.append(instrs);
                    *instrs = rebuilt;
                }
            }
            if let Some(h) = heights.get_mut(&dst) {
                h.0 = h_out;
            }
        } else {
            let dummy = fresh_block();
            let instrs = padding(&mut labels, h_out, h_in);
            out.basic_blocks.insert(
                dummy,
                BasicBlock {
                    idx: dummy,
                    content: BlockContent::Data(instrs),
                    before: (),
                    after: (),
                },
            );
            heights.insert(dummy, (h_out, h_in));
            remove_one_edge(&mut out, src, dst, tag);
            out.add_edge(src, dummy, tag);
            out.add_edge(dummy, dst, None);
        }
    }

    // ─── Phase 4: restore the merge discipline ──────────────────────────
    let offenders: Vec<BlockId> = out
        .basic_blocks
        .values()
        .filter(|b| out.in_degree(b.idx) > 1 && !b.is_merge())
        .map(|b| b.idx)
        .collect();
    for idx in offenders {
        let gate = fresh_block();
        let label = labels.merge();
        out.basic_blocks.insert(
            gate,
            BasicBlock {
                idx: gate,
                content: BlockContent::Merge(label),
                before: (),
                after: (),
            },
        );
        let h = heights[&idx].0;
        heights.insert(gate, (h, h));
        let preds: Vec<(BlockId, Option<bool>)> = out.predecessors(idx).to_vec();
        for &(pred, tag) in &preds {
            remove_one_edge(&mut out, pred, idx, tag);
            out.add_edge(pred, gate, tag);
        }
        out.add_edge(gate, idx, None);
    }

    out.rebuild_instruction_map();
    out.validate()
        .context("sliced CFG violates structural invariants")?;
    Ok(out)
}

/// Post-condition of `slice`: the result annotates without error and keeps
/// stack heights consistent along every edge. A failure here is a slicer
/// bug, not a property of the input program.
pub fn validate_slice(
    sliced: &Cfg<()>,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<Cfg<Spec>> {
    let annotated =
        annotate(sliced, options, summaries).context("sliced CFG does not re-annotate")?;
    check_stack_heights(&annotated)?;
    Ok(annotated)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::spec::count_vars;
    use crate::ir::builder::{build_cfg, FunctionContext};
    use crate::ir::translate::{translate_body, TranslationContext};
    use crate::ir::types::{LabelFactory, ValType};
    use crate::ir::Instr;
    use wasmparser::{BlockType, MemArg, Operator};

    fn annotated(
        ops: Vec<Operator>,
        args: Vec<ValType>,
        returns: Vec<ValType>,
    ) -> Cfg<Spec> {
        let mut factory = LabelFactory::new();
        let ctx = TranslationContext {
            func_arities: vec![(0, 1)],
            type_arities: vec![(0, 1)],
        };
        let body = translate_body(&ops, &mut factory, &ctx).unwrap();
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
        annotate(&cfg, &AnalysisOptions::default(), &Summaries::new()).unwrap()
    }

    fn function_label(id: u32) -> Label {
        Label {
            section: Section::Function,
            id,
        }
    }

    fn kept_function_ids(kept: &BTreeSet<Label>) -> BTreeSet<u32> {
        kept.iter()
            .filter(|l| l.section == Section::Function)
            .map(|l| l.id)
            .collect()
    }

    #[test]
    fn straight_line_slice_keeps_only_the_producing_chain() {
        // memory.size; memory.size; i32.add (criterion); drop;
        // memory.size; memory.size; i32.add
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let kept =
            instructions_to_keep(&cfg, function_label(2), &AnalysisOptions::default(), &Summaries::new()).unwrap();
        assert_eq!(kept_function_ids(&kept), BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn diamond_slice_keeps_condition_arms_and_merge() {
        // memory.size; if { memory.size } else { memory.size };
        // memory.size; memory.size; i32.add; drop; memory.size; i32.add
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::If {
                    blockty: BlockType::Type(wasmparser::ValType::I32),
                },
                Operator::MemorySize { mem: 0 },
                Operator::Else,
                Operator::MemorySize { mem: 0 },
                Operator::End,
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        // Criterion: the final i32.add (label 9), which consumes the
        // if-join value and memory.size 8.
        let kept =
            instructions_to_keep(&cfg, function_label(9), &AnalysisOptions::default(), &Summaries::new()).unwrap();
        assert_eq!(kept_function_ids(&kept), BTreeSet::from([0, 1, 2, 3, 8, 9]));
        assert!(kept.iter().any(|l| l.is_merge()));
        // The arithmetic between the join and the criterion is gone.
        for dropped in [4, 5, 6, 7] {
            assert!(!kept.contains(&function_label(dropped)));
        }
    }

    #[test]
    fn memory_dependence_pulls_the_store() {
        // memory.size; memory.size; i32.store; memory.size; i32.load(crit)
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Store {
                    memarg: MemArg {
                        align: 2,
                        max_align: 2,
                        offset: 0,
                        memory: 0,
                    },
                },
                Operator::MemorySize { mem: 0 },
                Operator::I32Load {
                    memarg: MemArg {
                        align: 2,
                        max_align: 2,
                        offset: 0,
                        memory: 0,
                    },
                },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let kept =
            instructions_to_keep(&cfg, function_label(4), &AnalysisOptions::default(), &Summaries::new()).unwrap();
        assert!(kept.contains(&function_label(2)), "store must be kept");
        assert!(kept.contains(&function_label(0)));
        assert!(kept.contains(&function_label(1)));
    }

    #[test]
    fn sliced_cfg_drops_unrelated_labels_and_revalidates() {
        // i32.const 0; i32.const 1; i32.add (criterion);
        // i32.const 2; i32.const 3; i32.add
        let cfg = annotated(
            vec![
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 1 },
                Operator::I32Add,
                Operator::Drop,
                Operator::I32Const { value: 2 },
                Operator::I32Const { value: 3 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let options = AnalysisOptions::default();
        let sliced = slice(&cfg, function_label(2), &options, &Summaries::new()).unwrap();
        for id in [4, 5, 6] {
            assert!(
                !sliced.instructions.contains_key(&function_label(id)),
                "label {} must not survive the slice",
                id
            );
        }
        let annotated = validate_slice(&sliced, &options, &Summaries::new()).unwrap();
        assert!(annotated.find_block(annotated.exit_block).is_ok());
    }

    #[test]
    fn every_surviving_instruction_is_kept_or_dummy() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::If {
                    blockty: BlockType::Type(wasmparser::ValType::I32),
                },
                Operator::MemorySize { mem: 0 },
                Operator::Else,
                Operator::MemorySize { mem: 0 },
                Operator::End,
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let options = AnalysisOptions::default();
        let criterion = function_label(5);
        let kept = instructions_to_keep(&cfg, criterion, &options, &Summaries::new()).unwrap();
        let sliced = slice(&cfg, criterion, &options, &Summaries::new()).unwrap();
        for (label, instr) in &sliced.instructions {
            if label.is_dummy() {
                continue;
            }
            if let Instr::Control(c) = instr {
                if matches!(c.op, crate::ir::Control::Merge) {
                    continue;
                }
            }
            assert!(
                kept.contains(label),
                "surviving label {} is neither kept nor dummy",
                label
            );
        }
        validate_slice(&sliced, &options, &Summaries::new()).unwrap();
    }

    #[test]
    fn slicing_twice_is_stable() {
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
        );
        let options = AnalysisOptions::default();
        let first = slice(&cfg, function_label(2), &options, &Summaries::new()).unwrap();
        let second = slice(&cfg, function_label(2), &options, &Summaries::new()).unwrap();
        assert_eq!(first.basic_blocks, second.basic_blocks);
        assert_eq!(first.edges, second.edges);
    }

    #[test]
    fn call_indirect_slice_reduces_variable_count() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::MemorySize { mem: 0 },
                Operator::CallIndirect {
                    type_index: 0,
                    table_index: 0,
                },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let options = AnalysisOptions::default();
        let criterion = function_label(5);
        let sliced = slice(&cfg, criterion, &options, &Summaries::new()).unwrap();
        let re_annotated = validate_slice(&sliced, &options, &Summaries::new()).unwrap();
        assert!(count_vars(&re_annotated) < count_vars(&cfg));
    }

    #[test]
    fn keep_entire_blocks_is_coarser() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Add,
                Operator::Drop,
                Operator::MemorySize { mem: 0 },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let coarse = AnalysisOptions {
            keep_entire_blocks: true,
            ..AnalysisOptions::default()
        };
        let sliced = slice(&cfg, function_label(2), &coarse, &Summaries::new()).unwrap();
        // The whole entry block survives, including the unrelated tail.
        assert!(sliced.instructions.contains_key(&function_label(4)));
        validate_slice(&sliced, &coarse, &Summaries::new()).unwrap();
    }

    #[test]
    fn singleton_drop_block_is_legal_in_a_slice() {
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
            vec![],
        );
        let options = AnalysisOptions::default();
        let sliced = slice(&cfg, function_label(1), &options, &Summaries::new()).unwrap();
        assert!(sliced.instructions.contains_key(&function_label(1)));
        validate_slice(&sliced, &options, &Summaries::new()).unwrap();
    }
}
