//! Transfer function and the intra-procedural worklist fixpoint.
//!
//! The transfer function rewrites a `Spec` according to one basic block:
//! data blocks fold their instruction sequence, control blocks consume
//! their condition (producing a `Branch` result for `br_if`/`if`) and apply
//! call effects through the callee's summary. The fixpoint pops the minimum
//! block index, merges the predecessors' out-results (selecting the branch
//! state matching the incoming edge's tag), applies the transfer and pushes
//! the successors on change.
//!
//! Termination: per position, variables can change only a bounded number of
//! times (once a position holds a `Merge` var of its block it stays there),
//! and merged memory formulas only gain entries or degrade them to top. An
//! iteration cap guards irreducible graphs.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use log::trace;

use crate::analysis::domain::{may_overlap, MemoryFormula, Value};
use crate::analysis::spec::{merge_specs, normalize_to_arity, value_constant, var_value, Spec};
use crate::analysis::summary::{Summaries, Summary};
use crate::ir::{
    BasicBlock, BlockContent, BlockId, Cfg, Control, Data, DataInstr, Label, Var,
};
use crate::AnalysisOptions;

// ─── Transfer results ────────────────────────────────────────────────────────

/// Out-state of one basic block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferResult {
    /// Block not analysed yet; bottom of the result lattice.
    #[default]
    Uninitialized,
    /// Straight-line block or non-branching control block.
    Simple(Spec),
    /// Control block branching on a condition: (true state, false state).
    Branch(Spec, Spec),
}

impl TransferResult {
    /// Componentwise join; `Uninitialized` is the unit. Mixed shapes join
    /// on their `Simple` projections.
    pub fn join(&self, other: &TransferResult, block: BlockId) -> Result<TransferResult> {
        use TransferResult::*;
        match (self, other) {
            (Uninitialized, r) | (r, Uninitialized) => Ok(r.clone()),
            (Simple(a), Simple(b)) => {
                Ok(Simple(merge_specs(block, &[a.clone(), b.clone()])?))
            }
            (Branch(at, af), Branch(bt, bf)) => Ok(Branch(
                merge_specs(block, &[at.clone(), bt.clone()])?,
                merge_specs(block, &[af.clone(), bf.clone()])?,
            )),
            (Simple(a), Branch(t, f)) | (Branch(t, f), Simple(a)) => Ok(Simple(merge_specs(
                block,
                &[a.clone(), t.clone(), f.clone()],
            )?)),
        }
    }

    /// State carried along an edge with the given tag.
    pub fn state_for_tag(&self, tag: Option<bool>) -> Option<&Spec> {
        match (self, tag) {
            (TransferResult::Uninitialized, _) => None,
            (TransferResult::Simple(s), _) => Some(s),
            (TransferResult::Branch(t, _), Some(true)) => Some(t),
            (TransferResult::Branch(_, f), Some(false)) => Some(f),
            // An untagged edge out of a branching block does not occur in
            // well-formed graphs; fall back to the true state.
            (TransferResult::Branch(t, _), None) => Some(t),
        }
    }
}

// ─── Per-instruction transfer ────────────────────────────────────────────────

/// Apply one data instruction to the state.
pub fn data_transfer(
    op: &Data,
    label: Label,
    state: &mut Spec,
    options: &AnalysisOptions,
) -> Result<()> {
    let fresh = Var::Instr(label);
    match op {
        Data::Nop => {}
        Data::Drop => {
            state.pop()?;
        }
        Data::Select => {
            state.pop()?;
            state.pop()?;
            state.pop()?;
            state.push(fresh);
        }
        Data::MemorySize => state.push(fresh),
        Data::MemoryGrow => {
            state.pop()?;
            state.push(fresh);
        }
        Data::Const(p) => {
            if options.use_const {
                state.push(Var::Const(*p));
            } else {
                state.push(fresh);
            }
        }
        Data::Unary(_) | Data::Test(_) | Data::Convert(_) => {
            state.pop()?;
            state.push(fresh);
        }
        Data::Binary(_) | Data::Compare(_) => {
            state.pop()?;
            state.pop()?;
            state.push(fresh);
        }
        Data::LocalGet(i) => {
            let current = *state
                .locals
                .get(*i as usize)
                .with_context(|| format!("local.get {} out of range", i))?;
            if options.propagate_locals {
                state.push(current);
            } else {
                state.push(fresh);
            }
        }
        Data::LocalSet(i) => {
            let value = state.pop()?;
            let slot = state
                .locals
                .get_mut(*i as usize)
                .with_context(|| format!("local.set {} out of range", i))?;
            *slot = if options.propagate_locals { value } else { fresh };
        }
        Data::LocalTee(i) => {
            let value = state.pop()?;
            let named = if options.propagate_locals { value } else { fresh };
            let slot = state
                .locals
                .get_mut(*i as usize)
                .with_context(|| format!("local.tee {} out of range", i))?;
            *slot = named;
            state.push(named);
        }
        Data::GlobalGet(i) => {
            let current = *state
                .globals
                .get(*i as usize)
                .with_context(|| format!("global.get {} out of range", i))?;
            if options.propagate_globals {
                state.push(current);
            } else {
                state.push(fresh);
            }
        }
        Data::GlobalSet(i) => {
            let value = state.pop()?;
            let slot = state
                .globals
                .get_mut(*i as usize)
                .with_context(|| format!("global.set {} out of range", i))?;
            *slot = if options.propagate_globals { value } else { fresh };
        }
        Data::Load(_) => {
            state.pop()?;
            state.push(fresh);
        }
        Data::Store(m) => {
            let value = state.pop()?;
            let addr = state.pop()?;
            state.memory.store(
                &var_value(addr).add_offset(i64::from(m.offset)),
                &var_value(value),
            );
        }
    }
    Ok(())
}

/// Apply a control instruction. `summaries` supplies call effects; a callee
/// with no summary clobbers globals and memory.
fn control_transfer(
    op: &Control<()>,
    label: Label,
    mut state: Spec,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<TransferResult> {
    match op {
        Control::If { .. } | Control::BrIf(_) => {
            state.pop()?;
            Ok(TransferResult::Branch(state.clone(), state))
        }
        Control::BrTable { .. } => {
            state.pop()?;
            Ok(TransferResult::Simple(state))
        }
        Control::Br(_) | Control::Return | Control::Unreachable | Control::Merge => {
            Ok(TransferResult::Simple(state))
        }
        Control::Call { arity, index } => {
            call_effect(&mut state, *arity, summaries.get(index), label, options)?;
            Ok(TransferResult::Simple(state))
        }
        Control::CallIndirect { arity, .. } => {
            // The table index is consumed on top of the arguments, and the
            // callee is unknown to the intra-procedural analysis.
            state.pop()?;
            call_effect(&mut state, *arity, None, label, options)?;
            Ok(TransferResult::Simple(state))
        }
        Control::Block { .. } | Control::Loop { .. } => {
            bail!("structured control instruction {} survived CFG lowering", label)
        }
    }
}

/// Pop the arguments, push the results, and apply the callee's effect.
///
/// With a summary, the effect is instantiated in the caller's frame via
/// `Summary::apply`: `Parameter i` becomes the i-th argument value and
/// `Global i` the caller's global value. A result or clobbered global whose
/// adapted value is a literal constant collapses to a `Const` var under the
/// `use_const` knob; everything else is named by the call. Without a
/// summary, globals and memory are clobbered wholesale.
fn call_effect(
    state: &mut Spec,
    arity: (usize, usize),
    summary: Option<&Summary>,
    label: Label,
    options: &AnalysisOptions,
) -> Result<()> {
    let mut args = Vec::with_capacity(arity.0);
    for _ in 0..arity.0 {
        args.push(state.pop()?);
    }
    args.reverse();

    let summary = match summary {
        Some(s) => s,
        None => {
            for _ in 0..arity.1 {
                state.push(Var::Instr(label));
            }
            for slot in state.globals.iter_mut() {
                *slot = Var::Instr(label);
            }
            state.memory = MemoryFormula::new();
            return Ok(());
        }
    };

    let arg_values: Vec<Value> = args.iter().map(|&v| var_value(v)).collect();
    let caller_globals: Vec<Value> = state.globals.iter().map(|&v| var_value(v)).collect();
    let (results, globals, writes) = summary.apply(&arg_values, &caller_globals);

    for i in 0..arity.1 {
        let var = match results.get(i).and_then(value_constant) {
            Some(p) if options.use_const => Var::Const(p),
            _ => Var::Instr(label),
        };
        state.push(var);
    }

    for i in 0..state.globals.len() {
        if summary.preserves_global(i) {
            continue;
        }
        state.globals[i] = match globals.get(i).and_then(value_constant) {
            Some(p) if options.use_const => Var::Const(p),
            _ => Var::Instr(label),
        };
    }

    if summary.writes_memory() {
        // The callee's writes land after everything currently known: drop
        // entries its adapted addresses may touch, then record the writes.
        let mut kept = MemoryFormula::new();
        'entries: for (key, byte) in &state.memory.points_to {
            for written in writes.points_to.keys() {
                if may_overlap(&key.value, &written.value) {
                    continue 'entries;
                }
            }
            kept.points_to.insert(key.clone(), byte.clone());
        }
        for (key, byte) in writes.points_to {
            kept.points_to.insert(key, byte);
        }
        state.memory = kept;
    }
    Ok(())
}

/// Transfer one basic block from its in-state.
pub fn transfer(
    block: &BasicBlock<()>,
    in_state: Spec,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<TransferResult> {
    match &block.content {
        BlockContent::Data(instrs) => {
            let mut state = in_state;
            for d in instrs {
                data_transfer(&d.op, d.label, &mut state, options)
                    .with_context(|| format!("transferring {}", d.label))?;
            }
            Ok(TransferResult::Simple(state))
        }
        BlockContent::Control(c) => {
            control_transfer(&c.op, c.label, in_state, options, summaries)
        }
        BlockContent::Merge(_) => Ok(TransferResult::Simple(in_state)),
    }
}

// ─── Fixpoint ────────────────────────────────────────────────────────────────

type BlockStates = BTreeMap<BlockId, (Spec, TransferResult)>;

/// Gather and merge the in-state of `block` from its predecessors' stored
/// results. `None` when no predecessor has been analysed yet.
fn gather_in_state(
    cfg: &Cfg<()>,
    block: BlockId,
    states: &BlockStates,
) -> Result<Option<Spec>> {
    let return_arity = cfg.return_types.len();
    let mut incoming = Vec::new();
    for &(pred, tag) in cfg.predecessors(block) {
        let out = match states.get(&pred) {
            Some((_, out)) => out,
            None => continue,
        };
        if let Some(state) = out.state_for_tag(tag) {
            let state = if block == cfg.exit_block {
                match normalize_to_arity(state.clone(), return_arity) {
                    Some(s) => s,
                    None => continue,
                }
            } else {
                state.clone()
            };
            incoming.push(state);
        }
    }
    if incoming.is_empty() {
        return Ok(None);
    }
    Ok(Some(merge_specs(block, &incoming)?))
}

/// Run the worklist fixpoint and return per-block (in-state, out-result).
fn fixpoint(
    cfg: &Cfg<()>,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<BlockStates> {
    let nlocals = cfg.arg_types.len() + cfg.local_types.len();
    let nglobals = cfg.global_types.len();
    let mut states: BlockStates = BTreeMap::new();
    let mut worklist: BTreeSet<BlockId> = BTreeSet::new();
    worklist.insert(cfg.entry_block);

    let cap = cfg.basic_blocks.len() * 64 + 64;
    let mut steps = 0usize;

    while let Some(&block) = worklist.iter().next() {
        worklist.remove(&block);
        steps += 1;
        if steps > cap {
            bail!(
                "fixpoint did not converge after {} steps in function {} (irreducible control flow?)",
                steps,
                cfg.func_idx
            );
        }

        let in_state = if block == cfg.entry_block {
            Spec::initial(nlocals, nglobals)
        } else {
            match gather_in_state(cfg, block, &states)? {
                Some(s) => s,
                None => continue,
            }
        };

        let out = transfer(cfg.find_block(block)?, in_state.clone(), options, summaries)
            .with_context(|| format!("transferring block {}", block))?;
        let entry = (in_state, out);
        if states.get(&block) != Some(&entry) {
            trace!("fixpoint: block {} changed", block);
            states.insert(block, entry);
            for &(succ, _) in cfg.successors(block) {
                worklist.insert(succ);
            }
        }
    }
    Ok(states)
}

// ─── Annotation ──────────────────────────────────────────────────────────────

/// Spec inference: annotate every program point of the CFG with its
/// abstract state. The returned graph has the same skeleton as the input.
pub fn annotate(
    cfg: &Cfg<()>,
    options: &AnalysisOptions,
    summaries: &Summaries,
) -> Result<Cfg<Spec>> {
    let states = fixpoint(cfg, options, summaries)?;

    let mut basic_blocks = BTreeMap::new();
    for (&idx, block) in &cfg.basic_blocks {
        // Blocks never reached by the fixpoint (dead code after an
        // infinite loop) keep the empty state and are not folded.
        let reachable = states.contains_key(&idx);
        let (in_state, out) = match states.get(&idx) {
            Some(pair) => pair.clone(),
            None => (Spec::default(), TransferResult::Uninitialized),
        };
        let mut after = match out {
            TransferResult::Simple(s) => s,
            TransferResult::Branch(t, _) => t,
            TransferResult::Uninitialized => in_state.clone(),
        };
        if idx == cfg.exit_block {
            // The exit consumes the returned values.
            after.vstack.clear();
        }
        let content = match &block.content {
            BlockContent::Data(instrs) if reachable => {
                let mut state = in_state.clone();
                let mut annotated = Vec::with_capacity(instrs.len());
                for d in instrs {
                    let before = state.clone();
                    data_transfer(&d.op, d.label, &mut state, options)?;
                    annotated.push(DataInstr {
                        label: d.label,
                        op: d.op.clone(),
                        before,
                        after: state.clone(),
                    });
                }
                BlockContent::Data(annotated)
            }
            BlockContent::Data(instrs) => BlockContent::Data(
                instrs
                    .iter()
                    .map(|d| DataInstr {
                        label: d.label,
                        op: d.op.clone(),
                        before: Spec::default(),
                        after: Spec::default(),
                    })
                    .collect(),
            ),
            BlockContent::Control(c) => {
                let annotated = crate::ir::Instr::Control(c.clone())
                    .map_annotations(&mut |_| in_state.clone());
                match annotated {
                    crate::ir::Instr::Control(mut ac) => {
                        ac.after = after.clone();
                        BlockContent::Control(ac)
                    }
                    crate::ir::Instr::Data(_) => unreachable!("control mapped to data"),
                }
            }
            BlockContent::Merge(l) => BlockContent::Merge(*l),
        };
        basic_blocks.insert(
            idx,
            BasicBlock {
                idx,
                content,
                before: in_state,
                after,
            },
        );
    }

    let mut annotated = Cfg {
        func_idx: cfg.func_idx,
        exported: cfg.exported,
        name: cfg.name.clone(),
        global_types: cfg.global_types.clone(),
        arg_types: cfg.arg_types.clone(),
        local_types: cfg.local_types.clone(),
        return_types: cfg.return_types.clone(),
        basic_blocks,
        instructions: BTreeMap::new(),
        edges: cfg.edges.clone(),
        back_edges: cfg.back_edges.clone(),
        entry_block: cfg.entry_block,
        exit_block: cfg.exit_block,
        loop_heads: cfg.loop_heads.clone(),
    };
    annotated.rebuild_instruction_map();
    Ok(annotated)
}

/// Invariant check: along every edge between executable blocks, the stack
/// height leaving the source equals the height entering the target (modulo
/// exit normalisation). Edges out of statically dead blocks carry no
/// meaningful height and are not checked.
pub fn check_stack_heights(cfg: &Cfg<Spec>) -> Result<()> {
    let mut reachable: BTreeSet<BlockId> = BTreeSet::new();
    let mut stack = vec![cfg.entry_block];
    while let Some(b) = stack.pop() {
        if reachable.insert(b) {
            stack.extend(cfg.successors(b).iter().map(|(d, _)| *d));
        }
    }
    for (&src, outs) in &cfg.edges {
        if !reachable.contains(&src) {
            continue;
        }
        let src_block = cfg.find_block(src)?;
        for &(dst, _) in outs {
            let dst_block = cfg.find_block(dst)?;
            let height_out = src_block.after.stack_height();
            let height_in = dst_block.before.stack_height();
            if dst == cfg.exit_block {
                if height_out < height_in {
                    bail!(
                        "stack height {} leaving {} is below the exit height {}",
                        height_out,
                        src,
                        height_in
                    );
                }
                continue;
            }
            if height_out != height_in {
                bail!(
                    "stack height mismatch on edge {} -> {}: {} vs {}",
                    src,
                    dst,
                    height_out,
                    height_in
                );
            }
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
