//! Per-program-point abstract state (`Spec`) and the merge policy that
//! mints SSA merge variables at join points.
//!
//! A `Spec` names every stack slot, local and global with an SSA `Var` and
//! carries the byte-granular points-to formula of the abstract domain for
//! known memory contents. Merging the states flowing into a merge block
//! compares position by position: positions on which the predecessors agree
//! keep the common variable, positions that disagree receive a fresh
//! `Merge(block, position)` variable. Positions are drawn from a single
//! index space (globals, then locals, then the value stack bottom-up) so
//! merge variables of one block never collide.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{bail, Result};

use crate::analysis::domain::{MemoryFormula, Value};
use crate::ir::{BlockId, Cfg, Prim, Var};

/// Abstract state at a program point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Spec {
    /// Value stack; the top of the stack is the last element.
    pub vstack: Vec<Var>,
    /// Variable currently held by each local slot.
    pub locals: Vec<Var>,
    /// Variable currently held by each global slot.
    pub globals: Vec<Var>,
    /// Known memory contents, as the domain's byte-level points-to formula.
    pub memory: MemoryFormula,
}

impl Spec {
    /// Function-entry state: empty stack, locals and globals named by their
    /// entry variables.
    pub fn initial(nlocals: usize, nglobals: usize) -> Spec {
        Spec {
            vstack: Vec::new(),
            locals: (0..nlocals as u32).map(Var::Local).collect(),
            globals: (0..nglobals as u32).map(Var::Global).collect(),
            memory: MemoryFormula::new(),
        }
    }

    pub fn stack_height(&self) -> usize {
        self.vstack.len()
    }

    pub fn push(&mut self, var: Var) {
        self.vstack.push(var);
    }

    pub fn pop(&mut self) -> Result<Var> {
        self.vstack
            .pop()
            .ok_or_else(|| anyhow::anyhow!("value stack underflow"))
    }

    /// The n-th variable from the top of the stack (0 is the top).
    pub fn peek(&self, n: usize) -> Result<Var> {
        let len = self.vstack.len();
        if n >= len {
            bail!("value stack has {} entries, cannot peek {}", len, n);
        }
        Ok(self.vstack[len - 1 - n])
    }

    // ─── Unified position space ──────────────────────────────────────────

    /// Number of merge positions: globals, locals and stack slots.
    pub fn position_count(&self) -> usize {
        self.globals.len() + self.locals.len() + self.vstack.len()
    }

    /// Variable at a merge position. Positions enumerate globals first,
    /// then locals, then the value stack from the bottom.
    pub fn var_at(&self, pos: usize) -> Var {
        let ng = self.globals.len();
        let nl = self.locals.len();
        if pos < ng {
            self.globals[pos]
        } else if pos < ng + nl {
            self.locals[pos - ng]
        } else {
            self.vstack[pos - ng - nl]
        }
    }

    fn set_at(&mut self, pos: usize, var: Var) {
        let ng = self.globals.len();
        let nl = self.locals.len();
        if pos < ng {
            self.globals[pos] = var;
        } else if pos < ng + nl {
            self.locals[pos - ng] = var;
        } else {
            self.vstack[pos - ng - nl] = var;
        }
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_vars = |vars: &[Var]| {
            vars.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "stack=[{}] locals=[{}] globals=[{}]",
            fmt_vars(&self.vstack),
            fmt_vars(&self.locals),
            fmt_vars(&self.globals)
        )
    }
}

// ─── Merging ─────────────────────────────────────────────────────────────────

/// Merge the states flowing into merge block `block`. Positions on which
/// all predecessors agree keep their variable; the rest get fresh
/// `Merge(block, position)` variables. Memory keeps the assertions all
/// predecessors agree on.
pub fn merge_specs(block: BlockId, incoming: &[Spec]) -> Result<Spec> {
    let first = match incoming.first() {
        Some(s) => s,
        None => bail!("merge block {} has no incoming state", block),
    };
    for other in &incoming[1..] {
        if other.vstack.len() != first.vstack.len() {
            bail!(
                "merge mismatch at block {}: vstack lengths {} vs {}",
                block,
                first.vstack.len(),
                other.vstack.len()
            );
        }
        if other.locals.len() != first.locals.len() || other.globals.len() != first.globals.len()
        {
            bail!("merge mismatch at block {}: frame shapes differ", block);
        }
    }

    let mut merged = first.clone();
    for pos in 0..first.position_count() {
        let v0 = first.var_at(pos);
        if incoming[1..].iter().any(|s| s.var_at(pos) != v0) {
            merged.set_at(pos, Var::Merge(block, pos as u32));
        }
    }

    // Memory: the formula join keeps agreeing assertions and drops
    // conflicting entries to top.
    let mut memory = first.memory.clone();
    for other in &incoming[1..] {
        memory = memory.join(&other.memory);
    }
    merged.memory = memory;
    Ok(merged)
}

// ─── Variable readings in the value domain ───────────────────────────────────

/// Shallow reading of a variable as a domain value: constants are
/// constants, entry locals are parameters, entry globals are globals,
/// instruction and merge variables are unknown. This is the resolution the
/// transfer uses when it feeds addresses and stored values into the memory
/// formula.
pub fn var_value(var: Var) -> Value {
    match var {
        Var::Const(p) => Value::constant(p.as_i64()),
        Var::Local(i) => Value::parameter(i as usize),
        Var::Global(i) => Value::global(i as usize),
        Var::Instr(_) | Var::Merge(_, _) => Value::Open,
    }
}

/// The literal constant denoted by a value, if it simplifies to one.
pub fn value_constant(value: &Value) -> Option<Prim> {
    match value.simplify() {
        Value::Symbolic(crate::analysis::domain::Symbolic::Const(c)) => {
            if c >= i64::from(i32::MIN) && c <= i64::from(i32::MAX) {
                Some(Prim::I32(c as i32))
            } else {
                Some(Prim::I64(c))
            }
        }
        _ => None,
    }
}

/// Out-state of `pred` as seen on the edge into `target`: the predecessor's
/// after-annotation, normalised to the function's return arity when the
/// target is the exit block. `None` marks an edge whose state cannot reach
/// the exit shape (a shorter stack on a statically dead path).
pub fn incoming_spec(
    cfg: &Cfg<Spec>,
    pred: BlockId,
    target: BlockId,
    return_arity: usize,
) -> Result<Option<Spec>> {
    let state = cfg.find_block(pred)?.after.clone();
    if target != cfg.exit_block {
        return Ok(Some(state));
    }
    Ok(normalize_to_arity(state, return_arity))
}

/// Keep only the top `arity` stack entries; `None` when the stack is too
/// short (an `unreachable` path).
pub fn normalize_to_arity(mut state: Spec, arity: usize) -> Option<Spec> {
    if state.vstack.len() < arity {
        return None;
    }
    let keep_from = state.vstack.len() - arity;
    state.vstack.drain(..keep_from);
    Some(state)
}

/// The ordered association `(incoming var, fresh merge var)` introduced by
/// a merge block: for every position whose merged variable is a
/// `Merge(block, _)`, one pair per distinct predecessor variable. Derived
/// from the annotations on demand, never stored.
pub fn new_merge_variables(cfg: &Cfg<Spec>, block: BlockId) -> Result<Vec<(Var, Var)>> {
    let b = cfg.find_block(block)?;
    if !b.is_merge() {
        return Ok(Vec::new());
    }
    let merged = &b.before;
    let return_arity = cfg.return_types.len();
    let mut pairs = Vec::new();
    let mut seen = BTreeSet::new();
    for &(pred, _) in cfg.predecessors(block) {
        let pred_state = match incoming_spec(cfg, pred, block, return_arity)? {
            Some(s) => s,
            None => continue,
        };
        if pred_state.position_count() != merged.position_count() {
            continue;
        }
        for pos in 0..merged.position_count() {
            let merge_var = merged.var_at(pos);
            if let Var::Merge(mb, _) = merge_var {
                if mb == block {
                    let old = pred_state.var_at(pos);
                    if seen.insert((old, merge_var)) {
                        pairs.push((old, merge_var));
                    }
                }
            }
        }
    }
    Ok(pairs)
}

/// Number of distinct variables mentioned anywhere in the annotations.
pub fn count_vars(cfg: &Cfg<Spec>) -> usize {
    let mut vars: BTreeSet<Var> = BTreeSet::new();
    let mut collect = |spec: &Spec| {
        vars.extend(spec.vstack.iter().copied());
        vars.extend(spec.locals.iter().copied());
        vars.extend(spec.globals.iter().copied());
    };
    for block in cfg.basic_blocks.values() {
        collect(&block.before);
        collect(&block.after);
        if let crate::ir::BlockContent::Data(instrs) = &block.content {
            for d in instrs {
                collect(&d.before);
                collect(&d.after);
            }
        }
    }
    vars.len()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
