//! Control dependences, derived from the post-dominator tree.
//!
//! A block `B` is control-dependent on a branching block `P` when `P` has
//! one successor that leads unavoidably to `B` and another that can bypass
//! it; equivalently, for an edge `P → S`, every block on the post-dominator
//! tree path from `S` up to (excluding) `ipdom(P)` is control-dependent on
//! `P`. The *predicate* of `P` is the top-of-stack variable consumed by its
//! `br_if`/`if`/`br_table` terminator.

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;

use crate::analysis::graph::{dominator_tree, Adjacency, Tree};
use crate::analysis::spec::Spec;
use crate::ir::{BlockContent, BlockId, Cfg, Control, Label, Var};

/// Predicate of a control block: the branch-condition variable read by its
/// terminator, if it branches on one.
pub fn block_predicate(cfg: &Cfg<Spec>, block: BlockId) -> Result<Option<(Label, Var)>> {
    let b = cfg.find_block(block)?;
    if let BlockContent::Control(c) = &b.content {
        match c.op {
            Control::If { .. } | Control::BrIf(_) | Control::BrTable { .. } => {
                let var = c.before.peek(0)?;
                return Ok(Some((c.label, var)));
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Post-dominator tree: the dominator tree of the edge-reversed graph
/// rooted at the exit block.
pub fn post_dominator_tree(cfg: &Cfg<Spec>) -> Tree {
    let mut reversed: Adjacency = BTreeMap::new();
    for (&src, outs) in &cfg.edges {
        for &(dst, _) in outs {
            reversed.entry(dst).or_default().push(src);
        }
    }
    dominator_tree(cfg.exit_block, &reversed)
}

/// For every block, the predicates it is control-dependent on.
pub fn control_dependencies(
    cfg: &Cfg<Spec>,
) -> Result<BTreeMap<BlockId, Vec<(Label, Var)>>> {
    let pdom = post_dominator_tree(cfg);
    let mut deps: BTreeMap<BlockId, Vec<(Label, Var)>> = BTreeMap::new();

    for (&src, outs) in &cfg.edges {
        let predicate = match block_predicate(cfg, src)? {
            Some(p) => p,
            None => continue,
        };
        let stop = pdom.parent_of(src);
        for &(dst, _) in outs {
            if !pdom.contains(dst) {
                // The successor cannot reach the exit (infinite loop);
                // dependences through it are not representable.
                debug!("control deps: {} not in the post-dominator tree", dst);
                continue;
            }
            let mut walk = Some(dst);
            while let Some(w) = walk {
                if Some(w) == stop {
                    break;
                }
                let entry = deps.entry(w).or_default();
                if !entry.contains(&predicate) {
                    entry.push(predicate);
                }
                walk = pdom.parent_of(w);
            }
        }
    }
    Ok(deps)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
