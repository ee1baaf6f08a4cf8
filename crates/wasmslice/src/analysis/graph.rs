//! Graph utilities: rooted trees, nearest common ancestor, and dominator
//! trees via the Cooper–Harvey–Kennedy algorithm.
//!
//! Everything here is iterative with explicit work stacks; WebAssembly
//! functions can nest control flow thousands of levels deep and tree-depth
//! recursion would overflow the call stack.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::types::BlockId;

/// Successor relation used by the tree builders: block → ordered targets.
pub type Adjacency = BTreeMap<BlockId, Vec<BlockId>>;

// ─── Rooted trees ────────────────────────────────────────────────────────────

/// A rooted tree over block indices, stored as a parent map with derived
/// children and depth maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub root: BlockId,
    pub parent: BTreeMap<BlockId, BlockId>,
    pub children: BTreeMap<BlockId, BTreeSet<BlockId>>,
    depth: BTreeMap<BlockId, usize>,
}

impl Tree {
    /// Build a tree from a parent map. Nodes not reachable from `root`
    /// through the parent relation are dropped.
    pub fn from_parents(root: BlockId, parent: BTreeMap<BlockId, BlockId>) -> Self {
        let mut children: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        children.entry(root).or_default();
        for (&child, &p) in &parent {
            children.entry(p).or_default().insert(child);
            children.entry(child).or_default();
        }
        // Iterative depth assignment from the root.
        let mut depth = BTreeMap::new();
        depth.insert(root, 0usize);
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let d = depth[&node];
            if let Some(kids) = children.get(&node) {
                for &kid in kids {
                    if kid != root && !depth.contains_key(&kid) {
                        depth.insert(kid, d + 1);
                        stack.push(kid);
                    }
                }
            }
        }
        children.retain(|node, _| depth.contains_key(node));
        let parent = parent
            .into_iter()
            .filter(|(child, _)| depth.contains_key(child))
            .collect();
        Tree {
            root,
            parent,
            children,
            depth,
        }
    }

    pub fn contains(&self, node: BlockId) -> bool {
        self.depth.contains_key(&node)
    }

    pub fn depth_of(&self, node: BlockId) -> Option<usize> {
        self.depth.get(&node).copied()
    }

    pub fn parent_of(&self, node: BlockId) -> Option<BlockId> {
        self.parent.get(&node).copied()
    }

    /// `true` if `ancestor` lies on the path from `node` to the root
    /// (a node is its own ancestor).
    pub fn is_ancestor(&self, ancestor: BlockId, node: BlockId) -> bool {
        let mut current = node;
        loop {
            if current == ancestor {
                return true;
            }
            match self.parent_of(current) {
                Some(p) => current = p,
                None => return false,
            }
        }
    }

    /// Nearest common ancestor of two nodes, by climbing to equal depth
    /// first. `None` when either node is not in the tree.
    pub fn nca(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let mut da = self.depth_of(a)?;
        let mut db = self.depth_of(b)?;
        let (mut a, mut b) = (a, b);
        while da > db {
            a = self.parent_of(a)?;
            da -= 1;
        }
        while db > da {
            b = self.parent_of(b)?;
            db -= 1;
        }
        while a != b {
            a = self.parent_of(a)?;
            b = self.parent_of(b)?;
        }
        Some(a)
    }
}

// ─── Traversals ──────────────────────────────────────────────────────────────

/// Depth-first postorder of the nodes reachable from `root`, computed with
/// an explicit stack. Successors are visited in their adjacency order.
pub fn postorder(root: BlockId, edges: &Adjacency) -> Vec<BlockId> {
    let mut order = Vec::new();
    let mut seen = BTreeSet::new();
    // (node, expanded) pairs: a node is pushed once to expand its
    // successors and once more to emit it after they are done.
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !seen.insert(node) {
            continue;
        }
        stack.push((node, true));
        if let Some(succs) = edges.get(&node) {
            for &succ in succs.iter().rev() {
                if !seen.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }
    }
    order
}

// ─── Dominator trees ─────────────────────────────────────────────────────────

/// Dominator tree of the graph rooted at `root`, as a `Tree` whose parent
/// relation is the immediate-dominator relation.
///
/// Cooper–Harvey–Kennedy: compute reverse postorder numbers, then iterate
/// `idom[b] = intersect(processed predecessors)` to a fixed point. Nodes
/// unreachable from `root` do not appear in the result.
pub fn dominator_tree(root: BlockId, edges: &Adjacency) -> Tree {
    let post = postorder(root, edges);
    let mut rpo_number: BTreeMap<BlockId, usize> = BTreeMap::new();
    for (i, &node) in post.iter().rev().enumerate() {
        rpo_number.insert(node, i);
    }

    // Predecessor map restricted to reachable nodes.
    let mut preds: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
    for (&src, dsts) in edges {
        if !rpo_number.contains_key(&src) {
            continue;
        }
        for &dst in dsts {
            if rpo_number.contains_key(&dst) {
                preds.entry(dst).or_default().push(src);
            }
        }
    }

    let mut idom: BTreeMap<BlockId, BlockId> = BTreeMap::new();
    idom.insert(root, root);

    let intersect = |idom: &BTreeMap<BlockId, BlockId>, a: BlockId, b: BlockId| {
        let (mut a, mut b) = (a, b);
        while a != b {
            while rpo_number[&a] > rpo_number[&b] {
                a = idom[&a];
            }
            while rpo_number[&b] > rpo_number[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let rpo: Vec<BlockId> = post.iter().rev().copied().collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in preds.get(&b).map(Vec::as_slice).unwrap_or(&[]) {
                if !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(current) => intersect(&idom, current, p),
                });
            }
            if let Some(n) = new_idom {
                if idom.get(&b) != Some(&n) {
                    idom.insert(b, n);
                    changed = true;
                }
            }
        }
    }

    idom.remove(&root);
    Tree::from_parents(root, idom)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
