//! Basic blocks and the function-scoped control-flow graph.
//!
//! A block is maximal straight-line data code, a singleton control
//! instruction, or a synthetic merge point. Edges are kept in forward and
//! reverse adjacency maps keyed by source block; conditional edges carry a
//! branch tag (`Some(true)` / `Some(false)`), all others `None`. Two edges
//! between the same pair of blocks with distinct tags are legal and
//! meaningful (an `if` whose arms collapse to the same join).
//!
//! All maps are `BTreeMap`s so iteration order, and with it the dot output
//! and the slicer, is deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use anyhow::{anyhow, bail, Result};

use super::types::{BlockId, Control, ControlInstr, DataInstr, Instr, Label, ValType};

// ─── Basic blocks ────────────────────────────────────────────────────────────

/// Payload of a basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockContent<A> {
    /// Ordered sequence of data instructions. Non-empty except after
    /// slicing, which may legitimately empty a kept block.
    Data(Vec<DataInstr<A>>),
    /// A single control instruction.
    Control(ControlInstr<A>),
    /// SSA join point, identified by a label from the `Merge` section.
    Merge(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock<A> {
    pub idx: BlockId,
    pub content: BlockContent<A>,
    pub before: A,
    pub after: A,
}

impl<A> BasicBlock<A> {
    pub fn is_merge(&self) -> bool {
        matches!(self.content, BlockContent::Merge(_))
    }

    /// Labels of all instructions carried by this block, in order.
    pub fn labels(&self) -> Vec<Label> {
        match &self.content {
            BlockContent::Data(instrs) => instrs.iter().map(|i| i.label).collect(),
            BlockContent::Control(c) => vec![c.label],
            BlockContent::Merge(l) => vec![*l],
        }
    }
}

// ─── Edges ───────────────────────────────────────────────────────────────────

/// Adjacency map: source block → (target, branch tag) list.
pub type Edges = BTreeMap<BlockId, Vec<(BlockId, Option<bool>)>>;

// ─── CFG ─────────────────────────────────────────────────────────────────────

/// Function-scoped control-flow graph, generic over the annotation carried
/// at each program point.
#[derive(Debug, Clone)]
pub struct Cfg<A> {
    /// Index of the function in the module's function space.
    pub func_idx: u32,
    /// Whether the function is exported.
    pub exported: bool,
    /// Export or name-section name, else a `func_N` placeholder.
    pub name: String,
    pub global_types: Vec<ValType>,
    pub arg_types: Vec<ValType>,
    pub local_types: Vec<ValType>,
    pub return_types: Vec<ValType>,
    pub basic_blocks: BTreeMap<BlockId, BasicBlock<A>>,
    /// Denormalised instruction map for O(log n) label lookup.
    pub instructions: BTreeMap<Label, Instr<A>>,
    pub edges: Edges,
    pub back_edges: Edges,
    pub entry_block: BlockId,
    pub exit_block: BlockId,
    /// Blocks that are the head of a `loop` construct.
    pub loop_heads: BTreeSet<BlockId>,
}

impl<A: Clone> Cfg<A> {
    pub fn find_block(&self, idx: BlockId) -> Result<&BasicBlock<A>> {
        self.basic_blocks
            .get(&idx)
            .ok_or_else(|| anyhow!("block {} not found in function {}", idx, self.func_idx))
    }

    pub fn find_instr(&self, label: Label) -> Result<&Instr<A>> {
        self.instructions
            .get(&label)
            .ok_or_else(|| anyhow!("instruction {} not found in function {}", label, self.func_idx))
    }

    /// Outgoing edges of `idx` (empty if none).
    pub fn successors(&self, idx: BlockId) -> &[(BlockId, Option<bool>)] {
        self.edges.get(&idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming edges of `idx` as (predecessor, tag) pairs.
    pub fn predecessors(&self, idx: BlockId) -> &[(BlockId, Option<bool>)] {
        self.back_edges.get(&idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of incoming edges, counting duplicated (src, dst) pairs once
    /// per tag.
    pub fn in_degree(&self, idx: BlockId) -> usize {
        self.predecessors(idx).len()
    }

    pub fn add_edge(&mut self, src: BlockId, dst: BlockId, tag: Option<bool>) {
        self.edges.entry(src).or_default().push((dst, tag));
        self.back_edges.entry(dst).or_default().push((src, tag));
    }

    /// Remove every edge between `src` and `dst`, whatever its tag.
    pub fn remove_edge(&mut self, src: BlockId, dst: BlockId) {
        if let Some(out) = self.edges.get_mut(&src) {
            out.retain(|(d, _)| *d != dst);
        }
        if let Some(inc) = self.back_edges.get_mut(&dst) {
            inc.retain(|(s, _)| *s != src);
        }
    }

    /// Remove a block and all edges touching it. The caller is responsible
    /// for rewiring; used by the slicer.
    pub fn remove_block(&mut self, idx: BlockId) {
        if let Some(block) = self.basic_blocks.remove(&idx) {
            for label in block.labels() {
                self.instructions.remove(&label);
            }
        }
        let outgoing: Vec<BlockId> = self.successors(idx).iter().map(|(d, _)| *d).collect();
        for dst in outgoing {
            self.remove_edge(idx, dst);
        }
        let incoming: Vec<BlockId> = self.predecessors(idx).iter().map(|(s, _)| *s).collect();
        for src in incoming {
            self.remove_edge(src, idx);
        }
        self.edges.remove(&idx);
        self.back_edges.remove(&idx);
        self.loop_heads.remove(&idx);
    }

    /// Smallest unused block id.
    pub fn next_block_id(&self) -> BlockId {
        BlockId(
            self.basic_blocks
                .keys()
                .next_back()
                .map(|b| b.0 + 1)
                .unwrap_or(0),
        )
    }

    /// Rewrite every annotation in the graph, keeping indices, labels and
    /// payloads intact. The instruction map is rebuilt from the blocks so
    /// the two views cannot diverge.
    pub fn map_annotations<B: Clone>(&self, f: &mut impl FnMut(&A) -> B) -> Cfg<B> {
        let mut basic_blocks = BTreeMap::new();
        for (idx, block) in &self.basic_blocks {
            let content = match &block.content {
                BlockContent::Data(instrs) => BlockContent::Data(
                    instrs
                        .iter()
                        .map(|d| DataInstr {
                            label: d.label,
                            op: d.op.clone(),
                            before: f(&d.before),
                            after: f(&d.after),
                        })
                        .collect(),
                ),
                BlockContent::Control(c) => {
                    let mapped = Instr::Control(c.clone()).map_annotations(f);
                    match mapped {
                        Instr::Control(c) => BlockContent::Control(c),
                        Instr::Data(_) => unreachable!("control instruction mapped to data"),
                    }
                }
                BlockContent::Merge(l) => BlockContent::Merge(*l),
            };
            basic_blocks.insert(
                *idx,
                BasicBlock {
                    idx: *idx,
                    content,
                    before: f(&block.before),
                    after: f(&block.after),
                },
            );
        }
        let mut cfg = Cfg {
            func_idx: self.func_idx,
            exported: self.exported,
            name: self.name.clone(),
            global_types: self.global_types.clone(),
            arg_types: self.arg_types.clone(),
            local_types: self.local_types.clone(),
            return_types: self.return_types.clone(),
            basic_blocks,
            instructions: BTreeMap::new(),
            edges: self.edges.clone(),
            back_edges: self.back_edges.clone(),
            entry_block: self.entry_block,
            exit_block: self.exit_block,
            loop_heads: self.loop_heads.clone(),
        };
        cfg.rebuild_instruction_map();
        cfg
    }

    /// Same skeleton with unit annotations.
    pub fn clear_annotations(&self) -> Cfg<()> {
        self.map_annotations(&mut |_| ())
    }

    /// Recompute the label → instruction map from the block contents.
    pub fn rebuild_instruction_map(&mut self) {
        let mut instructions = BTreeMap::new();
        for block in self.basic_blocks.values() {
            match &block.content {
                BlockContent::Data(instrs) => {
                    for d in instrs {
                        instructions.insert(d.label, Instr::Data(d.clone()));
                    }
                }
                BlockContent::Control(c) => {
                    instructions.insert(c.label, Instr::Control(c.clone()));
                }
                BlockContent::Merge(l) => {
                    instructions.insert(
                        *l,
                        Instr::Control(ControlInstr {
                            label: *l,
                            op: Control::Merge,
                            before: block.before.clone(),
                            after: block.after.clone(),
                        }),
                    );
                }
            }
        }
        self.instructions = instructions;
    }

    /// Block containing the instruction with the given label.
    pub fn block_of(&self, label: Label) -> Result<BlockId> {
        for (idx, block) in &self.basic_blocks {
            if block.labels().contains(&label) {
                return Ok(*idx);
            }
        }
        bail!(
            "instruction {} does not belong to any block of function {}",
            label,
            self.func_idx
        )
    }

    /// Structural invariants: edge endpoints exist, joins are merge blocks,
    /// every carried label is in the instruction map, the exit has no
    /// successor and the entry no predecessor.
    pub fn validate(&self) -> Result<()> {
        for (src, outs) in &self.edges {
            if !self.basic_blocks.contains_key(src) {
                bail!("edge source {} is not a block", src);
            }
            for (dst, _) in outs {
                if !self.basic_blocks.contains_key(dst) {
                    bail!("edge target {} (from {}) is not a block", dst, src);
                }
            }
        }
        for (idx, block) in &self.basic_blocks {
            if self.in_degree(*idx) > 1 && !block.is_merge() {
                bail!("block {} has in-degree > 1 but is not a merge block", idx);
            }
            for label in block.labels() {
                if !self.instructions.contains_key(&label) {
                    bail!("label {} of block {} missing from instruction map", label, idx);
                }
            }
        }
        if !self.successors(self.exit_block).is_empty() {
            bail!("exit block {} has outgoing edges", self.exit_block);
        }
        if self.in_degree(self.entry_block) != 0 {
            bail!("entry block {} has incoming edges", self.entry_block);
        }
        Ok(())
    }

    // ─── Dot output ──────────────────────────────────────────────────────

    /// Graphviz rendering: one record per block with its instruction text
    /// (and the annotation `show` chooses to expose), edges labelled with
    /// their branch tag.
    pub fn to_dot(&self, show: impl Fn(&A) -> Option<String>) -> String {
        let mut out = String::new();
        writeln!(out, "digraph \"{}\" {{", self.name).unwrap();
        writeln!(out, "    {{rank=min; {}}}", self.entry_block).unwrap();
        for (idx, block) in &self.basic_blocks {
            let mut lines: Vec<String> = Vec::new();
            match &block.content {
                BlockContent::Data(instrs) => {
                    for d in instrs {
                        lines.push(format!("{}: {}", d.label, d.op));
                    }
                }
                BlockContent::Control(c) => {
                    lines.push(format!("{}: {}", c.label, c.op.mnemonic()));
                }
                BlockContent::Merge(l) => lines.push(format!("{}: merge", l)),
            }
            if let Some(annot) = show(&block.after) {
                lines.push(annot);
            }
            let body = lines.join("\\l");
            writeln!(
                out,
                "    {} [shape=record, label=\"{{{}|{}\\l}}\"]",
                idx,
                idx,
                body.replace('{', "\\{").replace('}', "\\}")
            )
            .unwrap();
        }
        for (src, outs) in &self.edges {
            for (dst, tag) in outs {
                match tag {
                    Some(true) => {
                        writeln!(out, "    {} -> {} [label=\"t\"]", src, dst).unwrap()
                    }
                    Some(false) => {
                        writeln!(out, "    {} -> {} [label=\"f\"]", src, dst).unwrap()
                    }
                    None => writeln!(out, "    {} -> {}", src, dst).unwrap(),
                }
            }
        }
        writeln!(out, "}}").unwrap();
        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
