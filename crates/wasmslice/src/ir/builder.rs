//! CFG construction: lowers the nested instruction tree into a basic-block
//! graph with explicit merge nodes.
//!
//! ## Algorithm
//!
//! A single recursive pass over the structured body. Straight-line data
//! instructions accumulate into one data block; every control instruction
//! flushes the accumulator and decides the out-edges:
//!
//! - `block body` — the body flows into a fresh merge continuation; `br n`
//!   inside redirects to that continuation.
//! - `loop body` — a merge block is created as the loop head (and marked as
//!   such); the body falls through to whatever follows; `br n` inside
//!   targets the head.
//! - `if` — the `if` instruction becomes a singleton control block with a
//!   true edge into the then-arm and a false edge into the else-arm; both
//!   arms flow into a common merge continuation.
//! - `br`/`br_if`/`br_table` — resolved against the stack of enclosing
//!   continuations; a depth beyond the stack is a function-level exit.
//! - `return`/`unreachable` — a single edge to the exit block.
//! - `call`/`call_indirect` — singleton control blocks with one successor.
//!
//! The exit block is a merge block created last; the entry block has
//! in-degree 0 (a synthetic merge entry is prepended in the rare case where
//! the first real block is a branch target).
//!
//! Instructions after an unconditional transfer are statically dead and are
//! not lowered.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

use super::cfg::{BasicBlock, BlockContent, Cfg};
use super::types::{
    BlockId, Control, ControlInstr, DataInstr, Instr, LabelFactory, ValType,
};

/// Function-level metadata the builder copies onto the CFG record.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub func_idx: u32,
    pub exported: bool,
    pub name: String,
    pub global_types: Vec<ValType>,
    pub arg_types: Vec<ValType>,
    pub local_types: Vec<ValType>,
    pub return_types: Vec<ValType>,
}

/// Enclosing branch target: the continuation of a `block`/`if`, or the head
/// of a `loop`.
#[derive(Debug, Clone, Copy)]
struct BreakTarget {
    block: BlockId,
}

/// Where control leaves a lowered sequence, if it can fall through at all,
/// together with the tag the outgoing edge must carry (`Some(false)` after
/// a `br_if`).
#[derive(Debug, Clone, Copy)]
struct Fallthrough {
    block: BlockId,
    tag: Option<bool>,
}

/// Result of lowering one instruction sequence.
struct SeqResult {
    /// Entry block of the sequence; `None` when the sequence emitted no
    /// block (empty body).
    first: Option<BlockId>,
    /// Fallthrough out of the sequence; `None` when it ends in an
    /// unconditional transfer.
    fallthrough: Option<Fallthrough>,
}

struct CfgBuilder<'a> {
    blocks: BTreeMap<BlockId, BasicBlock<()>>,
    edges: Vec<(BlockId, BlockId, Option<bool>)>,
    loop_heads: BTreeSet<BlockId>,
    /// Edges into the (not yet created) exit block, with their tag.
    pending_exits: Vec<(BlockId, Option<bool>)>,
    next_block: u32,
    factory: &'a mut LabelFactory,
}

impl<'a> CfgBuilder<'a> {
    fn new(factory: &'a mut LabelFactory) -> Self {
        Self {
            blocks: BTreeMap::new(),
            edges: Vec::new(),
            loop_heads: BTreeSet::new(),
            pending_exits: Vec::new(),
            next_block: 0,
            factory,
        }
    }

    fn alloc(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    fn new_merge_block(&mut self) -> BlockId {
        let idx = self.alloc();
        let label = self.factory.merge();
        self.blocks.insert(
            idx,
            BasicBlock {
                idx,
                content: BlockContent::Merge(label),
                before: (),
                after: (),
            },
        );
        idx
    }

    fn new_data_block(&mut self, instrs: Vec<DataInstr<()>>) -> BlockId {
        let idx = self.alloc();
        self.blocks.insert(
            idx,
            BasicBlock {
                idx,
                content: BlockContent::Data(instrs),
                before: (),
                after: (),
            },
        );
        idx
    }

    fn new_control_block(&mut self, instr: ControlInstr<()>) -> BlockId {
        let idx = self.alloc();
        self.blocks.insert(
            idx,
            BasicBlock {
                idx,
                content: BlockContent::Control(instr),
                before: (),
                after: (),
            },
        );
        idx
    }

    fn edge(&mut self, src: BlockId, dst: BlockId, tag: Option<bool>) {
        self.edges.push((src, dst, tag));
    }

    /// Connect the current fallthrough (if any) to `next`.
    fn link(&mut self, from: Option<Fallthrough>, next: BlockId) {
        if let Some(ft) = from {
            self.edge(ft.block, next, ft.tag);
        }
    }

    /// Resolve a branch depth against the break stack; `None` means the
    /// branch leaves the function.
    fn branch_target(&self, breaks: &[BreakTarget], depth: u32) -> Option<BlockId> {
        let depth = depth as usize;
        if depth < breaks.len() {
            Some(breaks[breaks.len() - 1 - depth].block)
        } else {
            None
        }
    }

    /// Lower one nested sequence. `breaks` is the stack of enclosing branch
    /// targets, innermost last.
    fn build_seq(
        &mut self,
        instrs: &[Instr<()>],
        breaks: &mut Vec<BreakTarget>,
    ) -> Result<SeqResult> {
        let mut first: Option<BlockId> = None;
        let mut prev: Option<Fallthrough> = None;
        let mut pending_data: Vec<DataInstr<()>> = Vec::new();

        // Appends a freshly created block into the chain.
        macro_rules! chain {
            ($builder:expr, $idx:expr, $prev:expr, $first:expr) => {{
                let idx = $idx;
                $builder.link($prev, idx);
                if $first.is_none() {
                    *$first = Some(idx);
                }
                idx
            }};
        }

        for instr in instrs {
            match instr {
                Instr::Data(d) => pending_data.push(d.clone()),
                Instr::Control(c) => {
                    if !pending_data.is_empty() {
                        let data = std::mem::take(&mut pending_data);
                        let idx = self.new_data_block(data);
                        let idx = chain!(self, idx, prev.take(), &mut first);
                        prev = Some(Fallthrough {
                            block: idx,
                            tag: None,
                        });
                    }
                    match &c.op {
                        Control::Block { body, .. } => {
                            let cont = self.new_merge_block();
                            breaks.push(BreakTarget { block: cont });
                            let inner = self.build_seq(body, breaks)?;
                            breaks.pop();
                            match inner.first {
                                Some(inner_first) => {
                                    self.link(prev.take(), inner_first);
                                    if first.is_none() {
                                        first = Some(inner_first);
                                    }
                                    self.link(inner.fallthrough, cont);
                                }
                                None => {
                                    self.link(prev.take(), cont);
                                    if first.is_none() {
                                        first = Some(cont);
                                    }
                                }
                            }
                            prev = Some(Fallthrough {
                                block: cont,
                                tag: None,
                            });
                        }
                        Control::Loop { body, .. } => {
                            let head = self.new_merge_block();
                            self.loop_heads.insert(head);
                            self.link(prev.take(), head);
                            if first.is_none() {
                                first = Some(head);
                            }
                            breaks.push(BreakTarget { block: head });
                            let inner = self.build_seq(body, breaks)?;
                            breaks.pop();
                            match inner.first {
                                Some(inner_first) => {
                                    self.edge(head, inner_first, None);
                                    prev = inner.fallthrough;
                                }
                                // Empty loop body falls straight through.
                                None => {
                                    prev = Some(Fallthrough {
                                        block: head,
                                        tag: None,
                                    })
                                }
                            }
                        }
                        Control::If {
                            block_type,
                            arity,
                            then_body,
                            else_body,
                        } => {
                            // The kept control instruction carries empty
                            // bodies; the arms live in the graph.
                            let cond = self.new_control_block(ControlInstr {
                                label: c.label,
                                op: Control::If {
                                    block_type: *block_type,
                                    arity: *arity,
                                    then_body: Vec::new(),
                                    else_body: Vec::new(),
                                },
                                before: (),
                                after: (),
                            });
                            self.link(prev.take(), cond);
                            if first.is_none() {
                                first = Some(cond);
                            }
                            let cont = self.new_merge_block();
                            breaks.push(BreakTarget { block: cont });
                            let then_seq = self.build_seq(then_body, breaks)?;
                            match then_seq.first {
                                Some(f) => {
                                    self.edge(cond, f, Some(true));
                                    self.link(then_seq.fallthrough, cont);
                                }
                                None => self.edge(cond, cont, Some(true)),
                            }
                            let else_seq = self.build_seq(else_body, breaks)?;
                            match else_seq.first {
                                Some(f) => {
                                    self.edge(cond, f, Some(false));
                                    self.link(else_seq.fallthrough, cont);
                                }
                                None => self.edge(cond, cont, Some(false)),
                            }
                            breaks.pop();
                            prev = Some(Fallthrough {
                                block: cont,
                                tag: None,
                            });
                        }
                        Control::Call { .. } | Control::CallIndirect { .. } => {
                            let idx = self.new_control_block(c.clone());
                            let idx = chain!(self, idx, prev.take(), &mut first);
                            prev = Some(Fallthrough {
                                block: idx,
                                tag: None,
                            });
                        }
                        Control::Br(depth) => {
                            let idx = self.new_control_block(c.clone());
                            let idx = chain!(self, idx, prev.take(), &mut first);
                            match self.branch_target(breaks, *depth) {
                                Some(target) => self.edge(idx, target, None),
                                None => self.pending_exits.push((idx, None)),
                            }
                            // Everything after an unconditional branch is
                            // statically dead.
                            return Ok(SeqResult {
                                first,
                                fallthrough: None,
                            });
                        }
                        Control::BrIf(depth) => {
                            let idx = self.new_control_block(c.clone());
                            let idx = chain!(self, idx, prev.take(), &mut first);
                            match self.branch_target(breaks, *depth) {
                                Some(target) => self.edge(idx, target, Some(true)),
                                None => self.pending_exits.push((idx, Some(true))),
                            }
                            prev = Some(Fallthrough {
                                block: idx,
                                tag: Some(false),
                            });
                        }
                        Control::BrTable { targets, default } => {
                            let idx = self.new_control_block(c.clone());
                            let idx = chain!(self, idx, prev.take(), &mut first);
                            for depth in targets.iter().chain(std::iter::once(default)) {
                                match self.branch_target(breaks, *depth) {
                                    Some(target) => self.edge(idx, target, None),
                                    None => self.pending_exits.push((idx, None)),
                                }
                            }
                            return Ok(SeqResult {
                                first,
                                fallthrough: None,
                            });
                        }
                        Control::Return | Control::Unreachable => {
                            let idx = self.new_control_block(c.clone());
                            let idx = chain!(self, idx, prev.take(), &mut first);
                            self.pending_exits.push((idx, None));
                            return Ok(SeqResult {
                                first,
                                fallthrough: None,
                            });
                        }
                        Control::Merge => {
                            bail!("merge instruction in input body (label {})", c.label)
                        }
                    }
                }
            }
        }

        if !pending_data.is_empty() {
            let data = std::mem::take(&mut pending_data);
            let idx = self.new_data_block(data);
            self.link(prev.take(), idx);
            if first.is_none() {
                first = Some(idx);
            }
            prev = Some(Fallthrough {
                block: idx,
                tag: None,
            });
        }

        Ok(SeqResult {
            first,
            fallthrough: prev,
        })
    }
}

/// Lower a function body into a CFG satisfying the structural invariants.
pub fn build_cfg(
    ctx: FunctionContext,
    body: &[Instr<()>],
    factory: &mut LabelFactory,
) -> Result<Cfg<()>> {
    let mut builder = CfgBuilder::new(factory);
    let mut breaks = Vec::new();
    let seq = builder.build_seq(body, &mut breaks)?;

    let exit = builder.new_merge_block();
    if let Some(ft) = seq.fallthrough {
        builder.edge(ft.block, exit, ft.tag);
    }
    for (idx, tag) in std::mem::take(&mut builder.pending_exits) {
        builder.edge(idx, exit, tag);
    }

    let entry = seq.first.unwrap_or(exit);

    let mut cfg = Cfg {
        func_idx: ctx.func_idx,
        exported: ctx.exported,
        name: ctx.name,
        global_types: ctx.global_types,
        arg_types: ctx.arg_types,
        local_types: ctx.local_types,
        return_types: ctx.return_types,
        basic_blocks: builder.blocks,
        instructions: BTreeMap::new(),
        edges: BTreeMap::new(),
        back_edges: BTreeMap::new(),
        entry_block: entry,
        exit_block: exit,
        loop_heads: builder.loop_heads,
    };
    for (src, dst, tag) in builder.edges {
        cfg.add_edge(src, dst, tag);
    }

    // A body that opens with a loop makes the natural first block a branch
    // target; prepend a synthetic entry so the entry keeps in-degree 0.
    if cfg.in_degree(entry) > 0 {
        let fresh = cfg.next_block_id();
        let label = factory.merge();
        cfg.basic_blocks.insert(
            fresh,
            BasicBlock {
                idx: fresh,
                content: BlockContent::Merge(label),
                before: (),
                after: (),
            },
        );
        cfg.add_edge(fresh, entry, None);
        cfg.entry_block = fresh;
    }

    cfg.rebuild_instruction_map();
    cfg.validate()?;
    Ok(cfg)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::translate::{translate_body, TranslationContext};
    use crate::ir::types::{Label, Section};
    use wasmparser::{BlockType, Operator};

    fn ctx() -> FunctionContext {
        FunctionContext {
            func_idx: 0,
            exported: false,
            name: "f".to_string(),
            global_types: vec![],
            arg_types: vec![],
            local_types: vec![],
            return_types: vec![],
        }
    }

    fn build(ops: Vec<Operator>) -> Cfg<()> {
        let mut factory = LabelFactory::new();
        let body =
            translate_body(&ops, &mut factory, &TranslationContext::default()).unwrap();
        build_cfg(ctx(), &body, &mut factory).unwrap()
    }

    fn function_label(id: u32) -> Label {
        Label {
            section: Section::Function,
            id,
        }
    }

    #[test]
    fn straight_line_is_one_data_block_plus_exit() {
        let cfg = build(vec![
            Operator::MemorySize { mem: 0 },
            Operator::Drop,
            Operator::End,
        ]);
        assert_eq!(cfg.basic_blocks.len(), 2);
        let entry = cfg.find_block(cfg.entry_block).unwrap();
        match &entry.content {
            BlockContent::Data(instrs) => assert_eq!(instrs.len(), 2),
            other => panic!("expected data block, got {:?}", other),
        }
        assert_eq!(cfg.successors(cfg.entry_block), &[(cfg.exit_block, None)]);
        assert!(cfg.find_block(cfg.exit_block).unwrap().is_merge());
    }

    #[test]
    fn if_diamond_has_tagged_edges_and_merge() {
        let cfg = build(vec![
            Operator::MemorySize { mem: 0 },
            Operator::If {
                blockty: BlockType::Empty,
            },
            Operator::Nop,
            Operator::Else,
            Operator::Nop,
            Operator::End,
            Operator::End,
        ]);
        // data, if, merge cont, then, else, exit
        assert_eq!(cfg.basic_blocks.len(), 6);
        let cond = BlockId(1);
        let succs = cfg.successors(cond);
        assert_eq!(succs.len(), 2);
        assert!(succs.iter().any(|(_, t)| *t == Some(true)));
        assert!(succs.iter().any(|(_, t)| *t == Some(false)));
        // Both arms end in the same merge block.
        let join: Vec<BlockId> = succs
            .iter()
            .flat_map(|(arm, _)| cfg.successors(*arm).iter().map(|(d, _)| *d))
            .collect();
        assert_eq!(join[0], join[1]);
        assert!(cfg.find_block(join[0]).unwrap().is_merge());
        cfg.validate().unwrap();
    }

    #[test]
    fn empty_if_arms_connect_straight_to_merge() {
        let cfg = build(vec![
            Operator::MemorySize { mem: 0 },
            Operator::If {
                blockty: BlockType::Empty,
            },
            Operator::End,
            Operator::End,
        ]);
        let cond = BlockId(1);
        let succs = cfg.successors(cond);
        assert_eq!(succs.len(), 2);
        // Both tags lead to the same merge block: duplicated edge pair.
        assert_eq!(succs[0].0, succs[1].0);
        cfg.validate().unwrap();
    }

    #[test]
    fn loop_head_is_marked_and_receives_back_edge() {
        let cfg = build(vec![
            Operator::Nop,
            Operator::Loop {
                blockty: BlockType::Empty,
            },
            Operator::MemorySize { mem: 0 },
            Operator::BrIf { relative_depth: 0 },
            Operator::End,
            Operator::End,
        ]);
        assert_eq!(cfg.loop_heads.len(), 1);
        let head = *cfg.loop_heads.iter().next().unwrap();
        assert!(cfg.find_block(head).unwrap().is_merge());
        // The br_if block branches back to the head on true.
        let br_block = cfg
            .basic_blocks
            .iter()
            .find_map(|(idx, b)| match &b.content {
                BlockContent::Control(c) => {
                    matches!(c.op, Control::BrIf(_)).then_some(*idx)
                }
                _ => None,
            })
            .unwrap();
        assert!(cfg
            .successors(br_block)
            .contains(&(head, Some(true))));
        cfg.validate().unwrap();
    }

    #[test]
    fn return_and_trailing_code_goes_to_exit_only() {
        let cfg = build(vec![
            Operator::Return,
            Operator::Nop, // dead
            Operator::End,
        ]);
        let entry = cfg.find_block(cfg.entry_block).unwrap();
        match &entry.content {
            BlockContent::Control(c) => assert!(matches!(c.op, Control::Return)),
            other => panic!("expected control block, got {:?}", other),
        }
        assert_eq!(cfg.successors(cfg.entry_block), &[(cfg.exit_block, None)]);
        // The dead nop was not lowered.
        assert!(!cfg.instructions.contains_key(&function_label(1)));
    }

    #[test]
    fn body_opening_with_loop_gets_synthetic_entry() {
        let cfg = build(vec![
            Operator::Loop {
                blockty: BlockType::Empty,
            },
            Operator::MemorySize { mem: 0 },
            Operator::BrIf { relative_depth: 0 },
            Operator::End,
            Operator::End,
        ]);
        assert_eq!(cfg.in_degree(cfg.entry_block), 0);
        cfg.validate().unwrap();
    }

    #[test]
    fn nested_block_br_targets_continuation() {
        let cfg = build(vec![
            Operator::Block {
                blockty: BlockType::Empty,
            },
            Operator::MemorySize { mem: 0 },
            Operator::BrIf { relative_depth: 0 },
            Operator::Nop,
            Operator::End,
            Operator::Nop,
            Operator::End,
        ]);
        cfg.validate().unwrap();
        // The br_if true edge and the inner fallthrough both reach the
        // block continuation, which is therefore a merge with in-degree 2.
        let merge_with_two = cfg
            .basic_blocks
            .values()
            .find(|b| b.is_merge() && cfg.in_degree(b.idx) == 2);
        assert!(merge_with_two.is_some());
    }
}
