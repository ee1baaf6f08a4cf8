//! Memory dependences: which stores may feed each load.
//!
//! A store is a predecessor of a load when the store can execute before the
//! load, their byte ranges cannot be told apart in the abstract domain, and
//! the memory formula at the load does not prove the store overwritten.
//! Addresses are resolved to symbolic `Value`s through the use-def
//! relation (bounded depth, merge variables degrade to top; call results
//! resolve through the callee's summary), simplified, and compared with
//! `may_overlap`: equal expressions alias, constants at least a word apart
//! do not, everything else is conservatively included. The points-to
//! formula carried by the `Spec` annotation then filters stores whose own
//! precise address is mapped to a different value at the load: a later
//! store to exactly that address overwrote them on every path.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::analysis::domain::{
    may_overlap, AbstractByte, ByteInValue, MemoryFormula, SymOp, Value,
};
use crate::analysis::spec::{var_value, Spec};
use crate::analysis::summary::Summaries;
use crate::ir::{
    BinaryOp, BlockContent, BlockId, Cfg, Control, Data, DataInstr, Instr, Label, Var,
};

/// Resolution depth for symbolic addresses; beyond it everything is top.
const MAX_RESOLVE_DEPTH: usize = 32;

/// Resolve the symbolic value of an SSA variable by walking its defining
/// instructions. Call results are instantiated from the callee's summary
/// via `Summary::apply`.
pub fn symbolic_value(cfg: &Cfg<Spec>, summaries: &Summaries, var: Var, depth: usize) -> Value {
    if depth >= MAX_RESOLVE_DEPTH {
        return Value::Open;
    }
    match var {
        Var::Const(p) => Value::constant(p.as_i64()),
        Var::Local(i) => {
            // Parameters are symbolic inputs; declared locals start at zero.
            if (i as usize) < cfg.arg_types.len() {
                Value::parameter(i as usize)
            } else {
                Value::constant(0)
            }
        }
        Var::Global(i) => Value::global(i as usize),
        Var::Merge(_, _) => Value::Open,
        Var::Instr(label) => match cfg.find_instr(label) {
            Ok(Instr::Data(d)) => symbolic_data_value(cfg, summaries, d, depth),
            Ok(Instr::Control(c)) => match &c.op {
                Control::Call { arity, index } => {
                    symbolic_call_value(cfg, summaries, c, *arity, *index, depth)
                }
                _ => Value::Open,
            },
            Err(_) => Value::Open,
        },
    }
}

fn symbolic_data_value(
    cfg: &Cfg<Spec>,
    summaries: &Summaries,
    d: &DataInstr<Spec>,
    depth: usize,
) -> Value {
    let resolve = |v: Result<Var>| match v {
        Ok(v) => symbolic_value(cfg, summaries, v, depth + 1),
        Err(_) => Value::Open,
    };
    match &d.op {
        Data::Const(p) => Value::constant(p.as_i64()),
        Data::LocalGet(i) => resolve(Ok(d.before.locals[*i as usize])),
        Data::GlobalGet(i) => resolve(Ok(d.before.globals[*i as usize])),
        Data::Binary(b) => {
            let rhs = resolve(d.before.peek(0));
            let lhs = resolve(d.before.peek(1));
            match b.op {
                BinaryOp::Add => Value::op(SymOp::Plus, lhs, rhs),
                BinaryOp::Sub => Value::op(SymOp::Minus, lhs, rhs),
                BinaryOp::Mul => Value::op(SymOp::Times, lhs, rhs),
                _ => Value::Open,
            }
        }
        Data::Load(m) => {
            let addr = resolve(d.before.peek(0));
            Value::deref(addr.add_offset(i64::from(m.offset)))
        }
        _ => Value::Open,
    }
}

/// The abstract result of a call site, obtained by adapting the callee
/// summary with the resolved argument and global values.
fn symbolic_call_value(
    cfg: &Cfg<Spec>,
    summaries: &Summaries,
    c: &crate::ir::ControlInstr<Spec>,
    arity: (usize, usize),
    index: u32,
    depth: usize,
) -> Value {
    let summary = match summaries.get(&index) {
        Some(s) => s,
        None => return Value::Open,
    };
    let args: Vec<Value> = (0..arity.0)
        .map(|i| match c.before.peek(arity.0 - 1 - i) {
            Ok(v) => symbolic_value(cfg, summaries, v, depth + 1),
            Err(_) => Value::Open,
        })
        .collect();
    let caller_globals: Vec<Value> = c
        .before
        .globals
        .iter()
        .map(|&v| symbolic_value(cfg, summaries, v, depth + 1))
        .collect();
    let (results, _, _) = summary.apply(&args, &caller_globals);
    results.first().cloned().unwrap_or(Value::Open)
}

/// Block-level reachability: can control flow from `src` arrive at `dst`?
fn reachable(cfg: &Cfg<Spec>) -> BTreeMap<BlockId, BTreeSet<BlockId>> {
    let mut result: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
    for &start in cfg.basic_blocks.keys() {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<BlockId> = cfg.successors(start).iter().map(|(d, _)| *d).collect();
        while let Some(b) = stack.pop() {
            if seen.insert(b) {
                stack.extend(cfg.successors(b).iter().map(|(d, _)| *d));
            }
        }
        result.insert(start, seen);
    }
    result
}

struct LoadSite {
    label: Label,
    block: BlockId,
    pos: usize,
    addr: Value,
    /// Points-to formula at the load's program point.
    formula: MemoryFormula,
}

struct StoreSite {
    label: Label,
    block: BlockId,
    pos: usize,
    addr: Value,
    /// The address and value as the transfer recorded them in the formula.
    formula_addr: Value,
    formula_value: Value,
}

/// Collect all loads and stores of the function with their resolved
/// addresses.
fn memory_accesses(
    cfg: &Cfg<Spec>,
    summaries: &Summaries,
) -> (Vec<LoadSite>, Vec<StoreSite>) {
    let mut loads = Vec::new();
    let mut stores = Vec::new();
    for (&idx, block) in &cfg.basic_blocks {
        if let BlockContent::Data(instrs) = &block.content {
            for (pos, d) in instrs.iter().enumerate() {
                match &d.op {
                    Data::Load(m) => {
                        let addr_var = match d.before.peek(0) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let addr = symbolic_value(cfg, summaries, addr_var, 0)
                            .add_offset(i64::from(m.offset))
                            .simplify();
                        loads.push(LoadSite {
                            label: d.label,
                            block: idx,
                            pos,
                            addr,
                            formula: d.before.memory.clone(),
                        });
                    }
                    Data::Store(m) => {
                        let (value_var, addr_var) = match (d.before.peek(0), d.before.peek(1))
                        {
                            (Ok(value), Ok(addr)) => (value, addr),
                            _ => continue,
                        };
                        let addr = symbolic_value(cfg, summaries, addr_var, 0)
                            .add_offset(i64::from(m.offset))
                            .simplify();
                        stores.push(StoreSite {
                            label: d.label,
                            block: idx,
                            pos,
                            addr,
                            formula_addr: var_value(addr_var)
                                .add_offset(i64::from(m.offset)),
                            formula_value: var_value(value_var),
                        });
                    }
                    _ => continue,
                }
            }
        }
    }
    (loads, stores)
}

/// Does the formula at the load prove the store overwritten? Only a store
/// with a precise recorded address can be killed: an entry at exactly that
/// address carrying a different value means a later store to the same
/// address replaced it on every path.
fn overwritten_before(load: &LoadSite, store: &StoreSite) -> bool {
    if store.formula_addr == Value::Open {
        return false;
    }
    let key = ByteInValue {
        value: store.formula_addr.clone(),
        byte: 0,
    };
    match load.formula.points_to.get(&key) {
        Some(AbstractByte::Byte(b)) => b.value != store.formula_value,
        _ => false,
    }
}

/// For each load, the set of stores whose written bytes may be read by it.
pub fn memory_dependencies(
    cfg: &Cfg<Spec>,
    summaries: &Summaries,
) -> Result<BTreeMap<Label, BTreeSet<Label>>> {
    let (loads, stores) = memory_accesses(cfg, summaries);
    let reach = reachable(cfg);
    let mut deps: BTreeMap<Label, BTreeSet<Label>> = BTreeMap::new();

    for load in &loads {
        for store in &stores {
            let ordered = if store.block == load.block {
                store.pos < load.pos
                    || reach
                        .get(&store.block)
                        .is_some_and(|r| r.contains(&load.block))
            } else {
                reach
                    .get(&store.block)
                    .is_some_and(|r| r.contains(&load.block))
            };
            if !ordered {
                continue;
            }
            if !may_overlap(&store.addr, &load.addr) {
                continue;
            }
            if overwritten_before(load, store) {
                continue;
            }
            deps.entry(load.label).or_default().insert(store.label);
        }
    }
    Ok(deps)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::summary::Summary;
    use crate::analysis::transfer::annotate;
    use crate::ir::builder::{build_cfg, FunctionContext};
    use crate::ir::translate::{translate_body, TranslationContext};
    use crate::ir::types::{LabelFactory, Section, ValType};
    use crate::AnalysisOptions;
    use wasmparser::{MemArg, Operator};

    fn annotated_with(
        ops: Vec<Operator>,
        args: Vec<ValType>,
        ctx: &TranslationContext,
        summaries: &Summaries,
    ) -> Cfg<Spec> {
        let mut factory = LabelFactory::new();
        let body = translate_body(&ops, &mut factory, ctx).unwrap();
        let cfg = build_cfg(
            FunctionContext {
                func_idx: 0,
                exported: false,
                name: "f".to_string(),
                global_types: vec![],
                arg_types: args,
                local_types: vec![],
                return_types: vec![],
            },
            &body,
            &mut factory,
        )
        .unwrap();
        annotate(&cfg, &AnalysisOptions::default(), summaries).unwrap()
    }

    fn annotated(ops: Vec<Operator>, args: Vec<ValType>) -> Cfg<Spec> {
        annotated_with(
            ops,
            args,
            &TranslationContext::default(),
            &Summaries::new(),
        )
    }

    fn memarg(offset: u64) -> MemArg {
        MemArg {
            align: 2,
            max_align: 2,
            offset,
            memory: 0,
        }
    }

    fn function_label(id: u32) -> Label {
        Label {
            section: Section::Function,
            id,
        }
    }

    #[test]
    fn load_depends_on_store_at_same_unknown_address() {
        // memory.size; memory.size; i32.store; memory.size; i32.load
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::MemorySize { mem: 0 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::MemorySize { mem: 0 },
                Operator::I32Load { memarg: memarg(0) },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(4);
        let store = function_label(2);
        assert!(deps.get(&load).is_some_and(|s| s.contains(&store)));
    }

    #[test]
    fn distant_constant_addresses_do_not_alias() {
        let cfg = annotated(
            vec![
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 1 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::I32Const { value: 64 },
                Operator::I32Load { memarg: memarg(0) },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(4);
        assert!(deps.get(&load).is_none());
    }

    #[test]
    fn static_offsets_are_part_of_the_address() {
        // Store at p0+8, load at p0 offset 8: same address.
        let cfg = annotated(
            vec![
                Operator::LocalGet { local_index: 0 },
                Operator::I32Const { value: 1 },
                Operator::I32Store { memarg: memarg(8) },
                Operator::LocalGet { local_index: 0 },
                Operator::I32Load { memarg: memarg(8) },
                Operator::Drop,
                Operator::End,
            ],
            vec![ValType::I32],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(4);
        let store = function_label(2);
        assert!(deps.get(&load).is_some_and(|s| s.contains(&store)));
    }

    #[test]
    fn store_after_the_load_is_not_a_dependence() {
        let cfg = annotated(
            vec![
                Operator::I32Const { value: 0 },
                Operator::I32Load { memarg: memarg(0) },
                Operator::Drop,
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 5 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::End,
            ],
            vec![],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(1);
        assert!(deps.get(&load).is_none());
    }

    #[test]
    fn formula_kills_an_overwritten_store() {
        // Two stores to the same constant address; only the second one can
        // reach the load.
        let cfg = annotated(
            vec![
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 1 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 2 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::I32Const { value: 0 },
                Operator::I32Load { memarg: memarg(0) },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(7);
        let first_store = function_label(2);
        let second_store = function_label(5);
        let set = deps.get(&load).expect("load has dependences");
        assert!(set.contains(&second_store));
        assert!(!set.contains(&first_store), "overwritten store must be dead");
    }

    #[test]
    fn unknown_address_stores_are_never_killed() {
        // The first store's address is opaque, so the later constant store
        // cannot prove it overwritten.
        let cfg = annotated(
            vec![
                Operator::MemorySize { mem: 0 },
                Operator::I32Const { value: 1 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 2 },
                Operator::I32Store { memarg: memarg(0) },
                Operator::I32Const { value: 0 },
                Operator::I32Load { memarg: memarg(0) },
                Operator::Drop,
                Operator::End,
            ],
            vec![],
        );
        let deps = memory_dependencies(&cfg, &Summaries::new()).unwrap();
        let load = function_label(7);
        let set = deps.get(&load).expect("load has dependences");
        assert!(set.contains(&function_label(2)));
        assert!(set.contains(&function_label(5)));
    }

    #[test]
    fn symbolic_value_walks_definitions() {
        let cfg = annotated(
            vec![
                Operator::LocalGet { local_index: 0 },
                Operator::I32Const { value: 4 },
                Operator::I32Add,
                Operator::Drop,
                Operator::End,
            ],
            vec![ValType::I32],
        );
        let v = symbolic_value(&cfg, &Summaries::new(), Var::Instr(function_label(2)), 0);
        assert_eq!(
            v,
            Value::op(SymOp::Plus, Value::parameter(0), Value::constant(4))
        );
    }

    #[test]
    fn symbolic_value_resolves_calls_through_summaries() {
        // Callee returns p0 + 4; the caller passes local 0.
        let ops = vec![
            Operator::LocalGet { local_index: 0 },
            Operator::Call { function_index: 0 },
            Operator::Drop,
            Operator::End,
        ];
        let ctx = TranslationContext {
            func_arities: vec![(1, 1)],
            type_arities: vec![],
        };
        let mut summaries = Summaries::new();
        summaries.insert(
            0,
            Summary::pure_effect(
                1,
                vec![Value::op(SymOp::Plus, Value::parameter(0), Value::constant(4))],
                0,
            ),
        );
        let cfg = annotated_with(ops, vec![ValType::I32], &ctx, &summaries);
        let call_result = symbolic_value(&cfg, &summaries, Var::Instr(function_label(1)), 0);
        assert_eq!(
            call_result,
            Value::op(SymOp::Plus, Value::parameter(0), Value::constant(4))
        );
        // Without the summary the result is opaque.
        assert_eq!(
            symbolic_value(&cfg, &Summaries::new(), Var::Instr(function_label(1)), 0),
            Value::Open
        );
    }
}
