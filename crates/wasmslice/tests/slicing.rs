//! End-to-end slicing scenarios over modules assembled from text.

use std::collections::BTreeSet;

use wasmslice::analysis::spec::{count_vars, Spec};
use wasmslice::analysis::summary::Summaries;
use wasmslice::analysis::usedef::{use_def_chains, Definition};
use wasmslice::ir::{Cfg, Label, Section, Var};
use wasmslice::parser::parse_wasm;
use wasmslice::slice::{instructions_to_keep, slice, validate_slice};
use wasmslice::{annotate, build_cfgs, AnalysisOptions};

fn annotated_cfg(wat_text: &str, func: usize) -> Cfg<Spec> {
    let bytes = wat::parse_str(wat_text).expect("valid wat");
    let module = parse_wasm(&bytes).expect("parseable module");
    let cfgs = build_cfgs(&module).expect("buildable CFGs");
    annotate(&cfgs[func], &AnalysisOptions::default(), &Summaries::new())
        .expect("annotatable function")
}

fn label(id: u32) -> Label {
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
fn arithmetic_chain_slice_keeps_its_producers_only() {
    // Labels: 0 memory.size, 1 memory.size, 2 i32.add (criterion), 3 drop,
    // 4 memory.size, 5 memory.size, 6 i32.add, 7 drop.
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               memory.size
               i32.add
               drop
               memory.size
               memory.size
               i32.add
               drop))"#,
        0,
    );
    let kept = instructions_to_keep(&cfg, label(2), &AnalysisOptions::default(), &Summaries::new()).unwrap();
    assert_eq!(kept_function_ids(&kept), BTreeSet::from([0, 1, 2]));
}

#[test]
fn use_def_chains_of_parameter_addition() {
    let cfg = annotated_cfg(
        r#"(module
             (func (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.add))"#,
        0,
    );
    let chains = use_def_chains(&cfg, &AnalysisOptions::default()).unwrap();
    let add = label(2);
    assert_eq!(
        chains.get(&(add, Var::Local(0))),
        Some(&Definition::Entry(Var::Local(0)))
    );
    assert_eq!(
        chains.get(&(add, Var::Local(1))),
        Some(&Definition::Entry(Var::Local(1)))
    );
    // The final merge (the exit block) uses the addition's value.
    let exit_label = cfg.find_block(cfg.exit_block).unwrap().labels()[0];
    assert_eq!(
        chains.get(&(exit_label, Var::Instr(add))),
        Some(&Definition::Instruction(add, Var::Instr(add)))
    );
}

#[test]
fn diamond_slice_keeps_the_branch_and_both_arms() {
    // Labels: 0 memory.size, 1 if, 2 then memory.size, 3 else memory.size,
    // 4..7 unrelated arithmetic, 8 memory.size, 9 i32.add (criterion).
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               if (result i32)
                 memory.size
               else
                 memory.size
               end
               memory.size
               memory.size
               i32.add
               drop
               memory.size
               i32.add
               drop))"#,
        0,
    );
    let kept = instructions_to_keep(&cfg, label(9), &AnalysisOptions::default(), &Summaries::new()).unwrap();
    assert_eq!(kept_function_ids(&kept), BTreeSet::from([0, 1, 2, 3, 8, 9]));
    assert_eq!(kept.iter().filter(|l| l.is_merge()).count(), 1);
    for dropped in [4, 5, 6, 7] {
        assert!(!kept.contains(&label(dropped)));
    }
}

#[test]
fn load_slice_includes_the_store_by_memory_dependence() {
    // Labels: 0 memory.size, 1 memory.size, 2 i32.store, 3 memory.size,
    // 4 i32.load (criterion).
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               memory.size
               i32.store
               memory.size
               i32.load
               drop))"#,
        0,
    );
    let kept = instructions_to_keep(&cfg, label(4), &AnalysisOptions::default(), &Summaries::new()).unwrap();
    assert!(kept.contains(&label(2)), "store must enter the slice");
    assert!(kept.contains(&label(0)));
    assert!(kept.contains(&label(1)));
    assert!(kept.contains(&label(3)));
}

#[test]
fn unrelated_chain_is_absent_from_the_sliced_instruction_map() {
    // Labels: 0/1 consts, 2 add (criterion), 3 drop, 4/5 consts, 6 add,
    // 7 drop.
    let cfg = annotated_cfg(
        r#"(module
             (func
               i32.const 0
               i32.const 1
               i32.add
               drop
               i32.const 2
               i32.const 3
               i32.add
               drop))"#,
        0,
    );
    let options = AnalysisOptions::default();
    let sliced = slice(&cfg, label(2), &options, &Summaries::new()).unwrap();
    for id in [4, 5, 6] {
        assert!(
            !sliced.instructions.contains_key(&label(id)),
            "label {} must be gone",
            id
        );
    }
    assert!(sliced.instructions.contains_key(&label(2)));
    validate_slice(&sliced, &options, &Summaries::new()).unwrap();
}

#[test]
fn slice_of_a_loop_keeps_the_loop_condition() {
    // countdown: decrement local 0 until zero, then produce a result.
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func (param i32) (result i32)
               loop
                 local.get 0
                 i32.const 1
                 i32.sub
                 local.set 0
                 local.get 0
                 br_if 0
               end
               memory.size))"#,
        0,
    );
    let options = AnalysisOptions::default();
    // Criterion: the memory.size after the loop (label 7).
    let sliced = slice(&cfg, label(7), &options, &Summaries::new()).unwrap();
    let annotated = validate_slice(&sliced, &options, &Summaries::new()).unwrap();
    // The loop skeleton survives: its back-edge branch and the head.
    assert!(sliced.instructions.contains_key(&label(6)), "br_if survives");
    assert!(annotated.loop_heads.len() == 1);
}

#[test]
fn sliced_cfg_re_annotates_and_stays_stack_valid() {
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func (result i32)
               memory.size
               if (result i32)
                 memory.size
                 memory.size
                 i32.add
               else
                 memory.size
               end
               memory.size
               drop))"#,
        0,
    );
    let options = AnalysisOptions::default();
    for criterion in [0u32, 2, 4, 5] {
        let sliced = slice(&cfg, label(criterion), &options, &Summaries::new()).unwrap();
        validate_slice(&sliced, &options, &Summaries::new())
            .unwrap_or_else(|e| panic!("criterion {}: {:#}", criterion, e));
    }
}

#[test]
fn slicing_the_same_criterion_twice_is_isomorphic() {
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               if
                 memory.size
                 drop
               end))"#,
        0,
    );
    let options = AnalysisOptions::default();
    let first = slice(&cfg, label(2), &options, &Summaries::new()).unwrap();
    let second = slice(&cfg, label(2), &options, &Summaries::new()).unwrap();
    assert_eq!(first.basic_blocks, second.basic_blocks);
    assert_eq!(first.edges, second.edges);
    assert_eq!(first.entry_block, second.entry_block);
    assert_eq!(first.exit_block, second.exit_block);
}

#[test]
fn removed_entry_keeps_the_net_stack_effect() {
    // The entry block only feeds the unrelated left operand; slicing on
    // the right operand's producer keeps the entry as dummies with the
    // same net effect (one pushed value).
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               if
                 nop
               end
               memory.size
               drop))"#,
        0,
    );
    let options = AnalysisOptions::default();
    // Criterion: the memory.size after the if (label 3).
    let sliced = slice(&cfg, label(3), &options, &Summaries::new()).unwrap();
    let annotated = validate_slice(&sliced, &options, &Summaries::new()).unwrap();
    assert_eq!(annotated.entry_block, cfg.entry_block);
}

#[test]
fn call_indirect_slice_strictly_reduces_variables() {
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (table 2 funcref)
             (type $t (func (result i32)))
             (func $target (result i32) i32.const 7)
             (elem (i32.const 0) $target)
             (func $main
               memory.size
               memory.size
               i32.add
               drop
               i32.const 0
               call_indirect (type $t)
               drop))"#,
        1,
    );
    let options = AnalysisOptions::default();
    // Criterion: the call_indirect (label 5).
    let sliced = slice(&cfg, label(5), &options, &Summaries::new()).unwrap();
    let re_annotated = validate_slice(&sliced, &options, &Summaries::new()).unwrap();
    assert!(count_vars(&re_annotated) < count_vars(&cfg));
}

#[test]
fn br_table_function_slices_cleanly() {
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               block
                 block
                   memory.size
                   br_table 0 1 0
                 end
                 memory.size
                 drop
               end
               memory.size
               drop))"#,
        0,
    );
    let options = AnalysisOptions::default();
    // Criterion: the trailing memory.size (label 6).
    let sliced = slice(&cfg, label(6), &options, &Summaries::new()).unwrap();
    validate_slice(&sliced, &options, &Summaries::new()).unwrap();
}

#[test]
fn every_nondummy_survivor_of_a_data_slice_is_in_the_closure() {
    let cfg = annotated_cfg(
        r#"(module
             (memory 1)
             (func
               memory.size
               memory.size
               i32.add
               drop
               memory.size
               drop))"#,
        0,
    );
    let options = AnalysisOptions::default();
    let kept = instructions_to_keep(&cfg, label(2), &options, &Summaries::new()).unwrap();
    let sliced = slice(&cfg, label(2), &options, &Summaries::new()).unwrap();
    for label in sliced.instructions.keys() {
        match label.section {
            Section::Dummy | Section::Merge => {}
            _ => assert!(kept.contains(label), "{} escaped the closure", label),
        }
    }
}
