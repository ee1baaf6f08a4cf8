//! Function summaries: the contract a caller needs from its callees.
//!
//! A summary describes a callee in the caller's own frame of reference via
//! `Value::adapt`: `Parameter i` leaves stand for the i-th argument and
//! `Global i` leaves for the caller's global at call time. The transfer
//! function instantiates summaries through `apply` at every call site, and
//! the symbolic address resolver does the same when a call result feeds an
//! address. The inter-procedural driver that produces summaries is an
//! external collaborator; the intra-procedural analysis only requires that
//! it supply a map from function index to summary and it is monotone in
//! that input. A call site with no summary entry is treated as clobbering
//! everything.

use std::collections::BTreeMap;

use super::domain::{MemoryFormula, Value};

/// Map from function index to its summary.
pub type Summaries = BTreeMap<u32, Summary>;

/// Abstract effect of one callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Number of parameters.
    pub nargs: usize,
    /// Abstract values left on the stack, bottom of the result stack first.
    pub results: Vec<Value>,
    /// Globals after the call; `Global i` means "global i is untouched".
    pub globals: Vec<Value>,
    /// Memory writes performed by the callee, in its own frame.
    pub memory: MemoryFormula,
}

impl Summary {
    /// Summary of a callee nothing is known about: results and globals are
    /// unconstrained.
    pub fn unknown(nargs: usize, nresults: usize, nglobals: usize) -> Self {
        Summary {
            nargs,
            results: vec![Value::Open; nresults],
            globals: vec![Value::Open; nglobals],
            memory: MemoryFormula::new(),
        }
    }

    /// Summary of a callee that computes its results without touching
    /// globals or memory.
    pub fn pure_effect(nargs: usize, results: Vec<Value>, nglobals: usize) -> Self {
        Summary {
            nargs,
            results,
            globals: (0..nglobals).map(Value::global).collect(),
            memory: MemoryFormula::new(),
        }
    }

    /// Does the callee leave global `i` untouched?
    pub fn preserves_global(&self, i: usize) -> bool {
        self.globals.get(i) == Some(&Value::global(i))
    }

    /// Does the callee write memory?
    pub fn writes_memory(&self) -> bool {
        !self.memory.points_to.is_empty()
    }

    /// Instantiate the summary at a call site: substitute the caller's
    /// argument and global values into results, globals and memory.
    pub fn apply(
        &self,
        args: &[Value],
        caller_globals: &[Value],
    ) -> (Vec<Value>, Vec<Value>, MemoryFormula) {
        let results = self
            .results
            .iter()
            .map(|v| v.adapt(args, caller_globals))
            .collect();
        let globals = self
            .globals
            .iter()
            .map(|v| v.adapt(args, caller_globals))
            .collect();
        let mut memory = MemoryFormula::new();
        for (addr_byte, content) in &self.memory.points_to {
            let addr = super::domain::ByteInValue {
                value: addr_byte.value.adapt(args, caller_globals),
                byte: addr_byte.byte,
            };
            let content = match content {
                super::domain::AbstractByte::Byte(b) => {
                    super::domain::AbstractByte::Byte(super::domain::ByteInValue {
                        value: b.value.adapt(args, caller_globals),
                        byte: b.byte,
                    })
                }
                super::domain::AbstractByte::Top => super::domain::AbstractByte::Top,
            };
            memory.points_to.insert(addr, content);
        }
        (results, globals, memory)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
