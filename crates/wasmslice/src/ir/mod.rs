//! Instruction IR and control-flow graph construction.

pub mod builder;
pub mod cfg;
pub mod translate;
pub mod types;

pub use cfg::{BasicBlock, BlockContent, Cfg, Edges};
pub use types::{
    Binary, BinaryOp, BlockId, Compare, CompareOp, Control, ControlInstr, Convert, ConvertOp,
    Data, DataInstr, Extension, Instr, Label, LabelFactory, MemOp, PackSize, Prim, Section, Test,
    TestOp, Unary, UnaryOp, ValType, Var,
};
