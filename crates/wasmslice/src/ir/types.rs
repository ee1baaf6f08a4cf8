//! Instruction-level IR type definitions.
//!
//! Every WebAssembly instruction is represented as a labelled, annotated
//! value with either a *data* payload (stack rewrites: constants, operators,
//! local/global access, memory access) or a *control* payload (structured
//! blocks, branches, calls). The annotation slots are generic so the same
//! tree can carry no information (`()`) before analysis and a full abstract
//! state afterwards.

use std::fmt;

// ─── Labels ──────────────────────────────────────────────────────────────────

/// Module section an instruction label belongs to.
///
/// Labels from the `Merge` and `Dummy` sections never appear in the input
/// program: merges are minted by the CFG builder at join points, dummies by
/// the slicer when it pads stack shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    /// Regular function body.
    Function,
    /// Element-segment initialiser expression, tagged with the segment index.
    Elem(u32),
    /// Synthetic merge point introduced at a control-flow join.
    Merge,
    /// Synthetic padding instruction introduced by the slicer.
    Dummy,
}

/// Unique instruction identifier: a section tag plus an id that is monotonic
/// within the section. Totally ordered and hashable so it can key maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub section: Section,
    pub id: u32,
}

impl Label {
    pub fn is_dummy(&self) -> bool {
        self.section == Section::Dummy
    }

    pub fn is_merge(&self) -> bool {
        self.section == Section::Merge
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.section {
            Section::Function => write!(f, "{}", self.id),
            Section::Elem(segment) => write!(f, "e{}_{}", segment, self.id),
            Section::Merge => write!(f, "m{}", self.id),
            Section::Dummy => write!(f, "d{}", self.id),
        }
    }
}

/// Allocates labels from per-section monotonic counters.
///
/// One factory exists per function translation; the slicer creates its own
/// to mint `Dummy` labels without clashing with anything already allocated.
#[derive(Debug, Clone, Default)]
pub struct LabelFactory {
    next_function: u32,
    next_elem: u32,
    next_merge: u32,
    next_dummy: u32,
}

impl LabelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&mut self) -> Label {
        let id = self.next_function;
        self.next_function += 1;
        Label {
            section: Section::Function,
            id,
        }
    }

    pub fn elem(&mut self, segment: u32) -> Label {
        let id = self.next_elem;
        self.next_elem += 1;
        Label {
            section: Section::Elem(segment),
            id,
        }
    }

    pub fn merge(&mut self) -> Label {
        let id = self.next_merge;
        self.next_merge += 1;
        Label {
            section: Section::Merge,
            id,
        }
    }

    pub fn dummy(&mut self) -> Label {
        let id = self.next_dummy;
        self.next_dummy += 1;
        Label {
            section: Section::Dummy,
            id,
        }
    }
}

// ─── Block indices ───────────────────────────────────────────────────────────

/// Unique identifier for a basic block within one CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}", self.0)
    }
}

// ─── Value types and primitives ──────────────────────────────────────────────

/// WebAssembly value types.
///
/// Float types can occur in signatures of functions we never analyse;
/// float *operators* are rejected at translation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    pub fn from_wasmparser(vt: wasmparser::ValType) -> anyhow::Result<Self> {
        use wasmparser::ValType as V;
        match vt {
            V::I32 => Ok(ValType::I32),
            V::I64 => Ok(ValType::I64),
            V::F32 => Ok(ValType::F32),
            V::F64 => Ok(ValType::F64),
            other => anyhow::bail!("unsupported value type: {:?}", other),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
        }
    }
}

/// Primitive constant value. Integer-only: float operators are unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prim {
    I32(i32),
    I64(i64),
}

impl Prim {
    pub fn ty(&self) -> ValType {
        match self {
            Prim::I32(_) => ValType::I32,
            Prim::I64(_) => ValType::I64,
        }
    }

    /// Widened view of the constant, used by the abstract domain.
    pub fn as_i64(&self) -> i64 {
        match self {
            Prim::I32(v) => i64::from(*v),
            Prim::I64(v) => *v,
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prim::I32(v) => write!(f, "{}", v),
            Prim::I64(v) => write!(f, "{}", v),
        }
    }
}

// ─── SSA variables ───────────────────────────────────────────────────────────

/// A name for a runtime value.
///
/// `Instr` vars are minted by the instruction that defines the value and
/// carry its label; `Merge` vars are minted at a merge block for the
/// position (see `analysis::spec`) whose incoming values disagree. `Local`,
/// `Global` and `Const` name function-entry state and literal constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Var {
    Local(u32),
    Global(u32),
    Const(Prim),
    Instr(Label),
    Merge(BlockId, u32),
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Local(i) => write!(f, "l{}", i),
            Var::Global(i) => write!(f, "g{}", i),
            Var::Const(p) => write!(f, "c{}", p),
            Var::Instr(l) => write!(f, "v{}", l),
            Var::Merge(b, pos) => write!(f, "p{}_{}", b.0, pos),
        }
    }
}

// ─── Operator records ────────────────────────────────────────────────────────

/// Unary arithmetic operator, identified by its shape only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryOp {
    Clz,
    Ctz,
    Popcnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Unary {
    pub ty: ValType,
    pub op: UnaryOp,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Clz => "clz",
            UnaryOp::Ctz => "ctz",
            UnaryOp::Popcnt => "popcnt",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binary {
    pub ty: ValType,
    pub op: BinaryOp,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::DivS => "div_s",
            BinaryOp::DivU => "div_u",
            BinaryOp::RemS => "rem_s",
            BinaryOp::RemU => "rem_u",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::ShrS => "shr_s",
            BinaryOp::ShrU => "shr_u",
            BinaryOp::Rotl => "rotl",
            BinaryOp::Rotr => "rotr",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Compare {
    pub ty: ValType,
    pub op: CompareOp,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::LtS => "lt_s",
            CompareOp::LtU => "lt_u",
            CompareOp::GtS => "gt_s",
            CompareOp::GtU => "gt_u",
            CompareOp::LeS => "le_s",
            CompareOp::LeU => "le_u",
            CompareOp::GeS => "ge_s",
            CompareOp::GeU => "ge_u",
        };
        write!(f, "{}", s)
    }
}

/// Test operator (`eqz` is the only one in the MVP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestOp {
    Eqz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Test {
    pub ty: ValType,
    pub op: TestOp,
}

/// Integer conversion operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConvertOp {
    Wrap,
    ExtendS,
    ExtendU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Convert {
    pub from: ValType,
    pub to: ValType,
    pub op: ConvertOp,
}

/// Width of a packed (sub-width) memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackSize {
    P8,
    P16,
    P32,
}

/// Sign/zero extension for packed loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extension {
    Signed,
    Unsigned,
}

/// Memory operation record shared by loads and stores. Alignment is
/// intentionally discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemOp {
    pub ty: ValType,
    pub offset: u32,
    pub pack: Option<(PackSize, Extension)>,
}

// ─── Instructions ────────────────────────────────────────────────────────────

/// Data instruction payload: a pure stack/locals/globals/memory rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Nop,
    Drop,
    Select,
    MemorySize,
    MemoryGrow,
    Const(Prim),
    Unary(Unary),
    Binary(Binary),
    Compare(Compare),
    Test(Test),
    Convert(Convert),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(MemOp),
    Store(MemOp),
}

impl Data {
    /// Static (pop, push) arity of the instruction.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Data::Nop => (0, 0),
            Data::Drop => (1, 0),
            Data::Select => (3, 1),
            Data::MemorySize => (0, 1),
            Data::MemoryGrow => (1, 1),
            Data::Const(_) => (0, 1),
            Data::Unary(_) => (1, 1),
            Data::Binary(_) => (2, 1),
            Data::Compare(_) => (2, 1),
            Data::Test(_) => (1, 1),
            Data::Convert(_) => (1, 1),
            Data::LocalGet(_) => (0, 1),
            Data::LocalSet(_) => (1, 0),
            Data::LocalTee(_) => (1, 1),
            Data::GlobalGet(_) => (0, 1),
            Data::GlobalSet(_) => (1, 0),
            Data::Load(_) => (1, 1),
            Data::Store(_) => (2, 0),
        }
    }

    /// Net stack effect (push − pop).
    pub fn stack_delta(&self) -> isize {
        let (pop, push) = self.arity();
        push as isize - pop as isize
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Nop => write!(f, "nop"),
            Data::Drop => write!(f, "drop"),
            Data::Select => write!(f, "select"),
            Data::MemorySize => write!(f, "memory.size"),
            Data::MemoryGrow => write!(f, "memory.grow"),
            Data::Const(p) => write!(f, "{}.const {}", p.ty(), p),
            Data::Unary(u) => write!(f, "{}.{}", u.ty, u.op),
            Data::Binary(b) => write!(f, "{}.{}", b.ty, b.op),
            Data::Compare(c) => write!(f, "{}.{}", c.ty, c.op),
            Data::Test(t) => match t.op {
                TestOp::Eqz => write!(f, "{}.eqz", t.ty),
            },
            Data::Convert(c) => match c.op {
                ConvertOp::Wrap => write!(f, "{}.wrap_{}", c.to, c.from),
                ConvertOp::ExtendS => write!(f, "{}.extend_{}_s", c.to, c.from),
                ConvertOp::ExtendU => write!(f, "{}.extend_{}_u", c.to, c.from),
            },
            Data::LocalGet(i) => write!(f, "local.get {}", i),
            Data::LocalSet(i) => write!(f, "local.set {}", i),
            Data::LocalTee(i) => write!(f, "local.tee {}", i),
            Data::GlobalGet(i) => write!(f, "global.get {}", i),
            Data::GlobalSet(i) => write!(f, "global.set {}", i),
            Data::Load(m) => write!(f, "{}.load offset={}", m.ty, m.offset),
            Data::Store(m) => write!(f, "{}.store offset={}", m.ty, m.offset),
        }
    }
}

/// Control instruction payload. Structured constructs own their bodies;
/// after CFG construction the bodies have been lowered into blocks and the
/// control instructions kept in the graph carry empty bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control<A> {
    Block {
        block_type: Option<ValType>,
        arity: (usize, usize),
        body: Vec<Instr<A>>,
    },
    Loop {
        block_type: Option<ValType>,
        arity: (usize, usize),
        body: Vec<Instr<A>>,
    },
    If {
        block_type: Option<ValType>,
        arity: (usize, usize),
        then_body: Vec<Instr<A>>,
        else_body: Vec<Instr<A>>,
    },
    Call {
        arity: (usize, usize),
        index: u32,
    },
    CallIndirect {
        arity: (usize, usize),
        type_index: u32,
    },
    Br(u32),
    BrIf(u32),
    BrTable {
        targets: Vec<u32>,
        default: u32,
    },
    Return,
    Unreachable,
    /// Synthetic join point carrying φ-like merge definitions. Not a Wasm
    /// instruction; emitted only by the CFG builder.
    Merge,
}

impl<A> Control<A> {
    /// Values consumed from the stack by the instruction itself (not by its
    /// body): the condition of `if`/`br_if`, the index of `br_table` and
    /// `call_indirect`, the arguments of calls.
    pub fn pops(&self) -> usize {
        match self {
            Control::Block { .. } | Control::Loop { .. } => 0,
            Control::If { .. } => 1,
            Control::Call { arity, .. } => arity.0,
            Control::CallIndirect { arity, .. } => arity.0 + 1,
            Control::Br(_) => 0,
            Control::BrIf(_) => 1,
            Control::BrTable { .. } => 1,
            Control::Return => 0,
            Control::Unreachable => 0,
            Control::Merge => 0,
        }
    }

    /// Values pushed by the instruction itself.
    pub fn pushes(&self) -> usize {
        match self {
            Control::Call { arity, .. } | Control::CallIndirect { arity, .. } => arity.1,
            _ => 0,
        }
    }

    /// Short mnemonic used by the dot output.
    pub fn mnemonic(&self) -> String {
        match self {
            Control::Block { .. } => "block".to_string(),
            Control::Loop { .. } => "loop".to_string(),
            Control::If { .. } => "if".to_string(),
            Control::Call { index, .. } => format!("call {}", index),
            Control::CallIndirect { type_index, .. } => {
                format!("call_indirect {}", type_index)
            }
            Control::Br(d) => format!("br {}", d),
            Control::BrIf(d) => format!("br_if {}", d),
            Control::BrTable { targets, default } => {
                format!("br_table {:?} {}", targets, default)
            }
            Control::Return => "return".to_string(),
            Control::Unreachable => "unreachable".to_string(),
            Control::Merge => "merge".to_string(),
        }
    }
}

/// A labelled, annotated data instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInstr<A> {
    pub label: Label,
    pub op: Data,
    pub before: A,
    pub after: A,
}

/// A labelled, annotated control instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInstr<A> {
    pub label: Label,
    pub op: Control<A>,
    pub before: A,
    pub after: A,
}

/// A labelled instruction: the recursion boundary between data and control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr<A> {
    Data(DataInstr<A>),
    Control(ControlInstr<A>),
}

impl<A> Instr<A> {
    pub fn label(&self) -> Label {
        match self {
            Instr::Data(d) => d.label,
            Instr::Control(c) => c.label,
        }
    }

    /// Structural fold rewriting every annotation in the tree. Labels and
    /// payloads are untouched; sub-trees are rebuilt, never aliased.
    pub fn map_annotations<B>(&self, f: &mut impl FnMut(&A) -> B) -> Instr<B> {
        match self {
            Instr::Data(d) => Instr::Data(DataInstr {
                label: d.label,
                op: d.op.clone(),
                before: f(&d.before),
                after: f(&d.after),
            }),
            Instr::Control(c) => {
                let before = f(&c.before);
                let after = f(&c.after);
                let op = match &c.op {
                    Control::Block {
                        block_type,
                        arity,
                        body,
                    } => Control::Block {
                        block_type: *block_type,
                        arity: *arity,
                        body: body.iter().map(|i| i.map_annotations(f)).collect(),
                    },
                    Control::Loop {
                        block_type,
                        arity,
                        body,
                    } => Control::Loop {
                        block_type: *block_type,
                        arity: *arity,
                        body: body.iter().map(|i| i.map_annotations(f)).collect(),
                    },
                    Control::If {
                        block_type,
                        arity,
                        then_body,
                        else_body,
                    } => Control::If {
                        block_type: *block_type,
                        arity: *arity,
                        then_body: then_body.iter().map(|i| i.map_annotations(f)).collect(),
                        else_body: else_body.iter().map(|i| i.map_annotations(f)).collect(),
                    },
                    Control::Call { arity, index } => Control::Call {
                        arity: *arity,
                        index: *index,
                    },
                    Control::CallIndirect { arity, type_index } => Control::CallIndirect {
                        arity: *arity,
                        type_index: *type_index,
                    },
                    Control::Br(d) => Control::Br(*d),
                    Control::BrIf(d) => Control::BrIf(*d),
                    Control::BrTable { targets, default } => Control::BrTable {
                        targets: targets.clone(),
                        default: *default,
                    },
                    Control::Return => Control::Return,
                    Control::Unreachable => Control::Unreachable,
                    Control::Merge => Control::Merge,
                };
                Instr::Control(ControlInstr {
                    label: c.label,
                    op,
                    before,
                    after,
                })
            }
        }
    }

    /// Same skeleton with unit annotations.
    pub fn clear_annotations(&self) -> Instr<()> {
        self.map_annotations(&mut |_| ())
    }
}

impl<A> fmt::Display for Instr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Data(d) => write!(f, "{}: {}", d.label, d.op),
            Instr::Control(c) => write!(f, "{}: {}", c.label, c.op.mnemonic()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
