//! Operator translation: converts flat `wasmparser` operator lists into the
//! nested, labelled instruction tree.
//!
//! Labels are assigned in operator order from the function's
//! per-section counter, so the n-th operator of a body carries label n.
//! Structured operators (`block`, `loop`, `if`) open a frame; `end` closes
//! the innermost frame and appends the finished control instruction to its
//! parent. Floating-point operators and multi-value shapes are rejected.

use anyhow::{bail, Context, Result};
use wasmparser::{BlockType, Operator};

use super::types::{
    Binary, BinaryOp, Compare, CompareOp, Control, ControlInstr, Convert, ConvertOp, Data,
    DataInstr, Extension, Instr, LabelFactory, MemOp, PackSize, Prim, Test, TestOp, Unary,
    UnaryOp, ValType,
};

/// Signatures the translator needs from the module: per-function and
/// per-type (pop, push) arities for call and call_indirect.
#[derive(Debug, Clone, Default)]
pub struct TranslationContext {
    pub func_arities: Vec<(usize, usize)>,
    pub type_arities: Vec<(usize, usize)>,
}

// ─── Frame stack ─────────────────────────────────────────────────────────────

enum FrameKind {
    Func,
    Block {
        block_type: Option<ValType>,
        arity: (usize, usize),
        label: super::types::Label,
    },
    Loop {
        block_type: Option<ValType>,
        arity: (usize, usize),
        label: super::types::Label,
    },
    If {
        block_type: Option<ValType>,
        arity: (usize, usize),
        label: super::types::Label,
        then_body: Option<Vec<Instr<()>>>,
    },
}

struct Frame {
    kind: FrameKind,
    body: Vec<Instr<()>>,
}

/// Convert a structured block type to `(input_arity, output_arity)`.
///
/// Inputs and multiple results are a post-MVP feature this analysis does
/// not model; both are rejected up front.
pub fn block_type_arity(
    bt: &BlockType,
    ctx: &TranslationContext,
) -> Result<(Option<ValType>, (usize, usize))> {
    match bt {
        BlockType::Empty => Ok((None, (0, 0))),
        BlockType::Type(t) => Ok((Some(ValType::from_wasmparser(*t)?), (0, 1))),
        BlockType::FuncType(idx) => {
            let arity = ctx
                .type_arities
                .get(*idx as usize)
                .copied()
                .with_context(|| format!("block type index {} out of range", idx))?;
            if arity.0 != 0 {
                bail!("unsupported: block with input arity {}", arity.0);
            }
            if arity.1 > 1 {
                bail!("unsupported: block with output arity {}", arity.1);
            }
            // The value type itself is not recoverable without the type
            // section entry; arity is all the analysis consumes.
            Ok((None, arity))
        }
    }
}

/// Translate one function body into a nested instruction sequence.
pub fn translate_body(
    operators: &[Operator],
    factory: &mut LabelFactory,
    ctx: &TranslationContext,
) -> Result<Vec<Instr<()>>> {
    let mut stack = vec![Frame {
        kind: FrameKind::Func,
        body: Vec::new(),
    }];

    for op in operators {
        translate_operator(op, &mut stack, factory, ctx)
            .with_context(|| format!("translating operator {:?}", op))?;
    }

    match stack.pop() {
        Some(Frame {
            kind: FrameKind::Func,
            body,
        }) if stack.is_empty() => Ok(body),
        _ => bail!("unbalanced control structure in function body"),
    }
}

fn push_data(stack: &mut [Frame], factory: &mut LabelFactory, op: Data) {
    let instr = Instr::Data(DataInstr {
        label: factory.function(),
        op,
        before: (),
        after: (),
    });
    stack.last_mut().expect("frame stack is never empty").body.push(instr);
}

fn push_control(stack: &mut [Frame], factory: &mut LabelFactory, op: Control<()>) {
    let instr = Instr::Control(ControlInstr {
        label: factory.function(),
        op,
        before: (),
        after: (),
    });
    stack.last_mut().expect("frame stack is never empty").body.push(instr);
}

fn translate_operator(
    op: &Operator,
    stack: &mut Vec<Frame>,
    factory: &mut LabelFactory,
    ctx: &TranslationContext,
) -> Result<()> {
    match op {
        // ─── Structured control ─────────────────────────────────────────
        Operator::Block { blockty } => {
            let (block_type, arity) = block_type_arity(blockty, ctx)?;
            let label = factory.function();
            stack.push(Frame {
                kind: FrameKind::Block {
                    block_type,
                    arity,
                    label,
                },
                body: Vec::new(),
            });
        }
        Operator::Loop { blockty } => {
            let (block_type, arity) = block_type_arity(blockty, ctx)?;
            let label = factory.function();
            stack.push(Frame {
                kind: FrameKind::Loop {
                    block_type,
                    arity,
                    label,
                },
                body: Vec::new(),
            });
        }
        Operator::If { blockty } => {
            let (block_type, arity) = block_type_arity(blockty, ctx)?;
            let label = factory.function();
            stack.push(Frame {
                kind: FrameKind::If {
                    block_type,
                    arity,
                    label,
                    then_body: None,
                },
                body: Vec::new(),
            });
        }
        Operator::Else => {
            let frame = stack.last_mut().expect("frame stack is never empty");
            match &mut frame.kind {
                FrameKind::If { then_body, .. } if then_body.is_none() => {
                    *then_body = Some(std::mem::take(&mut frame.body));
                }
                _ => bail!("else outside of if"),
            }
        }
        Operator::End => {
            let frame = stack.pop().expect("frame stack is never empty");
            let finished = match frame.kind {
                FrameKind::Func => {
                    // Function-level end: push the frame back and let
                    // translate_body unwrap it.
                    stack.push(Frame {
                        kind: FrameKind::Func,
                        body: frame.body,
                    });
                    return Ok(());
                }
                FrameKind::Block {
                    block_type,
                    arity,
                    label,
                } => Instr::Control(ControlInstr {
                    label,
                    op: Control::Block {
                        block_type,
                        arity,
                        body: frame.body,
                    },
                    before: (),
                    after: (),
                }),
                FrameKind::Loop {
                    block_type,
                    arity,
                    label,
                } => Instr::Control(ControlInstr {
                    label,
                    op: Control::Loop {
                        block_type,
                        arity,
                        body: frame.body,
                    },
                    before: (),
                    after: (),
                }),
                FrameKind::If {
                    block_type,
                    arity,
                    label,
                    then_body,
                } => {
                    let (then_body, else_body) = match then_body {
                        Some(then) => (then, frame.body),
                        None => (frame.body, Vec::new()),
                    };
                    Instr::Control(ControlInstr {
                        label,
                        op: Control::If {
                            block_type,
                            arity,
                            then_body,
                            else_body,
                        },
                        before: (),
                        after: (),
                    })
                }
            };
            stack
                .last_mut()
                .ok_or_else(|| anyhow::anyhow!("end without enclosing frame"))?
                .body
                .push(finished);
        }

        // ─── Branches, calls, terminators ───────────────────────────────
        Operator::Br { relative_depth } => {
            push_control(stack, factory, Control::Br(*relative_depth))
        }
        Operator::BrIf { relative_depth } => {
            push_control(stack, factory, Control::BrIf(*relative_depth))
        }
        Operator::BrTable { targets } => {
            let resolved: Vec<u32> = targets.targets().collect::<Result<_, _>>()?;
            push_control(
                stack,
                factory,
                Control::BrTable {
                    targets: resolved,
                    default: targets.default(),
                },
            );
        }
        Operator::Return => push_control(stack, factory, Control::Return),
        Operator::Unreachable => push_control(stack, factory, Control::Unreachable),
        Operator::Call { function_index } => {
            let arity = ctx
                .func_arities
                .get(*function_index as usize)
                .copied()
                .with_context(|| format!("call target {} out of range", function_index))?;
            if arity.1 > 1 {
                bail!("unsupported: call with {} results", arity.1);
            }
            push_control(
                stack,
                factory,
                Control::Call {
                    arity,
                    index: *function_index,
                },
            );
        }
        Operator::CallIndirect { type_index, .. } => {
            let arity = ctx
                .type_arities
                .get(*type_index as usize)
                .copied()
                .with_context(|| format!("call_indirect type {} out of range", type_index))?;
            if arity.1 > 1 {
                bail!("unsupported: call_indirect with {} results", arity.1);
            }
            push_control(
                stack,
                factory,
                Control::CallIndirect {
                    arity,
                    type_index: *type_index,
                },
            );
        }

        // ─── Parametric / misc data ─────────────────────────────────────
        Operator::Nop => push_data(stack, factory, Data::Nop),
        Operator::Drop => push_data(stack, factory, Data::Drop),
        Operator::Select => push_data(stack, factory, Data::Select),
        Operator::MemorySize { .. } => push_data(stack, factory, Data::MemorySize),
        Operator::MemoryGrow { .. } => push_data(stack, factory, Data::MemoryGrow),

        // ─── Constants ──────────────────────────────────────────────────
        Operator::I32Const { value } => {
            push_data(stack, factory, Data::Const(Prim::I32(*value)))
        }
        Operator::I64Const { value } => {
            push_data(stack, factory, Data::Const(Prim::I64(*value)))
        }

        // ─── Locals and globals ─────────────────────────────────────────
        Operator::LocalGet { local_index } => {
            push_data(stack, factory, Data::LocalGet(*local_index))
        }
        Operator::LocalSet { local_index } => {
            push_data(stack, factory, Data::LocalSet(*local_index))
        }
        Operator::LocalTee { local_index } => {
            push_data(stack, factory, Data::LocalTee(*local_index))
        }
        Operator::GlobalGet { global_index } => {
            push_data(stack, factory, Data::GlobalGet(*global_index))
        }
        Operator::GlobalSet { global_index } => {
            push_data(stack, factory, Data::GlobalSet(*global_index))
        }

        // ─── Memory access ──────────────────────────────────────────────
        Operator::I32Load { memarg } => push_load(stack, factory, ValType::I32, memarg, None),
        Operator::I64Load { memarg } => push_load(stack, factory, ValType::I64, memarg, None),
        Operator::I32Load8S { memarg } => push_load(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P8, Extension::Signed)),
        ),
        Operator::I32Load8U { memarg } => push_load(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P8, Extension::Unsigned)),
        ),
        Operator::I32Load16S { memarg } => push_load(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P16, Extension::Signed)),
        ),
        Operator::I32Load16U { memarg } => push_load(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P16, Extension::Unsigned)),
        ),
        Operator::I64Load8S { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P8, Extension::Signed)),
        ),
        Operator::I64Load8U { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P8, Extension::Unsigned)),
        ),
        Operator::I64Load16S { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P16, Extension::Signed)),
        ),
        Operator::I64Load16U { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P16, Extension::Unsigned)),
        ),
        Operator::I64Load32S { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P32, Extension::Signed)),
        ),
        Operator::I64Load32U { memarg } => push_load(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P32, Extension::Unsigned)),
        ),
        Operator::I32Store { memarg } => push_store(stack, factory, ValType::I32, memarg, None),
        Operator::I64Store { memarg } => push_store(stack, factory, ValType::I64, memarg, None),
        Operator::I32Store8 { memarg } => push_store(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P8, Extension::Unsigned)),
        ),
        Operator::I32Store16 { memarg } => push_store(
            stack,
            factory,
            ValType::I32,
            memarg,
            Some((PackSize::P16, Extension::Unsigned)),
        ),
        Operator::I64Store8 { memarg } => push_store(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P8, Extension::Unsigned)),
        ),
        Operator::I64Store16 { memarg } => push_store(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P16, Extension::Unsigned)),
        ),
        Operator::I64Store32 { memarg } => push_store(
            stack,
            factory,
            ValType::I64,
            memarg,
            Some((PackSize::P32, Extension::Unsigned)),
        ),

        // ─── i32 operators ──────────────────────────────────────────────
        Operator::I32Eqz => push_test(stack, factory, ValType::I32),
        Operator::I32Eq => push_compare(stack, factory, ValType::I32, CompareOp::Eq),
        Operator::I32Ne => push_compare(stack, factory, ValType::I32, CompareOp::Ne),
        Operator::I32LtS => push_compare(stack, factory, ValType::I32, CompareOp::LtS),
        Operator::I32LtU => push_compare(stack, factory, ValType::I32, CompareOp::LtU),
        Operator::I32GtS => push_compare(stack, factory, ValType::I32, CompareOp::GtS),
        Operator::I32GtU => push_compare(stack, factory, ValType::I32, CompareOp::GtU),
        Operator::I32LeS => push_compare(stack, factory, ValType::I32, CompareOp::LeS),
        Operator::I32LeU => push_compare(stack, factory, ValType::I32, CompareOp::LeU),
        Operator::I32GeS => push_compare(stack, factory, ValType::I32, CompareOp::GeS),
        Operator::I32GeU => push_compare(stack, factory, ValType::I32, CompareOp::GeU),
        Operator::I32Clz => push_unary(stack, factory, ValType::I32, UnaryOp::Clz),
        Operator::I32Ctz => push_unary(stack, factory, ValType::I32, UnaryOp::Ctz),
        Operator::I32Popcnt => push_unary(stack, factory, ValType::I32, UnaryOp::Popcnt),
        Operator::I32Add => push_binary(stack, factory, ValType::I32, BinaryOp::Add),
        Operator::I32Sub => push_binary(stack, factory, ValType::I32, BinaryOp::Sub),
        Operator::I32Mul => push_binary(stack, factory, ValType::I32, BinaryOp::Mul),
        Operator::I32DivS => push_binary(stack, factory, ValType::I32, BinaryOp::DivS),
        Operator::I32DivU => push_binary(stack, factory, ValType::I32, BinaryOp::DivU),
        Operator::I32RemS => push_binary(stack, factory, ValType::I32, BinaryOp::RemS),
        Operator::I32RemU => push_binary(stack, factory, ValType::I32, BinaryOp::RemU),
        Operator::I32And => push_binary(stack, factory, ValType::I32, BinaryOp::And),
        Operator::I32Or => push_binary(stack, factory, ValType::I32, BinaryOp::Or),
        Operator::I32Xor => push_binary(stack, factory, ValType::I32, BinaryOp::Xor),
        Operator::I32Shl => push_binary(stack, factory, ValType::I32, BinaryOp::Shl),
        Operator::I32ShrS => push_binary(stack, factory, ValType::I32, BinaryOp::ShrS),
        Operator::I32ShrU => push_binary(stack, factory, ValType::I32, BinaryOp::ShrU),
        Operator::I32Rotl => push_binary(stack, factory, ValType::I32, BinaryOp::Rotl),
        Operator::I32Rotr => push_binary(stack, factory, ValType::I32, BinaryOp::Rotr),

        // ─── i64 operators ──────────────────────────────────────────────
        Operator::I64Eqz => push_test(stack, factory, ValType::I64),
        Operator::I64Eq => push_compare(stack, factory, ValType::I64, CompareOp::Eq),
        Operator::I64Ne => push_compare(stack, factory, ValType::I64, CompareOp::Ne),
        Operator::I64LtS => push_compare(stack, factory, ValType::I64, CompareOp::LtS),
        Operator::I64LtU => push_compare(stack, factory, ValType::I64, CompareOp::LtU),
        Operator::I64GtS => push_compare(stack, factory, ValType::I64, CompareOp::GtS),
        Operator::I64GtU => push_compare(stack, factory, ValType::I64, CompareOp::GtU),
        Operator::I64LeS => push_compare(stack, factory, ValType::I64, CompareOp::LeS),
        Operator::I64LeU => push_compare(stack, factory, ValType::I64, CompareOp::LeU),
        Operator::I64GeS => push_compare(stack, factory, ValType::I64, CompareOp::GeS),
        Operator::I64GeU => push_compare(stack, factory, ValType::I64, CompareOp::GeU),
        Operator::I64Clz => push_unary(stack, factory, ValType::I64, UnaryOp::Clz),
        Operator::I64Ctz => push_unary(stack, factory, ValType::I64, UnaryOp::Ctz),
        Operator::I64Popcnt => push_unary(stack, factory, ValType::I64, UnaryOp::Popcnt),
        Operator::I64Add => push_binary(stack, factory, ValType::I64, BinaryOp::Add),
        Operator::I64Sub => push_binary(stack, factory, ValType::I64, BinaryOp::Sub),
        Operator::I64Mul => push_binary(stack, factory, ValType::I64, BinaryOp::Mul),
        Operator::I64DivS => push_binary(stack, factory, ValType::I64, BinaryOp::DivS),
        Operator::I64DivU => push_binary(stack, factory, ValType::I64, BinaryOp::DivU),
        Operator::I64RemS => push_binary(stack, factory, ValType::I64, BinaryOp::RemS),
        Operator::I64RemU => push_binary(stack, factory, ValType::I64, BinaryOp::RemU),
        Operator::I64And => push_binary(stack, factory, ValType::I64, BinaryOp::And),
        Operator::I64Or => push_binary(stack, factory, ValType::I64, BinaryOp::Or),
        Operator::I64Xor => push_binary(stack, factory, ValType::I64, BinaryOp::Xor),
        Operator::I64Shl => push_binary(stack, factory, ValType::I64, BinaryOp::Shl),
        Operator::I64ShrS => push_binary(stack, factory, ValType::I64, BinaryOp::ShrS),
        Operator::I64ShrU => push_binary(stack, factory, ValType::I64, BinaryOp::ShrU),
        Operator::I64Rotl => push_binary(stack, factory, ValType::I64, BinaryOp::Rotl),
        Operator::I64Rotr => push_binary(stack, factory, ValType::I64, BinaryOp::Rotr),

        // ─── Conversions ────────────────────────────────────────────────
        Operator::I32WrapI64 => push_convert(
            stack,
            factory,
            Convert {
                from: ValType::I64,
                to: ValType::I32,
                op: ConvertOp::Wrap,
            },
        ),
        Operator::I64ExtendI32S => push_convert(
            stack,
            factory,
            Convert {
                from: ValType::I32,
                to: ValType::I64,
                op: ConvertOp::ExtendS,
            },
        ),
        Operator::I64ExtendI32U => push_convert(
            stack,
            factory,
            Convert {
                from: ValType::I32,
                to: ValType::I64,
                op: ConvertOp::ExtendU,
            },
        ),

        other => bail!("unsupported operator: {:?}", other),
    }
    Ok(())
}

fn push_load(
    stack: &mut [Frame],
    factory: &mut LabelFactory,
    ty: ValType,
    memarg: &wasmparser::MemArg,
    pack: Option<(PackSize, Extension)>,
) {
    // Alignment is deliberately not recorded.
    push_data(
        stack,
        factory,
        Data::Load(MemOp {
            ty,
            offset: memarg.offset as u32,
            pack,
        }),
    );
}

fn push_store(
    stack: &mut [Frame],
    factory: &mut LabelFactory,
    ty: ValType,
    memarg: &wasmparser::MemArg,
    pack: Option<(PackSize, Extension)>,
) {
    push_data(
        stack,
        factory,
        Data::Store(MemOp {
            ty,
            offset: memarg.offset as u32,
            pack,
        }),
    );
}

fn push_unary(stack: &mut [Frame], factory: &mut LabelFactory, ty: ValType, op: UnaryOp) {
    push_data(stack, factory, Data::Unary(Unary { ty, op }));
}

fn push_binary(stack: &mut [Frame], factory: &mut LabelFactory, ty: ValType, op: BinaryOp) {
    push_data(stack, factory, Data::Binary(Binary { ty, op }));
}

fn push_compare(stack: &mut [Frame], factory: &mut LabelFactory, ty: ValType, op: CompareOp) {
    push_data(stack, factory, Data::Compare(Compare { ty, op }));
}

fn push_test(stack: &mut [Frame], factory: &mut LabelFactory, ty: ValType) {
    push_data(stack, factory, Data::Test(Test { ty, op: TestOp::Eqz }));
}

fn push_convert(stack: &mut [Frame], factory: &mut LabelFactory, convert: Convert) {
    push_data(stack, factory, Data::Convert(convert));
}

// ─── Tests ───────────────────────────────────────────────────────────────────
