//! Instruction catalogue.
//!
//! Every opcode has a fixed [`OpInfo`] row: printable name, operand arity, whether it
//! produces a value other instructions can reference through `InsnOut`, whether it
//! leaves the CPU flags untouched, and whether it is internal to the backend (produced
//! by lowering or allocation, never accepted from callers).

use crate::core::error::{CompileError, CompileResult};
use crate::core::operand::{Opnd, OpndKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Comment,
    Label,
    Add,
    Sub,
    And,
    Not,
    JumpEq,
    JumpNe,
    JumpOvf,
    Call,
    CCall,
    Ret,
    RetVal,
    Mov,
    Cmp,
    CmovGe,
    CmovGt,
    CmovLe,
    CmovLt,
    SelectGe,
    SelectGt,
    SelectLe,
    SelectLt,
    // Internal.
    Je,
    Jne,
    Jmp,
    CPush,
    CPopInto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u8),
    AtLeast(u8),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k as usize,
            Arity::AtLeast(k) => n >= k as usize,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub arity: Arity,
    pub produces_value: bool,
    pub preserves_flags: bool,
    pub internal: bool,
}

/// Signed comparison condition of the conditional-move family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Ge,
    Gt,
    Le,
    Lt,
}

impl Cond {
    /// Condition that holds for swapped comparison operands.
    pub fn mirrored(self) -> Cond {
        match self {
            Cond::Ge => Cond::Le,
            Cond::Gt => Cond::Lt,
            Cond::Le => Cond::Ge,
            Cond::Lt => Cond::Gt,
        }
    }

    pub fn holds(self, a: i64, b: i64) -> bool {
        match self {
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
            Cond::Lt => a < b,
        }
    }
}

impl Op {
    pub const ALL: [Op; 28] = [
        Op::Comment, Op::Label, Op::Add, Op::Sub, Op::And, Op::Not,
        Op::JumpEq, Op::JumpNe, Op::JumpOvf, Op::Call, Op::CCall, Op::Ret,
        Op::RetVal, Op::Mov, Op::Cmp, Op::CmovGe, Op::CmovGt, Op::CmovLe,
        Op::CmovLt, Op::SelectGe, Op::SelectGt, Op::SelectLe, Op::SelectLt,
        Op::Je, Op::Jne, Op::Jmp, Op::CPush, Op::CPopInto,
    ];

    #[rustfmt::skip]
    pub const fn info(self) -> OpInfo {
        use Arity::*;
        use Op::*;
        match self {
            Comment => OpInfo { name: "comment", arity: Exact(1), produces_value: false, preserves_flags: true, internal: false },
            Label => OpInfo { name: "label", arity: Exact(1), produces_value: false, preserves_flags: false, internal: false },
            Add => OpInfo { name: "add", arity: Exact(2), produces_value: true, preserves_flags: false, internal: false },
            Sub => OpInfo { name: "sub", arity: Exact(2), produces_value: true, preserves_flags: false, internal: false },
            And => OpInfo { name: "and", arity: Exact(2), produces_value: true, preserves_flags: false, internal: false },
            Not => OpInfo { name: "not", arity: Exact(1), produces_value: true, preserves_flags: true, internal: false },
            JumpEq => OpInfo { name: "jump_eq", arity: Exact(3), produces_value: false, preserves_flags: false, internal: false },
            JumpNe => OpInfo { name: "jump_ne", arity: Exact(3), produces_value: false, preserves_flags: false, internal: false },
            JumpOvf => OpInfo { name: "jump_ovf", arity: Exact(1), produces_value: false, preserves_flags: true, internal: false },
            Call => OpInfo { name: "call", arity: Exact(1), produces_value: false, preserves_flags: false, internal: false },
            CCall => OpInfo { name: "ccall", arity: AtLeast(1), produces_value: true, preserves_flags: false, internal: false },
            Ret => OpInfo { name: "ret", arity: Exact(0), produces_value: false, preserves_flags: false, internal: false },
            RetVal => OpInfo { name: "retval", arity: Exact(1), produces_value: false, preserves_flags: false, internal: false },
            Mov => OpInfo { name: "mov", arity: Exact(2), produces_value: false, preserves_flags: true, internal: false },
            Cmp => OpInfo { name: "cmp", arity: Exact(2), produces_value: false, preserves_flags: false, internal: false },
            CmovGe => OpInfo { name: "cmov_ge", arity: Exact(2), produces_value: false, preserves_flags: true, internal: false },
            CmovGt => OpInfo { name: "cmov_gt", arity: Exact(2), produces_value: false, preserves_flags: true, internal: false },
            CmovLe => OpInfo { name: "cmov_le", arity: Exact(2), produces_value: false, preserves_flags: true, internal: false },
            CmovLt => OpInfo { name: "cmov_lt", arity: Exact(2), produces_value: false, preserves_flags: true, internal: false },
            SelectGe => OpInfo { name: "select_ge", arity: Exact(4), produces_value: true, preserves_flags: false, internal: false },
            SelectGt => OpInfo { name: "select_gt", arity: Exact(4), produces_value: true, preserves_flags: false, internal: false },
            SelectLe => OpInfo { name: "select_le", arity: Exact(4), produces_value: true, preserves_flags: false, internal: false },
            SelectLt => OpInfo { name: "select_lt", arity: Exact(4), produces_value: true, preserves_flags: false, internal: false },
            Je => OpInfo { name: "je", arity: Exact(1), produces_value: false, preserves_flags: true, internal: true },
            Jne => OpInfo { name: "jne", arity: Exact(1), produces_value: false, preserves_flags: true, internal: true },
            Jmp => OpInfo { name: "jmp", arity: Exact(1), produces_value: false, preserves_flags: true, internal: true },
            CPush => OpInfo { name: "cpush", arity: Exact(1), produces_value: false, preserves_flags: true, internal: true },
            CPopInto => OpInfo { name: "cpop_into", arity: Exact(1), produces_value: false, preserves_flags: true, internal: true },
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn from_name(name: &str) -> Option<Op> {
        Op::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn cmov_cond(self) -> Option<Cond> {
        match self {
            Op::CmovGe => Some(Cond::Ge),
            Op::CmovGt => Some(Cond::Gt),
            Op::CmovLe => Some(Cond::Le),
            Op::CmovLt => Some(Cond::Lt),
            _ => None,
        }
    }

    pub fn select_cond(self) -> Option<Cond> {
        match self {
            Op::SelectGe => Some(Cond::Ge),
            Op::SelectGt => Some(Cond::Gt),
            Op::SelectLe => Some(Cond::Le),
            Op::SelectLt => Some(Cond::Lt),
            _ => None,
        }
    }

    pub fn cmov(cond: Cond) -> Op {
        match cond {
            Cond::Ge => Op::CmovGe,
            Cond::Gt => Op::CmovGt,
            Cond::Le => Op::CmovLe,
            Cond::Lt => Op::CmovLt,
        }
    }

    /// Instructions whose single operand is a branch target.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Op::JumpOvf | Op::Je | Op::Jne | Op::Jmp
        )
    }

    pub fn is_call(self) -> bool {
        matches!(self, Op::Call | Op::CCall)
    }
}

/// One IR instruction.
///
/// `pos` is the byte offset of the first machine instruction emitted for it,
/// filled in by the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub op: Op,
    pub opnds: Vec<Opnd>,
    pub pos: Option<u32>,
}

impl Insn {
    pub fn new(op: Op, opnds: Vec<Opnd>) -> Self {
        Self {
            op,
            opnds,
            pos: None,
        }
    }

    pub fn opnd(&self, i: usize) -> Opnd {
        self.opnds.get(i).copied().unwrap_or(Opnd::Void)
    }
}

fn expect_kind(op: Op, i: usize, opnd: &Opnd, ok: bool, wanted: &str) -> CompileResult<()> {
    if ok {
        Ok(())
    } else {
        Err(CompileError::contract(
            op.name(),
            format!(
                "operand {i} must be {wanted}, got {}",
                opnd.kind().name()
            ),
        ))
    }
}

fn is_fn_ptr(opnd: &Opnd) -> bool {
    matches!(opnd.kind(), OpndKind::Imm | OpndKind::CodePtr)
}

/// Check arity and operand kinds of a caller-built instruction.
pub(crate) fn check_operands(op: Op, opnds: &[Opnd]) -> CompileResult<()> {
    let info = op.info();
    if info.internal {
        return Err(CompileError::contract(
            op.name(),
            "internal instruction cannot be built directly",
        ));
    }
    if !info.arity.accepts(opnds.len()) {
        return Err(CompileError::contract(
            op.name(),
            format!("expected {:?} operands, got {}", info.arity, opnds.len()),
        ));
    }

    for (i, opnd) in opnds.iter().enumerate() {
        opnd.check_width()?;
        let (ok, wanted) = match (op, i) {
            (Op::Comment, _) => (opnd.kind() == OpndKind::Str, "a string"),
            (Op::Label | Op::JumpOvf, _) | (Op::JumpEq | Op::JumpNe, 0) => {
                (opnd.kind() == OpndKind::LabelName, "a label name")
            }
            (Op::Call, _) | (Op::CCall, 0) => (is_fn_ptr(opnd), "a function pointer"),
            (Op::Mov | Op::Cmp, 0) => (opnd.is_reg_like(), "a register or instruction result"),
            (Op::CmovGe | Op::CmovGt | Op::CmovLe | Op::CmovLt, _) => {
                (opnd.is_reg_like(), "a register or instruction result")
            }
            _ => (opnd.is_value_like(), "a value operand"),
        };
        expect_kind(op, i, opnd, ok, wanted)?;
    }
    Ok(())
}
