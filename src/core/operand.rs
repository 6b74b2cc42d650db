// This module defines the operand model of the IR. An operand is a small tagged value that
// appears in instruction operand lists: nothing (Void), a managed object reference (Value), a
// reference to the result of an earlier instruction (InsnOut), a machine code address
// (CodePtr), a symbolic or resolved branch target (LabelName/LabelIdx), interned comment text
// (Str), a base-plus-displacement memory reference (Mem), an immediate (Imm) or a register
// (Reg). Registers are either ordinary hardware registers or one of four special
// interpreter-state registers (execution context, control frame, stack pointer, receiver)
// that live in fixed callee-saved registers. The whole enum stays within 16 bytes so
// instruction operand lists are cheap to copy during lowering and allocation. Constructors
// validate widths, immediates and operand kinds and report violations as CompileError.

//! Operand model: [`Opnd`] and the value types it carries.

use crate::core::error::{CompileError, CompileResult};
use crate::core::interner::Symbol;
use crate::core::label::LabelIdx;
use crate::x64::regs::{self, MachineReg};

/// A managed object reference owned by the host VM's garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u64);

impl Value {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Address of machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePtr(usize);

impl CodePtr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Interpreter-state registers reachable from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    /// Execution context.
    Ec = 0,
    /// Current control frame.
    Cfp = 1,
    /// VM stack pointer.
    Sp = 2,
    /// Receiver of the running method.
    SelfVal = 3,
}

impl SpecialReg {
    pub const ALL: [SpecialReg; 4] = [
        SpecialReg::Ec,
        SpecialReg::Cfp,
        SpecialReg::Sp,
        SpecialReg::SelfVal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpecialReg::Ec => "ec",
            SpecialReg::Cfp => "cfp",
            SpecialReg::Sp => "sp",
            SpecialReg::SelfVal => "self",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

/// A register operand: a 5-bit index plus a flag selecting the special namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    idx: u8,
    special: bool,
}

impl Reg {
    /// Largest index the 5-bit field can hold.
    pub const MAX_IDX: u8 = 31;

    /// An ordinary register a caller may use directly.
    ///
    /// Registers the backend reserves (stack and frame pointers, scratch
    /// registers, special-register backing) are rejected.
    pub fn new(idx: u8) -> CompileResult<Reg> {
        if idx > Self::MAX_IDX || idx >= regs::NUM_GP_REGS {
            return Err(CompileError::contract(
                "reg",
                format!("register index {idx} out of range"),
            ));
        }
        if !regs::is_user_assignable(idx) {
            return Err(CompileError::contract(
                "reg",
                format!("{} is reserved by the backend", regs::name(idx)),
            ));
        }
        Ok(Reg {
            idx,
            special: false,
        })
    }

    /// Any hardware register, unchecked. Only the allocator and emitter use this.
    pub(crate) const fn machine(reg: MachineReg) -> Reg {
        Reg {
            idx: reg,
            special: false,
        }
    }

    pub const fn special(slot: SpecialReg) -> Reg {
        Reg {
            idx: slot as u8,
            special: true,
        }
    }

    pub fn idx(self) -> u8 {
        self.idx
    }

    pub fn is_special(self) -> bool {
        self.special
    }

    pub fn special_slot(self) -> Option<SpecialReg> {
        if self.special {
            SpecialReg::ALL.get(self.idx as usize).copied()
        } else {
            None
        }
    }

    /// Hardware register this operand names.
    pub fn machine_reg(self) -> MachineReg {
        if self.special {
            regs::SPECIAL_BACKING[(self.idx & 3) as usize]
        } else {
            self.idx
        }
    }

    pub fn name(self) -> &'static str {
        match self.special_slot() {
            Some(slot) => slot.name(),
            None => regs::name(self.idx),
        }
    }
}

/// Base register plus byte displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
    pub num_bits: u8,
}

/// Discriminant of [`Opnd`], used by operand contracts and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpndKind {
    Void,
    Value,
    InsnOut,
    CodePtr,
    LabelName,
    LabelIdx,
    Str,
    Mem,
    Imm,
    Reg,
}

impl OpndKind {
    pub fn name(self) -> &'static str {
        match self {
            OpndKind::Void => "void",
            OpndKind::Value => "value",
            OpndKind::InsnOut => "insn-out",
            OpndKind::CodePtr => "code-ptr",
            OpndKind::LabelName => "label-name",
            OpndKind::LabelIdx => "label-idx",
            OpndKind::Str => "string",
            OpndKind::Mem => "mem",
            OpndKind::Imm => "imm",
            OpndKind::Reg => "reg",
        }
    }
}

/// IR operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opnd {
    Void,
    Value(Value),
    /// Result of the instruction at `idx` in the same sequence.
    InsnOut { idx: u32, num_bits: u8 },
    CodePtr(CodePtr),
    LabelName(Symbol),
    LabelIdx(LabelIdx),
    Str(Symbol),
    Mem(Mem),
    Imm { value: i64, num_bits: u8 },
    Reg { reg: Reg, num_bits: u8 },
}

pub(crate) fn check_width(num_bits: u8) -> CompileResult<()> {
    match num_bits {
        8 | 16 | 32 | 64 => Ok(()),
        _ => Err(CompileError::WidthMismatch { num_bits }),
    }
}

/// Whether `value` is representable in `num_bits`, either signed or unsigned.
pub(crate) fn imm_fits(value: i64, num_bits: u8) -> bool {
    if num_bits >= 64 {
        return true;
    }
    let min = -(1i64 << (num_bits - 1));
    let max = (1i64 << num_bits) - 1;
    value >= min && value <= max
}

impl Opnd {
    pub const EC: Opnd = Opnd::Reg {
        reg: Reg::special(SpecialReg::Ec),
        num_bits: 64,
    };
    pub const CFP: Opnd = Opnd::Reg {
        reg: Reg::special(SpecialReg::Cfp),
        num_bits: 64,
    };
    pub const SP: Opnd = Opnd::Reg {
        reg: Reg::special(SpecialReg::Sp),
        num_bits: 64,
    };
    pub const SELF: Opnd = Opnd::Reg {
        reg: Reg::special(SpecialReg::SelfVal),
        num_bits: 64,
    };

    /// 64-bit signed immediate.
    pub const fn imm(value: i64) -> Opnd {
        Opnd::Imm {
            value,
            num_bits: 64,
        }
    }

    /// 64-bit immediate from an unsigned bit pattern.
    pub const fn uimm(value: u64) -> Opnd {
        Opnd::Imm {
            value: value as i64,
            num_bits: 64,
        }
    }

    /// Immediate of an explicit width.
    pub fn imm_sized(value: i64, num_bits: u8) -> CompileResult<Opnd> {
        check_width(num_bits)?;
        if !imm_fits(value, num_bits) {
            return Err(CompileError::OperandOverflow { value, num_bits });
        }
        Ok(Opnd::Imm { value, num_bits })
    }

    /// Raw host pointer embedded as a 64-bit immediate.
    pub fn const_ptr<T>(ptr: *const T) -> Opnd {
        Opnd::uimm(ptr as usize as u64)
    }

    pub fn code_ptr(ptr: CodePtr) -> CompileResult<Opnd> {
        if ptr.is_null() {
            return Err(CompileError::contract("code_ptr", "null code pointer"));
        }
        Ok(Opnd::CodePtr(ptr))
    }

    /// Memory operand `[base + disp]` of `num_bits` width. `base` must be a register.
    pub fn mem(num_bits: u8, base: Opnd, disp: i32) -> CompileResult<Opnd> {
        check_width(num_bits)?;
        match base {
            Opnd::Reg { reg, .. } => Ok(Opnd::Mem(Mem {
                base: reg,
                disp,
                num_bits,
            })),
            other => Err(CompileError::contract(
                "mem",
                format!("base must be a register, got {}", other.kind().name()),
            )),
        }
    }

    pub const fn reg(reg: Reg) -> Opnd {
        Opnd::Reg { reg, num_bits: 64 }
    }

    pub const fn value(value: Value) -> Opnd {
        Opnd::Value(value)
    }

    pub(crate) const fn machine_reg(reg: MachineReg) -> Opnd {
        Opnd::reg(Reg::machine(reg))
    }

    pub(crate) const fn out(idx: u32) -> Opnd {
        Opnd::InsnOut { idx, num_bits: 64 }
    }

    pub fn kind(&self) -> OpndKind {
        match self {
            Opnd::Void => OpndKind::Void,
            Opnd::Value(_) => OpndKind::Value,
            Opnd::InsnOut { .. } => OpndKind::InsnOut,
            Opnd::CodePtr(_) => OpndKind::CodePtr,
            Opnd::LabelName(_) => OpndKind::LabelName,
            Opnd::LabelIdx(_) => OpndKind::LabelIdx,
            Opnd::Str(_) => OpndKind::Str,
            Opnd::Mem(_) => OpndKind::Mem,
            Opnd::Imm { .. } => OpndKind::Imm,
            Opnd::Reg { .. } => OpndKind::Reg,
        }
    }

    /// Width in bits for kinds that carry one.
    pub fn num_bits(&self) -> Option<u8> {
        match self {
            Opnd::InsnOut { num_bits, .. }
            | Opnd::Imm { num_bits, .. }
            | Opnd::Reg { num_bits, .. } => Some(*num_bits),
            Opnd::Mem(mem) => Some(mem.num_bits),
            Opnd::Value(_) | Opnd::CodePtr(_) => Some(64),
            _ => None,
        }
    }

    /// Recheck the width carried by an operand built outside the constructors.
    /// Registers and instruction results are always full width.
    pub fn check_width(&self) -> CompileResult<()> {
        match *self {
            Opnd::Imm { value, num_bits } => {
                check_width(num_bits)?;
                if !imm_fits(value, num_bits) {
                    return Err(CompileError::OperandOverflow { value, num_bits });
                }
                Ok(())
            }
            Opnd::Mem(mem) => check_width(mem.num_bits),
            Opnd::Reg { num_bits, .. } | Opnd::InsnOut { num_bits, .. } if num_bits != 64 => {
                Err(CompileError::WidthMismatch { num_bits })
            }
            _ => Ok(()),
        }
    }

    /// Kinds that denote a runtime value usable as a data operand.
    pub fn is_value_like(&self) -> bool {
        matches!(
            self.kind(),
            OpndKind::Value
                | OpndKind::InsnOut
                | OpndKind::CodePtr
                | OpndKind::Mem
                | OpndKind::Imm
                | OpndKind::Reg
        )
    }

    /// Registers and instruction results (which resolve to registers or slots).
    pub fn is_reg_like(&self) -> bool {
        matches!(self, Opnd::Reg { .. } | Opnd::InsnOut { .. })
    }

    pub fn imm_value(&self) -> Option<i64> {
        match self {
            Opnd::Imm { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Opnd::Reg { reg, .. } => Some(*reg),
            _ => None,
        }
    }

    pub fn insn_out_idx(&self) -> Option<u32> {
        match self {
            Opnd::InsnOut { idx, .. } => Some(*idx),
            _ => None,
        }
    }
}
