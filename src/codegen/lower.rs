// This module implements lowering: a single forward pass that rewrites the builder-level
// sequence into machine-proximate two-address instructions. Immediate pairs are folded unless
// a following JUMP_OVF needs the overflow flag of the arithmetic. An operation whose first
// operand is an ordinary register is performed in place on that register only when the old
// value is dead: no later instruction names the register (directly, as a memory base or through
// an earlier result living in it), no call clobbers it while the new result is live and no
// backward branch re-enters code before the operation. Everything else is materialised into the
// instruction's own virtual register (its InsnOut) with a MOV followed by the operation. Compound operations expand: JUMP_EQ/JUMP_NE become CMP plus a conditional
// jump, SELECT becomes MOV/CMP/CMOV, CCALL is followed by a MOV out of the return register and
// RETVAL becomes a MOV into the return register followed by RET. A resolution table maps every
// original instruction index to the operand that now holds its value, so an InsnOut keeps
// denoting the value of the instruction originally numbered K. Label names are replaced by
// dense label indices and the label closure is checked before anything is emitted.

//! Lowering of builder-level IR to two-address form.

use crate::core::builder::InsnSeq;
use crate::core::error::{CompileError, CompileResult};
use crate::core::insn::{Cond, Insn, Op};
use crate::core::interner::Interner;
use crate::core::label::LabelTable;
use crate::core::operand::Opnd;
use crate::x64::calling_convention::{CCAssigner, SysVAssigner};
use crate::x64::regs::MachineReg;
use hashbrown::HashSet;

/// Output of [`lower`].
#[derive(Debug, Clone)]
pub struct LoweredSeq {
    pub insns: Vec<Insn>,
    pub labels: LabelTable,
    pub names: Interner,
    /// Operand holding the value of each original instruction (`Void` for
    /// instructions that produce none).
    pub results: Vec<Opnd>,
    /// Size of the virtual register space (the original instruction count).
    pub num_vregs: u32,
    pub folded: u32,
}

struct Lowerer {
    out: Vec<Insn>,
    labels: LabelTable,
    names: Interner,
    results: Vec<Opnd>,
    folded: u32,
    ret_reg: MachineReg,
}

impl Lowerer {
    fn push(&mut self, op: Op, opnds: Vec<Opnd>) {
        self.out.push(Insn::new(op, opnds));
    }

    /// Map a builder-level operand to its lowered form.
    fn resolve(&mut self, opnd: Opnd) -> Opnd {
        match opnd {
            Opnd::InsnOut { idx, num_bits } => match self.results.get(idx as usize) {
                Some(Opnd::InsnOut { idx: vreg, .. }) => Opnd::InsnOut {
                    idx: *vreg,
                    num_bits,
                },
                Some(other) => *other,
                None => opnd,
            },
            Opnd::LabelName(sym) => Opnd::LabelIdx(self.labels.index(sym)),
            other => other,
        }
    }

    fn arith(&mut self, k: u32, op: Op, a: Opnd, b: Opnd, flags_needed: bool, in_place: bool) -> Opnd {
        if let (Some(x), Some(y)) = (a.imm_value(), b.imm_value()) {
            if !flags_needed {
                self.folded += 1;
                return Opnd::imm(match op {
                    Op::Add => x.wrapping_add(y),
                    Op::Sub => x.wrapping_sub(y),
                    _ => x & y,
                });
            }
        }
        if in_place {
            self.push(op, vec![a, b]);
            return a;
        }
        let out = Opnd::out(k);
        self.push(Op::Mov, vec![out, a]);
        self.push(op, vec![out, b]);
        out
    }

    fn not(&mut self, k: u32, a: Opnd, in_place: bool) -> Opnd {
        if let Some(x) = a.imm_value() {
            self.folded += 1;
            return Opnd::imm(!x);
        }
        if in_place {
            self.push(Op::Not, vec![a]);
            return a;
        }
        let out = Opnd::out(k);
        self.push(Op::Mov, vec![out, a]);
        self.push(Op::Not, vec![out]);
        out
    }

    /// Whether instruction `k` may overwrite its first operand `a` in place.
    fn can_update_in_place(&self, insns: &[Insn], k: usize, a: Opnd) -> bool {
        let Some(reg) = a.as_reg().filter(|r| !r.is_special()) else {
            return false;
        };
        let target = reg.machine_reg();
        let holds_target = |opnd: &Opnd| match *opnd {
            Opnd::Reg { reg, .. } => reg.machine_reg() == target,
            Opnd::Mem(mem) => mem.base.machine_reg() == target,
            Opnd::InsnOut { idx, .. } if (idx as usize) < k => {
                matches!(self.results.get(idx as usize), Some(Opnd::Reg { reg, .. }) if reg.machine_reg() == target)
            }
            _ => false,
        };

        let later = &insns[k + 1..];
        if later.iter().flat_map(|i| i.opnds.iter()).any(holds_target) {
            return false;
        }

        let reads_result = |i: &Insn| i.opnds.iter().any(|o| o.insn_out_idx() == Some(k as u32));
        if let Some(last_use) = later.iter().rposition(reads_result) {
            if later[..last_use].iter().any(|i| i.op.is_call()) {
                return false;
            }
        }

        let mut earlier_labels = HashSet::new();
        for insn in &insns[..=k] {
            if let (Op::Label, Some(Opnd::LabelName(sym))) = (insn.op, insn.opnds.first()) {
                earlier_labels.insert(*sym);
            }
        }
        !later.iter().any(|i| {
            matches!(i.op, Op::JumpEq | Op::JumpNe | Op::JumpOvf)
                && matches!(i.opnds.first(), Some(Opnd::LabelName(sym)) if earlier_labels.contains(sym))
        })
    }

    fn jump_cmp(&mut self, jump: Op, target: Opnd, a: Opnd, b: Opnd) {
        if let (Some(x), Some(y)) = (a.imm_value(), b.imm_value()) {
            self.folded += 1;
            if (x == y) == (jump == Op::Je) {
                self.push(Op::Jmp, vec![target]);
            }
            return;
        }
        let (a, b) = if !a.is_reg_like() && b.is_reg_like() {
            (b, a)
        } else {
            (a, b)
        };
        self.push(Op::Cmp, vec![a, b]);
        self.push(jump, vec![target]);
    }

    fn select(&mut self, k: u32, cond: Cond, opnds: [Opnd; 4]) -> Opnd {
        let [a, b, then, els] = opnds;
        if let (Some(x), Some(y)) = (a.imm_value(), b.imm_value()) {
            self.folded += 1;
            return if cond.holds(x, y) { then } else { els };
        }
        let (a, b, cond) = if !a.is_reg_like() && b.is_reg_like() {
            (b, a, cond.mirrored())
        } else {
            (a, b, cond)
        };
        let out = Opnd::out(k);
        self.push(Op::Mov, vec![out, els]);
        self.push(Op::Cmp, vec![a, b]);
        self.push(Op::cmov(cond), vec![out, then]);
        out
    }

    fn dst(&self, op: Op, opnd: Opnd) -> CompileResult<Opnd> {
        if opnd.is_reg_like() {
            Ok(opnd)
        } else {
            Err(CompileError::contract(
                op.name(),
                format!(
                    "destination resolves to {} instead of a register",
                    opnd.kind().name()
                ),
            ))
        }
    }
}

/// Lower a builder-level sequence.
pub fn lower(seq: InsnSeq) -> CompileResult<LoweredSeq> {
    let (insns, names) = seq.into_parts();
    let mut lw = Lowerer {
        out: Vec::with_capacity(insns.len() * 2),
        labels: LabelTable::new(),
        names,
        results: Vec::with_capacity(insns.len()),
        folded: 0,
        ret_reg: SysVAssigner::new().ret_reg(),
    };

    for (k, insn) in insns.iter().enumerate() {
        let k32 = k as u32;
        let opnds: Vec<Opnd> = insn.opnds.iter().map(|&o| lw.resolve(o)).collect();
        let op = insn.op;

        let result = match op {
            Op::Comment => {
                lw.push(op, opnds);
                Opnd::Void
            }
            Op::Label => {
                if let Some(Opnd::LabelIdx(idx)) = opnds.first() {
                    lw.labels.define(*idx, &lw.names)?;
                }
                lw.push(op, opnds);
                Opnd::Void
            }
            Op::Add | Op::Sub | Op::And => {
                let flags_needed = insns[k + 1..]
                    .iter()
                    .find(|i| i.op != Op::Comment)
                    .is_some_and(|i| i.op == Op::JumpOvf);
                let in_place = lw.can_update_in_place(&insns, k, opnds[0]);
                lw.arith(k32, op, opnds[0], opnds[1], flags_needed, in_place)
            }
            Op::Not => {
                let in_place = lw.can_update_in_place(&insns, k, opnds[0]);
                lw.not(k32, opnds[0], in_place)
            }
            Op::JumpEq => {
                lw.jump_cmp(Op::Je, opnds[0], opnds[1], opnds[2]);
                Opnd::Void
            }
            Op::JumpNe => {
                lw.jump_cmp(Op::Jne, opnds[0], opnds[1], opnds[2]);
                Opnd::Void
            }
            Op::JumpOvf | Op::Call | Op::Ret | Op::Cmp => {
                lw.push(op, opnds);
                Opnd::Void
            }
            Op::CCall => {
                let out = Opnd::out(k32);
                lw.push(op, opnds);
                lw.push(Op::Mov, vec![out, Opnd::machine_reg(lw.ret_reg)]);
                out
            }
            Op::RetVal => {
                lw.push(Op::Mov, vec![Opnd::machine_reg(lw.ret_reg), opnds[0]]);
                lw.push(Op::Ret, vec![]);
                Opnd::Void
            }
            Op::Mov | Op::CmovGe | Op::CmovGt | Op::CmovLe | Op::CmovLt => {
                let dst = lw.dst(op, opnds[0])?;
                lw.push(op, vec![dst, opnds[1]]);
                Opnd::Void
            }
            Op::SelectGe | Op::SelectGt | Op::SelectLe | Op::SelectLt => {
                let cond = op.select_cond().unwrap_or(Cond::Ge);
                lw.select(k32, cond, [opnds[0], opnds[1], opnds[2], opnds[3]])
            }
            Op::Je | Op::Jne | Op::Jmp | Op::CPush | Op::CPopInto => {
                return Err(CompileError::contract(
                    op.name(),
                    "internal instruction in builder-level sequence",
                ));
            }
        };
        lw.results.push(result);
    }

    lw.labels.check_closure(&lw.names)?;

    log::debug!(
        "lowered {} instructions into {} ({} folded)",
        insns.len(),
        lw.out.len(),
        lw.folded
    );

    Ok(LoweredSeq {
        insns: lw.out,
        labels: lw.labels,
        names: lw.names,
        results: lw.results,
        num_vregs: insns.len() as u32,
        folded: lw.folded,
    })
}
