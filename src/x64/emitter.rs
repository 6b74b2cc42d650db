// This module turns an allocated sequence into x86-64 machine code in two passes. Pass one
// walks the instructions in order, records the byte offset of each one in Insn::pos, resolves
// every LABEL to its own offset and emits code through X64Encoder. Operands an x86 form cannot
// take directly (immediates wider than 32 bits, Values, code pointers, narrow or second memory
// operands) are first loaded into the emitter scratch register r11; a first operand that is
// not a register goes through the spill scratch r10. Values are always loaded with the fixed
// ten-byte mov so their immediates can be recorded as GcRefs. Branches are emitted as rel32
// forms with zero displacement and remembered. Pass two patches each remembered branch with
// the distance from the end of the branch to its label, failing with UnresolvedLabel if a
// label never received an offset; nothing has been committed to executable memory at that
// point. CCALL marshals arguments by pushing them right to left and popping the register
// arguments into place, keeping the stack 16-byte aligned at the call.

//! Two-pass x86-64 emitter and branch patcher.

use crate::codegen::regalloc::FrameLayout;
use crate::core::error::{CompileError, CompileResult};
use crate::core::insn::{Insn, Op};
use crate::core::interner::Interner;
use crate::core::label::{LabelIdx, LabelTable};
use crate::core::operand::{Mem, Opnd};
use crate::invalidation::GcRef;
use crate::x64::calling_convention::{CCAssigner, SysVAssigner};
use crate::x64::encoder::{AluOp, JumpCondition, MemRef, X64Encoder};
use crate::x64::regs::{self, MachineReg};

/// Machine code for one unit, not yet in executable memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    /// Embedded `Value` immediates, by offset into `code`.
    pub gc_refs: Vec<GcRef>,
    pub branches_patched: u32,
}

/// Source operand after legalisation.
enum Src {
    Reg(MachineReg),
    Imm(i32),
    Mem(MemRef),
}

fn mem_ref(mem: Mem) -> MemRef {
    MemRef {
        base: mem.base.machine_reg(),
        disp: mem.disp,
        num_bits: mem.num_bits,
    }
}

fn unexpected(op: Op, opnd: Opnd) -> CompileError {
    CompileError::contract(
        op.name(),
        format!("{} operand cannot be emitted", opnd.kind().name()),
    )
}

struct Emitter {
    enc: X64Encoder,
    frame: FrameLayout,
    gc_refs: Vec<GcRef>,
    /// Displacement offset and target of every branch emitted in pass one.
    branches: Vec<(u32, LabelIdx)>,
    cc: SysVAssigner,
}

impl Emitter {
    /// Load any data operand into `dst`.
    fn load_into(&mut self, op: Op, dst: MachineReg, src: Opnd) -> CompileResult<()> {
        match src {
            Opnd::Reg { reg, .. } => {
                let src = reg.machine_reg();
                if src != dst {
                    self.enc.mov_rr(dst, src)?;
                }
            }
            Opnd::Imm { value, .. } => self.enc.mov_ri(dst, value)?,
            Opnd::Value(value) => {
                let offset = self.enc.mov_ri64_fixed(dst, value.as_u64())?;
                self.gc_refs.push(GcRef { offset, value });
            }
            Opnd::CodePtr(ptr) => self.enc.mov_ri(dst, ptr.addr() as i64)?,
            Opnd::Mem(mem) => self.enc.load(dst, mem_ref(mem))?,
            other => return Err(unexpected(op, other)),
        }
        Ok(())
    }

    /// Legalise a second operand of an ALU or CMP form.
    fn alu_src(&mut self, op: Op, src: Opnd) -> CompileResult<Src> {
        match src {
            Opnd::Reg { reg, .. } => Ok(Src::Reg(reg.machine_reg())),
            Opnd::Imm { value, .. } if i32::try_from(value).is_ok() => Ok(Src::Imm(value as i32)),
            Opnd::Mem(mem) if mem.num_bits == 64 => Ok(Src::Mem(mem_ref(mem))),
            other => {
                self.load_into(op, regs::EMIT_SCRATCH, other)?;
                Ok(Src::Reg(regs::EMIT_SCRATCH))
            }
        }
    }

    /// Register holding the first operand, loading it into r10 if needed.
    fn dst_reg(&mut self, op: Op, dst: Opnd) -> CompileResult<MachineReg> {
        match dst {
            Opnd::Reg { reg, .. } => Ok(reg.machine_reg()),
            other => {
                self.load_into(op, regs::SPILL_SCRATCH, other)?;
                Ok(regs::SPILL_SCRATCH)
            }
        }
    }

    /// Write r10 back when the first operand was not a register.
    fn write_back(&mut self, dst: Opnd) -> CompileResult<()> {
        if let Opnd::Mem(mem) = dst {
            self.enc.store(mem_ref(mem), regs::SPILL_SCRATCH)?;
        }
        Ok(())
    }

    fn alu(&mut self, insn: &Insn, alu: AluOp) -> CompileResult<()> {
        let dst_opnd = insn.opnd(0);
        let dst = self.dst_reg(insn.op, dst_opnd)?;
        match self.alu_src(insn.op, insn.opnd(1))? {
            Src::Reg(src) => self.enc.alu_rr(alu, dst, src)?,
            Src::Imm(imm) => self.enc.alu_ri(alu, dst, imm)?,
            Src::Mem(mem) => self.enc.alu_rm(alu, dst, mem)?,
        }
        self.write_back(dst_opnd)
    }

    fn mov(&mut self, insn: &Insn) -> CompileResult<()> {
        match insn.opnd(0) {
            Opnd::Reg { reg, .. } => self.load_into(insn.op, reg.machine_reg(), insn.opnd(1)),
            Opnd::Mem(mem) => {
                let src = match insn.opnd(1) {
                    Opnd::Reg { reg, .. } => reg.machine_reg(),
                    other => {
                        self.load_into(insn.op, regs::EMIT_SCRATCH, other)?;
                        regs::EMIT_SCRATCH
                    }
                };
                self.enc.store(mem_ref(mem), src)?;
                Ok(())
            }
            other => Err(unexpected(insn.op, other)),
        }
    }

    fn cmp(&mut self, insn: &Insn) -> CompileResult<()> {
        let left = self.dst_reg(insn.op, insn.opnd(0))?;
        match self.alu_src(insn.op, insn.opnd(1))? {
            Src::Reg(right) => self.enc.cmp_rr(left, right)?,
            Src::Imm(imm) => self.enc.cmp_ri(left, imm)?,
            Src::Mem(mem) => self.enc.cmp_rm(left, mem)?,
        }
        Ok(())
    }

    fn cmov(&mut self, insn: &Insn) -> CompileResult<()> {
        let cond = insn
            .op
            .cmov_cond()
            .ok_or_else(|| CompileError::contract(insn.op.name(), "not a conditional move"))?;
        let dst_opnd = insn.opnd(0);
        let dst = self.dst_reg(insn.op, dst_opnd)?;
        match insn.opnd(1) {
            Opnd::Reg { reg, .. } => self.enc.cmov_rr(cond, dst, reg.machine_reg())?,
            Opnd::Mem(mem) if mem.num_bits == 64 => self.enc.cmov_rm(cond, dst, mem_ref(mem))?,
            other => {
                self.load_into(insn.op, regs::EMIT_SCRATCH, other)?;
                self.enc.cmov_rr(cond, dst, regs::EMIT_SCRATCH)?;
            }
        }
        self.write_back(dst_opnd)
    }

    fn branch(&mut self, insn: &Insn, cond: Option<JumpCondition>) -> CompileResult<()> {
        let Opnd::LabelIdx(target) = insn.opnd(0) else {
            return Err(unexpected(insn.op, insn.opnd(0)));
        };
        let at = match cond {
            Some(cond) => self.enc.jcc_rel32(cond)?,
            None => self.enc.jmp_rel32()?,
        };
        self.branches.push((at, target));
        Ok(())
    }

    fn push_arg(&mut self, op: Op, arg: Opnd) -> CompileResult<()> {
        match arg {
            Opnd::Reg { reg, .. } => self.enc.push_r(reg.machine_reg())?,
            Opnd::Mem(mem) if mem.num_bits == 64 => self.enc.push_m(mem_ref(mem))?,
            other => {
                self.load_into(op, regs::EMIT_SCRATCH, other)?;
                self.enc.push_r(regs::EMIT_SCRATCH)?;
            }
        }
        Ok(())
    }

    fn ccall(&mut self, insn: &Insn) -> CompileResult<()> {
        let args = insn.opnds.get(1..).unwrap_or(&[]);
        self.cc.reset();
        let assigned: Vec<_> = args.iter().map(|_| self.cc.assign_arg()).collect();
        let stack_slots = self.cc.stack_size() / 8;
        let pad = stack_slots % 2;

        if pad == 1 {
            self.enc.alu_ri(AluOp::Sub, regs::RSP, 8)?;
        }
        for &arg in args.iter().rev() {
            self.push_arg(insn.op, arg)?;
        }
        for reg in assigned.iter().filter_map(|a| a.reg) {
            self.enc.pop_r(reg)?;
        }

        self.load_into(insn.op, regs::EMIT_SCRATCH, insn.opnd(0))?;
        self.enc.call_r(regs::EMIT_SCRATCH)?;

        let release = (stack_slots + pad) * 8;
        if release > 0 {
            self.enc.alu_ri(AluOp::Add, regs::RSP, release as i32)?;
        }
        Ok(())
    }

    fn insn(&mut self, insn: &Insn, labels: &mut LabelTable, offset: u32) -> CompileResult<()> {
        match insn.op {
            Op::Comment => {}
            Op::Label => {
                let Opnd::LabelIdx(idx) = insn.opnd(0) else {
                    return Err(unexpected(insn.op, insn.opnd(0)));
                };
                labels.resolve(idx, offset);
            }
            Op::Add => self.alu(insn, AluOp::Add)?,
            Op::Sub => self.alu(insn, AluOp::Sub)?,
            Op::And => self.alu(insn, AluOp::And)?,
            Op::Not => {
                let dst_opnd = insn.opnd(0);
                let dst = self.dst_reg(insn.op, dst_opnd)?;
                self.enc.not_r(dst)?;
                self.write_back(dst_opnd)?;
            }
            Op::Mov => self.mov(insn)?,
            Op::Cmp => self.cmp(insn)?,
            Op::CmovGe | Op::CmovGt | Op::CmovLe | Op::CmovLt => self.cmov(insn)?,
            Op::Je => self.branch(insn, Some(JumpCondition::Equal))?,
            Op::Jne => self.branch(insn, Some(JumpCondition::NotEqual))?,
            Op::JumpOvf => self.branch(insn, Some(JumpCondition::Overflow))?,
            Op::Jmp => self.branch(insn, None)?,
            Op::Call => {
                self.load_into(insn.op, regs::EMIT_SCRATCH, insn.opnd(0))?;
                self.enc.call_r(regs::EMIT_SCRATCH)?;
            }
            Op::CCall => self.ccall(insn)?,
            Op::Ret => {
                if self.frame.needs_frame {
                    self.enc.emit_epilogue()?;
                }
                self.enc.ret()?;
            }
            Op::CPush => {
                let reg = self.dst_reg(insn.op, insn.opnd(0))?;
                self.enc.push_r(reg)?;
            }
            Op::CPopInto => {
                let Opnd::Reg { reg, .. } = insn.opnd(0) else {
                    return Err(unexpected(insn.op, insn.opnd(0)));
                };
                self.enc.pop_r(reg.machine_reg())?;
            }
            Op::JumpEq | Op::JumpNe | Op::RetVal
            | Op::SelectGe | Op::SelectGt | Op::SelectLe | Op::SelectLt => {
                return Err(CompileError::contract(
                    insn.op.name(),
                    "builder-level instruction reached the emitter",
                ));
            }
        }
        Ok(())
    }
}

/// Emit `insns`, recording positions and label offsets, then patch branches.
pub fn emit(
    insns: &mut [Insn],
    labels: &mut LabelTable,
    names: &Interner,
    frame: FrameLayout,
) -> CompileResult<EmittedCode> {
    let mut em = Emitter {
        enc: X64Encoder::new()?,
        frame,
        gc_refs: Vec::new(),
        branches: Vec::new(),
        cc: SysVAssigner::new(),
    };

    if frame.needs_frame {
        em.enc.emit_prologue(frame.frame_size())?;
    }

    // Pass 1: emit and record positions.
    for insn in insns.iter_mut() {
        let offset = em.enc.offset()?;
        insn.pos = Some(offset);
        em.insn(insn, labels, offset)?;
        log::trace!("{offset:#06x} {}", insn.op.name());
    }

    // Pass 2: patch branch displacements.
    for &(at, target) in &em.branches {
        let Some(label_offset) = labels.offset(target) else {
            let name = labels
                .name(target)
                .map(|sym| names.resolve(sym).to_string())
                .unwrap_or_else(|| format!("#{}", target.index()));
            return Err(CompileError::UnresolvedLabel { name });
        };
        em.enc.patch_rel32(at, label_offset)?;
    }

    let branches_patched = em.branches.len() as u32;
    let code = em.enc.finish()?;
    log::debug!(
        "emitted {} bytes, {} branches patched, {} GC references",
        code.len(),
        branches_patched,
        em.gc_refs.len()
    );

    Ok(EmittedCode {
        code,
        gc_refs: em.gc_refs,
        branches_patched,
    })
}
