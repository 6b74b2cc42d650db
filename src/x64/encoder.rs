// This module provides x86-64 instruction encoding on top of the iced-x86 code assembler.
// X64Encoder keeps a flat byte buffer and an iced CodeAssembler holding the instructions of
// the IR instruction currently being emitted; offset() flushes the pending instructions into
// the buffer (assembled at their final offset) so the emitter can record exact positions for
// instructions and labels. Two forms bypass iced because their layout is part of the
// backend's contract: conditional and unconditional rel32 branches (0F 8x / E9 with a
// zeroed displacement that the emitter patches in its second pass) and the ten-byte
// `mov r64, imm64` used for GC-tracked Values, whose immediate the garbage collector may
// later rewrite in place. Everything else (moves of every width, ADD/SUB/AND/NOT, CMP,
// CMOVcc, PUSH/POP, indirect calls, RET and the frame prologue/epilogue) goes through the
// assembler. Registers are plain hardware numbers from x64::regs.

//! x86-64 instruction encoding using iced-x86.

use crate::core::insn::Cond;
use crate::x64::regs::{self, MachineReg};
use iced_x86::code_asm::*;
use iced_x86::IcedError;
use thiserror::Error;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("register {0} is not a general-purpose register")]
    InvalidRegister(u8),

    #[error("unsupported operand combination for {0}")]
    UnsupportedOperands(&'static str),

    #[error("assembly error: {0}")]
    AssemblyError(String),

    #[error("patch site {0:#x} lies outside the emitted code")]
    InvalidPatchSite(u32),
}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

/// Two-operand arithmetic handled by [`X64Encoder::alu_rr`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
}

/// Conditions of the patched rel32 branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Overflow,
}

impl JumpCondition {
    /// Second opcode byte of the `0F 8x rel32` form.
    fn opcode(self) -> u8 {
        match self {
            JumpCondition::Overflow => 0x80,
            JumpCondition::Equal => 0x84,
            JumpCondition::NotEqual => 0x85,
        }
    }
}

/// `[base + disp]` of a given access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: MachineReg,
    pub disp: i32,
    pub num_bits: u8,
}

/// x86-64 instruction encoder.
pub struct X64Encoder {
    /// Instructions not yet assembled into `code`.
    assembler: CodeAssembler,
    pending: bool,
    code: Vec<u8>,
}

fn gp64(reg: MachineReg) -> Result<AsmRegister64, EncodingError> {
    const GP64_REGS: [AsmRegister64; 16] = [
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
        r8, r9, r10, r11, r12, r13, r14, r15,
    ];
    GP64_REGS
        .get(reg as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg))
}

fn gp32(reg: MachineReg) -> Result<AsmRegister32, EncodingError> {
    const GP32_REGS: [AsmRegister32; 16] = [
        eax, ecx, edx, ebx, esp, ebp, esi, edi,
        r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    ];
    GP32_REGS
        .get(reg as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg))
}

fn gp16(reg: MachineReg) -> Result<AsmRegister16, EncodingError> {
    const GP16_REGS: [AsmRegister16; 16] = [
        ax, cx, dx, bx, sp, bp, si, di,
        r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
    ];
    GP16_REGS
        .get(reg as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg))
}

fn gp8(reg: MachineReg) -> Result<AsmRegister8, EncodingError> {
    const GP8_REGS: [AsmRegister8; 16] = [
        al, cl, dl, bl, spl, bpl, sil, dil,
        r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    ];
    GP8_REGS
        .get(reg as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister(reg))
}

fn mem_operand(mem: MemRef) -> Result<AsmMemoryOperand, EncodingError> {
    let base = gp64(mem.base)?;
    Ok(match mem.num_bits {
        64 => qword_ptr(base + mem.disp),
        32 => dword_ptr(base + mem.disp),
        16 => word_ptr(base + mem.disp),
        8 => byte_ptr(base + mem.disp),
        _ => return Err(EncodingError::UnsupportedOperands("memory width")),
    })
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            assembler: CodeAssembler::new(64)?,
            pending: false,
            code: Vec::new(),
        })
    }

    fn emit<F>(&mut self, f: F) -> Result<(), EncodingError>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        f(&mut self.assembler)?;
        self.pending = true;
        Ok(())
    }

    /// Assemble pending instructions at their final offset.
    fn flush(&mut self) -> Result<(), EncodingError> {
        if !self.pending {
            return Ok(());
        }
        let mut asm = std::mem::replace(&mut self.assembler, CodeAssembler::new(64)?);
        let bytes = asm.assemble(self.code.len() as u64)?;
        self.code.extend_from_slice(&bytes);
        self.pending = false;
        Ok(())
    }

    /// Current byte offset, with everything emitted so far accounted for.
    pub fn offset(&mut self) -> Result<u32, EncodingError> {
        self.flush()?;
        Ok(self.code.len() as u32)
    }

    pub fn mov_rr(&mut self, dst: MachineReg, src: MachineReg) -> Result<(), EncodingError> {
        let (dst, src) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| a.mov(dst, src))
    }

    pub fn mov_ri(&mut self, dst: MachineReg, imm: i64) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        self.emit(|a| a.mov(dst, imm))
    }

    /// `mov r64, imm64` in its fixed ten-byte form. Returns the offset of the
    /// immediate so it can be rewritten in place.
    pub fn mov_ri64_fixed(&mut self, dst: MachineReg, imm: u64) -> Result<u32, EncodingError> {
        if dst >= regs::NUM_GP_REGS {
            return Err(EncodingError::InvalidRegister(dst));
        }
        self.flush()?;
        self.code.push(0x48 | ((dst >> 3) & 1));
        self.code.push(0xB8 + (dst & 7));
        let imm_at = self.code.len() as u32;
        self.code.extend_from_slice(&imm.to_le_bytes());
        Ok(imm_at)
    }

    /// Zero-extending load of `mem.num_bits` into a 64-bit register.
    pub fn load(&mut self, dst: MachineReg, mem: MemRef) -> Result<(), EncodingError> {
        let m = mem_operand(mem)?;
        match mem.num_bits {
            64 => {
                let dst = gp64(dst)?;
                self.emit(|a| a.mov(dst, m))
            }
            32 => {
                let dst = gp32(dst)?;
                self.emit(|a| a.mov(dst, m))
            }
            _ => {
                let dst = gp32(dst)?;
                self.emit(|a| a.movzx(dst, m))
            }
        }
    }

    /// Store the low `mem.num_bits` of a register.
    pub fn store(&mut self, mem: MemRef, src: MachineReg) -> Result<(), EncodingError> {
        let m = mem_operand(mem)?;
        match mem.num_bits {
            64 => {
                let src = gp64(src)?;
                self.emit(|a| a.mov(m, src))
            }
            32 => {
                let src = gp32(src)?;
                self.emit(|a| a.mov(m, src))
            }
            16 => {
                let src = gp16(src)?;
                self.emit(|a| a.mov(m, src))
            }
            _ => {
                let src = gp8(src)?;
                self.emit(|a| a.mov(m, src))
            }
        }
    }

    pub fn alu_rr(&mut self, op: AluOp, dst: MachineReg, src: MachineReg) -> Result<(), EncodingError> {
        let (dst, src) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| match op {
            AluOp::Add => a.add(dst, src),
            AluOp::Sub => a.sub(dst, src),
            AluOp::And => a.and(dst, src),
        })
    }

    pub fn alu_ri(&mut self, op: AluOp, dst: MachineReg, imm: i32) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        self.emit(|a| match op {
            AluOp::Add => a.add(dst, imm),
            AluOp::Sub => a.sub(dst, imm),
            AluOp::And => a.and(dst, imm),
        })
    }

    /// ALU operation with a 64-bit memory source.
    pub fn alu_rm(&mut self, op: AluOp, dst: MachineReg, mem: MemRef) -> Result<(), EncodingError> {
        if mem.num_bits != 64 {
            return Err(EncodingError::UnsupportedOperands("alu with narrow memory"));
        }
        let (dst, m) = (gp64(dst)?, mem_operand(mem)?);
        self.emit(|a| match op {
            AluOp::Add => a.add(dst, m),
            AluOp::Sub => a.sub(dst, m),
            AluOp::And => a.and(dst, m),
        })
    }

    pub fn not_r(&mut self, dst: MachineReg) -> Result<(), EncodingError> {
        let dst = gp64(dst)?;
        self.emit(|a| a.not(dst))
    }

    pub fn cmp_rr(&mut self, left: MachineReg, right: MachineReg) -> Result<(), EncodingError> {
        let (left, right) = (gp64(left)?, gp64(right)?);
        self.emit(|a| a.cmp(left, right))
    }

    pub fn cmp_ri(&mut self, left: MachineReg, imm: i32) -> Result<(), EncodingError> {
        let left = gp64(left)?;
        self.emit(|a| a.cmp(left, imm))
    }

    pub fn cmp_rm(&mut self, left: MachineReg, mem: MemRef) -> Result<(), EncodingError> {
        if mem.num_bits != 64 {
            return Err(EncodingError::UnsupportedOperands("cmp with narrow memory"));
        }
        let (left, m) = (gp64(left)?, mem_operand(mem)?);
        self.emit(|a| a.cmp(left, m))
    }

    pub fn cmov_rr(&mut self, cond: Cond, dst: MachineReg, src: MachineReg) -> Result<(), EncodingError> {
        let (dst, src) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| match cond {
            Cond::Ge => a.cmovge(dst, src),
            Cond::Gt => a.cmovg(dst, src),
            Cond::Le => a.cmovle(dst, src),
            Cond::Lt => a.cmovl(dst, src),
        })
    }

    pub fn cmov_rm(&mut self, cond: Cond, dst: MachineReg, mem: MemRef) -> Result<(), EncodingError> {
        if mem.num_bits != 64 {
            return Err(EncodingError::UnsupportedOperands("cmov with narrow memory"));
        }
        let (dst, m) = (gp64(dst)?, mem_operand(mem)?);
        self.emit(|a| match cond {
            Cond::Ge => a.cmovge(dst, m),
            Cond::Gt => a.cmovg(dst, m),
            Cond::Le => a.cmovle(dst, m),
            Cond::Lt => a.cmovl(dst, m),
        })
    }

    pub fn push_r(&mut self, reg: MachineReg) -> Result<(), EncodingError> {
        let reg = gp64(reg)?;
        self.emit(|a| a.push(reg))
    }

    pub fn push_m(&mut self, mem: MemRef) -> Result<(), EncodingError> {
        let m = mem_operand(MemRef { num_bits: 64, ..mem })?;
        self.emit(|a| a.push(m))
    }

    pub fn pop_r(&mut self, reg: MachineReg) -> Result<(), EncodingError> {
        let reg = gp64(reg)?;
        self.emit(|a| a.pop(reg))
    }

    pub fn call_r(&mut self, reg: MachineReg) -> Result<(), EncodingError> {
        let reg = gp64(reg)?;
        self.emit(|a| a.call(reg))
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.emit(|a| a.ret())
    }

    /// `jcc rel32` with a zero displacement. Returns the displacement offset.
    pub fn jcc_rel32(&mut self, cond: JumpCondition) -> Result<u32, EncodingError> {
        self.flush()?;
        self.code.extend_from_slice(&[0x0F, cond.opcode()]);
        let at = self.code.len() as u32;
        self.code.extend_from_slice(&[0; 4]);
        Ok(at)
    }

    /// `jmp rel32` with a zero displacement. Returns the displacement offset.
    pub fn jmp_rel32(&mut self) -> Result<u32, EncodingError> {
        self.flush()?;
        self.code.push(0xE9);
        let at = self.code.len() as u32;
        self.code.extend_from_slice(&[0; 4]);
        Ok(at)
    }

    /// Point the rel32 displacement at `at` to `target`. The displacement is
    /// relative to the end of the branch, which ends with the displacement.
    pub fn patch_rel32(&mut self, at: u32, target: u32) -> Result<(), EncodingError> {
        self.flush()?;
        let start = at as usize;
        let Some(slot) = self.code.get_mut(start..start + 4) else {
            return Err(EncodingError::InvalidPatchSite(at));
        };
        let disp = target as i64 - (at as i64 + 4);
        slot.copy_from_slice(&(disp as i32).to_le_bytes());
        Ok(())
    }

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`.
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push_r(regs::RBP)?;
        self.mov_rr(regs::RBP, regs::RSP)?;
        if frame_size > 0 {
            self.alu_ri(AluOp::Sub, regs::RSP, frame_size as i32)?;
        }
        Ok(())
    }

    /// `mov rsp, rbp; pop rbp`. The caller emits the `ret`.
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov_rr(regs::RSP, regs::RBP)?;
        self.pop_r(regs::RBP)
    }

    /// Generate the final machine code bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, EncodingError> {
        self.flush()?;
        Ok(self.code)
    }
}
