// This module implements the System V AMD64 argument assignment used by CCALL. Every argument
// the backend passes is a 64-bit general-purpose value: the first six go in RDI, RSI, RDX,
// RCX, R8 and R9, the rest go on the stack in 8-byte slots, and the return value comes back
// in RAX. The CCAssigner trait is the seam the emitter uses to place arguments and lowering
// uses to find the return register; SysVAssigner is its only implementation. CCInfo records
// which registers a callee preserves; the allocator saves the rest around every call.

//! System V x86-64 calling convention.

use crate::codegen::regalloc::RegBitSet;
use crate::x64::regs::{self, MachineReg};

/// Integer argument registers in assignment order.
pub const GP_ARG_REGS: [MachineReg; 6] = [
    regs::RDI,
    regs::RSI,
    regs::RDX,
    regs::RCX,
    regs::R8,
    regs::R9,
];

/// Where one argument is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    /// Assigned register (if any).
    pub reg: Option<MachineReg>,
    /// Offset from the stack pointer at the call (if assigned to stack).
    pub stack_off: Option<u32>,
}

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers that must be preserved by callee.
    pub callee_saved_regs: RegBitSet,
}

impl CCInfo {
    /// Registers a call may clobber.
    pub fn caller_saved(&self) -> RegBitSet {
        let mut set = RegBitSet::new();
        for reg in 0..regs::NUM_GP_REGS {
            if reg != regs::RSP && !self.callee_saved_regs.contains(reg) {
                set.set(reg);
            }
        }
        set
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn ccinfo(&self) -> &CCInfo;

    /// Place the next 64-bit integer argument.
    fn assign_arg(&mut self) -> CCAssignment;

    /// Register holding a 64-bit integer return value.
    fn ret_reg(&self) -> MachineReg;

    /// Reset state for a new call.
    fn reset(&mut self);

    /// Stack bytes used by arguments assigned so far.
    fn stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
pub struct SysVAssigner {
    cc_info: CCInfo,
    gp_cnt: usize,
    stack: u32,
}

impl Default for SysVAssigner {
    fn default() -> Self {
        Self {
            cc_info: CCInfo {
                callee_saved_regs: RegBitSet::from_regs(&[
                    regs::RBX,
                    regs::RBP,
                    regs::R12,
                    regs::R13,
                    regs::R14,
                    regs::R15,
                ]),
            },
            gp_cnt: 0,
            stack: 0,
        }
    }
}

impl SysVAssigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self) -> CCAssignment {
        if let Some(&reg) = GP_ARG_REGS.get(self.gp_cnt) {
            self.gp_cnt += 1;
            CCAssignment {
                reg: Some(reg),
                stack_off: None,
            }
        } else {
            let off = self.stack;
            self.stack += 8;
            CCAssignment {
                reg: None,
                stack_off: Some(off),
            }
        }
    }

    fn ret_reg(&self) -> MachineReg {
        regs::RET_REG
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.stack = 0;
    }

    fn stack_size(&self) -> u32 {
        self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_stack_arguments() {
        let mut cc = SysVAssigner::new();
        let assigned: Vec<CCAssignment> = (0..8).map(|_| cc.assign_arg()).collect();

        for (a, &reg) in assigned.iter().zip(GP_ARG_REGS.iter()) {
            assert_eq!(a.reg, Some(reg));
        }
        assert_eq!(assigned[6].stack_off, Some(0));
        assert_eq!(assigned[7].stack_off, Some(8));
        assert_eq!(cc.stack_size(), 16);

        cc.reset();
        assert_eq!(cc.assign_arg().reg, Some(regs::RDI));
        assert_eq!(cc.stack_size(), 0);
    }

    #[test]
    fn test_clobber_sets() {
        let cc = SysVAssigner::new();
        let clobbered = cc.ccinfo().caller_saved();
        assert!(clobbered.contains(regs::RAX));
        assert!(clobbered.contains(regs::R11));
        for reg in regs::SPECIAL_BACKING {
            assert!(!clobbered.contains(reg));
        }
        assert!(!clobbered.contains(regs::RSP));
        assert_eq!(cc.ret_reg(), regs::RAX);
    }
}
