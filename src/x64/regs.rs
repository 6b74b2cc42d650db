//! x86-64 general-purpose register numbering and the backend's register roles.
//!
//! Registers are identified by their hardware encoding number (rax = 0 ... r15 = 15),
//! the same numbering iced-x86 and the ModRM/REX fields use.

/// Hardware register number.
pub type MachineReg = u8;

pub const RAX: MachineReg = 0;
pub const RCX: MachineReg = 1;
pub const RDX: MachineReg = 2;
pub const RBX: MachineReg = 3;
pub const RSP: MachineReg = 4;
pub const RBP: MachineReg = 5;
pub const RSI: MachineReg = 6;
pub const RDI: MachineReg = 7;
pub const R8: MachineReg = 8;
pub const R9: MachineReg = 9;
pub const R10: MachineReg = 10;
pub const R11: MachineReg = 11;
pub const R12: MachineReg = 12;
pub const R13: MachineReg = 13;
pub const R14: MachineReg = 14;
pub const R15: MachineReg = 15;

/// Number of general-purpose registers.
pub const NUM_GP_REGS: u8 = 16;

/// Backing registers of the special operands, indexed by special slot:
/// EC, CFP, SP, SELF. All callee-saved so they survive C calls.
pub const SPECIAL_BACKING: [MachineReg; 4] = [R12, R13, RBX, R14];

/// Loads and stores of spilled first operands go through this register.
pub const SPILL_SCRATCH: MachineReg = R10;

/// Operands an instruction form cannot take directly are legalised through this register.
pub const EMIT_SCRATCH: MachineReg = R11;

/// Registers handed out by the linear-scan allocator, in preference order.
pub const ALLOC_POOL: [MachineReg; 6] = [RCX, RDX, RSI, RDI, R8, R9];

/// C return value register.
pub const RET_REG: MachineReg = RAX;

/// Whether a caller may name this register as an ordinary operand.
pub fn is_user_assignable(reg: MachineReg) -> bool {
    matches!(reg, RAX | RCX | RDX | RSI | RDI | R8 | R9)
}

/// Assembly name of a 64-bit register.
pub fn name(reg: MachineReg) -> &'static str {
    const NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
    ];
    NAMES.get(reg as usize).copied().unwrap_or("r?")
}

/// Inverse of [`name`].
pub fn from_name(name: &str) -> Option<MachineReg> {
    (0..NUM_GP_REGS).find(|&r| self::name(r) == name)
}
