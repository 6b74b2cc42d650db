// This module is the hub of the backend's target-independent infrastructure. It exports the
// operand model (tagged operands that stay within 16 bytes, special interpreter registers and
// validating constructors), the instruction catalogue with per-opcode arity and flag
// behaviour, the append-only instruction builder with its label handles, the label table
// that carries a label from name to index to byte offset, the string interner, the error
// type shared by every stage, the options record and the statistics counters. Code in
// codegen/ and x64/ consumes these types; nothing here depends on how machine code is laid
// out beyond the register numbering in x64::regs.

//! Core IR infrastructure.
//!
//! # Key Components
//!
//! ## Operands (`operand`)
//! - [`Opnd`] with the `Void`, `Value`, `InsnOut`, `CodePtr`, `LabelName`,
//!   `LabelIdx`, `Str`, `Mem`, `Imm` and `Reg` kinds
//! - Special registers [`Opnd::EC`], [`Opnd::CFP`], [`Opnd::SP`], [`Opnd::SELF`]
//!
//! ## Instructions (`insn`, `builder`)
//! - Opcode catalogue with operand contracts
//! - [`InsnSeq`] append-only builder that validates each instruction
//!
//! ## Labels (`label`)
//! - Name, index and offset stages of a branch target

pub mod builder;
pub mod error;
pub mod insn;
pub mod interner;
pub mod label;
pub mod operand;
pub mod options;
pub mod stats;

pub use builder::{InsnSeq, Label};
pub use error::{CompileError, CompileResult};
pub use insn::{Arity, Cond, Insn, Op, OpInfo};
pub use interner::{Interner, Symbol};
pub use label::{LabelIdx, LabelState, LabelTable};
pub use operand::{CodePtr, Mem, Opnd, OpndKind, Reg, SpecialReg, Value};
pub use options::{DumpMode, JitOptions};
pub use stats::{Counter, Stats, StatsSnapshot};
