//! irjit - IR code generation backend for a bytecode JIT.
//!
//! Compiles short instruction sequences built by a JIT front end into x86-64
//! machine code: lowering to two-address form, linear-scan register
//! allocation, and two-pass emission with label patching. Committed code
//! lives in an executable arena; embedded object references stay visible to
//! a relocating garbage collector.
//!
//! # Primary Usage
//!
//! ```ignore
//! use irjit::{InsnSeq, Jit, JitOptions, Opnd, OwnerId};
//!
//! let jit = Jit::new(JitOptions::default())?;
//! let mut seq = InsnSeq::new();
//! let next = seq.add(Opnd::SP, Opnd::imm(8))?;
//! seq.mov(Opnd::SP, next)?;
//! seq.ret()?;
//! let unit = jit.compile(OwnerId(1), seq, vec![])?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Operands, instruction catalogue, builder, labels, errors, options, stats
//! - [`codegen`] - Lowering, register allocation and the pipeline driver
//! - [`x64`] - x86-64 specific code (registers, encoder, calling convention, emitter)
//! - [`exec_mem`] - Executable memory arena
//! - [`invalidation`] - Compiled-unit bookkeeping for invalidation and GC
//! - [`dump`] / [`text_ir`] - Textual rendering and parsing of sequences
//! - [`object_file`] - ELF export of assembled code
//! - [`jit`] - The [`Jit`] facade a runtime driver talks to

pub mod codegen;
pub mod core;
pub mod dump;
pub mod exec_mem;
pub mod invalidation;
pub mod jit;
pub mod object_file;
pub mod text_ir;
pub mod x64;

pub use crate::core::{
    CompileError, CompileResult, Cond, DumpMode, Insn, InsnSeq, JitOptions, Label, Op, Opnd,
    Reg, SpecialReg, Stats, Value,
};
pub use codegen::{assemble, Assembled, CompiledCode};
pub use exec_mem::{CodeRegion, ExecArena};
pub use invalidation::{Assumption, GcRef, OwnerId, UnitId, UnitRegistry};
pub use jit::{CompiledUnit, Jit};
