//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Register numbering and the reserved/special/scratch register sets
//! - Instruction encoding using iced-x86
//! - System V calling convention implementation
//! - The two-pass emitter that turns allocated IR into machine code

pub mod calling_convention;
pub mod emitter;
pub mod encoder;
pub mod regs;

pub use calling_convention::{CCAssigner, CCAssignment, SysVAssigner};
pub use emitter::{emit, EmittedCode};
pub use encoder::{EncodingError, X64Encoder};
