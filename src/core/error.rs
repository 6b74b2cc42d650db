// This module defines the error types of the backend using the thiserror crate. CompileError
// is the single error enum surfaced by every pipeline stage: operand-contract violations caught
// while building or lowering a sequence, labels that are referenced but never defined, operand
// widths and immediates that do not fit, executable-memory exhaustion and OS mapping failures,
// iced-x86 encoding failures, text-IR parse errors, object-file export failures and invalid
// options. Every failure is local to the unit being compiled; the driver reacts to any of them
// by continuing to interpret the owning code. CompileResult<T> is the usual alias.

//! Error types for the backend.

use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Main error type for every pipeline stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("contract violation in {op}: {reason}")]
    ContractViolation { op: &'static str, reason: String },

    #[error("unresolved label `{name}`")]
    UnresolvedLabel { name: String },

    #[error("{num_bits} is not a supported operand width")]
    WidthMismatch { num_bits: u8 },

    #[error("immediate {value} does not fit in {num_bits} bits")]
    OperandOverflow { value: i64, num_bits: u8 },

    #[error("executable memory exhausted: requested {requested} bytes, {available} available")]
    AllocationExhaustion { requested: usize, available: usize },

    #[error("executable memory error: {reason}")]
    ExecMemory { reason: String },

    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("object file export failed: {reason}")]
    ObjectFile { reason: String },

    #[error("invalid option: {reason}")]
    InvalidOption { reason: String },
}

impl CompileError {
    pub(crate) fn contract(op: &'static str, reason: impl Into<String>) -> Self {
        CompileError::ContractViolation {
            op,
            reason: reason.into(),
        }
    }

    /// Whether the owning code should keep running in the interpreter.
    /// Always true: a failure only affects the unit being compiled.
    pub fn falls_back_to_interpreter(&self) -> bool {
        true
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
