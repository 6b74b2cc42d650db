//! JIT configuration.
//!
//! Consumed by the backend: executable memory size, statistics, the start-up
//! self-test and the dump mode. The tiering fields are carried for the driver.

use crate::core::error::{CompileError, CompileResult};

/// What the backend logs at `info` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    #[default]
    None,
    /// Log each invalidation.
    Invalidations,
    /// Also log every compiled sequence as built and as assembled.
    Insns,
}

impl DumpMode {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => DumpMode::None,
            1 => DumpMode::Invalidations,
            _ => DumpMode::Insns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    /// Size of the executable arena in MiB.
    pub exec_mem_size_mib: usize,
    /// Calls before a method is compiled.
    pub call_threshold: u32,
    pub greedy_versioning: bool,
    /// Maximum block versions per location.
    pub max_versions: u32,
    pub gen_stats: bool,
    /// Compile a fixed set of sequences at start-up.
    pub test_backend: bool,
    pub dump_mode: DumpMode,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            exec_mem_size_mib: 64,
            call_threshold: 10,
            greedy_versioning: false,
            max_versions: 4,
            gen_stats: false,
            test_backend: false,
            dump_mode: DumpMode::None,
        }
    }
}

impl JitOptions {
    pub fn validate(&self) -> CompileResult<()> {
        if self.exec_mem_size_mib == 0 {
            return Err(CompileError::InvalidOption {
                reason: "exec_mem_size_mib must be at least 1".to_string(),
            });
        }
        if self.exec_mem_size_mib > 1 << 20 {
            return Err(CompileError::InvalidOption {
                reason: format!("exec_mem_size_mib {} is too large", self.exec_mem_size_mib),
            });
        }
        if self.call_threshold == 0 {
            return Err(CompileError::InvalidOption {
                reason: "call_threshold must be at least 1".to_string(),
            });
        }
        if self.max_versions == 0 {
            return Err(CompileError::InvalidOption {
                reason: "max_versions must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn exec_mem_bytes(&self) -> usize {
        self.exec_mem_size_mib * 1024 * 1024
    }
}
