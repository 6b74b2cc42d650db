// This module is the entry point a runtime driver uses. A Jit owns the options record, the
// executable-memory arena, the statistics counters and the unit registry. compile takes a
// builder-level sequence together with its owner and the assumptions it was built under,
// runs the pipeline, commits the code and records the unit; any failure is counted, logged
// and returned so the driver keeps interpreting. Invalidation hooks run against the registry
// under its lock and are counted and, depending on the dump mode, logged. When the options
// ask for it, construction compiles a fixed set of sequences twice each and checks the
// results are identical before any real code is compiled.

//! Driver-facing facade over the backend.

use crate::codegen::{assemble, CompiledCode};
use crate::core::builder::InsnSeq;
use crate::core::error::{CompileError, CompileResult};
use crate::core::operand::{Opnd, Value};
use crate::core::options::{DumpMode, JitOptions};
use crate::core::stats::{Counter, Stats};
use crate::dump::{dump_assembled, dump_seq};
use crate::exec_mem::ExecArena;
use crate::invalidation::{Assumption, OwnerId, UnitId, UnitRegistry};
use std::sync::{Mutex, MutexGuard};

/// A committed unit and its registry id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    pub id: UnitId,
    pub code: CompiledCode,
}

pub struct Jit {
    options: JitOptions,
    arena: ExecArena,
    stats: Stats,
    registry: Mutex<UnitRegistry>,
}

impl Jit {
    pub fn new(options: JitOptions) -> CompileResult<Self> {
        options.validate()?;
        let jit = Self {
            arena: ExecArena::new(options.exec_mem_bytes())?,
            stats: Stats::new(options.gen_stats),
            registry: Mutex::new(UnitRegistry::new()),
            options,
        };
        if jit.options.test_backend {
            jit.self_test()?;
        }
        Ok(jit)
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn arena(&self) -> &ExecArena {
        &self.arena
    }

    fn registry(&self) -> MutexGuard<'_, UnitRegistry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compile, commit and register one unit.
    pub fn compile(
        &self,
        owner: OwnerId,
        seq: InsnSeq,
        assumptions: Vec<Assumption>,
    ) -> CompileResult<CompiledUnit> {
        let dump_insns = self.options.dump_mode == DumpMode::Insns;
        if dump_insns {
            log::info!("compiling unit of owner {}:\n{}", owner.0, dump_seq(&seq));
        }

        let result = assemble(seq, &self.stats).and_then(|asm| {
            if dump_insns {
                log::info!("assembled unit of owner {}:\n{}", owner.0, dump_assembled(&asm));
            }
            asm.commit(&self.arena)
        });
        let code = match result {
            Ok(code) => code,
            Err(e) => {
                self.stats.incr(Counter::CompileFailures);
                if matches!(e, CompileError::AllocationExhaustion { .. }) {
                    self.stats.incr(Counter::ArenaExhausted);
                }
                log::warn!("compilation for owner {} failed, interpreting: {e}", owner.0);
                return Err(e);
            }
        };

        self.stats.incr(Counter::CompiledUnits);
        self.stats.add(Counter::CodeBytes, code.region.len() as u64);
        let id = self
            .registry()
            .register(owner, code.region, code.gc_refs.clone(), assumptions);
        Ok(CompiledUnit { id, code })
    }

    /// Run an invalidation hook against the registry.
    ///
    /// ```ignore
    /// let dead = jit.invalidate(|r| r.constant_state_changed(name));
    /// ```
    pub fn invalidate(&self, hook: impl FnOnce(&mut UnitRegistry) -> Vec<UnitId>) -> Vec<UnitId> {
        let ids = hook(&mut self.registry());
        self.stats.add(Counter::Invalidations, ids.len() as u64);
        if self.options.dump_mode != DumpMode::None {
            for id in &ids {
                log::info!("invalidated unit {}", id.index());
            }
        }
        ids
    }

    /// Read-only access to the registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&UnitRegistry) -> R) -> R {
        f(&self.registry())
    }

    /// GC hook: report the values embedded in the owner's code.
    pub fn mark_owner(&self, owner: OwnerId, mark: impl FnMut(Value)) {
        self.registry().mark_owner(owner, mark);
    }

    /// GC hook: the owner's referenced objects moved.
    pub fn owner_relocated(
        &self,
        owner: OwnerId,
        relocate: impl FnMut(Value) -> Value,
    ) -> CompileResult<usize> {
        self.registry().owner_relocated(&self.arena, owner, relocate)
    }

    /// Compile a fixed set of sequences twice and compare the code.
    pub fn self_test(&self) -> CompileResult<()> {
        let cases: [(&str, fn() -> CompileResult<InsnSeq>); 4] = [
            ("fold", || {
                let mut seq = InsnSeq::new();
                let c = seq.add(Opnd::imm(2), Opnd::imm(3))?;
                seq.retval(c)?;
                Ok(seq)
            }),
            ("loop", || {
                let mut seq = InsnSeq::new();
                let top = seq.new_label("top");
                seq.write_label(top)?;
                seq.comment("loop")?;
                let next = seq.sub(Opnd::SP, Opnd::imm(8))?;
                seq.mov(Opnd::SP, next)?;
                seq.jump_ne(top, Opnd::SP, Opnd::CFP)?;
                seq.ret()?;
                Ok(seq)
            }),
            ("select", || {
                let mut seq = InsnSeq::new();
                let v = seq.select_lt(Opnd::SELF, Opnd::imm(4), Opnd::value(Value(8)), Opnd::imm(0))?;
                seq.retval(v)?;
                Ok(seq)
            }),
            ("ccall", || {
                let mut seq = InsnSeq::new();
                let args: Vec<Opnd> = (0..8).map(Opnd::imm).collect();
                let r = seq.ccall(Opnd::imm(0x1000), &args)?;
                seq.retval(r)?;
                Ok(seq)
            }),
        ];

        let scratch = Stats::new(false);
        for (name, build) in cases {
            let first = assemble(build()?, &scratch)?;
            let second = assemble(build()?, &scratch)?;
            if first.code != second.code || first.code.is_empty() {
                return Err(CompileError::ContractViolation {
                    op: "self_test",
                    reason: format!("case `{name}` did not assemble deterministically"),
                });
            }
            log::debug!("self test `{name}`: {} bytes", first.code.len());
        }
        log::info!("backend self test passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> JitOptions {
        JitOptions {
            exec_mem_size_mib: 1,
            gen_stats: true,
            ..JitOptions::default()
        }
    }

    #[test]
    fn test_self_test_passes() {
        let jit = Jit::new(JitOptions {
            test_backend: true,
            ..options()
        })
        .unwrap();
        jit.self_test().unwrap();
    }

    #[test]
    fn test_compile_registers_unit() {
        let jit = Jit::new(options()).unwrap();
        let mut seq = InsnSeq::new();
        seq.mov(Opnd::SELF, Opnd::value(Value(0x10))).unwrap();
        seq.ret().unwrap();

        let unit = jit
            .compile(OwnerId(3), seq, vec![Assumption::SingleActor])
            .unwrap();
        assert_eq!(unit.code.gc_refs.len(), 1);
        assert_eq!(jit.stats().get(Counter::CompiledUnits), 1);
        assert_eq!(jit.with_registry(|r| r.units_of(OwnerId(3))), vec![unit.id]);

        let dead = jit.invalidate(|r| r.before_actor_fork());
        assert_eq!(dead, vec![unit.id]);
        assert_eq!(jit.stats().get(Counter::Invalidations), 1);
    }

    #[test]
    fn test_insns_dump_mode_compiles() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = Jit::new(JitOptions {
            dump_mode: DumpMode::Insns,
            ..options()
        })
        .unwrap();
        let mut seq = InsnSeq::new();
        let next = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        seq.mov(Opnd::SP, next).unwrap();
        seq.ret().unwrap();
        let unit = jit.compile(OwnerId(2), seq, vec![]).unwrap();
        assert!(!unit.code.region.is_empty());
    }

    #[test]
    fn test_failure_is_counted() {
        let jit = Jit::new(options()).unwrap();
        let mut seq = InsnSeq::new();
        let l = seq.new_label("missing");
        seq.jump_eq(l, Opnd::SP, Opnd::imm(1)).unwrap();
        let err = jit.compile(OwnerId(1), seq, vec![]).unwrap_err();
        assert!(err.falls_back_to_interpreter());
        assert_eq!(jit.stats().get(Counter::CompileFailures), 1);
        assert_eq!(jit.arena().used(), 0);
    }
}
