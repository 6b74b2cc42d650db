// This module runs the compilation pipeline for one instruction sequence: lowering to
// two-address form, linear-scan register allocation in a per-compilation bump arena, and
// two-pass emission. The result is an Assembled unit whose bytes live in an ordinary vector;
// nothing reaches executable memory until commit copies it into an ExecArena, so dropping an
// Assembled is how a compilation is cancelled. Statistics counters are bumped at each stage.

//! Compilation pipeline from builder-level IR to committed machine code.

pub mod lower;
pub mod regalloc;

use crate::core::builder::InsnSeq;
use crate::core::error::CompileResult;
use crate::core::insn::Insn;
use crate::core::interner::Interner;
use crate::core::label::LabelTable;
use crate::core::operand::{CodePtr, Opnd};
use crate::core::stats::{Counter, Stats};
use crate::exec_mem::{CodeRegion, ExecArena};
use crate::invalidation::GcRef;
use crate::x64::emitter::emit;
use bumpalo::Bump;
use regalloc::{Allocation, FrameLayout};

pub use lower::{lower, LoweredSeq};
pub use regalloc::{allocate, AllocatedSeq};

/// A fully emitted unit that has not been committed yet.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub gc_refs: Vec<GcRef>,
    /// Allocated instructions with their positions filled in.
    pub insns: Vec<Insn>,
    pub labels: LabelTable,
    pub names: Interner,
    pub frame: FrameLayout,
    pub assignments: Vec<Option<Allocation>>,
    /// Final location of each builder instruction's value.
    pub results: Vec<Opnd>,
}

/// A unit published into executable memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCode {
    pub region: CodeRegion,
    /// Embedded `Value`s, offsets relative to `region`.
    pub gc_refs: Vec<GcRef>,
}

impl CompiledCode {
    pub fn entry(&self) -> CodePtr {
        self.region.start()
    }
}

/// Lower, allocate and emit `seq`.
pub fn assemble(seq: InsnSeq, stats: &Stats) -> CompileResult<Assembled> {
    let lowered = lower(seq)?;
    stats.add(Counter::InsnsLowered, lowered.insns.len() as u64);
    stats.add(Counter::ConstantsFolded, lowered.folded as u64);

    let bump = Bump::new();
    let mut alloc = allocate(lowered, &bump)?;
    stats.add(Counter::SpillSlots, alloc.frame.spill_slots as u64);

    let out = emit(&mut alloc.insns, &mut alloc.labels, &alloc.names, alloc.frame)?;
    stats.add(Counter::LabelsPatched, out.branches_patched as u64);
    stats.add(Counter::GcRefs, out.gc_refs.len() as u64);

    log::debug!(
        "assembled {} instructions into {} bytes (frame {} bytes)",
        alloc.insns.len(),
        out.code.len(),
        alloc.frame.frame_size()
    );

    Ok(Assembled {
        code: out.code,
        gc_refs: out.gc_refs,
        insns: alloc.insns,
        labels: alloc.labels,
        names: alloc.names,
        frame: alloc.frame,
        assignments: alloc.assignments,
        results: alloc.results,
    })
}

impl Assembled {
    /// Copy the code into `arena` and make it executable.
    pub fn commit(self, arena: &ExecArena) -> CompileResult<CompiledCode> {
        let region = arena.commit(&self.code)?;
        Ok(CompiledCode {
            region,
            gc_refs: self.gc_refs,
        })
    }
}
