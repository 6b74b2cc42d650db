// This module implements register allocation for lowered sequences. Every virtual register
// (the InsnOut of an original instruction that lowering materialised) gets a live interval
// from its first to its last appearance in the lowered order; intervals live into a loop
// header that a later backward branch jumps to are stretched to that branch. A linear scan
// walks the intervals by start point, keeps the active set ordered by end point, hands out
// the lowest-numbered free register of the pool and, when the pool is empty, spills whichever
// interval ends furthest away. Ties are broken by virtual register number so identical inputs
// always produce identical assignments. The pool never contains the special-register backing
// registers, the stack or frame pointer, the scratch registers or any register the sequence
// names explicitly. A rewrite pass then replaces virtual registers with their locations, wraps
// spilled two-address destinations in loads and stores through the spill scratch register,
// and saves the registers a call may clobber (per the calling convention) that are live
// across it with pushes and pops.

//! Linear-scan register allocation.

use crate::codegen::lower::LoweredSeq;
use crate::core::error::{CompileError, CompileResult};
use crate::core::insn::{Insn, Op};
use crate::core::interner::Interner;
use crate::core::label::LabelTable;
use crate::core::operand::{Mem, Opnd, Reg};
use crate::x64::calling_convention::{CCAssigner, SysVAssigner};
use crate::x64::regs::{self, MachineReg};
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Bit set over the 16 general-purpose registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    bits: u32,
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regs(regs: &[MachineReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    pub fn contains(&self, reg: MachineReg) -> bool {
        reg < 32 && (self.bits & (1 << reg)) != 0
    }

    pub fn set(&mut self, reg: MachineReg) {
        if reg < 32 {
            self.bits |= 1 << reg;
        }
    }

    pub fn clear(&mut self, reg: MachineReg) {
        if reg < 32 {
            self.bits &= !(1 << reg);
        }
    }

    /// Lowest-numbered register in the set.
    pub fn first(&self) -> Option<MachineReg> {
        if self.bits == 0 {
            None
        } else {
            Some(self.bits.trailing_zeros() as MachineReg)
        }
    }

    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineReg> + '_ {
        (0..32u8).filter(move |&r| self.contains(r))
    }
}

/// Location assigned to a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Reg(MachineReg),
    /// Spill slot number; slot `n` lives at `[rbp - 8 * (n + 1)]`.
    Spill(u32),
}

/// Stack frame needed by the allocated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub spill_slots: u32,
    pub needs_frame: bool,
}

impl FrameLayout {
    /// Bytes reserved below the saved frame pointer, kept 16-byte aligned.
    pub fn frame_size(&self) -> u32 {
        (self.spill_slots * 8).div_ceil(16) * 16
    }

    pub fn slot_opnd(slot: u32) -> Opnd {
        Opnd::Mem(Mem {
            base: Reg::machine(regs::RBP),
            disp: -8 * (slot as i32 + 1),
            num_bits: 64,
        })
    }
}

/// Output of [`allocate`]: only `Reg`, `Mem`, `Imm`, `Value`, `CodePtr`,
/// `LabelIdx` and `Str` operands remain.
#[derive(Debug, Clone)]
pub struct AllocatedSeq {
    pub insns: Vec<Insn>,
    pub labels: LabelTable,
    pub names: Interner,
    /// Assignment per virtual register, `None` for registers never used.
    pub assignments: Vec<Option<Allocation>>,
    /// Final location of each original instruction's value.
    pub results: Vec<Opnd>,
    pub frame: FrameLayout,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    vreg: u32,
    start: usize,
    end: usize,
}

fn reads_dst(op: Op) -> bool {
    matches!(
        op,
        Op::Add | Op::Sub | Op::And | Op::Not | Op::Cmp
            | Op::CmovGe | Op::CmovGt | Op::CmovLe | Op::CmovLt
    )
}

fn writes_dst(op: Op) -> bool {
    reads_dst(op) && op != Op::Cmp
}

/// Registers the sequence names explicitly; these are withheld from the pool.
fn explicit_regs(insns: &[Insn]) -> RegBitSet {
    let mut set = RegBitSet::new();
    for opnd in insns.iter().flat_map(|i| i.opnds.iter()) {
        let reg = match opnd {
            Opnd::Reg { reg, .. } => *reg,
            Opnd::Mem(mem) => mem.base,
            _ => continue,
        };
        if !reg.is_special() {
            set.set(reg.machine_reg());
        }
    }
    set
}

fn build_intervals<'a>(lowered: &LoweredSeq, bump: &'a Bump) -> BumpVec<'a, Interval> {
    let mut ranges: BumpVec<Option<(usize, usize)>> = BumpVec::new_in(bump);
    ranges.resize(lowered.num_vregs as usize, None);

    for (i, insn) in lowered.insns.iter().enumerate() {
        for opnd in &insn.opnds {
            if let Opnd::InsnOut { idx, .. } = opnd {
                let range = &mut ranges[*idx as usize];
                *range = match *range {
                    None => Some((i, i)),
                    Some((start, _)) => Some((start, i)),
                };
            }
        }
    }

    let mut intervals = BumpVec::new_in(bump);
    for (vreg, range) in ranges.iter().enumerate() {
        if let Some((start, end)) = range {
            intervals.push(Interval {
                vreg: vreg as u32,
                start: *start,
                end: *end,
            });
        }
    }

    // Values live at a loop header must survive until the back edge.
    let mut label_pos: BumpVec<Option<usize>> = BumpVec::new_in(bump);
    label_pos.resize(lowered.labels.len(), None);
    for (i, insn) in lowered.insns.iter().enumerate() {
        if let (Op::Label, Some(Opnd::LabelIdx(idx))) = (insn.op, insn.opnds.first()) {
            label_pos[idx.index()] = Some(i);
        }
    }
    let mut back_edges: BumpVec<(usize, usize)> = BumpVec::new_in(bump);
    for (i, insn) in lowered.insns.iter().enumerate() {
        if let (true, Some(Opnd::LabelIdx(idx))) = (insn.op.is_jump(), insn.opnds.first()) {
            if let Some(target) = label_pos[idx.index()] {
                if target < i {
                    back_edges.push((target, i));
                }
            }
        }
    }
    let mut changed = !back_edges.is_empty();
    while changed {
        changed = false;
        for &(header, branch) in back_edges.iter() {
            for iv in intervals.iter_mut() {
                if iv.start < header && iv.end >= header && iv.end < branch {
                    iv.end = branch;
                    changed = true;
                }
            }
        }
    }

    intervals
}

fn linear_scan(
    intervals: &mut BumpVec<Interval>,
    pool: RegBitSet,
    assignments: &mut [Option<Allocation>],
    bump: &Bump,
) -> u32 {
    intervals.sort_by_key(|iv| (iv.start, iv.vreg));

    let mut active: BumpVec<Interval> = BumpVec::new_in(bump);
    let mut free = pool;
    let mut spill_slots = 0u32;

    for &iv in intervals.iter() {
        // Active is ordered by end point, so expired intervals form a prefix.
        while let Some(&done) = active.first() {
            if done.end >= iv.start {
                break;
            }
            if let Some(Allocation::Reg(r)) = assignments[done.vreg as usize] {
                free.set(r);
            }
            active.remove(0);
        }

        let insert_active = |active: &mut BumpVec<Interval>, iv: Interval| {
            let at = active
                .iter()
                .position(|a| (a.end, a.vreg) > (iv.end, iv.vreg))
                .unwrap_or(active.len());
            active.insert(at, iv);
        };

        if let Some(reg) = free.first() {
            free.clear(reg);
            assignments[iv.vreg as usize] = Some(Allocation::Reg(reg));
            insert_active(&mut active, iv);
            continue;
        }

        let slot = spill_slots;
        spill_slots += 1;
        match active.last().copied() {
            Some(victim) if victim.end > iv.end => {
                let reg = assignments[victim.vreg as usize];
                assignments[victim.vreg as usize] = Some(Allocation::Spill(slot));
                assignments[iv.vreg as usize] = reg;
                active.pop();
                insert_active(&mut active, iv);
            }
            _ => {
                assignments[iv.vreg as usize] = Some(Allocation::Spill(slot));
            }
        }
    }

    spill_slots
}

/// Assign machine locations to every virtual register of `lowered`.
pub fn allocate(lowered: LoweredSeq, bump: &Bump) -> CompileResult<AllocatedSeq> {
    let mut intervals = build_intervals(&lowered, bump);

    let reserved = explicit_regs(&lowered.insns);
    let mut pool = RegBitSet::new();
    for reg in regs::ALLOC_POOL {
        if !reserved.contains(reg) {
            pool.set(reg);
        }
    }
    if pool.is_empty() && !intervals.is_empty() {
        return Err(CompileError::contract(
            "regalloc",
            "no general-purpose registers left for allocation",
        ));
    }

    let mut assignments = vec![None; lowered.num_vregs as usize];
    let spill_slots = linear_scan(&mut intervals, pool, &mut assignments, bump);

    let location = |opnd: Opnd| -> Opnd {
        match opnd {
            Opnd::InsnOut { idx, num_bits } => match assignments[idx as usize] {
                Some(Allocation::Reg(r)) => Opnd::Reg {
                    reg: Reg::machine(r),
                    num_bits,
                },
                Some(Allocation::Spill(slot)) => FrameLayout::slot_opnd(slot),
                None => opnd,
            },
            other => other,
        }
    };

    let scratch = Opnd::machine_reg(regs::SPILL_SCRATCH);
    let clobbered = SysVAssigner::new().ccinfo().caller_saved();
    let mut insns = Vec::with_capacity(lowered.insns.len() + spill_slots as usize * 2);
    let mut has_calls = false;

    for (i, insn) in lowered.insns.into_iter().enumerate() {
        let mut saved: BumpVec<MachineReg> = BumpVec::new_in(bump);
        if insn.op.is_call() {
            has_calls = true;
            for iv in intervals.iter() {
                if let Some(Allocation::Reg(r)) = assignments[iv.vreg as usize] {
                    let live_across = iv.start < i && iv.end > i;
                    if live_across && clobbered.contains(r) && !saved.contains(&r) {
                        saved.push(r);
                    }
                }
            }
            saved.sort_unstable();
            for &r in saved.iter() {
                insns.push(Insn::new(Op::CPush, vec![Opnd::machine_reg(r)]));
            }
            if saved.len() % 2 == 1 {
                insns.push(Insn::new(Op::CPush, vec![Opnd::machine_reg(saved[saved.len() - 1])]));
            }
        }

        let spilled_dst = reads_dst(insn.op)
            && matches!(
                insn.opnds.first().and_then(Opnd::insn_out_idx),
                Some(v) if matches!(assignments[v as usize], Some(Allocation::Spill(_)))
            );
        let mut opnds: Vec<Opnd> = insn.opnds.iter().map(|&o| location(o)).collect();

        if spilled_dst {
            let slot = opnds[0];
            insns.push(Insn::new(Op::Mov, vec![scratch, slot]));
            opnds[0] = scratch;
            insns.push(Insn::new(insn.op, opnds));
            if writes_dst(insn.op) {
                insns.push(Insn::new(Op::Mov, vec![slot, scratch]));
            }
        } else {
            insns.push(Insn::new(insn.op, opnds));
        }

        if !saved.is_empty() {
            if saved.len() % 2 == 1 {
                insns.push(Insn::new(Op::CPopInto, vec![Opnd::machine_reg(saved[saved.len() - 1])]));
            }
            for &r in saved.iter().rev() {
                insns.push(Insn::new(Op::CPopInto, vec![Opnd::machine_reg(r)]));
            }
        }
    }

    let results = lowered.results.iter().map(|&o| location(o)).collect();
    let frame = FrameLayout {
        spill_slots,
        needs_frame: spill_slots > 0 || has_calls,
    };

    log::debug!(
        "allocated {} intervals over {} registers, {} spill slots",
        intervals.len(),
        pool.count(),
        spill_slots
    );

    Ok(AllocatedSeq {
        insns,
        labels: lowered.labels,
        names: lowered.names,
        assignments,
        results,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::lower::lower;
    use crate::core::builder::InsnSeq;

    fn run(seq: InsnSeq) -> CompileResult<AllocatedSeq> {
        let bump = Bump::new();
        allocate(lower(seq)?, &bump)
    }

    fn user_reg(reg: MachineReg) -> Opnd {
        Opnd::reg(Reg::new(reg).unwrap())
    }

    /// `n` values computed from SP that all stay live until a final sum.
    fn many_live_values(n: i64) -> InsnSeq {
        let mut seq = InsnSeq::new();
        let vals: Vec<Opnd> = (0..n)
            .map(|i| seq.add(Opnd::SP, Opnd::imm(i * 8)).unwrap())
            .collect();
        let mut acc = vals[0];
        for &v in &vals[1..] {
            acc = seq.add(acc, v).unwrap();
        }
        seq.retval(acc).unwrap();
        seq
    }

    #[test]
    fn test_reg_bitset() {
        let mut set = RegBitSet::from_regs(&[regs::RSI, regs::RCX]);
        assert_eq!(set.first(), Some(regs::RCX));
        assert_eq!(set.count(), 2);
        set.clear(regs::RCX);
        assert_eq!(set.first(), Some(regs::RSI));
        assert!(!set.contains(regs::RCX));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![regs::RSI]);
    }

    #[test]
    fn test_specials_never_assigned() {
        let alloc = run(many_live_values(10)).unwrap();
        for a in alloc.assignments.iter().flatten() {
            if let Allocation::Reg(r) = a {
                assert!(regs::ALLOC_POOL.contains(r), "{r} outside pool");
                assert!(!regs::SPECIAL_BACKING.contains(r));
            }
        }
    }

    #[test]
    fn test_spills_when_pool_exhausted() {
        let alloc = run(many_live_values(9)).unwrap();
        assert!(alloc.frame.spill_slots > 0);
        assert!(alloc.frame.needs_frame);
        assert_eq!(alloc.frame.frame_size() % 16, 0);

        let scratch = Opnd::machine_reg(regs::SPILL_SCRATCH);
        assert!(alloc
            .insns
            .iter()
            .any(|i| i.op == Op::Mov && i.opnds[0] == scratch));
        assert!(alloc
            .insns
            .iter()
            .flat_map(|i| i.opnds.iter())
            .all(|o| !matches!(o, Opnd::InsnOut { .. })));
    }

    #[test]
    fn test_no_spills_for_short_lived_values() {
        let mut seq = InsnSeq::new();
        let mut v = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        for _ in 0..20 {
            v = seq.add(v, Opnd::imm(1)).unwrap();
        }
        seq.retval(v).unwrap();
        let alloc = run(seq).unwrap();
        assert_eq!(alloc.frame.spill_slots, 0);
        assert!(!alloc.frame.needs_frame);
    }

    #[test]
    fn test_explicit_registers_withheld() {
        let mut seq = InsnSeq::new();
        seq.mov(user_reg(regs::RCX), Opnd::imm(1)).unwrap();
        let v = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        seq.mov(Opnd::SP, v).unwrap();
        let alloc = run(seq).unwrap();
        assert_eq!(alloc.assignments[1], Some(Allocation::Reg(regs::RDX)));
    }

    #[test]
    fn test_zero_capacity_pool() {
        let mut seq = InsnSeq::new();
        for reg in regs::ALLOC_POOL {
            seq.mov(user_reg(reg), Opnd::imm(0)).unwrap();
        }
        seq.add(Opnd::SP, Opnd::imm(1)).unwrap();
        assert!(matches!(
            run(seq),
            Err(CompileError::ContractViolation { op: "regalloc", .. })
        ));
    }

    #[test]
    fn test_live_values_saved_across_ccall() {
        let mut seq = InsnSeq::new();
        let v = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        let r = seq.ccall(Opnd::imm(0x1000), &[Opnd::EC]).unwrap();
        let sum = seq.add(v, r).unwrap();
        seq.retval(sum).unwrap();
        let alloc = run(seq).unwrap();

        let ops: Vec<Op> = alloc.insns.iter().map(|i| i.op).collect();
        let call = ops.iter().position(|&op| op == Op::CCall).unwrap();
        assert_eq!(&ops[call - 2..call], &[Op::CPush, Op::CPush]);
        assert_eq!(&ops[call + 1..call + 3], &[Op::CPopInto, Op::CPopInto]);
        assert!(alloc.frame.needs_frame);
    }

    #[test]
    fn test_loop_carried_value_keeps_register() {
        let mut seq = InsnSeq::new();
        let top = seq.new_label("top");
        let base = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        seq.write_label(top).unwrap();
        let t = seq.add(base, Opnd::imm(1)).unwrap();
        let u = seq.add(Opnd::SELF, Opnd::imm(2)).unwrap();
        seq.mov(Opnd::CFP, u).unwrap();
        seq.mov(Opnd::SP, t).unwrap();
        seq.jump_ne(top, Opnd::SP, Opnd::imm(0)).unwrap();
        let alloc = run(seq).unwrap();

        let base_loc = alloc.assignments[base.insn_out_idx().unwrap() as usize];
        let u_loc = alloc.assignments[u.insn_out_idx().unwrap() as usize];
        assert_ne!(base_loc, u_loc);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let a = run(many_live_values(12)).unwrap();
        let b = run(many_live_values(12)).unwrap();
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.insns, b.insns);
    }
}
