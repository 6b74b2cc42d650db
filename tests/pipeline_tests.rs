use bumpalo::Bump;
use irjit::codegen::regalloc::Allocation;
use irjit::codegen::{allocate, assemble, lower};
use irjit::core::{Counter, Stats};
use irjit::x64::regs;
use irjit::{CompileError, Insn, InsnSeq, Jit, JitOptions, Op, Opnd, OwnerId, Reg};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn user_reg(reg: u8) -> Opnd {
    Opnd::reg(Reg::new(reg).unwrap())
}

fn jit() -> Jit {
    Jit::new(JitOptions {
        exec_mem_size_mib: 1,
        gen_stats: true,
        ..JitOptions::default()
    })
    .unwrap()
}

/// Run committed code that takes no arguments and returns rax.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn run(jit: &Jit, seq: InsnSeq) -> i64 {
    let unit = jit.compile(OwnerId(0), seq, vec![]).unwrap();
    let entry = unit.code.entry().addr() as *const u8;
    let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(entry) };
    f()
}

#[test]
fn test_footprint_bounds() {
    assert!(std::mem::size_of::<Opnd>() <= 16);
    assert!(std::mem::size_of::<Insn>() <= 64);
}

#[test]
fn test_immediate_add_folds_without_registers() {
    init();
    let mut seq = InsnSeq::new();
    let sum = seq.add(Opnd::imm(2), Opnd::imm(3)).unwrap();
    assert_eq!(sum.insn_out_idx(), Some(0));

    let lowered = lower(seq).unwrap();
    assert!(lowered.insns.is_empty());
    assert_eq!(lowered.results[0], Opnd::imm(5));
}

#[test]
fn test_register_add_is_in_place() {
    init();
    let rax = user_reg(regs::RAX);
    let mut seq = InsnSeq::new();
    seq.mov(rax, Opnd::imm(10)).unwrap();
    seq.add(rax, Opnd::imm(5)).unwrap();

    let lowered = lower(seq).unwrap();
    let adds: Vec<_> = lowered.insns.iter().filter(|i| i.op == Op::Add).collect();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].opnds, vec![rax, Opnd::imm(5)]);
    assert_eq!(lowered.insns.len(), 2);
}

#[test]
fn test_self_referencing_jump_displacement() {
    init();
    let mut seq = InsnSeq::new();
    let l = seq.new_label("L");
    seq.write_label(l).unwrap();
    seq.comment("loop").unwrap();
    seq.jump_eq(l, user_reg(regs::RAX), Opnd::imm(0)).unwrap();

    let asm = assemble(seq, &Stats::new(false)).unwrap();
    let label_pos = asm.insns[0].pos.unwrap();
    let je = asm.insns.iter().find(|i| i.op == Op::Je).unwrap();
    let site = je.pos.unwrap() as usize;

    assert_eq!(&asm.code[site..site + 2], &[0x0F, 0x84]);
    let disp = i32::from_le_bytes(asm.code[site + 2..site + 6].try_into().unwrap());
    assert_eq!(disp as i64, label_pos as i64 - (site as i64 + 6));
    assert!(disp < 0);
}

#[test]
fn test_ccall_spills_excess_arguments() {
    init();
    let mut seq = InsnSeq::new();
    let args: Vec<Opnd> = (1..=8).map(Opnd::imm).collect();
    let r = seq.ccall(Opnd::imm(0x1000), &args).unwrap();
    seq.retval(r).unwrap();

    let lowered = lower(seq).unwrap();
    assert_eq!(lowered.insns[0].op, Op::CCall);
    assert_eq!(lowered.insns[1].opnds[1], Opnd::reg(Reg::new(regs::RAX).unwrap()));

    let bump = Bump::new();
    let alloc = allocate(lowered, &bump).unwrap();
    assert!(alloc.frame.needs_frame);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
extern "C" fn weighted8(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64) -> i64 {
    a + 10 * b + 100 * c + 1000 * d + 10_000 * e + 100_000 * f + 1_000_000 * g + 10_000_000 * h
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_ccall_executes_with_stack_arguments() {
    init();
    let jit = jit();
    let mut seq = InsnSeq::new();
    let args: Vec<Opnd> = (1..=8).map(Opnd::imm).collect();
    let f = weighted8 as extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64;
    let r = seq.ccall(Opnd::const_ptr(f as *const ()), &args).unwrap();
    seq.retval(r).unwrap();

    assert_eq!(run(&jit, seq), 87_654_321);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_loop_executes() {
    init();
    let jit = jit();
    let (rax, rcx) = (user_reg(regs::RAX), user_reg(regs::RCX));
    let mut seq = InsnSeq::new();
    let top = seq.new_label("top");
    seq.mov(rax, Opnd::imm(0)).unwrap();
    seq.mov(rcx, Opnd::imm(5)).unwrap();
    seq.write_label(top).unwrap();
    let acc = seq.add(rax, Opnd::imm(3)).unwrap();
    seq.mov(rax, acc).unwrap();
    let n = seq.sub(rcx, Opnd::imm(1)).unwrap();
    seq.mov(rcx, n).unwrap();
    seq.jump_ne(top, rcx, Opnd::imm(0)).unwrap();
    seq.retval(rax).unwrap();

    assert_eq!(run(&jit, seq), 15);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_register_operand_keeps_its_value() {
    init();
    let jit = jit();
    let rax = user_reg(regs::RAX);

    let mut seq = InsnSeq::new();
    seq.mov(rax, Opnd::imm(10)).unwrap();
    seq.add(rax, Opnd::imm(5)).unwrap();
    let w = seq.add(rax, Opnd::imm(1)).unwrap();
    seq.retval(w).unwrap();
    assert_eq!(run(&jit, seq), 11);

    let mut seq = InsnSeq::new();
    seq.mov(rax, Opnd::imm(10)).unwrap();
    let v = seq.add(rax, Opnd::imm(5)).unwrap();
    seq.mov(rax, Opnd::imm(0)).unwrap();
    seq.retval(v).unwrap();
    assert_eq!(run(&jit, seq), 15);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_value_live_across_ccall_executes() {
    init();
    let jit = jit();
    let rax = user_reg(regs::RAX);
    let mut seq = InsnSeq::new();
    seq.mov(rax, Opnd::imm(40)).unwrap();
    let before = seq.add(Opnd::imm(2), rax).unwrap();
    let args: Vec<Opnd> = (1..=8).map(Opnd::imm).collect();
    let f = weighted8 as extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64;
    let r = seq.ccall(Opnd::const_ptr(f as *const ()), &args).unwrap();
    let sum = seq.add(before, r).unwrap();
    seq.retval(sum).unwrap();

    assert_eq!(run(&jit, seq), 42 + 87_654_321);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_select_under_register_pressure_executes() {
    init();
    let jit = jit();
    let rax = user_reg(regs::RAX);
    // (compared, against, expected select result)
    for (a, b, picked) in [(6, 0, 20), (0, 6, 30)] {
        let mut seq = InsnSeq::new();
        seq.mov(rax, Opnd::imm(0)).unwrap();
        let vals: Vec<Opnd> = (1..=7)
            .map(|i| seq.add(Opnd::imm(i * 10), rax).unwrap())
            .collect();
        let s = seq.select_gt(vals[a], vals[b], vals[1], vals[2]).unwrap();
        let mut acc = seq.add(vals[0], vals[1]).unwrap();
        for &v in &vals[2..] {
            acc = seq.add(acc, v).unwrap();
        }
        let total = seq.add(acc, s).unwrap();
        seq.retval(total).unwrap();

        assert_eq!(run(&jit, seq), 280 + picked, "select_gt(v{a}, v{b})");
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_select_executes() {
    init();
    let jit = jit();
    let rdx = user_reg(regs::RDX);
    for (input, expected) in [(7, 100), (3, 200), (-4, 200)] {
        let mut seq = InsnSeq::new();
        seq.mov(rdx, Opnd::imm(input)).unwrap();
        let v = seq
            .select_gt(rdx, Opnd::imm(3), Opnd::imm(100), Opnd::imm(200))
            .unwrap();
        seq.retval(v).unwrap();
        assert_eq!(run(&jit, seq), expected, "input {input}");
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_overflow_branch_executes() {
    init();
    let jit = jit();
    let rax = user_reg(regs::RAX);
    for (start, expected) in [(i64::MAX, 1), (41, 0)] {
        let mut seq = InsnSeq::new();
        let ovf = seq.new_label("ovf");
        seq.mov(rax, Opnd::imm(start)).unwrap();
        seq.add(rax, Opnd::imm(1)).unwrap();
        seq.jump_ovf(ovf).unwrap();
        seq.retval(Opnd::imm(0)).unwrap();
        seq.write_label(ovf).unwrap();
        seq.retval(Opnd::imm(1)).unwrap();
        assert_eq!(run(&jit, seq), expected, "start {start}");
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_spilled_values_execute() {
    init();
    let jit = jit();
    let rax = user_reg(regs::RAX);
    let mut seq = InsnSeq::new();
    seq.mov(rax, Opnd::imm(0)).unwrap();
    // Ten values live at once; the pool holds six.
    let vals: Vec<Opnd> = (1..=10)
        .map(|i| seq.add(Opnd::imm(i * 99), rax).unwrap())
        .collect();
    let mut acc = seq.add(vals[0], vals[1]).unwrap();
    for &v in &vals[2..] {
        acc = seq.add(acc, v).unwrap();
    }
    seq.retval(acc).unwrap();

    let expected: i64 = (1..=10).map(|i| i * 99).sum();
    assert_eq!(run(&jit, seq), expected);
}

#[test]
fn test_undefined_label_commits_nothing() {
    init();
    let jit = jit();
    let mut seq = InsnSeq::new();
    let missing = seq.new_label("missing");
    seq.jump_eq(missing, user_reg(regs::RAX), Opnd::imm(0)).unwrap();

    let err = jit.compile(OwnerId(1), seq, vec![]).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnresolvedLabel {
            name: "missing".to_string()
        }
    );
    assert_eq!(jit.arena().used(), 0);
    assert_eq!(jit.stats().get(Counter::CompileFailures), 1);
}

fn mixed_sequence() -> InsnSeq {
    let mut seq = InsnSeq::new();
    let top = seq.new_label("top");
    let out = seq.new_label("out");
    seq.write_label(top).unwrap();
    let a = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
    let b = seq.and(a, Opnd::imm(0xff)).unwrap();
    let c = seq.not(b).unwrap();
    let s = seq.select_le(c, Opnd::SELF, a, Opnd::CFP).unwrap();
    seq.mov(Opnd::SP, s).unwrap();
    let r = seq.ccall(Opnd::imm(0x4000), &[Opnd::EC, a, b]).unwrap();
    seq.jump_eq(out, r, Opnd::imm(0)).unwrap();
    seq.jump_ne(top, c, Opnd::imm(1)).unwrap();
    seq.write_label(out).unwrap();
    seq.retval(r).unwrap();
    seq
}

#[test]
fn test_identical_input_identical_output() {
    init();
    let stats = Stats::new(false);
    let first = assemble(mixed_sequence(), &stats).unwrap();
    let second = assemble(mixed_sequence(), &stats).unwrap();

    assert_eq!(first.code, second.code);
    assert_eq!(first.assignments, second.assignments);
    assert_eq!(first.insns, second.insns);
}

#[test]
fn test_special_registers_never_allocated() {
    init();
    let asm = assemble(mixed_sequence(), &Stats::new(false)).unwrap();
    for a in asm.assignments.iter().flatten() {
        if let Allocation::Reg(r) = a {
            assert!(!regs::SPECIAL_BACKING.contains(r));
            assert!(regs::ALLOC_POOL.contains(r));
        }
    }
    for opnd in asm.insns.iter().flat_map(|i| i.opnds.iter()) {
        assert!(
            !matches!(opnd, Opnd::InsnOut { .. } | Opnd::LabelName(_)),
            "{opnd:?} reached the emitter"
        );
    }
}

#[test]
fn test_flag_order_enforced_at_build_time() {
    init();
    let mut seq = InsnSeq::new();
    let ovf = seq.new_label("ovf");
    seq.mov(user_reg(regs::RAX), Opnd::imm(1)).unwrap();
    assert!(matches!(
        seq.jump_ovf(ovf),
        Err(CompileError::ContractViolation { op: "jump_ovf", .. })
    ));
    assert!(matches!(
        seq.cmov_ge(user_reg(regs::RAX), user_reg(regs::RCX)),
        Err(CompileError::ContractViolation { .. })
    ));
}
