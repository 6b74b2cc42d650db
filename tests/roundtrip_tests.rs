use irjit::core::{OpndKind, Stats, Value};
use irjit::dump::{dump_assembled, dump_seq, opnd_to_string};
use irjit::x64::regs;
use irjit::{assemble, text_ir, CompileError, InsnSeq, Op, Opnd, Reg};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn topology(seq: &InsnSeq) -> Vec<(Op, Vec<OpndKind>)> {
    seq.insns()
        .iter()
        .map(|i| (i.op, i.opnds.iter().map(Opnd::kind).collect()))
        .collect()
}

fn sample() -> InsnSeq {
    let rcx = Opnd::reg(Reg::new(regs::RCX).unwrap());
    let mut seq = InsnSeq::new();
    let entry = seq.new_label("entry");
    let side = seq.new_label("side_exit");
    seq.write_label(entry).unwrap();
    seq.comment("load receiver field").unwrap();
    let field = Opnd::mem(64, Opnd::SELF, 24).unwrap();
    let v = seq.add(field, Opnd::imm_sized(-1, 32).unwrap()).unwrap();
    let ovf = seq.sub(v, Opnd::imm(2)).unwrap();
    seq.jump_ovf(side).unwrap();
    seq.cmp(rcx, ovf).unwrap();
    seq.cmov_gt(rcx, Opnd::value(Value(0x7f00_0000_1230))).unwrap();
    let r = seq.ccall(Opnd::imm(0x1000), &[Opnd::EC, Opnd::CFP, rcx]).unwrap();
    seq.jump_ne(entry, r, Opnd::mem(8, Opnd::SP, -8).unwrap()).unwrap();
    seq.write_label(side).unwrap();
    seq.retval(Opnd::value(Value(8))).unwrap();
    seq
}

#[test]
fn test_dump_parse_preserves_topology() {
    init();
    let seq = sample();
    let text = dump_seq(&seq);
    let parsed = text_ir::parse(&text).unwrap();

    assert_eq!(topology(&parsed), topology(&seq));
    assert_eq!(dump_seq(&parsed), text);
}

#[test]
fn test_parsed_sequence_assembles_identically() {
    init();
    let stats = Stats::new(false);
    let parsed = text_ir::parse(&dump_seq(&sample())).unwrap();
    let built = assemble(sample(), &stats).unwrap();
    let reparsed = assemble(parsed, &stats).unwrap();
    assert_eq!(built.code, reparsed.code);
    assert_eq!(built.gc_refs, reparsed.gc_refs);
}

#[test]
fn test_emitted_dump_has_positions() {
    init();
    let asm = assemble(sample(), &Stats::new(false)).unwrap();
    let text = dump_assembled(&asm);
    let first = text.lines().next().unwrap();
    assert!(first.starts_with("[0x"), "{first}");
    assert!(first.ends_with("] label label#0"), "{first}");
    assert!(text.contains("; gc ref at"));
    assert!(text.contains(&format!("; {} bytes", asm.code.len())));
}

#[test]
fn test_operand_syntax() {
    let mut seq = InsnSeq::new();
    let names = seq.names().clone();
    assert_eq!(opnd_to_string(&Opnd::Void, &names), "void");
    assert_eq!(opnd_to_string(&Opnd::SELF, &names), "self");
    assert_eq!(opnd_to_string(&Opnd::imm_sized(5, 16).unwrap(), &names), "5:i16");
    assert_eq!(
        opnd_to_string(&Opnd::mem(16, Opnd::EC, 0).unwrap(), &names),
        "mem16[ec+0]"
    );
    let l = seq.new_label("x");
    assert_eq!(opnd_to_string(&l.opnd(), seq.names()), "@x");
}

#[test]
fn test_parse_rejects_malformed_lines() {
    init();
    for (text, line) in [
        ("ret\nadd sp\n", 2),
        ("%0 = add sp, \"unterminated\n", 1),
        ("mov sp, label#0\n", 1),
        ("ret extra\n", 1),
    ] {
        match text_ir::parse(text) {
            Err(CompileError::Parse { line: l, .. }) => assert_eq!(l, line, "{text:?}"),
            Err(CompileError::ContractViolation { .. }) => {}
            other => panic!("{text:?} parsed as {other:?}"),
        }
    }
}
