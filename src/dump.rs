//! Human-readable rendering of instruction sequences at every stage.
//!
//! Dumping never mutates what it renders. Builder-level sequences print
//! value-producing instructions as `%K = op a, b`; once the emitter has run,
//! each line is prefixed with the instruction's byte offset. The operand
//! syntax is the one [`crate::text_ir`] parses back.

use crate::codegen::{AllocatedSeq, Assembled, LoweredSeq};
use crate::core::builder::InsnSeq;
use crate::core::insn::Insn;
use crate::core::interner::Interner;
use crate::core::operand::Opnd;
use std::fmt::Write;

/// Render one operand.
pub fn opnd_to_string(opnd: &Opnd, names: &Interner) -> String {
    match *opnd {
        Opnd::Void => "void".to_string(),
        Opnd::Value(v) => format!("value({:#x})", v.as_u64()),
        Opnd::InsnOut { idx, .. } => format!("%{idx}"),
        Opnd::CodePtr(ptr) => format!("code({:#x})", ptr.addr()),
        Opnd::LabelName(sym) => format!("@{}", names.resolve(sym)),
        Opnd::LabelIdx(idx) => format!("label#{}", idx.index()),
        Opnd::Str(sym) => format!("{:?}", names.resolve(sym)),
        Opnd::Mem(mem) => {
            let sign = if mem.disp < 0 { '-' } else { '+' };
            format!(
                "mem{}[{}{}{}]",
                mem.num_bits,
                mem.base.name(),
                sign,
                mem.disp.unsigned_abs()
            )
        }
        Opnd::Imm { value, num_bits: 64 } => value.to_string(),
        Opnd::Imm { value, num_bits } => format!("{value}:i{num_bits}"),
        Opnd::Reg { reg, .. } => reg.name().to_string(),
    }
}

fn write_insn(out: &mut String, insn: &Insn, result: Option<usize>, names: &Interner) {
    if let Some(pos) = insn.pos {
        let _ = write!(out, "[{pos:#06x}] ");
    }
    if let Some(k) = result {
        let _ = write!(out, "%{k} = ");
    }
    out.push_str(insn.op.name());
    for (i, opnd) in insn.opnds.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        out.push_str(&opnd_to_string(opnd, names));
    }
    out.push('\n');
}

/// Render a list of instructions, one per line.
pub fn dump_insns(insns: &[Insn], names: &Interner) -> String {
    let mut out = String::new();
    for insn in insns {
        write_insn(&mut out, insn, None, names);
    }
    out
}

/// Render a builder-level sequence with result numbers.
pub fn dump_seq(seq: &InsnSeq) -> String {
    let mut out = String::new();
    for (k, insn) in seq.insns().iter().enumerate() {
        let result = insn.op.info().produces_value.then_some(k);
        write_insn(&mut out, insn, result, seq.names());
    }
    out
}

pub fn dump_lowered(lowered: &LoweredSeq) -> String {
    dump_insns(&lowered.insns, &lowered.names)
}

pub fn dump_allocated(alloc: &AllocatedSeq) -> String {
    let mut out = dump_insns(&alloc.insns, &alloc.names);
    if alloc.frame.needs_frame {
        let _ = writeln!(
            out,
            "; frame: {} spill slots, {} bytes",
            alloc.frame.spill_slots,
            alloc.frame.frame_size()
        );
    }
    out
}

/// Positioned instructions followed by the embedded GC references.
pub fn dump_assembled(asm: &Assembled) -> String {
    let mut out = dump_insns(&asm.insns, &asm.names);
    let _ = writeln!(out, "; {} bytes", asm.code.len());
    for r in &asm.gc_refs {
        let _ = writeln!(out, "; gc ref at {:#06x}: value({:#x})", r.offset, r.value.as_u64());
    }
    out
}

/// Classic 16-bytes-per-line hex dump.
pub fn hex(code: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in code.chunks(16).enumerate() {
        let _ = write!(out, "{:06x}:", i * 16);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operand::{Reg, Value};
    use crate::x64::regs;

    #[test]
    fn test_builder_dump() {
        let mut seq = InsnSeq::new();
        let top = seq.new_label("top");
        seq.write_label(top).unwrap();
        seq.comment("loop \"body\"").unwrap();
        let v = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        let m = Opnd::mem(32, Opnd::CFP, -16).unwrap();
        let w = seq.sub(v, m).unwrap();
        seq.mov(Opnd::SELF, Opnd::value(Value(0x40))).unwrap();
        seq.jump_eq(top, w, Opnd::imm_sized(3, 8).unwrap()).unwrap();

        let text = dump_seq(&seq);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "label @top");
        assert_eq!(lines[1], r#"comment "loop \"body\"""#);
        assert_eq!(lines[2], "%2 = add sp, 8");
        assert_eq!(lines[3], "%3 = sub %2, mem32[cfp-16]");
        assert_eq!(lines[4], "mov self, value(0x40)");
        assert_eq!(lines[5], "jump_eq @top, %3, 3:i8");
    }

    #[test]
    fn test_dump_does_not_mutate() {
        let mut seq = InsnSeq::new();
        let rax = Opnd::reg(Reg::new(regs::RAX).unwrap());
        seq.mov(rax, Opnd::imm(1)).unwrap();
        let before = seq.insns().to_vec();
        let _ = dump_seq(&seq);
        assert_eq!(seq.insns(), &before[..]);
    }

    #[test]
    fn test_hex() {
        let text = hex(&[0u8; 17]);
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("000000: 00 00"));
        assert!(text.lines().nth(1).unwrap().starts_with("000010: 00"));
    }
}
