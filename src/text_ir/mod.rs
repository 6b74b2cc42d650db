//! Textual IR.
//!
//! One instruction per line, in the syntax [`crate::dump`] prints:
//!
//! ```text
//! label @top
//! comment "loop"
//! %2 = add sp, 8
//! jump_ne @top, %2, 0
//! ```
//!
//! `;` starts a comment. Parsed instructions go through the builder, so
//! operand contracts, references and flag ordering are checked exactly as
//! for sequences built in code.

mod parser;

pub use parser::parse_ir as parse;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CompileError;
    use crate::core::insn::Op;
    use crate::core::operand::Opnd;
    use crate::dump::dump_seq;

    #[test]
    fn test_parse_simple() {
        let seq = parse(
            "label @top   ; loop header\n\
             comment \"loop\"\n\
             %2 = add sp, 8\n\
             jump_ne @top, %2, 0:i32\n",
        )
        .unwrap();
        let ops: Vec<Op> = seq.insns().iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::Label, Op::Comment, Op::Add, Op::JumpNe]);
        assert_eq!(seq.insns()[2].opnds, vec![Opnd::SP, Opnd::imm(8)]);
    }

    #[test]
    fn test_round_trip_text() {
        let text = "label @L\n\
                    %1 = sub cfp, mem32[sp-16]\n\
                    mov self, value(0x1234)\n\
                    %3 = select_lt %1, -5, rax, 7:i16\n\
                    %4 = ccall 4096, ec, %3\n\
                    jump_eq @L, %4, 0\n";
        let seq = parse(text).unwrap();
        assert_eq!(dump_seq(&seq), text);
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse("ret\nfrobnicate rax\n").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 2, .. }));

        let err = parse("%5 = add sp, 1\n").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_contracts_apply_to_parsed_input() {
        assert!(matches!(
            parse("%0 = add %0, 1\n"),
            Err(CompileError::ContractViolation { .. })
        ));
        assert!(matches!(
            parse("mov r10, 1\n"),
            Err(CompileError::ContractViolation { op: "reg", .. })
        ));
        assert!(matches!(
            parse("%0 = add sp, 300:i8\n"),
            Err(CompileError::OperandOverflow { .. })
        ));
    }

    #[test]
    fn test_registers_are_full_width() {
        assert_eq!(
            parse("mov rax:i8, 0\n").unwrap_err(),
            CompileError::WidthMismatch { num_bits: 8 }
        );
        let seq = parse("mov rax:i64, 1\n").unwrap();
        assert_eq!(dump_seq(&seq), "mov rax, 1\n");
    }
}
