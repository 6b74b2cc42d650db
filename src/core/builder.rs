// This module implements the instruction builder. An InsnSeq is an append-only list of IR
// instructions plus the interner holding label names and comment text. Every append is checked
// against the opcode's operand contract (arity and operand kinds), against the reference rule
// (an InsnOut may only name an earlier, value-producing instruction) and against the flag
// ordering rules: JUMP_OVF must directly follow the ADD/SUB whose overflow flag it tests, and a
// CMOV must be preceded by the CMP whose flags it consumes with only flag-preserving
// instructions in between. Labels are declared by name with new_label, referenced by branch
// instructions and defined exactly once with write_label. Each sequence carries a process-wide
// id and its labels remember it, so a label cannot be used in a sequence that did not declare
// it. Value-producing appends return the
// InsnOut operand naming their result, so sequences read like straight-line code.

//! Instruction sequence builder.

use crate::core::error::{CompileError, CompileResult};
use crate::core::insn::{check_operands, Insn, Op};
use crate::core::interner::{Interner, Symbol};
use crate::core::operand::Opnd;
use hashbrown::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SEQ_ID: AtomicU32 = AtomicU32::new(0);

/// Declared branch target, tied to the sequence that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    seq: u32,
    sym: Symbol,
}

impl Label {
    pub fn opnd(self) -> Opnd {
        Opnd::LabelName(self.sym)
    }

    pub fn symbol(self) -> Symbol {
        self.sym
    }
}

/// Append-only sequence of IR instructions.
///
/// A clone keeps the id, so labels of the original stay valid in it.
#[derive(Debug, Clone)]
pub struct InsnSeq {
    id: u32,
    insns: Vec<Insn>,
    names: Interner,
    defined_labels: HashSet<Symbol>,
}

impl Default for InsnSeq {
    fn default() -> Self {
        Self {
            id: NEXT_SEQ_ID.fetch_add(1, Ordering::Relaxed),
            insns: Vec::new(),
            names: Interner::default(),
            defined_labels: HashSet::new(),
        }
    }
}

impl InsnSeq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn names(&self) -> &Interner {
        &self.names
    }

    pub(crate) fn into_parts(self) -> (Vec<Insn>, Interner) {
        (self.insns, self.names)
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        self.names.intern(s)
    }

    /// Append an instruction after validating it. Returns the `InsnOut` of a
    /// value-producing instruction, `Opnd::Void` otherwise.
    pub fn push_insn(&mut self, op: Op, opnds: Vec<Opnd>) -> CompileResult<Opnd> {
        check_operands(op, &opnds)?;
        self.check_references(op, &opnds)?;
        self.check_flag_order(op)?;

        if op == Op::Label {
            if let Some(Opnd::LabelName(sym)) = opnds.first() {
                if !self.defined_labels.insert(*sym) {
                    return Err(CompileError::contract(
                        op.name(),
                        format!("label `{}` defined twice", self.names.resolve(*sym)),
                    ));
                }
            }
        }

        let idx = self.insns.len() as u32;
        self.insns.push(Insn::new(op, opnds));
        if op.info().produces_value {
            Ok(Opnd::out(idx))
        } else {
            Ok(Opnd::Void)
        }
    }

    fn check_references(&self, op: Op, opnds: &[Opnd]) -> CompileResult<()> {
        for opnd in opnds {
            match *opnd {
                Opnd::InsnOut { idx, .. } => {
                    let Some(target) = self.insns.get(idx as usize) else {
                        return Err(CompileError::contract(
                            op.name(),
                            format!("reference to instruction {idx} which does not precede it"),
                        ));
                    };
                    if !target.op.info().produces_value {
                        return Err(CompileError::contract(
                            op.name(),
                            format!("instruction {idx} ({}) produces no value", target.op.name()),
                        ));
                    }
                }
                Opnd::LabelName(sym) | Opnd::Str(sym) if sym.index() >= self.names.len() => {
                    return Err(CompileError::contract(
                        op.name(),
                        "symbol does not belong to this sequence",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_flag_order(&self, op: Op) -> CompileResult<()> {
        match op {
            Op::JumpOvf => {
                let prev = self.insns.iter().rev().find(|i| i.op != Op::Comment);
                match prev.map(|i| i.op) {
                    Some(Op::Add | Op::Sub) => Ok(()),
                    _ => Err(CompileError::contract(
                        op.name(),
                        "must immediately follow an add or sub",
                    )),
                }
            }
            Op::CmovGe | Op::CmovGt | Op::CmovLe | Op::CmovLt => {
                let setter = self
                    .insns
                    .iter()
                    .rev()
                    .find(|i| !i.op.info().preserves_flags);
                match setter.map(|i| i.op) {
                    Some(Op::Cmp) => Ok(()),
                    _ => Err(CompileError::contract(
                        op.name(),
                        "must be preceded by a cmp with no flag-changing instruction between",
                    )),
                }
            }
            _ => Ok(()),
        }
    }

    /// Declare a label. Declaring the same name twice yields the same label.
    pub fn new_label(&mut self, name: &str) -> Label {
        Label {
            seq: self.id,
            sym: self.names.intern(name),
        }
    }

    fn label_opnd(&self, op: Op, label: Label) -> CompileResult<Opnd> {
        if label.seq != self.id {
            return Err(CompileError::contract(
                op.name(),
                "label was declared by another sequence",
            ));
        }
        Ok(label.opnd())
    }

    /// Define `label` at the current position.
    pub fn write_label(&mut self, label: Label) -> CompileResult<()> {
        let target = self.label_opnd(Op::Label, label)?;
        self.push_insn(Op::Label, vec![target]).map(drop)
    }

    pub fn comment(&mut self, text: &str) -> CompileResult<()> {
        let sym = self.names.intern(text);
        self.push_insn(Op::Comment, vec![Opnd::Str(sym)]).map(drop)
    }

    pub fn add(&mut self, a: Opnd, b: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::Add, vec![a, b])
    }

    pub fn sub(&mut self, a: Opnd, b: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::Sub, vec![a, b])
    }

    pub fn and(&mut self, a: Opnd, b: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::And, vec![a, b])
    }

    pub fn not(&mut self, a: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::Not, vec![a])
    }

    pub fn jump_eq(&mut self, target: Label, a: Opnd, b: Opnd) -> CompileResult<()> {
        let target = self.label_opnd(Op::JumpEq, target)?;
        self.push_insn(Op::JumpEq, vec![target, a, b]).map(drop)
    }

    pub fn jump_ne(&mut self, target: Label, a: Opnd, b: Opnd) -> CompileResult<()> {
        let target = self.label_opnd(Op::JumpNe, target)?;
        self.push_insn(Op::JumpNe, vec![target, a, b]).map(drop)
    }

    pub fn jump_ovf(&mut self, target: Label) -> CompileResult<()> {
        let target = self.label_opnd(Op::JumpOvf, target)?;
        self.push_insn(Op::JumpOvf, vec![target]).map(drop)
    }

    /// Call a raw function pointer; arguments are the caller's business.
    pub fn call(&mut self, fptr: Opnd) -> CompileResult<()> {
        self.push_insn(Op::Call, vec![fptr]).map(drop)
    }

    /// Call a C function with the platform calling convention.
    pub fn ccall(&mut self, fptr: Opnd, args: &[Opnd]) -> CompileResult<Opnd> {
        let mut opnds = Vec::with_capacity(args.len() + 1);
        opnds.push(fptr);
        opnds.extend_from_slice(args);
        self.push_insn(Op::CCall, opnds)
    }

    pub fn ret(&mut self) -> CompileResult<()> {
        self.push_insn(Op::Ret, vec![]).map(drop)
    }

    pub fn retval(&mut self, value: Opnd) -> CompileResult<()> {
        self.push_insn(Op::RetVal, vec![value]).map(drop)
    }

    pub fn mov(&mut self, dst: Opnd, src: Opnd) -> CompileResult<()> {
        self.push_insn(Op::Mov, vec![dst, src]).map(drop)
    }

    pub fn cmp(&mut self, a: Opnd, b: Opnd) -> CompileResult<()> {
        self.push_insn(Op::Cmp, vec![a, b]).map(drop)
    }

    pub fn cmov_ge(&mut self, dst: Opnd, src: Opnd) -> CompileResult<()> {
        self.push_insn(Op::CmovGe, vec![dst, src]).map(drop)
    }

    pub fn cmov_gt(&mut self, dst: Opnd, src: Opnd) -> CompileResult<()> {
        self.push_insn(Op::CmovGt, vec![dst, src]).map(drop)
    }

    pub fn cmov_le(&mut self, dst: Opnd, src: Opnd) -> CompileResult<()> {
        self.push_insn(Op::CmovLe, vec![dst, src]).map(drop)
    }

    pub fn cmov_lt(&mut self, dst: Opnd, src: Opnd) -> CompileResult<()> {
        self.push_insn(Op::CmovLt, vec![dst, src]).map(drop)
    }

    pub fn select_ge(&mut self, a: Opnd, b: Opnd, then: Opnd, els: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::SelectGe, vec![a, b, then, els])
    }

    pub fn select_gt(&mut self, a: Opnd, b: Opnd, then: Opnd, els: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::SelectGt, vec![a, b, then, els])
    }

    pub fn select_le(&mut self, a: Opnd, b: Opnd, then: Opnd, els: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::SelectLe, vec![a, b, then, els])
    }

    pub fn select_lt(&mut self, a: Opnd, b: Opnd, then: Opnd, els: Opnd) -> CompileResult<Opnd> {
        self.push_insn(Op::SelectLt, vec![a, b, then, els])
    }
}
