//! Branch targets.
//!
//! A label starts life as a name carried by [`Opnd::LabelName`](crate::core::Opnd),
//! is given a dense [`LabelIdx`] during lowering, and receives a byte offset when the
//! emitter reaches its `LABEL` instruction. Every referenced label must be defined
//! exactly once.

use crate::core::error::{CompileError, CompileResult};
use crate::core::interner::{Interner, Symbol};
use hashbrown::HashMap;

/// Dense index of a label within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelIdx(u32);

impl LabelIdx {
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a label is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelState {
    /// Only the name is known.
    Named,
    /// Indexed, no offset yet.
    Indexed(LabelIdx),
    /// Byte offset within the emitted unit.
    Resolved(LabelIdx, u32),
}

#[derive(Debug, Clone)]
struct LabelEntry {
    name: Symbol,
    defined: bool,
    offset: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
    by_name: HashMap<Symbol, LabelIdx>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for `name`, allocating one on first sight.
    pub fn index(&mut self, name: Symbol) -> LabelIdx {
        if let Some(&idx) = self.by_name.get(&name) {
            return idx;
        }
        let idx = LabelIdx(self.entries.len() as u32);
        self.entries.push(LabelEntry {
            name,
            defined: false,
            offset: None,
        });
        self.by_name.insert(name, idx);
        idx
    }

    pub fn lookup(&self, name: Symbol) -> Option<LabelIdx> {
        self.by_name.get(&name).copied()
    }

    /// Record the definition site of a label.
    pub fn define(&mut self, idx: LabelIdx, names: &Interner) -> CompileResult<()> {
        let entry = self
            .entries
            .get_mut(idx.index())
            .ok_or_else(|| CompileError::contract("label", format!("unknown label {idx:?}")))?;
        if entry.defined {
            return Err(CompileError::contract(
                "label",
                format!("label `{}` defined twice", names.resolve(entry.name)),
            ));
        }
        entry.defined = true;
        Ok(())
    }

    /// Fails with the first label that is referenced but never defined.
    pub fn check_closure(&self, names: &Interner) -> CompileResult<()> {
        match self.entries.iter().find(|e| !e.defined) {
            Some(entry) => Err(CompileError::UnresolvedLabel {
                name: names.resolve(entry.name).to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn resolve(&mut self, idx: LabelIdx, offset: u32) {
        if let Some(entry) = self.entries.get_mut(idx.index()) {
            entry.offset = Some(offset);
        }
    }

    pub fn offset(&self, idx: LabelIdx) -> Option<u32> {
        self.entries.get(idx.index()).and_then(|e| e.offset)
    }

    pub fn name(&self, idx: LabelIdx) -> Option<Symbol> {
        self.entries.get(idx.index()).map(|e| e.name)
    }

    pub fn state_of(&self, name: Symbol) -> LabelState {
        match self.lookup(name) {
            None => LabelState::Named,
            Some(idx) => match self.offset(idx) {
                Some(off) => LabelState::Resolved(idx, off),
                None => LabelState::Indexed(idx),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lifecycle() {
        let mut names = Interner::new();
        let top = names.intern("top");
        let mut labels = LabelTable::new();

        assert_eq!(labels.state_of(top), LabelState::Named);
        let idx = labels.index(top);
        assert_eq!(labels.index(top), idx);
        assert_eq!(labels.state_of(top), LabelState::Indexed(idx));

        labels.define(idx, &names).unwrap();
        labels.resolve(idx, 0x10);
        assert_eq!(labels.state_of(top), LabelState::Resolved(idx, 0x10));
    }

    #[test]
    fn test_duplicate_definition() {
        let mut names = Interner::new();
        let mut labels = LabelTable::new();
        let idx = labels.index(names.intern("L"));
        labels.define(idx, &names).unwrap();
        assert!(matches!(
            labels.define(idx, &names),
            Err(CompileError::ContractViolation { op: "label", .. })
        ));
    }

    #[test]
    fn test_closure_reports_missing_label() {
        let mut names = Interner::new();
        let mut labels = LabelTable::new();
        let done = labels.index(names.intern("done"));
        labels.index(names.intern("missing"));
        labels.define(done, &names).unwrap();
        assert_eq!(
            labels.check_closure(&names),
            Err(CompileError::UnresolvedLabel {
                name: "missing".to_string()
            })
        );
    }
}
