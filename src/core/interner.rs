//! String interning for label names and comment text.
//!
//! Operands must stay 16 bytes, so strings are carried as a 32-bit [`Symbol`]
//! into an [`Interner`] owned by the instruction sequence.

use hashbrown::HashMap;

/// Handle to an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interner {
    lookup: HashMap<String, Symbol>,
    strings: Vec<String>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the existing symbol if it was seen before.
    pub fn intern(&mut self, s: &str) -> Symbol {
        if let Some(&sym) = self.lookup.get(s) {
            return sym;
        }
        let sym = Symbol(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), sym);
        sym
    }

    pub fn get(&self, s: &str) -> Option<Symbol> {
        self.lookup.get(s).copied()
    }

    pub fn resolve(&self, sym: Symbol) -> &str {
        self.strings.get(sym.index()).map(String::as_str).unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut names = Interner::new();
        let a = names.intern("loop");
        let b = names.intern("exit");
        assert_ne!(a, b);
        assert_eq!(names.intern("loop"), a);
        assert_eq!(names.resolve(b), "exit");
        assert_eq!(names.len(), 2);
    }
}
