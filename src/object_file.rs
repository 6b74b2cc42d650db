//! ELF relocatable export of assembled code, for inspection with binutils.

use crate::core::error::{CompileError, CompileResult};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

/// Build an x86-64 ELF object with `code` in `.text` under a global `symbol`.
pub fn write_elf(symbol: &str, code: &[u8]) -> CompileResult<Vec<u8>> {
    if symbol.is_empty() {
        return Err(CompileError::ObjectFile {
            reason: "empty symbol name".to_string(),
        });
    }

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, code, 16);
    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    obj.write().map_err(|e| CompileError::ObjectFile {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{File, Object as _, ObjectSection, ObjectSymbol};

    #[test]
    fn test_symbol_and_text() {
        let bytes = write_elf("unit_0", &[0x90, 0xC3]).unwrap();
        let file = File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::X86_64);

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &[0x90, 0xC3]);
        let sym = file.symbol_by_name("unit_0").unwrap();
        assert_eq!(sym.size(), 2);
        assert!(sym.is_global());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            write_elf("", &[0xC3]),
            Err(CompileError::ObjectFile { .. })
        ));
    }
}
