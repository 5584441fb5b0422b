//! Livepatch relocation records
//!
//! A patch carrier module keeps the relocations that reference symbols of
//! the patched object in dedicated sections named
//! `.klp.rela.<object>.<section>`. Each relocation points at a symbol of
//! the carrier's symbol table named `.klp.sym.<object>.<symbol>,<pos>`
//! whose value is filled in when the object gets loaded.

/// Entry of the carrier's symbol table referenced by livepatch relocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlpSymbol {
    /// Full encoded name, `.klp.sym.<object>.<symbol>,<pos>`
    pub name: String,
    /// Whether the symbol is marked as a livepatch symbol (SHN_LIVEPATCH)
    pub livepatch: bool,
    /// Resolved address, zero until resolved
    pub value: u64,
}

impl KlpSymbol {
    /// A livepatch-marked, unresolved symbol
    pub fn new(name: impl Into<String>) -> Self {
        KlpSymbol {
            name: name.into(),
            livepatch: true,
            value: 0,
        }
    }

    /// A symbol without the livepatch marker
    pub fn unmarked(name: impl Into<String>) -> Self {
        KlpSymbol {
            name: name.into(),
            livepatch: false,
            value: 0,
        }
    }
}

/// One RELA entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the patched location inside the carrier's text
    pub offset: u64,
    /// Index into [`RelocationInfo::symbols`]
    pub symbol: usize,
    pub addend: i64,
}

/// A `.klp.rela.*` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationSection {
    pub name: String,
    pub relas: Vec<Relocation>,
}

impl RelocationSection {
    pub fn new(name: impl Into<String>, relas: Vec<Relocation>) -> Self {
        RelocationSection {
            name: name.into(),
            relas,
        }
    }
}

/// Relocation metadata of one carrier module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationInfo {
    pub symbols: Vec<KlpSymbol>,
    pub sections: Vec<RelocationSection>,
}

impl RelocationInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symbol, returning its index for use in [`Relocation::symbol`]
    pub fn add_symbol(&mut self, sym: KlpSymbol) -> usize {
        self.symbols.push(sym);
        self.symbols.len() - 1
    }

    pub fn add_section(&mut self, sec: RelocationSection) {
        self.sections.push(sec);
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_indices() {
        let mut info = RelocationInfo::new();
        assert!(info.is_empty());
        let a = info.add_symbol(KlpSymbol::new(".klp.sym.vmlinux.foo,0"));
        let b = info.add_symbol(KlpSymbol::unmarked("bar"));
        assert_eq!((a, b), (0, 1));
        assert!(info.symbols[0].livepatch);
        assert!(!info.symbols[1].livepatch);

        info.add_section(RelocationSection::new(
            ".klp.rela.vmlinux.text",
            vec![Relocation { offset: 0x10, symbol: a, addend: -4 }],
        ));
        assert!(!info.is_empty());
    }
}
