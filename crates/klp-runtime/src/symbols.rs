//! Symbol and relocation resolution
//!
//! Resolves `(object, name, position)` triples against the host's symbol
//! tables and fills in the livepatch relocation symbols of a carrier module
//! before its relocations are applied.

use klp_core::constants::{
    KLP_RELA_PREFIX, KLP_SYM_PREFIX, RELA_OBJNAME_MAX, RELA_SYMNAME_MAX, VMLINUX,
};
use klp_core::error::{KlpError, KlpResult, SymbolError};
use klp_core::reloc::{KlpSymbol, RelocationInfo, RelocationSection};
use klp_core::traits::{RelocationApplier, SymbolTable};
use klp_core::kerror;

/// Resolve `name` in `objname` (`None` for the base image).
///
/// With `sympos == 0` the name must be unique in the object. Otherwise the
/// `sympos`-th occurrence in table order is returned.
pub fn find_object_symbol<S>(
    syms: &S,
    objname: Option<&str>,
    name: &str,
    sympos: u64,
) -> Result<u64, SymbolError>
where
    S: SymbolTable + ?Sized,
{
    let mut addr = 0u64;
    let mut count = 0u64;

    syms.for_each_symbol(objname, &mut |sym, sym_addr| {
        if sym != name {
            return false;
        }
        addr = sym_addr;
        count += 1;
        // Stop at the requested position, or at the first duplicate when
        // the name has to be unique.
        (sympos != 0 && count == sympos) || (sympos == 0 && count > 1)
    });

    let object = objname.unwrap_or(VMLINUX);
    if count == 0 {
        kerror!("symbol '{}' not found in symbol table", name);
        Err(SymbolError::NotFound { name: name.to_string() })
    } else if count > 1 && sympos == 0 {
        kerror!("unresolvable ambiguity for symbol '{}' in object '{}'", name, object);
        Err(SymbolError::Ambiguous {
            name: name.to_string(),
            object: object.to_string(),
        })
    } else if sympos > 0 && sympos != count {
        kerror!(
            "symbol position {} for symbol '{}' in object '{}' not found",
            sympos, name, object
        );
        Err(SymbolError::PositionNotFound {
            name: name.to_string(),
            object: object.to_string(),
            pos: sympos,
        })
    } else {
        Ok(addr)
    }
}

/// Decoded `.klp.sym.<object>.<symbol>,<pos>` name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlpSymName<'a> {
    pub object: &'a str,
    pub symbol: &'a str,
    pub sympos: u64,
}

impl<'a> KlpSymName<'a> {
    /// Object to search, `None` for the base image
    pub fn objname(&self) -> Option<&'a str> {
        (self.object != VMLINUX).then_some(self.object)
    }
}

/// Take up to `max` leading bytes not equal to `stop`; at least one
fn scan_until(s: &str, stop: u8, max: usize) -> Option<(&str, &str)> {
    let len = s.bytes().take(max).take_while(|b| *b != stop).count();
    (len > 0 && s.is_char_boundary(len)).then(|| s.split_at(len))
}

/// Parse a livepatch relocation symbol name
///
/// Field widths follow the module loader: object names up to 55 bytes,
/// symbol names up to 127. Trailing bytes after the position are ignored.
pub fn parse_sym_name(name: &str) -> Result<KlpSymName<'_>, SymbolError> {
    let bad = || SymbolError::InvalidRelocationFormat(format!("symbol {}", name));

    let rest = name.strip_prefix(KLP_SYM_PREFIX).ok_or_else(bad)?;
    let (object, rest) = scan_until(rest, b'.', RELA_OBJNAME_MAX).ok_or_else(bad)?;
    let rest = rest.strip_prefix('.').ok_or_else(bad)?;
    let (symbol, rest) = scan_until(rest, b',', RELA_SYMNAME_MAX).ok_or_else(bad)?;
    let rest = rest.strip_prefix(',').ok_or_else(bad)?;

    let rest = rest.trim_start();
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let sympos = rest[..digits].parse::<u64>().map_err(|_| bad())?;

    Ok(KlpSymName { object, symbol, sympos })
}

/// Object name encoded in a `.klp.rela.<object>.<section>` section name
pub fn parse_rela_sec_name(name: &str) -> Result<&str, SymbolError> {
    name.strip_prefix(KLP_RELA_PREFIX)
        .and_then(|rest| scan_until(rest, b'.', RELA_OBJNAME_MAX))
        .map(|(object, _)| object)
        .ok_or_else(|| SymbolError::InvalidRelocationFormat(format!("section {}", name)))
}

/// Resolve every symbol referenced by `section`, writing its address into
/// `symbols`
pub fn resolve_symbols<S>(
    syms: &S,
    section: &RelocationSection,
    symbols: &mut [KlpSymbol],
) -> Result<(), SymbolError>
where
    S: SymbolTable + ?Sized,
{
    for rela in &section.relas {
        let sym = symbols.get_mut(rela.symbol).ok_or_else(|| {
            SymbolError::InvalidRelocationFormat(format!(
                "section {} (symbol index {})",
                section.name, rela.symbol
            ))
        })?;

        if !sym.livepatch {
            kerror!("symbol {} is not marked as a livepatch symbol", sym.name);
            return Err(SymbolError::InvalidRelocationFormat(format!("symbol {}", sym.name)));
        }

        let parsed = parse_sym_name(&sym.name).map_err(|e| {
            kerror!("symbol {} has an incorrectly formatted name", sym.name);
            e
        })?;
        let addr = find_object_symbol(syms, parsed.objname(), parsed.symbol, parsed.sympos)?;
        sym.value = addr;
    }
    Ok(())
}

/// Resolve and apply the relocation sections of `carrier` that belong to
/// `objname` (`None` for the base image)
pub fn write_object_relocations<H>(
    host: &H,
    objname: Option<&str>,
    carrier: &str,
    relocs: &mut RelocationInfo,
) -> KlpResult<()>
where
    H: SymbolTable + RelocationApplier + ?Sized,
{
    let objname = objname.unwrap_or(VMLINUX);
    let RelocationInfo { symbols, sections } = relocs;

    for section in sections.iter() {
        let sec_objname = parse_rela_sec_name(&section.name).map_err(|e| {
            kerror!("section {} has an incorrectly formatted name", section.name);
            e
        })?;
        if sec_objname != objname {
            continue;
        }

        resolve_symbols(host, section, symbols)?;
        host.apply_relocate_add(carrier, section, symbols)
            .map_err(KlpError::RelocationFailed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use klp_core::reloc::Relocation;
    use std::sync::Mutex;

    struct Table {
        vmlinux: Vec<(&'static str, u64)>,
        modules: Vec<(&'static str, Vec<(&'static str, u64)>)>,
        applied: Mutex<Vec<(String, String, Vec<u64>)>>,
        fail_apply: bool,
    }

    impl Table {
        fn new() -> Self {
            Table {
                vmlinux: vec![
                    ("foo", 0x1000),
                    ("bar", 0x2000),
                    ("bar", 0x3000),
                    ("bar", 0x4000),
                    ("state_show", 0x5000),
                ],
                modules: vec![("mod", vec![("foo", 0x9000), ("baz", 0x9100)])],
                applied: Mutex::new(Vec::new()),
                fail_apply: false,
            }
        }
    }

    impl SymbolTable for Table {
        fn for_each_symbol(&self, module: Option<&str>, visit: &mut dyn FnMut(&str, u64) -> bool) {
            let syms = match module {
                None => &self.vmlinux,
                Some(m) => match self.modules.iter().find(|(n, _)| *n == m) {
                    Some((_, syms)) => syms,
                    None => return,
                },
            };
            for (name, addr) in syms {
                if visit(name, *addr) {
                    return;
                }
            }
        }

        fn symbol_size(&self, _addr: u64) -> Option<u64> {
            Some(0x10)
        }
    }

    impl RelocationApplier for Table {
        fn apply_relocate_add(
            &self,
            carrier: &str,
            section: &RelocationSection,
            symbols: &[KlpSymbol],
        ) -> Result<(), i32> {
            if self.fail_apply {
                return Err(-8);
            }
            let values = section.relas.iter().map(|r| symbols[r.symbol].value).collect();
            self.applied
                .lock()
                .unwrap()
                .push((carrier.to_string(), section.name.clone(), values));
            Ok(())
        }
    }

    #[test]
    fn test_unique_symbol() {
        let t = Table::new();
        assert_eq!(find_object_symbol(&t, None, "foo", 0), Ok(0x1000));
        assert_eq!(find_object_symbol(&t, None, "foo", 1), Ok(0x1000));
        assert_eq!(find_object_symbol(&t, Some("mod"), "foo", 0), Ok(0x9000));
    }

    #[test]
    fn test_ambiguous_without_position() {
        let t = Table::new();
        assert!(matches!(
            find_object_symbol(&t, None, "bar", 0),
            Err(SymbolError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_position_selects_occurrence() {
        let t = Table::new();
        assert_eq!(find_object_symbol(&t, None, "bar", 1), Ok(0x2000));
        assert_eq!(find_object_symbol(&t, None, "bar", 3), Ok(0x4000));
        assert!(matches!(
            find_object_symbol(&t, None, "bar", 4),
            Err(SymbolError::PositionNotFound { pos: 4, .. })
        ));
        assert!(matches!(
            find_object_symbol(&t, None, "foo", 2),
            Err(SymbolError::PositionNotFound { .. })
        ));
    }

    #[test]
    fn test_not_found() {
        let t = Table::new();
        assert!(matches!(
            find_object_symbol(&t, None, "nope", 0),
            Err(SymbolError::NotFound { .. })
        ));
        assert!(matches!(
            find_object_symbol(&t, Some("absent"), "foo", 0),
            Err(SymbolError::NotFound { .. })
        ));
        // base image symbols are not visible through a module lookup
        assert!(matches!(
            find_object_symbol(&t, Some("mod"), "bar", 0),
            Err(SymbolError::NotFound { .. })
        ));
    }

    #[test]
    fn test_parse_sym_name() {
        let p = parse_sym_name(".klp.sym.vmlinux.state_show,1").unwrap();
        assert_eq!(p, KlpSymName { object: "vmlinux", symbol: "state_show", sympos: 1 });
        assert_eq!(p.objname(), None);

        let p = parse_sym_name(".klp.sym.mod.foo.cold,0").unwrap();
        assert_eq!(p.objname(), Some("mod"));
        assert_eq!(p.symbol, "foo.cold");
        assert_eq!(p.sympos, 0);
    }

    #[test]
    fn test_parse_sym_name_rejects_malformed() {
        for name in [
            "state_show",
            ".klp.sym.vmlinux",
            ".klp.sym.vmlinux.state_show",
            ".klp.sym.vmlinux.state_show,",
            ".klp.sym.vmlinux.state_show,x",
            ".klp.sym..foo,0",
            ".klp.sym.vmlinux.,0",
        ] {
            assert!(
                matches!(parse_sym_name(name), Err(SymbolError::InvalidRelocationFormat(_))),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_parse_field_widths() {
        let obj = "m".repeat(55);
        let name = format!(".klp.sym.{}.foo,0", obj);
        assert_eq!(parse_sym_name(&name).unwrap().object, obj);

        let name = format!(".klp.sym.{}.foo,0", "m".repeat(56));
        assert!(parse_sym_name(&name).is_err());

        let name = format!(".klp.sym.vmlinux.{},0", "s".repeat(128));
        assert!(parse_sym_name(&name).is_err());
    }

    #[test]
    fn test_parse_rela_sec_name() {
        assert_eq!(parse_rela_sec_name(".klp.rela.vmlinux.text"), Ok("vmlinux"));
        assert_eq!(parse_rela_sec_name(".klp.rela.mod.text.unlikely"), Ok("mod"));
        assert!(parse_rela_sec_name(".rela.text").is_err());
        assert!(parse_rela_sec_name(".klp.rela..text").is_err());
    }

    fn relocs(symbols: Vec<KlpSymbol>, sections: &[&str]) -> RelocationInfo {
        let mut info = RelocationInfo::new();
        for s in symbols {
            info.add_symbol(s);
        }
        for (i, name) in sections.iter().enumerate() {
            info.add_section(RelocationSection::new(
                *name,
                vec![Relocation { offset: i as u64 * 8, symbol: i, addend: 0 }],
            ));
        }
        info
    }

    #[test]
    fn test_write_relocations_for_matching_object_only() {
        let t = Table::new();
        let mut info = relocs(
            vec![
                KlpSymbol::new(".klp.sym.vmlinux.bar,2"),
                KlpSymbol::new(".klp.sym.mod.baz,0"),
            ],
            &[".klp.rela.vmlinux.text", ".klp.rela.mod.text"],
        );

        write_object_relocations(&t, None, "p", &mut info).unwrap();
        assert_eq!(info.symbols[0].value, 0x3000);
        assert_eq!(info.symbols[1].value, 0);

        write_object_relocations(&t, Some("mod"), "p__mod", &mut info).unwrap();
        assert_eq!(info.symbols[1].value, 0x9100);

        let applied = t.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0], ("p".to_string(), ".klp.rela.vmlinux.text".to_string(), vec![0x3000]));
        assert_eq!(applied[1].0, "p__mod");
    }

    #[test]
    fn test_unmarked_symbol_rejected() {
        let t = Table::new();
        let mut info = relocs(vec![KlpSymbol::unmarked(".klp.sym.vmlinux.foo,0")], &[".klp.rela.vmlinux.text"]);
        assert!(matches!(
            write_object_relocations(&t, None, "p", &mut info),
            Err(KlpError::Symbol(SymbolError::InvalidRelocationFormat(_)))
        ));
        assert!(t.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_bad_section_name_is_fatal() {
        let t = Table::new();
        let mut info = relocs(vec![KlpSymbol::new(".klp.sym.vmlinux.foo,0")], &[".klp.rela."]);
        assert!(write_object_relocations(&t, None, "p", &mut info).is_err());
    }

    #[test]
    fn test_resolution_error_propagates() {
        let t = Table::new();
        let mut info = relocs(vec![KlpSymbol::new(".klp.sym.vmlinux.bar,0")], &[".klp.rela.vmlinux.text"]);
        assert!(matches!(
            write_object_relocations(&t, None, "p", &mut info),
            Err(KlpError::Symbol(SymbolError::Ambiguous { .. }))
        ));
    }

    #[test]
    fn test_apply_failure() {
        let mut t = Table::new();
        t.fail_apply = true;
        let mut info = relocs(vec![KlpSymbol::new(".klp.sym.vmlinux.foo,0")], &[".klp.rela.vmlinux.text"]);
        assert_eq!(
            write_object_relocations(&t, None, "p", &mut info),
            Err(KlpError::RelocationFailed(-8))
        );
    }
}
