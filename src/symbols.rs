use crate::error::{Error, Result};

use memflow::prelude::v1::Address;

use goblin::pe::PE;

use log::*;

use std::collections::BTreeMap;
use std::ops::Bound;

/// Host side symbol resolution.
pub trait SymbolSource {
    /// Address of the symbol called `name`, or of the first symbol whose name starts with it.
    ///
    /// Prefix lookups allow matching MSVC mangled names by their stable head,
    /// e.g. `?SmFeCheckPresent` for `?SmFeCheckPresent@?$SMKM_STORE_MGR@...`.
    fn resolve(&self, name: &str) -> Option<Address>;
}

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Address>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: Address) {
        self.symbols.insert(name.into(), address);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Address)> {
        self.symbols.iter().map(|(n, a)| (n.as_str(), *a))
    }

    /// Collects the named exports of a PE file, relocated to its preferred base.
    pub fn from_pe_exports(buf: &[u8]) -> Result<Self> {
        let pe = PE::parse(buf)?;
        let base = Address::from(pe.image_base as u64);

        let mut table = Self::new();

        for export in &pe.exports {
            if let Some(name) = export.name {
                table.insert(name, base + export.rva);
            }
        }

        debug!("{} exports", table.len());

        Ok(table)
    }

    /// Parses a symbol map with one `<address> [type] <name>` entry per line.
    ///
    /// Addresses are hexadecimal, optionally `0x` prefixed and optionally split
    /// with a backtick the way WinDbg prints 64-bit values. Empty lines and
    /// lines starting with `#` are skipped.
    pub fn parse_map(text: &str) -> Result<Self> {
        let mut table = Self::new();

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = line.split_whitespace().collect::<Vec<_>>();

            let (address, name) = match fields.as_slice() {
                [address, name] | [address, _, name] => (*address, *name),
                _ => {
                    return Err(Error::SymbolMap {
                        line: idx + 1,
                        reason: format!("expected 2 or 3 fields, got {}", fields.len()),
                    })
                }
            };

            let digits = address
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .replace('`', "");

            let address = u64::from_str_radix(&digits, 16).map_err(|e| Error::SymbolMap {
                line: idx + 1,
                reason: format!("bad address {:?}: {}", address, e),
            })?;

            table.insert(name, Address::from(address));
        }

        debug!("{} symbols in map", table.len());

        Ok(table)
    }
}

impl SymbolSource for SymbolTable {
    fn resolve(&self, name: &str) -> Option<Address> {
        // An exact match always sorts before the names it prefixes.
        self.symbols
            .range::<str, _>((Bound::Included(name), Bound::Unbounded))
            .next()
            .filter(|(n, _)| n.starts_with(name))
            .map(|(_, a)| *a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = "
        # nt symbols
        fffff801`5a2b3c40 T ?SmFeCheckPresent@?$SMKM_STORE_MGR@USM_TRAITS@@@@SAJPEAU1@KPEAU_SM_PAGE_KEY@@@Z
        0xfffff8015a400000 ?BTreeSearchKey@?$B_TREE@T_SM_PAGE_KEY@@USMKM_FRONTEND_ENTRY@@$0BAA@UNodeEmpty@@@@SAXPEAU1@T_SM_PAGE_KEY@@PEAUSEARCH_RESULT@1@@Z
        fffff8015a100000 T SmFe
    ";

    #[test]
    fn parses_windbg_and_nm_style_lines() {
        let table = SymbolTable::parse_map(MAP).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.resolve("SmFe"),
            Some(Address::from(0xfffff8015a100000u64))
        );
    }

    #[test]
    fn resolves_mangled_prefix() {
        let table = SymbolTable::parse_map(MAP).unwrap();
        assert_eq!(
            table.resolve("?SmFeCheckPresent"),
            Some(Address::from(0xfffff8015a2b3c40u64))
        );
        assert_eq!(
            table.resolve("?BTreeSearchKey@?$B_TREE@T_SM_PAGE_KEY@@USMKM_FRONTEND_ENTRY"),
            Some(Address::from(0xfffff8015a400000u64))
        );
        assert_eq!(table.resolve("?SmFeCheckPresentX"), None);
        assert_eq!(table.resolve("SmKm"), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        match SymbolTable::parse_map("fffff801 T name extra") {
            Err(Error::SymbolMap { line: 1, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        match SymbolTable::parse_map("\nzzzz name") {
            Err(Error::SymbolMap { line: 2, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
