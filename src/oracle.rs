//! The unified address → symbol oracle (§4.5), consolidating the
//! original's scattered per-`KernelManager` maps into one owned struct
//! per the §9 cyclic-reference redesign: loaders borrow an oracle handle
//! rather than holding a back-pointer to a `Kernel` container.

use crate::systemmap::SystemMapEntry;
use std::collections::{HashMap, HashSet};

/// A `(start, end)` range owned by a named function or object, plus which
/// loader/module it belongs to (for `getModuleForAddress`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRange {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub owner: String,
}

/// The tightest classification `classify(addr)` can return (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    FunctionStart { name: String },
    InText { owner: String, section: String, offset: u64, containing_symbol: Option<String> },
    ExceptionTableEntry,
    Unknown,
}

/// Three tiered maps by name → virtual address (§3), plus the ordered
/// ranges needed for `getContainingSymbol` and the exception-table ranges
/// needed by `classify`'s third tier.
#[derive(Debug, Clone, Default)]
pub struct SymbolOracle {
    system_map: HashMap<String, u64>,
    module_symbols: HashMap<String, u64>,
    function_symbols: HashMap<String, u64>,
    function_starts: HashMap<u64, String>,
    ranges: Vec<SymbolRange>,
    text_ranges: Vec<(u64, u64, String)>, // (start, end, owner) per loader's text section
    exception_table_ranges: Vec<(u64, u64)>,
    module_of_address: Vec<(u64, u64, String)>,
    /// Inverse value index over `module_symbols`/`system_map`, kept in sync
    /// by `add_module_symbol`/`load_system_map` so `is_symbol` is a hash hit
    /// rather than a scan (§4.5).
    symbol_values: HashSet<u64>,
}

impl SymbolOracle {
    pub fn new() -> SymbolOracle {
        SymbolOracle::default()
    }

    pub fn load_system_map(&mut self, entries: &[SystemMapEntry]) {
        for e in entries {
            self.system_map.entry(e.name.clone()).or_insert(e.address);
            self.symbol_values.insert(e.address);
        }
    }

    /// Registers a global symbol exported by a loader. Per §8 invariant 3,
    /// a global name must be unique; a second registration of the same
    /// name is a logic error in the caller (loaders must suffix locals
    /// before calling this for non-global symbols) and is resolved by
    /// keeping the first registration and not overwriting it silently.
    pub fn add_module_symbol(&mut self, name: &str, addr: u64) {
        self.module_symbols.entry(name.to_string()).or_insert(addr);
        self.symbol_values.insert(addr);
    }

    /// Registers a function start. Local functions must already be
    /// suffixed with `_<modulename>` by the caller (§4.4) before this is
    /// called, so distinct modules' same-named locals never collide here.
    pub fn add_function_symbol(&mut self, name: &str, addr: u64) {
        self.function_symbols.entry(name.to_string()).or_insert(addr);
        self.function_starts.entry(addr).or_insert_with(|| name.to_string());
    }

    pub fn add_text_range(&mut self, owner: &str, start: u64, end: u64) {
        self.text_ranges.push((start, end, owner.to_string()));
        self.module_of_address.push((start, end, owner.to_string()));
    }

    pub fn add_exception_table_range(&mut self, start: u64, end: u64) {
        self.exception_table_ranges.push((start, end));
    }

    pub fn add_symbol_range(&mut self, range: SymbolRange) {
        self.ranges.push(range);
    }

    /// System.map → module symbols → function symbols resolution order
    /// used by the relocation engine's `SHN_UNDEF` handling (§4.2).
    pub fn resolve_undef(&self, name: &str) -> Option<u64> {
        self.system_map
            .get(name)
            .or_else(|| self.module_symbols.get(name))
            .or_else(|| self.function_symbols.get(name))
            .copied()
    }

    pub fn is_function(&self, addr: u64) -> bool {
        self.function_starts.contains_key(&addr)
    }

    pub fn is_symbol(&self, addr: u64) -> bool {
        self.function_starts.contains_key(&addr) || self.symbol_values.contains(&addr)
    }

    pub fn get_symbol_name(&self, addr: u64) -> Option<&str> {
        self.function_starts.get(&addr).map(|s| s.as_str())
    }

    /// Ordered range lookup: the entry whose `[start, end)` covers `addr`.
    pub fn get_containing_symbol(&self, addr: u64) -> Option<&SymbolRange> {
        self.ranges.iter().find(|r| addr >= r.start && addr < r.end)
    }

    pub fn get_module_for_address(&self, addr: u64) -> Option<&str> {
        self.module_of_address
            .iter()
            .find(|(start, end, _)| addr >= *start && addr < *end)
            .map(|(_, _, owner)| owner.as_str())
    }

    pub fn classify(&self, addr: u64) -> Classification {
        if let Some(name) = self.function_starts.get(&addr) {
            return Classification::FunctionStart { name: name.clone() };
        }
        if let Some((start, _end, owner)) = self.text_ranges.iter().find(|(s, e, _)| addr >= *s && addr < *e) {
            let containing = self.get_containing_symbol(addr).map(|r| r.name.clone());
            return Classification::InText {
                owner: owner.clone(),
                section: ".text".to_string(),
                offset: addr - start,
                containing_symbol: containing,
            };
        }
        if self.exception_table_ranges.iter().any(|(s, e)| addr >= *s && addr < *e) {
            return Classification::ExceptionTableEntry;
        }
        Classification::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_in_precedence_order() {
        let mut oracle = SymbolOracle::new();
        oracle.add_function_symbol("dup", 0x2000);
        oracle.add_module_symbol("dup", 0x1000);
        oracle.load_system_map(&[SystemMapEntry { address: 0x500, symbol_type: 'T', name: "dup".into() }]);
        // System.map wins over module symbols wins over function symbols.
        assert_eq!(oracle.resolve_undef("dup"), Some(0x500));
    }

    #[test]
    fn classify_prefers_function_start_over_in_text() {
        let mut oracle = SymbolOracle::new();
        oracle.add_text_range("vmlinux", 0x1000, 0x3000);
        oracle.add_function_symbol("do_thing", 0x1500);
        assert_eq!(oracle.classify(0x1500), Classification::FunctionStart { name: "do_thing".into() });
        match oracle.classify(0x1600) {
            Classification::InText { owner, offset, .. } => {
                assert_eq!(owner, "vmlinux");
                assert_eq!(offset, 0x600);
            }
            other => panic!("expected InText, got {other:?}"),
        }
    }

    #[test]
    fn classify_falls_back_through_exception_table_to_unknown() {
        let mut oracle = SymbolOracle::new();
        oracle.add_exception_table_range(0x9000, 0x9100);
        assert_eq!(oracle.classify(0x9050), Classification::ExceptionTableEntry);
        assert_eq!(oracle.classify(0xdead), Classification::Unknown);
    }

    #[test]
    fn is_symbol_and_is_function_are_o1_hash_hits() {
        let mut oracle = SymbolOracle::new();
        oracle.add_function_symbol("f", 0x100);
        assert!(oracle.is_function(0x100));
        assert!(oracle.is_symbol(0x100));
        assert!(!oracle.is_function(0x200));
    }
}
