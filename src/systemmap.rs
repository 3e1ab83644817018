use crate::error::{IntegrityError, Result};
use std::path::Path;

/// One `System.map` line: `<hex-address> <type-char> <name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMapEntry {
    pub address: u64,
    pub symbol_type: char,
    pub name: String,
}

/// Parses a `System.map` file into its entries, in file order. Pulled out
/// as a standalone parser (rather than inlined into whatever builds the
/// symbol oracle) so the oracle, the quirks cross-check, and tests can all
/// use it independently.
pub fn parse_system_map(path: &Path) -> Result<Vec<SystemMapEntry>> {
    let text = std::fs::read_to_string(path).map_err(|e| IntegrityError::SystemMap {
        path: path.display().to_string(),
        source: e.to_string(),
    })?;
    parse_system_map_str(&text).map_err(|source| IntegrityError::SystemMap {
        path: path.display().to_string(),
        source,
    })
}

pub fn parse_system_map_str(text: &str) -> std::result::Result<Vec<SystemMapEntry>, String> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let addr_str = parts.next().ok_or_else(|| format!("line {}: missing address", lineno + 1))?;
        let type_str = parts.next().ok_or_else(|| format!("line {}: missing type", lineno + 1))?;
        let name = parts.next().ok_or_else(|| format!("line {}: missing name", lineno + 1))?;
        let address = u64::from_str_radix(addr_str, 16)
            .map_err(|e| format!("line {}: bad address '{addr_str}': {e}", lineno + 1))?;
        let symbol_type = type_str
            .chars()
            .next()
            .ok_or_else(|| format!("line {}: empty type field", lineno + 1))?;
        entries.push(SystemMapEntry { address, symbol_type, name: name.to_string() });
    }
    Ok(entries)
}
