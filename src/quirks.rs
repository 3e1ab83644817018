use crate::error::{IntegrityError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single kernel-version-specific stack-pointer exception: at
/// `sp_end + offset`, the live value `pointer` is a known artifact of a
/// particular kernel build and should be treated as resolved rather than
/// reported as a suspicious in-text pointer.
///
/// Resolves the first SPEC_FULL.md §9 open question: these were two
/// hardcoded `(offset, pointer)` pairs in the original; here they are
/// data, defaulting to none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackException {
    pub offset: u64,
    pub pointer: u64,
}

/// Kernel-version-specific exceptions that would otherwise require
/// recompiling the validator. Loaded from an optional `-q` YAML file;
/// absent file == empty `Quirks`, which changes nothing about validator
/// behavior versus today's unconditional checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quirks {
    #[serde(default)]
    pub stack_exceptions: Vec<StackException>,
    #[serde(default)]
    pub zero_pages: Vec<u64>,
}

impl Quirks {
    pub fn load(path: &Path) -> Result<Quirks> {
        let text = std::fs::read_to_string(path).map_err(|e| IntegrityError::DataFile {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| IntegrityError::DataFile {
            path: path.display().to_string(),
            source: e.to_string(),
        })
    }

    /// True if `value` at `sp_end + offset` is a documented exception.
    pub fn matches_stack_exception(&self, offset: u64, value: u64) -> bool {
        self.stack_exceptions
            .iter()
            .any(|e| e.offset == offset && e.pointer == value)
    }

    pub fn is_zero_page(&self, addr: u64) -> bool {
        self.zero_pages.contains(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_quirks_match_nothing() {
        let q = Quirks::default();
        assert!(!q.matches_stack_exception(0x1f50, 0xffffffff81234567));
        assert!(!q.is_zero_page(0xffff81aef000));
    }

    #[test]
    fn loads_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quirks.yaml");
        std::fs::write(
            &path,
            "stack_exceptions:\n  - offset: 0x1f50\n    pointer: 0xffffffff81234567\nzero_pages:\n  - 0xffff81aef000\n",
        )
        .unwrap();
        let q = Quirks::load(&path).unwrap();
        assert!(q.matches_stack_exception(0x1f50, 0xffffffff81234567));
        assert!(q.is_zero_page(0xffff81aef000));
        assert!(!q.is_zero_page(0xffff817c6000));
    }
}
