use crate::error::{IntegrityError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Call-targets file: packed little-endian `(callsite_va, destination_va)`
/// 8-byte-pair records, consulted by the stack-page validator to check a
/// resolved return address against a previously recorded call target.
#[derive(Debug, Clone, Default)]
pub struct CallTargets {
    map: BTreeMap<u64, u64>,
}

impl CallTargets {
    pub fn load(path: &Path) -> Result<CallTargets> {
        let bytes = std::fs::read(path).map_err(|e| IntegrityError::DataFile {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        Self::decode(&bytes).map_err(|source| IntegrityError::DataFile {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<CallTargets, String> {
        if bytes.len() % 16 != 0 {
            return Err(format!(
                "targets file length {} is not a multiple of 16 bytes",
                bytes.len()
            ));
        }
        let mut map = BTreeMap::new();
        for chunk in bytes.chunks_exact(16) {
            let callsite = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let destination = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            map.insert(callsite, destination);
        }
        Ok(CallTargets { map })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.map.len() * 16);
        for (callsite, destination) in &self.map {
            out.extend_from_slice(&callsite.to_le_bytes());
            out.extend_from_slice(&destination.to_le_bytes());
        }
        out
    }

    pub fn insert(&mut self, callsite: u64, destination: u64) {
        self.map.insert(callsite, destination);
    }

    pub fn destination_of(&self, callsite: u64) -> Option<u64> {
        self.map.get(&callsite).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut targets = CallTargets::default();
        targets.insert(0xffffffff81000100, 0xffffffff81000200);
        targets.insert(0xffffffff81000300, 0xffffffff81000400);
        let encoded = targets.encode();
        let decoded = CallTargets::decode(&encoded).unwrap();
        assert_eq!(decoded.destination_of(0xffffffff81000100), Some(0xffffffff81000200));
        assert_eq!(decoded.destination_of(0xffffffff81000300), Some(0xffffffff81000400));
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn rejects_misaligned_length() {
        let bytes = vec![0u8; 15];
        assert!(CallTargets::decode(&bytes).is_err());
    }
}
