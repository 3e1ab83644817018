//! Raw section-byte decoders for the five self-modifying-code passes
//! (§4.3), pinned to one canonical modern x86-64 kernel ABI record layout
//! per the DESIGN.md open-question resolution (the original resolves
//! these layouts dynamically via live DWARF `BaseType` lookups, which is
//! out of scope here).

use super::{AltInstrEntry, JumpEntry, ParaInstrSite};

/// Decodes `.altinstructions` (12-byte records: self-relative `s32`
/// `instr_offset`, self-relative `s32` `repl_offset`, `u16` cpuid, `u8`
/// instrlen, `u8` replacementlen) into `AltInstrEntry`s with absolute
/// `orig_offset` and an `.altinstr_replacement`-relative `repl_offset`.
pub fn decode_alt_instr_entries(
    bytes: &[u8],
    altinstructions_base: u64,
    altinstr_replacement_base: u64,
) -> Vec<AltInstrEntry> {
    bytes
        .chunks_exact(12)
        .enumerate()
        .map(|(i, chunk)| {
            let field_va = altinstructions_base + (i * 12) as u64;
            let instr_rel = i32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let repl_rel = i32::from_le_bytes(chunk[4..8].try_into().unwrap());
            let cpuid = u16::from_le_bytes(chunk[8..10].try_into().unwrap());
            let instr_va = (field_va as i64 + instr_rel as i64) as u64;
            let repl_va = ((field_va + 4) as i64 + repl_rel as i64) as u64;
            AltInstrEntry {
                orig_offset: instr_va,
                repl_offset: repl_va.wrapping_sub(altinstr_replacement_base),
                cpuid,
                orig_len: chunk[10],
                repl_len: chunk[11],
            }
        })
        .collect()
}

/// Decodes `.parainstructions` (pinned 16-byte records: `u64` `instr_va`,
/// `u16` instrtype, `u8` clobbers, `u8` len, 4 bytes padding) into
/// `ParaInstrSite`s.
pub fn decode_para_instr_sites(bytes: &[u8]) -> Vec<ParaInstrSite> {
    bytes
        .chunks_exact(16)
        .map(|chunk| ParaInstrSite {
            instr_va: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
            instrtype: u16::from_le_bytes(chunk[8..10].try_into().unwrap()),
            clobbers: chunk[10],
            len: chunk[11],
        })
        .collect()
}

/// Decodes `.smp_locks` (4-byte self-relative `s32` offsets) into
/// text-relative byte offsets (absolute VA minus `text_base`).
pub fn decode_smp_lock_offsets(bytes: &[u8], smp_locks_base: u64, text_base: u64) -> Vec<u64> {
    bytes
        .chunks_exact(4)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let field_va = smp_locks_base + (i * 4) as u64;
            let rel = i32::from_le_bytes(chunk.try_into().unwrap());
            let abs = (field_va as i64 + rel as i64) as u64;
            abs.checked_sub(text_base)
        })
        .collect()
}

/// Decodes `__jump_table` (24-byte triples: `u64` code, `u64` target,
/// `u64` key) into `JumpEntry`s.
pub fn decode_jump_entries(bytes: &[u8]) -> Vec<JumpEntry> {
    bytes
        .chunks_exact(24)
        .map(|chunk| JumpEntry {
            code: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
            target: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
            key: u64::from_le_bytes(chunk[16..24].try_into().unwrap()),
        })
        .collect()
}

/// Decodes `__start_mcount_loc..__stop_mcount_loc` (8-byte `u64` VA
/// array) into absolute virtual addresses.
pub fn decode_mcount_sites(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_alt_instr_entry_with_self_relative_offsets() {
        let altinstructions_base = 0xffffffff82000000u64;
        let altinstr_replacement_base = 0xffffffff83000000u64;
        let instr_va = 0xffffffff81001000u64;
        let repl_va = altinstr_replacement_base + 0x10;
        let mut bytes = Vec::new();
        let instr_rel = (instr_va as i64 - altinstructions_base as i64) as i32;
        let repl_rel = (repl_va as i64 - (altinstructions_base + 4) as i64) as i32;
        bytes.extend_from_slice(&instr_rel.to_le_bytes());
        bytes.extend_from_slice(&repl_rel.to_le_bytes());
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.push(5);
        bytes.push(2);
        let entries = decode_alt_instr_entries(&bytes, altinstructions_base, altinstr_replacement_base);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].orig_offset, instr_va);
        assert_eq!(entries[0].repl_offset, 0x10);
        assert_eq!(entries[0].cpuid, 3);
        assert_eq!(entries[0].orig_len, 5);
        assert_eq!(entries[0].repl_len, 2);
    }

    #[test]
    fn decodes_para_instr_site() {
        let mut bytes = vec![0u8; 16];
        bytes[0..8].copy_from_slice(&0xffffffff81002000u64.to_le_bytes());
        bytes[8..10].copy_from_slice(&0x0011u16.to_le_bytes());
        bytes[10] = 0xff;
        bytes[11] = 3;
        let sites = decode_para_instr_sites(&bytes);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].instr_va, 0xffffffff81002000);
        assert_eq!(sites[0].instrtype, 0x0011);
        assert_eq!(sites[0].clobbers, 0xff);
        assert_eq!(sites[0].len, 3);
    }

    #[test]
    fn decodes_smp_lock_offsets_relative_to_text_base() {
        let smp_locks_base = 0xffffffff84000000u64;
        let text_base = 0xffffffff81000000u64;
        let target = text_base + 0x50;
        let rel = (target as i64 - smp_locks_base as i64) as i32;
        let offsets = decode_smp_lock_offsets(&rel.to_le_bytes(), smp_locks_base, text_base);
        assert_eq!(offsets, vec![0x50]);
    }

    #[test]
    fn decodes_jump_entries_and_mcount_sites() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xffffffff81000000u64.to_le_bytes());
        bytes.extend_from_slice(&0xffffffff81000100u64.to_le_bytes());
        bytes.extend_from_slice(&0xffffffff82000000u64.to_le_bytes());
        let entries = decode_jump_entries(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code, 0xffffffff81000000);
        assert_eq!(entries[0].target, 0xffffffff81000100);
        assert_eq!(entries[0].key, 0xffffffff82000000);

        let mcount_bytes = 0xffffffff81000050u64.to_le_bytes();
        assert_eq!(decode_mcount_sites(&mcount_bytes), vec![0xffffffff81000050]);
    }
}
