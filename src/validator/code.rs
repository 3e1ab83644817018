//! Code page validation (§4.6.1): byte-diff `expected` against `actual`
//! while whitelisting legitimate runtime differences.

use crate::patch::nops::P6_NOPS;

/// A single reported mismatch: only the first byte of a differing run is
/// reported (§4.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMismatch {
    pub offset: u64,
    pub expected: Vec<u8>,
    pub actual: Vec<u8>,
}

/// Inputs the whitelist rules need beyond the raw bytes: the jump-entry
/// table (code VA -> destination) and the set of SMP-lock offsets, both
/// text-relative to this page's owning loader, plus the known
/// `copy_user_generic_unrolled` redirect target and the kernel's
/// initialized-text length (bytes past it are uninitialized and skipped).
pub struct CodeWhitelist<'a> {
    pub jump_entries: &'a std::collections::BTreeMap<u64, u64>,
    pub smp_lock_offsets: &'a std::collections::BTreeSet<u64>,
    pub generic_unrolled_address: Option<u64>,
    pub initialized_text_len: usize,
}

/// Diffs `actual` against `expected`, both slices of the same page,
/// `page_offset` being the page's offset within the loader's text image.
/// Returns the list of unwhitelisted mismatches.
pub fn validate_code_page(
    expected: &[u8],
    actual: &[u8],
    page_offset: u64,
    whitelist: &CodeWhitelist<'_>,
) -> Vec<CodeMismatch> {
    let mut mismatches = Vec::new();
    let len = expected.len().min(actual.len());
    let mut i = 0usize;
    let mut prev_differed = false;
    while i < len {
        let abs_offset = page_offset + i as u64;
        if (page_offset as usize + i) >= whitelist.initialized_text_len {
            break; // rest of the page is uninitialized
        }
        if expected[i] == actual[i] {
            prev_differed = false;
            i += 1;
            continue;
        }
        if prev_differed {
            // Only the first byte of a differing run is reported.
            i += 1;
            continue;
        }
        if is_whitelisted(expected, actual, i, abs_offset, whitelist) {
            i += 1;
            continue;
        }
        // Context dump is +/-15 bytes around the mismatch.
        let dump_start = i.saturating_sub(15);
        let dump_end = (i + 15).min(len);
        mismatches.push(CodeMismatch {
            offset: abs_offset,
            expected: expected[dump_start..dump_end].to_vec(),
            actual: actual[dump_start..dump_end].to_vec(),
        });
        prev_differed = true;
        i += 1;
    }
    mismatches
}

fn is_whitelisted(expected: &[u8], actual: &[u8], i: usize, abs_offset: u64, w: &CodeWhitelist<'_>) -> bool {
    // Atomic nop swap: ideal_nops[5] <-> ideal_nops[9] over a 5-byte window.
    if slice_matches_nop(expected, i, 5) && slice_matches_nop(actual, i, 9) {
        return true;
    }
    if slice_matches_nop(expected, i, 9) && slice_matches_nop(actual, i, 5) {
        return true;
    }
    // Single-byte 0x66/0x90 swap.
    if matches!((expected.get(i), actual.get(i)), (Some(0x66), Some(0x90)) | (Some(0x90), Some(0x66))) {
        return true;
    }
    // Disabled jump label vs. its nop-5 memory form.
    if expected.get(i) == Some(&0xe9) && w.jump_entries.contains_key(&abs_offset) {
        if slice_matches_nop(actual, i, 5) || slice_matches_nop(actual, i, 9) {
            return true;
        }
    }
    // Redirect to copy_user_generic_unrolled via a 5-byte call.
    if let Some(target) = w.generic_unrolled_address {
        if actual.get(i) == Some(&0xe8) && actual.len() >= i + 5 {
            let rel = i32::from_le_bytes(actual[i + 1..i + 5].try_into().unwrap());
            let call_target = (abs_offset as i64 + 5 + rel as i64) as u64;
            if call_target == target {
                return true;
            }
        }
    }
    // SMP-lock offset in the whitelist.
    if w.smp_lock_offsets.contains(&abs_offset) {
        return true;
    }
    // Relative 0xe9 + zero32 <-> ideal_nops[9].
    if expected.get(i) == Some(&0xe9)
        && expected.len() >= i + 5
        && expected[i + 1..i + 5] == [0, 0, 0, 0]
        && slice_matches_nop(actual, i, 9)
    {
        return true;
    }
    false
}

fn slice_matches_nop(buf: &[u8], start: usize, len: usize) -> bool {
    buf.get(start..start + len).map(|s| s == P6_NOPS[len]).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn empty_whitelist() -> (BTreeMap<u64, u64>, BTreeSet<u64>) {
        (BTreeMap::new(), BTreeSet::new())
    }

    #[test]
    fn identical_pages_report_nothing() {
        let (jumps, locks) = empty_whitelist();
        let w = CodeWhitelist { jump_entries: &jumps, smp_lock_offsets: &locks, generic_unrolled_address: None, initialized_text_len: 16 };
        let buf = vec![0xccu8; 16];
        assert!(validate_code_page(&buf, &buf, 0, &w).is_empty());
    }

    #[test]
    fn single_byte_flip_is_reported_once() {
        let (jumps, locks) = empty_whitelist();
        let w = CodeWhitelist { jump_entries: &jumps, smp_lock_offsets: &locks, generic_unrolled_address: None, initialized_text_len: 16 };
        let expected = vec![0xccu8; 16];
        let mut actual = expected.clone();
        actual[4] = 0x00;
        let mismatches = validate_code_page(&expected, &actual, 0, &w);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].offset, 4);
    }

    #[test]
    fn nop_swap_is_whitelisted() {
        let (jumps, locks) = empty_whitelist();
        let w = CodeWhitelist { jump_entries: &jumps, smp_lock_offsets: &locks, generic_unrolled_address: None, initialized_text_len: 32 };
        let mut expected = vec![0u8; 32];
        expected[0..5].copy_from_slice(P6_NOPS[5]);
        let mut actual = expected.clone();
        actual[0..9].copy_from_slice(P6_NOPS[9]);
        assert!(validate_code_page(&expected, &actual, 0, &w).is_empty());
    }

    #[test]
    fn smp_lock_offset_is_whitelisted() {
        let jumps = BTreeMap::new();
        let mut locks = BTreeSet::new();
        locks.insert(3u64);
        let w = CodeWhitelist { jump_entries: &jumps, smp_lock_offsets: &locks, generic_unrolled_address: None, initialized_text_len: 16 };
        let expected = vec![0xf0u8, 0, 0, 0xf0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut actual = expected.clone();
        actual[3] = 0x3e;
        assert!(validate_code_page(&expected, &actual, 0, &w).is_empty());
    }

    #[test]
    fn content_past_initialized_length_is_skipped() {
        let (jumps, locks) = empty_whitelist();
        let w = CodeWhitelist { jump_entries: &jumps, smp_lock_offsets: &locks, generic_unrolled_address: None, initialized_text_len: 4 };
        let expected = vec![0u8; 8];
        let mut actual = expected.clone();
        actual[6] = 0xff;
        assert!(validate_code_page(&expected, &actual, 0, &w).is_empty());
    }
}
