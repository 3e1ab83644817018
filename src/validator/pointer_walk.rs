//! Pointer walk on data pages (§4.6.4): for each aligned 8-byte window
//! that looks like a kernel-space pointer, decide benign vs suspicious.

use crate::validator::stack::{is_return_address, ReturnAddressKind};

/// What a candidate pointer turned out to be, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerVerdict {
    AllOnesSentinel,
    FunctionStart,
    DataSymbol,
    WhitelistedSite,
    ReturnAddress,
    Suspicious,
}

/// One whitelisted loader-side reason a pointer is benign: an SMP-lock
/// offset, a jump-entry source, a jump-entry destination, or an address
/// past `__ex_table`'s start (per §4.6.4's enumeration).
pub trait LoaderWhitelist {
    fn is_smp_lock_offset(&self, addr: u64) -> bool;
    fn is_jump_entry_source(&self, addr: u64) -> bool;
    fn is_jump_destination(&self, addr: u64) -> bool;
    fn is_above_ex_table(&self, addr: u64) -> bool;
}

/// One finding from the pointer walk: the window's offset within the
/// page, the candidate value, and its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerFinding {
    pub offset: u64,
    pub value: u64,
    pub verdict: PointerVerdict,
}

/// Walks `page` in aligned 8-byte windows. `text_for_value` returns the
/// `(text_bytes, text_base)` of the loader owning `value`, if any, so a
/// candidate's preceding bytes can be checked by `isReturnAddress`.
pub fn walk_pointers(
    page: &[u8],
    is_function_start: impl Fn(u64) -> bool,
    is_data_symbol: impl Fn(u64) -> bool,
    whitelist: &dyn LoaderWhitelist,
    text_for_value: impl Fn(u64) -> Option<(Vec<u8>, u64)>,
) -> Vec<PointerFinding> {
    let mut findings = Vec::new();
    let mut i = 0usize;
    while i + 8 <= page.len() {
        let word = &page[i..i + 8];
        let high = u32::from_le_bytes(word[4..8].try_into().unwrap());
        if high != 0xffffffff {
            i += 8;
            continue;
        }
        let value = u64::from_le_bytes(word.try_into().unwrap());
        let verdict = classify_pointer(value, &is_function_start, &is_data_symbol, whitelist, &text_for_value);
        if !matches!(verdict, PointerVerdict::AllOnesSentinel) {
            findings.push(PointerFinding { offset: i as u64, value, verdict });
        }
        i += 8;
    }
    findings
}

fn classify_pointer(
    value: u64,
    is_function_start: &impl Fn(u64) -> bool,
    is_data_symbol: &impl Fn(u64) -> bool,
    whitelist: &dyn LoaderWhitelist,
    text_for_value: &impl Fn(u64) -> Option<(Vec<u8>, u64)>,
) -> PointerVerdict {
    if value == u64::MAX {
        return PointerVerdict::AllOnesSentinel;
    }
    if is_function_start(value) {
        return PointerVerdict::FunctionStart;
    }
    if is_data_symbol(value) {
        return PointerVerdict::DataSymbol;
    }
    if whitelist.is_smp_lock_offset(value)
        || whitelist.is_jump_entry_source(value)
        || whitelist.is_jump_destination(value)
        || whitelist.is_above_ex_table(value)
    {
        return PointerVerdict::WhitelistedSite;
    }
    if let Some((text, base)) = text_for_value(value) {
        let off = (value - base) as usize;
        if matches!(
            is_return_address(&text, off, base, |_| None),
            ReturnAddressKind::Direct(_) | ReturnAddressKind::IndirectResolved(_) | ReturnAddressKind::Indirect
        ) {
            return PointerVerdict::ReturnAddress;
        }
    }
    PointerVerdict::Suspicious
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoWhitelist;
    impl LoaderWhitelist for NoWhitelist {
        fn is_smp_lock_offset(&self, _addr: u64) -> bool {
            false
        }
        fn is_jump_entry_source(&self, _addr: u64) -> bool {
            false
        }
        fn is_jump_destination(&self, _addr: u64) -> bool {
            false
        }
        fn is_above_ex_table(&self, _addr: u64) -> bool {
            false
        }
    }

    fn page_with(value: u64) -> Vec<u8> {
        let mut page = vec![0u8; 16];
        page[0..8].copy_from_slice(&value.to_le_bytes());
        page
    }

    #[test]
    fn skips_non_kernel_pointers() {
        let page = page_with(0x0000000012345678);
        let findings = walk_pointers(&page, |_| false, |_| false, &NoWhitelist, |_| None);
        assert!(findings.is_empty());
    }

    #[test]
    fn skips_all_ones_sentinel() {
        let page = page_with(u64::MAX);
        let findings = walk_pointers(&page, |_| false, |_| false, &NoWhitelist, |_| None);
        assert!(findings.is_empty());
    }

    #[test]
    fn reports_suspicious_kernel_pointer_with_no_whitelist_hit() {
        let page = page_with(0xffffffff81234567);
        let findings = walk_pointers(&page, |_| false, |_| false, &NoWhitelist, |_| None);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].verdict, PointerVerdict::Suspicious);
    }

    #[test]
    fn function_start_is_benign() {
        let page = page_with(0xffffffff81234567);
        let findings = walk_pointers(&page, |v| v == 0xffffffff81234567, |_| false, &NoWhitelist, |_| None);
        assert_eq!(findings[0].verdict, PointerVerdict::FunctionStart);
    }
}
