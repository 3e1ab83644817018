//! Stack page validation (§4.6.3) and the `isReturnAddress` decoder, one
//! of the explicitly testable properties (§8 invariant 6).

use crate::external::HypervisorBackend;

/// Result of decoding the bytes preceding a candidate return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnAddressKind {
    /// Not a call-class instruction at all (e.g. a `jmp`).
    NotAReturn,
    /// A call-class instruction whose target could not be statically
    /// resolved from the bytes alone (indirect call through a register or
    /// table).
    Indirect,
    /// A direct `call rel32`; the resolved return address is `base + off`.
    Direct(u64),
    /// An indirect call through a RIP-relative pointer that was followed
    /// via a guest memory read; the dereferenced value is carried here.
    IndirectResolved(u64),
}

impl ReturnAddressKind {
    /// Collapses to the original C++ `isReturnAddress`'s `{0, 1, addr}`
    /// return convention for callers that only care about plausibility.
    pub fn as_legacy_code(self) -> u64 {
        match self {
            ReturnAddressKind::NotAReturn => 0,
            ReturnAddressKind::Indirect => 1,
            ReturnAddressKind::Direct(addr) => addr,
            ReturnAddressKind::IndirectResolved(addr) => addr,
        }
    }
}

/// Pattern-matches the bytes preceding `off` in `text` against the call
/// encodings enumerated in §4.6.3. `base` is the virtual address of
/// `text[0]`; `deref` resolves a guest VA to a `u64` for the `FF 15`
/// indirect-call-through-RIP-pointer case.
pub fn is_return_address(text: &[u8], off: usize, base: u64, deref: impl Fn(u64) -> Option<u64>) -> ReturnAddressKind {
    if off < 5 {
        return ReturnAddressKind::NotAReturn;
    }
    let window = &text[off - 5..off];
    match window {
        [0xe8, a, b, c, d] => {
            let rel = i32::from_le_bytes([*a, *b, *c, *d]);
            ReturnAddressKind::Direct((base + off as u64).wrapping_add(rel as i64 as u64))
        }
        [0xe9, _, _, _, _] => ReturnAddressKind::NotAReturn,
        [_, 0xff, 0x90, _, _] => ReturnAddressKind::Indirect,
        [0xff, 0x14, 0x25, _, _] => ReturnAddressKind::Indirect,
        [_, 0xff, 0x14, 0xc5, _] => ReturnAddressKind::Indirect,
        _ => {
            if off >= 6 && text[off - 6] == 0xff && matches!(text[off - 5], 0x15 | 0x25) {
                let rel = i32::from_le_bytes(text[off - 4..off].try_into().unwrap());
                let ptr_va = (base + off as u64).wrapping_add(rel as i64 as u64);
                return match deref(ptr_va) {
                    Some(v) => ReturnAddressKind::IndirectResolved(v),
                    None => ReturnAddressKind::Indirect,
                };
            }
            if off >= 2 && text[off - 2] == 0xff {
                return ReturnAddressKind::Indirect;
            }
            ReturnAddressKind::NotAReturn
        }
    }
}

/// One window of the stack validated, per §4.6.3.
#[derive(Debug, Clone)]
pub struct StackFinding {
    pub offset: u64,
    pub value: u64,
    pub resolved: bool,
    pub containing_function: Option<String>,
}

/// Walks `[sp_end, 8192 - 4)` in 8-byte windows, classifying each
/// candidate pointer per §4.6.3. `classify_in_text` answers whether a
/// value lies in some loader's text and, if so, returns the containing
/// function name.
pub fn validate_stack_page(
    stack_bytes: &[u8],
    sp_end: u64,
    hv: &dyn HypervisorBackend,
    is_function_start: impl Fn(u64) -> bool,
    is_data_symbol: impl Fn(u64) -> bool,
    classify_in_text: impl Fn(u64) -> Option<(String, usize, u64)>,
) -> Vec<StackFinding> {
    let mut findings = Vec::new();
    let mut i = sp_end as usize;
    while i + 8 <= 8192usize.saturating_sub(4) {
        let window = &stack_bytes[i..i + 8];
        let high = u32::from_le_bytes(window[4..8].try_into().unwrap());
        if high != 0xffffffff {
            i += 8;
            continue;
        }
        let value = u64::from_le_bytes(window.try_into().unwrap());
        if value == 0xffffffff_ffffffff {
            i += 8;
            continue;
        }
        if is_function_start(value) || is_data_symbol(value) {
            i += 8;
            continue;
        }
        if let Some((owner, offset, base)) = classify_in_text(value) {
            let _ = owner;
            let kind = is_return_address(stack_bytes, offset, base, |va| hv.read_u64(va));
            findings.push(StackFinding {
                offset: i as u64,
                value,
                resolved: !matches!(kind, ReturnAddressKind::NotAReturn),
                containing_function: None,
            });
        }
        i += 8;
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn deref_none(_: u64) -> Option<u64> {
        None
    }

    #[rstest]
    #[case(vec![0xe8, 0x10, 0x00, 0x00, 0x00], ReturnAddressKind::Direct(0x1a))]
    #[case(vec![0xe9, 0x10, 0x00, 0x00, 0x00], ReturnAddressKind::NotAReturn)]
    #[case(vec![0x41, 0xff, 0x90, 0x08, 0x00], ReturnAddressKind::Indirect)]
    #[case(vec![0xff, 0x14, 0x25, 0x00, 0x10], ReturnAddressKind::Indirect)]
    #[case(vec![0x41, 0xff, 0x14, 0xc5, 0x00], ReturnAddressKind::Indirect)]
    #[case(vec![0x00, 0x00, 0x00, 0x00, 0x00], ReturnAddressKind::NotAReturn)]
    fn decodes_call_encodings(#[case] window: Vec<u8>, #[case] expected: ReturnAddressKind) {
        let base = 0u64;
        let mut text = vec![0u8; 5];
        text.extend_from_slice(&window);
        let off = text.len();
        let result = is_return_address(&text, off, base, deref_none);
        assert_eq!(result, expected);
    }

    #[test]
    fn short_window_is_not_a_return() {
        let text = [0xe8, 0x00];
        assert_eq!(is_return_address(&text, 2, 0, deref_none), ReturnAddressKind::NotAReturn);
    }

    #[test]
    fn direct_call_resolves_relative_to_following_instruction() {
        let mut text = vec![0u8; 5];
        text.extend_from_slice(&[0xe8, 0xfb, 0xff, 0xff, 0xff]); // rel32 = -5
        let off = text.len();
        let base = 0x2000u64;
        let result = is_return_address(&text, off, base, deref_none);
        assert_eq!(result, ReturnAddressKind::Direct(base + off as u64 - 5));
    }
}
