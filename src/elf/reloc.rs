//! x86-64 relocation application (§4.2), as a pure function over a
//! section's bytes and a resolved symbol value — never mutating the
//! mapped ELF buffer in place.

use crate::error::{IntegrityError, Result};

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_PC32: u32 = 2;

/// One `.rela.X` entry, already carrying the resolved symbol value (`S`)
/// looked up via the oracle chain described in §4.2.
#[derive(Debug, Clone, Copy)]
pub struct RelaEntry {
    pub r_offset: u64,
    pub r_type: u32,
    pub addend: i64,
    pub symbol_value: u64,
    pub symbol_name_for_errors: &'static str,
}

/// Applies one relocation entry to `target`, a mutable byte buffer that is
/// a *copy* of the section being patched (see the `ExpectedImage`
/// copy-on-write design). `target_mem_addr` is the loaded virtual address
/// of `r_offset` within the section (`P` in ABI terms), needed for PC32.
///
/// `is_altinstructions` special-cases `R_X86_64_PC32` as described in
/// §4.2: the alternatives pass must still be able to find the replacement
/// bytes at their ELF-side (not memory-side) location, so the written
/// displacement is computed against the *file* offset rather than the
/// loaded address.
pub fn apply_relocation(
    target: &mut [u8],
    entry: &RelaEntry,
    is_altinstructions: bool,
    elf_side_base: u64,
) -> Result<()> {
    let off = entry.r_offset as usize;
    match entry.r_type {
        R_X86_64_NONE => Ok(()),
        R_X86_64_64 => {
            let value = entry.symbol_value.wrapping_add(entry.addend as u64);
            write_bytes(target, off, &value.to_le_bytes())
        }
        R_X86_64_32 => {
            let value = (entry.symbol_value as i64).wrapping_add(entry.addend);
            if !(0..=u32::MAX as i64).contains(&value) {
                return Err(IntegrityError::RelocationOverflow {
                    name: entry.symbol_name_for_errors.to_string(),
                    value,
                });
            }
            write_bytes(target, off, &(value as u32).to_le_bytes())
        }
        R_X86_64_32S => {
            let value = (entry.symbol_value as i64).wrapping_add(entry.addend);
            if !(i32::MIN as i64..=i32::MAX as i64).contains(&value) {
                return Err(IntegrityError::RelocationOverflow {
                    name: entry.symbol_name_for_errors.to_string(),
                    value,
                });
            }
            write_bytes(target, off, &(value as i32).to_le_bytes())
        }
        R_X86_64_PC32 => {
            let base = if is_altinstructions { elf_side_base } else { entry.r_offset };
            let value = (entry.symbol_value as i64)
                .wrapping_add(entry.addend)
                .wrapping_sub(base as i64);
            write_bytes(target, off, &(value as i32).to_le_bytes())
        }
        other => Err(IntegrityError::UnknownRelocationType { r_type: other }),
    }
}

/// One raw `Elf64_Rela` record as laid out in a `.rela.*` section, before
/// the symbol index has been resolved to a value through the oracle
/// chain.
#[derive(Debug, Clone, Copy)]
pub struct RawRela {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: i64,
}

/// Decodes raw `.rela.*` section bytes into `RawRela` records (24 bytes
/// each: `r_offset`, `r_info`, `r_addend`). Trailing bytes that don't
/// form a full record are ignored.
pub fn decode_rela(bytes: &[u8]) -> Vec<RawRela> {
    bytes
        .chunks_exact(24)
        .map(|chunk| {
            let r_offset = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let r_info = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            let r_addend = i64::from_le_bytes(chunk[16..24].try_into().unwrap());
            RawRela { r_offset, r_sym: (r_info >> 32) as u32, r_type: (r_info & 0xffff_ffff) as u32, r_addend }
        })
        .collect()
}

fn write_bytes(target: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
    let end = off + bytes.len();
    target
        .get_mut(off..end)
        .ok_or_else(|| IntegrityError::LoaderAborted {
            module: "<section>".into(),
            reason: format!("relocation write {off}..{end} out of section bounds"),
        })?
        .copy_from_slice(bytes);
    Ok(())
}
