//! Snapshot of the guest's paravirt-ops function pointers (§3), captured
//! once at loader startup via the DWARF oracle and consumed read-only by
//! the paravirt patch pass (§4.3 Pass B).

use crate::external::DwarfOracle;

/// Byte offsets of `pv_irq_ops`, `pv_cpu_ops`, `pv_mmu_ops` within the
/// concatenated `paravirt_patch_template` struct, as captured from DWARF.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchTemplateLayout {
    pub pv_irq_ops_offset: u64,
    pub pv_cpu_ops_offset: u64,
    pub pv_mmu_ops_offset: u64,
}

/// The eight captured values of §3's `ParavirtState`: the raw bytes of
/// the seven `pv_*_ops` struct instances (concatenated, so a byte offset
/// into this buffer mirrors a byte offset into the live
/// `paravirt_patch_template`), plus the three well-known function
/// addresses used to recognize nop/identity ops.
#[derive(Debug, Clone, Default)]
pub struct ParavirtState {
    pub ops_template_bytes: Vec<u8>,
    pub layout: PatchTemplateLayout,
    pub paravirt_nop: Option<u64>,
    pub paravirt_ident_32: Option<u64>,
    pub paravirt_ident_64: Option<u64>,
}

impl ParavirtState {
    /// Captures the snapshot from a live guest via the DWARF oracle.
    /// Out of scope per §6/§1; this is the trait-boundary caller. Returns
    /// `None` fields / empty bytes if the oracle can't find a given
    /// symbol, which the patch pass treats the same as an unset op
    /// (patched to a nop).
    pub fn capture(oracle: &dyn DwarfOracle) -> ParavirtState {
        let ops_template_bytes = oracle
            .find_variable("paravirt_patch_template")
            .map(|v| v.raw_bytes)
            .unwrap_or_default();
        ParavirtState {
            ops_template_bytes,
            layout: PatchTemplateLayout::default(),
            paravirt_nop: oracle.find_function("_paravirt_nop").map(|f| f.address),
            paravirt_ident_32: oracle.find_function("_paravirt_ident_32").map(|f| f.address),
            paravirt_ident_64: oracle.find_function("_paravirt_ident_64").map(|f| f.address),
        }
    }

    /// Resolves a byte offset into the virtual `paravirt_patch_template`
    /// to the function pointer stored there, treating the captured bytes
    /// as a little-endian `u64` array.
    pub fn resolve_ops_template_offset(&self, byte_offset: u64) -> Option<u64> {
        let start = byte_offset as usize;
        let bytes = self.ops_template_bytes.get(start..start + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}
