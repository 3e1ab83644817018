//! The five kernel self-modifying-code passes (§4.3), each a pure
//! transform `ExpectedImage -> ExpectedImage` per the copy-on-write
//! design note in §9.

pub mod nops;
pub mod sections;

use crate::paravirt::ParavirtState;
use nops::{add_nops, nop5};
use std::collections::{BTreeMap, BTreeSet};

/// The patched, relocated expected in-memory image of one loader's text
/// (and read-only data), plus the runtime-variation whitelists consulted
/// by the page validator on mismatch (§3).
#[derive(Debug, Clone, Default)]
pub struct ExpectedImage {
    pub text: Vec<u8>,
    pub text_base: u64,
    pub ro_data: Vec<u8>,
    pub ro_data_base: u64,
    pub smp_lock_offsets: BTreeSet<u64>,
    pub jump_entries: BTreeMap<u64, u64>,
    pub jump_destinations: BTreeSet<u64>,
    pub paravirt_sites: BTreeSet<u64>,
}

impl ExpectedImage {
    pub fn new(text: Vec<u8>, text_base: u64) -> ExpectedImage {
        ExpectedImage { text, text_base, ..Default::default() }
    }

    fn offset(&self, va: u64) -> Option<usize> {
        va.checked_sub(self.text_base).map(|o| o as usize)
    }
}

/// One `.altinstructions` entry (§4.3 Pass A).
#[derive(Debug, Clone, Copy)]
pub struct AltInstrEntry {
    pub orig_offset: u64,
    pub repl_offset: u64,
    pub cpuid: u16,
    pub orig_len: u8,
    pub repl_len: u8,
}

/// Pass A — Alternatives. `cpu_has_feature` answers whether the guest's
/// `boot_cpu_data.x86_capability` bit for a given cpuid is set.
/// `altinstr_replacement` is the raw `.altinstr_replacement` section bytes
/// (ELF-side, not yet relocated to their final text position).
pub fn apply_alternatives(
    image: &ExpectedImage,
    entries: &[AltInstrEntry],
    altinstr_replacement: &[u8],
    cpu_has_feature: impl Fn(u16) -> bool,
) -> ExpectedImage {
    let mut out = image.clone();
    for entry in entries {
        if !cpu_has_feature(entry.cpuid) {
            continue;
        }
        let Some(dst) = out.offset(entry.orig_offset) else { continue };
        let src_start = entry.repl_offset as usize;
        let repl_len = entry.repl_len as usize;
        let orig_len = entry.orig_len as usize;
        let Some(src) = altinstr_replacement.get(src_start..src_start + repl_len) else { continue };
        let mut replacement = src.to_vec();
        // A 0xe8 call-5-byte replacement needs its displacement fixed up:
        // the replacement bytes were assembled against the
        // .altinstr_replacement section's own location, not the original
        // instruction's text position.
        if replacement.first() == Some(&0xe8) && replacement.len() >= 5 {
            let delta = (entry.orig_offset as i64 + out.text_base as i64)
                - (entry.repl_offset as i64 + out.text_base as i64);
            let orig_rel = i32::from_le_bytes(replacement[1..5].try_into().unwrap());
            let new_rel = orig_rel as i64 + delta;
            replacement[1..5].copy_from_slice(&(new_rel as i32).to_le_bytes());
        }
        out.text[dst..dst + repl_len].copy_from_slice(&replacement);
        if repl_len < orig_len {
            add_nops(&mut out.text[dst + repl_len..dst + orig_len], orig_len - repl_len);
        }
    }
    out
}

/// One `.parainstructions` site (§4.3 Pass B).
#[derive(Debug, Clone, Copy)]
pub struct ParaInstrSite {
    pub instr_va: u64,
    pub instrtype: u16,
    pub clobbers: u8,
    pub len: u8,
}

/// Well-known paravirt site types with canonical native-instruction blobs,
/// keyed the way the kernel names them (`pv_irq_ops.save_fl`, etc).
fn canonical_native_blob(instrtype: u16) -> Option<&'static [u8]> {
    match instrtype {
        // pv_irq_ops.save_fl: pushfq; pop %rax
        0x0001 => Some(&[0x9c, 0x58]),
        // pv_irq_ops.restore_fl: push %rdi; popfq
        0x0002 => Some(&[0x57, 0x9d]),
        // pv_irq_ops.irq_disable: cli
        0x0003 => Some(&[0xfa]),
        // pv_irq_ops.irq_enable: sti
        0x0004 => Some(&[0xfb]),
        // pv_cpu_ops.iret: iretq
        0x0010 => Some(&[0x48, 0xcf]),
        // pv_cpu_ops.swapgs
        0x0011 => Some(&[0x0f, 0x01, 0xf8]),
        // pv_cpu_ops.clts
        0x0012 => Some(&[0x0f, 0x06]),
        // pv_cpu_ops.wbinvd
        0x0013 => Some(&[0x0f, 0x09]),
        // pv_mmu_ops.read_cr2: mov %cr2, %rax
        0x0020 => Some(&[0x0f, 0x20, 0xd0]),
        // pv_mmu_ops.read_cr3: mov %cr3, %rax
        0x0021 => Some(&[0x0f, 0x20, 0xd8]),
        // pv_cpu_ops.irq_enable_sysexit: sti; sysexit
        0x0014 => Some(&[0xfb, 0x0f, 0x34]),
        // pv_cpu_ops.usergs_sysret32: swapgs; sysretl
        0x0015 => Some(&[0x0f, 0x01, 0xf8, 0x0f, 0x07]),
        // pv_cpu_ops.usergs_sysret64: swapgs; sysretq
        0x0016 => Some(&[0x0f, 0x01, 0xf8, 0x48, 0x0f, 0x07]),
        // pv_mmu_ops.write_cr3: mov %rdi, %cr3
        0x0022 => Some(&[0x0f, 0x22, 0xdf]),
        // pv_mmu_ops.flush_tlb_single: invlpg (%rdi)
        0x0023 => Some(&[0x0f, 0x01, 0x3f]),
        _ => None,
    }
}

fn is_iret_family(instrtype: u16) -> bool {
    instrtype == 0x0010
}

/// Pass B — Paravirt patching. `ops` is the captured `ParavirtState`
/// snapshot; `is_paravirt_nop`/`is_paravirt_ident_32`/`is_paravirt_ident_64`
/// compare a resolved function pointer against the snapshot's well-known
/// addresses.
pub fn apply_paravirt(
    image: &ExpectedImage,
    sites: &[ParaInstrSite],
    ops: &ParavirtState,
) -> ExpectedImage {
    let mut out = image.clone();
    for site in sites {
        let Some(dst) = out.offset(site.instr_va) else { continue };
        let len = site.len as usize;
        if let Some(blob) = canonical_native_blob(site.instrtype) {
            let n = blob.len().min(len);
            out.text[dst..dst + n].copy_from_slice(&blob[..n]);
            if n < len {
                add_nops(&mut out.text[dst + n..dst + len], len - n);
            }
            out.paravirt_sites.insert(site.instr_va);
            continue;
        }
        let opfunc = ops.resolve_ops_template_offset((site.instrtype as u64) * 8);
        match opfunc {
            None => add_nops(&mut out.text[dst..dst + len], len),
            Some(addr) if addr == 0 || Some(addr) == ops.paravirt_nop => {
                add_nops(&mut out.text[dst..dst + len], len)
            }
            Some(addr) if Some(addr) == ops.paravirt_ident_32 || Some(addr) == ops.paravirt_ident_64 => {
                // canonical identity mov %edi,%eax / mov %rdi,%rax
                let blob: &[u8] = if Some(addr) == ops.paravirt_ident_32 {
                    &[0x89, 0xf8]
                } else {
                    &[0x48, 0x89, 0xf8]
                };
                let n = blob.len().min(len);
                out.text[dst..dst + n].copy_from_slice(&blob[..n]);
                if n < len {
                    add_nops(&mut out.text[dst + n..dst + len], len - n);
                }
            }
            Some(addr) if is_iret_family(site.instrtype) => {
                emit_rel_jmp_or_call(&mut out.text, dst, site.instr_va, addr, 0xe9);
                if len > 5 {
                    add_nops(&mut out.text[dst + 5..dst + len], len - 5);
                }
                out.paravirt_sites.insert(site.instr_va);
            }
            Some(addr) => {
                let _ = site.clobbers; // clobber-mask coverage is an external-policy concern; this engine always emits.
                emit_rel_jmp_or_call(&mut out.text, dst, site.instr_va, addr, 0xe8);
                if len > 5 {
                    add_nops(&mut out.text[dst + 5..dst + len], len - 5);
                }
                out.paravirt_sites.insert(site.instr_va);
            }
        }
    }
    out
}

fn emit_rel_jmp_or_call(text: &mut [u8], dst: usize, instr_va: u64, target: u64, opcode: u8) {
    let rel = target as i64 - (instr_va as i64 + 5);
    text[dst] = opcode;
    text[dst + 1..dst + 5].copy_from_slice(&(rel as i32).to_le_bytes());
}

/// Pass C — SMP-lock fixups. `smp_lock_offsets_text` are text-relative
/// byte offsets of `lock`-prefix bytes (already resolved from the
/// `.smp_locks` self-relative pointer array).
pub fn apply_smp_locks(image: &ExpectedImage, smp_lock_offsets_text: &[u64], up_mode: bool) -> ExpectedImage {
    let mut out = image.clone();
    let byte = if up_mode { 0x3e } else { 0xf0 };
    for &off in smp_lock_offsets_text {
        if let Some(b) = out.text.get_mut(off as usize) {
            *b = byte;
        }
        out.smp_lock_offsets.insert(off);
    }
    out
}

/// Pass D — Mcount. `mcount_sites` are virtual addresses from
/// `__start_mcount_loc .. __stop_mcount_loc`.
pub fn apply_mcount(image: &ExpectedImage, mcount_sites: &[u64]) -> ExpectedImage {
    let mut out = image.clone();
    let nop = nop5();
    for &va in mcount_sites {
        if let Some(off) = out.offset(va) {
            if let Some(slice) = out.text.get_mut(off..off + 5) {
                slice.copy_from_slice(&nop);
            }
        }
    }
    out
}

/// One `__jump_table` triple (§4.3 Pass E).
#[derive(Debug, Clone, Copy)]
pub struct JumpEntry {
    pub code: u64,
    pub target: u64,
    pub key: u64,
}

/// Pass E — Jump labels. `key_enabled` reads `key.enabled.counter != 0`
/// from live memory for a given key VA.
pub fn apply_jump_labels(
    image: &ExpectedImage,
    entries: &[JumpEntry],
    key_enabled: impl Fn(u64) -> bool,
) -> ExpectedImage {
    let mut out = image.clone();
    let nop = nop5();
    for entry in entries {
        let Some(off) = out.offset(entry.code) else { continue };
        if key_enabled(entry.key) {
            let rel = entry.target as i64 - (entry.code as i64 + 5);
            out.text[off] = 0xe9;
            out.text[off + 1..off + 5].copy_from_slice(&(rel as i32).to_le_bytes());
        } else if let Some(slice) = out.text.get_mut(off..off + 5) {
            slice.copy_from_slice(&nop);
        }
        out.jump_entries.insert(entry.code, entry.target);
        out.jump_destinations.insert(entry.target);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paravirt::ParavirtState;

    fn base_image(len: usize) -> ExpectedImage {
        ExpectedImage::new(vec![0xccu8; len], 0xffffffff81000000)
    }

    #[test]
    fn alternatives_skipped_when_feature_absent() {
        let image = base_image(16);
        let entries = [AltInstrEntry { orig_offset: 0xffffffff81000000, repl_offset: 0, cpuid: 3, orig_len: 5, repl_len: 5 }];
        let replacement = [0x90u8; 5];
        let out = apply_alternatives(&image, &entries, &replacement, |_| false);
        assert_eq!(out.text, image.text);
    }

    #[test]
    fn alternatives_applied_and_padded_when_feature_present() {
        let image = base_image(16);
        let entries = [AltInstrEntry { orig_offset: 0xffffffff81000000, repl_offset: 0, cpuid: 3, orig_len: 5, repl_len: 2 }];
        let replacement = [0x90, 0x90];
        let out = apply_alternatives(&image, &entries, &replacement, |bit| bit == 3);
        assert_eq!(&out.text[0..2], &[0x90, 0x90]);
        assert_eq!(&out.text[2..5], nops::P6_NOPS[3]);
    }

    #[test]
    fn smp_locks_write_up_byte() {
        let image = base_image(4);
        let out = apply_smp_locks(&image, &[1], true);
        assert_eq!(out.text[1], 0x3e);
        assert!(out.smp_lock_offsets.contains(&1));
    }

    #[test]
    fn smp_locks_write_lock_byte_on_smp() {
        let image = base_image(4);
        let out = apply_smp_locks(&image, &[1], false);
        assert_eq!(out.text[1], 0xf0);
    }

    #[test]
    fn mcount_writes_nop5() {
        let image = base_image(8);
        let out = apply_mcount(&image, &[0xffffffff81000002]);
        assert_eq!(&out.text[2..7], &nop5());
    }

    #[test]
    fn jump_label_disabled_writes_nop5() {
        let image = base_image(8);
        let entries = [JumpEntry { code: 0xffffffff81000000, target: 0xffffffff81000100, key: 0xffffffff82000000 }];
        let out = apply_jump_labels(&image, &entries, |_| false);
        assert_eq!(&out.text[0..5], &nop5());
        assert_eq!(out.jump_entries.get(&0xffffffff81000000), Some(&0xffffffff81000100));
    }

    #[test]
    fn jump_label_enabled_writes_rel32_jmp() {
        let image = base_image(8);
        let entries = [JumpEntry { code: 0xffffffff81000000, target: 0xffffffff81000100, key: 0xffffffff82000000 }];
        let out = apply_jump_labels(&image, &entries, |_| true);
        assert_eq!(out.text[0], 0xe9);
        let rel = i32::from_le_bytes(out.text[1..5].try_into().unwrap());
        assert_eq!(rel, 0x100 - 5);
    }

    #[test]
    fn passes_are_idempotent() {
        let image = base_image(8);
        let entries = [JumpEntry { code: 0xffffffff81000000, target: 0xffffffff81000100, key: 0xffffffff82000000 }];
        let once = apply_jump_labels(&image, &entries, |_| true);
        let twice = apply_jump_labels(&once, &entries, |_| true);
        assert_eq!(once.text, twice.text);
    }

    #[test]
    fn paravirt_canonical_blob_covers_sysret_and_mmu_sites() {
        let ops = ParavirtState::default();
        let image = base_image(8);
        for (instrtype, blob) in [
            (0x0014u16, &[0xfb, 0x0f, 0x34][..]),
            (0x0015, &[0x0f, 0x01, 0xf8, 0x0f, 0x07][..]),
            (0x0016, &[0x0f, 0x01, 0xf8, 0x48, 0x0f, 0x07][..]),
            (0x0022, &[0x0f, 0x22, 0xdf][..]),
            (0x0023, &[0x0f, 0x01, 0x3f][..]),
        ] {
            let sites = [ParaInstrSite { instr_va: 0xffffffff81000000, instrtype, clobbers: 0, len: blob.len() as u8 }];
            let out = apply_paravirt(&image, &sites, &ops);
            assert_eq!(&out.text[0..blob.len()], blob, "instrtype {instrtype:#x}");
            assert!(out.paravirt_sites.contains(&0xffffffff81000000));
        }
    }

    #[test]
    fn paravirt_default_nop_when_opfunc_unresolved() {
        let ops = ParavirtState::default();
        let image = base_image(8);
        let sites = [ParaInstrSite { instr_va: 0xffffffff81000000, instrtype: 0xff, clobbers: 0, len: 5 }];
        // No ops-template bytes captured in this fixture, so the offset
        // resolves to None, which patches to a nop like a genuine
        // paravirt-nop target would.
        let out = apply_paravirt(&image, &sites, &ops);
        assert_eq!(&out.text[0..5], &nop5());
    }
}
