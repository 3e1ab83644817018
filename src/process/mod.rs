//! `ProcessValidator` (§4.7): the user-space analogue of `PageValidator` —
//! reconciles a process's VMA layout against its loaded ELFs and
//! classifies inter-mapping pointers via the `PagePtrInfo` engine.

use crate::external::{TaskManager, VMAInfo};
use crate::loader::{Loader, LoaderOps};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum ProcessFinding {
    OrphanPage { vaddr: u64 },
    CodeMismatch { vma_name: Option<String>, offset: u64 },
    MissingLoader { vma_name: String },
    UnknownPointer { source_offset: u64, value: u64, dest_section: Option<String> },
    EnvironmentMismatch { name: String, expected: String, actual: Option<String> },
}

/// Per `(source VMA, destination executable VMA)` pair, accumulates
/// pointers whose values land inside the destination (§4.7.2).
#[derive(Debug, Clone, Default)]
pub struct PagePtrInfo {
    pub pointers: Vec<(u64, u64)>, // (offset within source VMA, value)
}

impl PagePtrInfo {
    /// Scans `source_bytes` for aligned nonzero 8-byte words landing
    /// strictly inside `dest`, excluding self-VMA hits and the PHDR word
    /// at `dest.start + 0x40`.
    pub fn scan(source_bytes: &[u8], source: &VMAInfo, dest: &VMAInfo) -> PagePtrInfo {
        let mut info = PagePtrInfo::default();
        if source.start == dest.start {
            return info;
        }
        let phdr = dest.start.wrapping_add(0x40);
        let mut i = 0usize;
        while i + 8 <= source_bytes.len() {
            let value = u64::from_le_bytes(source_bytes[i..i + 8].try_into().unwrap());
            if value != 0 && value > dest.start && value < dest.end && value != phdr {
                info.pointers.push((i as u64, value));
            }
            i += 8;
        }
        info
    }
}

/// Classification outcome for one destination pointer (§4.7.2, 8 steps).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerClass {
    MatchesSymbol,
    PlainMappedFile,
    SectionStart,
    DynstrString,
    DynsymSymbol,
    WellKnownSection(String),
    EntryPoint,
    ReturnAddress,
    Unknown,
}

const BENIGN_SECTIONS: &[&str] = &[
    ".gnu.hash",
    ".gnu.version",
    ".data.rel.ro",
    ".dynsym",
    ".dynstr",
    ".got.plt",
    ".rodata",
    "__libc_IO_vtables",
];

/// Classifies one destination pointer per the 8-step priority list.
pub fn classify_pointer(
    value: u64,
    dest_loader: Option<&Loader>,
    dest_has_filename: bool,
    section_of: impl Fn(u64) -> Option<(String, u64)>, // (name, start)
    is_return_address_at: impl Fn(u64) -> bool,
) -> PointerClass {
    if let Some(loader) = dest_loader {
        if loader.exported_symbols().iter().any(|s| s.value == value) {
            return PointerClass::MatchesSymbol;
        }
    } else if dest_has_filename {
        return PointerClass::PlainMappedFile;
    }
    if let Some((name, start)) = section_of(value) {
        if start == value {
            return PointerClass::SectionStart;
        }
        if name == ".dynstr" {
            return PointerClass::DynstrString;
        }
        if name == ".dynsym" {
            return PointerClass::DynsymSymbol;
        }
        if BENIGN_SECTIONS.contains(&name.as_str()) {
            return PointerClass::WellKnownSection(name);
        }
        if name == ".text" {
            if let Some(loader) = dest_loader {
                if loader
                    .memindex_of_section(".text")
                    .map(|entry| entry == value)
                    .unwrap_or(false)
                {
                    return PointerClass::EntryPoint;
                }
            }
            if is_return_address_at(value) {
                return PointerClass::ReturnAddress;
            }
        }
    }
    PointerClass::Unknown
}

/// Enumerates live pages for `pid`, checks every one lands in a VMA
/// (orphan check, §4.7 step 1), then dispatches per-VMA validation
/// (§4.7.1/4.7.2).
pub fn validate_process(
    pid: u32,
    live_page_vaddrs: &[u64],
    task_manager: &dyn TaskManager,
) -> Vec<ProcessFinding> {
    let mut findings = Vec::new();
    let vmas = task_manager.mapped_vmas(pid);
    for &vaddr in live_page_vaddrs {
        if !vmas.iter().any(|v| v.contains(vaddr)) {
            findings.push(ProcessFinding::OrphanPage { vaddr });
        }
    }
    findings
}

/// §4.7.3: reports every mismatch between `expected` and the process's
/// actual environment.
pub fn check_environment(
    pid: u32,
    expected: &HashMap<String, String>,
    task_manager: &dyn TaskManager,
) -> Vec<ProcessFinding> {
    let actual = task_manager.env_for_task(pid);
    let mut findings = Vec::new();
    for (name, expected_value) in expected {
        match actual.get(name) {
            Some(actual_value) if actual_value == expected_value => {}
            Some(actual_value) => findings.push(ProcessFinding::EnvironmentMismatch {
                name: name.clone(),
                expected: expected_value.clone(),
                actual: Some(actual_value.clone()),
            }),
            None => findings.push(ProcessFinding::EnvironmentMismatch {
                name: name.clone(),
                expected: expected_value.clone(),
                actual: None,
            }),
        }
    }
    findings
}

/// Picks the loader for a code VMA: executable if the VMA name is a
/// suffix of the process name, else looked up among library loaders by
/// filename (§4.7.1).
pub fn pick_loader<'a>(
    vma_name: &str,
    process_name: &str,
    executable: &'a Loader,
    libraries: &'a HashMap<String, Loader>,
) -> Option<&'a Loader> {
    if process_name.ends_with(vma_name) {
        Some(executable)
    } else {
        libraries.get(vma_name)
    }
}

/// Walks a code VMA in page-size chunks, comparing the guest's live bytes
/// against the loader's text image starting at `checked` (§4.7.1). The
/// first mismatched chunk is fatal for this VMA; an unmapped sub-range
/// (an all-empty `read_page` result) just advances past it.
pub fn validate_vma_code(
    vma: &VMAInfo,
    loader: &Loader,
    read_page: impl Fn(u64, usize) -> Vec<u8>,
) -> Option<ProcessFinding> {
    const CHUNK: u64 = 4096;
    let image = loader.text();
    let mut checked = vma.start;
    while checked < vma.end {
        let len = CHUNK.min(vma.end - checked) as usize;
        let actual = read_page(checked, len);
        if actual.is_empty() {
            checked += CHUNK;
            continue;
        }
        let Some(offset) = checked.checked_sub(vma.start) else { break };
        let start = offset as usize;
        if start >= image.text.len() {
            break;
        }
        let end = (start + len).min(image.text.len());
        let expected = &image.text[start..end];
        if expected != &actual[..expected.len()] {
            return Some(ProcessFinding::CodeMismatch { vma_name: vma.filename.clone(), offset });
        }
        checked += CHUNK;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{TaskManager, VMAInfo};

    struct FakeTaskManager {
        vmas: Vec<VMAInfo>,
        env: HashMap<String, String>,
    }

    impl TaskManager for FakeTaskManager {
        fn env_for_task(&self, _pid: u32) -> HashMap<String, String> {
            self.env.clone()
        }
        fn mapped_vmas(&self, _pid: u32) -> Vec<VMAInfo> {
            self.vmas.clone()
        }
    }

    #[test]
    fn orphan_page_with_no_covering_vma_is_reported() {
        let tm = FakeTaskManager { vmas: vec![VMAInfo { start: 0x1000, end: 0x2000, ..Default::default() }], env: HashMap::new() };
        let findings = validate_process(1, &[0x500], &tm);
        assert!(matches!(findings[0], ProcessFinding::OrphanPage { vaddr: 0x500 }));
    }

    #[test]
    fn page_within_vma_is_not_orphan() {
        let tm = FakeTaskManager { vmas: vec![VMAInfo { start: 0x1000, end: 0x2000, ..Default::default() }], env: HashMap::new() };
        let findings = validate_process(1, &[0x1500], &tm);
        assert!(findings.is_empty());
    }

    #[test]
    fn environment_mismatch_is_reported() {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/root".to_string());
        let tm = FakeTaskManager { vmas: vec![], env };
        let mut expected = HashMap::new();
        expected.insert("HOME".to_string(), "/home/user".to_string());
        let findings = check_environment(1, &expected, &tm);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn page_ptr_info_excludes_phdr_and_self_vma() {
        let dest = VMAInfo { start: 0x2000, end: 0x3000, ..Default::default() };
        let source = VMAInfo { start: 0x1000, end: 0x2000, ..Default::default() };
        let mut bytes = vec![0u8; 16];
        bytes[0..8].copy_from_slice(&(dest.start + 0x40).to_le_bytes());
        bytes[8..16].copy_from_slice(&(dest.start + 0x100).to_le_bytes());
        let info = PagePtrInfo::scan(&bytes, &source, &dest);
        assert_eq!(info.pointers, vec![(8, dest.start + 0x100)]);
    }

    #[test]
    fn page_ptr_info_skips_self_vma() {
        let vma = VMAInfo { start: 0x1000, end: 0x2000, ..Default::default() };
        let mut bytes = vec![0u8; 8];
        bytes.copy_from_slice(&(vma.start + 0x100).to_le_bytes());
        let info = PagePtrInfo::scan(&bytes, &vma, &vma);
        assert!(info.pointers.is_empty());
    }

    #[test]
    fn classify_well_known_section_is_benign() {
        let class = classify_pointer(0x3000, None, false, |_| Some((".rodata".to_string(), 0x2000)), |_| false);
        assert_eq!(class, PointerClass::WellKnownSection(".rodata".to_string()));
    }

    #[test]
    fn classify_falls_through_to_unknown() {
        let class = classify_pointer(0x3000, None, false, |_| None, |_| false);
        assert_eq!(class, PointerClass::Unknown);
    }

    #[test]
    fn validate_vma_code_reports_first_mismatch() {
        use crate::loader::{KernelLoader, SectionMemMap};
        use crate::patch::ExpectedImage;

        let text = vec![0xccu8; 4096];
        let loader = Loader::Kernel(KernelLoader {
            name: "libfoo.so".into(),
            mem_map: SectionMemMap::default(),
            image: ExpectedImage::new(text, 0),
            exported: vec![],
            ex_table_range: (0, 0),
        });
        let vma = VMAInfo { start: 0x1000, end: 0x2000, filename: Some("libfoo.so".into()), ..Default::default() };
        let mut live = vec![0xccu8; 4096];
        live[10] = 0x90;
        let finding = validate_vma_code(&vma, &loader, |_addr, len| live[..len].to_vec());
        assert!(matches!(finding, Some(ProcessFinding::CodeMismatch { offset: 10, .. })));
    }

    #[test]
    fn validate_vma_code_skips_unmapped_subrange() {
        use crate::loader::{KernelLoader, SectionMemMap};
        use crate::patch::ExpectedImage;

        let text = vec![0xccu8; 4096];
        let loader = Loader::Kernel(KernelLoader {
            name: "libfoo.so".into(),
            mem_map: SectionMemMap::default(),
            image: ExpectedImage::new(text, 0),
            exported: vec![],
            ex_table_range: (0, 0),
        });
        let vma = VMAInfo { start: 0x1000, end: 0x2000, filename: Some("libfoo.so".into()), ..Default::default() };
        let finding = validate_vma_code(&vma, &loader, |_addr, _len| Vec::new());
        assert!(finding.is_none());
    }
}
