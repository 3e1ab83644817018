//! `PageValidator` (§4.6): drives validation by enumerating live pages,
//! dispatching to the code/data/stack validators, and collecting findings.

pub mod code;
pub mod data;
pub mod pointer_walk;
pub mod stack;

use crate::external::HypervisorBackend;
use crate::loader::{Loader, LoaderOps};
use crate::oracle::SymbolOracle;
use crate::quirks::Quirks;
use crate::targets::CallTargets;
use code::{validate_code_page, CodeMismatch, CodeWhitelist};
use data::{classify_idt_slot, idt_handler_pointer, idt_padding_is_zero, validate_rodata_page, IdtSlotVerdict};
use pointer_walk::{walk_pointers, LoaderWhitelist, PointerVerdict};
use stack::validate_stack_page;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const PAGE_SIZE: u64 = 4096;

/// The single process-wide cancellation flag installed by the `SIGINT`/
/// `SIGTERM` handler (§5, §9): replaces the original's singleton-plus-
/// direct-option-mutation pattern with one atomic, checked between
/// loop-mode iterations.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> StopFlag {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One mismatch or suspicious finding collected during a validation pass.
#[derive(Debug, Clone)]
pub enum Finding {
    CodeMismatch { loader: String, page_vaddr: u64, mismatch: CodeMismatch },
    DataMismatch { loader: String, page_vaddr: u64, offset: u64 },
    SuspiciousPointer { loader: String, page_vaddr: u64, offset: u64, value: u64 },
    UnresolvedReturn { page_vaddr: u64, offset: u64, value: u64 },
    OrphanPage { vaddr: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

/// Drives one or more validation passes over a set of loaders.
pub struct PageValidator<'a> {
    pub oracle: &'a SymbolOracle,
    pub loaders: &'a HashMap<String, Loader>,
    pub quirks: &'a Quirks,
    pub call_targets: &'a CallTargets,
    pub stop_flag: StopFlag,
    pub validate_code: bool,
    pub validate_data: bool,
}

impl<'a> PageValidator<'a> {
    /// Runs validation passes in loop mode until `stop_flag` is set,
    /// returning the findings of every completed iteration. A non-loop
    /// caller passes a `StopFlag` pre-armed after the first iteration.
    pub fn run_loop(&self, hv: &dyn HypervisorBackend, loop_mode: bool) -> Vec<ValidationReport> {
        let mut reports = Vec::new();
        loop {
            reports.push(self.run_once(hv));
            if !loop_mode || self.stop_flag.is_stopped() {
                break;
            }
        }
        reports
    }

    /// One full pass over every page the hypervisor reports. Per §5's
    /// ordering rule, every live kernel stack is validated first (so the
    /// pointer walk below has a stable notion of which stack pages are
    /// whitelisted), then code pages dispatch to the byte-diff validator
    /// (§4.6.1), and non-executable pages dispatch to the IDT/rodata
    /// validator (§4.6.2) when a loader's data range owns them, or to the
    /// pointer walk (§4.6.4) otherwise.
    pub fn run_once(&self, hv: &dyn HypervisorBackend) -> ValidationReport {
        let mut report = ValidationReport::default();
        for (pid, stack_base) in hv.kernel_stacks() {
            self.validate_stack_at(hv, pid, stack_base, &mut report);
        }
        for page in hv.get_kernel_pages() {
            if hv.is_page_executable(&page) {
                if self.validate_code {
                    if let Some(loader) = self.loader_for_code(page.vaddr) {
                        self.validate_code_page_at(hv, loader, page.vaddr, &mut report);
                    }
                }
            } else if self.validate_data {
                self.validate_non_exec_page(hv, page.vaddr, &mut report);
            }
        }
        report
    }

    fn loader_for_code(&self, vaddr: u64) -> Option<&Loader> {
        self.loaders.values().find(|l| l.is_code_address(vaddr))
    }

    fn loader_for_data(&self, vaddr: u64) -> Option<&Loader> {
        self.loaders.values().find(|l| l.is_data_address(vaddr))
    }

    /// Walks `[0, 8192-4)` of a kernel stack (§4.6.3), checking unresolved
    /// candidate returns against the call-targets map before the quirks
    /// file, and reporting anything neither explains.
    fn validate_stack_at(&self, hv: &dyn HypervisorBackend, pid: u32, stack_base: u64, report: &mut ValidationReport) {
        let Some(stack_bytes) = hv.read_vector(stack_base, 8192, pid, true) else { return };
        let is_function_start = |addr: u64| self.oracle.is_function(addr);
        let is_data_symbol = |addr: u64| self.oracle.is_symbol(addr);
        let classify_in_text = |value: u64| -> Option<(String, usize, u64)> {
            self.loaders.values().find(|l| l.is_code_address(value)).map(|l| {
                let base = l.text().text_base;
                (l.name().to_string(), (value - base) as usize, base)
            })
        };
        let findings = validate_stack_page(&stack_bytes, 0, hv, is_function_start, is_data_symbol, classify_in_text);
        for finding in findings {
            if finding.resolved {
                continue;
            }
            if self.call_targets.destination_of(finding.value.wrapping_sub(5)).is_some() {
                continue;
            }
            if self.quirks.matches_stack_exception(finding.offset, finding.value) {
                continue;
            }
            report.findings.push(Finding::UnresolvedReturn {
                page_vaddr: stack_base,
                offset: finding.offset,
                value: finding.value,
            });
        }
    }

    /// Dispatches one non-executable page: the IDT table (a single page,
    /// special-cased per §4.6.2), a loader-owned rodata page, or, failing
    /// both, the pointer walk (§4.6.4).
    fn validate_non_exec_page(&self, hv: &dyn HypervisorBackend, vaddr: u64, report: &mut ValidationReport) {
        if self.is_idt_table_page(vaddr) {
            self.validate_idt_page_at(hv, vaddr, report);
            return;
        }
        if let Some(loader) = self.loader_for_data(vaddr) {
            self.validate_data_page_at(hv, loader, vaddr, report);
            return;
        }
        self.validate_pointer_walk_page(hv, vaddr, report);
    }

    fn is_idt_table_page(&self, vaddr: u64) -> bool {
        [self.oracle.resolve_undef("idt_table"), self.oracle.resolve_undef("nmi_idt_table")]
            .into_iter()
            .flatten()
            .any(|base| base == vaddr)
    }

    fn validate_idt_page_at(&self, hv: &dyn HypervisorBackend, vaddr: u64, report: &mut ValidationReport) {
        let Some(actual) = hv.read_vector(vaddr, PAGE_SIZE as usize, 0, true) else { return };
        let init_text_base = self.oracle.resolve_undef("_sinittext").unwrap_or(0);
        let irq_entries_start = self.oracle.resolve_undef("irq_entries_start").unwrap_or(0);
        for (slot, chunk) in actual.chunks_exact(16).enumerate() {
            let descriptor: [u8; 16] = chunk.try_into().unwrap();
            if !idt_padding_is_zero(&descriptor) {
                report.findings.push(Finding::DataMismatch {
                    loader: "idt_table".to_string(),
                    page_vaddr: vaddr,
                    offset: (slot * 16 + 12) as u64,
                });
                continue;
            }
            let pointer = idt_handler_pointer(&descriptor);
            let verdict = classify_idt_slot(
                slot,
                pointer,
                |addr| self.oracle.is_function(addr),
                init_text_base,
                irq_entries_start,
            );
            if verdict == IdtSlotVerdict::Unclassified {
                report.findings.push(Finding::DataMismatch {
                    loader: "idt_table".to_string(),
                    page_vaddr: vaddr,
                    offset: (slot * 16) as u64,
                });
            }
        }
    }

    fn validate_pointer_walk_page(&self, hv: &dyn HypervisorBackend, vaddr: u64, report: &mut ValidationReport) {
        let Some(actual) = hv.read_vector(vaddr, PAGE_SIZE as usize, 0, true) else { return };
        let whitelist = OracleWhitelist { loaders: self.loaders };
        let is_function_start = |addr: u64| self.oracle.is_function(addr);
        let is_data_symbol = |addr: u64| self.oracle.is_symbol(addr);
        let text_for_value = |addr: u64| -> Option<(Vec<u8>, u64)> {
            self.loaders
                .values()
                .find(|l| l.is_code_address(addr))
                .map(|l| (l.text().text.clone(), l.text().text_base))
        };
        for finding in walk_pointers(&actual, is_function_start, is_data_symbol, &whitelist, text_for_value) {
            if finding.verdict == PointerVerdict::Suspicious {
                report.findings.push(Finding::SuspiciousPointer {
                    loader: "<unowned>".to_string(),
                    page_vaddr: vaddr,
                    offset: finding.offset,
                    value: finding.value,
                });
            }
        }
    }

    fn validate_code_page_at(&self, hv: &dyn HypervisorBackend, loader: &Loader, vaddr: u64, report: &mut ValidationReport) {
        let image = loader.text();
        let offset = match vaddr.checked_sub(image.text_base & 0x0000_ffff_ffff_ffff) {
            Some(o) => o,
            None => return,
        };
        let Some(actual) = hv.read_vector(vaddr, PAGE_SIZE as usize, 0, true) else { return };
        let start = offset as usize;
        let end = (start + PAGE_SIZE as usize).min(image.text.len());
        if start >= image.text.len() {
            return;
        }
        let expected = &image.text[start..end];
        let whitelist = CodeWhitelist {
            jump_entries: &image.jump_entries,
            smp_lock_offsets: &image.smp_lock_offsets,
            generic_unrolled_address: self.oracle.resolve_undef("copy_user_generic_unrolled"),
            initialized_text_len: image.text.len(),
        };
        for mismatch in validate_code_page(expected, &actual, offset, &whitelist) {
            report.findings.push(Finding::CodeMismatch {
                loader: loader.name().to_string(),
                page_vaddr: vaddr,
                mismatch,
            });
        }
    }

    fn validate_data_page_at(&self, hv: &dyn HypervisorBackend, loader: &Loader, vaddr: u64, report: &mut ValidationReport) {
        let image = loader.text();
        let Some(offset) = vaddr.checked_sub(image.ro_data_base) else { return };
        let Some(actual) = hv.read_vector(vaddr, PAGE_SIZE as usize, 0, true) else { return };
        let start = offset as usize;
        if start >= image.ro_data.len() {
            return;
        }
        let end = (start + PAGE_SIZE as usize).min(image.ro_data.len());
        let expected = &image.ro_data[start..end];
        for mismatch_offset in validate_rodata_page(vaddr, expected, &actual, None, offset, self.quirks) {
            report.findings.push(Finding::DataMismatch {
                loader: loader.name().to_string(),
                page_vaddr: vaddr,
                offset: mismatch_offset,
            });
        }
    }
}

/// Adapts the set of loaders to `LoaderWhitelist` for the pointer walk
/// (§4.6.4): SMP-lock offsets and jump entries are stored text-relative/
/// absolute per `ExpectedImage`, so membership is checked against
/// whichever loader's text range owns the candidate value.
struct OracleWhitelist<'a> {
    loaders: &'a HashMap<String, Loader>,
}

impl LoaderWhitelist for OracleWhitelist<'_> {
    fn is_smp_lock_offset(&self, addr: u64) -> bool {
        self.loaders.values().any(|l| {
            let image = l.text();
            addr.checked_sub(image.text_base).is_some_and(|off| image.smp_lock_offsets.contains(&off))
        })
    }

    fn is_jump_entry_source(&self, addr: u64) -> bool {
        self.loaders.values().any(|l| l.text().jump_entries.contains_key(&addr))
    }

    fn is_jump_destination(&self, addr: u64) -> bool {
        self.loaders.values().any(|l| l.text().jump_destinations.contains(&addr))
    }

    fn is_above_ex_table(&self, addr: u64) -> bool {
        self.loaders.values().any(|l| match l {
            Loader::Kernel(k) => k.ex_table_range.0 != 0 && addr >= k.ex_table_range.0,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::FileBackend;
    use crate::loader::{KernelLoader, SectionMemMap};
    use crate::patch::ExpectedImage;
    use crate::targets::CallTargets;

    fn sample_loader(base: u64, bytes: Vec<u8>) -> Loader {
        Loader::Kernel(KernelLoader {
            name: "vmlinux".into(),
            mem_map: SectionMemMap::default(),
            image: ExpectedImage::new(bytes, base),
            exported: vec![],
            ex_table_range: (0, 0),
        })
    }

    #[test]
    fn clean_page_reports_nothing() {
        let bytes = vec![0xccu8; PAGE_SIZE as usize];
        let loader = sample_loader(0x1000, bytes.clone());
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: true,
            validate_data: false,
        };
        let hv = FileBackend::new().with_region(0x1000, bytes);
        let report = validator.run_once(&hv);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn flipped_byte_is_reported() {
        let mut bytes = vec![0xccu8; PAGE_SIZE as usize];
        let loader = sample_loader(0x1000, bytes.clone());
        bytes[10] = 0x90;
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: true,
            validate_data: false,
        };
        let hv = FileBackend::new().with_region(0x1000, bytes);
        let report = validator.run_once(&hv);
        assert_eq!(report.findings.len(), 1);
        match &report.findings[0] {
            Finding::CodeMismatch { mismatch, .. } => assert_eq!(mismatch.offset, 10),
            other => panic!("expected CodeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn data_page_mismatch_is_reported() {
        let text = vec![0xccu8; PAGE_SIZE as usize];
        let mut image = ExpectedImage::new(text, 0x1000);
        image.ro_data = vec![0xAAu8; PAGE_SIZE as usize];
        image.ro_data_base = 0x9000;
        let loader = Loader::Kernel(KernelLoader {
            name: "vmlinux".into(),
            mem_map: SectionMemMap::default(),
            image,
            exported: vec![],
            ex_table_range: (0, 0),
        });
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: true,
        };
        let mut actual = vec![0xAAu8; PAGE_SIZE as usize];
        actual[20] = 0x00;
        let hv = FileBackend::new().with_data_region(0x9000, actual);
        let report = validator.run_once(&hv);
        assert_eq!(report.findings.len(), 1);
        match &report.findings[0] {
            Finding::DataMismatch { offset, .. } => assert_eq!(*offset, 20),
            other => panic!("expected DataMismatch, got {other:?}"),
        }
    }

    fn stack_setup(base: u64) -> (Loader, u64) {
        let loader = sample_loader(base, vec![0xccu8; 8]);
        (loader, base + 5)
    }

    #[test]
    fn unresolved_stack_return_is_reported() {
        let base = 0xffffffff81000000u64;
        let (loader, value) = stack_setup(base);
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: false,
        };
        let mut stack = vec![0u8; 8192];
        stack[8..16].copy_from_slice(&value.to_le_bytes());
        let hv = FileBackend::new().with_stack(7, 0x2000).with_region(0x2000, stack);
        let mut report = ValidationReport::default();
        validator.validate_stack_at(&hv, 7, 0x2000, &mut report);
        assert_eq!(report.findings.len(), 1);
        match &report.findings[0] {
            Finding::UnresolvedReturn { offset, value: v, .. } => {
                assert_eq!(*offset, 8);
                assert_eq!(*v, value);
            }
            other => panic!("expected UnresolvedReturn, got {other:?}"),
        }
    }

    #[test]
    fn call_targets_suppress_unresolved_stack_return() {
        let base = 0xffffffff81000000u64;
        let (loader, value) = stack_setup(base);
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let mut targets = CallTargets::default();
        targets.insert(value.wrapping_sub(5), 0xffffffff81000999);
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: false,
        };
        let mut stack = vec![0u8; 8192];
        stack[8..16].copy_from_slice(&value.to_le_bytes());
        let hv = FileBackend::new().with_stack(7, 0x2000).with_region(0x2000, stack);
        let mut report = ValidationReport::default();
        validator.validate_stack_at(&hv, 7, 0x2000, &mut report);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn quirks_suppress_unresolved_stack_return() {
        let base = 0xffffffff81000000u64;
        let (loader, value) = stack_setup(base);
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let mut quirks = Quirks::default();
        quirks.stack_exceptions.push(crate::quirks::StackException { offset: 8, pointer: value });
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: false,
        };
        let mut stack = vec![0u8; 8192];
        stack[8..16].copy_from_slice(&value.to_le_bytes());
        let hv = FileBackend::new().with_stack(7, 0x2000).with_region(0x2000, stack);
        let mut report = ValidationReport::default();
        validator.validate_stack_at(&hv, 7, 0x2000, &mut report);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn run_once_validates_registered_kernel_stacks() {
        let base = 0xffffffff81000000u64;
        let (loader, value) = stack_setup(base);
        let mut loaders = HashMap::new();
        loaders.insert("vmlinux".to_string(), loader);
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: false,
        };
        let mut stack = vec![0u8; 8192];
        stack[8..16].copy_from_slice(&value.to_le_bytes());
        let hv = FileBackend::new().with_stack(7, 0x2000).with_region(0x2000, stack);
        let report = validator.run_once(&hv);
        assert_eq!(report.findings.len(), 1);
        assert!(matches!(report.findings[0], Finding::UnresolvedReturn { .. }));
    }

    #[test]
    fn idt_page_reports_padding_and_unclassified_mismatches() {
        let mut oracle = SymbolOracle::new();
        oracle.add_module_symbol("idt_table", 0x9000);
        oracle.add_function_symbol("some_handler", 0x1000);
        let mut actual = vec![0u8; PAGE_SIZE as usize];
        for slot in 0..256usize {
            let off = slot * 16;
            actual[off..off + 2].copy_from_slice(&0x1000u16.to_le_bytes());
        }
        actual[5 * 16..5 * 16 + 2].copy_from_slice(&0xbeefu16.to_le_bytes());
        actual[5 * 16 + 6..5 * 16 + 8].copy_from_slice(&0xdeadu16.to_le_bytes());
        actual[10 * 16 + 12] = 1;

        let loaders: HashMap<String, Loader> = HashMap::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: true,
        };
        let hv = FileBackend::new().with_data_region(0x9000, actual);
        assert!(validator.is_idt_table_page(0x9000));
        let report = validator.run_once(&hv);
        let offsets: Vec<u64> = report
            .findings
            .iter()
            .map(|f| match f {
                Finding::DataMismatch { offset, .. } => *offset,
                other => panic!("expected DataMismatch, got {other:?}"),
            })
            .collect();
        assert!(offsets.contains(&(5 * 16) as u64));
        assert!(offsets.contains(&(10 * 16 + 12) as u64));
    }

    #[test]
    fn pointer_walk_runs_against_unowned_data_pages() {
        let loaders: HashMap<String, Loader> = HashMap::new();
        let oracle = SymbolOracle::new();
        let quirks = Quirks::default();
        let targets = CallTargets::default();
        let validator = PageValidator {
            oracle: &oracle,
            loaders: &loaders,
            quirks: &quirks,
            call_targets: &targets,
            stop_flag: StopFlag::new(),
            validate_code: false,
            validate_data: true,
        };
        let mut page = vec![0u8; PAGE_SIZE as usize];
        page[0..8].copy_from_slice(&0xffffffff81234567u64.to_le_bytes());
        let hv = FileBackend::new().with_data_region(0x9000, page);
        let report = validator.run_once(&hv);
        assert_eq!(report.findings.len(), 1);
        match &report.findings[0] {
            Finding::SuspiciousPointer { value, .. } => assert_eq!(*value, 0xffffffff81234567),
            other => panic!("expected SuspiciousPointer, got {other:?}"),
        }
    }

    #[test]
    fn stop_flag_halts_loop_mode() {
        let flag = StopFlag::new();
        flag.request_stop();
        assert!(flag.is_stopped());
    }
}
