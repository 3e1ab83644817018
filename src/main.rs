use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use kintegrity::cli::Cli;
use kintegrity::elf::reloc::{apply_relocation, decode_rela, RelaEntry};
use kintegrity::elf::{classify_shndx, ElfFile, SectionIndex, SectionInfo};
use kintegrity::error::IntegrityError;
use kintegrity::external::{
    FileBackend, HypervisorBackend, HypervisorSelection, KvmBackend, NullDwarfOracle, VMAInfo, XenBackend,
};
use kintegrity::loader::{
    module_basename_variants, parse_modinfo_depends, KernelLoader, Loader, ModuleLoader, ModuleRegistry,
    SectionMemMap, UserspaceLoader,
};
use kintegrity::logging::{self, Severity};
use kintegrity::oracle::SymbolOracle;
use kintegrity::paravirt::ParavirtState;
use kintegrity::patch::sections::{
    decode_alt_instr_entries, decode_jump_entries, decode_mcount_sites, decode_para_instr_sites,
    decode_smp_lock_offsets,
};
use kintegrity::patch::{
    apply_alternatives, apply_jump_labels, apply_mcount, apply_paravirt, apply_smp_locks, ExpectedImage,
};
use kintegrity::process::{self, ProcessFinding};
use kintegrity::quirks::Quirks;
use kintegrity::systemmap::parse_system_map;
use kintegrity::targets::CallTargets;
use kintegrity::validator::{Finding, PageValidator, StopFlag};
use log::{debug, error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn main() {
    logging::init_logging();
    if let Err(err) = run() {
        for cause in err.chain() {
            error!("{} {}", style("error:").bold().red(), style(cause).red());
        }
        std::process::exit(1);
    }
}

fn build_backend(selection: &HypervisorSelection) -> Result<Box<dyn HypervisorBackend>> {
    match selection {
        HypervisorSelection::File { snapshot_path } => {
            let bytes = std::fs::read(snapshot_path)
                .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;
            // The captured-image format is the hypervisor's concern (out of
            // scope per the external-interfaces boundary); this build reads
            // a single flat region starting at the conventional x86-64
            // kernel text base.
            let backend = FileBackend::new().with_region(0xffffffff81000000, bytes);
            Ok(Box::new(backend))
        }
        HypervisorSelection::Kvm { .. } => Ok(Box::new(KvmBackend)),
        HypervisorSelection::Xen { .. } => Ok(Box::new(XenBackend)),
    }
}

/// Resolves and applies every relocation in `rela_name` onto `target`, a
/// copy of `section`'s bytes being patched. `SHN_UNDEF` symbols go through
/// the oracle chain (§4.2); everything else already carries its own
/// absolute value. `RelaEntry.r_offset` is section-relative (the
/// convention `apply_relocation`/`ExpectedImage::offset` share), so a raw
/// `Elf64_Rela`'s absolute `r_offset` is converted by subtracting the
/// section's own virtual address before the entry is built.
fn apply_relocations_for_section(
    elf: &ElfFile,
    oracle: &SymbolOracle,
    rela_name: &str,
    section: &SectionInfo,
    target: &mut [u8],
    is_altinstructions: bool,
) -> Result<()> {
    let Some(rela_info) = elf.find_section_with_name(rela_name)? else {
        return Ok(());
    };
    let rela_bytes = elf.section_bytes(&rela_info)?;
    for raw in decode_rela(rela_bytes) {
        let sym = elf.symbol_at(raw.r_sym as usize)?;
        let symbol_value = match classify_shndx(sym.shndx) {
            SectionIndex::Undef => oracle.resolve_undef(&sym.name).ok_or_else(|| IntegrityError::UnresolvedSymbol {
                name: sym.name.clone(),
                section: rela_name.to_string(),
            })?,
            SectionIndex::Common => return Err(IntegrityError::CommonSymbol { name: sym.name.clone() }.into()),
            _ => sym.value,
        };
        let Some(local_off) = raw.r_offset.checked_sub(section.addr) else {
            continue;
        };
        let entry = RelaEntry {
            r_offset: local_off,
            r_type: raw.r_type,
            addend: raw.r_addend,
            symbol_value,
            symbol_name_for_errors: "relocation",
        };
        apply_relocation(target, &entry, is_altinstructions, section.file_offset)?;
    }
    Ok(())
}

/// CPU-feature gate for Pass A. `boot_cpu_data.x86_capability` bits come
/// from live guest memory behind a DWARF layout this build doesn't have
/// (§6), so every alternative site is conservatively left unpatched.
fn no_cpu_features(_cpuid: u16) -> bool {
    false
}

fn load_kernel_loader(kerneldir: &Path, oracle: &mut SymbolOracle, hv: &dyn HypervisorBackend) -> Result<KernelLoader> {
    let vmlinux_path = kerneldir.join("vmlinux");
    let elf = ElfFile::load(&vmlinux_path)
        .with_context(|| format!("loading {}", vmlinux_path.display()))?;
    let text_section = elf
        .find_section_with_name(".text")
        .context("reading section table")?
        .context(".text section missing from vmlinux")?;
    let rodata_section = elf.find_section_with_name(".rodata")?;

    let text_bytes = elf.section_bytes(&text_section)?.to_vec();
    let mut mem_map = SectionMemMap::default();
    mem_map.set(".text", text_section.addr);
    let mut image = ExpectedImage::new(text_bytes, text_section.addr);
    if let Some(rodata) = &rodata_section {
        image.ro_data = elf.section_bytes(rodata)?.to_vec();
        image.ro_data_base = rodata.addr;
        mem_map.set(".rodata", rodata.addr);
    }

    let exported = elf.exported_symbols()?;
    for sym in &exported {
        if sym.info & 0xf == 2 {
            oracle.add_function_symbol(&sym.name, sym.value);
        } else {
            oracle.add_module_symbol(&sym.name, sym.value);
        }
    }
    oracle.add_text_range("vmlinux", text_section.addr, text_section.addr + text_section.size);

    apply_relocations_for_section(&elf, oracle, ".rela.text", &text_section, &mut image.text, false)?;
    if let Some(rodata) = &rodata_section {
        apply_relocations_for_section(&elf, oracle, ".rela.rodata", rodata, &mut image.ro_data, false)?;
    }

    // Pass A: Alternatives. Relocations against `.altinstr_replacement`
    // resolve to their own ELF-side location, since the replacement bytes
    // haven't been copied into their final text position yet.
    if let Some(alt_section) = elf.find_section_with_name(".altinstructions")? {
        if let Some(repl_section) = elf.find_section_with_name(".altinstr_replacement")? {
            let mut replacement_bytes = elf.section_bytes(&repl_section)?.to_vec();
            apply_relocations_for_section(
                &elf,
                oracle,
                ".rela.altinstr_replacement",
                &repl_section,
                &mut replacement_bytes,
                true,
            )?;
            let entries =
                decode_alt_instr_entries(elf.section_bytes(&alt_section)?, alt_section.addr, repl_section.addr);
            image = apply_alternatives(&image, &entries, &replacement_bytes, no_cpu_features);
        }
    }

    // Pass B: Paravirt.
    if let Some(para_section) = elf.find_section_with_name(".parainstructions")? {
        let sites = decode_para_instr_sites(elf.section_bytes(&para_section)?);
        let ops = ParavirtState::capture(&NullDwarfOracle);
        image = apply_paravirt(&image, &sites, &ops);
    }

    // Pass C: SMP locks. Assumes an SMP kernel, the overwhelmingly common
    // case, rather than guessing uniprocessor from a symbol heuristic.
    if let Some(smp_section) = elf.find_section_with_name(".smp_locks")? {
        let offsets = decode_smp_lock_offsets(elf.section_bytes(&smp_section)?, smp_section.addr, text_section.addr);
        image = apply_smp_locks(&image, &offsets, false);
    }

    // Pass D: Mcount.
    if let (Some(start), Some(stop)) =
        (oracle.resolve_undef("__start_mcount_loc"), oracle.resolve_undef("__stop_mcount_loc"))
    {
        if let Ok(bytes) = elf.bytes_for_va_range(start, stop) {
            let sites = decode_mcount_sites(&bytes);
            image = apply_mcount(&image, &sites);
        }
    }

    // Pass E: Jump labels. `key_enabled` reads the live
    // `key.enabled.counter` through the hypervisor backend, so the
    // snapshot reflects the guest's actual feature state at load time.
    if let Some(jump_section) = elf.find_section_with_name("__jump_table")? {
        let entries = decode_jump_entries(elf.section_bytes(&jump_section)?);
        image = apply_jump_labels(&image, &entries, |key| hv.read_u64(key).map(|v| v != 0).unwrap_or(false));
    }

    Ok(KernelLoader { name: "vmlinux".to_string(), mem_map, image, exported, ex_table_range: (0, 0) })
}

fn build_oracle(kerneldir: &Path) -> Result<SymbolOracle> {
    let mut oracle = SymbolOracle::new();
    let system_map_path = kerneldir.join("System.map");
    if system_map_path.exists() {
        let entries = parse_system_map(&system_map_path)?;
        oracle.load_system_map(&entries);
    } else {
        debug!("no System.map found under {}", kerneldir.display());
    }
    Ok(oracle)
}

/// Recursively collects every `.ko` file under `dir`, the on-disk
/// counterpart of the kernel's loaded-module list.
fn find_ko_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("ko") {
                out.push(path);
            }
        }
    }
    out
}

/// Matches a loaded module's name against the on-disk `.ko` files,
/// tolerating the kernel's `-`/`_` basename transposition (§12.4).
fn find_module_file<'a>(name: &str, ko_files: &'a [PathBuf]) -> Option<&'a PathBuf> {
    let variants = module_basename_variants(name);
    ko_files.iter().find(|p| {
        p.file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem == name || variants.contains(&stem.to_string()))
            .unwrap_or(false)
    })
}

/// Loads, relocates and patches one `.ko` against its live base address.
/// Passes A-C only (§4.4): without a live DWARF connection there's no way
/// to tell a module's own mcount/jump-label sites apart from the kernel's,
/// so this mirrors the original's module-loading scope.
fn load_module_loader(ko_path: &Path, base_addr: u64, oracle: &mut SymbolOracle) -> Result<ModuleLoader> {
    let elf = ElfFile::load(ko_path).with_context(|| format!("loading {}", ko_path.display()))?;
    let text_section = elf
        .find_section_with_name(".text")
        .context("reading section table")?
        .with_context(|| format!(".text section missing from {}", ko_path.display()))?;
    let text_bytes = elf.section_bytes(&text_section)?.to_vec();
    let mut mem_map = SectionMemMap::default();
    mem_map.set(".text", base_addr);
    let mut image = ExpectedImage::new(text_bytes, base_addr);

    apply_relocations_for_section(&elf, oracle, ".rela.text", &text_section, &mut image.text, false)?;

    if let Some(alt_section) = elf.find_section_with_name(".altinstructions")? {
        if let Some(repl_section) = elf.find_section_with_name(".altinstr_replacement")? {
            let mut replacement_bytes = elf.section_bytes(&repl_section)?.to_vec();
            apply_relocations_for_section(
                &elf,
                oracle,
                ".rela.altinstr_replacement",
                &repl_section,
                &mut replacement_bytes,
                true,
            )?;
            let entries =
                decode_alt_instr_entries(elf.section_bytes(&alt_section)?, alt_section.addr, repl_section.addr);
            image = apply_alternatives(&image, &entries, &replacement_bytes, no_cpu_features);
        }
    }
    if let Some(para_section) = elf.find_section_with_name(".parainstructions")? {
        let sites = decode_para_instr_sites(elf.section_bytes(&para_section)?);
        let ops = ParavirtState::capture(&NullDwarfOracle);
        image = apply_paravirt(&image, &sites, &ops);
    }
    if let Some(smp_section) = elf.find_section_with_name(".smp_locks")? {
        let offsets = decode_smp_lock_offsets(elf.section_bytes(&smp_section)?, smp_section.addr, text_section.addr);
        image = apply_smp_locks(&image, &offsets, false);
    }

    let exported = elf.exported_symbols()?;
    for sym in &exported {
        if sym.info & 0xf == 2 {
            oracle.add_function_symbol(&sym.name, sym.value);
        } else {
            oracle.add_module_symbol(&sym.name, sym.value);
        }
    }

    let depends = match elf.find_section_with_name(".modinfo")? {
        Some(modinfo) => parse_modinfo_depends(elf.section_bytes(&modinfo)?),
        None => Vec::new(),
    };
    let name = ko_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| ko_path.display().to_string());

    Ok(ModuleLoader { name, depends, mem_map, image, exported })
}

/// Builds one `UserspaceLoader` per distinct executable mapping's backing
/// file, keyed by filename basename. `text_base` is approximated as the
/// VMA's own start address: without a live DWARF or segment-to-VMA offset
/// resolution, that's the best anchor available for a PIE binary's first
/// executable mapping.
fn build_userspace_loaders(vmas: &[VMAInfo]) -> HashMap<String, Loader> {
    let mut out = HashMap::new();
    for vma in vmas {
        if !vma.executable {
            continue;
        }
        let Some(path) = &vma.filename else { continue };
        let Some(name) = Path::new(path).file_name().and_then(|s| s.to_str()) else { continue };
        if out.contains_key(name) {
            continue;
        }
        let Ok(elf) = ElfFile::load(path) else { continue };
        let Ok(Some(text_section)) = elf.find_section_with_name(".text") else { continue };
        let Ok(text_bytes) = elf.section_bytes(&text_section) else { continue };
        let image = ExpectedImage::new(text_bytes.to_vec(), vma.start);
        let mut mem_map = SectionMemMap::default();
        mem_map.set(".text", vma.start);
        let exported = elf.exported_symbols().unwrap_or_default();
        let needed = elf.dependencies().unwrap_or_default();
        out.insert(
            name.to_string(),
            Loader::Userspace(UserspaceLoader {
                name: name.to_string(),
                needed,
                mem_map,
                image,
                exported,
                entry_point: vma.start,
            }),
        );
    }
    out
}

#[cfg(target_os = "linux")]
fn run_process_validation(
    pid: u32,
    expected_env: &HashMap<String, String>,
    hv: &dyn HypervisorBackend,
    loaders: &HashMap<String, Loader>,
) -> Vec<ProcessFinding> {
    use kintegrity::external::{ProcfsTaskManager, TaskManager};

    let task_manager = ProcfsTaskManager;
    let vmas = task_manager.mapped_vmas(pid);
    let live_pages: Vec<u64> = hv.get_pages(pid).iter().map(|p| p.vaddr).collect();

    let mut findings = process::validate_process(pid, &live_pages, &task_manager);
    findings.extend(process::check_environment(pid, expected_env, &task_manager));

    let exe_name = std::fs::read_link(format!("/proc/{pid}/exe"))
        .ok()
        .and_then(|p| p.file_name().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_default();
    let libraries = build_userspace_loaders(&vmas);
    let executable_loader = libraries.get(&exe_name).cloned();

    for vma in &vmas {
        if !vma.executable {
            continue;
        }
        let Some(vma_path) = &vma.filename else { continue };
        let Some(base_name) = Path::new(vma_path).file_name().and_then(|s| s.to_str()) else { continue };
        let loader = executable_loader
            .as_ref()
            .and_then(|exec_loader| process::pick_loader(base_name, &exe_name, exec_loader, &libraries));
        match loader {
            Some(loader) => {
                if let Some(finding) = process::validate_vma_code(vma, loader, |addr, len| {
                    hv.read_vector(addr, len, pid, true).unwrap_or_default()
                }) {
                    findings.push(finding);
                }
            }
            None => findings.push(ProcessFinding::MissingLoader { vma_name: base_name.to_string() }),
        }
    }

    for source in &vmas {
        let Some(source_bytes) = hv.read_vector(source.start, (source.end - source.start) as usize, pid, true)
        else {
            continue;
        };
        for dest in &vmas {
            if !dest.executable {
                continue;
            }
            let info = process::PagePtrInfo::scan(&source_bytes, source, dest);
            let dest_base_name =
                dest.filename.as_deref().and_then(|p| Path::new(p).file_name()).and_then(|s| s.to_str());
            let dest_loader = dest_base_name
                .and_then(|name| loaders.get(name))
                .or_else(|| dest_base_name.and_then(|name| libraries.get(name)));
            for (offset, value) in info.pointers {
                let class = process::classify_pointer(
                    value,
                    dest_loader,
                    dest.filename.is_some(),
                    |_addr: u64| -> Option<(String, u64)> { None },
                    |_addr: u64| false,
                );
                if class == process::PointerClass::Unknown {
                    findings.push(ProcessFinding::UnknownPointer { source_offset: offset, value, dest_section: None });
                }
            }
        }
    }

    findings
}

fn install_stop_handler(stop_flag: StopFlag) -> Result<()> {
    use nix::sys::signal;

    // Re-armed through a process-wide `Arc`; the handler body only ever
    // touches the atomic, never the loaders or hypervisor backend.
    static HANDLER_FLAG: std::sync::OnceLock<StopFlag> = std::sync::OnceLock::new();
    let _ = HANDLER_FLAG.set(stop_flag);

    extern "C" fn handle_stop(_: i32) {
        if let Some(flag) = HANDLER_FLAG.get() {
            flag.request_stop();
        }
    }

    let action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_stop),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(signal::Signal::SIGINT, &action).context("installing SIGINT handler")?;
        signal::sigaction(signal::Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let selection = cli.hypervisor_selection()?;
    let hv = build_backend(&selection)?;

    let quirks = match &cli.quirks {
        Some(path) => Quirks::load(path)?,
        None => Quirks::default(),
    };
    let call_targets = match &cli.targets {
        Some(path) => CallTargets::load(path)?,
        None => CallTargets::default(),
    };

    let mut oracle = build_oracle(&cli.kerneldir)?;
    let kernel_loader = load_kernel_loader(&cli.kerneldir, &mut oracle, hv.as_ref())?;

    let mut loaders: HashMap<String, Loader> = HashMap::new();
    loaders.insert(kernel_loader.name.clone(), Loader::Kernel(kernel_loader));

    let ko_files = find_ko_files(&cli.kerneldir);
    let module_registry = ModuleRegistry::new();
    for (name, base_addr) in hv.loaded_modules() {
        if module_registry.contains(&name) {
            continue;
        }
        let Some(ko_path) = find_module_file(&name, &ko_files) else {
            debug!("no .ko file found on disk for loaded module '{name}'");
            continue;
        };
        match load_module_loader(ko_path, base_addr, &mut oracle) {
            Ok(module_loader) => module_registry.insert(module_loader),
            Err(err) => debug!("skipping module '{name}': {err}"),
        }
    }
    for (name, module_loader) in module_registry.loaders.into_inner().unwrap() {
        loaders.insert(name, Loader::Module(module_loader));
    }

    let stop_flag = StopFlag::new();
    install_stop_handler(stop_flag.clone())?;

    let validator = PageValidator {
        oracle: &oracle,
        loaders: &loaders,
        quirks: &quirks,
        call_targets: &call_targets,
        stop_flag: stop_flag.clone(),
        validate_code: !cli.no_code,
        validate_data: !cli.no_data,
    };

    let reports = validator.run_loop(hv.as_ref(), cli.loop_mode);
    let mut mismatch_count = 0usize;
    for report in &reports {
        for finding in &report.findings {
            mismatch_count += 1;
            log_finding(finding);
        }
    }
    info!("{} finding(s) across {} pass(es)", mismatch_count, reports.len());

    if let Some(pid) = cli.pid {
        #[cfg(target_os = "linux")]
        {
            let expected_env = cli.expected_env();
            let findings = run_process_validation(pid, &expected_env, hv.as_ref(), &loaders);
            for finding in &findings {
                log_process_finding(finding);
            }
            info!("{} process finding(s) for pid {pid}", findings.len());
        }
        #[cfg(not(target_os = "linux"))]
        {
            error!("process validation (-p) requires a Linux host build");
        }
    }

    Ok(())
}

fn log_finding(finding: &Finding) {
    match finding {
        Finding::CodeMismatch { loader, page_vaddr, mismatch } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Mismatch,
                    &format!("{loader}: code mismatch at {page_vaddr:#x}+{:#x}", mismatch.offset)
                )
            );
            debug!("{}", logging::render_context_dump(&mismatch.expected, &mismatch.actual));
        }
        Finding::DataMismatch { loader, page_vaddr, offset } => {
            error!(
                "{}",
                logging::render_finding(Severity::Mismatch, &format!("{loader}: data mismatch at {page_vaddr:#x}+{offset:#x}"))
            );
        }
        Finding::SuspiciousPointer { loader, page_vaddr, offset, value } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Suspicious,
                    &format!("{loader}: suspicious pointer {value:#x} at {page_vaddr:#x}+{offset:#x}")
                )
            );
        }
        Finding::UnresolvedReturn { page_vaddr, offset, value } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Suspicious,
                    &format!("unresolved return-like value {value:#x} at {page_vaddr:#x}+{offset:#x}")
                )
            );
        }
        Finding::OrphanPage { vaddr } => {
            error!("{}", logging::render_finding(Severity::Suspicious, &format!("orphan page at {vaddr:#x}")));
        }
    }
}

fn log_process_finding(finding: &ProcessFinding) {
    match finding {
        ProcessFinding::OrphanPage { vaddr } => {
            error!("{}", logging::render_finding(Severity::Suspicious, &format!("orphan page at {vaddr:#x}")));
        }
        ProcessFinding::CodeMismatch { vma_name, offset } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Mismatch,
                    &format!("{}: code mismatch at +{offset:#x}", vma_name.as_deref().unwrap_or("<anonymous>"))
                )
            );
        }
        ProcessFinding::MissingLoader { vma_name } => {
            error!("{}", logging::render_finding(Severity::Suspicious, &format!("no loader for mapped file '{vma_name}'")));
        }
        ProcessFinding::UnknownPointer { source_offset, value, dest_section } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Suspicious,
                    &format!(
                        "unclassified pointer {value:#x} at +{source_offset:#x}{}",
                        dest_section.as_deref().map(|s| format!(" (in {s})")).unwrap_or_default()
                    )
                )
            );
        }
        ProcessFinding::EnvironmentMismatch { name, expected, actual } => {
            error!(
                "{}",
                logging::render_finding(
                    Severity::Suspicious,
                    &format!("env {name}: expected '{expected}', got {actual:?}")
                )
            );
        }
    }
}
