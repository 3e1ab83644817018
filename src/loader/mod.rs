//! `Loader` variants (§4.4), replacing the original's
//! `ElfLoader → {Kernel, Module, Userspace} × {32,64}` inheritance tree
//! with a tagged enum plus a shared `LoaderOps` trait, per the §9 design
//! note.

use crate::elf::RelSym;
use crate::patch::ExpectedImage;
use std::collections::HashMap;

/// Capability trait every loader variant implements; callers that don't
/// care which variant they have can go through this instead of matching.
pub trait LoaderOps {
    fn name(&self) -> &str;
    fn memindex_of_section(&self, section: &str) -> Option<u64>;
    fn text(&self) -> &ExpectedImage;
    fn exported_symbols(&self) -> &[RelSym];
    fn is_code_address(&self, addr: u64) -> bool {
        let image = self.text();
        addr >= image.text_base && addr < image.text_base + image.text.len() as u64
    }
    fn is_data_address(&self, addr: u64) -> bool {
        let image = self.text();
        addr >= image.ro_data_base && addr < image.ro_data_base + image.ro_data.len() as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct SectionMemMap {
    by_name: HashMap<String, u64>,
}

impl SectionMemMap {
    pub fn set(&mut self, name: &str, addr: u64) {
        self.by_name.insert(name.to_string(), addr);
    }
    pub fn get(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }
}

/// The kernel proper (`vmlinux`). `memindex = sh_addr` for every section;
/// carries the extra `.notes`/`__ex_table` splicing §4.4 calls out, since
/// the hypervisor view fetches them as part of the executable range.
#[derive(Debug, Clone)]
pub struct KernelLoader {
    pub name: String,
    pub mem_map: SectionMemMap,
    pub image: ExpectedImage,
    pub exported: Vec<RelSym>,
    pub ex_table_range: (u64, u64),
}

impl LoaderOps for KernelLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn memindex_of_section(&self, section: &str) -> Option<u64> {
        self.mem_map.get(section)
    }
    fn text(&self) -> &ExpectedImage {
        &self.image
    }
    fn exported_symbols(&self) -> &[RelSym] {
        &self.exported
    }
}

/// Splices `.notes` and `__ex_table` into a kernel text image at their
/// original byte-relative file offsets, zero-padding any gap between the
/// main text end and each spliced section, matching `ElfKernelLoader::initText`.
pub fn splice_kernel_text(
    mut text: Vec<u8>,
    notes: &[u8],
    notes_file_offset: u64,
    ex_table: &[u8],
    ex_table_file_offset: u64,
) -> Vec<u8> {
    for (bytes, file_offset) in [(notes, notes_file_offset), (ex_table, ex_table_file_offset)] {
        let target = file_offset as usize;
        if target > text.len() {
            text.resize(target, 0);
        }
        if target + bytes.len() > text.len() {
            text.resize(target + bytes.len(), 0);
        }
        text[target..target + bytes.len()].copy_from_slice(bytes);
    }
    text
}

/// A loadable module (`.ko`). `memindex` per section comes from the live
/// `module.sect_attrs` array by name, with two special cases (§4.4):
/// `.bss` sits right after the in-memory `struct module`, and
/// `__ksymtab_gpl` is read from `module.gpl_syms`.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    pub name: String,
    pub depends: Vec<String>,
    pub mem_map: SectionMemMap,
    pub image: ExpectedImage,
    pub exported: Vec<RelSym>,
}

impl LoaderOps for ModuleLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn memindex_of_section(&self, section: &str) -> Option<u64> {
        self.mem_map.get(section)
    }
    fn text(&self) -> &ExpectedImage {
        &self.image
    }
    fn exported_symbols(&self) -> &[RelSym] {
        &self.exported
    }
}

/// Resolves a section's live memory address given the module's base
/// address and the module struct's size, applying §4.4's `.bss`/
/// `__ksymtab_gpl` special cases before falling back to the generic
/// `sect_attrs` lookup `generic_lookup`.
pub fn find_mem_address_of_section(
    section: &str,
    module_addr: u64,
    module_struct_size: u64,
    gpl_syms_addr: Option<u64>,
    generic_lookup: impl Fn(&str) -> Option<u64>,
) -> Option<u64> {
    match section {
        ".bss" => Some(module_addr + module_struct_size),
        "__ksymtab_gpl" => gpl_syms_addr,
        other => generic_lookup(other),
    }
}

/// Parses a `.modinfo` section's `depends=a,b,c` entries.
pub fn parse_modinfo_depends(modinfo: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(modinfo);
    for field in text.split('\0') {
        if let Some(rest) = field.strip_prefix("depends=") {
            if rest.is_empty() {
                return Vec::new();
            }
            return rest.split(',').map(|s| s.to_string()).collect();
        }
    }
    Vec::new()
}

/// A user-space executable or shared library. `memindex` comes from the
/// VMA list produced by the task manager rather than from a live
/// kernel-module struct.
#[derive(Debug, Clone)]
pub struct UserspaceLoader {
    pub name: String,
    pub needed: Vec<String>,
    pub mem_map: SectionMemMap,
    pub image: ExpectedImage,
    pub exported: Vec<RelSym>,
    pub entry_point: u64,
}

impl LoaderOps for UserspaceLoader {
    fn name(&self) -> &str {
        &self.name
    }
    fn memindex_of_section(&self, section: &str) -> Option<u64> {
        self.mem_map.get(section)
    }
    fn text(&self) -> &ExpectedImage {
        &self.image
    }
    fn exported_symbols(&self) -> &[RelSym] {
        &self.exported
    }
}

/// Tagged variant replacing the original inheritance hierarchy (§9).
#[derive(Debug, Clone)]
pub enum Loader {
    Kernel(KernelLoader),
    Module(ModuleLoader),
    Userspace(UserspaceLoader),
}

impl LoaderOps for Loader {
    fn name(&self) -> &str {
        match self {
            Loader::Kernel(l) => l.name(),
            Loader::Module(l) => l.name(),
            Loader::Userspace(l) => l.name(),
        }
    }
    fn memindex_of_section(&self, section: &str) -> Option<u64> {
        match self {
            Loader::Kernel(l) => l.memindex_of_section(section),
            Loader::Module(l) => l.memindex_of_section(section),
            Loader::Userspace(l) => l.memindex_of_section(section),
        }
    }
    fn text(&self) -> &ExpectedImage {
        match self {
            Loader::Kernel(l) => l.text(),
            Loader::Module(l) => l.text(),
            Loader::Userspace(l) => l.text(),
        }
    }
    fn exported_symbols(&self) -> &[RelSym] {
        match self {
            Loader::Kernel(l) => l.exported_symbols(),
            Loader::Module(l) => l.exported_symbols(),
            Loader::Userspace(l) => l.exported_symbols(),
        }
    }
}

/// `.ko` basename matching tolerates the kernel's `-`↔`_` transposition
/// (§12.4): a module named `usb_storage` in `modules` may ship as
/// `usb-storage.ko` on disk or vice versa.
pub fn module_basename_variants(name: &str) -> [String; 2] {
    [name.replace('-', "_"), name.replace('_', "-")]
}

/// Guards the module map during the bounded worker-pool module loading
/// fan-out (§5): a shared work list of module names plus the map of
/// loaders built so far.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    pub loaders: std::sync::Mutex<HashMap<String, ModuleLoader>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    pub fn insert(&self, loader: ModuleLoader) {
        self.loaders.lock().unwrap().insert(loader.name.clone(), loader);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loaders.lock().unwrap().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.loaders.lock().unwrap().len()
    }
}
