//! ELF64 parsing: header/sections/segments/symbols, on top of the `object`
//! crate instead of hand-rolled `Elf64_Ehdr`/`Elf64_Shdr` pointer casts.

pub mod reloc;

use crate::error::{IntegrityError, Result};
use memmap2::Mmap;
use object::read::elf::{ElfFile64, FileHeader};
use object::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type NativeElfFile<'data> = ElfFile64<'data, object::Endianness>;

/// A section as seen in the on-disk ELF, before any loading has assigned
/// it a live memory address. `memindex` is deliberately not a field here:
/// per the copy-on-write loading design, the mapping from section to
/// loaded virtual address lives in the loader that did the loading, not
/// mutated onto the parsed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub seg_id: u32,
    pub file_offset: u64,
    pub addr: u64,
    pub size: u64,
}

impl SectionInfo {
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_offset + self.size
    }

    pub fn contains_mem_address(&self, memindex: u64, address: u64) -> bool {
        address >= memindex && address < memindex + self.size
    }
}

/// A program-header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub p_type: u32,
    pub p_flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// A resolved relocation symbol, exported from a loader for dependents to
/// consume when resolving `SHN_UNDEF` references against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelSym {
    pub name: String,
    pub value: u64,
    pub info: u8,
    pub shndx: u32,
}

const SHN_UNDEF: u32 = 0;
const SHN_ABS: u32 = 0xfff1;
const SHN_COMMON: u32 = 0xfff2;

/// Symbol-table shndx classification per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionIndex {
    Undef,
    Abs,
    Common,
    Ordinary(u32),
}

pub fn classify_shndx(shndx: u32) -> SectionIndex {
    match shndx {
        SHN_UNDEF => SectionIndex::Undef,
        SHN_ABS => SectionIndex::Abs,
        SHN_COMMON => SectionIndex::Common,
        other => SectionIndex::Ordinary(other),
    }
}

/// A memory-mapped ELF file. Holds the mapping and re-derives an
/// `object::File` view on demand (cheap: header + section-table parsing
/// only), so no self-referential borrow needs to be stored.
pub struct ElfFile {
    path: PathBuf,
    mmap: Mmap,
}

impl ElfFile {
    pub fn load(path: impl AsRef<Path>) -> Result<ElfFile> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path).map_err(|e| IntegrityError::Elf {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| IntegrityError::Elf {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        Self::from_mmap(path, mmap)
    }

    fn from_mmap(path: PathBuf, mmap: Mmap) -> Result<ElfFile> {
        if mmap.len() < 5 {
            return Err(IntegrityError::Elf {
                path: path.display().to_string(),
                source: "file too short to contain an ELF identification".into(),
            });
        }
        const ELFCLASS32: u8 = 1;
        const ELFCLASS64: u8 = 2;
        match mmap[4] {
            ELFCLASS64 => {}
            ELFCLASS32 => return Err(IntegrityError::UnsupportedElfClass(ELFCLASS32)),
            other => return Err(IntegrityError::UnsupportedElfClass(other)),
        }
        let file = ElfFile { path, mmap };
        // Parse once here purely to validate the file is well-formed; the
        // parsed view itself is dropped and re-derived per call site.
        file.parse().map_err(|e| IntegrityError::Elf {
            path: file.path.display().to_string(),
            source: e,
        })?;
        Ok(file)
    }

    /// Re-parses the mapped bytes into a borrowed `object::File` view.
    pub fn parse(&self) -> std::result::Result<NativeElfFile<'_>, String> {
        let header = <object::elf::FileHeader64<object::Endianness>>::parse(&*self.mmap)
            .map_err(|e| e.to_string())?;
        let endian = header.endian().map_err(|e| e.to_string())?;
        ElfFile64::parse(&*self.mmap).map_err(|e| e.to_string()).and_then(|f| {
            // ElfFile64::parse already uses the correct endianness; the
            // explicit header parse above only served to fail fast with a
            // clearer error on a truncated/corrupt file.
            let _ = endian;
            Ok(f)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn is_relocatable(&self) -> Result<bool> {
        Ok(self.parse().map_err(|e| self.wrap(e))?.kind() == object::ObjectKind::Relocatable)
    }

    pub fn is_dynamic(&self) -> Result<bool> {
        Ok(self.parse().map_err(|e| self.wrap(e))?.kind() == object::ObjectKind::Dynamic)
    }

    pub fn is_executable(&self) -> Result<bool> {
        Ok(self.parse().map_err(|e| self.wrap(e))?.kind() == object::ObjectKind::Executable)
    }

    fn wrap(&self, source: String) -> IntegrityError {
        IntegrityError::Elf { path: self.path.display().to_string(), source }
    }

    pub fn find_section_with_name(&self, name: &str) -> Result<Option<SectionInfo>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        for (idx, section) in obj.sections().enumerate() {
            if section.name().map_err(|e| self.wrap(e.to_string()))? == name {
                return Ok(Some(SectionInfo {
                    name: name.to_string(),
                    seg_id: idx as u32,
                    file_offset: section.file_range().map(|r| r.0).unwrap_or(0),
                    addr: section.address(),
                    size: section.size(),
                }));
            }
        }
        Ok(None)
    }

    pub fn find_section_by_id(&self, seg_id: u32) -> Result<Option<SectionInfo>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        match obj.sections().nth(seg_id as usize) {
            Some(section) => Ok(Some(SectionInfo {
                name: section.name().map_err(|e| self.wrap(e.to_string()))?.to_string(),
                seg_id,
                file_offset: section.file_range().map(|r| r.0).unwrap_or(0),
                addr: section.address(),
                size: section.size(),
            })),
            None => Ok(None),
        }
    }

    pub fn find_section_by_offset(&self, offset: u64) -> Result<Option<SectionInfo>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        for (idx, section) in obj.sections().enumerate() {
            let (start, size) = section.file_range().unwrap_or((0, 0));
            if offset >= start && offset < start + size {
                return Ok(Some(SectionInfo {
                    name: section.name().map_err(|e| self.wrap(e.to_string()))?.to_string(),
                    seg_id: idx as u32,
                    file_offset: start,
                    addr: section.address(),
                    size: section.size(),
                }));
            }
        }
        Ok(None)
    }

    pub fn section_bytes(&self, info: &SectionInfo) -> Result<&[u8]> {
        let start = info.file_offset as usize;
        let end = start + info.size as usize;
        self.mmap.get(start..end).ok_or_else(|| {
            self.wrap(format!("section '{}' file range {start}..{end} out of bounds", info.name))
        })
    }

    pub fn symbol_name(&self, index: usize) -> Result<String> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        let table = obj.symbol_table().ok_or_else(|| self.wrap("no symbol table".into()))?;
        let sym = table.symbol_by_index(object::SymbolIndex(index)).map_err(|e| self.wrap(e.to_string()))?;
        Ok(sym.name().map_err(|e| self.wrap(e.to_string()))?.to_string())
    }

    /// The symbol at a raw symbol-table index, as a `RelSym` — used by the
    /// relocation engine to resolve a `RawRela`'s `r_sym` before applying
    /// it, mirroring `exported_symbols()`'s encoding.
    pub fn symbol_at(&self, index: usize) -> Result<RelSym> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        let table = obj.symbol_table().ok_or_else(|| self.wrap("no symbol table".into()))?;
        let sym = table
            .symbol_by_index(object::SymbolIndex(index))
            .map_err(|e| self.wrap(e.to_string()))?;
        Ok(RelSym {
            name: sym.name().map_err(|e| self.wrap(e.to_string()))?.to_string(),
            value: sym.address(),
            info: encode_st_info(&sym),
            shndx: section_index_of(&sym),
        })
    }

    /// Raw file bytes backing the virtual address range `[start, end)`,
    /// looked up by finding the section whose mapped range contains it.
    /// Used to extract `__jump_table`/mcount-loc arrays delimited by a
    /// pair of symbol addresses (`__start_mcount_loc`/`__stop_mcount_loc`).
    pub fn bytes_for_va_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        for section in obj.sections() {
            let addr = section.address();
            let size = section.size();
            if start >= addr && end <= addr + size {
                let (file_off, _) = section.file_range().unwrap_or((0, 0));
                let rel_start = (file_off + (start - addr)) as usize;
                let rel_end = (file_off + (end - addr)) as usize;
                return self
                    .mmap
                    .get(rel_start..rel_end)
                    .map(|b| b.to_vec())
                    .ok_or_else(|| self.wrap(format!("VA range {start:#x}..{end:#x} out of file bounds")));
            }
        }
        Err(self.wrap(format!("no section covers VA range {start:#x}..{end:#x}")))
    }

    pub fn find_address_of_variable(&self, name: &str) -> Result<Option<u64>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        for sym in obj.symbols() {
            if sym.name().map_err(|e| self.wrap(e.to_string()))? == name {
                return Ok(Some(sym.address()));
            }
        }
        Ok(None)
    }

    pub fn dependencies(&self) -> Result<Vec<String>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        Ok(obj.imports().map_err(|e| self.wrap(e.to_string()))?.iter().map(|i| {
            String::from_utf8_lossy(i.library()).to_string()
        }).collect())
    }

    /// Every global (`STT_FUNC`/`STT_OBJECT`, non-local binding) symbol
    /// this file defines, as a `RelSym` dependents can resolve against.
    pub fn exported_symbols(&self) -> Result<Vec<RelSym>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        let mut out = Vec::new();
        for sym in obj.symbols() {
            if sym.is_definition() && !sym.is_local() {
                out.push(RelSym {
                    name: sym.name().map_err(|e| self.wrap(e.to_string()))?.to_string(),
                    value: sym.address(),
                    info: encode_st_info(&sym),
                    shndx: section_index_of(&sym),
                });
            }
        }
        Ok(out)
    }

    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        let obj = self.parse().map_err(|e| self.wrap(e))?;
        Ok(obj
            .segments()
            .map(|s| {
                let (file_off, file_size) = s.file_range();
                SegmentInfo {
                    p_type: 0, // object's Segment trait doesn't expose raw p_type; callers match on flags/address instead.
                    p_flags: 0,
                    offset: file_off,
                    vaddr: s.address(),
                    paddr: s.address(),
                    filesz: file_size,
                    memsz: s.size(),
                    align: 0,
                }
            })
            .collect())
    }
}

fn encode_st_info<'d, S: ObjectSymbol<'d>>(sym: &S) -> u8 {
    let kind = match sym.kind() {
        object::SymbolKind::Text => 2,   // STT_FUNC
        object::SymbolKind::Data => 1,   // STT_OBJECT
        _ => 0,                          // STT_NOTYPE
    };
    let binding = if sym.is_global() { 1 } else { 0 }; // STB_GLOBAL : STB_LOCAL
    (binding << 4) | kind
}

fn section_index_of<'d, S: ObjectSymbol<'d>>(sym: &S) -> u32 {
    match sym.section() {
        object::SymbolSection::Section(idx) => idx.0 as u32,
        object::SymbolSection::Absolute => SHN_ABS,
        object::SymbolSection::Common => SHN_COMMON,
        object::SymbolSection::Undefined => SHN_UNDEF,
        _ => SHN_UNDEF,
    }
}

/// Per-loader map from section/symbol name to the virtual address it was
/// loaded at, filled in during loading (replaces mutating `memindex` onto
/// a shared `SectionInfo`).
#[derive(Debug, Clone, Default)]
pub struct MemIndex {
    by_section: HashMap<String, u64>,
}

impl MemIndex {
    pub fn set(&mut self, section: &str, addr: u64) {
        self.by_section.insert(section.to_string(), addr);
    }

    pub fn get(&self, section: &str) -> Option<u64> {
        self.by_section.get(section).copied()
    }
}
