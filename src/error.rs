use std::fmt;

/// Errors raised by the core library (ELF parsing, relocation, patching,
/// loading, validation). The binary collapses these into `anyhow` at its
/// outer layers via `.context(...)`.
#[derive(Debug)]
pub enum IntegrityError {
    /// The ELF class byte is not `ELFCLASS64`.
    UnsupportedElfClass(u8),
    /// Failed to parse or memory-map an ELF file.
    Elf { path: String, source: String },
    /// `System.map` could not be read or a line failed to parse.
    SystemMap { path: String, source: String },
    /// `SHN_UNDEF` symbol could not be resolved through the oracle chain.
    UnresolvedSymbol { name: String, section: String },
    /// `SHN_COMMON` symbol seen where one was never expected.
    CommonSymbol { name: String },
    /// A 32-bit relocation value overflowed its target width.
    RelocationOverflow { name: String, value: i64 },
    /// A relocation type this engine does not implement.
    UnknownRelocationType { r_type: u32 },
    /// A loader aborted partway through (module skipped, not fatal to the process).
    LoaderAborted { module: String, reason: String },
    /// A quirks/targets data file failed to parse.
    DataFile { path: String, source: String },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::UnsupportedElfClass(class) => {
                write!(f, "unsupported ELF class byte {class:#x} (only ELFCLASS64 is supported)")
            }
            IntegrityError::Elf { path, source } => {
                write!(f, "failed to load ELF file {path}: {source}")
            }
            IntegrityError::SystemMap { path, source } => {
                write!(f, "failed to read System.map at {path}: {source}")
            }
            IntegrityError::UnresolvedSymbol { name, section } => {
                write!(f, "unresolved symbol '{name}' referenced from section {section}")
            }
            IntegrityError::CommonSymbol { name } => {
                write!(f, "unexpected SHN_COMMON symbol '{name}'")
            }
            IntegrityError::RelocationOverflow { name, value } => {
                write!(f, "relocation value {value:#x} for '{name}' overflows target width")
            }
            IntegrityError::UnknownRelocationType { r_type } => {
                write!(f, "unhandled relocation type {r_type}")
            }
            IntegrityError::LoaderAborted { module, reason } => {
                write!(f, "loader for module '{module}' aborted: {reason}")
            }
            IntegrityError::DataFile { path, source } => {
                write!(f, "failed to parse data file {path}: {source}")
            }
        }
    }
}

impl std::error::Error for IntegrityError {}

pub type Result<T> = std::result::Result<T, IntegrityError>;
