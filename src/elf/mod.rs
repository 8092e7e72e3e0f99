//! 32-bit big-endian MIPS `ET_REL` object file support: parsing, in-memory representation,
//! and serialization (§3, §4.A).
//!
//! This is deliberately narrow. The crate accepts exactly one ELF shape — the one IDO-family
//! MIPS assemblers and compilers emit — and rejects everything else up front with
//! [`ElfError`] rather than attempting to be a general-purpose ELF library.

pub mod header;
pub mod object;
pub mod reloc;
pub mod section_header;
pub mod strtab;
pub mod sym;

pub use header::Header;
pub use object::ObjFile;
pub use reloc::{RelEntry, RelaEntry, Relocation};
pub use section_header::{Section, SectionHeader};
pub use strtab::Strtab;
pub use sym::Symbol;

/// Errors arising from parsing or serializing an ELF object (§7 "ELF violation" /
/// "Input malformed", restricted to the ELF layer).
#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("not an ELF file (bad magic)")]
    BadMagic,

    #[error("malformed ELF: {0}")]
    Malformed(String),

    #[error("section {0:?} not found")]
    MissingSection(String),

    #[error("symbol {0:?} not found")]
    MissingSymbol(String),

    #[error("SHN_XINDEX is not supported")]
    ExtendedSectionIndex,

    #[error(transparent)]
    Scroll(#[from] scroll::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
