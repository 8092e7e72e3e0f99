//! Embeds hand-written 32-bit big-endian MIPS assembly into C/Pascal source compiled by a
//! legacy IDO-family toolchain that has no inline-assembly support of its own.
//!
//! The crate is a two-pass pipeline (§2):
//!
//! - **Pre-pass** ([`preprocess`]): scan a source file for `GLOBAL_ASM`/`INCLUDE_ASM`/
//!   `INCLUDE_RODATA` blocks, size each one's section contributions with [`asm::AsmBlock`], and
//!   emit a transformed source that reserves byte-exact placeholder storage for them.
//! - **Post-pass** ([`fixup`]): after the transformed source has been compiled to a relocatable
//!   object, assemble the original blocks and splice their bytes, symbols, and relocations back
//!   into the compiler's object in place of the placeholders.
//!
//! This is deliberately narrow: one ELF shape (32-bit, big-endian, `ET_REL`, `EM_MIPS`), one
//! curated subset of assembler directives, and no general-purpose linking.

pub mod asm;
pub mod elf;
pub mod error;
pub mod fixup;
pub mod options;
pub mod preprocess;
pub mod state;

pub use asm::Function;
pub use error::{Error, Result};
pub use options::Opts;
pub use state::GlobalState;
