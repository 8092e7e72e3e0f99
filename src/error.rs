//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result`], and every error variant keeps
//! enough context (a function description, an offending source line, a section name) to let
//! the caller print a useful diagnostic without re-deriving it.

use std::fmt;
use std::io;

use crate::elf::ElfError;

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Elf(#[from] ElfError),

    /// A failure while analyzing or emitting an assembly block, carrying the block's
    /// human-readable provenance and, where available, the offending line.
    #[error("{message}\nwithin {fn_desc}")]
    Asm {
        fn_desc: String,
        line: Option<String>,
        message: String,
    },

    /// A failure while splicing the assembled object back into the compiler's object.
    #[error("{0}")]
    Fixup(String),

    /// A malformed-input failure in the source preprocessor not tied to any one assembly
    /// block (e.g. a misplaced `#pragma asmproc recurse`).
    #[error("{0}")]
    Preprocess(String),

    /// The external assembler exited with a non-zero status.
    #[error("assembler exited with status {status}")]
    Subprocess { status: i32 },

    /// A rejected CLI option combination.
    #[error("{0}")]
    Option(String),
}

impl Error {
    pub fn asm(fn_desc: impl Into<String>, line: Option<&str>, message: impl fmt::Display) -> Error {
        let fn_desc = fn_desc.into();
        let line = line.map(str::to_owned);
        let message = match &line {
            Some(l) => format!("{message}, at line \"{l}\""),
            None => message.to_string(),
        };
        Error::Asm { fn_desc, line, message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
