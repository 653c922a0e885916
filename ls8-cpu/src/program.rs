//! Program image loader
//!
//! Images are text files with one byte per line, written as a binary literal
//! of up to eight digits.  Anything after a `#` is a comment, and lines which
//! are empty once comments are stripped are skipped:
//!
//! ```text
//! 10000010 # LDI R0,8
//! 00000000
//! 00001000
//!
//! 01000111 # PRN R0
//! 00000000
//! 00000001 # HLT
//! ```
use log::debug;
use std::path::{Path, PathBuf};

/// Largest image that can be loaded
///
/// The program-end boundary is stored in an 8-bit register, so the image must
/// leave it room to point one past the last byte.
pub const MAX_SIZE: usize = crate::MEMORY_SIZE - 1;

/// Failure while reading or parsing a program image
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    /// The image could not be read from disk
    #[error("cannot open program at {path:?}")]
    Io {
        /// Path that we tried to open
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A line was not a valid 8-bit binary literal
    #[error("line {line}: invalid binary literal {text:?}")]
    Parse {
        /// Line number, starting from 1
        line: usize,
        /// Contents of the line, with comments and whitespace stripped
        text: String,
    },

    /// The image does not fit in memory
    #[error(
        "program is {0} bytes, but at most {max} can be loaded",
        max = MAX_SIZE
    )]
    TooLarge(usize),
}

impl LoadError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        crate::exit::LOAD
    }
}

fn parse_byte(s: &str) -> Option<u8> {
    if s.is_empty() || s.len() > 8 || !s.bytes().all(|c| c == b'0' || c == b'1')
    {
        return None;
    }
    u8::from_str_radix(s, 2).ok()
}

/// Parses a program image from its text representation
pub fn parse(text: &str) -> Result<Vec<u8>, LoadError> {
    let mut out = vec![];
    for (i, line) in text.lines().enumerate() {
        let s = line.split('#').next().unwrap_or_default().trim();
        if s.is_empty() {
            continue;
        }
        let b = parse_byte(s).ok_or_else(|| LoadError::Parse {
            line: i + 1,
            text: s.to_owned(),
        })?;
        out.push(b);
    }
    if out.len() > MAX_SIZE {
        return Err(LoadError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Reads and parses a program image from disk
pub fn load_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })?;
    let image = parse(&text)?;
    debug!("read {} bytes from {path:?}", image.len());
    Ok(image)
}
