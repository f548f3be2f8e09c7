//! Error taxonomy for the save codec.
//!
//! Every decode failure carries the byte offset where it was detected. Offsets
//! inside the compressed container refer to the file; offsets inside the
//! logical body refer to the decompressed buffer.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SavError {
    #[error("truncated data at offset {offset}: needed {needed} bytes, {available} available")]
    TruncatedData {
        offset: u64,
        needed: usize,
        available: usize,
    },

    #[error("bad magic number at offset {offset}: expected 0x{expected:08X}, found 0x{found:08X}")]
    BadMagicNumber { offset: u64, expected: u32, found: u32 },

    #[error("chunk size mismatch at offset {offset}: declared {declared}, actual {actual}")]
    ChunkSizeMismatch {
        offset: u64,
        declared: u64,
        actual: u64,
    },

    #[error("unsupported {field} {version} (oldest understood is {minimum})")]
    UnsupportedVersion {
        field: &'static str,
        version: u32,
        minimum: u32,
    },

    #[error("dangling reference to {level_name}:{path_name}")]
    DanglingReference {
        level_name: String,
        path_name: String,
    },

    #[error("{what} count mismatch at offset {offset}: expected {expected}, found {actual}")]
    StructuralCountMismatch {
        offset: u64,
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("{what} length mismatch at offset {offset}: declared {declared}, consumed {actual}")]
    LengthMismatch {
        offset: u64,
        what: &'static str,
        declared: u64,
        actual: u64,
    },

    #[error("malformed data at offset {offset}: {detail}")]
    Malformed { offset: u64, detail: String },

    #[error("{remaining} unparsed bytes at offset {offset}")]
    TrailingData { offset: u64, remaining: u64 },

    #[error("header field {field} does not match header version {version}")]
    InconsistentHeader { field: &'static str, version: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SavError {
    pub fn malformed(offset: u64, detail: impl Into<String>) -> Self {
        SavError::Malformed {
            offset,
            detail: detail.into(),
        }
    }

    /// Byte offset the error was detected at, when it has one.
    pub fn offset(&self) -> Option<u64> {
        match self {
            SavError::TruncatedData { offset, .. }
            | SavError::BadMagicNumber { offset, .. }
            | SavError::ChunkSizeMismatch { offset, .. }
            | SavError::StructuralCountMismatch { offset, .. }
            | SavError::LengthMismatch { offset, .. }
            | SavError::Malformed { offset, .. }
            | SavError::TrailingData { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SavError>;
