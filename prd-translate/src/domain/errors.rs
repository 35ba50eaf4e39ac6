//! Structured error types for prd-translate
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only [`TranslateError`] aborts a run; the other types are per-record
//! conditions that are counted and logged.

use super::types::{Pid, Timestamp};
use std::path::PathBuf;
use thiserror::Error;

/// The file is not a readable PRD trace
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("file is {0} bytes, shorter than the file header")]
    TruncatedHeader(usize),

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("unexpected header size {0}")]
    BadHeaderSize(u16),

    #[error("header tables end at {tables_end}, past the end of the file ({file_len} bytes)")]
    TruncatedTables { tables_end: u64, file_len: u64 },

    #[error("data offset {data_offset} outside {tables_end}..={file_len}")]
    DataOffsetOutOfRange { data_offset: u64, tables_end: u64, file_len: u64 },
}

/// Fatal run-level errors
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("{}: invalid trace file: {source}", path.display())]
    FileFormat {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("{}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited_ms} ms waiting for the lock of process {pid}")]
    LockTimeout { pid: Pid, waited_ms: u128 },

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("{}: invalid task info: {message}", path.display())]
    TaskInfo { path: PathBuf, message: String },

    #[error("{}: invalid symbol table: {message}", path.display())]
    SymbolTable { path: PathBuf, message: String },

    #[error("translation worker {0} panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Sink(#[from] ExportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single record could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordDecodeError {
    #[error("record at offset {offset}: needs {needed} bytes, {available} left in file")]
    Truncated { offset: u64, needed: usize, available: usize },

    #[error("record at offset {offset}: length {length} is shorter than the record header")]
    BadLength { offset: u64, length: u16 },

    #[error("record at offset {offset}: unknown tag {tag}")]
    UnknownTag { offset: u64, tag: u8 },

    #[error("record at offset {offset} (tag {tag}): {what}")]
    Malformed { offset: u64, tag: u8, what: &'static str },
}

impl RecordDecodeError {
    /// Whether the reader can continue after this record
    ///
    /// A bad length is stepped over by scanning for the next record; a record
    /// past the end of the file ends the partition.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Truncated { .. })
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Truncated { offset, .. }
            | Self::BadLength { offset, .. }
            | Self::UnknownTag { offset, .. }
            | Self::Malformed { offset, .. } => *offset,
        }
    }
}

/// Unload of an address with no module loaded at that time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unload of 0x{load_addr:x} in {pid} at {timestamp} matches no loaded module")]
pub struct InconsistentUnload {
    pub pid: Pid,
    pub load_addr: u64,
    pub timestamp: Timestamp,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("profile references are inconsistent: {0}")]
    InvalidReference(String),

    #[error("Failed to write profile: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_format_error_display() {
        let err = TranslateError::FileFormat {
            path: PathBuf::from("/tmp/run.prd"),
            source: FormatError::UnsupportedVersion(9),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/run.prd"));
        assert!(msg.contains("unsupported format version 9"));
    }

    #[test]
    fn test_inconsistent_unload_display() {
        let err = InconsistentUnload { pid: Pid(1234), load_addr: 0x4000, timestamp: Timestamp(9) };
        assert_eq!(err.to_string(), "unload of 0x4000 in PID:1234 at t=9 matches no loaded module");
    }

    #[test]
    fn test_decode_error_recoverability() {
        assert!(RecordDecodeError::UnknownTag { offset: 64, tag: 99 }.is_recoverable());
        assert!(RecordDecodeError::BadLength { offset: 64, length: 3 }.is_recoverable());
        assert!(!RecordDecodeError::Truncated { offset: 64, needed: 48, available: 10 }
            .is_recoverable());
        assert_eq!(RecordDecodeError::BadLength { offset: 88, length: 0 }.offset(), 88);
    }
}
