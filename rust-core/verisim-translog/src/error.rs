// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines all error conditions that can arise while appending to, syncing,
// rolling or re-opening a shard translog. Anything surfaced from the write
// path is fatal for the owning shard.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during translog operations.
#[derive(Debug, Error)]
pub enum TranslogError {
    /// An I/O error occurred while reading or writing a translog file.
    #[error("translog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CRC32 checksum mismatch on a record, header, footer or checkpoint.
    #[error("CRC mismatch in {file} at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// The file in which the mismatch was detected.
        file: String,
        /// Byte offset of the checksummed region.
        offset: u64,
        /// The CRC32 value stored on disk.
        expected: u32,
        /// The CRC32 value computed from the bytes read.
        actual: u32,
    },

    /// The file is structurally invalid (bad magic, version, length, ...).
    #[error("corrupted translog file {file}: {reason}")]
    Corrupted {
        /// The offending file.
        file: String,
        /// Human readable description of the defect.
        reason: String,
    },

    /// A generation referenced by the checkpoint is not on disk.
    #[error("translog generation {generation} is referenced by the checkpoint but missing at {}", .path.display())]
    MissingGeneration {
        /// The missing generation id.
        generation: u64,
        /// Where the file was expected.
        path: PathBuf,
    },

    /// No checkpoint file exists in the translog directory.
    #[error("translog checkpoint not found at {}", .0.display())]
    MissingCheckpoint(PathBuf),

    /// The translog on disk belongs to another shard history.
    #[error("translog UUID mismatch: expected {expected}, found {actual}")]
    UuidMismatch {
        /// The UUID recorded by the last commit.
        expected: Uuid,
        /// The UUID found in the translog checkpoint.
        actual: Uuid,
    },

    /// The translog has been closed, either explicitly or by a tragic event.
    #[error("translog is closed: {0}")]
    Closed(String),

    /// A record declares a length beyond the accepted maximum.
    #[error("record at offset {offset} declares length {length} bytes, exceeding maximum {max_length}")]
    EntryTooLarge {
        /// Offset of the record in its generation file.
        offset: u64,
        /// The declared length.
        length: u32,
        /// The maximum allowed length.
        max_length: u32,
    },

    /// An unknown operation kind byte was encountered.
    #[error("invalid operation kind byte: {0}")]
    InvalidOperation(u8),

    /// UTF-8 decoding failed for a document id or no-op reason.
    #[error("invalid UTF-8 in operation: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Convenience type alias for translog results.
pub type TranslogResult<T> = Result<T, TranslogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_crc_mismatch() {
        let error = TranslogError::CrcMismatch {
            file: "translog-3.tlog".to_string(),
            offset: 44,
            expected: 0xDEADBEEF,
            actual: 0xCAFEBABE,
        };
        let message = format!("{error}");
        assert!(message.contains("translog-3.tlog"));
        assert!(message.contains("0xdeadbeef"));
        assert!(message.contains("0xcafebabe"));
    }

    #[test]
    fn test_error_display_missing_generation() {
        let error = TranslogError::MissingGeneration {
            generation: 7,
            path: PathBuf::from("/data/translog/translog-7.tlog"),
        };
        let message = format!("{error}");
        assert!(message.contains("generation 7"));
        assert!(message.contains("translog-7.tlog"));
    }

    #[test]
    fn test_error_display_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let message = format!("{}", TranslogError::Io(io_error));
        assert!(message.contains("file gone"));
    }
}
