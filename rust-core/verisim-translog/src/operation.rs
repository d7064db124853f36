// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Operation types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines the operations recorded by the translog and their binary record
// format with CRC32 integrity checking.
//
// On-disk record format (all integers little-endian):
//   [4 bytes: record_length (u32)]  -- length of everything after this field
//   [4 bytes: crc32 checksum]       -- CRC32 of the payload
//   payload:
//   [1 byte:  kind]                 -- 0=Index, 1=Delete, 2=NoOp
//   [8 bytes: seq_no (i64)]
//   [8 bytes: primary_term (u64)]
//   Index:  [4 bytes id_len][id][4 bytes source_len][source]
//   Delete: [4 bytes id_len][id]
//   NoOp:   [4 bytes reason_len][reason]

use serde::{Deserialize, Serialize};

use crate::codec::{compute_crc32, ByteReader};
use crate::error::{TranslogError, TranslogResult};

/// Sequence numbers are signed so the sentinels below fit the same domain.
pub type SeqNo = i64;

/// Seq_no of an operation that has not been assigned one (also reported to
/// listeners that fail).
pub const UNASSIGNED_SEQ_NO: SeqNo = -2;

/// Checkpoint value of a shard that has not processed any operation.
pub const NO_OPS_PERFORMED: SeqNo = -1;

/// Maximum allowed record size: 64 MiB. Any record declaring a larger size
/// is treated as corrupted.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Size of the record prefix (record_length + crc32).
pub const RECORD_PREFIX_SIZE: usize = 4 + 4;

/// Discriminant of an [`Operation`] on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// A document was indexed (created or overwritten).
    Index = 0,
    /// A document was deleted.
    Delete = 1,
    /// A sequence number was consumed without touching any document.
    NoOp = 2,
}

impl OperationKind {
    /// Decode a single byte into an `OperationKind`.
    pub fn from_byte(byte: u8) -> TranslogResult<Self> {
        match byte {
            0 => Ok(Self::Index),
            1 => Ok(Self::Delete),
            2 => Ok(Self::NoOp),
            other => Err(TranslogError::InvalidOperation(other)),
        }
    }

    /// Encode this kind as a single byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A single operation recorded by the translog. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Index `source` under document `id`.
    Index {
        seq_no: SeqNo,
        primary_term: u64,
        id: String,
        source: Vec<u8>,
    },
    /// Delete document `id`.
    Delete {
        seq_no: SeqNo,
        primary_term: u64,
        id: String,
    },
    /// Fill a sequence-number gap.
    NoOp {
        seq_no: SeqNo,
        primary_term: u64,
        reason: String,
    },
}

impl Operation {
    pub fn seq_no(&self) -> SeqNo {
        match self {
            Self::Index { seq_no, .. } | Self::Delete { seq_no, .. } | Self::NoOp { seq_no, .. } => {
                *seq_no
            }
        }
    }

    pub fn primary_term(&self) -> u64 {
        match self {
            Self::Index { primary_term, .. }
            | Self::Delete { primary_term, .. }
            | Self::NoOp { primary_term, .. } => *primary_term,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Index { .. } => OperationKind::Index,
            Self::Delete { .. } => OperationKind::Delete,
            Self::NoOp { .. } => OperationKind::NoOp,
        }
    }

    /// The document id this operation targets, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Index { id, .. } | Self::Delete { id, .. } => Some(id),
            Self::NoOp { .. } => None,
        }
    }

    /// Serialize this operation to a complete on-disk record, including the
    /// length prefix and CRC.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(64);
        payload.push(self.kind().to_byte());
        payload.extend_from_slice(&self.seq_no().to_le_bytes());
        payload.extend_from_slice(&self.primary_term().to_le_bytes());

        match self {
            Self::Index { id, source, .. } => {
                put_prefixed(&mut payload, id.as_bytes());
                put_prefixed(&mut payload, source);
            }
            Self::Delete { id, .. } => put_prefixed(&mut payload, id.as_bytes()),
            Self::NoOp { reason, .. } => put_prefixed(&mut payload, reason.as_bytes()),
        }

        let crc = compute_crc32(&payload);
        let record_length = (4 + payload.len()) as u32;

        let mut buffer = Vec::with_capacity(RECORD_PREFIX_SIZE + payload.len());
        buffer.extend_from_slice(&record_length.to_le_bytes());
        buffer.extend_from_slice(&crc.to_le_bytes());
        buffer.extend_from_slice(&payload);
        buffer
    }

    /// Deserialize an operation from the bytes that follow the
    /// record_length field (i.e. beginning with the CRC32).
    ///
    /// `file` and `offset` only feed error messages.
    pub fn deserialize(data: &[u8], file: &str, offset: u64) -> TranslogResult<Self> {
        let truncated = || TranslogError::Corrupted {
            file: file.to_string(),
            reason: format!("truncated record at offset {offset}"),
        };

        let mut reader = ByteReader::new(data);
        let stored_crc = reader.u32().ok_or_else(truncated)?;
        let payload = reader.bytes(reader.remaining()).ok_or_else(truncated)?;

        let computed_crc = compute_crc32(payload);
        if stored_crc != computed_crc {
            return Err(TranslogError::CrcMismatch {
                file: file.to_string(),
                offset,
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut reader = ByteReader::new(payload);
        let kind = OperationKind::from_byte(reader.u8().ok_or_else(truncated)?)?;
        let seq_no = reader.i64().ok_or_else(truncated)?;
        let primary_term = reader.u64().ok_or_else(truncated)?;

        let operation = match kind {
            OperationKind::Index => {
                let id = String::from_utf8(reader.prefixed().ok_or_else(truncated)?.to_vec())?;
                let source = reader.prefixed().ok_or_else(truncated)?.to_vec();
                Self::Index {
                    seq_no,
                    primary_term,
                    id,
                    source,
                }
            }
            OperationKind::Delete => {
                let id = String::from_utf8(reader.prefixed().ok_or_else(truncated)?.to_vec())?;
                Self::Delete {
                    seq_no,
                    primary_term,
                    id,
                }
            }
            OperationKind::NoOp => {
                let reason =
                    String::from_utf8(reader.prefixed().ok_or_else(truncated)?.to_vec())?;
                Self::NoOp {
                    seq_no,
                    primary_term,
                    reason,
                }
            }
        };

        if reader.remaining() != 0 {
            return Err(TranslogError::Corrupted {
                file: file.to_string(),
                reason: format!(
                    "{} trailing bytes in record at offset {offset}",
                    reader.remaining()
                ),
            });
        }

        Ok(operation)
    }
}

fn put_prefixed(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
}
