// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Checkpoint files
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A checkpoint summarises the durable state of a translog so that a restart
// can find the last synced byte of the active generation without scanning
// every file. The live checkpoint is `translog.ckp`; each rolled generation
// keeps a frozen copy named `translog-{generation}.ckp`.
//
// On-disk format (92 bytes, all integers little-endian):
//   [4 bytes: magic "VCKP"]
//   [4 bytes: format version]
//   [8 bytes: generation]
//   [8 bytes: offset]              -- durable length of the generation file
//   [8 bytes: num_ops]
//   [8 bytes: min_seqno (i64)]
//   [8 bytes: max_seqno (i64)]
//   [8 bytes: local_checkpoint (i64)]
//   [8 bytes: global_checkpoint (i64)]
//   [8 bytes: min_generation]      -- oldest generation still required
//   [16 bytes: translog uuid]
//   [4 bytes: crc32 of all preceding bytes]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::codec::{compute_crc32, ByteReader};
use crate::error::{TranslogError, TranslogResult};
use crate::operation::{SeqNo, NO_OPS_PERFORMED};

/// File name of the live checkpoint.
pub const CHECKPOINT_FILE_NAME: &str = "translog.ckp";

/// Magic bytes at the start of every checkpoint file.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"VCKP";

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Encoded size of a checkpoint in bytes.
pub const CHECKPOINT_SIZE: usize = 4 + 4 + 8 * 8 + 16 + 4;

/// Durable summary of a translog generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub generation: u64,
    pub offset: u64,
    pub num_ops: u64,
    pub min_seqno: SeqNo,
    pub max_seqno: SeqNo,
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
    pub min_generation: u64,
    pub translog_uuid: Uuid,
}

impl Checkpoint {
    /// The checkpoint of a freshly created, empty generation.
    pub fn empty(
        generation: u64,
        offset: u64,
        min_generation: u64,
        global_checkpoint: SeqNo,
        translog_uuid: Uuid,
    ) -> Self {
        Self {
            generation,
            offset,
            num_ops: 0,
            min_seqno: NO_OPS_PERFORMED,
            max_seqno: NO_OPS_PERFORMED,
            local_checkpoint: NO_OPS_PERFORMED,
            global_checkpoint,
            min_generation,
            translog_uuid,
        }
    }

    pub fn encode(&self) -> [u8; CHECKPOINT_SIZE] {
        let mut buffer = Vec::with_capacity(CHECKPOINT_SIZE);
        buffer.extend_from_slice(&CHECKPOINT_MAGIC);
        buffer.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&self.generation.to_le_bytes());
        buffer.extend_from_slice(&self.offset.to_le_bytes());
        buffer.extend_from_slice(&self.num_ops.to_le_bytes());
        buffer.extend_from_slice(&self.min_seqno.to_le_bytes());
        buffer.extend_from_slice(&self.max_seqno.to_le_bytes());
        buffer.extend_from_slice(&self.local_checkpoint.to_le_bytes());
        buffer.extend_from_slice(&self.global_checkpoint.to_le_bytes());
        buffer.extend_from_slice(&self.min_generation.to_le_bytes());
        buffer.extend_from_slice(self.translog_uuid.as_bytes());
        let crc = compute_crc32(&buffer);
        buffer.extend_from_slice(&crc.to_le_bytes());

        let mut out = [0u8; CHECKPOINT_SIZE];
        out.copy_from_slice(&buffer);
        out
    }

    pub fn decode(data: &[u8], file: &str) -> TranslogResult<Self> {
        let corrupted = |reason: &str| TranslogError::Corrupted {
            file: file.to_string(),
            reason: reason.to_string(),
        };

        if data.len() != CHECKPOINT_SIZE {
            return Err(corrupted(&format!(
                "checkpoint is {} bytes, expected {CHECKPOINT_SIZE}",
                data.len()
            )));
        }

        let body = &data[..CHECKPOINT_SIZE - 4];
        let mut reader = ByteReader::new(data);
        let truncated = || corrupted("truncated checkpoint");

        let magic = reader.bytes(4).ok_or_else(truncated)?;
        if magic != CHECKPOINT_MAGIC.as_slice() {
            return Err(corrupted("bad checkpoint magic"));
        }
        let version = reader.u32().ok_or_else(truncated)?;
        if version != CHECKPOINT_VERSION {
            return Err(corrupted(&format!("unsupported checkpoint version {version}")));
        }

        let checkpoint = Self {
            generation: reader.u64().ok_or_else(truncated)?,
            offset: reader.u64().ok_or_else(truncated)?,
            num_ops: reader.u64().ok_or_else(truncated)?,
            min_seqno: reader.i64().ok_or_else(truncated)?,
            max_seqno: reader.i64().ok_or_else(truncated)?,
            local_checkpoint: reader.i64().ok_or_else(truncated)?,
            global_checkpoint: reader.i64().ok_or_else(truncated)?,
            min_generation: reader.u64().ok_or_else(truncated)?,
            translog_uuid: reader.uuid().ok_or_else(truncated)?,
        };

        let stored_crc = reader.u32().ok_or_else(truncated)?;
        let computed_crc = compute_crc32(body);
        if stored_crc != computed_crc {
            return Err(TranslogError::CrcMismatch {
                file: file.to_string(),
                offset: 0,
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        Ok(checkpoint)
    }

    /// Read and validate a checkpoint file.
    pub fn read(path: &Path) -> TranslogResult<Self> {
        if !path.exists() {
            return Err(TranslogError::MissingCheckpoint(path.to_path_buf()));
        }
        let data = fs::read(path)?;
        Self::decode(&data, &display_name(path))
    }

    /// Atomically replace the checkpoint at `path`: write a temp file,
    /// fsync it, rename it over the target, then fsync the directory.
    pub fn write(&self, path: &Path) -> TranslogResult<()> {
        let tmp_path = path.with_extension("ckp.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

/// Path of the frozen checkpoint copy for a rolled generation.
pub fn generation_checkpoint_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("translog-{generation}.ckp"))
}

/// Fsync a directory to make rename and create operations durable.
///
/// Directory handles cannot be synced on Windows; the OS handles durability
/// there.
pub(crate) fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
