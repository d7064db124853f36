// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Sealed generation readers and snapshots
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `GenerationReader` describes a generation that has been rolled (or
// sealed during recovery). Its frozen checkpoint records the exact content
// length and sequence-number range, and its footer checksum is validated
// whenever the file is opened. A corrupted sealed generation is an error:
// the operations in it were acknowledged.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{display_name, generation_checkpoint_path, Checkpoint};
use crate::codec::compute_crc32;
use crate::error::{TranslogError, TranslogResult};
use crate::generation::{
    generation_path, scan_records, verify_footer, GenerationFooter, GenerationHeader,
    FOOTER_SIZE, HEADER_SIZE,
};
use crate::location::Location;
use crate::operation::{Operation, SeqNo};

/// A read-only, sealed translog generation.
#[derive(Debug, Clone)]
pub struct GenerationReader {
    path: PathBuf,
    checkpoint: Checkpoint,
    last_modified: SystemTime,
}

impl GenerationReader {
    /// Open a sealed generation, validating its frozen checkpoint, header and
    /// footer.
    pub fn open(dir: &Path, generation: u64, translog_uuid: Uuid) -> TranslogResult<Self> {
        let path = generation_path(dir, generation);
        if !path.exists() {
            return Err(TranslogError::MissingGeneration { generation, path });
        }
        let checkpoint = Checkpoint::read(&generation_checkpoint_path(dir, generation))?;
        if checkpoint.generation != generation {
            return Err(TranslogError::Corrupted {
                file: display_name(&path),
                reason: format!(
                    "frozen checkpoint describes generation {}",
                    checkpoint.generation
                ),
            });
        }

        let data = fs::read(&path)?;
        let file = display_name(&path);
        GenerationHeader::decode(&data, &file)?.verify(translog_uuid, generation, &file)?;
        verify_footer(&data, checkpoint.offset, &file)?;

        Ok(Self {
            last_modified: fs::metadata(&path)?.modified()?,
            path,
            checkpoint,
        })
    }

    /// Wrap a generation this process just sealed. Its content was written
    /// and fsynced by the writer, so it is not read back.
    pub(crate) fn from_sealed(dir: &Path, checkpoint: Checkpoint) -> TranslogResult<Self> {
        let path = generation_path(dir, checkpoint.generation);
        Ok(Self {
            last_modified: fs::metadata(&path)?.modified()?,
            path,
            checkpoint,
        })
    }

    /// Seal the generation that was active when the process stopped.
    ///
    /// Bytes beyond the last synced checkpoint offset were never
    /// acknowledged as durable and are discarded. Everything before it must
    /// decode cleanly. The file is then truncated to that offset, a footer
    /// is appended and a frozen checkpoint written, after which it can be
    /// opened like any rolled generation.
    pub fn seal_recovered(
        dir: &Path,
        checkpoint: &Checkpoint,
        translog_uuid: Uuid,
    ) -> TranslogResult<Self> {
        let generation = checkpoint.generation;
        let path = generation_path(dir, generation);
        if !path.exists() {
            return Err(TranslogError::MissingGeneration { generation, path });
        }
        let file = display_name(&path);
        let data = fs::read(&path)?;
        GenerationHeader::decode(&data, &file)?.verify(translog_uuid, generation, &file)?;

        let operations = scan_records(&data, generation, checkpoint.offset, &file)?;
        if operations.len() as u64 != checkpoint.num_ops {
            return Err(TranslogError::Corrupted {
                file,
                reason: format!(
                    "checkpoint expects {} operations, found {}",
                    checkpoint.num_ops,
                    operations.len()
                ),
            });
        }

        let discarded = data.len() as u64 - checkpoint.offset;
        if discarded > 0 {
            info!(
                generation,
                discarded_bytes = discarded,
                "Discarding translog bytes beyond the last synced checkpoint"
            );
        }

        let content = &data[HEADER_SIZE as usize..checkpoint.offset as usize];
        let footer = GenerationFooter {
            content_length: content.len() as u64,
            checksum: compute_crc32(content),
        };
        {
            let mut handle = OpenOptions::new().write(true).open(&path)?;
            handle.set_len(checkpoint.offset)?;
            handle.sync_all()?;
            drop(handle);
            let mut handle = OpenOptions::new().append(true).open(&path)?;
            handle.write_all(&footer.encode())?;
            handle.sync_all()?;
        }
        checkpoint.write(&generation_checkpoint_path(dir, generation))?;

        Self::open(dir, generation, translog_uuid)
    }

    pub fn generation(&self) -> u64 {
        self.checkpoint.generation
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn num_ops(&self) -> u64 {
        self.checkpoint.num_ops
    }

    pub fn max_seqno(&self) -> SeqNo {
        self.checkpoint.max_seqno
    }

    /// Record bytes held by this generation, header and footer excluded.
    pub fn content_size(&self) -> u64 {
        self.checkpoint.offset - HEADER_SIZE
    }

    /// Size of the file on disk.
    pub fn size_in_bytes(&self) -> u64 {
        self.checkpoint.offset + FOOTER_SIZE
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every operation in the generation in offset order.
    pub fn read_operations(&self) -> TranslogResult<Vec<(Location, Operation)>> {
        let data = fs::read(&self.path)?;
        let file = display_name(&self.path);
        verify_footer(&data, self.checkpoint.offset, &file)?;
        scan_records(&data, self.checkpoint.generation, self.checkpoint.offset, &file)
    }

    /// Delete the generation file and its frozen checkpoint.
    pub(crate) fn delete(&self, dir: &Path) -> TranslogResult<()> {
        fs::remove_file(&self.path)?;
        let checkpoint_path = generation_checkpoint_path(dir, self.checkpoint.generation);
        if let Err(error) = fs::remove_file(&checkpoint_path) {
            warn!(
                error = %error,
                path = %checkpoint_path.display(),
                "Failed to remove frozen translog checkpoint"
            );
        }
        Ok(())
    }
}

/// Read one record of a generation file at `location`.
pub fn read_at(path: &Path, location: Location) -> TranslogResult<Operation> {
    use std::io::{Read, Seek, SeekFrom};

    let mut handle = fs::File::open(path)?;
    handle.seek(SeekFrom::Start(location.offset))?;
    let mut buffer = vec![0u8; location.size as usize];
    handle.read_exact(&mut buffer)?;

    let file = display_name(path);
    let declared = buffer
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0);
    if declared.checked_add(4) != Some(location.size) {
        return Err(TranslogError::Corrupted {
            file,
            reason: format!(
                "record at {location} declares length {declared}, location says {}",
                location.size
            ),
        });
    }
    Operation::deserialize(&buffer[4..], &file, location.offset)
}

/// A point-in-time view over translog operations in `(generation, offset)`
/// order.
pub struct Snapshot {
    operations: std::vec::IntoIter<(Location, Operation)>,
    total: usize,
}

impl Snapshot {
    pub(crate) fn new(operations: Vec<(Location, Operation)>) -> Self {
        let total = operations.len();
        Self {
            operations: operations.into_iter(),
            total,
        }
    }

    /// Number of operations the snapshot held when it was taken.
    pub fn total_operations(&self) -> usize {
        self.total
    }
}

impl Iterator for Snapshot {
    type Item = (Location, Operation);

    fn next(&mut self) -> Option<Self::Item> {
        self.operations.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.operations.size_hint()
    }
}

impl ExactSizeIterator for Snapshot {}
