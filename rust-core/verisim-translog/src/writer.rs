// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Active generation writer
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The `GenerationWriter` owns the one generation file that still accepts
// appends. Appends copy a serialized record into a buffered writer under a
// short mutex; syncing flushes that buffer and then fsyncs through a cloned
// file handle while holding only the separate sync mutex, so concurrent
// appenders keep making progress during the fsync.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crc32fast::Hasher as Crc32Hasher;
use tracing::debug;
use uuid::Uuid;

use crate::checkpoint::{sync_dir, Checkpoint};
use crate::error::{TranslogError, TranslogResult};
use crate::generation::{generation_path, GenerationFooter, GenerationHeader, HEADER_SIZE};
use crate::location::Location;
use crate::operation::{SeqNo, NO_OPS_PERFORMED};

/// Default size of the in-memory append buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Values owned by the translog that every persisted checkpoint carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointContext {
    pub min_generation: u64,
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
}

/// Mutable state of the active generation, guarded by the append mutex.
struct WriterState {
    out: BufWriter<File>,
    /// Bytes handed to the writer so far, header included.
    offset: u64,
    num_ops: u64,
    min_seqno: SeqNo,
    max_seqno: SeqNo,
    content_crc: Crc32Hasher,
    last_modified: SystemTime,
    sealed: bool,
}

/// Summary of the active generation for stats and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub generation: u64,
    pub size_in_bytes: u64,
    pub num_ops: u64,
    pub min_seqno: SeqNo,
    pub max_seqno: SeqNo,
    pub last_modified: SystemTime,
}

/// The append-only writer for the current translog generation.
pub struct GenerationWriter {
    generation: u64,
    path: PathBuf,
    translog_uuid: Uuid,
    state: Mutex<WriterState>,
    /// Serialises fsync + checkpoint persistence.
    sync_lock: Mutex<()>,
    /// Second handle on the same file, used to fsync without the append lock.
    sync_handle: File,
    /// Offset up to which bytes are known to be durable.
    synced_offset: AtomicU64,
}

impl GenerationWriter {
    /// Create a brand new generation file, write and fsync its header.
    pub fn create(
        dir: &Path,
        generation: u64,
        translog_uuid: Uuid,
        primary_term: u64,
        buffer_size: usize,
    ) -> TranslogResult<Self> {
        let path = generation_path(dir, generation);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;

        let header = GenerationHeader {
            translog_uuid,
            primary_term,
            generation,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;
        sync_dir(dir)?;

        let sync_handle = file.try_clone()?;

        debug!(generation, path = %path.display(), "Created translog generation");

        Ok(Self {
            generation,
            path,
            translog_uuid,
            state: Mutex::new(WriterState {
                out: BufWriter::with_capacity(buffer_size, file),
                offset: HEADER_SIZE,
                num_ops: 0,
                min_seqno: NO_OPS_PERFORMED,
                max_seqno: NO_OPS_PERFORMED,
                content_crc: Crc32Hasher::new(),
                last_modified: SystemTime::now(),
                sealed: false,
            }),
            sync_lock: Mutex::new(()),
            sync_handle,
            synced_offset: AtomicU64::new(HEADER_SIZE),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one serialized record. Does not fsync.
    pub fn add(&self, record: &[u8], seq_no: SeqNo) -> TranslogResult<Location> {
        let mut state = self.lock_state();
        if state.sealed {
            return Err(TranslogError::Closed(format!(
                "generation {} is sealed",
                self.generation
            )));
        }

        let offset = state.offset;
        state.out.write_all(record)?;
        state.offset += record.len() as u64;
        state.num_ops += 1;
        state.content_crc.update(record);
        state.min_seqno = if state.min_seqno == NO_OPS_PERFORMED {
            seq_no
        } else {
            state.min_seqno.min(seq_no)
        };
        state.max_seqno = state.max_seqno.max(seq_no);
        state.last_modified = SystemTime::now();

        Ok(Location::new(self.generation, offset, record.len() as u32))
    }

    /// Whether bytes have been appended that are not yet durable.
    pub fn sync_needed(&self) -> bool {
        self.lock_state().offset > self.synced_offset.load(Ordering::Acquire)
    }

    /// Whether every byte before `offset` is durable.
    pub fn is_synced_up_to(&self, offset: u64) -> bool {
        self.synced_offset.load(Ordering::Acquire) >= offset
    }

    /// Flush and fsync the generation so that at least `offset` bytes are
    /// durable, then persist the checkpoint describing the synced state.
    ///
    /// With `offset == None` the sync is unconditional. Returns whether a
    /// sync was performed.
    pub fn sync_up_to(
        &self,
        offset: Option<u64>,
        context: CheckpointContext,
        checkpoint_path: &Path,
    ) -> TranslogResult<bool> {
        if let Some(offset) = offset {
            if self.is_synced_up_to(offset) {
                return Ok(false);
            }
        }

        let _sync = self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(offset) = offset {
            if self.is_synced_up_to(offset) {
                return Ok(false);
            }
        }

        let checkpoint = {
            let mut state = self.lock_state();
            if state.sealed {
                // The roll already fsynced everything this generation holds.
                return Ok(false);
            }
            state.out.flush()?;
            self.checkpoint_of(&state, context)
        };

        self.sync_handle.sync_data()?;
        checkpoint.write(checkpoint_path)?;
        self.synced_offset.store(checkpoint.offset, Ordering::Release);

        Ok(true)
    }

    /// Seal the generation: flush, append the footer, fsync. No further
    /// appends are accepted. Returns the frozen checkpoint, whose `offset` is
    /// the end of record content (the footer follows it).
    pub fn seal(&self, context: CheckpointContext) -> TranslogResult<Checkpoint> {
        let _sync = self.sync_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock_state();
        if state.sealed {
            return Err(TranslogError::Closed(format!(
                "generation {} is already sealed",
                self.generation
            )));
        }
        state.sealed = true;

        let checkpoint = self.checkpoint_of(&state, context);
        let footer = GenerationFooter {
            content_length: state.offset - HEADER_SIZE,
            checksum: state.content_crc.clone().finalize(),
        };
        state.out.write_all(&footer.encode())?;
        state.out.flush()?;
        state.out.get_ref().sync_all()?;
        self.synced_offset.store(checkpoint.offset, Ordering::Release);

        debug!(
            generation = self.generation,
            num_ops = checkpoint.num_ops,
            content_length = footer.content_length,
            "Sealed translog generation"
        );

        Ok(checkpoint)
    }

    /// Flush buffered bytes to the OS so the file can be read back, and
    /// return the offset up to which it is readable.
    pub fn flush_for_read(&self) -> TranslogResult<u64> {
        let mut state = self.lock_state();
        if !state.sealed {
            state.out.flush()?;
        }
        Ok(state.offset)
    }

    pub fn stats(&self) -> WriterStats {
        let state = self.lock_state();
        WriterStats {
            generation: self.generation,
            size_in_bytes: state.offset,
            num_ops: state.num_ops,
            min_seqno: state.min_seqno,
            max_seqno: state.max_seqno,
            last_modified: state.last_modified,
        }
    }

    /// Size of the generation in bytes, header included.
    pub fn size_in_bytes(&self) -> u64 {
        self.lock_state().offset
    }

    fn checkpoint_of(&self, state: &WriterState, context: CheckpointContext) -> Checkpoint {
        Checkpoint {
            generation: self.generation,
            offset: state.offset,
            num_ops: state.num_ops,
            min_seqno: state.min_seqno,
            max_seqno: state.max_seqno,
            local_checkpoint: context.local_checkpoint,
            global_checkpoint: context.global_checkpoint,
            min_generation: context.min_generation,
            translog_uuid: self.translog_uuid,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
