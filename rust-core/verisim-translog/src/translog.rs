// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Generation coordinator
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `Translog` ties the active `GenerationWriter` to the sealed
// `GenerationReader`s that are still retained and to the live checkpoint.
//
// Locking:
//   - `current` is an `RwLock<Arc<GenerationWriter>>`. Appends and syncs hold
//     the read side; rolling and closing hold the write side, so no record is
//     ever split across generations and a roll is fully persisted before any
//     caller can observe the new generation.
//   - `maintenance` serialises roll, trim and close against each other.
//   - `readers` is only held for short map updates and clones.
//
// Any I/O failure on the write path is a tragic event: the translog closes
// itself and reports the original failure on every later call.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{generation_checkpoint_path, Checkpoint, CHECKPOINT_FILE_NAME};
use crate::config::TranslogConfig;
use crate::error::{TranslogError, TranslogResult};
use crate::generation::{list_generations, scan_records, HEADER_SIZE};
use crate::location::Location;
use crate::operation::{Operation, SeqNo, NO_OPS_PERFORMED};
use crate::reader::{read_at, GenerationReader, Snapshot};
use crate::writer::{CheckpointContext, GenerationWriter};

/// Point-in-time translog statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogStats {
    /// Operations across all retained generations.
    pub num_ops: u64,
    /// Bytes on disk across all retained generations.
    pub size_in_bytes: u64,
    /// Operations not yet covered by a commit.
    pub uncommitted_ops: u64,
    /// Record bytes not yet covered by a commit.
    pub uncommitted_size_in_bytes: u64,
    /// Age of the least recently modified retained generation.
    pub earliest_last_modified_age: Duration,
    /// Generation currently accepting appends.
    pub current_generation: u64,
}

/// A shard's write-ahead log.
pub struct Translog {
    dir: PathBuf,
    translog_uuid: Uuid,
    config: TranslogConfig,
    current: RwLock<Arc<GenerationWriter>>,
    readers: Mutex<BTreeMap<u64, GenerationReader>>,
    maintenance: Mutex<()>,
    min_generation: AtomicU64,
    /// Generations below this one are covered by the last commit.
    committed_generation: AtomicU64,
    local_checkpoint: AtomicI64,
    global_checkpoint: AtomicI64,
    last_write_location: Mutex<Option<Location>>,
    closed: AtomicBool,
    tragic_event: Mutex<Option<String>>,
}

impl Translog {
    /// Create an empty translog with a fresh UUID, starting at generation 1.
    ///
    /// Translog files left over from a previous history are removed.
    pub fn create(dir: impl AsRef<Path>, config: TranslogConfig) -> TranslogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        remove_translog_files(&dir)?;

        let translog_uuid = Uuid::new_v4();
        let writer =
            GenerationWriter::create(&dir, 1, translog_uuid, config.primary_term, config.buffer_size)?;
        Checkpoint::empty(1, HEADER_SIZE, 1, NO_OPS_PERFORMED, translog_uuid)
            .write(&dir.join(CHECKPOINT_FILE_NAME))?;

        info!(
            dir = %dir.display(),
            translog_uuid = %translog_uuid,
            "Created translog"
        );

        Ok(Self::assemble(
            dir,
            translog_uuid,
            config,
            writer,
            BTreeMap::new(),
            1,
            NO_OPS_PERFORMED,
            NO_OPS_PERFORMED,
        ))
    }

    /// Open an existing translog after a restart.
    ///
    /// The live checkpoint decides which generations are required and how
    /// many bytes of the last one are durable. Generations newer than the
    /// checkpoint are orphans of an interrupted roll and are deleted. The
    /// last generation is sealed at its durable length and a new, empty
    /// generation is started for appends.
    pub fn open(
        dir: impl AsRef<Path>,
        config: TranslogConfig,
        expected_uuid: Option<Uuid>,
    ) -> TranslogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let checkpoint = Checkpoint::read(&dir.join(CHECKPOINT_FILE_NAME))?;
        let translog_uuid = checkpoint.translog_uuid;
        if let Some(expected) = expected_uuid {
            if expected != translog_uuid {
                return Err(TranslogError::UuidMismatch {
                    expected,
                    actual: translog_uuid,
                });
            }
        }

        for file in list_generations(&dir)? {
            if file.generation > checkpoint.generation {
                warn!(
                    generation = file.generation,
                    checkpoint_generation = checkpoint.generation,
                    "Deleting orphan translog generation"
                );
                remove_generation(&dir, file.generation, &file.path)?;
            } else if file.generation < checkpoint.min_generation {
                debug!(generation = file.generation, "Deleting unreferenced translog generation");
                remove_generation(&dir, file.generation, &file.path)?;
            }
        }

        let mut readers = BTreeMap::new();
        for generation in checkpoint.min_generation..checkpoint.generation {
            readers.insert(
                generation,
                GenerationReader::open(&dir, generation, translog_uuid)?,
            );
        }

        let last = if generation_checkpoint_path(&dir, checkpoint.generation).exists() {
            // Sealed by a clean close or by a roll interrupted after sealing.
            GenerationReader::open(&dir, checkpoint.generation, translog_uuid)?
        } else {
            GenerationReader::seal_recovered(&dir, &checkpoint, translog_uuid)?
        };
        let local_checkpoint = checkpoint.local_checkpoint.max(last.checkpoint().local_checkpoint);
        let global_checkpoint = checkpoint
            .global_checkpoint
            .max(last.checkpoint().global_checkpoint);
        readers.insert(checkpoint.generation, last);

        let next_generation = checkpoint.generation + 1;
        let writer = GenerationWriter::create(
            &dir,
            next_generation,
            translog_uuid,
            config.primary_term,
            config.buffer_size,
        )?;
        let mut next = Checkpoint::empty(
            next_generation,
            HEADER_SIZE,
            checkpoint.min_generation,
            global_checkpoint,
            translog_uuid,
        );
        next.local_checkpoint = local_checkpoint;
        next.write(&dir.join(CHECKPOINT_FILE_NAME))?;

        let total_ops: u64 = readers.values().map(GenerationReader::num_ops).sum();
        info!(
            dir = %dir.display(),
            translog_uuid = %translog_uuid,
            min_generation = checkpoint.min_generation,
            current_generation = next_generation,
            total_ops,
            "Opened translog"
        );

        Ok(Self::assemble(
            dir,
            translog_uuid,
            config,
            writer,
            readers,
            checkpoint.min_generation,
            local_checkpoint,
            global_checkpoint,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        dir: PathBuf,
        translog_uuid: Uuid,
        config: TranslogConfig,
        writer: GenerationWriter,
        readers: BTreeMap<u64, GenerationReader>,
        min_generation: u64,
        local_checkpoint: SeqNo,
        global_checkpoint: SeqNo,
    ) -> Self {
        Self {
            dir,
            translog_uuid,
            config,
            current: RwLock::new(Arc::new(writer)),
            readers: Mutex::new(readers),
            maintenance: Mutex::new(()),
            min_generation: AtomicU64::new(min_generation),
            committed_generation: AtomicU64::new(min_generation),
            local_checkpoint: AtomicI64::new(local_checkpoint),
            global_checkpoint: AtomicI64::new(global_checkpoint),
            last_write_location: Mutex::new(None),
            closed: AtomicBool::new(false),
            tragic_event: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Append an operation to the current generation. Does not fsync.
    pub fn add(&self, operation: &Operation) -> TranslogResult<Location> {
        self.ensure_open()?;
        let record = operation.serialize();

        let location = {
            let current = self.read_current();
            let result = current.add(&record, operation.seq_no());
            self.check_tragic(result)?
        };

        let mut last = lock(&self.last_write_location);
        if last.map_or(true, |previous| previous < location) {
            *last = Some(location);
        }
        Ok(location)
    }

    /// Make every byte up to and including `location` durable.
    ///
    /// Returns `false` if nothing had to be synced, which includes any
    /// location in an already rolled generation.
    pub fn ensure_synced(&self, location: Location) -> TranslogResult<bool> {
        self.ensure_open()?;
        let current = self.read_current();
        if location.generation < current.generation() {
            return Ok(false);
        }
        let result = current.sync_up_to(
            Some(location.end_offset()),
            self.checkpoint_context(),
            &self.checkpoint_path(),
        );
        self.check_tragic(result)
    }

    /// Unconditionally flush and fsync the current generation and rewrite
    /// the checkpoint.
    pub fn sync(&self) -> TranslogResult<()> {
        self.ensure_open()?;
        let current = self.read_current();
        let result = current.sync_up_to(None, self.checkpoint_context(), &self.checkpoint_path());
        self.check_tragic(result).map(|_| ())
    }

    /// Whether appended bytes are waiting for an fsync.
    pub fn sync_needed(&self) -> bool {
        !self.is_closed() && self.read_current().sync_needed()
    }

    /// Seal the current generation and start `generation + 1`.
    pub fn roll_generation(&self) -> TranslogResult<()> {
        let _maintenance = lock(&self.maintenance);
        self.ensure_open()?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let result = self.roll_locked(&mut current);
        self.check_tragic(result)
    }

    fn roll_locked(&self, current: &mut Arc<GenerationWriter>) -> TranslogResult<()> {
        let context = self.checkpoint_context();
        let frozen = current.seal(context)?;
        frozen.write(&generation_checkpoint_path(&self.dir, frozen.generation))?;
        let reader = GenerationReader::from_sealed(&self.dir, frozen)?;

        let next_generation = frozen.generation + 1;
        let writer = GenerationWriter::create(
            &self.dir,
            next_generation,
            self.translog_uuid,
            self.config.primary_term,
            self.config.buffer_size,
        )?;
        let mut next = Checkpoint::empty(
            next_generation,
            HEADER_SIZE,
            context.min_generation,
            context.global_checkpoint,
            self.translog_uuid,
        );
        next.local_checkpoint = context.local_checkpoint;
        next.write(&self.checkpoint_path())?;

        lock(&self.readers).insert(frozen.generation, reader);
        *current = Arc::new(writer);

        info!(
            sealed_generation = frozen.generation,
            sealed_ops = frozen.num_ops,
            current_generation = next_generation,
            "Rolled translog generation"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Record that a commit now covers every generation below `generation`.
    pub fn mark_committed(&self, generation: u64) {
        self.committed_generation.fetch_max(generation, Ordering::AcqRel);
    }

    /// Delete the prefix of sealed generations whose operations are all
    /// covered by `committed_local_checkpoint`. Returns the number of
    /// generations deleted.
    pub fn trim_unreferenced(&self, committed_local_checkpoint: SeqNo) -> TranslogResult<usize> {
        let _maintenance = lock(&self.maintenance);
        self.ensure_open()?;
        let committed_generation = self.committed_generation.load(Ordering::Acquire);
        let current_generation = self.current_file_generation();

        let (trimmable, new_min) = {
            let readers = lock(&self.readers);
            let trimmable: Vec<GenerationReader> = readers
                .values()
                .take_while(|reader| {
                    reader.generation() < committed_generation
                        && reader.max_seqno() <= committed_local_checkpoint
                })
                .cloned()
                .collect();
            let new_min = readers
                .keys()
                .nth(trimmable.len())
                .copied()
                .unwrap_or(current_generation);
            (trimmable, new_min)
        };
        if trimmable.is_empty() {
            return Ok(0);
        }

        // Persist the new lower bound before deleting anything it excludes.
        self.min_generation.store(new_min, Ordering::Release);
        self.sync()?;

        let mut readers = lock(&self.readers);
        for reader in &trimmable {
            let result = reader.delete(&self.dir);
            self.check_tragic(result)?;
            readers.remove(&reader.generation());
        }
        debug!(
            trimmed = trimmable.len(),
            min_generation = new_min,
            committed_local_checkpoint,
            "Trimmed translog generations"
        );
        Ok(trimmable.len())
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// All retained operations with `seq_no >= from_seq_no`, in
    /// `(generation, offset)` order.
    pub fn new_snapshot(&self, from_seq_no: SeqNo) -> TranslogResult<Snapshot> {
        self.ensure_open()?;
        let current = self.read_current();
        let readers: Vec<GenerationReader> = lock(&self.readers).values().cloned().collect();

        let mut operations = Vec::new();
        for reader in &readers {
            operations.extend(
                reader
                    .read_operations()?
                    .into_iter()
                    .filter(|(_, op)| op.seq_no() >= from_seq_no),
            );
        }

        let readable = self.check_tragic(current.flush_for_read())?;
        let data = fs::read(current.path())?;
        let file = current
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        operations.extend(
            scan_records(&data, current.generation(), readable, &file)?
                .into_iter()
                .filter(|(_, op)| op.seq_no() >= from_seq_no),
        );

        Ok(Snapshot::new(operations))
    }

    /// Random access to a single operation.
    pub fn read(&self, location: Location) -> TranslogResult<Operation> {
        self.ensure_open()?;
        let current = self.read_current();
        if location.generation == current.generation() {
            self.check_tragic(current.flush_for_read())?;
            return read_at(current.path(), location);
        }
        let path = lock(&self.readers)
            .get(&location.generation)
            .map(|reader| reader.path().to_path_buf());
        match path {
            Some(path) => read_at(&path, location),
            None => Err(TranslogError::MissingGeneration {
                generation: location.generation,
                path: crate::generation::generation_path(&self.dir, location.generation),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> TranslogStats {
        let committed_generation = self.committed_generation.load(Ordering::Acquire);
        let current = self.read_current().stats();
        let readers = lock(&self.readers);

        let mut stats = TranslogStats {
            num_ops: current.num_ops,
            size_in_bytes: current.size_in_bytes,
            current_generation: current.generation,
            ..TranslogStats::default()
        };
        if current.generation >= committed_generation {
            stats.uncommitted_ops += current.num_ops;
            stats.uncommitted_size_in_bytes += current.size_in_bytes - HEADER_SIZE;
        }

        let mut earliest = current.last_modified;
        for reader in readers.values() {
            stats.num_ops += reader.num_ops();
            stats.size_in_bytes += reader.size_in_bytes();
            if reader.generation() >= committed_generation {
                stats.uncommitted_ops += reader.num_ops();
                stats.uncommitted_size_in_bytes += reader.content_size();
            }
            earliest = earliest.min(reader.last_modified());
        }
        stats.earliest_last_modified_age = SystemTime::now()
            .duration_since(earliest)
            .unwrap_or(Duration::ZERO);
        stats
    }

    pub fn current_file_generation(&self) -> u64 {
        self.read_current().generation()
    }

    /// Size of the current generation file, header included.
    pub fn current_generation_size_in_bytes(&self) -> u64 {
        self.read_current().size_in_bytes()
    }

    /// Location of the highest record appended so far by this process.
    pub fn last_write_location(&self) -> Option<Location> {
        *lock(&self.last_write_location)
    }

    pub fn min_generation(&self) -> u64 {
        self.min_generation.load(Ordering::Acquire)
    }

    pub fn translog_uuid(&self) -> Uuid {
        self.translog_uuid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local checkpoint recorded in the next persisted checkpoint.
    pub fn set_local_checkpoint(&self, seq_no: SeqNo) {
        self.local_checkpoint.fetch_max(seq_no, Ordering::AcqRel);
    }

    /// Global checkpoint recorded in the next persisted checkpoint.
    pub fn set_global_checkpoint(&self, seq_no: SeqNo) {
        self.global_checkpoint.fetch_max(seq_no, Ordering::AcqRel);
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.global_checkpoint.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The failure that closed this translog, if any.
    pub fn tragic_event(&self) -> Option<String> {
        lock(&self.tragic_event).clone()
    }

    /// Seal the current generation and refuse further operations.
    pub fn close(&self) -> TranslogResult<()> {
        let _maintenance = lock(&self.maintenance);
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let frozen = current.seal(self.checkpoint_context())?;
        frozen.write(&generation_checkpoint_path(&self.dir, frozen.generation))?;
        frozen.write(&self.checkpoint_path())?;

        info!(
            dir = %self.dir.display(),
            generation = frozen.generation,
            "Closed translog"
        );
        Ok(())
    }

    fn ensure_open(&self) -> TranslogResult<()> {
        if self.is_closed() {
            let reason = self
                .tragic_event()
                .unwrap_or_else(|| "translog closed".to_string());
            return Err(TranslogError::Closed(reason));
        }
        Ok(())
    }

    /// Close the translog if `result` carries an I/O failure.
    fn check_tragic<T>(&self, result: TranslogResult<T>) -> TranslogResult<T> {
        if let Err(TranslogError::Io(io_error)) = &result {
            let mut tragic = lock(&self.tragic_event);
            if tragic.is_none() {
                error!(
                    error = %io_error,
                    dir = %self.dir.display(),
                    "Tragic translog failure, closing translog"
                );
                *tragic = Some(io_error.to_string());
            }
            self.closed.store(true, Ordering::Release);
        }
        result
    }

    fn checkpoint_context(&self) -> CheckpointContext {
        CheckpointContext {
            min_generation: self.min_generation.load(Ordering::Acquire),
            local_checkpoint: self.local_checkpoint.load(Ordering::Acquire),
            global_checkpoint: self.global_checkpoint.load(Ordering::Acquire),
        }
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE_NAME)
    }

    fn read_current(&self) -> RwLockReadGuard<'_, Arc<GenerationWriter>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_generation(dir: &Path, generation: u64, path: &Path) -> TranslogResult<()> {
    fs::remove_file(path)?;
    let frozen = generation_checkpoint_path(dir, generation);
    if frozen.exists() {
        fs::remove_file(frozen)?;
    }
    Ok(())
}

fn remove_translog_files(dir: &Path) -> TranslogResult<()> {
    for file in list_generations(dir)? {
        warn!(
            generation = file.generation,
            "Removing translog generation from a previous history"
        );
        remove_generation(dir, file.generation, &file.path)?;
    }
    let checkpoint = dir.join(CHECKPOINT_FILE_NAME);
    if checkpoint.exists() {
        fs::remove_file(checkpoint)?;
    }
    Ok(())
}
