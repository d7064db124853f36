// SPDX-License-Identifier: PMPL-1.0-or-later
//! The shard lifecycle controller.
//!
//! An [`IndexShard`] owns one translog, one engine, the sequence-number
//! trackers, the global checkpoint listeners and the shard's breaker
//! contribution. Its lifecycle is:
//!
//! ```text
//! Created --recover_from_store--> Recovering --> Started --close--> Closed
//!                                     \______ failure ______________/
//! ```
//!
//! Writes go translog first, then engine. Under `request` durability the
//! translog location is fsynced before the write returns. After every write
//! the flush/roll policy is consulted; maintenance runs on the blocking pool
//! of the runtime the shard was opened in, never on the writer's thread.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use verisim_translog::{
    Durability, Location, Operation, SeqNo, Translog, TranslogConfig, TranslogError,
    DEFAULT_BUFFER_SIZE, NO_OPS_PERFORMED,
};

use crate::breaker::{CircuitBreaker, ShardAccounting};
use crate::engine::{CommitPoint, Engine};
use crate::error::{ShardError, ShardResult};
use crate::listeners::{GlobalCheckpointListeners, ListenerCallback};
use crate::policy::{self, MaintenanceAction};
use crate::seqno::{LocalCheckpointTracker, ReplicationTracker, SeqNoStats};
use crate::settings::ShardSettings;
use crate::shard_id::ShardId;
use crate::stats::{FlushStats, ShardStats};

/// Allocation id under which the primary tracks its own local checkpoint.
const PRIMARY_ALLOCATION_ID: &str = "primary";

/// Upper bound on the time between two background idle checks.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Created,
    Recovering,
    Started,
    Closed,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Created => write!(f, "created"),
            ShardState::Recovering => write!(f, "recovering"),
            ShardState::Started => write!(f, "started"),
            ShardState::Closed => write!(f, "closed"),
        }
    }
}

/// Static configuration of a shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: ShardId,
    /// Directory holding the translog (in `translog/`).
    pub data_path: PathBuf,
    pub primary_term: u64,
    #[serde(default)]
    pub settings: ShardSettings,
}

impl ShardConfig {
    pub fn new(shard_id: ShardId, data_path: impl Into<PathBuf>) -> Self {
        Self {
            shard_id,
            data_path: data_path.into(),
            primary_term: 1,
            settings: ShardSettings::default(),
        }
    }

    pub fn translog_path(&self) -> PathBuf {
        self.data_path.join("translog")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    /// Commit even if no operation is uncommitted.
    pub force: bool,
    /// Wait for a concurrent flush instead of returning immediately.
    pub wait_if_ongoing: bool,
}

impl Default for FlushRequest {
    fn default() -> Self {
        Self {
            force: false,
            wait_if_ongoing: true,
        }
    }
}

/// Result of a write on the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub seq_no: SeqNo,
    pub location: Location,
    /// Whether the write had to be fsynced before returning.
    pub synced: bool,
}

pub struct IndexShard {
    shard_id: ShardId,
    config: ShardConfig,
    runtime: Handle,
    state: RwLock<ShardState>,
    settings: RwLock<ShardSettings>,
    engine: Arc<dyn Engine>,
    translog: OnceLock<Arc<Translog>>,
    local_checkpoints: LocalCheckpointTracker,
    replication: ReplicationTracker,
    listeners: GlobalCheckpointListeners,
    accounting: Arc<ShardAccounting>,
    flush_lock: Mutex<()>,
    flush_or_roll_running: AtomicBool,
    flush_total: AtomicU64,
    flush_periodic: AtomicU64,
    /// Cleared by the idle check, set by every write.
    active: AtomicBool,
    last_write: Mutex<Instant>,
    sync_id: Mutex<Option<String>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexShard {
    /// Build a shard in the `Created` state. Must be called from within a
    /// tokio runtime, which then runs the shard's background work.
    pub fn open(
        config: ShardConfig,
        engine: Arc<dyn Engine>,
        breaker: Arc<CircuitBreaker>,
    ) -> ShardResult<Arc<Self>> {
        config.settings.validate()?;
        let runtime = Handle::try_current()?;
        let shard_id = config.shard_id.clone();

        let accounting = Arc::new(ShardAccounting::new(shard_id.clone(), breaker));
        engine.set_segment_memory_listener(accounting.clone());

        info!(shard_id = %shard_id, path = %config.data_path.display(), "Opened shard");

        Ok(Arc::new(Self {
            listeners: GlobalCheckpointListeners::new(
                shard_id.clone(),
                NO_OPS_PERFORMED,
                runtime.clone(),
            ),
            settings: RwLock::new(config.settings.clone()),
            shard_id,
            config,
            runtime,
            state: RwLock::new(ShardState::Created),
            engine,
            translog: OnceLock::new(),
            local_checkpoints: LocalCheckpointTracker::new(NO_OPS_PERFORMED, NO_OPS_PERFORMED),
            replication: ReplicationTracker::new(PRIMARY_ALLOCATION_ID, NO_OPS_PERFORMED),
            accounting,
            flush_lock: Mutex::new(()),
            flush_or_roll_running: AtomicBool::new(false),
            flush_total: AtomicU64::new(0),
            flush_periodic: AtomicU64::new(0),
            active: AtomicBool::new(true),
            last_write: Mutex::new(Instant::now()),
            sync_id: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn state(&self) -> ShardState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> ShardSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the dynamic settings. Takes effect on the next policy
    /// evaluation and the next background sync tick.
    pub fn update_settings(&self, settings: ShardSettings) -> ShardResult<()> {
        settings.validate()?;
        let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        if current.durability != settings.durability {
            info!(
                shard_id = %self.shard_id,
                from = %current.durability,
                to = %settings.durability,
                "Changed translog durability"
            );
        }
        *current = settings;
        Ok(())
    }

    pub fn translog(&self) -> ShardResult<Arc<Translog>> {
        self.translog
            .get()
            .cloned()
            .ok_or_else(|| ShardError::IllegalState {
                expected: ShardState::Started,
                actual: self.state(),
            })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn accounting(&self) -> &Arc<ShardAccounting> {
        &self.accounting
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Recover from the local store and start the shard.
    ///
    /// Loads the last engine commit, opens the translog it references and
    /// replays every operation above the commit's local checkpoint. An empty
    /// store gets a fresh translog and an initial commit. Any failure fails
    /// the shard and is reported as [`ShardError::Recovery`].
    pub fn recover_from_store(self: &Arc<Self>) -> ShardResult<()> {
        self.transition(ShardState::Created, ShardState::Recovering)?;
        let started = Instant::now();

        match self.recover_internal() {
            Ok(replayed) => {
                self.transition(ShardState::Recovering, ShardState::Started)?;
                self.start_sync_task();
                self.start_idle_task();
                info!(
                    shard_id = %self.shard_id,
                    replayed,
                    local_checkpoint = self.local_checkpoints.checkpoint(),
                    took_ms = started.elapsed().as_millis() as u64,
                    "Recovered shard from store"
                );
                Ok(())
            }
            Err(source) => {
                self.fail_shard(&format!("recovery failed: {source}"));
                Err(ShardError::Recovery {
                    shard_id: self.shard_id.clone(),
                    source: Box::new(source),
                })
            }
        }
    }

    fn recover_internal(&self) -> ShardResult<usize> {
        let translog_config = TranslogConfig {
            primary_term: self.config.primary_term,
            buffer_size: DEFAULT_BUFFER_SIZE,
        };
        let translog_path = self.config.translog_path();

        let commit = match self.engine.last_commit()? {
            Some(commit) => commit,
            None => {
                let translog = Translog::create(&translog_path, translog_config.clone())?;
                let commit = CommitPoint {
                    translog_uuid: translog.translog_uuid(),
                    translog_generation: translog.current_file_generation(),
                    local_checkpoint: NO_OPS_PERFORMED,
                    max_seq_no: NO_OPS_PERFORMED,
                    sync_id: None,
                };
                self.engine.commit(commit.clone())?;
                translog.close()?;
                debug!(shard_id = %self.shard_id, "Bootstrapped empty shard history");
                commit
            }
        };

        let translog = Arc::new(Translog::open(
            &translog_path,
            translog_config,
            Some(commit.translog_uuid),
        )?);
        translog.mark_committed(commit.translog_generation);
        self.local_checkpoints
            .reset(commit.max_seq_no, commit.local_checkpoint);
        self.replication
            .restore_global_checkpoint(translog.global_checkpoint());
        self.translog
            .set(Arc::clone(&translog))
            .map_err(|_| ShardError::InvalidArgument("translog already installed".to_string()))?;

        let replayed = self.run_translog_recovery(commit.local_checkpoint + 1)?;
        self.fill_seq_no_gaps(&translog)?;
        self.engine.refresh()?;

        translog.set_local_checkpoint(self.local_checkpoints.checkpoint());
        self.update_global_checkpoint_on_primary();
        self.listeners
            .notify_advanced(self.replication.global_checkpoint());
        translog.sync()?;
        Ok(replayed)
    }

    /// Replay retained translog operations with `seq_no >= from_seq_no` into
    /// the engine, in `(generation, offset)` order. Operations the engine
    /// already holds are skipped, so replaying twice is harmless. Returns
    /// the number of operations read.
    pub fn run_translog_recovery(&self, from_seq_no: SeqNo) -> ShardResult<usize> {
        let translog = self.translog()?;
        let mut replayed = 0;
        for (location, operation) in translog.new_snapshot(from_seq_no)? {
            self.engine.apply(&operation)?;
            self.local_checkpoints.advance_max_seq_no(operation.seq_no());
            self.local_checkpoints.mark_processed(operation.seq_no());
            replayed += 1;
            debug!(
                shard_id = %self.shard_id,
                seq_no = operation.seq_no(),
                %location,
                "Replayed translog operation"
            );
        }
        Ok(replayed)
    }

    /// Sequence numbers handed out before a crash but never written leave a
    /// hole the local checkpoint cannot pass. Fill each with a no-op.
    fn fill_seq_no_gaps(&self, translog: &Translog) -> ShardResult<()> {
        let max_seq_no = self.local_checkpoints.max_seq_no();
        let mut filled = 0;
        let mut seq_no = self.local_checkpoints.checkpoint() + 1;
        while seq_no <= max_seq_no {
            if !self.local_checkpoints.has_processed(seq_no) {
                let operation = Operation::NoOp {
                    seq_no,
                    primary_term: self.config.primary_term,
                    reason: "filling gaps".to_string(),
                };
                translog.add(&operation)?;
                self.engine.apply(&operation)?;
                self.local_checkpoints.mark_processed(seq_no);
                filled += 1;
            }
            seq_no += 1;
        }
        if filled > 0 {
            warn!(shard_id = %self.shard_id, filled, max_seq_no, "Filled sequence number gaps");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Index a document and run the post-write maintenance check.
    pub fn index(self: &Arc<Self>, id: &str, source: Vec<u8>) -> ShardResult<WriteResult> {
        let result = self.apply_index_operation_on_primary(id, source)?;
        self.after_write_operation();
        Ok(result)
    }

    /// Delete a document and run the post-write maintenance check.
    pub fn delete(self: &Arc<Self>, id: &str) -> ShardResult<WriteResult> {
        let result = self.apply_delete_operation_on_primary(id)?;
        self.after_write_operation();
        Ok(result)
    }

    pub fn apply_index_operation_on_primary(
        &self,
        id: &str,
        source: Vec<u8>,
    ) -> ShardResult<WriteResult> {
        self.ensure_started()?;
        let seq_no = self.local_checkpoints.generate_seq_no();
        self.apply_on_primary(Operation::Index {
            seq_no,
            primary_term: self.config.primary_term,
            id: id.to_string(),
            source,
        })
    }

    pub fn apply_delete_operation_on_primary(&self, id: &str) -> ShardResult<WriteResult> {
        self.ensure_started()?;
        let seq_no = self.local_checkpoints.generate_seq_no();
        self.apply_on_primary(Operation::Delete {
            seq_no,
            primary_term: self.config.primary_term,
            id: id.to_string(),
        })
    }

    fn apply_on_primary(&self, operation: Operation) -> ShardResult<WriteResult> {
        let translog = self.translog()?;
        let seq_no = operation.seq_no();

        let location = translog
            .add(&operation)
            .map_err(|e| self.fail_on_translog_error(e))?;
        if let Err(engine_error) = self.engine.apply(&operation) {
            self.fail_shard(&format!("engine failure: {engine_error}"));
            return Err(engine_error.into());
        }
        // Under request durability the checkpoints may only cover durable
        // operations, so the fsync comes before the seq_no is processed.
        let synced = match self.settings().durability {
            Durability::Request => translog
                .ensure_synced(location)
                .map_err(|e| self.fail_on_translog_error(e))?,
            Durability::Async => false,
        };
        self.local_checkpoints.mark_processed(seq_no);
        translog.set_local_checkpoint(self.local_checkpoints.checkpoint());
        self.update_global_checkpoint_on_primary();
        self.mark_active();

        Ok(WriteResult {
            seq_no,
            location,
            synced,
        })
    }

    fn mark_active(&self) {
        self.active.store(true, Ordering::Release);
        *lock(&self.last_write) = Instant::now();
        lock(&self.sync_id).take();
    }

    /// Fsync the translog regardless of durability.
    pub fn sync_translog(&self) -> ShardResult<()> {
        self.translog()?
            .sync()
            .map_err(|e| self.fail_on_translog_error(e))
    }

    // -----------------------------------------------------------------------
    // Flush / roll
    // -----------------------------------------------------------------------

    pub fn should_periodically_flush(&self) -> bool {
        let settings = self.settings();
        self.translog
            .get()
            .is_some_and(|translog| policy::should_periodically_flush(&translog.stats(), &settings))
    }

    pub fn should_roll_generation(&self) -> bool {
        let settings = self.settings();
        self.translog.get().is_some_and(|translog| {
            policy::should_roll_generation(translog.current_generation_size_in_bytes(), &settings)
        })
    }

    /// Post-write hook. Consults the flush/roll policy and, if maintenance
    /// is due and none is running, schedules it on the blocking pool.
    /// Returns whether maintenance was scheduled.
    pub fn after_write_operation(self: &Arc<Self>) -> bool {
        if self.state() != ShardState::Started {
            return false;
        }
        let Some(translog) = self.translog.get() else {
            return false;
        };
        let settings = self.settings();
        let Some(action) = policy::evaluate(
            &translog.stats(),
            translog.current_generation_size_in_bytes(),
            &settings,
        ) else {
            return false;
        };
        if self
            .flush_or_roll_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let shard = Arc::clone(self);
        self.runtime.spawn_blocking(move || {
            let result = match action {
                MaintenanceAction::Flush => shard.flush_internal(
                    FlushRequest {
                        force: false,
                        wait_if_ongoing: false,
                    },
                    true,
                    None,
                ),
                MaintenanceAction::RollGeneration => shard
                    .translog()
                    .and_then(|t| t.roll_generation().map_err(|e| shard.fail_on_translog_error(e)))
                    .map(|_| true),
            };
            if let Err(e) = result {
                warn!(shard_id = %shard.shard_id, action = ?action, error = %e, "Scheduled maintenance failed");
            }
            shard.flush_or_roll_running.store(false, Ordering::Release);
            shard.after_write_operation();
        });
        true
    }

    /// Commit the engine and start a new translog generation. Returns
    /// whether a commit was made.
    pub fn flush(&self, request: FlushRequest) -> ShardResult<bool> {
        self.flush_internal(request, false, None)
    }

    fn flush_internal(
        &self,
        request: FlushRequest,
        periodic: bool,
        sync_id: Option<String>,
    ) -> ShardResult<bool> {
        self.ensure_started()?;
        let _flush = if request.wait_if_ongoing {
            lock(&self.flush_lock)
        } else {
            match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Ok(false),
            }
        };

        let translog = self.translog()?;
        if !request.force && sync_id.is_none() && translog.stats().uncommitted_ops == 0 {
            return Ok(false);
        }

        translog
            .roll_generation()
            .map_err(|e| self.fail_on_translog_error(e))?;
        let commit = CommitPoint {
            translog_uuid: translog.translog_uuid(),
            translog_generation: translog.current_file_generation(),
            local_checkpoint: self.local_checkpoints.checkpoint(),
            max_seq_no: self.local_checkpoints.max_seq_no(),
            sync_id,
        };
        self.engine.commit(commit.clone())?;
        translog.mark_committed(commit.translog_generation);
        let trimmed = translog
            .trim_unreferenced(commit.local_checkpoint)
            .map_err(|e| self.fail_on_translog_error(e))?;

        self.flush_total.fetch_add(1, Ordering::AcqRel);
        if periodic {
            self.flush_periodic.fetch_add(1, Ordering::AcqRel);
        }
        info!(
            shard_id = %self.shard_id,
            periodic,
            local_checkpoint = commit.local_checkpoint,
            translog_generation = commit.translog_generation,
            trimmed_generations = trimmed,
            sync_id = ?commit.sync_id,
            "Flushed shard"
        );
        Ok(true)
    }

    /// If no write happened for `inactive_after`, schedule a synced flush
    /// once. Returns whether one was scheduled; calling again before the
    /// next write is a no-op.
    pub fn check_idle(self: &Arc<Self>, inactive_after: Duration) -> bool {
        if self.state() != ShardState::Started || !self.active.load(Ordering::Acquire) {
            return false;
        }
        if lock(&self.last_write).elapsed() < inactive_after {
            return false;
        }
        if self
            .flush_or_roll_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.active.store(false, Ordering::Release);

        let shard = Arc::clone(self);
        self.runtime.spawn_blocking(move || {
            let sync_id = Uuid::new_v4().to_string();
            let request = FlushRequest {
                force: true,
                wait_if_ongoing: true,
            };
            match shard.flush_internal(request, false, Some(sync_id.clone())) {
                Ok(_) => {
                    info!(shard_id = %shard.shard_id, sync_id = %sync_id, "Shard is inactive, synced flush done");
                    // A write racing the flush already cleared activity.
                    if !shard.active.load(Ordering::Acquire) {
                        *lock(&shard.sync_id) = Some(sync_id);
                    }
                }
                Err(e) => {
                    warn!(shard_id = %shard.shard_id, error = %e, "Synced flush failed");
                    // Stay eligible so the next idle check retries.
                    shard.active.store(true, Ordering::Release);
                }
            }
            shard.flush_or_roll_running.store(false, Ordering::Release);
        });
        true
    }

    /// Sync id of the last synced flush, while no write followed it.
    pub fn sync_id(&self) -> Option<String> {
        lock(&self.sync_id).clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether a scheduled flush, roll or synced flush is in progress.
    pub fn is_flush_or_roll_running(&self) -> bool {
        self.flush_or_roll_running.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Checkpoints and listeners
    // -----------------------------------------------------------------------

    pub fn local_checkpoint(&self) -> SeqNo {
        self.local_checkpoints.checkpoint()
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.replication.global_checkpoint()
    }

    pub fn max_seq_no(&self) -> SeqNo {
        self.local_checkpoints.max_seq_no()
    }

    pub fn add_global_checkpoint_listener(
        &self,
        target: SeqNo,
        callback: ListenerCallback,
        timeout: Option<Duration>,
    ) -> ShardResult<()> {
        self.listeners
            .add_listener(target, callback, timeout)
            .map_err(ShardError::from)
    }

    pub fn pending_listeners(&self) -> usize {
        self.listeners.pending_count()
    }

    pub fn add_in_sync_copy(&self, allocation_id: &str, local_checkpoint: SeqNo) -> ShardResult<()> {
        let advanced = self
            .replication
            .add_in_sync_copy(allocation_id, local_checkpoint)?;
        self.publish_global_checkpoint(advanced);
        Ok(())
    }

    pub fn update_copy_local_checkpoint(
        &self,
        allocation_id: &str,
        local_checkpoint: SeqNo,
    ) -> ShardResult<()> {
        let advanced = self
            .replication
            .update_local_checkpoint(allocation_id, local_checkpoint)?;
        self.publish_global_checkpoint(advanced);
        Ok(())
    }

    pub fn remove_copy(&self, allocation_id: &str) -> ShardResult<()> {
        let advanced = self.replication.remove_copy(allocation_id)?;
        self.publish_global_checkpoint(advanced);
        Ok(())
    }

    fn update_global_checkpoint_on_primary(&self) {
        let advanced = self
            .replication
            .update_local_checkpoint(PRIMARY_ALLOCATION_ID, self.local_checkpoints.checkpoint())
            .unwrap_or_default();
        self.publish_global_checkpoint(advanced);
    }

    fn publish_global_checkpoint(&self, advanced: Option<SeqNo>) {
        if let Some(global_checkpoint) = advanced {
            if let Some(translog) = self.translog.get() {
                translog.set_global_checkpoint(global_checkpoint);
            }
            self.listeners.notify_advanced(global_checkpoint);
        }
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn flush_stats(&self) -> FlushStats {
        FlushStats {
            total: self.flush_total.load(Ordering::Acquire),
            periodic: self.flush_periodic.load(Ordering::Acquire),
        }
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            shard_id: self.shard_id.clone(),
            state: self.state(),
            flush: self.flush_stats(),
            translog: self
                .translog
                .get()
                .map(|translog| translog.stats())
                .unwrap_or_default(),
            seq_no: SeqNoStats {
                max_seq_no: self.max_seq_no(),
                local_checkpoint: self.local_checkpoint(),
                global_checkpoint: self.global_checkpoint(),
            },
            breaker_used_bytes: self.accounting.used(),
            segment_memory_bytes: self.engine.segment_memory_bytes(),
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close the shard, optionally flushing first. Pending listeners fail
    /// with `ShardClosed`, the translog is sealed and the shard's breaker
    /// contribution is retracted.
    pub fn close(&self, reason: &str, flush: bool) -> ShardResult<()> {
        let flush_result = if flush && self.state() == ShardState::Started {
            self.flush(FlushRequest {
                force: true,
                wait_if_ongoing: true,
            })
            .map(|_| ())
        } else {
            Ok(())
        };

        if !self.release_resources() {
            return flush_result;
        }
        info!(shard_id = %self.shard_id, reason, "Closed shard");
        flush_result
    }

    /// Close after an unrecoverable failure.
    pub fn fail_shard(&self, reason: &str) {
        if self.release_resources() {
            error!(shard_id = %self.shard_id, reason, "Shard failed");
        }
    }

    /// Returns false if the shard was already closed.
    fn release_resources(&self) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == ShardState::Closed {
                return false;
            }
            *state = ShardState::Closed;
        }

        self.listeners.close();
        for task in lock(&self.background_tasks).drain(..) {
            task.abort();
        }
        if let Some(translog) = self.translog.get() {
            if let Err(e) = translog.close() {
                warn!(shard_id = %self.shard_id, error = %e, "Failed to close translog");
            }
        }
        if let Err(e) = self.engine.close() {
            warn!(shard_id = %self.shard_id, error = %e, "Failed to close engine");
        }
        self.accounting.release();
        true
    }

    fn fail_on_translog_error(&self, error: TranslogError) -> ShardError {
        let tragic = self
            .translog
            .get()
            .is_some_and(|translog| translog.tragic_event().is_some());
        if tragic {
            self.fail_shard(&format!("translog failure: {error}"));
        }
        ShardError::Translog(error)
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Under `async` durability, fsync the translog every sync interval.
    fn start_sync_task(self: &Arc<Self>) {
        let shard: Weak<Self> = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            loop {
                let interval = match shard.upgrade() {
                    Some(shard) => shard.settings().sync_interval(),
                    None => return,
                };
                tokio::time::sleep(interval).await;

                let Some(shard) = shard.upgrade() else {
                    return;
                };
                if shard.state() != ShardState::Started {
                    return;
                }
                let needed = shard.settings().durability == Durability::Async
                    && shard.translog.get().is_some_and(|t| t.sync_needed());
                if !needed {
                    continue;
                }
                let background = Arc::clone(&shard);
                match tokio::task::spawn_blocking(move || background.sync_translog()).await {
                    Ok(Ok(())) => debug!(shard_id = %shard.shard_id, "Background translog sync"),
                    Ok(Err(e)) => {
                        warn!(shard_id = %shard.shard_id, error = %e, "Background translog sync failed")
                    }
                    Err(e) => warn!(shard_id = %shard.shard_id, error = %e, "Background sync task failed"),
                }
            }
        });
        lock(&self.background_tasks).push(task);
    }

    /// Run the idle check with the configured `inactive_after` on every
    /// tick, so an idle shard gets its synced flush without outside help.
    fn start_idle_task(self: &Arc<Self>) {
        let shard: Weak<Self> = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            loop {
                let tick = match shard.upgrade() {
                    Some(shard) => shard.settings().inactive_after().min(IDLE_CHECK_INTERVAL),
                    None => return,
                };
                tokio::time::sleep(tick).await;

                let Some(shard) = shard.upgrade() else {
                    return;
                };
                if shard.state() != ShardState::Started {
                    return;
                }
                let inactive_after = shard.settings().inactive_after();
                if shard.check_idle(inactive_after) {
                    debug!(shard_id = %shard.shard_id, "Scheduled synced flush for idle shard");
                }
            }
        });
        lock(&self.background_tasks).push(task);
    }

    fn transition(&self, from: ShardState, to: ShardState) -> ShardResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ShardError::IllegalState {
                expected: from,
                actual: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn ensure_started(&self) -> ShardResult<()> {
        match self.state() {
            ShardState::Started => Ok(()),
            ShardState::Closed => Err(ShardError::Closed(self.shard_id.clone())),
            actual => Err(ShardError::IllegalState {
                expected: ShardState::Started,
                actual,
            }),
        }
    }
}

impl Drop for IndexShard {
    fn drop(&mut self) {
        for task in lock(&self.background_tasks).drain(..) {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

