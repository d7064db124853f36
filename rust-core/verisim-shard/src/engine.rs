// SPDX-License-Identifier: PMPL-1.0-or-later
//! The indexing engine boundary.
//!
//! The shard only needs an engine that can apply operations idempotently,
//! make them durable with a commit, report its last commit, and tell the
//! shard how much memory its segments hold. [`MemoryEngine`] is a small
//! reference engine that keeps documents in memory, simulates segments by
//! refresh and merge, and persists commits as JSON.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use verisim_translog::{Operation, SeqNo};

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("engine is closed")]
    Closed,
}

/// What a commit makes durable, and where translog replay must start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPoint {
    /// History the commit belongs to.
    pub translog_uuid: Uuid,
    /// Generations below this one were covered when the commit was made.
    pub translog_generation: u64,
    /// Every operation at or below this sequence number is in the commit.
    pub local_checkpoint: SeqNo,
    pub max_seq_no: SeqNo,
    /// Set by a synced flush of an idle shard.
    pub sync_id: Option<String>,
}

/// Receives segment-memory deltas from an engine.
pub trait SegmentMemoryListener: Send + Sync {
    fn on_segment_memory_delta(&self, delta: i64);
}

/// Outcome of applying one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The engine already holds this or a newer version of the document.
    Skipped,
}

/// The storage engine a shard writes through.
pub trait Engine: Send + Sync {
    /// The most recent durable commit, `None` for an empty store.
    fn last_commit(&self) -> Result<Option<CommitPoint>, EngineError>;

    /// Apply an operation. Re-applying an operation that is already
    /// reflected must be a no-op.
    fn apply(&self, operation: &Operation) -> Result<ApplyOutcome, EngineError>;

    /// Make buffered changes visible as a new segment.
    fn refresh(&self) -> Result<(), EngineError>;

    /// Durably persist every applied operation together with `commit`.
    fn commit(&self, commit: CommitPoint) -> Result<(), EngineError>;

    /// Memory held by live segments, as the engine sees it.
    fn segment_memory_bytes(&self) -> i64;

    /// Install the listener for segment-memory deltas. Memory already held
    /// is reported to it immediately.
    fn set_segment_memory_listener(&self, listener: Arc<dyn SegmentMemoryListener>);

    /// Drop all segments. Their memory is reported as released.
    fn close(&self) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

const COMMIT_FILE_NAME: &str = "commit.json";

/// Fixed cost of a segment, in bytes.
const SEGMENT_OVERHEAD_BYTES: i64 = 256;

/// Cost of one document in a segment, in bytes.
const DOC_BYTES: i64 = 48;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub seq_no: SeqNo,
    /// `None` for a tombstone.
    pub source: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct Segment {
    id: u64,
    docs: usize,
    memory_bytes: i64,
}

#[derive(Default)]
struct EngineState {
    docs: BTreeMap<String, StoredDoc>,
    /// Changes applied since the last refresh.
    buffered: usize,
    segments: Vec<Segment>,
    last_commit: Option<CommitPoint>,
    closed: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedCommit {
    commit: CommitPoint,
    docs: BTreeMap<String, StoredDoc>,
}

/// In-memory reference engine with JSON commits.
pub struct MemoryEngine {
    path: PathBuf,
    state: Mutex<EngineState>,
    listener: RwLock<Option<Arc<dyn SegmentMemoryListener>>>,
    segment_memory: AtomicI64,
    next_segment_id: AtomicU64,
    applied: AtomicU64,
}

impl MemoryEngine {
    /// Open the engine at `path`, loading the last commit if one exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let engine = Self {
            path,
            state: Mutex::new(EngineState::default()),
            listener: RwLock::new(None),
            segment_memory: AtomicI64::new(0),
            next_segment_id: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        };

        let commit_path = engine.path.join(COMMIT_FILE_NAME);
        if commit_path.exists() {
            let persisted: PersistedCommit = serde_json::from_slice(&fs::read(&commit_path)?)?;
            let docs = persisted.docs.len();
            {
                let mut state = engine.lock();
                state.buffered = docs;
                state.docs = persisted.docs;
                state.last_commit = Some(persisted.commit);
                engine.refresh_locked(&mut state);
            }
            info!(path = %engine.path.display(), docs, "Loaded engine commit");
        }
        Ok(engine)
    }

    /// Current version of a document; `None` if absent or deleted.
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().docs.get(id).and_then(|doc| doc.source.clone())
    }

    /// Number of live (non-deleted) documents.
    pub fn doc_count(&self) -> usize {
        self.lock()
            .docs
            .values()
            .filter(|doc| doc.source.is_some())
            .count()
    }

    /// Every stored document, tombstones included.
    pub fn docs(&self) -> BTreeMap<String, StoredDoc> {
        self.lock().docs.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.lock().segments.len()
    }

    /// Operations applied (not skipped) since open.
    pub fn applied_operations(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Merge all segments into one.
    pub fn force_merge(&self) {
        let mut state = self.lock();
        if state.segments.len() < 2 {
            return;
        }
        let before: i64 = state.segments.iter().map(|s| s.memory_bytes).sum();
        let docs = state.docs.len();
        let merged = Segment {
            id: self.next_segment_id.fetch_add(1, Ordering::AcqRel),
            docs,
            memory_bytes: segment_memory(docs),
        };
        let delta = merged.memory_bytes - before;
        debug!(
            merged_segments = state.segments.len(),
            segment_id = merged.id,
            delta,
            "Merged segments"
        );
        state.segments = vec![merged];
        self.report(delta);
    }

    fn refresh_locked(&self, state: &mut EngineState) {
        if state.buffered == 0 {
            return;
        }
        let segment = Segment {
            id: self.next_segment_id.fetch_add(1, Ordering::AcqRel),
            docs: state.buffered,
            memory_bytes: segment_memory(state.buffered),
        };
        state.buffered = 0;
        debug!(segment_id = segment.id, docs = segment.docs, "Created segment");
        self.report(segment.memory_bytes);
        state.segments.push(segment);
    }

    fn report(&self, delta: i64) {
        self.segment_memory.fetch_add(delta, Ordering::AcqRel);
        let listener = self.listener.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = listener.as_ref() {
            listener.on_segment_memory_delta(delta);
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn segment_memory(docs: usize) -> i64 {
    SEGMENT_OVERHEAD_BYTES + DOC_BYTES * docs as i64
}

impl Engine for MemoryEngine {
    fn last_commit(&self) -> Result<Option<CommitPoint>, EngineError> {
        Ok(self.lock().last_commit.clone())
    }

    fn apply(&self, operation: &Operation) -> Result<ApplyOutcome, EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        let (id, source) = match operation {
            Operation::Index { id, source, .. } => (id, Some(source.clone())),
            Operation::Delete { id, .. } => (id, None),
            Operation::NoOp { .. } => return Ok(ApplyOutcome::Applied),
        };
        let seq_no = operation.seq_no();
        if state.docs.get(id).is_some_and(|doc| doc.seq_no >= seq_no) {
            return Ok(ApplyOutcome::Skipped);
        }
        state.docs.insert(id.clone(), StoredDoc { seq_no, source });
        state.buffered += 1;
        self.applied.fetch_add(1, Ordering::AcqRel);
        Ok(ApplyOutcome::Applied)
    }

    fn refresh(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        self.refresh_locked(&mut state);
        Ok(())
    }

    fn commit(&self, commit: CommitPoint) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        self.refresh_locked(&mut state);

        let persisted = PersistedCommit {
            commit,
            docs: state.docs.clone(),
        };
        let commit_path = self.path.join(COMMIT_FILE_NAME);
        let tmp_path = self.path.join(format!("{COMMIT_FILE_NAME}.tmp"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&serde_json::to_vec(&persisted)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &commit_path)?;
        #[cfg(unix)]
        fs::File::open(&self.path)?.sync_all()?;

        debug!(
            local_checkpoint = persisted.commit.local_checkpoint,
            translog_generation = persisted.commit.translog_generation,
            sync_id = ?persisted.commit.sync_id,
            "Committed engine"
        );
        state.last_commit = Some(persisted.commit);
        Ok(())
    }

    fn segment_memory_bytes(&self) -> i64 {
        self.segment_memory.load(Ordering::Acquire)
    }

    fn set_segment_memory_listener(&self, listener: Arc<dyn SegmentMemoryListener>) {
        // Hold the state lock so no segment change slips between the
        // catch-up report and installation.
        let _state = self.lock();
        listener.on_segment_memory_delta(self.segment_memory_bytes());
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn close(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let released: i64 = state.segments.drain(..).map(|s| s.memory_bytes).sum();
        self.report(-released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use verisim_translog::NO_OPS_PERFORMED;

    struct Recorder(AtomicI64);

    impl SegmentMemoryListener for Recorder {
        fn on_segment_memory_delta(&self, delta: i64) {
            self.0.fetch_add(delta, Ordering::SeqCst);
        }
    }

    fn index(seq_no: SeqNo, id: &str) -> Operation {
        Operation::Index {
            seq_no,
            primary_term: 1,
            id: id.to_string(),
            source: format!("v{seq_no}").into_bytes(),
        }
    }

    fn commit_point() -> CommitPoint {
        CommitPoint {
            translog_uuid: Uuid::new_v4(),
            translog_generation: 2,
            local_checkpoint: 1,
            max_seq_no: 1,
            sync_id: None,
        }
    }

    #[test]
    fn test_apply_is_idempotent_by_seq_no() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::open(dir.path()).unwrap();

        assert_eq!(engine.apply(&index(3, "a")).unwrap(), ApplyOutcome::Applied);
        assert_eq!(engine.apply(&index(3, "a")).unwrap(), ApplyOutcome::Skipped);
        assert_eq!(engine.apply(&index(1, "a")).unwrap(), ApplyOutcome::Skipped);
        assert_eq!(engine.get("a"), Some(b"v3".to_vec()));

        let delete = Operation::Delete {
            seq_no: 4,
            primary_term: 1,
            id: "a".to_string(),
        };
        engine.apply(&delete).unwrap();
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.doc_count(), 0);
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = MemoryEngine::open(dir.path()).unwrap();
            assert_eq!(engine.last_commit().unwrap(), None);
            engine.apply(&index(0, "a")).unwrap();
            engine.apply(&index(1, "b")).unwrap();
            engine.commit(commit_point()).unwrap();
        }

        let engine = MemoryEngine::open(dir.path()).unwrap();
        let commit = engine.last_commit().unwrap().unwrap();
        assert_eq!(commit.local_checkpoint, 1);
        assert_eq!(engine.doc_count(), 2);
        assert!(engine.segment_memory_bytes() > 0);
    }

    #[test]
    fn test_segment_memory_reported_to_listener() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::open(dir.path()).unwrap();
        let recorder = Arc::new(Recorder(AtomicI64::new(0)));
        engine.set_segment_memory_listener(recorder.clone());

        for seq_no in 0..5 {
            engine.apply(&index(seq_no, &format!("doc-{seq_no}"))).unwrap();
            engine.refresh().unwrap();
        }
        assert_eq!(engine.segment_count(), 5);
        assert_eq!(recorder.0.load(Ordering::SeqCst), engine.segment_memory_bytes());

        engine.force_merge();
        assert_eq!(engine.segment_count(), 1);
        assert_eq!(recorder.0.load(Ordering::SeqCst), engine.segment_memory_bytes());

        engine.close().unwrap();
        assert_eq!(engine.segment_memory_bytes(), 0);
        assert_eq!(recorder.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let engine = MemoryEngine::open(dir.path()).unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.apply(&index(0, "a")),
            Err(EngineError::Closed)
        ));
        let mut commit = commit_point();
        commit.local_checkpoint = NO_OPS_PERFORMED;
        assert!(matches!(engine.commit(commit), Err(EngineError::Closed)));
    }
}
