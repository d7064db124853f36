// SPDX-License-Identifier: PMPL-1.0-or-later
//! End-to-end tests of the shard durability lifecycle.
//!
//! Each test runs a real [`IndexShard`] over a [`MemoryEngine`] and an
//! on-disk translog in a temporary directory. Crashes are simulated by
//! dropping the shard without closing it and reopening the engine from its
//! last commit.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::oneshot;
use verisim_shard::{
    ApplyOutcome, CircuitBreaker, CommitPoint, Durability, Engine, EngineError, FlushRequest,
    IndexShard, ListenerError, MemoryEngine, SegmentMemoryListener, SeqNo, ShardConfig,
    ShardError, ShardId, ShardSettings, ShardState, UNASSIGNED_SEQ_NO,
};
use verisim_translog::{
    generation_path, Checkpoint, Operation, Translog, TranslogConfig, CHECKPOINT_FILE_NAME,
};

struct TestShard {
    shard: Arc<IndexShard>,
    engine: Arc<MemoryEngine>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("verisim_shard=debug,verisim_translog=debug")
        .try_init();
}

fn config(dir: &TempDir, settings: ShardSettings) -> ShardConfig {
    ShardConfig {
        settings,
        ..ShardConfig::new(ShardId::new("products", 0), dir.path())
    }
}

fn open_shard(dir: &TempDir, settings: ShardSettings, breaker: Arc<CircuitBreaker>) -> TestShard {
    init_tracing();
    let engine = Arc::new(MemoryEngine::open(dir.path().join("index")).unwrap());
    let shard = IndexShard::open(config(dir, settings), engine.clone(), breaker).unwrap();
    TestShard { shard, engine }
}

fn start_shard(dir: &TempDir, settings: ShardSettings) -> TestShard {
    let test = open_shard(dir, settings, Arc::new(CircuitBreaker::new("accounting", i64::MAX)));
    test.shard.recover_from_store().unwrap();
    test
}

fn write_docs(shard: &Arc<IndexShard>, range: std::ops::Range<usize>) {
    for i in range {
        shard
            .index(&format!("doc-{i}"), format!("{{\"n\":{i}}}").into_bytes())
            .unwrap();
    }
}

async fn assert_busy<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_maintenance(shard: &Arc<IndexShard>) {
    let shard = Arc::clone(shard);
    assert_busy("maintenance to finish", move || !shard.is_flush_or_roll_running()).await;
}

/// Hammer `after_write_operation` from several threads at once and return
/// how many calls scheduled maintenance.
fn race_after_write(shard: &Arc<IndexShard>, threads: usize) -> usize {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let shard = Arc::clone(shard);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                (0..200)
                    .filter(|_| {
                        let scheduled = shard.after_write_operation();
                        std::thread::yield_now();
                        scheduled
                    })
                    .count()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).sum()
}

/// Delegates to a [`MemoryEngine`] but can be told to fail commits.
struct FlakyCommitEngine {
    inner: MemoryEngine,
    fail_commits: AtomicBool,
}

impl Engine for FlakyCommitEngine {
    fn last_commit(&self) -> Result<Option<CommitPoint>, EngineError> {
        self.inner.last_commit()
    }

    fn apply(&self, operation: &Operation) -> Result<ApplyOutcome, EngineError> {
        self.inner.apply(operation)
    }

    fn refresh(&self) -> Result<(), EngineError> {
        self.inner.refresh()
    }

    fn commit(&self, commit: CommitPoint) -> Result<(), EngineError> {
        if self.fail_commits.load(Ordering::Acquire) {
            return Err(EngineError::Io(std::io::Error::other("disk full")));
        }
        self.inner.commit(commit)
    }

    fn segment_memory_bytes(&self) -> i64 {
        self.inner.segment_memory_bytes()
    }

    fn set_segment_memory_listener(&self, listener: Arc<dyn SegmentMemoryListener>) {
        self.inner.set_segment_memory_listener(listener);
    }

    fn close(&self) -> Result<(), EngineError> {
        self.inner.close()
    }
}

// ===========================================================================
// Durability
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_request_durability_syncs_before_returning() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());

    let result = test.shard.index("a", b"{}".to_vec()).unwrap();
    assert_eq!(result.seq_no, 0);
    assert!(result.synced);
    assert!(!test.shard.translog().unwrap().sync_needed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_only_sees_durable_operations() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    let checkpoint_path = dir.path().join("translog").join(CHECKPOINT_FILE_NAME);

    let (tx, rx) = oneshot::channel::<(SeqNo, SeqNo)>();
    test.shard
        .add_global_checkpoint_listener(
            0,
            Box::new(move |checkpoint, _| {
                let persisted = Checkpoint::read(&checkpoint_path).unwrap();
                let _ = tx.send((checkpoint, persisted.max_seqno));
            }),
            None,
        )
        .unwrap();

    test.shard.index("a", b"{}".to_vec()).unwrap();
    let (checkpoint, persisted_max) = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint, 0);
    assert!(persisted_max >= 0, "seq_no 0 reached the global checkpoint before its fsync");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_durability_syncs_in_background() {
    let dir = TempDir::new().unwrap();
    let settings = ShardSettings {
        sync_interval_ms: 200,
        ..ShardSettings::default()
    };
    let test = start_shard(&dir, settings.clone());

    test.shard
        .update_settings(ShardSettings {
            durability: Durability::Async,
            ..settings
        })
        .unwrap();
    let result = test.shard.index("a", b"{}".to_vec()).unwrap();
    assert!(!result.synced);
    let translog = test.shard.translog().unwrap();
    assert!(translog.sync_needed());

    assert_busy("background sync", || !translog.sync_needed()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_settings_rejected() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());

    let result = test.shard.update_settings(ShardSettings {
        flush_threshold_size: 0,
        ..ShardSettings::default()
    });
    assert!(matches!(result, Err(ShardError::Settings(_))));
    assert_eq!(test.shard.settings(), ShardSettings::default());
}

// ===========================================================================
// Flush and roll policy
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_flush_bounds_uncommitted_translog() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            flush_threshold_size: 256,
            ..ShardSettings::default()
        },
    );

    write_docs(&test.shard, 0..20);

    let shard = Arc::clone(&test.shard);
    assert_busy("periodic flush to settle", move || {
        let stats = shard.stats();
        stats.flush.periodic >= 1 && stats.translog.uncommitted_size_in_bytes <= 256
    })
    .await;

    let stats = test.shard.stats();
    assert!(stats.flush.total >= stats.flush.periodic);
    let commit = test.engine.last_commit().unwrap().unwrap();
    assert!(commit.local_checkpoint >= 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generation_rolls_without_flushing() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            generation_threshold_size: 128,
            ..ShardSettings::default()
        },
    );
    let initial_generation = test.shard.translog().unwrap().current_file_generation();

    write_docs(&test.shard, 0..20);

    let translog = test.shard.translog().unwrap();
    assert_busy("generation roll", || {
        translog.current_file_generation() >= initial_generation + 2
    })
    .await;

    let stats = test.shard.stats();
    assert_eq!(stats.flush.total, 0);
    assert_eq!(stats.translog.num_ops, 20);
    assert_eq!(stats.translog.uncommitted_ops, 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_each_roll_advances_generation_by_one() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            generation_threshold_size: 200,
            ..ShardSettings::default()
        },
    );
    let translog = test.shard.translog().unwrap();
    let initial_generation = translog.current_file_generation();

    let mut rolls = 0;
    for i in 0..20 {
        test.shard
            .apply_index_operation_on_primary(&format!("doc-{i}"), b"{\"n\":1}".to_vec())
            .unwrap();
        let due = test.shard.should_roll_generation();
        let scheduled = test.shard.after_write_operation();
        assert_eq!(scheduled, due);
        if scheduled {
            rolls += 1;
            wait_for_maintenance(&test.shard).await;
            assert!(!test.shard.should_roll_generation());
        }
        assert_eq!(translog.current_file_generation(), initial_generation + rolls);
    }

    assert!(rolls >= 2);
    assert_eq!(test.shard.flush_stats().total, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_minimum_generation_threshold_settles_after_one_roll() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    assert!(matches!(
        test.shard.update_settings(ShardSettings {
            generation_threshold_size: 16,
            ..ShardSettings::default()
        }),
        Err(ShardError::Settings(_))
    ));
    test.shard
        .update_settings(ShardSettings {
            generation_threshold_size: 64,
            ..ShardSettings::default()
        })
        .unwrap();

    let translog = test.shard.translog().unwrap();
    let initial_generation = translog.current_file_generation();
    test.shard.index("a", b"{}".to_vec()).unwrap();

    wait_for_maintenance(&test.shard).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!test.shard.is_flush_or_roll_running());
    assert_eq!(translog.current_file_generation(), initial_generation + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_checks_schedule_one_flush() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            flush_threshold_size: 300,
            ..ShardSettings::default()
        },
    );
    let initial_generation = test.shard.translog().unwrap().current_file_generation();

    let mut i = 0;
    while !test.shard.should_periodically_flush() {
        test.shard
            .apply_index_operation_on_primary(&format!("doc-{i}"), b"{}".to_vec())
            .unwrap();
        i += 1;
    }

    assert_eq!(race_after_write(&test.shard, 4), 1);
    wait_for_maintenance(&test.shard).await;

    let stats = test.shard.stats();
    assert_eq!(stats.flush.periodic, 1);
    assert_eq!(stats.flush.total, 1);
    assert_eq!(stats.translog.uncommitted_ops, 0);
    assert_eq!(stats.translog.current_generation, initial_generation + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_checks_schedule_one_roll() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            generation_threshold_size: 200,
            ..ShardSettings::default()
        },
    );
    let translog = test.shard.translog().unwrap();
    let initial_generation = translog.current_file_generation();

    let mut i = 0;
    while !test.shard.should_roll_generation() {
        test.shard
            .apply_index_operation_on_primary(&format!("doc-{i}"), b"{}".to_vec())
            .unwrap();
        i += 1;
    }

    assert_eq!(race_after_write(&test.shard, 4), 1);
    wait_for_maintenance(&test.shard).await;

    assert_eq!(translog.current_file_generation(), initial_generation + 1);
    assert_eq!(test.shard.flush_stats().total, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_flush_counts_in_total_only() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());

    assert!(!test.shard.flush(FlushRequest::default()).unwrap());

    write_docs(&test.shard, 0..3);
    assert!(test.shard.flush(FlushRequest::default()).unwrap());
    assert!(test
        .shard
        .flush(FlushRequest {
            force: true,
            wait_if_ongoing: true
        })
        .unwrap());

    let stats = test.shard.stats();
    assert_eq!(stats.flush.total, 2);
    assert_eq!(stats.flush.periodic, 0);
    assert_eq!(stats.translog.uncommitted_ops, 0);
    assert_eq!(stats.translog.num_ops, 0);

    let commit = test.engine.last_commit().unwrap().unwrap();
    assert_eq!(commit.local_checkpoint, 2);
    assert_eq!(commit.max_seq_no, 2);
}

// ===========================================================================
// Idle shards
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_shard_gets_synced_flush_once() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    write_docs(&test.shard, 0..2);

    assert!(!test.shard.check_idle(Duration::from_secs(3600)));
    assert!(test.shard.check_idle(Duration::ZERO));

    let shard = Arc::clone(&test.shard);
    assert_busy("synced flush", move || shard.sync_id().is_some()).await;
    let sync_id = test.shard.sync_id().unwrap();
    let commit = test.engine.last_commit().unwrap().unwrap();
    assert_eq!(commit.sync_id.as_deref(), Some(sync_id.as_str()));
    assert!(!test.shard.is_active());

    assert!(!test.shard.check_idle(Duration::ZERO));

    test.shard.index("doc-9", b"{}".to_vec()).unwrap();
    assert!(test.shard.sync_id().is_none());
    assert!(test.shard.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_background_idle_check_uses_configured_inactivity() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(
        &dir,
        ShardSettings {
            inactive_after_ms: 100,
            ..ShardSettings::default()
        },
    );
    write_docs(&test.shard, 0..2);

    let shard = Arc::clone(&test.shard);
    assert_busy("background synced flush", move || shard.sync_id().is_some()).await;
    let commit = test.engine.last_commit().unwrap().unwrap();
    assert_eq!(commit.sync_id, test.shard.sync_id());
    assert_eq!(commit.local_checkpoint, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_synced_flush_is_retried() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let engine = Arc::new(FlakyCommitEngine {
        inner: MemoryEngine::open(dir.path().join("index")).unwrap(),
        fail_commits: AtomicBool::new(false),
    });
    let shard = IndexShard::open(
        config(&dir, ShardSettings::default()),
        engine.clone(),
        Arc::new(CircuitBreaker::new("accounting", i64::MAX)),
    )
    .unwrap();
    shard.recover_from_store().unwrap();
    write_docs(&shard, 0..2);

    engine.fail_commits.store(true, Ordering::Release);
    assert!(shard.check_idle(Duration::ZERO));
    wait_for_maintenance(&shard).await;
    assert!(shard.is_active());
    assert!(shard.sync_id().is_none());

    engine.fail_commits.store(false, Ordering::Release);
    assert!(shard.check_idle(Duration::ZERO));
    let waiting = Arc::clone(&shard);
    assert_busy("retried synced flush", move || waiting.sync_id().is_some()).await;
    assert_eq!(
        engine.last_commit().unwrap().unwrap().sync_id,
        shard.sync_id()
    );
}

// ===========================================================================
// Global checkpoint listeners
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_at_or_below_checkpoint_runs_immediately() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    write_docs(&test.shard, 0..3);
    assert_eq!(test.shard.global_checkpoint(), 2);

    let (tx, rx) = std::sync::mpsc::channel();
    test.shard
        .add_global_checkpoint_listener(
            1,
            Box::new(move |checkpoint, error| {
                tx.send((checkpoint, error)).unwrap();
            }),
            None,
        )
        .unwrap();

    assert_eq!(rx.try_recv().unwrap(), (2, None));
    assert_eq!(test.shard.pending_listeners(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_fires_when_replica_catches_up() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    write_docs(&test.shard, 0..1);
    test.shard.add_in_sync_copy("replica-1", 0).unwrap();

    write_docs(&test.shard, 1..3);
    assert_eq!(test.shard.local_checkpoint(), 2);
    assert_eq!(test.shard.global_checkpoint(), 0);

    let (tx, rx) = oneshot::channel::<(SeqNo, Option<ListenerError>)>();
    test.shard
        .add_global_checkpoint_listener(
            2,
            Box::new(move |checkpoint, error| {
                let _ = tx.send((checkpoint, error));
            }),
            None,
        )
        .unwrap();
    assert_eq!(test.shard.pending_listeners(), 1);

    test.shard.update_copy_local_checkpoint("replica-1", 2).unwrap();
    let fired = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired, (2, None));
    assert_eq!(test.shard.global_checkpoint(), 2);
    assert_eq!(
        test.shard.translog().unwrap().global_checkpoint(),
        2,
        "global checkpoint is persisted with the translog"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removing_lagging_copy_advances_checkpoint() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    test.shard.add_in_sync_copy("replica-1", -1).unwrap();
    write_docs(&test.shard, 0..4);
    assert_eq!(test.shard.global_checkpoint(), -1);

    test.shard.remove_copy("replica-1").unwrap();
    assert_eq!(test.shard.global_checkpoint(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_times_out() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());

    let (tx, rx) = oneshot::channel::<(SeqNo, Option<ListenerError>)>();
    let timeout = Duration::from_millis(50);
    test.shard
        .add_global_checkpoint_listener(
            100,
            Box::new(move |checkpoint, error| {
                let _ = tx.send((checkpoint, error));
            }),
            Some(timeout),
        )
        .unwrap();

    let fired = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired, (UNASSIGNED_SEQ_NO, Some(ListenerError::Timeout(timeout))));
    assert_eq!(test.shard.pending_listeners(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_fails_pending_listeners_and_writes() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());

    let (tx, rx) = oneshot::channel::<(SeqNo, Option<ListenerError>)>();
    test.shard
        .add_global_checkpoint_listener(
            100,
            Box::new(move |checkpoint, error| {
                let _ = tx.send((checkpoint, error));
            }),
            None,
        )
        .unwrap();

    test.shard.close("test", false).unwrap();
    assert_eq!(test.shard.state(), ShardState::Closed);

    let fired = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        fired,
        (
            UNASSIGNED_SEQ_NO,
            Some(ListenerError::ShardClosed(ShardId::new("products", 0)))
        )
    );

    assert!(matches!(
        test.shard.index("late", b"{}".to_vec()),
        Err(ShardError::Closed(_))
    ));
    assert!(test
        .shard
        .add_global_checkpoint_listener(0, Box::new(|_, _| {}), None)
        .is_err());
    test.shard.close("again", true).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listeners_released_together_fire_in_target_order() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    test.shard.add_in_sync_copy("replica-1", -1).unwrap();
    write_docs(&test.shard, 0..4);
    assert_eq!(test.shard.global_checkpoint(), -1);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(SeqNo, SeqNo)>();
    for target in [3, 1, 2] {
        let tx = tx.clone();
        test.shard
            .add_global_checkpoint_listener(
                target,
                Box::new(move |checkpoint, error| {
                    assert!(error.is_none());
                    let _ = tx.send((target, checkpoint));
                }),
                None,
            )
            .unwrap();
    }
    assert_eq!(test.shard.pending_listeners(), 3);

    test.shard.update_copy_local_checkpoint("replica-1", 3).unwrap();
    let mut fired = Vec::new();
    for _ in 0..3 {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        fired.push(next);
    }
    assert_eq!(fired, vec![(1, 3), (2, 3), (3, 3)]);
}

// ===========================================================================
// Breaker accounting
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_tracks_segment_memory_across_shards() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let breaker = Arc::new(CircuitBreaker::new("accounting", i64::MAX));

    let first = open_shard(&first_dir, ShardSettings::default(), Arc::clone(&breaker));
    let second = open_shard(&second_dir, ShardSettings::default(), Arc::clone(&breaker));
    first.shard.recover_from_store().unwrap();
    second.shard.recover_from_store().unwrap();

    write_docs(&first.shard, 0..5);
    write_docs(&second.shard, 0..2);
    first.shard.flush(FlushRequest::default()).unwrap();
    second.shard.flush(FlushRequest::default()).unwrap();

    let first_memory = first.engine.segment_memory_bytes();
    let second_memory = second.engine.segment_memory_bytes();
    assert!(first_memory > 0);
    assert_eq!(first.shard.accounting().used(), first_memory);
    assert_eq!(first.shard.stats().breaker_used_bytes, first_memory);
    assert_eq!(breaker.used(), first_memory + second_memory);

    first.shard.close("test", false).unwrap();
    assert_eq!(breaker.used(), second_memory);
    second.shard.close("test", true).unwrap();
    assert_eq!(breaker.used(), 0);
}

// ===========================================================================
// Recovery
// ===========================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_recovery_replays_uncommitted_operations() {
    let dir = TempDir::new().unwrap();
    {
        let test = start_shard(&dir, ShardSettings::default());
        write_docs(&test.shard, 0..10);
        test.shard.flush(FlushRequest::default()).unwrap();
        write_docs(&test.shard, 10..20);
        test.shard.delete("doc-3").unwrap();
    }

    let test = start_shard(&dir, ShardSettings::default());
    assert_eq!(test.shard.state(), ShardState::Started);
    assert_eq!(test.shard.local_checkpoint(), 20);
    assert_eq!(test.shard.max_seq_no(), 20);
    assert_eq!(test.shard.global_checkpoint(), 20);
    assert_eq!(test.engine.doc_count(), 19);
    assert!(test.engine.get("doc-3").is_none());
    assert_eq!(test.engine.get("doc-15").unwrap(), b"{\"n\":15}".to_vec());
    assert_eq!(test.shard.stats().translog.uncommitted_ops, 11);

    let next = test.shard.index("doc-20", b"{}".to_vec()).unwrap();
    assert_eq!(next.seq_no, 21);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replaying_translog_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    {
        let test = start_shard(&dir, ShardSettings::default());
        write_docs(&test.shard, 0..6);
    }

    let test = start_shard(&dir, ShardSettings::default());
    let docs = test.engine.docs();
    let checkpoint = test.shard.local_checkpoint();

    assert_eq!(test.shard.run_translog_recovery(0).unwrap(), 6);
    assert_eq!(test.engine.docs(), docs);
    assert_eq!(test.shard.local_checkpoint(), checkpoint);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recovery_fills_sequence_number_gaps() {
    let dir = TempDir::new().unwrap();
    {
        let test = start_shard(&dir, ShardSettings::default());
        write_docs(&test.shard, 0..3);
    }

    // Seq nos 3 and 4 were handed out but never reached the translog.
    {
        let engine = MemoryEngine::open(dir.path().join("index")).unwrap();
        let uuid = engine.last_commit().unwrap().unwrap().translog_uuid;
        let translog = Translog::open(
            dir.path().join("translog"),
            TranslogConfig::default(),
            Some(uuid),
        )
        .unwrap();
        translog
            .add(&Operation::Index {
                seq_no: 5,
                primary_term: 1,
                id: "doc-5".to_string(),
                source: b"{}".to_vec(),
            })
            .unwrap();
        translog.sync().unwrap();
    }

    let test = start_shard(&dir, ShardSettings::default());
    assert_eq!(test.shard.max_seq_no(), 5);
    assert_eq!(test.shard.local_checkpoint(), 5);
    assert_eq!(test.engine.doc_count(), 4);
    assert_eq!(test.shard.index("doc-6", b"{}".to_vec()).unwrap().seq_no, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_translog_fails_recovery() {
    let dir = TempDir::new().unwrap();
    let generation = {
        let test = start_shard(&dir, ShardSettings::default());
        write_docs(&test.shard, 0..3);
        test.shard.translog().unwrap().current_file_generation()
    };

    let path = generation_path(&dir.path().join("translog"), generation);
    let mut data = fs::read(&path).unwrap();
    data[60] ^= 0xFF;
    fs::write(&path, &data).unwrap();

    let test = open_shard(
        &dir,
        ShardSettings::default(),
        Arc::new(CircuitBreaker::new("accounting", i64::MAX)),
    );
    let error = test.shard.recover_from_store().unwrap_err();
    assert!(matches!(error, ShardError::Recovery { .. }));
    assert!(error.to_string().starts_with("[products][0] recovery failed"));
    assert_eq!(test.shard.state(), ShardState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recover_twice_is_illegal() {
    let dir = TempDir::new().unwrap();
    let test = start_shard(&dir, ShardSettings::default());
    assert!(matches!(
        test.shard.recover_from_store(),
        Err(ShardError::IllegalState {
            expected: ShardState::Created,
            actual: ShardState::Started,
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_close_reopens_without_replay() {
    let dir = TempDir::new().unwrap();
    {
        let test = start_shard(&dir, ShardSettings::default());
        write_docs(&test.shard, 0..4);
        test.shard.close("shutdown", true).unwrap();
    }

    let test = start_shard(&dir, ShardSettings::default());
    assert_eq!(test.shard.local_checkpoint(), 3);
    assert_eq!(test.engine.applied_operations(), 0);
    assert_eq!(test.engine.doc_count(), 4);
}
