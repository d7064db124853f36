// SPDX-License-Identifier: PMPL-1.0-or-later
//! Global checkpoint listeners.
//!
//! Collaborators register a callback that should run once the shard's global
//! checkpoint reaches a target sequence number. Each listener fires exactly
//! once: on success, on timeout, or when the shard closes. Whichever of those
//! removes the entry from the pending map under the state lock wins.
//!
//! Callbacks never run while the state lock is held. Fired listeners are
//! queued on an unbounded channel drained by a single consumer task, so the
//! order in which they were fired is the order in which they run and a slow
//! callback cannot hold up checkpoint advancement.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use verisim_translog::{SeqNo, UNASSIGNED_SEQ_NO};

use crate::error::ListenerError;
use crate::shard_id::ShardId;

/// Callback invoked with the reached checkpoint, or with
/// `UNASSIGNED_SEQ_NO` and an error.
pub type ListenerCallback = Box<dyn FnOnce(SeqNo, Option<ListenerError>) + Send + 'static>;

struct PendingListener {
    callback: ListenerCallback,
    timer: Option<JoinHandle<()>>,
}

/// Pending listeners keyed by `(target, registration id)`, so iteration
/// order is ascending target.
struct ListenerState {
    closed: bool,
    last_known: SeqNo,
    next_id: u64,
    pending: BTreeMap<(SeqNo, u64), PendingListener>,
}

struct Notification {
    callback: ListenerCallback,
    checkpoint: SeqNo,
    error: Option<ListenerError>,
}

struct Shared {
    shard_id: ShardId,
    state: Mutex<ListenerState>,
    executor: mpsc::UnboundedSender<Notification>,
}

/// The per-shard registry of global checkpoint listeners.
pub struct GlobalCheckpointListeners {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl GlobalCheckpointListeners {
    /// Create the registry and spawn its notification task on `runtime`.
    pub fn new(shard_id: ShardId, last_known: SeqNo, runtime: Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Notification>();

        let executor_shard = shard_id.clone();
        runtime.spawn(async move {
            while let Some(notification) = receiver.recv().await {
                run_callback(&executor_shard, notification);
            }
        });

        Self {
            shared: Arc::new(Shared {
                shard_id,
                state: Mutex::new(ListenerState {
                    closed: false,
                    last_known,
                    next_id: 0,
                    pending: BTreeMap::new(),
                }),
                executor: sender,
            }),
            runtime,
        }
    }

    /// Register `callback` for `target`.
    ///
    /// If the global checkpoint already reached `target` the callback runs
    /// before this returns, on the calling thread. Otherwise it waits for a
    /// later [`notify_advanced`](Self::notify_advanced), for `timeout`, or
    /// for [`close`](Self::close). Registration after close is rejected and
    /// the callback is dropped without running.
    pub fn add_listener(
        &self,
        target: SeqNo,
        callback: ListenerCallback,
        timeout: Option<Duration>,
    ) -> Result<(), ListenerError> {
        let mut state = self.shared.lock_state();
        if state.closed {
            return Err(ListenerError::ShardClosed(self.shared.shard_id.clone()));
        }
        if state.last_known >= target {
            let checkpoint = state.last_known;
            drop(state);
            callback(checkpoint, None);
            return Ok(());
        }

        let key = (target, state.next_id);
        state.next_id += 1;
        // The timer blocks on the state lock until the entry below is in.
        let timer = timeout.map(|timeout| {
            let shared = Arc::clone(&self.shared);
            self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                shared.fire_timeout(key, timeout);
            })
        });
        state.pending.insert(key, PendingListener { callback, timer });

        debug!(
            shard_id = %self.shared.shard_id,
            target,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Registered global checkpoint listener"
        );
        Ok(())
    }

    /// Fire every listener whose target is at or below `checkpoint`.
    ///
    /// Values at or below the last known checkpoint are ignored.
    pub fn notify_advanced(&self, checkpoint: SeqNo) {
        let mut state = self.shared.lock_state();
        if state.closed || checkpoint <= state.last_known {
            return;
        }
        state.last_known = checkpoint;

        let fired = match checkpoint.checked_add(1) {
            Some(bound) => {
                let waiting = state.pending.split_off(&(bound, 0));
                std::mem::replace(&mut state.pending, waiting)
            }
            None => std::mem::take(&mut state.pending),
        };
        let undelivered = self.shared.dispatch(fired, checkpoint, None);
        drop(state);
        run_inline(&self.shared.shard_id, undelivered);
    }

    /// Fail every pending listener with `ShardClosed` and reject later
    /// registrations.
    pub fn close(&self) {
        let mut state = self.shared.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        let pending = std::mem::take(&mut state.pending);
        let count = pending.len();
        let error = ListenerError::ShardClosed(self.shared.shard_id.clone());
        let undelivered = self.shared.dispatch(pending, UNASSIGNED_SEQ_NO, Some(error));
        drop(state);
        run_inline(&self.shared.shard_id, undelivered);

        debug!(
            shard_id = %self.shared.shard_id,
            failed = count,
            "Closed global checkpoint listeners"
        );
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    pub fn last_known(&self) -> SeqNo {
        self.shared.lock_state().last_known
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_timeout(&self, key: (SeqNo, u64), timeout: Duration) {
        let mut state = self.lock_state();
        let Some(entry) = state.pending.remove(&key) else {
            return;
        };
        let mut fired = BTreeMap::new();
        fired.insert(key, entry);
        let undelivered = self.dispatch(fired, UNASSIGNED_SEQ_NO, Some(ListenerError::Timeout(timeout)));
        drop(state);

        debug!(shard_id = %self.shard_id, target = key.0, "Global checkpoint listener timed out");
        run_inline(&self.shard_id, undelivered);
    }

    /// Queue `fired` listeners on the executor in ascending target order.
    ///
    /// Must be called with the state lock held so that separate firings are
    /// queued in the order they happened. Returns notifications the executor
    /// could not accept because its task is gone.
    fn dispatch(
        &self,
        fired: BTreeMap<(SeqNo, u64), PendingListener>,
        checkpoint: SeqNo,
        error: Option<ListenerError>,
    ) -> Vec<Notification> {
        let mut undelivered = Vec::new();
        for (_, listener) in fired {
            if let Some(timer) = listener.timer {
                timer.abort();
            }
            let notification = Notification {
                callback: listener.callback,
                checkpoint,
                error: error.clone(),
            };
            if let Err(mpsc::error::SendError(notification)) = self.executor.send(notification) {
                undelivered.push(notification);
            }
        }
        undelivered
    }
}

fn run_inline(shard_id: &ShardId, undelivered: Vec<Notification>) {
    if undelivered.is_empty() {
        return;
    }
    warn!(
        shard_id = %shard_id,
        count = undelivered.len(),
        "Listener executor is gone, running callbacks inline"
    );
    for notification in undelivered {
        run_callback(shard_id, notification);
    }
}

fn run_callback(shard_id: &ShardId, notification: Notification) {
    let Notification {
        callback,
        checkpoint,
        error,
    } = notification;
    if catch_unwind(AssertUnwindSafe(move || callback(checkpoint, error))).is_err() {
        warn!(shard_id = %shard_id, checkpoint, "Global checkpoint listener panicked");
    }
}
