// SPDX-License-Identifier: PMPL-1.0-or-later
//! Sequence-number bookkeeping.
//!
//! [`LocalCheckpointTracker`] hands out sequence numbers on the primary and
//! tracks the highest contiguously processed one. [`ReplicationTracker`]
//! derives the global checkpoint from the local checkpoints of all in-sync
//! copies; it never moves backwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use verisim_translog::{SeqNo, NO_OPS_PERFORMED};

use crate::error::{ShardError, ShardResult};

/// Point-in-time sequence-number stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqNoStats {
    pub max_seq_no: SeqNo,
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
}

struct TrackerState {
    next_seq_no: SeqNo,
    max_seq_no: SeqNo,
    checkpoint: SeqNo,
    /// Processed sequence numbers above the checkpoint.
    processed: BTreeSet<SeqNo>,
}

pub struct LocalCheckpointTracker {
    state: Mutex<TrackerState>,
}

impl LocalCheckpointTracker {
    pub fn new(max_seq_no: SeqNo, local_checkpoint: SeqNo) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_seq_no: max_seq_no + 1,
                max_seq_no,
                checkpoint: local_checkpoint,
                processed: BTreeSet::new(),
            }),
        }
    }

    /// Reset to the state recorded by a commit.
    pub fn reset(&self, max_seq_no: SeqNo, local_checkpoint: SeqNo) {
        let mut state = self.lock();
        state.next_seq_no = max_seq_no + 1;
        state.max_seq_no = max_seq_no;
        state.checkpoint = local_checkpoint;
        state.processed.clear();
    }

    pub fn generate_seq_no(&self) -> SeqNo {
        let mut state = self.lock();
        let seq_no = state.next_seq_no;
        state.next_seq_no += 1;
        state.max_seq_no = state.max_seq_no.max(seq_no);
        seq_no
    }

    /// Account for a sequence number seen during replay.
    pub fn advance_max_seq_no(&self, seq_no: SeqNo) {
        let mut state = self.lock();
        state.max_seq_no = state.max_seq_no.max(seq_no);
        state.next_seq_no = state.next_seq_no.max(seq_no + 1);
    }

    pub fn mark_processed(&self, seq_no: SeqNo) {
        let mut state = self.lock();
        if seq_no <= state.checkpoint {
            return;
        }
        state.processed.insert(seq_no);
        loop {
            let next = state.checkpoint + 1;
            if !state.processed.remove(&next) {
                break;
            }
            state.checkpoint = next;
        }
    }

    pub fn has_processed(&self, seq_no: SeqNo) -> bool {
        let state = self.lock();
        seq_no <= state.checkpoint || state.processed.contains(&seq_no)
    }

    pub fn checkpoint(&self) -> SeqNo {
        self.lock().checkpoint
    }

    pub fn max_seq_no(&self) -> SeqNo {
        self.lock().max_seq_no
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReplicationState {
    global_checkpoint: SeqNo,
    in_sync: HashMap<String, SeqNo>,
}

/// Global checkpoint derived from the in-sync copies of a shard.
pub struct ReplicationTracker {
    primary_allocation_id: String,
    state: Mutex<ReplicationState>,
}

impl ReplicationTracker {
    pub fn new(primary_allocation_id: impl Into<String>, global_checkpoint: SeqNo) -> Self {
        let primary_allocation_id = primary_allocation_id.into();
        let mut in_sync = HashMap::new();
        in_sync.insert(primary_allocation_id.clone(), NO_OPS_PERFORMED);
        Self {
            primary_allocation_id,
            state: Mutex::new(ReplicationState {
                global_checkpoint,
                in_sync,
            }),
        }
    }

    pub fn primary_allocation_id(&self) -> &str {
        &self.primary_allocation_id
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.lock().global_checkpoint
    }

    /// Raise the global checkpoint to at least `seq_no`, e.g. from a value
    /// persisted before a restart.
    pub fn restore_global_checkpoint(&self, seq_no: SeqNo) {
        let mut state = self.lock();
        state.global_checkpoint = state.global_checkpoint.max(seq_no);
    }

    /// Mark a copy in-sync. Its local checkpoint must already have caught up
    /// with the global checkpoint.
    pub fn add_in_sync_copy(
        &self,
        allocation_id: impl Into<String>,
        local_checkpoint: SeqNo,
    ) -> ShardResult<Option<SeqNo>> {
        let allocation_id = allocation_id.into();
        let mut state = self.lock();
        if local_checkpoint < state.global_checkpoint {
            return Err(ShardError::InvalidArgument(format!(
                "copy [{allocation_id}] has local checkpoint {local_checkpoint} below global checkpoint {}",
                state.global_checkpoint
            )));
        }
        state.in_sync.insert(allocation_id, local_checkpoint);
        Ok(Self::recompute(&mut state))
    }

    /// Record a copy's local checkpoint. Returns the new global checkpoint if
    /// it advanced.
    pub fn update_local_checkpoint(
        &self,
        allocation_id: &str,
        local_checkpoint: SeqNo,
    ) -> ShardResult<Option<SeqNo>> {
        let mut state = self.lock();
        let Some(current) = state.in_sync.get_mut(allocation_id) else {
            return Err(ShardError::InvalidArgument(format!(
                "unknown in-sync copy [{allocation_id}]"
            )));
        };
        *current = (*current).max(local_checkpoint);
        Ok(Self::recompute(&mut state))
    }

    /// Stop waiting for a copy. Removing a lagging copy can advance the
    /// global checkpoint.
    pub fn remove_copy(&self, allocation_id: &str) -> ShardResult<Option<SeqNo>> {
        if allocation_id == self.primary_allocation_id {
            return Err(ShardError::InvalidArgument(
                "the primary cannot be removed from the in-sync set".to_string(),
            ));
        }
        let mut state = self.lock();
        state.in_sync.remove(allocation_id);
        Ok(Self::recompute(&mut state))
    }

    pub fn in_sync_copies(&self) -> Vec<String> {
        let mut copies: Vec<String> = self.lock().in_sync.keys().cloned().collect();
        copies.sort();
        copies
    }

    fn recompute(state: &mut ReplicationState) -> Option<SeqNo> {
        let minimum = state.in_sync.values().copied().min()?;
        if minimum > state.global_checkpoint {
            state.global_checkpoint = minimum;
            Some(minimum)
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplicationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
