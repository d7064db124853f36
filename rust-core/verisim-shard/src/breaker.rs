// SPDX-License-Identifier: PMPL-1.0-or-later
//! Circuit breaker accounting for segment memory.
//!
//! A [`CircuitBreaker`] is shared by every shard on a node. Segment memory is
//! tracked with [`CircuitBreaker::add_without_breaking`], which never
//! rejects; request paths use
//! [`CircuitBreaker::add_estimate_and_maybe_break`] to refuse work once the
//! tracked total would exceed the limit. [`ShardAccounting`] remembers how
//! much one shard contributed so closing the shard can retract exactly that.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::SegmentMemoryListener;
use crate::shard_id::ShardId;

/// A request was refused because it would push the breaker over its limit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{breaker}] Data too large, data for [{label}] would be [{would_be}b], which is larger than the limit of [{limit}b]")]
pub struct CircuitBreakingError {
    pub breaker: String,
    pub label: String,
    pub bytes: i64,
    pub would_be: i64,
    pub limit: i64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub used_bytes: i64,
    pub limit_bytes: i64,
}

/// A named byte counter with a limit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    limit: i64,
    used: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, limit: i64) -> Self {
        Self {
            name: name.into(),
            limit,
            used: AtomicI64::new(0),
        }
    }

    /// Add `delta` (positive or negative) unconditionally. Returns the new
    /// total.
    pub fn add_without_breaking(&self, delta: i64) -> i64 {
        let used = self.used.fetch_add(delta, Ordering::AcqRel) + delta;
        if used < 0 {
            warn!(breaker = %self.name, used, delta, "Circuit breaker went negative");
        }
        used
    }

    /// Reserve `bytes` unless that would exceed the limit.
    pub fn add_estimate_and_maybe_break(
        &self,
        bytes: i64,
        label: &str,
    ) -> Result<i64, CircuitBreakingError> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let would_be = current + bytes;
            if bytes > 0 && would_be > self.limit {
                debug!(breaker = %self.name, label, would_be, limit = self.limit, "Circuit breaker tripped");
                return Err(CircuitBreakingError {
                    breaker: self.name.clone(),
                    label: label.to_string(),
                    bytes,
                    would_be,
                    limit: self.limit,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                would_be,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(would_be),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn used(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            name: self.name.clone(),
            used_bytes: self.used(),
            limit_bytes: self.limit,
        }
    }
}

/// One shard's contribution to a shared breaker.
#[derive(Debug)]
pub struct ShardAccounting {
    shard_id: ShardId,
    breaker: Arc<CircuitBreaker>,
    contributed: AtomicI64,
}

impl ShardAccounting {
    pub fn new(shard_id: ShardId, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            shard_id,
            breaker,
            contributed: AtomicI64::new(0),
        }
    }

    /// Apply a segment-memory delta to both the shard and the breaker.
    pub fn adjust(&self, delta: i64) {
        self.contributed.fetch_add(delta, Ordering::AcqRel);
        self.breaker.add_without_breaking(delta);
    }

    /// Bytes currently attributed to this shard.
    pub fn used(&self) -> i64 {
        self.contributed.load(Ordering::Acquire)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retract everything this shard contributed. Returns the amount
    /// retracted.
    pub fn release(&self) -> i64 {
        let contributed = self.contributed.swap(0, Ordering::AcqRel);
        if contributed != 0 {
            self.breaker.add_without_breaking(-contributed);
            debug!(
                shard_id = %self.shard_id,
                released = contributed,
                "Released shard breaker contribution"
            );
        }
        contributed
    }
}

impl SegmentMemoryListener for ShardAccounting {
    fn on_segment_memory_delta(&self, delta: i64) {
        self.adjust(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn accounting(limit: i64) -> ShardAccounting {
        ShardAccounting::new(
            ShardId::new("test", 0),
            Arc::new(CircuitBreaker::new("accounting", limit)),
        )
    }

    #[test]
    fn test_adjust_tracks_both_counters() {
        let accounting = accounting(1_000);
        accounting.adjust(300);
        accounting.adjust(-100);
        assert_eq!(accounting.used(), 200);
        assert_eq!(accounting.breaker().used(), 200);
    }

    #[test]
    fn test_release_retracts_only_own_contribution() {
        let breaker = Arc::new(CircuitBreaker::new("accounting", 1_000));
        let first = ShardAccounting::new(ShardId::new("a", 0), Arc::clone(&breaker));
        let second = ShardAccounting::new(ShardId::new("b", 0), Arc::clone(&breaker));
        first.adjust(400);
        second.adjust(250);

        assert_eq!(first.release(), 400);
        assert_eq!(first.used(), 0);
        assert_eq!(breaker.used(), 250);
        assert_eq!(first.release(), 0);
    }

    #[test]
    fn test_tracking_never_rejects_but_admission_does() {
        let accounting = accounting(100);
        accounting.adjust(150);
        assert_eq!(accounting.breaker().used(), 150);

        let error = accounting
            .breaker()
            .add_estimate_and_maybe_break(1, "search")
            .unwrap_err();
        assert_eq!(error.would_be, 151);
        assert!(error.to_string().contains("Data too large"));
    }

    #[test]
    fn test_admission_within_limit() {
        let breaker = CircuitBreaker::new("request", 100);
        assert_eq!(breaker.add_estimate_and_maybe_break(60, "agg").unwrap(), 60);
        assert!(breaker.add_estimate_and_maybe_break(41, "agg").is_err());
        assert_eq!(breaker.used(), 60);
    }

    proptest! {
        #[test]
        fn prop_release_nets_to_zero(deltas in proptest::collection::vec(-5_000i64..5_000, 0..64)) {
            let accounting = accounting(i64::MAX);
            let mut expected = 0i64;
            for delta in deltas {
                accounting.adjust(delta);
                expected += delta;
                prop_assert_eq!(accounting.used(), expected);
                prop_assert_eq!(accounting.breaker().used(), expected);
            }
            accounting.release();
            prop_assert_eq!(accounting.breaker().used(), 0);
        }
    }
}
