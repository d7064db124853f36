// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shard statistics and their Prometheus export.
//!
//! [`ShardStats`] is a point-in-time snapshot with no side effects on the
//! shard. [`ShardMetrics`] mirrors one snapshot into Prometheus gauges,
//! labelled with the shard id.

use prometheus::{IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use verisim_translog::TranslogStats;

use crate::error::{ShardError, ShardResult};
use crate::seqno::SeqNoStats;
use crate::shard::ShardState;
use crate::shard_id::ShardId;

/// Flush counters. `periodic` counts flushes triggered by the flush
/// threshold; `total` counts every completed flush, periodic ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub total: u64,
    pub periodic: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub state: ShardState,
    pub flush: FlushStats,
    pub translog: TranslogStats,
    pub seq_no: SeqNoStats,
    /// This shard's contribution to the accounting breaker.
    pub breaker_used_bytes: i64,
    /// Segment memory as reported by the engine.
    pub segment_memory_bytes: i64,
}

/// Prometheus gauges for one shard.
pub struct ShardMetrics {
    flush_total: IntGauge,
    flush_periodic: IntGauge,
    translog_operations: IntGauge,
    translog_size_bytes: IntGauge,
    translog_uncommitted_operations: IntGauge,
    translog_uncommitted_size_bytes: IntGauge,
    translog_generation: IntGauge,
    local_checkpoint: IntGauge,
    global_checkpoint: IntGauge,
    breaker_used_bytes: IntGauge,
}

impl ShardMetrics {
    /// Create the gauges and register them with `registry`.
    pub fn register(registry: &Registry, shard_id: &ShardId) -> ShardResult<Self> {
        let gauge = |name: &str, help: &str| -> ShardResult<IntGauge> {
            let opts = Opts::new(name, help)
                .const_label("index", shard_id.index.clone())
                .const_label("shard", shard_id.shard.to_string());
            let gauge = IntGauge::with_opts(opts)
                .map_err(|e| ShardError::InvalidArgument(e.to_string()))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| ShardError::InvalidArgument(e.to_string()))?;
            Ok(gauge)
        };

        Ok(Self {
            flush_total: gauge("verisim_shard_flush_total", "Completed flushes")?,
            flush_periodic: gauge(
                "verisim_shard_flush_periodic",
                "Flushes triggered by the flush threshold",
            )?,
            translog_operations: gauge(
                "verisim_shard_translog_operations",
                "Operations in retained translog generations",
            )?,
            translog_size_bytes: gauge(
                "verisim_shard_translog_size_bytes",
                "Bytes in retained translog generations",
            )?,
            translog_uncommitted_operations: gauge(
                "verisim_shard_translog_uncommitted_operations",
                "Translog operations not covered by a commit",
            )?,
            translog_uncommitted_size_bytes: gauge(
                "verisim_shard_translog_uncommitted_size_bytes",
                "Translog bytes not covered by a commit",
            )?,
            translog_generation: gauge(
                "verisim_shard_translog_generation",
                "Current translog generation",
            )?,
            local_checkpoint: gauge("verisim_shard_local_checkpoint", "Local checkpoint")?,
            global_checkpoint: gauge("verisim_shard_global_checkpoint", "Global checkpoint")?,
            breaker_used_bytes: gauge(
                "verisim_shard_breaker_used_bytes",
                "Segment memory accounted to the breaker",
            )?,
        })
    }

    /// Copy a stats snapshot into the gauges.
    pub fn observe(&self, stats: &ShardStats) {
        self.flush_total.set(stats.flush.total as i64);
        self.flush_periodic.set(stats.flush.periodic as i64);
        self.translog_operations.set(stats.translog.num_ops as i64);
        self.translog_size_bytes
            .set(stats.translog.size_in_bytes as i64);
        self.translog_uncommitted_operations
            .set(stats.translog.uncommitted_ops as i64);
        self.translog_uncommitted_size_bytes
            .set(stats.translog.uncommitted_size_in_bytes as i64);
        self.translog_generation
            .set(stats.translog.current_generation as i64);
        self.local_checkpoint.set(stats.seq_no.local_checkpoint);
        self.global_checkpoint.set(stats.seq_no.global_checkpoint);
        self.breaker_used_bytes.set(stats.breaker_used_bytes);
    }
}
