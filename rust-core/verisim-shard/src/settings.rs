// SPDX-License-Identifier: PMPL-1.0-or-later
//! Dynamic shard settings.
//!
//! Every field can be changed at runtime through
//! [`IndexShard::update_settings`](crate::IndexShard::update_settings); the
//! policy reads a fresh snapshot on each evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use verisim_translog::Durability;

use crate::error::{ShardError, ShardResult};

const MIB: u64 = 1024 * 1024;

/// Smallest accepted `generation_threshold_size`. Larger than a generation
/// header, so a freshly rolled generation never qualifies for another roll.
pub const MIN_GENERATION_THRESHOLD_SIZE: u64 = 64;

/// Durability and maintenance settings of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSettings {
    /// When acknowledged writes are fsynced.
    pub durability: Durability,
    /// Uncommitted translog bytes that trigger a periodic flush.
    pub flush_threshold_size: u64,
    /// Size of the current translog generation that triggers a roll.
    pub generation_threshold_size: u64,
    /// Background fsync interval under `async` durability, in milliseconds.
    pub sync_interval_ms: u64,
    /// Time without writes after which the shard is considered idle, in
    /// milliseconds.
    pub inactive_after_ms: u64,
}

impl Default for ShardSettings {
    /// Defaults:
    /// - durability: request
    /// - flush_threshold_size: 512 MiB
    /// - generation_threshold_size: 64 MiB
    /// - sync_interval: 5s
    /// - inactive_after: 5m
    fn default() -> Self {
        Self {
            durability: Durability::Request,
            flush_threshold_size: 512 * MIB,
            generation_threshold_size: 64 * MIB,
            sync_interval_ms: 5_000,
            inactive_after_ms: 5 * 60 * 1_000,
        }
    }
}

impl ShardSettings {
    /// Parse settings from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> ShardResult<Self> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ShardError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.flush_threshold_size == 0 {
            return Err(ShardError::Settings(
                "flush_threshold_size must be positive".to_string(),
            ));
        }
        if self.generation_threshold_size < MIN_GENERATION_THRESHOLD_SIZE {
            return Err(ShardError::Settings(format!(
                "generation_threshold_size must be at least {MIN_GENERATION_THRESHOLD_SIZE}b, got {}b",
                self.generation_threshold_size
            )));
        }
        if self.sync_interval_ms == 0 {
            return Err(ShardError::Settings(
                "sync_interval_ms must be positive".to_string(),
            ));
        }
        if self.inactive_after_ms == 0 {
            return Err(ShardError::Settings(
                "inactive_after_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn inactive_after(&self) -> Duration {
        Duration::from_millis(self.inactive_after_ms)
    }
}
