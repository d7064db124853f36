// SPDX-License-Identifier: PMPL-1.0-or-later
//! VeriSim Shard
//!
//! The durability lifecycle of one shard: recovery from the last engine
//! commit plus translog replay, durable writes, the periodic flush and
//! generation-roll policy, global checkpoint listeners and segment-memory
//! accounting against a node-wide circuit breaker.
//!
//! ```no_run
//! use std::sync::Arc;
//! use verisim_shard::{CircuitBreaker, IndexShard, MemoryEngine, ShardConfig, ShardId};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ShardConfig::new(ShardId::new("products", 0), "/var/lib/verisim/products/0");
//! let engine = Arc::new(MemoryEngine::open(config.data_path.join("index"))?);
//! let breaker = Arc::new(CircuitBreaker::new("accounting", 512 * 1024 * 1024));
//!
//! let shard = IndexShard::open(config, engine, breaker)?;
//! shard.recover_from_store()?;
//! shard.index("sku-1", br#"{"price":10}"#.to_vec())?;
//! shard.close("shutdown", true)?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod policy;
pub mod seqno;
pub mod settings;
pub mod shard;
pub mod shard_id;
pub mod stats;

pub use breaker::{BreakerStats, CircuitBreaker, CircuitBreakingError, ShardAccounting};
pub use engine::{
    ApplyOutcome, CommitPoint, Engine, EngineError, MemoryEngine, SegmentMemoryListener,
    StoredDoc,
};
pub use error::{ListenerError, ShardError, ShardResult};
pub use listeners::{GlobalCheckpointListeners, ListenerCallback};
pub use policy::MaintenanceAction;
pub use seqno::{LocalCheckpointTracker, ReplicationTracker, SeqNoStats};
pub use settings::{ShardSettings, MIN_GENERATION_THRESHOLD_SIZE};
pub use shard::{FlushRequest, IndexShard, ShardConfig, ShardState, WriteResult};
pub use shard_id::ShardId;
pub use stats::{FlushStats, ShardMetrics, ShardStats};

pub use verisim_translog::{Durability, SeqNo, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
