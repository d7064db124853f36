// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shard error types.
//!
//! Every failure a collaborator may want to branch on has its own variant.
//! Translog failures on the write path are fatal: the shard fails itself
//! before the error is returned.

use std::time::Duration;

use thiserror::Error;
use verisim_translog::TranslogError;

use crate::engine::EngineError;
use crate::shard::ShardState;
use crate::shard_id::ShardId;

/// Failure delivered to a global checkpoint listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The target was not reached before the listener's timeout.
    #[error("timed out waiting for global checkpoint after [{0:?}]")]
    Timeout(Duration),

    /// The shard closed before the target was reached.
    #[error("{0} shard closed")]
    ShardClosed(ShardId),
}

/// Errors that can occur during shard operations.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("translog failure: {0}")]
    Translog(#[from] TranslogError),

    #[error("{shard_id} recovery failed: {source}")]
    Recovery {
        shard_id: ShardId,
        #[source]
        source: Box<ShardError>,
    },

    #[error("{0} shard is closed")]
    Closed(ShardId),

    #[error("illegal shard state: expected {expected}, was {actual}")]
    IllegalState {
        expected: ShardState,
        actual: ShardState,
    },

    #[error("engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid shard settings: {0}")]
    Settings(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("shard requires a tokio runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

pub type ShardResult<T> = Result<T, ShardError>;
