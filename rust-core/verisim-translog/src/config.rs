// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Configuration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use serde::{Deserialize, Serialize};

use crate::writer::DEFAULT_BUFFER_SIZE;

/// When acknowledged writes become durable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Every write is fsynced before it is acknowledged.
    #[default]
    Request,
    /// Writes are fsynced periodically in the background; a crash may lose
    /// up to one sync interval of acknowledged writes.
    Async,
}

impl std::fmt::Display for Durability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Static configuration of a translog instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslogConfig {
    /// Primary term stamped into every generation header.
    pub primary_term: u64,
    /// Capacity of the append buffer in bytes.
    pub buffer_size: usize,
}

impl Default for TranslogConfig {
    fn default() -> Self {
        Self {
            primary_term: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}
