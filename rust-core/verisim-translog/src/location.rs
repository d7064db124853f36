// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Record locations
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where an operation's record lives: generation file, byte offset of the
/// record start within that file, and record size in bytes.
///
/// Locations are totally ordered by `(generation, offset)`; `size` only
/// breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub generation: u64,
    pub offset: u64,
    pub size: u32,
}

impl Location {
    pub fn new(generation: u64, offset: u64, size: u32) -> Self {
        Self {
            generation,
            offset,
            size,
        }
    }

    /// Offset one past the last byte of the record.
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then(self.offset.cmp(&other.offset))
            .then(self.size.cmp(&other.size))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[generation: {}, offset: {}, size: {}]",
            self.generation, self.offset, self.size
        )
    }
}
