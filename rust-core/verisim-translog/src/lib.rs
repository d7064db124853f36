// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The per-shard write-ahead log. Every index, delete and no-op operation is
// appended here before it is applied to the engine, so that an acknowledged
// write survives a crash even if the engine never committed it. On restart
// the shard replays the translog forward from the last engine commit.
//
// # Architecture
//
// The translog is a sequence of **generation files** in a dedicated
// directory. Exactly one generation (the highest) accepts appends; rolling
// seals it with a checksummed footer and starts the next one. A fixed-size
// **checkpoint** file (`translog.ckp`) records the durable length of the
// current generation, the oldest generation still required and the
// sequence-number watermarks. It is replaced atomically on every sync.
//
// ```text
// translog/
//   translog-3.tlog   translog-3.ckp     sealed, frozen checkpoint
//   translog-4.tlog   translog-4.ckp     sealed, frozen checkpoint
//   translog-5.tlog                      current, accepts appends
//   translog.ckp                         live checkpoint (generation 5)
// ```
//
// ## On-disk record format (all integers little-endian)
//
// ```text
// [4 bytes: record_length (u32)]  -- length of everything after this field
// [4 bytes: crc32 checksum]       -- CRC32 of the payload
// [1 byte:  kind]                 -- 0=Index, 1=Delete, 2=NoOp
// [8 bytes: seq_no (i64)]
// [8 bytes: primary_term (u64)]
// [kind-specific length-prefixed fields]
// ```
//
// ## Usage
//
// ```no_run
// use verisim_translog::{Operation, Translog, TranslogConfig};
//
// let translog = Translog::create("/tmp/verisim-translog", TranslogConfig::default()).unwrap();
// let location = translog
//     .add(&Operation::Index {
//         seq_no: 0,
//         primary_term: 1,
//         id: "doc-1".to_string(),
//         source: br#"{"title":"hello"}"#.to_vec(),
//     })
//     .unwrap();
// translog.ensure_synced(location).unwrap();
//
// for (location, operation) in translog.new_snapshot(0).unwrap() {
//     println!("{location} seq_no={}", operation.seq_no());
// }
// ```

pub mod checkpoint;
mod codec;
pub mod config;
pub mod error;
pub mod generation;
pub mod location;
pub mod operation;
pub mod reader;
pub mod translog;
pub mod writer;

// Re-export the primary public API for ergonomic imports.
pub use checkpoint::{Checkpoint, CHECKPOINT_FILE_NAME};
pub use codec::compute_crc32;
pub use config::{Durability, TranslogConfig};
pub use error::{TranslogError, TranslogResult};
pub use generation::{generation_path, list_generations, GenerationFile};
pub use location::Location;
pub use operation::{Operation, OperationKind, SeqNo, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
pub use reader::{GenerationReader, Snapshot};
pub use translog::{Translog, TranslogStats};
pub use writer::DEFAULT_BUFFER_SIZE;
