// SPDX-License-Identifier: PMPL-1.0-or-later
//
// VeriSimDB Translog - Generation files
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Each translog generation is a single append-only file named
// `translog-{generation}.tlog`. A generation starts with a fixed header and,
// once it has been superseded by a roll, ends with a footer carrying the
// checksum of every record in between. Only the newest generation is ever
// appended to.
//
// Header (44 bytes, little-endian):
//   [4 bytes: magic "VTLG"][4 bytes: format version][16 bytes: translog uuid]
//   [8 bytes: primary term][8 bytes: generation][4 bytes: crc32 of the above]
//
// Footer (16 bytes):
//   [4 bytes: zero sentinel][8 bytes: content length][4 bytes: crc32 of content]
//
// The zero sentinel can never start a record (records are at least 4 bytes
// long), so a reader walking records knows it has reached the footer.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::codec::{compute_crc32, ByteReader};
use crate::error::{TranslogError, TranslogResult};
use crate::location::Location;
use crate::operation::{Operation, MAX_RECORD_SIZE, RECORD_PREFIX_SIZE};

/// Magic bytes at the start of every generation file.
pub const GENERATION_MAGIC: [u8; 4] = *b"VTLG";

/// Current generation file format version.
pub const GENERATION_VERSION: u32 = 1;

/// Size of the generation header in bytes.
pub const HEADER_SIZE: u64 = 44;

/// Size of the generation footer in bytes.
pub const FOOTER_SIZE: u64 = 16;

/// The file extension used for generation files.
pub const GENERATION_EXTENSION: &str = "tlog";

/// The prefix used for generation file names.
pub const GENERATION_PREFIX: &str = "translog-";

/// A generation file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFile {
    /// The full path to the generation file.
    pub path: PathBuf,

    /// The generation id encoded in the file name.
    pub generation: u64,

    /// Current file size in bytes.
    pub file_size: u64,
}

impl PartialOrd for GenerationFile {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GenerationFile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation.cmp(&other.generation)
    }
}

/// Build the canonical file name for a generation.
///
/// Format: `translog-12.tlog`
pub fn generation_filename(generation: u64) -> String {
    format!("{GENERATION_PREFIX}{generation}.{GENERATION_EXTENSION}")
}

/// Build the full path for a generation file in the given translog directory.
pub fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(generation_filename(generation))
}

/// Parse the generation id from a generation file name.
///
/// Returns `None` if the name does not match the expected pattern.
pub fn parse_generation_filename(name: &str) -> Option<u64> {
    let stripped = name.strip_prefix(GENERATION_PREFIX)?;
    let num_str = stripped.strip_suffix(&format!(".{GENERATION_EXTENSION}"))?;
    num_str.parse::<u64>().ok()
}

/// Scan a translog directory and return all generation files sorted by
/// generation (ascending). Other files are ignored.
pub fn list_generations(dir: &Path) -> TranslogResult<Vec<GenerationFile>> {
    let mut generations = Vec::new();

    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let name = file_name.to_string_lossy();

        if let Some(generation) = parse_generation_filename(&name) {
            let metadata = dir_entry.metadata()?;
            generations.push(GenerationFile {
                path: dir_entry.path(),
                generation,
                file_size: metadata.len(),
            });
        }
    }

    generations.sort();

    debug!(
        count = generations.len(),
        dir = %dir.display(),
        "Discovered translog generations"
    );

    Ok(generations)
}

/// The fixed header at the start of each generation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationHeader {
    pub translog_uuid: Uuid,
    pub primary_term: u64,
    pub generation: u64,
}

impl GenerationHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_SIZE as usize);
        buffer.extend_from_slice(&GENERATION_MAGIC);
        buffer.extend_from_slice(&GENERATION_VERSION.to_le_bytes());
        buffer.extend_from_slice(self.translog_uuid.as_bytes());
        buffer.extend_from_slice(&self.primary_term.to_le_bytes());
        buffer.extend_from_slice(&self.generation.to_le_bytes());
        let crc = compute_crc32(&buffer);
        buffer.extend_from_slice(&crc.to_le_bytes());
        buffer
    }

    pub fn decode(data: &[u8], file: &str) -> TranslogResult<Self> {
        let corrupted = |reason: String| TranslogError::Corrupted {
            file: file.to_string(),
            reason,
        };
        if (data.len() as u64) < HEADER_SIZE {
            return Err(corrupted(format!(
                "file is {} bytes, shorter than the {HEADER_SIZE} byte header",
                data.len()
            )));
        }

        let body = &data[..HEADER_SIZE as usize - 4];
        let mut reader = ByteReader::new(&data[..HEADER_SIZE as usize]);
        let truncated = || corrupted("truncated header".to_string());

        if reader.bytes(4).ok_or_else(truncated)? != GENERATION_MAGIC.as_slice() {
            return Err(corrupted("bad generation magic".to_string()));
        }
        let version = reader.u32().ok_or_else(truncated)?;
        if version != GENERATION_VERSION {
            return Err(corrupted(format!("unsupported generation version {version}")));
        }
        let header = Self {
            translog_uuid: reader.uuid().ok_or_else(truncated)?,
            primary_term: reader.u64().ok_or_else(truncated)?,
            generation: reader.u64().ok_or_else(truncated)?,
        };
        let stored_crc = reader.u32().ok_or_else(truncated)?;
        let computed_crc = compute_crc32(body);
        if stored_crc != computed_crc {
            return Err(TranslogError::CrcMismatch {
                file: file.to_string(),
                offset: 0,
                expected: stored_crc,
                actual: computed_crc,
            });
        }
        Ok(header)
    }

    /// Ensure a decoded header belongs to the expected translog and generation.
    pub fn verify(&self, translog_uuid: Uuid, generation: u64, file: &str) -> TranslogResult<()> {
        if self.translog_uuid != translog_uuid {
            return Err(TranslogError::UuidMismatch {
                expected: translog_uuid,
                actual: self.translog_uuid,
            });
        }
        if self.generation != generation {
            return Err(TranslogError::Corrupted {
                file: file.to_string(),
                reason: format!(
                    "header declares generation {}, file name says {generation}",
                    self.generation
                ),
            });
        }
        Ok(())
    }
}

/// The footer that seals a superseded generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationFooter {
    /// Number of record bytes between header and footer.
    pub content_length: u64,
    /// CRC32 over those record bytes.
    pub checksum: u32,
}

impl GenerationFooter {
    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut out = [0u8; FOOTER_SIZE as usize];
        out[4..12].copy_from_slice(&self.content_length.to_le_bytes());
        out[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8], file: &str) -> TranslogResult<Self> {
        let corrupted = |reason: &str| TranslogError::Corrupted {
            file: file.to_string(),
            reason: reason.to_string(),
        };
        let mut reader = ByteReader::new(data);
        let sentinel = reader.u32().ok_or_else(|| corrupted("truncated footer"))?;
        if sentinel != 0 {
            return Err(corrupted("footer sentinel is not zero"));
        }
        Ok(Self {
            content_length: reader.u64().ok_or_else(|| corrupted("truncated footer"))?,
            checksum: reader.u32().ok_or_else(|| corrupted("truncated footer"))?,
        })
    }
}

/// Decode every record in `data[HEADER_SIZE..content_end]`.
///
/// Every byte in this range was synced, so any malformed or checksum-failing
/// record is an error.
pub fn scan_records(
    data: &[u8],
    generation: u64,
    content_end: u64,
    file: &str,
) -> TranslogResult<Vec<(Location, Operation)>> {
    if content_end > data.len() as u64 || content_end < HEADER_SIZE {
        return Err(TranslogError::Corrupted {
            file: file.to_string(),
            reason: format!(
                "durable length {content_end} does not fit file of {} bytes",
                data.len()
            ),
        });
    }

    let mut operations = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset < content_end {
        let start = offset as usize;
        if offset + 4 > content_end {
            return Err(TranslogError::Corrupted {
                file: file.to_string(),
                reason: format!("truncated record length at offset {offset}"),
            });
        }
        let mut reader = ByteReader::new(&data[start..start + 4]);
        let record_length = reader.u32().unwrap_or(0);

        if (record_length as usize) < RECORD_PREFIX_SIZE - 4 {
            return Err(TranslogError::Corrupted {
                file: file.to_string(),
                reason: format!("record at offset {offset} declares length {record_length}"),
            });
        }
        if record_length > MAX_RECORD_SIZE {
            return Err(TranslogError::EntryTooLarge {
                offset,
                length: record_length,
                max_length: MAX_RECORD_SIZE,
            });
        }

        let record_end = offset + 4 + u64::from(record_length);
        if record_end > content_end {
            return Err(TranslogError::Corrupted {
                file: file.to_string(),
                reason: format!("record at offset {offset} runs past durable length {content_end}"),
            });
        }

        let operation = Operation::deserialize(&data[start + 4..record_end as usize], file, offset)?;
        operations.push((
            Location::new(generation, offset, 4 + record_length),
            operation,
        ));
        offset = record_end;
    }

    Ok(operations)
}

/// Validate the footer of a sealed generation whose content ends at
/// `content_end`. Returns the footer.
pub fn verify_footer(data: &[u8], content_end: u64, file: &str) -> TranslogResult<GenerationFooter> {
    if data.len() as u64 != content_end + FOOTER_SIZE {
        return Err(TranslogError::Corrupted {
            file: file.to_string(),
            reason: format!(
                "sealed generation is {} bytes, expected {}",
                data.len(),
                content_end + FOOTER_SIZE
            ),
        });
    }

    let footer = GenerationFooter::decode(&data[content_end as usize..], file)?;
    if footer.content_length != content_end - HEADER_SIZE {
        return Err(TranslogError::Corrupted {
            file: file.to_string(),
            reason: format!(
                "footer declares {} content bytes, expected {}",
                footer.content_length,
                content_end - HEADER_SIZE
            ),
        });
    }

    let computed = compute_crc32(&data[HEADER_SIZE as usize..content_end as usize]);
    if computed != footer.checksum {
        return Err(TranslogError::CrcMismatch {
            file: file.to_string(),
            offset: content_end,
            expected: footer.checksum,
            actual: computed,
        });
    }
    Ok(footer)
}
