//! # Segment Files
//!
//! A segment is the on-disk representation of a memtable at flush time:
//! the concatenation of encoded records in ascending key order, named
//! `<db_dir>/<segment_id>.seg`.
//!
//! ## Immutability
//!
//! Once sealed by [`SegmentWriter::finish`] a segment is only ever read
//! or deleted (by compaction); it is never modified in place. That
//! invariant is what makes the mmap-backed [`SegmentReader`] safe.
//!
//! ## Durability
//!
//! The writer buffers all records and commits them with a single write
//! followed by an `fsync`, so readers never observe a partially-written
//! segment that the manifest refers to.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::{self, HEADER_SIZE, Record, RecordError};

/// Unique identifier of a segment within one database.
pub type SegmentId = u32;

/// File extension of segment files.
pub const SEGMENT_EXT: &str = "seg";

/// Returns the path of segment `id` inside a database directory.
pub fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}.{SEGMENT_EXT}"))
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment file operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record codec failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Append-and-seal writer for a single segment file.
///
/// Records must be appended in ascending key order; the memtable flush
/// path guarantees this by iterating its sorted map.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
}

impl SegmentWriter {
    /// Creates (or truncates) the segment file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            file,
            path,
            buf: Vec::new(),
        })
    }

    /// Buffers one encoded record.
    pub fn append(&mut self, timestamp: i64, key: &str, value: &str) -> Result<(), SegmentError> {
        let (_, bytes) = record::encode_record(timestamp, key, value)?;
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    /// Writes the buffered records and fsyncs, sealing the segment.
    pub fn finish(mut self) -> Result<(), SegmentError> {
        self.file.write_all(&self.buf)?;
        self.file.sync_all()?;

        debug!(path = %self.path.display(), bytes = self.buf.len(), "segment sealed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Memory-mapped reader over a sealed segment file.
///
/// # Safety
///
/// Uses `unsafe { Mmap::map(...) }` but is memory-safe because sealed
/// segments are never modified in place (they are only deleted, and a
/// deleted file's mapping stays valid until the reader is dropped), the
/// mapping is read-only, and every decode is bounds-checked against the
/// mapped slice.
pub struct SegmentReader {
    /// `None` for a zero-length file, which cannot be mapped.
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl SegmentReader {
    /// Opens and maps the segment file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self { mmap, path })
    }

    /// Iterates the decoded records in file order (ascending key order
    /// for segments produced by a memtable flush).
    pub fn records(&self) -> Records<'_> {
        Records {
            buf: self.mmap.as_deref().unwrap_or(&[]),
            offset: 0,
            path: &self.path,
        }
    }
}

/// Iterator over the records of one segment.
///
/// End-of-file terminates the iteration. A truncated or undecodable
/// tail also terminates it, with a warning, so a damaged segment reads
/// as "the records that survived" rather than as a hard error.
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    path: &'a Path,
}

impl Iterator for Records<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.offset >= self.buf.len() {
            return None;
        }

        match record::decode_record(&self.buf[self.offset..]) {
            Ok(rec) => {
                self.offset += HEADER_SIZE + rec.key.len() + rec.value.len();
                Some(rec)
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    offset = self.offset,
                    error = %e,
                    "stopping segment scan on undecodable record"
                );
                self.offset = self.buf.len();
                None
            }
        }
    }
}
