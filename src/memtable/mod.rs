//! # Memtable Module
//!
//! The bounded in-memory write buffer of the storage engine: a mapping
//! from key to `(timestamp, value)` with a bytes-occupied counter and a
//! pre-assigned segment id (the id the memtable will assume on flush).
//!
//! ## Design Invariants
//!
//! - `bytes_occupied` never exceeds the configured size limit; a put
//!   that would cross it fails with [`MemtableError::MaxSizeExceeded`]
//!   **without mutating the map**, which callers treat as the rotation
//!   signal.
//! - Size accounting is `len(key) + len(value) + 8` per entry (8 bytes
//!   for the stored timestamp); overwrites charge only the delta.
//! - Flush writes keys in ascending lexicographic order, which is the
//!   on-disk sort invariant of segment files.
//! - All state lives behind a single internal mutex, so one memtable
//!   can be shared between the foreground writer and a background
//!   flush without callers managing locks themselves.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::segment::{self, SegmentError, SegmentId, SegmentReader, SegmentWriter};

/// Bytes charged per entry on top of key and value: the stored timestamp.
const ENTRY_OVERHEAD: u64 = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// The requested key is not present.
    #[error("key does not exist")]
    KeyDoesNotExist,

    /// The write would raise bytes-occupied above the size limit.
    /// Callers treat this as the rotation signal.
    #[error("maximum memtable size reached")]
    MaxSizeExceeded,

    /// Segment file failure during flush or load.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// Value half of a memtable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Wall-clock seconds since the UNIX epoch at write time.
    pub timestamp: i64,
    pub value: String,
}

/// State behind the memtable's single internal lock.
struct MemtableInner {
    /// The id this memtable will assume when flushed.
    segment_id: SegmentId,

    /// Sorted key → entry map; iteration order is the flush order.
    entries: BTreeMap<String, KeyEntry>,

    /// Sum of `len(key) + len(value) + 8` over all entries.
    bytes_occupied: u64,
}

/// A bounded in-memory key → `(timestamp, value)` buffer.
///
/// # Concurrency
///
/// Every operation acquires the internal mutex, so a `Memtable` behind
/// an `Arc` is safe to read from the foreground while a background task
/// flushes it. The mutex is a leaf lock — no other engine lock is ever
/// acquired while holding it.
pub struct Memtable {
    db_name: String,
    dir: PathBuf,
    size_limit: u64,
    inner: Mutex<MemtableInner>,
}

impl Memtable {
    /// Creates an empty memtable pre-assigned a segment id.
    pub fn new(db_name: &str, dir: &Path, segment_id: SegmentId, size_limit: u64) -> Self {
        Self {
            db_name: db_name.to_string(),
            dir: dir.to_path_buf(),
            size_limit,
            inner: Mutex::new(MemtableInner {
                segment_id,
                entries: BTreeMap::new(),
                bytes_occupied: 0,
            }),
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, MemtableInner>, MemtableError> {
        self.inner.lock().map_err(|_| {
            error!("memtable mutex poisoned");
            MemtableError::Internal("memtable mutex poisoned".into())
        })
    }

    /// Inserts or overwrites a key, stamping it with the current
    /// wall-clock time in seconds.
    ///
    /// # Behavior
    /// - An overwrite charges only the size delta against the limit.
    /// - A record that fits the remaining budget exactly succeeds; the
    ///   limit check is a strict inequality.
    /// - On [`MemtableError::MaxSizeExceeded`] the map is left untouched.
    pub fn put(&self, key: &str, value: &str) -> Result<(), MemtableError> {
        let entry = KeyEntry {
            timestamp: current_timestamp(),
            value: value.to_string(),
        };
        self.insert_entry(key.to_string(), entry)
    }

    /// Timestamp-preserving insert with the same size accounting as
    /// [`Memtable::put`]. Used by compaction staging.
    pub(crate) fn insert_entry(&self, key: String, entry: KeyEntry) -> Result<(), MemtableError> {
        let mut inner = self.lock_inner()?;

        let new_bytes = key.len() as u64 + entry.value.len() as u64 + ENTRY_OVERHEAD;
        let old_bytes = inner
            .entries
            .get(&key)
            .map(|e| key.len() as u64 + e.value.len() as u64 + ENTRY_OVERHEAD)
            .unwrap_or(0);

        let projected = inner.bytes_occupied - old_bytes + new_bytes;
        if projected > self.size_limit {
            trace!(
                db = %self.db_name,
                key_len = key.len(),
                occupied = inner.bytes_occupied,
                limit = self.size_limit,
                "put rejected: memtable full"
            );
            return Err(MemtableError::MaxSizeExceeded);
        }

        inner.entries.insert(key, entry);
        inner.bytes_occupied = projected;
        Ok(())
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &str) -> Result<String, MemtableError> {
        self.lock_inner()?
            .entries
            .get(key)
            .map(|e| e.value.clone())
            .ok_or(MemtableError::KeyDoesNotExist)
    }

    /// Membership test without materialising the value.
    pub fn contains(&self, key: &str) -> Result<bool, MemtableError> {
        Ok(self.lock_inner()?.entries.contains_key(key))
    }

    /// The segment id this memtable will assume on flush.
    pub fn segment_id(&self) -> Result<SegmentId, MemtableError> {
        Ok(self.lock_inner()?.segment_id)
    }

    /// Reassigns the flush target id. Compaction staging moves through
    /// the reusable ids with this.
    pub(crate) fn set_segment_id(&self, id: SegmentId) -> Result<(), MemtableError> {
        self.lock_inner()?.segment_id = id;
        Ok(())
    }

    /// Current bytes-occupied figure.
    pub fn bytes_occupied(&self) -> Result<u64, MemtableError> {
        Ok(self.lock_inner()?.bytes_occupied)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> Result<usize, MemtableError> {
        Ok(self.lock_inner()?.entries.len())
    }

    /// True when the memtable holds no entries.
    pub fn is_empty(&self) -> Result<bool, MemtableError> {
        Ok(self.lock_inner()?.entries.is_empty())
    }

    /// Ingests every record of segment `id` and adopts that id.
    ///
    /// Invoked on startup (to pre-warm the write path from the newest
    /// level-0 segment), for per-segment read probes, and by compaction.
    /// No size-limit check is applied; a pre-warmed memtable that is
    /// already at capacity simply rotates on the next put.
    pub fn load_from_segment(&self, id: SegmentId) -> Result<(), MemtableError> {
        let path = segment::segment_path(&self.dir, id);
        let reader = SegmentReader::open(&path)?;

        let mut inner = self.lock_inner()?;
        inner.segment_id = id;

        let mut loaded = 0usize;
        for rec in reader.records() {
            inner.bytes_occupied += rec.key.len() as u64 + rec.value.len() as u64 + ENTRY_OVERHEAD;
            inner.entries.insert(
                rec.key,
                KeyEntry {
                    timestamp: rec.timestamp,
                    value: rec.value,
                },
            );
            loaded += 1;
        }

        debug!(db = %self.db_name, segment = id, records = loaded, "segment loaded into memtable");
        Ok(())
    }

    /// Serialises the map to `<dir>/<segment_id>.seg` in ascending key
    /// order, truncating any pre-existing file, and fsyncs it.
    ///
    /// # Returns
    /// The distinct-key count and whether a file of that name already
    /// existed. Compaction re-uses ids, so `already_existed` is normal
    /// there; a fresh level-0 flush allocates a new id and reports
    /// `false`.
    pub fn flush(&self) -> Result<(u32, bool), MemtableError> {
        let inner = self.lock_inner()?;

        let path = segment::segment_path(&self.dir, inner.segment_id);
        let already_existed = path.exists();

        let mut writer = SegmentWriter::create(&path)?;
        for (key, entry) in &inner.entries {
            writer.append(entry.timestamp, key, &entry.value)?;
        }
        writer.finish()?;

        let cardinality = inner.entries.len() as u32;
        info!(
            db = %self.db_name,
            segment = inner.segment_id,
            cardinality,
            already_existed,
            "memtable flushed"
        );

        Ok((cardinality, already_existed))
    }

    /// Drops all entries and resets bytes-occupied to zero.
    pub fn clear(&self) -> Result<(), MemtableError> {
        let mut inner = self.lock_inner()?;
        inner.entries.clear();
        inner.bytes_occupied = 0;
        Ok(())
    }

    /// Copies `src`'s entries, bytes-occupied and segment id into this
    /// memtable. Rotation uses this to hand the full buffer to the
    /// background flusher while the (empty) original takes a fresh id.
    pub(crate) fn adopt(&self, src: &Memtable) -> Result<(), MemtableError> {
        // Snapshot the source first so the two leaf locks are never
        // held at the same time.
        let (segment_id, entries, bytes_occupied) = {
            let src_inner = src.lock_inner()?;
            (
                src_inner.segment_id,
                src_inner.entries.clone(),
                src_inner.bytes_occupied,
            )
        };

        let mut inner = self.lock_inner()?;
        inner.segment_id = segment_id;
        inner.entries = entries;
        inner.bytes_occupied = bytes_occupied;
        Ok(())
    }

    /// Sorted snapshot of all entries. Compaction merges these across
    /// segments.
    pub(crate) fn entries_snapshot(&self) -> Result<Vec<(String, KeyEntry)>, MemtableError> {
        Ok(self
            .lock_inner()?
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Current wall-clock time in whole seconds since the UNIX epoch.
fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs() as i64
}
