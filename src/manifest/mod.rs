//! # Manifest Module
//!
//! The manifest is the durable, authoritative description of a database:
//! its name, the list of levels, each level's ordered segment list
//! (oldest first) and the highest segment id ever allocated. It is the
//! single source of truth the read path and compactor consult, and it is
//! rewritten in full after every structural change.
//!
//! ## On-disk format
//!
//! One self-describing JSON document per database at
//! `<db_dir>/manifest.json`. The field names are part of the format:
//!
//! ```json
//! {
//!   "DbName": "testdb",
//!   "NumberOfLevels": 2,
//!   "SegmentLevels": [
//!     { "Segments": [ { "SegmentId": 4, "Cardinality": 120 } ] },
//!     { "Segments": [ { "SegmentId": 2, "Cardinality": 310 } ] }
//!   ],
//!   "MaxSegmentId": 4
//! }
//! ```
//!
//! ## Thread safety
//!
//! All state sits behind one mutex; every structural read or write —
//! segment list mutation, max-id allocation, level count change —
//! acquires it. This lock is the top of the engine's lock order: it is
//! never acquired while holding a level gate or a memtable lock.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::segment::SegmentId;

/// Manifest filename inside a database directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialisation / deserialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A level index that the manifest does not track.
    #[error("level {0} does not exist")]
    UnknownLevel(u32),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Manifest data structures
// ------------------------------------------------------------------------------------------------

/// One segment as tracked by a level: its id and distinct-key count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SegmentMeta {
    pub segment_id: SegmentId,
    pub cardinality: u32,
}

/// One level: its segments in insertion order, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SegmentLevel {
    pub segments: Vec<SegmentMeta>,
}

/// The serialised manifest document. Field names map 1:1 onto the JSON
/// schema via the PascalCase rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ManifestData {
    db_name: String,
    number_of_levels: u32,
    segment_levels: Vec<SegmentLevel>,
    max_segment_id: SegmentId,
}

// ------------------------------------------------------------------------------------------------
// Manifest core
// ------------------------------------------------------------------------------------------------

/// Durable metadata manager for one database.
///
/// # Durability rule
///
/// Mutations update the in-memory state under the lock; callers invoke
/// [`Manifest::rewrite`] after each structural change so that the
/// on-disk document is a faithful reflection of the on-disk segment
/// files at every quiescent point.
#[derive(Debug)]
pub struct Manifest {
    /// Path of the `manifest.json` document.
    path: PathBuf,

    /// In-memory manifest state protected by the top-level lock.
    data: Mutex<ManifestData>,
}

impl Manifest {
    /// Loads the manifest from `db_dir`, or creates an empty one with
    /// `MaxSegmentId = 1` if none exists (the first memtable assumes
    /// id 1 without a separate allocation).
    ///
    /// # Returns
    /// The manifest and whether it was freshly created.
    pub fn open(db_dir: &Path, db_name: &str) -> Result<(Self, bool), ManifestError> {
        let path = db_dir.join(MANIFEST_FILENAME);

        if path.exists() {
            let bytes = fs::read(&path)?;
            let data: ManifestData = serde_json::from_slice(&bytes)?;
            info!(
                db = db_name,
                levels = data.number_of_levels,
                max_segment_id = data.max_segment_id,
                "manifest loaded"
            );
            Ok((
                Self {
                    path,
                    data: Mutex::new(data),
                },
                false,
            ))
        } else {
            let manifest = Self {
                path,
                data: Mutex::new(ManifestData {
                    db_name: db_name.to_string(),
                    number_of_levels: 0,
                    segment_levels: Vec::new(),
                    max_segment_id: 1,
                }),
            };
            manifest.rewrite()?;
            info!(db = db_name, "manifest created");
            Ok((manifest, true))
        }
    }

    fn lock_data(&self) -> Result<MutexGuard<'_, ManifestData>, ManifestError> {
        self.data.lock().map_err(|_| {
            error!("manifest mutex poisoned");
            ManifestError::Internal("manifest mutex poisoned".into())
        })
    }

    /// Truncates and rewrites `manifest.json` from the current in-memory
    /// state, then fsyncs. The lock is held across the write so two
    /// rewrites cannot interleave.
    pub fn rewrite(&self) -> Result<(), ManifestError> {
        let data = self.lock_data()?;
        let bytes = serde_json::to_vec(&*data)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        Ok(())
    }

    // --------------------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------------------

    /// The database name recorded in the manifest.
    pub fn db_name(&self) -> Result<String, ManifestError> {
        Ok(self.lock_data()?.db_name.clone())
    }

    /// Highest segment id ever allocated.
    pub fn max_segment_id(&self) -> Result<SegmentId, ManifestError> {
        Ok(self.lock_data()?.max_segment_id)
    }

    /// Number of levels currently tracked.
    pub fn number_of_levels(&self) -> Result<u32, ManifestError> {
        Ok(self.lock_data()?.number_of_levels)
    }

    /// The ordered segment list of `level` (oldest first).
    pub fn level_segments(&self, level: u32) -> Result<Vec<SegmentMeta>, ManifestError> {
        let data = self.lock_data()?;
        data.segment_levels
            .get(level as usize)
            .map(|l| l.segments.clone())
            .ok_or(ManifestError::UnknownLevel(level))
    }

    /// Number of segments in `level`; zero for a level that does not
    /// exist yet.
    pub fn segment_count(&self, level: u32) -> Result<usize, ManifestError> {
        let data = self.lock_data()?;
        Ok(data
            .segment_levels
            .get(level as usize)
            .map(|l| l.segments.len())
            .unwrap_or(0))
    }

    /// A consistent copy of every level's segment list, for the read
    /// path to walk without holding the lock across file probes.
    pub fn levels_snapshot(&self) -> Result<Vec<Vec<SegmentMeta>>, ManifestError> {
        let data = self.lock_data()?;
        Ok(data
            .segment_levels
            .iter()
            .map(|l| l.segments.clone())
            .collect())
    }

    // --------------------------------------------------------------------
    // Mutation methods
    // --------------------------------------------------------------------

    /// Allocates the next segment id: increments `MaxSegmentId` under
    /// the lock and returns the new value, so two concurrent rotations
    /// cannot collide.
    pub fn new_segment_id(&self) -> Result<SegmentId, ManifestError> {
        let mut data = self.lock_data()?;
        data.max_segment_id += 1;
        Ok(data.max_segment_id)
    }

    /// Makes sure levels `0..=level` exist, appending empty level
    /// metadata as needed. Returns `true` if any level was created.
    pub fn ensure_level(&self, level: u32) -> Result<bool, ManifestError> {
        let mut data = self.lock_data()?;
        let mut created = false;
        while data.number_of_levels <= level {
            data.segment_levels.push(SegmentLevel::default());
            data.number_of_levels += 1;
            created = true;
        }
        Ok(created)
    }

    /// Appends a segment to the tail of `level` (the tail is the newest).
    pub fn append_segment(&self, level: u32, meta: SegmentMeta) -> Result<(), ManifestError> {
        let mut data = self.lock_data()?;
        data.segment_levels
            .get_mut(level as usize)
            .ok_or(ManifestError::UnknownLevel(level))?
            .segments
            .push(meta);
        Ok(())
    }

    /// Removes and returns the oldest segment of `level` (the head of
    /// its list), or `None` when the level is empty.
    pub fn pop_oldest(&self, level: u32) -> Result<Option<SegmentMeta>, ManifestError> {
        let mut data = self.lock_data()?;
        let segments = &mut data
            .segment_levels
            .get_mut(level as usize)
            .ok_or(ManifestError::UnknownLevel(level))?
            .segments;
        if segments.is_empty() {
            return Ok(None);
        }
        Ok(Some(segments.remove(0)))
    }

    /// Replaces the whole segment list of `level`.
    pub fn set_level_segments(
        &self,
        level: u32,
        segments: Vec<SegmentMeta>,
    ) -> Result<(), ManifestError> {
        let mut data = self.lock_data()?;
        data.segment_levels
            .get_mut(level as usize)
            .ok_or(ManifestError::UnknownLevel(level))?
            .segments = segments;
        Ok(())
    }

    /// Finds segment `id` in whichever level it currently lives and
    /// updates its cardinality. Returns `false` when no level tracks it.
    ///
    /// This is the safeguard for flushes whose target file pre-existed
    /// (a pre-warmed memtable rewriting its own segment, or compaction
    /// id reuse).
    pub fn update_cardinality(&self, id: SegmentId, cardinality: u32) -> Result<bool, ManifestError> {
        let mut data = self.lock_data()?;
        for level in &mut data.segment_levels {
            if let Some(meta) = level.segments.iter_mut().find(|m| m.segment_id == id) {
                meta.cardinality = cardinality;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Clears all level state and resets the id counter, as part of
    /// database destruction.
    pub fn reset(&self) -> Result<(), ManifestError> {
        let mut data = self.lock_data()?;
        data.segment_levels.clear();
        data.number_of_levels = 0;
        data.max_segment_id = 1;
        Ok(())
    }

    // --------------------------------------------------------------------
    // Compaction rollback support
    // --------------------------------------------------------------------

    /// Copy of the full in-memory state, taken before a compaction
    /// starts mutating level lists.
    pub(crate) fn snapshot(&self) -> Result<ManifestData, ManifestError> {
        Ok(self.lock_data()?.clone())
    }

    /// Restores a snapshot taken by [`Manifest::snapshot`], so an
    /// aborted compaction leaves the manifest untouched.
    pub(crate) fn restore(&self, snapshot: ManifestData) -> Result<(), ManifestError> {
        *self.lock_data()? = snapshot;
        Ok(())
    }
}

/// Rewrites the manifest, aborting the process on failure.
///
/// Background tasks have no caller to surface the error to, and
/// continuing after a failed rewrite would let the in-memory state
/// diverge from the on-disk manifest.
pub(crate) fn rewrite_or_abort(manifest: &Manifest) {
    if let Err(e) = manifest.rewrite() {
        error!(error = %e, "manifest rewrite failed; aborting");
        std::process::abort();
    }
}
