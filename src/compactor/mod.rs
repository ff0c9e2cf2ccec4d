//! # Compactor Module
//!
//! Leveled merge compaction. Each level holds at most
//! `level_capacity(L) = 10^L` segments; when a level exceeds its
//! capacity, its **oldest** segment is merged with *all* segments of the
//! next level into new sorted segments at that next level, and the chain
//! cascades while any level overflows.
//!
//! ## Merge rule
//!
//! Participating segments are ingested in **descending segment id**
//! order with first-writer-wins: a key already present in the merged map
//! came from a newer segment and is kept. Higher segment id implies
//! newer content, so this resolves duplicates "newer wins" without
//! consulting timestamps.
//!
//! ## Id reuse
//!
//! The participants' ids, taken from the end of the encounter order
//! backwards, name the output segments. Reusing ids lets the compactor
//! delete the old files and emit new content without renames; output
//! segments land on the target level in the order they are flushed.
//!
//! ## Failure model
//!
//! The merge is read-only until every participant has been loaded. Any
//! error during the mutate phase restores the manifest's in-memory state
//! from a pre-mutation snapshot, so an aborted compaction leaves the
//! manifest untouched and the watcher may retry on the next trigger.
//!
//! ## Concurrency
//!
//! A per-level gate serialises compactions into the same target level;
//! compactions into different levels proceed in parallel.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::manifest::{self, Manifest, ManifestError, SegmentMeta};
use crate::memtable::{KeyEntry, Memtable, MemtableError};
use crate::segment::{self, SegmentError, SegmentId};

/// Maximum number of segments level `level` may hold before it is
/// compacted into the next level.
pub fn level_capacity(level: u32) -> u64 {
    10u64.saturating_pow(level)
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactorError {
    /// The source level has no segment to merge. Benign: there is
    /// nothing to do.
    #[error("segment level is empty")]
    LevelEmpty,

    /// Manifest failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Memtable failure while loading or staging.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Segment file failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Per-level gates
// ------------------------------------------------------------------------------------------------

/// Gate serialising compactions into one level.
pub struct LevelGate {
    level: u32,
    gate: Mutex<()>,
}

impl LevelGate {
    /// Holds the gate for the duration of a compaction into this level.
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>, CompactorError> {
        self.gate.lock().map_err(|_| {
            error!(level = self.level, "level gate poisoned");
            CompactorError::Internal("level gate poisoned".into())
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

/// Registry of per-level gates, grown on demand alongside the
/// manifest's levels.
pub struct LevelGates {
    inner: Mutex<Vec<Arc<LevelGate>>>,
}

impl LevelGates {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Vec<Arc<LevelGate>>>, CompactorError> {
        self.inner.lock().map_err(|_| {
            error!("level gate registry poisoned");
            CompactorError::Internal("level gate registry poisoned".into())
        })
    }

    /// Returns the gate for `level`, creating it (and any missing
    /// lower-level gates) on first reference.
    pub fn ensure(&self, level: u32) -> Result<Arc<LevelGate>, CompactorError> {
        let mut gates = self.lock_inner()?;
        while gates.len() <= level as usize {
            let next_level = gates.len() as u32;
            gates.push(Arc::new(LevelGate {
                level: next_level,
                gate: Mutex::new(()),
            }));
        }
        Ok(Arc::clone(&gates[level as usize]))
    }

    /// Drops every gate, as part of database destruction.
    pub fn clear(&self) -> Result<(), CompactorError> {
        self.lock_inner()?.clear();
        Ok(())
    }
}

impl Default for LevelGates {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction context
// ------------------------------------------------------------------------------------------------

/// Everything a compaction needs from the owning store.
pub(crate) struct CompactionCtx<'a> {
    pub db_name: &'a str,
    pub dir: &'a Path,
    /// Staging memtables flush at this size, so output segments match
    /// the configured memtable size limit.
    pub size_limit: u64,
    pub manifest: &'a Manifest,
    pub gates: &'a LevelGates,
}

// ------------------------------------------------------------------------------------------------
// Compaction driver
// ------------------------------------------------------------------------------------------------

/// Runs merge compactions starting at `start_level` and cascading
/// upwards while any level exceeds its capacity. Errors end the chain;
/// the watcher retries on the next trigger.
pub(crate) fn compact_chain(ctx: &CompactionCtx<'_>, start_level: u32) {
    let mut level = start_level;
    loop {
        let count = match ctx.manifest.segment_count(level) {
            Ok(count) => count,
            Err(e) => {
                error!(level, error = %e, "cannot read level size; ending compaction chain");
                return;
            }
        };

        if count as u64 <= level_capacity(level) {
            break;
        }

        match compact_level(ctx, level) {
            Ok(()) => level += 1,
            Err(CompactorError::LevelEmpty) => break,
            Err(e) => {
                error!(level, error = %e, "merge compaction aborted");
                break;
            }
        }
    }
}

/// Merges the oldest segment of `source` with all segments of
/// `source + 1`.
pub(crate) fn compact_level(ctx: &CompactionCtx<'_>, source: u32) -> Result<(), CompactorError> {
    let target = source + 1;
    info!(db = %ctx.db_name, from = source, to = target, "merge compaction started");

    // 1. The target level and its gate exist before anything else.
    if ctx.manifest.ensure_level(target)? {
        ctx.manifest.rewrite()?;
    }
    let gate = ctx.gates.ensure(target)?;
    let _serialised = gate.lock()?;

    // 2. Read phase — no manifest mutation yet.
    let oldest = ctx
        .manifest
        .level_segments(source)?
        .first()
        .copied()
        .ok_or(CompactorError::LevelEmpty)?;
    let target_segments = ctx.manifest.level_segments(target)?;

    let mut participants: Vec<SegmentMeta> = target_segments;
    participants.push(oldest);
    participants.sort_by(|a, b| b.segment_id.cmp(&a.segment_id));

    // 3. Newer segment ids are ingested first; an already-present key
    //    is from a newer segment and wins.
    let mut merged: BTreeMap<String, KeyEntry> = BTreeMap::new();
    for meta in &participants {
        let scratch = Memtable::new(ctx.db_name, ctx.dir, meta.segment_id, u64::MAX);
        scratch.load_from_segment(meta.segment_id)?;
        for (key, entry) in scratch.entries_snapshot()? {
            merged.entry(key).or_insert(entry);
        }
    }

    let input_keys: usize = merged.len();
    let reuse_ids: Vec<SegmentId> = participants.iter().map(|m| m.segment_id).collect();

    // 4. Mutate phase — roll the manifest back if anything fails.
    let rollback = ctx.manifest.snapshot()?;
    match apply_merge(ctx, source, target, oldest, &participants, merged, reuse_ids) {
        Ok(outputs) => {
            info!(
                db = %ctx.db_name,
                from = source,
                to = target,
                merged_keys = input_keys,
                output_segments = outputs,
                "merge compaction finished"
            );
            Ok(())
        }
        Err(e) => {
            warn!(
                db = %ctx.db_name,
                from = source,
                to = target,
                error = %e,
                "merge compaction aborted; manifest restored"
            );
            ctx.manifest.restore(rollback)?;
            Err(e)
        }
    }
}

/// The mutate phase: pops the source head, deletes the participating
/// files, streams the merged map through a staging memtable onto the
/// reusable ids, and records the outputs on the target level.
///
/// Returns the number of output segments.
fn apply_merge(
    ctx: &CompactionCtx<'_>,
    source: u32,
    target: u32,
    expected_oldest: SegmentMeta,
    participants: &[SegmentMeta],
    merged: BTreeMap<String, KeyEntry>,
    mut reuse_ids: Vec<SegmentId>,
) -> Result<usize, CompactorError> {
    let popped = ctx
        .manifest
        .pop_oldest(source)?
        .ok_or(CompactorError::LevelEmpty)?;
    if popped.segment_id != expected_oldest.segment_id {
        return Err(CompactorError::Internal(format!(
            "level {source} head changed during compaction: expected segment {}, found {}",
            expected_oldest.segment_id, popped.segment_id
        )));
    }

    // 5. Delete the old files and empty the target's segment list.
    for meta in participants {
        fs::remove_file(segment::segment_path(ctx.dir, meta.segment_id))?;
    }
    ctx.manifest.set_level_segments(target, Vec::new())?;

    // 6. Stream the merged map through a staging memtable, flushing to
    //    the next reusable id whenever it fills up.
    let mut outputs = 0usize;
    let mut current_id = next_output_id(ctx, &mut reuse_ids)?;
    let staging = Memtable::new(ctx.db_name, ctx.dir, current_id, ctx.size_limit);

    for (key, entry) in merged {
        match staging.insert_entry(key.clone(), entry.clone()) {
            Ok(()) => {}
            Err(MemtableError::MaxSizeExceeded) => {
                let (cardinality, _) = staging.flush()?;
                ctx.manifest.append_segment(
                    target,
                    SegmentMeta {
                        segment_id: current_id,
                        cardinality,
                    },
                )?;
                outputs += 1;

                staging.clear()?;
                current_id = next_output_id(ctx, &mut reuse_ids)?;
                staging.set_segment_id(current_id)?;

                if let Err(MemtableError::MaxSizeExceeded) =
                    staging.insert_entry(key.clone(), entry.clone())
                {
                    // A single record larger than the memtable limit
                    // gets its own segment.
                    warn!(
                        db = %ctx.db_name,
                        key_len = key.len(),
                        value_len = entry.value.len(),
                        "record exceeds the memtable limit; emitting a singleton segment"
                    );
                    let singleton = Memtable::new(ctx.db_name, ctx.dir, current_id, u64::MAX);
                    singleton.insert_entry(key, entry)?;
                    let (cardinality, _) = singleton.flush()?;
                    ctx.manifest.append_segment(
                        target,
                        SegmentMeta {
                            segment_id: current_id,
                            cardinality,
                        },
                    )?;
                    outputs += 1;

                    current_id = next_output_id(ctx, &mut reuse_ids)?;
                    staging.set_segment_id(current_id)?;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !staging.is_empty()? {
        let (cardinality, _) = staging.flush()?;
        ctx.manifest.append_segment(
            target,
            SegmentMeta {
                segment_id: current_id,
                cardinality,
            },
        )?;
        outputs += 1;
    }

    // 7. Persist the new shape. Failing here cannot be tolerated: the
    //    old files are gone and only the rewritten manifest reflects
    //    what replaced them.
    manifest::rewrite_or_abort(ctx.manifest);

    debug!(
        db = %ctx.db_name,
        target,
        outputs,
        unused_reuse_ids = reuse_ids.len(),
        "compaction outputs recorded"
    );
    Ok(outputs)
}

/// Next output id: the reusable ids are consumed from the end of the
/// encounter order backwards; a fresh id is allocated only if they run
/// out, which merging alone cannot cause.
fn next_output_id(
    ctx: &CompactionCtx<'_>,
    reuse_ids: &mut Vec<SegmentId>,
) -> Result<SegmentId, CompactorError> {
    match reuse_ids.pop() {
        Some(id) => Ok(id),
        None => {
            let id = ctx.manifest.new_segment_id()?;
            warn!(db = %ctx.db_name, id, "compaction ran out of reusable ids; allocated a fresh one");
            Ok(id)
        }
    }
}
