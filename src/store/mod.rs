//! # Disk Store
//!
//! The public façade of the storage engine. A [`DiskStore`] owns the
//! active memtable, the optional auxiliary memtable, the manifest and
//! the per-level compaction gates, and orchestrates writes, reads,
//! flushes, compactions, open/close and destroy.
//!
//! ## Write path
//!
//! Puts land in the active memtable. When one would overflow it, the
//! store *rotates*: the full buffer is copied into a fresh auxiliary
//! memtable, an empty active memtable with a newly allocated segment id
//! takes its place, and a background task flushes the auxiliary to a
//! level-0 segment. At most one flush is outstanding per database —
//! a rotation that finds one still running blocks on it (the
//! back-pressure that bounds memory use).
//!
//! ## Read path
//!
//! Strictly newest-first: active memtable → auxiliary memtable → for
//! each level, that level's segments newest-first. The first hit wins;
//! absence is the empty string. No key in the auxiliary memtable can
//! shadow a fresher write, because any newer write went to the active
//! memtable, which is consulted first.
//!
//! ## Lock order
//!
//! rotation gate > active slot > aux slot on the write side; level
//! gate first on the compaction side. The manifest lock and the
//! memtable mutexes are leaves: every manifest operation acquires and
//! releases the lock internally, and no other lock is ever taken while
//! holding a memtable's.
//!
//! ## Durability
//!
//! Segments are written in full and fsync'd before the manifest refers
//! to them, so readers never observe a partially-written segment. There
//! is no write-ahead log: a crash loses the in-memory tail by design,
//! and recovery reads only what segments and manifest recorded.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compactor::{self, CompactionCtx, CompactorError, LevelGates};
use crate::manifest::{self, Manifest, ManifestError, SegmentMeta};
use crate::memtable::{Memtable, MemtableError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by [`DiskStore`] operations.
///
/// Internal signals (`MaxSizeExceeded`, `KeyDoesNotExist`) are consumed
/// inside the engine and never reach callers; a missing key reads as
/// the empty string.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Manifest failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Memtable failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Compaction machinery failure.
    #[error("compactor error: {0}")]
    Compactor(#[from] CompactorError),

    /// A single record larger than the memtable size limit.
    #[error("record exceeds the memtable size limit")]
    RecordTooLarge,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Deployment stage a store runs under. Recorded at open for
/// diagnostics; `Test` is what the test suites use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dev,
    Prod,
    Test,
}

/// Configuration passed to [`DiskStore::open`]. Internal components
/// receive the values they need from it; there is no process-wide
/// state.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem root under which each database gets a directory.
    pub root_path: PathBuf,

    /// Memtable size limit in bytes, consulted on every put.
    pub memtable_size_limit: u64,

    pub stage: Stage,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("data"),
            memtable_size_limit: 4 * 1024,
            stage: Stage::Dev,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store core
// ------------------------------------------------------------------------------------------------

/// State shared between [`DiskStore`] clones and background tasks.
struct StoreShared {
    config: DbConfig,
    name: String,
    dir: PathBuf,
    manifest: Manifest,

    /// The memtable accepting writes. The slot lock only guards the
    /// handle swap; the memtable itself carries its own internal lock.
    active: RwLock<Arc<Memtable>>,

    /// Read handle onto the memtable being flushed, if any. Dropped by
    /// the flush task on completion.
    aux: RwLock<Option<Arc<Memtable>>>,

    /// Per-level compaction gates.
    gates: LevelGates,

    /// Serialises rotations so concurrent writers cannot double-swap.
    rotation: Mutex<()>,

    /// The at-most-one outstanding background flush. Waiting for it is
    /// joining the handle; a failed flush surfaces its error to the
    /// next waiter.
    flush_task: Mutex<Option<JoinHandle<Result<(), StoreError>>>>,

    /// Running compaction tasks, drained by close and cleanup.
    compactions: Mutex<Vec<JoinHandle<()>>>,
}

/// The public handle of one database.
///
/// Cloning is cheap and clones share all state, so a store can be
/// handed to multiple threads.
pub struct DiskStore {
    shared: Arc<StoreShared>,
}

impl Clone for DiskStore {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl DiskStore {
    /// Opens (or creates) the database `name` under `config.root_path`.
    ///
    /// # Behavior
    /// - Creates `<root>/<name>/` if absent.
    /// - Creates an empty manifest (`MaxSegmentId = 1`) on first open;
    ///   otherwise loads it.
    /// - When level 0 is non-empty, pre-warms the active memtable from
    ///   the newest level-0 segment so hot keys hit memory immediately
    ///   and level 0 needs no scan for them.
    pub fn open(config: DbConfig, name: &str) -> Result<Self, StoreError> {
        let dir = config.root_path.join(name);
        fs::create_dir_all(&dir)?;

        let (manifest, created) = Manifest::open(&dir, name)?;

        let gates = LevelGates::new();
        for level in 0..manifest.number_of_levels()? {
            gates.ensure(level)?;
        }

        let levels = manifest.levels_snapshot()?;
        let newest_l0 = levels.first().and_then(|l0| l0.last()).copied();

        let active = match newest_l0 {
            Some(meta) => {
                let memtable = Memtable::new(
                    name,
                    &dir,
                    meta.segment_id,
                    config.memtable_size_limit,
                );
                memtable.load_from_segment(meta.segment_id)?;
                debug!(
                    db = name,
                    segment = meta.segment_id,
                    "active memtable pre-warmed from newest level-0 segment"
                );
                memtable
            }
            None if created => {
                // A fresh manifest starts at MaxSegmentId = 1 with id 1
                // pre-assigned to the first memtable.
                Memtable::new(name, &dir, manifest.max_segment_id()?, config.memtable_size_limit)
            }
            None => Memtable::new(name, &dir, manifest.new_segment_id()?, config.memtable_size_limit),
        };

        info!(
            db = name,
            stage = ?config.stage,
            dir = %dir.display(),
            fresh = created,
            "database opened"
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                name: name.to_string(),
                dir,
                manifest,
                active: RwLock::new(Arc::new(active)),
                aux: RwLock::new(None),
                gates,
                rotation: Mutex::new(()),
                flush_task: Mutex::new(None),
                compactions: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    // --------------------------------------------------------------------
    // Public API
    // --------------------------------------------------------------------

    /// Inserts or overwrites a key.
    ///
    /// A put that would overflow the active memtable triggers a
    /// rotation (see the module docs) and is retried into the fresh
    /// buffer, which is guaranteed to accept it unless the record alone
    /// exceeds the memtable size limit.
    pub fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // The slot guard is held across the memtable put so a rotation
        // cannot swap the buffer out from under a write in flight.
        {
            let slot = self
                .shared
                .active
                .read()
                .map_err(|_| StoreError::Internal("active memtable lock poisoned".into()))?;
            match slot.put(key, value) {
                Ok(()) => return Ok(()),
                Err(MemtableError::MaxSizeExceeded) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.rotate_and_put(key, value)
    }

    /// Looks up a key; the empty string means "not found".
    ///
    /// Consultation order is strictly newest-first: active memtable,
    /// auxiliary memtable, then every level's segments newest-first.
    /// An unreadable segment is logged and treated as not holding the
    /// key.
    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        {
            let slot = self
                .shared
                .active
                .read()
                .map_err(|_| StoreError::Internal("active memtable lock poisoned".into()))?;
            match slot.get(key) {
                Ok(value) => return Ok(value),
                Err(MemtableError::KeyDoesNotExist) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let aux = self
            .shared
            .aux
            .read()
            .map_err(|_| StoreError::Internal("aux memtable lock poisoned".into()))?
            .clone();
        if let Some(aux) = aux {
            match aux.get(key) {
                Ok(value) => return Ok(value),
                Err(MemtableError::KeyDoesNotExist) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let levels = self.shared.manifest.levels_snapshot()?;
        for (level, segments) in levels.iter().enumerate() {
            for meta in segments.iter().rev() {
                let scratch = Memtable::new(
                    &self.shared.name,
                    &self.shared.dir,
                    meta.segment_id,
                    u64::MAX,
                );
                if let Err(e) = scratch.load_from_segment(meta.segment_id) {
                    warn!(
                        db = %self.shared.name,
                        level,
                        segment = meta.segment_id,
                        error = %e,
                        "segment unreadable during lookup; skipping"
                    );
                    continue;
                }
                match scratch.get(key) {
                    Ok(value) => return Ok(value),
                    Err(MemtableError::KeyDoesNotExist) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(String::new())
    }

    /// Gracefully shuts the store down: waits for the in-flight flush
    /// and all running compactions, flushes the active memtable to
    /// level 0 as a final segment (when it holds data) and rewrites
    /// the manifest.
    ///
    /// After the final flush the store swaps in a fresh active memtable
    /// with a newly allocated segment id, exactly as a rotation does.
    /// Clearing the flushed buffer in place would let a later flush
    /// re-truncate the segment the first close already made durable.
    pub fn close(&self) -> Result<(), StoreError> {
        info!(db = %self.shared.name, "closing database");

        self.wait_for_flush()?;
        self.drain_compactions()?;

        let active = self.active_handle()?;
        if !active.is_empty()? {
            self.shared.manifest.ensure_level(0)?;
            self.shared.gates.ensure(0)?;

            let segment_id = active.segment_id()?;
            let (cardinality, already_existed) = active.flush()?;
            self.record_flushed_segment(segment_id, cardinality, already_existed)?;

            let new_id = self.shared.manifest.new_segment_id()?;
            let mut slot = self
                .shared
                .active
                .write()
                .map_err(|_| StoreError::Internal("active memtable lock poisoned".into()))?;
            *slot = Arc::new(Memtable::new(
                &self.shared.name,
                &self.shared.dir,
                new_id,
                self.shared.config.memtable_size_limit,
            ));
        }

        self.shared.manifest.rewrite()?;

        Ok(())
    }

    /// Destroys the database: waits for in-flight work, deletes the
    /// database directory and everything beneath it, and resets the
    /// in-memory state. Idempotent; a destroyed store reads as empty.
    pub fn cleanup(&self) -> Result<(), StoreError> {
        info!(db = %self.shared.name, "destroying database");

        self.wait_for_flush()?;
        self.drain_compactions()?;

        match fs::remove_dir_all(&self.shared.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.shared.manifest.reset()?;
        self.active_handle()?.clear()?;
        *self
            .shared
            .aux
            .write()
            .map_err(|_| StoreError::Internal("aux memtable lock poisoned".into()))? = None;
        self.shared.gates.clear()?;

        Ok(())
    }

    // --------------------------------------------------------------------
    // Rotation and background flush
    // --------------------------------------------------------------------

    /// Swaps the full active memtable out for an empty one and hands
    /// the full buffer to a background flusher, then retries the put.
    fn rotate_and_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _rotation = self
            .shared
            .rotation
            .lock()
            .map_err(|_| StoreError::Internal("rotation lock poisoned".into()))?;

        // Another writer may have rotated while we waited for the gate.
        match self.active_handle()?.put(key, value) {
            Ok(()) => return Ok(()),
            Err(MemtableError::MaxSizeExceeded) => {}
            Err(e) => return Err(e.into()),
        }

        // At most one outstanding flush per database; block on it.
        self.wait_for_flush()?;

        // Copy the active memtable into a fresh auxiliary and swap in
        // an empty one stamped with a newly allocated segment id. The
        // aux handle is published before the swap, inside the slot's
        // critical section, so a concurrent get always sees the data in
        // at least one of the two memtables.
        let new_id = self.shared.manifest.new_segment_id()?;
        let aux = {
            let mut slot = self
                .shared
                .active
                .write()
                .map_err(|_| StoreError::Internal("active memtable lock poisoned".into()))?;

            let aux = Arc::new(Memtable::new(
                &self.shared.name,
                &self.shared.dir,
                slot.segment_id()?,
                self.shared.config.memtable_size_limit,
            ));
            aux.adopt(&slot)?;

            *self
                .shared
                .aux
                .write()
                .map_err(|_| StoreError::Internal("aux memtable lock poisoned".into()))? =
                Some(Arc::clone(&aux));

            *slot = Arc::new(Memtable::new(
                &self.shared.name,
                &self.shared.dir,
                new_id,
                self.shared.config.memtable_size_limit,
            ));
            aux
        };

        debug!(
            db = %self.shared.name,
            flushing_segment = aux.segment_id()?,
            new_segment = new_id,
            "memtable rotated"
        );

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-flush", self.shared.name))
            .spawn(move || run_flush(&shared, aux))?;
        *self
            .shared
            .flush_task
            .lock()
            .map_err(|_| StoreError::Internal("flush task lock poisoned".into()))? = Some(handle);

        // The retry lands in the empty active memtable.
        match self.active_handle()?.put(key, value) {
            Ok(()) => Ok(()),
            Err(MemtableError::MaxSizeExceeded) => Err(StoreError::RecordTooLarge),
            Err(e) => Err(e.into()),
        }
    }

    /// Joins the outstanding flush, surfacing its error to this caller.
    fn wait_for_flush(&self) -> Result<(), StoreError> {
        let handle = self
            .shared
            .flush_task
            .lock()
            .map_err(|_| StoreError::Internal("flush task lock poisoned".into()))?
            .take();

        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(StoreError::Internal("flush task panicked".into())),
            }
        }
        Ok(())
    }

    /// Joins every running compaction. Loops because a flush that
    /// completes during the drain may schedule another chain.
    fn drain_compactions(&self) -> Result<(), StoreError> {
        loop {
            let handles: Vec<_> = {
                let mut guard = self
                    .shared
                    .compactions
                    .lock()
                    .map_err(|_| StoreError::Internal("compaction registry poisoned".into()))?;
                std::mem::take(&mut *guard)
            };

            if handles.is_empty() {
                return Ok(());
            }
            for handle in handles {
                if handle.join().is_err() {
                    return Err(StoreError::Internal("compaction task panicked".into()));
                }
            }
        }
    }

    /// Records a freshly flushed segment in the manifest: appended to
    /// level 0 when its file is new, or updated in place when the file
    /// pre-existed (a pre-warmed memtable rewriting its own segment).
    ///
    /// Returns `true` when the segment was appended.
    fn record_flushed_segment(
        &self,
        segment_id: u32,
        cardinality: u32,
        already_existed: bool,
    ) -> Result<bool, StoreError> {
        record_flushed_segment(&self.shared, segment_id, cardinality, already_existed)
    }

    fn active_handle(&self) -> Result<Arc<Memtable>, StoreError> {
        Ok(Arc::clone(
            &*self
                .shared
                .active
                .read()
                .map_err(|_| StoreError::Internal("active memtable lock poisoned".into()))?,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Background tasks
// ------------------------------------------------------------------------------------------------

/// Body of the background flush task.
fn run_flush(shared: &Arc<StoreShared>, aux: Arc<Memtable>) -> Result<(), StoreError> {
    // Level 0 (and its gate) exist before the first segment lands.
    shared.manifest.ensure_level(0)?;
    shared.gates.ensure(0)?;

    let segment_id = aux.segment_id()?;
    let (cardinality, already_existed) = aux.flush().map_err(|e| {
        error!(
            db = %shared.name,
            segment = segment_id,
            error = %e,
            "background flush failed"
        );
        e
    })?;

    let appended = record_flushed_segment(shared, segment_id, cardinality, already_existed)?;

    manifest::rewrite_or_abort(&shared.manifest);

    // Drop the shared read handle; readers now find the data in the
    // durable segment instead.
    match shared.aux.write() {
        Ok(mut slot) => *slot = None,
        Err(_) => return Err(StoreError::Internal("aux memtable lock poisoned".into())),
    }

    if appended {
        schedule_compaction_if_needed(shared, 0);
    }

    Ok(())
}

/// Shared append-or-update step after a memtable flush.
fn record_flushed_segment(
    shared: &Arc<StoreShared>,
    segment_id: u32,
    cardinality: u32,
    already_existed: bool,
) -> Result<bool, StoreError> {
    if already_existed {
        if shared
            .manifest
            .update_cardinality(segment_id, cardinality)?
        {
            return Ok(false);
        }
        // A freshly allocated id should never hit a pre-existing file;
        // treat the stale file as overwritten and track the segment.
        warn!(
            db = %shared.name,
            segment = segment_id,
            "flushed segment pre-existed but no level tracks it; appending to level 0"
        );
    }

    shared.manifest.append_segment(
        0,
        SegmentMeta {
            segment_id,
            cardinality,
        },
    )?;
    Ok(true)
}

/// The compaction watcher: spawns a background merge chain when
/// `level` exceeds its capacity.
fn schedule_compaction_if_needed(shared: &Arc<StoreShared>, level: u32) {
    let count = match shared.manifest.segment_count(level) {
        Ok(count) => count,
        Err(e) => {
            error!(db = %shared.name, level, error = %e, "cannot read level size");
            return;
        }
    };
    if count as u64 <= compactor::level_capacity(level) {
        return;
    }

    debug!(
        db = %shared.name,
        level,
        count,
        "level over capacity; scheduling merge compaction"
    );

    let task_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}-compact", shared.name))
        .spawn(move || {
            let ctx = CompactionCtx {
                db_name: &task_shared.name,
                dir: &task_shared.dir,
                size_limit: task_shared.config.memtable_size_limit,
                manifest: &task_shared.manifest,
                gates: &task_shared.gates,
            };
            compactor::compact_chain(&ctx, level);
        });

    match spawned {
        Ok(handle) => match shared.compactions.lock() {
            Ok(mut registry) => registry.push(handle),
            Err(_) => error!(db = %shared.name, "compaction registry poisoned"),
        },
        Err(e) => error!(db = %shared.name, error = %e, "failed to spawn compaction task"),
    }
}
