//! # StrataDB
//!
//! An embeddable, persistent key-value store for string keys and string
//! values, built on a **leveled log-structured storage engine**: writes
//! are absorbed by a bounded in-memory memtable, flushed to immutable
//! sorted segment files, and merged across levels by a background
//! compactor that bounds read amplification and reclaims space from
//! overwritten keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      DiskStore                         │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────┐   │
//! │  │   Active   │  │  Auxiliary  │  │    Segments    │   │
//! │  │  Memtable  │  │  Memtable   │  │  (L0, L1, …)   │   │
//! │  └─────┬──────┘  └──────┬──────┘  └───────┬────────┘   │
//! │        │  rotate        │  flush          │            │
//! │        └──────────►     └─────────►       │            │
//! │                                           │            │
//! │  ┌────────────────────────────────────────┘            │
//! │  │  Merge compaction (level L → L+1, 10^L capacity)    │
//! │  └─────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────┐   │
//! │  │           Manifest (manifest.json)              │   │
//! │  └─────────────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | The public façade — open, put, get, close, cleanup |
//! | [`memtable`] | Bounded in-memory write buffer with non-blocking flush support |
//! | [`segment`] | Immutable sorted segment files: naming, writer, mmap reader |
//! | [`record`] | Fixed-header record codec shared by all segment I/O |
//! | [`manifest`] | Durable JSON description of levels and segment membership |
//! | [`compactor`] | Leveled merge compaction with per-level serialisation |
//!
//! ## Key Properties
//!
//! - **Non-blocking flush** — a full memtable is handed to a background
//!   task while a fresh one keeps accepting writes; at most one flush
//!   is outstanding per database.
//! - **Newest-first reads** — lookups consult the active memtable, the
//!   auxiliary memtable, then every level's segments newest-first, so
//!   the most recent write always wins.
//! - **Leveled compaction** — level `L` holds at most `10^L` segments;
//!   overflow merges the oldest segment into the next level, newer
//!   values winning on duplicate keys.
//! - **Crash stance** — segments are fsync'd before the manifest refers
//!   to them; the in-memory tail since the last flush is lost on crash
//!   by design (there is no write-ahead log).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{DbConfig, DiskStore, Stage};
//!
//! let config = DbConfig {
//!     root_path: "/tmp/stratadb".into(),
//!     memtable_size_limit: 4 * 1024,
//!     stage: Stage::Dev,
//! };
//!
//! let store = DiskStore::open(config, "example").unwrap();
//!
//! store.put("name", "alice").unwrap();
//! assert_eq!(store.get("name").unwrap(), "alice");
//!
//! // Absence reads as the empty string.
//! assert_eq!(store.get("age").unwrap(), "");
//!
//! // Durable shutdown; a reopen sees every accepted write.
//! store.close().unwrap();
//! ```

pub mod compactor;
pub mod manifest;
pub mod memtable;
pub mod record;
pub mod segment;
pub mod store;

pub use store::{DbConfig, DiskStore, Stage, StoreError};
