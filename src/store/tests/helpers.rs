use crate::store::{DbConfig, DiskStore, Stage};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config rooted in a temp directory with the given memtable limit.
pub fn test_config(root: &Path, memtable_size_limit: u64) -> DbConfig {
    init_tracing();
    DbConfig {
        root_path: root.to_path_buf(),
        memtable_size_limit,
        stage: Stage::Test,
    }
}

/// Opens `name` under `root` with the given memtable limit.
pub fn open_store(root: &Path, memtable_size_limit: u64, name: &str) -> DiskStore {
    DiskStore::open(test_config(root, memtable_size_limit), name).expect("open store")
}

/// Number of `.seg` files in the database directory.
pub fn segment_file_count(root: &Path, name: &str) -> usize {
    std::fs::read_dir(root.join(name))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path().extension().and_then(|ext| ext.to_str()) == Some("seg")
                })
                .count()
        })
        .unwrap_or(0)
}
