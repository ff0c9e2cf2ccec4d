//! Micro-benchmarks for StrataDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use rand::Rng;
use stratadb::{DbConfig, DiskStore, Stage};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Format a zero-padded key from a bounded field.
fn make_key(i: u64) -> String {
    format!("key-{i:06}")
}

/// Open a fresh store with a small memtable so rotations and flushes
/// happen during sustained-write benchmarks.
fn open_small_buffer(dir: &std::path::Path) -> DiskStore {
    DiskStore::open(
        DbConfig {
            root_path: dir.to_path_buf(),
            memtable_size_limit: 4 * 1024,
            stage: Stage::Test,
        },
        "bench",
    )
    .expect("open")
}

/// Open a store with a large memtable so everything stays in memory.
fn open_memtable_only(dir: &std::path::Path) -> DiskStore {
    DiskStore::open(
        DbConfig {
            root_path: dir.to_path_buf(),
            memtable_size_limit: 64 * 1024 * 1024,
            stage: Stage::Test,
        },
        "bench",
    )
    .expect("open")
}

// ------------------------------------------------------------------------------------------------
// Benchmarks
// ------------------------------------------------------------------------------------------------

/// Insertion-only workload over a bounded key field, memtable-resident.
fn bench_put_memtable(c: &mut Criterion) {
    c.bench_function("put/memtable-only", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_memtable_only(dir.path());
        let mut i = 0u64;

        b.iter(|| {
            i += 1;
            store
                .put(&make_key(i % 700), black_box("value payload"))
                .unwrap();
        });
    });
}

/// Insertion workload that crosses memtable rotations and background
/// flushes.
fn bench_put_with_rotation(c: &mut Criterion) {
    c.bench_function("put/with-rotation", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store = open_small_buffer(dir.path());
                (dir, store)
            },
            |(dir, store)| {
                for i in 0..500u64 {
                    store.put(&make_key(i % 700), "value payload").unwrap();
                }
                // Drain background flushes before the directory goes away.
                store.close().unwrap();
                drop(dir);
            },
            BatchSize::PerIteration,
        );
    });
}

/// Mixed workload: alternating puts and gets over a bounded key field,
/// half the reads hitting segments.
fn bench_put_get_mixed(c: &mut Criterion) {
    c.bench_function("mixed/put-get", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_small_buffer(dir.path());
        let mut rng = rand::rng();

        // Preload so early gets have something to find.
        for i in 0..700u64 {
            store.put(&make_key(i), "value payload").unwrap();
        }

        b.iter(|| {
            let i: u64 = rng.random_range(0..700);
            if rng.random_bool(0.5) {
                store.put(&make_key(i), "updated payload").unwrap();
            } else {
                black_box(store.get(&make_key(i)).unwrap());
            }
        });

        // Drain background flushes before the directory goes away.
        store.close().unwrap();
    });
}

/// Point lookups served entirely by the memtable.
fn bench_get_memtable(c: &mut Criterion) {
    c.bench_function("get/memtable-only", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_memtable_only(dir.path());
        for i in 0..700u64 {
            store.put(&make_key(i), "value payload").unwrap();
        }

        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(store.get(&make_key(i % 700)).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_put_memtable,
    bench_put_with_rotation,
    bench_put_get_mixed,
    bench_get_memtable
);
criterion_main!(benches);
