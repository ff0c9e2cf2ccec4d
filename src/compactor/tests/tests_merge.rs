#[cfg(test)]
mod tests {
    use crate::compactor::{self, CompactionCtx, CompactorError, LevelGates};
    use crate::manifest::{Manifest, SegmentMeta};
    use crate::memtable::Memtable;
    use crate::segment;
    use std::path::Path;
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    /// Writes `entries` as segment `id` and registers it on `level`.
    fn seed_segment(
        manifest: &Manifest,
        dir: &Path,
        level: u32,
        id: u32,
        entries: &[(&str, &str)],
    ) {
        let memtable = Memtable::new("testdb", dir, id, u64::MAX);
        for (key, value) in entries {
            memtable.put(key, value).unwrap();
        }
        let (cardinality, _) = memtable.flush().unwrap();

        manifest.ensure_level(level).unwrap();
        manifest
            .append_segment(
                level,
                SegmentMeta {
                    segment_id: id,
                    cardinality,
                },
            )
            .unwrap();
    }

    fn probe(dir: &Path, id: u32, key: &str) -> Option<String> {
        let memtable = Memtable::new("testdb", dir, id, u64::MAX);
        memtable.load_from_segment(id).ok()?;
        memtable.get(key).ok()
    }

    #[test]
    fn test_merge_moves_oldest_segment_down_a_level() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        let gates = LevelGates::new();

        seed_segment(&manifest, tmp.path(), 0, 1, &[("a", "1"), ("b", "2")]);
        seed_segment(&manifest, tmp.path(), 0, 2, &[("c", "3")]);

        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 4096,
            manifest: &manifest,
            gates: &gates,
        };
        compactor::compact_level(&ctx, 0).unwrap();

        // Oldest L0 segment (id 1) moved into L1; id 2 stays at L0.
        let l0: Vec<_> = manifest
            .level_segments(0)
            .unwrap()
            .iter()
            .map(|m| m.segment_id)
            .collect();
        assert_eq!(l0, vec![2]);

        let l1 = manifest.level_segments(1).unwrap();
        assert_eq!(l1.len(), 1);
        assert_eq!(l1[0].segment_id, 1);
        assert_eq!(l1[0].cardinality, 2);

        assert_eq!(probe(tmp.path(), 1, "a").unwrap(), "1");
        assert_eq!(probe(tmp.path(), 1, "b").unwrap(), "2");
    }

    #[test]
    fn test_merge_newer_segment_wins_on_duplicate_keys() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        let gates = LevelGates::new();

        // Segment 1 already lives at L1 with a stale value for "x".
        seed_segment(&manifest, tmp.path(), 1, 1, &[("x", "stale"), ("y", "old")]);
        // Segment 2 is the oldest (and only) L0 segment with fresh "x".
        seed_segment(&manifest, tmp.path(), 0, 2, &[("x", "fresh")]);

        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 4096,
            manifest: &manifest,
            gates: &gates,
        };
        compactor::compact_level(&ctx, 0).unwrap();

        assert!(manifest.level_segments(0).unwrap().is_empty());

        // Single output reuses the last id in the encounter order
        // (descending ids [2, 1] → output named 1).
        let l1 = manifest.level_segments(1).unwrap();
        assert_eq!(l1.len(), 1);
        assert_eq!(l1[0].segment_id, 1);
        assert_eq!(l1[0].cardinality, 2);

        assert_eq!(probe(tmp.path(), 1, "x").unwrap(), "fresh");
        assert_eq!(probe(tmp.path(), 1, "y").unwrap(), "old");

        // The unused participant file was deleted.
        assert!(!segment::segment_path(tmp.path(), 2).exists());
    }

    #[test]
    fn test_merge_respects_staging_size_limit() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        let gates = LevelGates::new();

        seed_segment(
            &manifest,
            tmp.path(),
            1,
            1,
            &[("k1", "0123456789"), ("k2", "0123456789")],
        );
        seed_segment(
            &manifest,
            tmp.path(),
            0,
            2,
            &[("k3", "0123456789"), ("k4", "0123456789")],
        );

        // Each entry costs 20 bytes; a 40-byte staging limit fits two.
        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 40,
            manifest: &manifest,
            gates: &gates,
        };
        compactor::compact_level(&ctx, 0).unwrap();

        let l1 = manifest.level_segments(1).unwrap();
        assert_eq!(l1.len(), 2);
        // First flush reuses id 1, the second id 2.
        assert_eq!(l1[0].segment_id, 1);
        assert_eq!(l1[1].segment_id, 2);
        assert_eq!(l1[0].cardinality + l1[1].cardinality, 4);

        for key in ["k1", "k2", "k3", "k4"] {
            let found = [1u32, 2]
                .iter()
                .filter_map(|id| probe(tmp.path(), *id, key))
                .next();
            assert_eq!(found.unwrap(), "0123456789");
        }
    }

    #[test]
    fn test_empty_source_level_is_a_benign_no_op() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        manifest.ensure_level(0).unwrap();
        let gates = LevelGates::new();

        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 4096,
            manifest: &manifest,
            gates: &gates,
        };
        assert!(matches!(
            compactor::compact_level(&ctx, 0),
            Err(CompactorError::LevelEmpty)
        ));
    }

    #[test]
    fn test_chain_cascades_until_levels_fit() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        let gates = LevelGates::new();

        // Level 0 holds two segments; capacity is one.
        seed_segment(&manifest, tmp.path(), 0, 1, &[("a", "1")]);
        seed_segment(&manifest, tmp.path(), 0, 2, &[("b", "2")]);

        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 4096,
            manifest: &manifest,
            gates: &gates,
        };
        compactor::compact_chain(&ctx, 0);

        assert_eq!(manifest.segment_count(0).unwrap(), 1);
        assert_eq!(manifest.segment_count(1).unwrap(), 1);

        // Both keys remain reachable somewhere.
        let l0_id = manifest.level_segments(0).unwrap()[0].segment_id;
        let l1_id = manifest.level_segments(1).unwrap()[0].segment_id;
        assert_eq!(probe(tmp.path(), l1_id, "a").unwrap(), "1");
        assert_eq!(probe(tmp.path(), l0_id, "b").unwrap(), "2");
    }

    #[test]
    fn test_aborted_compaction_leaves_manifest_untouched() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        let gates = LevelGates::new();

        // Register a segment whose file never existed: the read phase
        // fails before any manifest mutation.
        manifest.ensure_level(0).unwrap();
        manifest
            .append_segment(
                0,
                SegmentMeta {
                    segment_id: 9,
                    cardinality: 1,
                },
            )
            .unwrap();

        let before = manifest.levels_snapshot().unwrap();

        let ctx = CompactionCtx {
            db_name: "testdb",
            dir: tmp.path(),
            size_limit: 4096,
            manifest: &manifest,
            gates: &gates,
        };
        assert!(compactor::compact_level(&ctx, 0).is_err());

        // Level 1 was initialised, but no segment list changed.
        let after = manifest.levels_snapshot().unwrap();
        assert_eq!(after[0], before[0]);
        assert!(after[1].is_empty());
    }
}
