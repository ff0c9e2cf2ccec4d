#[cfg(test)]
mod tests {
    use crate::manifest::{Manifest, SegmentMeta};
    use std::fs;
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    #[test]
    fn test_rewrite_then_reload() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        {
            let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
            manifest.ensure_level(1).unwrap();
            manifest
                .append_segment(
                    0,
                    SegmentMeta {
                        segment_id: 3,
                        cardinality: 42,
                    },
                )
                .unwrap();
            manifest
                .append_segment(
                    1,
                    SegmentMeta {
                        segment_id: 1,
                        cardinality: 300,
                    },
                )
                .unwrap();
            manifest.new_segment_id().unwrap(); // 2
            manifest.new_segment_id().unwrap(); // 3
            manifest.rewrite().unwrap();
        }

        let (reloaded, created) = Manifest::open(tmp.path(), "testdb").unwrap();
        assert!(!created);
        assert_eq!(reloaded.db_name().unwrap(), "testdb");
        assert_eq!(reloaded.number_of_levels().unwrap(), 2);
        assert_eq!(reloaded.max_segment_id().unwrap(), 3);

        let l0 = reloaded.level_segments(0).unwrap();
        assert_eq!(l0[0].segment_id, 3);
        assert_eq!(l0[0].cardinality, 42);

        let l1 = reloaded.level_segments(1).unwrap();
        assert_eq!(l1[0].segment_id, 1);
        assert_eq!(l1[0].cardinality, 300);
    }

    #[test]
    fn test_json_field_names_are_part_of_the_format() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let (manifest, _) = Manifest::open(tmp.path(), "testdb").unwrap();
        manifest.ensure_level(0).unwrap();
        manifest
            .append_segment(
                0,
                SegmentMeta {
                    segment_id: 1,
                    cardinality: 7,
                },
            )
            .unwrap();
        manifest.rewrite().unwrap();

        let text = fs::read_to_string(tmp.path().join("manifest.json")).unwrap();
        for field in [
            "\"DbName\"",
            "\"NumberOfLevels\"",
            "\"SegmentLevels\"",
            "\"Segments\"",
            "\"SegmentId\"",
            "\"Cardinality\"",
            "\"MaxSegmentId\"",
        ] {
            assert!(text.contains(field), "missing {field} in {text}");
        }
    }

    #[test]
    fn test_corrupt_manifest_is_an_open_error() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("manifest.json"), b"{not json").unwrap();

        assert!(Manifest::open(tmp.path(), "testdb").is_err());
    }
}
