#[cfg(test)]
mod tests {
    use crate::record::{self, HEADER_SIZE, Record, RecordError};
    use rand::Rng;

    #[test]
    fn test_header_round_trip() {
        let mut rng = rand::rng();
        let timestamp: i64 = rng.random();
        let key_size: u32 = rng.random();
        let value_size: u32 = rng.random();

        let mut buf = Vec::new();
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&key_size.to_le_bytes());
        buf.extend_from_slice(&value_size.to_le_bytes());

        let (t, k, v) = record::decode_header(&buf).unwrap();
        assert_eq!(t, timestamp);
        assert_eq!(k, key_size);
        assert_eq!(v, value_size);
    }

    #[test]
    fn test_record_round_trip() {
        let (total, buf) = record::encode_record(1700000000, "name", "alice").unwrap();

        assert_eq!(total as usize, HEADER_SIZE + "name".len() + "alice".len());
        assert_eq!(buf.len(), total as usize);

        let decoded = record::decode_record(&buf).unwrap();
        assert_eq!(
            decoded,
            Record {
                timestamp: 1700000000,
                key: "name".to_string(),
                value: "alice".to_string(),
            }
        );
    }

    #[test]
    fn test_negative_timestamp_round_trip() {
        let (_, buf) = record::encode_record(-42, "k", "v").unwrap();
        let decoded = record::decode_record(&buf).unwrap();
        assert_eq!(decoded.timestamp, -42);
    }

    #[test]
    fn test_empty_key_and_value() {
        let (total, buf) = record::encode_record(7, "", "").unwrap();
        assert_eq!(total as usize, HEADER_SIZE);

        let decoded = record::decode_record(&buf).unwrap();
        assert_eq!(decoded.key, "");
        assert_eq!(decoded.value, "");
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let err = record::decode_header(&[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            RecordError::Truncated {
                needed: HEADER_SIZE,
                available: 7
            }
        ));
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let (_, buf) = record::encode_record(1, "key", "value").unwrap();
        let err = record::decode_record(&buf[..buf.len() - 2]).unwrap_err();
        assert!(matches!(err, RecordError::Truncated { .. }));
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        let rec = Record {
            timestamp: 9,
            key: "football".to_string(),
            value: "cr7".to_string(),
        };
        let (total, _) = record::encode_record(rec.timestamp, &rec.key, &rec.value).unwrap();
        assert_eq!(rec.encoded_len(), total as usize);
    }
}
