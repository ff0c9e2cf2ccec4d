//! # Record Codec
//!
//! Encoding and decoding of a single key-value record as it is stored in
//! segment files. Every record starts with a fixed-size header followed by
//! the raw key and value bytes:
//!
//! ```text
//! | offset | size       | field      | encoding                     |
//! |--------|------------|------------|------------------------------|
//! | 0      | 8          | timestamp  | little-endian signed 64-bit  |
//! | 8      | 4          | key_size   | little-endian unsigned 32-bit|
//! | 12     | 4          | value_size | little-endian unsigned 32-bit|
//! | 16     | key_size   | key        | raw UTF-8                    |
//! | 16+ks  | value_size | value      | raw UTF-8                    |
//! ```
//!
//! Keys and values are limited to `u32::MAX` bytes each by the header.
//! A truncated input yields [`RecordError::Truncated`]; segment scans
//! treat a clean end-of-file as loop termination, not as an error.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

/// Fixed size of the record header in bytes.
pub const HEADER_SIZE: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by record encoding and decoding.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Input ends before the record does.
    #[error("truncated record: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Key length does not fit the header's 32-bit size field.
    #[error("key length {0} exceeds the 32-bit header field")]
    KeyTooLarge(usize),

    /// Value length does not fit the header's 32-bit size field.
    #[error("value length {0} exceeds the 32-bit header field")]
    ValueTooLarge(usize),

    /// Key or value bytes are not valid UTF-8.
    #[error("record contains invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// A single decoded key-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Wall-clock seconds since the UNIX epoch at write time.
    pub timestamp: i64,
    pub key: String,
    pub value: String,
}

impl Record {
    /// Number of bytes this record occupies on disk.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding
// ------------------------------------------------------------------------------------------------

/// Encodes a record as `HEADER ‖ key_bytes ‖ value_bytes`.
///
/// Returns the total encoded size alongside the bytes.
pub fn encode_record(
    timestamp: i64,
    key: &str,
    value: &str,
) -> Result<(u32, Vec<u8>), RecordError> {
    let key_size = u32::try_from(key.len()).map_err(|_| RecordError::KeyTooLarge(key.len()))?;
    let value_size =
        u32::try_from(value.len()).map_err(|_| RecordError::ValueTooLarge(value.len()))?;

    let total = u32::try_from(HEADER_SIZE + key.len() + value.len())
        .map_err(|_| RecordError::ValueTooLarge(value.len()))?;

    let mut buf = Vec::with_capacity(total as usize);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&key_size.to_le_bytes());
    buf.extend_from_slice(&value_size.to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value.as_bytes());

    Ok((total, buf))
}

// ------------------------------------------------------------------------------------------------
// Decoding
// ------------------------------------------------------------------------------------------------

/// Decodes the fixed-size header, returning `(timestamp, key_size, value_size)`.
pub fn decode_header(buf: &[u8]) -> Result<(i64, u32, u32), RecordError> {
    if buf.len() < HEADER_SIZE {
        return Err(RecordError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }

    let truncated = |_| RecordError::Truncated {
        needed: HEADER_SIZE,
        available: buf.len(),
    };

    let timestamp = i64::from_le_bytes(buf[0..8].try_into().map_err(truncated)?);
    let key_size = u32::from_le_bytes(buf[8..12].try_into().map_err(truncated)?);
    let value_size = u32::from_le_bytes(buf[12..16].try_into().map_err(truncated)?);

    Ok((timestamp, key_size, value_size))
}

/// Decodes one full record from the front of `buf`.
pub fn decode_record(buf: &[u8]) -> Result<Record, RecordError> {
    let (timestamp, key_size, value_size) = decode_header(buf)?;

    let key_end = HEADER_SIZE + key_size as usize;
    let value_end = key_end + value_size as usize;

    if buf.len() < value_end {
        return Err(RecordError::Truncated {
            needed: value_end,
            available: buf.len(),
        });
    }

    let key = std::str::from_utf8(&buf[HEADER_SIZE..key_end])?.to_owned();
    let value = std::str::from_utf8(&buf[key_end..value_end])?.to_owned();

    Ok(Record {
        timestamp,
        key,
        value,
    })
}
