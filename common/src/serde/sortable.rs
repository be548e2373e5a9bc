//! Sortable numeric encoding for lexicographic key ordering.
//!
//! Two's complement puts negative numbers after positive ones when compared
//! byte-by-byte (-1 = 0xFF...FF sorts after 1 = 0x00...01). Flipping the sign
//! bit fixes that: negative numbers get a 0 high bit and sort first, positive
//! numbers get a 1 high bit and sort second, and the relative order inside each
//! group is unchanged.
//!
//! Values are always written big-endian so byte order equals numeric order.
//!
//! ```
//! use common::serde::sortable::{decode_i64_sortable, encode_i64_sortable};
//!
//! let value: i64 = -42;
//! let bytes = encode_i64_sortable(value).to_be_bytes();
//! assert_eq!(decode_i64_sortable(u64::from_be_bytes(bytes)), value);
//! ```

use bytes::{BufMut, BytesMut};

use super::DeserializeError;

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

/// Encode an i64 value for sortable byte comparison.
#[inline]
pub const fn encode_i64_sortable(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

/// Decode a sortable-encoded u64 back to the original i64 value.
#[inline]
pub const fn decode_i64_sortable(sortable: u64) -> i64 {
    (sortable ^ SIGN_BIT) as i64
}

/// Writes `value` as 8 big-endian sortable bytes.
pub fn write_i64(value: i64, buf: &mut BytesMut) {
    buf.put_u64(encode_i64_sortable(value));
}

/// Reads 8 big-endian sortable bytes, advancing the buffer past them.
pub fn read_i64(buf: &mut &[u8]) -> Result<i64, DeserializeError> {
    if buf.len() < 8 {
        return Err(DeserializeError::new(format!(
            "buffer too short for sortable i64: need 8 bytes, got {}",
            buf.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    *buf = &buf[8..];
    Ok(decode_i64_sortable(u64::from_be_bytes(raw)))
}
