//! Payload codec: JSON + gzip, and slicing of encoded payloads into chunks.
//!
//! A value is serialized to canonical JSON and gzip-compressed. The resulting
//! bytes are cut into slices of at most [`MAX_CHUNK_SIZE`] bytes so each slice
//! fits in one stored row, and glued back together in order when read.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Largest slice written to a single row (390 KiB). Leaves headroom under a
/// 400 KB item ceiling for the envelope attributes every row carries.
pub const MAX_CHUNK_SIZE: usize = 390 * 1024;

/// Serializes and compresses `value`.
///
/// Returns `None` when the value serializes to JSON `null`, so absent
/// optional fields produce no payload at all.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Option<Bytes>> {
    let json = serde_json::to_value(value).map_err(|e| Error::Encode(e.to_string()))?;
    if json.is_null() {
        return Ok(None);
    }
    let raw = serde_json::to_vec(&json).map_err(|e| Error::Encode(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| Error::Encode(format!("gzip compression failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Encode(format!("gzip compression failed: {}", e)))?;
    Ok(Some(Bytes::from(compressed)))
}

/// Decompresses and deserializes bytes produced by [`encode`].
///
/// `None` and empty input decode to `None`.
pub fn decode<T: DeserializeOwned>(data: Option<&[u8]>) -> Result<Option<T>> {
    let data = match data {
        Some(data) if !data.is_empty() => data,
        _ => return Ok(None),
    };

    let mut raw = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut raw)
        .map_err(|e| Error::Decode(format!("gzip decompression failed: {}", e)))?;
    let value = serde_json::from_slice(&raw).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(Some(value))
}

/// Cuts `data` into consecutive slices of at most `max_chunk_size` bytes.
///
/// Slices share the input's buffer. Empty input gives no slices.
pub fn split(data: &Bytes, max_chunk_size: usize) -> Result<Vec<Bytes>> {
    if max_chunk_size == 0 {
        return Err(Error::InvalidInput(
            "max chunk size must be greater than zero".to_string(),
        ));
    }
    let slices = (0..data.len())
        .step_by(max_chunk_size)
        .map(|start| data.slice(start..(start + max_chunk_size).min(data.len())))
        .collect();
    Ok(slices)
}

/// Concatenates slices in the order given.
pub fn join(slices: &[Bytes]) -> Bytes {
    match slices {
        [] => Bytes::new(),
        [only] => only.clone(),
        _ => {
            let total = slices.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for slice in slices {
                buf.extend_from_slice(slice);
            }
            buf.freeze()
        }
    }
}
