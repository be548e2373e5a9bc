//! Order-preserving encoding of variable-length key components.
//!
//! `0x00` is written as `0x01 0x01`, `0x01` as `0x01 0x02`, every other byte
//! as is, and the component ends with a `0x00` terminator. Byte order of the
//! encoded form equals byte order of the raw value, and no encoded value is
//! a prefix of another, so components can be concatenated into composite
//! keys (`table`, then `record_id`, then `chunk_type`).

use bytes::{BufMut, Bytes, BytesMut};

use super::DeserializeError;
use crate::BytesRange;

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

pub fn serialize_to_bytes(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 1);
    serialize(data, &mut buf);
    buf.freeze()
}

pub fn serialize(data: &[u8], buf: &mut BytesMut) {
    escape_into(data, buf);
    buf.put_u8(TERMINATOR);
}

fn escape_into(data: &[u8], buf: &mut BytesMut) {
    for &byte in data {
        match byte {
            TERMINATOR => buf.put_slice(&[ESCAPE, 0x01]),
            ESCAPE => buf.put_slice(&[ESCAPE, 0x02]),
            _ => buf.put_u8(byte),
        }
    }
}

/// Decodes one component and advances `buf` past its terminator.
pub fn deserialize(buf: &mut &[u8]) -> Result<Bytes, DeserializeError> {
    let data: &[u8] = *buf;
    let mut out = BytesMut::new();
    let mut bytes = data.iter().enumerate();
    while let Some((i, &byte)) = bytes.next() {
        match byte {
            TERMINATOR => {
                *buf = &data[i + 1..];
                return Ok(out.freeze());
            }
            ESCAPE => match bytes.next() {
                Some((_, 0x01)) => out.put_u8(TERMINATOR),
                Some((_, 0x02)) => out.put_u8(ESCAPE),
                Some((_, other)) => {
                    return Err(DeserializeError::new(format!(
                        "invalid escape 0x01 0x{:02x}",
                        other
                    )));
                }
                None => return Err(DeserializeError::new("truncated escape")),
            },
            _ => out.put_u8(byte),
        }
    }
    Err(DeserializeError::new("missing terminator"))
}

/// Keys made of `head` followed by one component whose raw value begins
/// with `prefix`. An empty `prefix` selects every key under `head`.
pub fn field_prefix_range(head: &[u8], prefix: &[u8]) -> BytesRange {
    let mut start = BytesMut::with_capacity(head.len() + prefix.len() * 2);
    start.put_slice(head);
    escape_into(prefix, &mut start);
    BytesRange::prefix(start.freeze())
}
