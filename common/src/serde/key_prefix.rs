//! Two-byte prefix in front of every storage key.
//!
//! ```text
//! | version (u8) | record type (u8, non-zero) | record fields ... |
//! ```
//!
//! The version lets a key layout evolve; the record type separates kinds of
//! records (table rows, index entries) sharing one ordered key space.

use bytes::{BufMut, Bytes, BytesMut};

use super::DeserializeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    version: u8,
    record_type: u8,
}

impl KeyPrefix {
    pub const LEN: usize = 2;

    /// # Panics
    ///
    /// Panics if `record_type` is 0, which is reserved.
    pub fn new(version: u8, record_type: u8) -> Self {
        assert!(record_type != 0, "record type 0 is reserved");
        Self {
            version,
            record_type,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DeserializeError> {
        let Some(&[version, record_type]) = data.get(..Self::LEN) else {
            return Err(DeserializeError::new(format!(
                "key of {} bytes has no prefix",
                data.len()
            )));
        };
        if record_type == 0 {
            return Err(DeserializeError::new("record type 0 is reserved"));
        }
        Ok(Self {
            version,
            record_type,
        })
    }

    /// Parses the prefix and checks it carries `expected_version`.
    pub fn from_bytes_versioned(
        data: &[u8],
        expected_version: u8,
    ) -> Result<Self, DeserializeError> {
        let prefix = Self::from_bytes(data)?;
        if prefix.version != expected_version {
            return Err(DeserializeError::new(format!(
                "key version 0x{:02x}, expected 0x{:02x}",
                prefix.version, expected_version
            )));
        }
        Ok(prefix)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.version, self.record_type])
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.record_type);
    }
}
