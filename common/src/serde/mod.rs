//! Ordered binary encodings for storage keys.
//!
//! Keys written to the backing store are compared byte-by-byte, so every
//! encoding here preserves the ordering of the logical values it encodes.

pub mod key_prefix;
pub mod sortable;
pub mod terminated_bytes;

/// Error returned when a stored key or value cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializeError {
    pub message: String,
}

impl DeserializeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::error::Error for DeserializeError {}

impl std::fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
