//! Error types for chunk store operations.

use common::StorageError;
use common::serde::DeserializeError;

/// Error type for chunk store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A value could not be serialized or compressed.
    Encode(String),

    /// Stored bytes could not be decompressed or deserialized.
    Decode(String),

    /// A required configuration setting is missing. Holds the setting name
    /// in upper case.
    ConfigNotSet(String),

    /// A record schema is invalid.
    Schema(String),

    /// A group of chunk rows could not be assembled into a record.
    Build(String),

    /// The storage backend failed.
    Backend(String),

    /// Invalid input or parameter errors.
    InvalidInput(String),

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Encode(msg) => write!(f, "Encode error: {}", msg),
            Error::Decode(msg) => write!(f, "Decode error: {}", msg),
            Error::ConfigNotSet(name) => write!(f, "{} not set", name),
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::Build(msg) => write!(f, "Build error: {}", msg),
            Error::Backend(msg) => write!(f, "Backend error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Storage(msg) => Error::Backend(msg),
            StorageError::Internal(msg) => Error::Internal(msg),
        }
    }
}

impl From<DeserializeError> for Error {
    fn from(err: DeserializeError) -> Self {
        Error::Decode(err.message)
    }
}

/// Result type alias for chunk store operations.
pub type Result<T> = std::result::Result<T, Error>;
