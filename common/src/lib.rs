pub mod bytes;
pub mod clock;
pub mod serde;
pub mod storage;

pub use bytes::BytesRange;
pub use clock::{Clock, SystemClock};
pub use storage::config::StorageConfig;
pub use storage::{
    Record, RecordOp, Storage, StorageError, StorageIterator, StorageRead, StorageResult,
    WriteOptions,
};
