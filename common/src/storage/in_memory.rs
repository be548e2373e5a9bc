use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{Storage, WriteOptions};
use crate::storage::RecordOp;
use crate::{BytesRange, Record, StorageError, StorageIterator, StorageRead, StorageResult};

/// In-memory implementation of the Storage trait using a BTreeMap.
///
/// All data lives in memory, which makes this the backend of choice for tests
/// and for tables that do not need durability.
pub struct InMemoryStorage {
    data: Arc<RwLock<BTreeMap<Bytes, Bytes>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))?;

        Ok(data.get(&key).map(|value| Record::new(key, value.clone())))
    }

    /// Copies the matching entries out under the read lock, so the iterator
    /// observes the map as it was when the scan started.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))?;

        let records: Vec<Record> = data
            .range((range.start_bound().cloned(), range.end_bound().cloned()))
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect();

        Ok(Box::new(InMemoryIterator {
            records: records.into_iter(),
        }))
    }
}

struct InMemoryIterator {
    records: std::vec::IntoIter<Record>,
}

#[async_trait]
impl StorageIterator for InMemoryIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        Ok(self.records.next())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    /// Applies every op under a single write lock acquisition. Write options
    /// are ignored since there is nothing durable to wait for.
    async fn apply_with_options(
        &self,
        ops: Vec<RecordOp>,
        _options: WriteOptions,
    ) -> StorageResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire write lock: {}", e)))?;

        for op in ops {
            match op {
                RecordOp::Put(record) => {
                    data.insert(record.key, record.value);
                }
                RecordOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }

        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Injected failure for one operation kind.
#[cfg(feature = "test-utils")]
#[derive(Clone)]
enum Failure {
    /// Returned on the next `n` calls, then cleared.
    Times(usize, StorageError),
    /// Returned on every call until explicitly cleared.
    Persistent(StorageError),
    /// Lets `n` calls through, then behaves like `Persistent`.
    After(usize, StorageError),
}

#[cfg(feature = "test-utils")]
struct FailSlot {
    failure: arc_swap::ArcSwap<Option<Failure>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(feature = "test-utils")]
impl FailSlot {
    fn new() -> Self {
        Self {
            failure: arc_swap::ArcSwap::from_pointee(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn set(&self, failure: Option<Failure>) {
        self.failure.store(Arc::new(failure));
    }

    fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Counts the call and returns the injected error, if any.
    ///
    /// A `Times` failure is decremented with a compare-and-swap loop so that
    /// concurrent callers consume exactly `n` errors between them.
    fn check(&self) -> StorageResult<()> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut outcome = Ok(());
        self.failure.rcu(|current| {
            outcome = Ok(());
            match &**current {
                None => None,
                Some(Failure::Persistent(err)) => {
                    outcome = Err(err.clone());
                    Some(Failure::Persistent(err.clone()))
                }
                Some(Failure::Times(n, err)) => {
                    outcome = Err(err.clone());
                    (*n > 1).then(|| Failure::Times(n - 1, err.clone()))
                }
                Some(Failure::After(0, err)) => {
                    outcome = Err(err.clone());
                    Some(Failure::Persistent(err.clone()))
                }
                Some(Failure::After(n, err)) => Some(Failure::After(n - 1, err.clone())),
            }
        });
        outcome
    }
}

/// A storage wrapper that delegates to an inner [`Storage`] but can inject
/// failures into reads, writes and flushes on demand, and counts how many
/// times each was attempted.
///
/// Gated behind the `test-utils` feature.
///
/// ```ignore
/// let storage = FailingStorage::wrap(Arc::new(InMemoryStorage::new()));
/// storage.fail_apply_times(2, StorageError::Storage("throttled".into()));
/// // the next two apply calls fail, the third reaches the inner storage
/// ```
#[cfg(feature = "test-utils")]
pub struct FailingStorage {
    inner: Arc<dyn Storage>,
    reads: FailSlot,
    writes: FailSlot,
    flushes: FailSlot,
}

#[cfg(feature = "test-utils")]
impl FailingStorage {
    /// Wraps an existing storage with no failures injected.
    pub fn wrap(inner: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reads: FailSlot::new(),
            writes: FailSlot::new(),
            flushes: FailSlot::new(),
        })
    }

    /// Makes `get` and `scan_iter` fail on every call.
    pub fn fail_reads(&self, err: StorageError) {
        self.reads.set(Some(Failure::Persistent(err)));
    }

    /// Makes the next `n` reads fail.
    pub fn fail_reads_times(&self, n: usize, err: StorageError) {
        self.reads.set((n > 0).then_some(Failure::Times(n, err)));
    }

    /// Lets the next `n` reads through, then fails every read.
    pub fn fail_reads_after(&self, n: usize, err: StorageError) {
        self.reads.set(Some(Failure::After(n, err)));
    }

    /// Makes `apply` and `put` fail on every call.
    pub fn fail_apply(&self, err: StorageError) {
        self.writes.set(Some(Failure::Persistent(err)));
    }

    /// Makes the next `n` writes fail.
    pub fn fail_apply_times(&self, n: usize, err: StorageError) {
        self.writes.set((n > 0).then_some(Failure::Times(n, err)));
    }

    /// Lets the next `n` writes through, then fails every write.
    pub fn fail_apply_after(&self, n: usize, err: StorageError) {
        self.writes.set(Some(Failure::After(n, err)));
    }

    pub fn fail_flush(&self, err: StorageError) {
        self.flushes.set(Some(Failure::Persistent(err)));
    }

    /// Removes every injected failure.
    pub fn clear(&self) {
        self.reads.set(None);
        self.writes.set(None);
        self.flushes.set(None);
    }

    /// Number of `get`/`scan_iter` calls seen, failed ones included.
    pub fn read_calls(&self) -> usize {
        self.reads.calls()
    }

    /// Number of write calls seen, failed ones included.
    pub fn apply_calls(&self) -> usize {
        self.writes.calls()
    }
}

#[cfg(feature = "test-utils")]
#[async_trait]
impl StorageRead for FailingStorage {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        self.reads.check()?;
        self.inner.get(key).await
    }

    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        self.reads.check()?;
        self.inner.scan_iter(range).await
    }
}

#[cfg(feature = "test-utils")]
#[async_trait]
impl Storage for FailingStorage {
    async fn apply_with_options(
        &self,
        ops: Vec<RecordOp>,
        options: WriteOptions,
    ) -> StorageResult<()> {
        self.writes.check()?;
        self.inner.apply_with_options(ops, options).await
    }

    async fn flush(&self) -> StorageResult<()> {
        self.flushes.check()?;
        self.inner.flush().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}
