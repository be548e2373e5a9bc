//! Item store adapter.
//!
//! [`ItemStore`] is the narrow item-level interface the table and record
//! builder are written against: single-row put/get/delete/update, batched
//! writes and reads, and paged query/scan. [`TableStore`] implements it on
//! top of an ordered key-value [`Storage`], emulating a partitioned item
//! store with a per-item size ceiling and two secondary indexes.
//!
//! Every row write also writes (and, when the indexed attributes changed,
//! deletes) the row's index entries in the same atomic storage batch. Writes
//! through one [`TableStore`] are serialized from reading a row's previous
//! version until the batch is applied, so indexes never point at missing
//! rows. Writers in other processes, or other `TableStore`s over the same
//! table, must be coordinated by the caller.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::storage::factory::create_storage;
use common::{BytesRange, Record, RecordOp, Storage};
use futures::future::try_join_all;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    CHUNK_TYPE, ContinuationToken, Filter, IndexName, Item, ItemKey, Page, QueryRequest,
    RECORD_ID, ScanRequest,
};
use crate::retry::RetryPolicy;
use crate::serde::{IndexEntryKey, RowKey, decode_item, encode_item};

/// Rows written per atomic storage batch.
pub const BATCH_WRITE_LIMIT: usize = 25;

/// Keys read per batch get round.
pub const BATCH_GET_LIMIT: usize = 100;

/// Largest encoded row the store accepts (400 KiB).
pub const MAX_ITEM_SIZE: usize = 400 * 1024;

/// One entry of a batched write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(ItemKey),
}

impl WriteRequest {
    fn key(&self) -> Result<ItemKey> {
        match self {
            WriteRequest::Put(item) => ItemKey::from_item(item),
            WriteRequest::Delete(key) => Ok(key.clone()),
        }
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn put_item(&self, item: Item) -> Result<()>;

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>>;

    async fn delete_item(&self, key: &ItemKey) -> Result<()>;

    /// Sets the given attributes on the row (creating it if absent) and
    /// returns the full new row.
    async fn update_item(&self, key: &ItemKey, updates: Item) -> Result<Item>;

    /// Writes in groups of [`BATCH_WRITE_LIMIT`]. Each group is atomic; a
    /// failing group leaves earlier groups written.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()>;

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        self.batch_write(items.into_iter().map(WriteRequest::Put).collect())
            .await
    }

    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<()> {
        self.batch_write(keys.into_iter().map(WriteRequest::Delete).collect())
            .await
    }

    /// Reads the rows for `keys` in rounds of [`BATCH_GET_LIMIT`] concurrent
    /// gets. Missing keys are skipped; result order is unspecified. A
    /// consistent read does not interleave with a write group.
    async fn batch_get(&self, keys: Vec<ItemKey>, consistent_read: bool) -> Result<Vec<Item>>;

    async fn query(&self, request: QueryRequest) -> Result<Page>;

    async fn scan(&self, request: ScanRequest) -> Result<Page>;
}

/// [`ItemStore`] for one table inside a [`Storage`]. Several tables can share
/// one storage.
pub struct TableStore {
    storage: Arc<dyn Storage>,
    table: String,
    retry: RetryPolicy,
    /// Held from reading previous rows until their batch is applied.
    write_lock: Mutex<()>,
}

impl TableStore {
    pub fn new(storage: Arc<dyn Storage>, table: impl Into<String>) -> Self {
        Self {
            storage,
            table: table.into(),
            retry: RetryPolicy::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Opens the configured storage backend.
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;
        Ok(Self::new(storage, config.table_name.clone()).with_retry_policy(config.retry.clone()))
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn close(&self) -> Result<()> {
        self.storage.close().await?;
        Ok(())
    }

    fn row_key(&self, key: &ItemKey) -> Bytes {
        RowKey::new(self.table.as_str(), key.clone()).serialize()
    }

    async fn read_row(&self, key: &ItemKey) -> Result<Option<Item>> {
        let storage_key = self.row_key(key);
        let record = self
            .retry
            .run("get", || self.storage.get(storage_key.clone()))
            .await?;
        record.map(|r| decode_item(&r.value)).transpose()
    }

    /// Storage ops that turn `previous` into `next` for one row, including
    /// index maintenance.
    fn row_ops(
        &self,
        key: &ItemKey,
        previous: Option<&Item>,
        next: Option<&Item>,
        ops: &mut Vec<RecordOp>,
    ) -> Result<()> {
        for index in IndexName::ALL {
            let old_entry = previous
                .and_then(|row| IndexEntryKey::for_row(&self.table, index, row))
                .map(|entry| entry.serialize());
            let new_entry = match next {
                Some(row) => match IndexEntryKey::for_row(&self.table, index, row) {
                    Some(entry) => {
                        let projection = encode_item(&row.project(index.projection()))?;
                        Some((entry.serialize(), projection))
                    }
                    None => None,
                },
                None => None,
            };
            if let Some(old) = old_entry {
                if new_entry.as_ref().is_none_or(|(new, _)| *new != old) {
                    ops.push(RecordOp::Delete(old));
                }
            }
            if let Some((entry_key, projection)) = new_entry {
                ops.push(RecordOp::Put(Record::new(entry_key, projection)));
            }
        }

        let row_key = self.row_key(key);
        match next {
            Some(row) => {
                let value = encode_item(row)?;
                if value.len() > MAX_ITEM_SIZE {
                    return Err(Error::InvalidInput(format!(
                        "item {}/{} is {} bytes, limit is {}",
                        key.record_id,
                        key.chunk_type,
                        value.len(),
                        MAX_ITEM_SIZE
                    )));
                }
                ops.push(RecordOp::Put(Record::new(row_key, value)));
            }
            None => ops.push(RecordOp::Delete(row_key)),
        }
        Ok(())
    }

    async fn write_group(&self, group: &[WriteRequest]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_group_locked(group).await
    }

    /// Applies one group atomically. Later requests in the group see the
    /// effect of earlier ones on the same key. Callers hold `write_lock`.
    async fn write_group_locked(&self, group: &[WriteRequest]) -> Result<()> {
        let mut state: HashMap<ItemKey, Option<Item>> = HashMap::new();
        let mut ops = Vec::new();
        for request in group {
            let key = request.key()?;
            let previous = match state.get(&key) {
                Some(current) => current.clone(),
                None => self.read_row(&key).await?,
            };
            let next = match request {
                WriteRequest::Put(item) => Some(item.clone()),
                WriteRequest::Delete(_) => None,
            };
            self.row_ops(&key, previous.as_ref(), next.as_ref(), &mut ops)?;
            state.insert(key, next);
        }
        self.retry
            .run("apply", || self.storage.apply(ops.clone()))
            .await?;
        Ok(())
    }

    /// Reads one page of `range`, resuming after `token`.
    ///
    /// Evaluates at most `page_size` rows, then peeks one more to decide
    /// whether a continuation token is returned.
    async fn read_page(
        &self,
        range: BytesRange,
        page_size: usize,
        token: Option<&ContinuationToken>,
        filter: Option<&Filter>,
    ) -> Result<Page> {
        if page_size == 0 {
            return Err(Error::InvalidInput(
                "page size must be greater than zero".to_string(),
            ));
        }
        let range = match token {
            Some(token) => range.resume_after(token.as_bytes()).ok_or_else(|| {
                Error::InvalidInput("continuation token outside the queried range".to_string())
            })?,
            None => range,
        };

        let mut iter = self
            .retry
            .run("scan", || self.storage.scan_iter(range.clone()))
            .await?;
        let mut page = Page::default();
        let mut last_key = None;
        while page.scanned_count < page_size {
            let Some(record) = iter.next().await? else {
                break;
            };
            page.scanned_count += 1;
            let item = decode_item(&record.value)?;
            if filter.is_none_or(|f| f.matches(&item)) {
                page.items.push(item);
            }
            last_key = Some(record.key);
        }
        if page.scanned_count == page_size && iter.next().await?.is_some() {
            page.next_token = last_key.map(ContinuationToken::new);
        }
        Ok(page)
    }
}

#[async_trait]
impl ItemStore for TableStore {
    #[tracing::instrument(level = "trace", skip_all, fields(table = %self.table))]
    async fn put_item(&self, item: Item) -> Result<()> {
        self.write_group(&[WriteRequest::Put(item)]).await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(table = %self.table))]
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.read_row(key).await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(table = %self.table))]
    async fn delete_item(&self, key: &ItemKey) -> Result<()> {
        self.write_group(&[WriteRequest::Delete(key.clone())]).await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(table = %self.table))]
    async fn update_item(&self, key: &ItemKey, updates: Item) -> Result<Item> {
        let key_item = key.to_item();
        for name in [RECORD_ID, CHUNK_TYPE] {
            if updates.get(name).is_some_and(|value| Some(value) != key_item.get(name)) {
                return Err(Error::InvalidInput(format!(
                    "update cannot change key attribute {}",
                    name
                )));
            }
        }
        let _guard = self.write_lock.lock().await;
        let mut item = self.read_row(key).await?.unwrap_or(key_item);
        for (name, value) in updates {
            item.insert(name, value);
        }
        self.write_group_locked(&[WriteRequest::Put(item.clone())])
            .await?;
        Ok(item)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(table = %self.table, requests = requests.len())
    )]
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        // reject malformed rows before anything is written
        for request in &requests {
            request.key()?;
        }
        for group in requests.chunks(BATCH_WRITE_LIMIT) {
            self.write_group(group).await?;
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(table = %self.table, keys = keys.len())
    )]
    async fn batch_get(&self, keys: Vec<ItemKey>, consistent_read: bool) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(keys.len());
        for round in keys.chunks(BATCH_GET_LIMIT) {
            // a consistent round sees no write group land midway
            let _guard = if consistent_read {
                Some(self.write_lock.lock().await)
            } else {
                None
            };
            let rows = try_join_all(round.iter().map(|key| self.read_row(key))).await?;
            items.extend(rows.into_iter().flatten());
        }
        Ok(items)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(table = %self.table, index = ?request.index.map(|i| i.name()))
    )]
    async fn query(&self, request: QueryRequest) -> Result<Page> {
        let range = match request.index {
            None => RowKey::query_range(&self.table, &request.condition)?,
            Some(index) => IndexEntryKey::query_range(&self.table, index, &request.condition)?,
        };
        let page = self
            .read_page(
                range,
                request.page_size,
                request.token.as_ref(),
                request.filter.as_ref(),
            )
            .await?;
        tracing::debug!(
            items = page.items.len(),
            scanned = page.scanned_count,
            more = page.next_token.is_some(),
            "query page"
        );
        Ok(page)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.table))]
    async fn scan(&self, request: ScanRequest) -> Result<Page> {
        let page = self
            .read_page(
                RowKey::table_range(&self.table),
                request.page_size,
                request.token.as_ref(),
                request.filter.as_ref(),
            )
            .await?;
        tracing::debug!(
            items = page.items.len(),
            scanned = page.scanned_count,
            more = page.next_token.is_some(),
            "scan page"
        );
        Ok(page)
    }
}
