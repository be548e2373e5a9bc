//! Schema-bound table of logical records.
//!
//! A [`Table<T>`] maps records of one [`TableRecord`] type onto chunk rows in
//! an [`ItemStore`]. Writes split fat fields into `<field>_<n>` slice rows next
//! to a `primary` row holding the other fields. Reads find rows by record id
//! or through one of the secondary indexes and reassemble them with the
//! record builder.
//!
//! Neither a save spanning several write groups nor
//! [`insert_if_absent`](Table::insert_if_absent) is atomic: concurrent writers
//! can both pass the uniqueness check, and a failed save can leave part of
//! the new chunks written.

use std::marker::PhantomData;
use std::sync::Arc;

use common::{Clock, SystemClock};
use serde_json::Value;
use uuid::Uuid;

use crate::builder::{BuildOutcome, batch_get_and_build, build_batch, extract_keys};
use crate::chunk::{PRIMARY_CHUNK, slice_names};
use crate::codec::{self, MAX_CHUNK_SIZE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    Attr, CHUNK_TYPE, ContinuationToken, DATA, DATA_TYPE, Filter, IndexName, Item, ItemKey,
    KeyCondition, Page, QueryRequest, RECORD_ID, SOURCE_UNIQUE, ScanRequest, SortCondition,
};
use crate::pager::Pager;
use crate::record::{
    Envelope, LogicalRecord, NewRecord, RecordState, TableRecord, payload_fields,
};
use crate::schema::TableSchema;
use crate::serde::record_id_of_key;
use crate::store::{ItemStore, TableStore, WriteRequest};

/// Tuning of a [`Table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Rows evaluated per page when an operation walks all pages.
    pub page_size: usize,
    /// Largest fat-field slice written to one row.
    pub max_chunk_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            page_size: 256,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl From<&Config> for TableOptions {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            max_chunk_size: config.max_chunk_size,
        }
    }
}

/// Which rows a read or delete targets.
///
/// Exactly one strategy is used, in this order of precedence: record id,
/// `source_unique` (through `source_unique_index`), all records of the
/// table's type (through `data_type_updated_ts_index`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookup {
    pub record_id: Option<String>,
    pub source_unique: Option<String>,
    pub by_type: bool,
    /// Evaluated against base-table rows for record id lookups and against
    /// index projections otherwise.
    pub filter: Option<Filter>,
    /// Reads a single page of at most this many rows instead of all pages.
    pub limit: Option<usize>,
}

impl Lookup {
    pub fn by_id(record_id: impl Into<String>) -> Self {
        Self {
            record_id: Some(record_id.into()),
            ..Self::default()
        }
    }

    pub fn by_source_unique(source_unique: impl Into<String>) -> Self {
        Self {
            source_unique: Some(source_unique.into()),
            ..Self::default()
        }
    }

    pub fn by_type() -> Self {
        Self {
            by_type: true,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// What [`Table::delete`] removes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    /// One row.
    Key(ItemKey),
    /// Every row a lookup resolves to.
    Lookup(Lookup),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Batched deletes, not atomic across write groups.
    #[default]
    Batch,
    /// One delete call per row.
    Sequential,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOptions {
    /// Conjoined with `data_type = T::DATA_TYPE`.
    pub filter: Option<Filter>,
    /// Defaults to the table's page size.
    pub page_size: Option<usize>,
    /// Resume token from an earlier [`RecordPages`].
    pub token: Option<ContinuationToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Defaults to `data_type = T::DATA_TYPE` on `data_type_updated_ts_index`.
    pub condition: Option<KeyCondition>,
    /// Index the condition applies to; `None` queries the base table.
    pub index: Option<IndexName>,
    pub filter: Option<Filter>,
    pub page_size: Option<usize>,
    pub token: Option<ContinuationToken>,
    /// Hydrate each page into records instead of returning raw rows.
    pub verbose: bool,
}

pub struct Table<T> {
    store: Arc<dyn ItemStore>,
    schema: TableSchema,
    options: TableOptions,
    clock: Arc<dyn Clock>,
    _record: PhantomData<fn() -> T>,
}

impl<T: TableRecord> Table<T> {
    /// Creates a table over `store`, validating the schema of `T`.
    pub fn new(store: Arc<dyn ItemStore>, options: TableOptions) -> Result<Self> {
        let schema = TableSchema::of::<T>()?;
        if options.page_size == 0 {
            return Err(Error::InvalidInput(
                "page size must be greater than zero".to_string(),
            ));
        }
        if options.max_chunk_size == 0 || options.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "max chunk size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, options.max_chunk_size
            )));
        }
        Ok(Self {
            store,
            schema,
            options,
            clock: Arc::new(SystemClock),
            _record: PhantomData,
        })
    }

    /// Opens the configured storage and creates a table over it.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        // fail on a bad schema before touching storage
        TableSchema::of::<T>()?;
        let store = TableStore::open(config).await?;
        Self::new(Arc::new(store), TableOptions::from(config))
    }

    /// Replaces the clock used for `created_ts` and `updated_ts`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    /// Makes a new record without touching storage.
    pub fn create(&self, new: NewRecord<T>) -> LogicalRecord<T> {
        let now = self.clock.now_secs();
        let envelope = Envelope {
            record_id: new
                .record_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            source_unique: new.source_unique,
            data_type: T::DATA_TYPE.to_string(),
            data_status: new.data_status,
            created_ts: now,
            updated_ts: now,
            created_by: new.created_by,
            updated_by: new.updated_by,
            source: new.source,
            bucket_key: new.bucket_key,
        };
        LogicalRecord::new(envelope, new.data, RecordState::Defaulted)
    }

    /// Reads and builds every record `lookup` resolves to.
    #[tracing::instrument(level = "debug", skip_all, fields(data_type = T::DATA_TYPE))]
    pub async fn rebuild(&self, lookup: Lookup) -> Result<BuildOutcome<T>> {
        self.read_records(&lookup, None).await
    }

    /// Like [`rebuild`](Table::rebuild), reading only chunks whose type
    /// starts with `field_prefix`. Fields without matching chunks keep their
    /// defaults.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(data_type = T::DATA_TYPE, field_prefix = %field_prefix)
    )]
    pub async fn partial(&self, field_prefix: &str, lookup: Lookup) -> Result<BuildOutcome<T>> {
        self.read_records(&lookup, Some(field_prefix)).await
    }

    /// Pages through every record of this type in the table.
    pub fn iscan(&self, options: ScanOptions) -> RecordPages<T> {
        let mut filter = Attr::new(DATA_TYPE).eq(T::DATA_TYPE);
        if let Some(extra) = options.filter {
            filter = filter.and(extra);
        }
        let page_size = options.page_size.unwrap_or(self.options.page_size);
        let resumed = options.token.as_ref().and_then(produced_record);
        let request = ScanRequest::new(page_size)
            .with_filter(filter.clone())
            .with_token(options.token);
        RecordPages {
            cursor: PageCursor::new(Pager::scan(self.store.clone(), request), resumed),
            store: self.store.clone(),
            schema: self.schema.clone(),
            filter,
            page_size,
            _record: PhantomData,
        }
    }

    /// Pages through a query, by default over every record of this type.
    pub fn iquery(&self, options: QueryOptions) -> QueryPages<T> {
        let (condition, index) = match options.condition {
            Some(condition) => (condition, options.index),
            None => (
                KeyCondition::eq(DATA_TYPE, T::DATA_TYPE),
                Some(IndexName::DataTypeUpdatedTs),
            ),
        };
        let page_size = options.page_size.unwrap_or(self.options.page_size);
        let resumed = options.token.as_ref().and_then(produced_record);
        let mut request = QueryRequest::new(condition, page_size).with_token(options.token);
        if let Some(index) = index {
            request = request.on_index(index);
        }
        if let Some(filter) = options.filter.clone() {
            request = request.with_filter(filter);
        }
        QueryPages {
            cursor: PageCursor::new(Pager::query(self.store.clone(), request), resumed),
            store: self.store.clone(),
            schema: self.schema.clone(),
            filter: options.filter,
            page_size,
            verbose: options.verbose,
            _record: PhantomData,
        }
    }

    /// Saves a copy of `record`; the argument is left untouched.
    pub async fn save(&self, record: &LogicalRecord<T>) -> Result<LogicalRecord<T>> {
        let mut copy = record.clone();
        self.save_in_place(&mut copy).await?;
        Ok(copy)
    }

    /// Writes `record` and refreshes its `updated_ts`, chunk list and state.
    ///
    /// Chunks of the stored version that the new version no longer has are
    /// deleted in the same batched write, after the new chunks are written.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(data_type = T::DATA_TYPE, record_id = %record.record_id())
    )]
    pub async fn save_in_place(&self, record: &mut LogicalRecord<T>) -> Result<()> {
        let mut envelope = record.envelope().clone();
        envelope.data_type = T::DATA_TYPE.to_string();
        envelope.updated_ts = self.clock.now_secs();

        let rows = self.chunk_rows(&envelope, record.data())?;
        let names: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get_str(CHUNK_TYPE).map(str::to_string))
            .collect();
        let stale: Vec<ItemKey> = self
            .record_rows(&envelope.record_id, None)
            .await?
            .iter()
            .filter_map(|row| ItemKey::from_item(row).ok())
            .filter(|key| !names.contains(&key.chunk_type))
            .collect();

        let mut requests: Vec<WriteRequest> = rows.into_iter().map(WriteRequest::Put).collect();
        requests.extend(stale.iter().cloned().map(WriteRequest::Delete));
        self.store.batch_write(requests).await?;
        tracing::debug!(chunks = names.len(), stale = stale.len(), "saved record");

        if record.envelope().data_type != envelope.data_type {
            record.envelope_mut().data_type = envelope.data_type;
        }
        record.mark_persisted(envelope.updated_ts, names);
        Ok(())
    }

    /// Whether any row carries `source_unique`.
    pub async fn exists(&self, source_unique: &str) -> Result<bool> {
        let page = self
            .store
            .query(
                QueryRequest::new(KeyCondition::eq(SOURCE_UNIQUE, source_unique), 1)
                    .on_index(IndexName::SourceUnique),
            )
            .await?;
        Ok(!page.items.is_empty())
    }

    /// Saves `record` unless a row with its `source_unique` exists. Returns
    /// whether it was saved. Check and save are separate store calls.
    pub async fn insert_if_absent(&self, record: &mut LogicalRecord<T>) -> Result<bool> {
        let source_unique = record.envelope().source_unique.clone().ok_or_else(|| {
            Error::InvalidInput(format!(
                "record {} has no {} to check",
                record.record_id(),
                SOURCE_UNIQUE
            ))
        })?;
        if self.exists(&source_unique).await? {
            tracing::debug!(source_unique = %source_unique, "record already present");
            return Ok(false);
        }
        self.save_in_place(record).await?;
        Ok(true)
    }

    /// Deletes rows and returns how many were targeted.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(data_type = T::DATA_TYPE, mode = ?mode)
    )]
    pub async fn delete(&self, target: DeleteTarget, mode: DeleteMode) -> Result<usize> {
        let keys = match target {
            DeleteTarget::Key(key) => vec![key],
            DeleteTarget::Lookup(lookup) => {
                let (rows, _) = self.lookup_rows(&lookup, None).await?;
                extract_keys(&rows)?
            }
        };
        let count = keys.len();
        match mode {
            DeleteMode::Batch => self.store.batch_delete(keys).await?,
            DeleteMode::Sequential => {
                for key in &keys {
                    self.store.delete_item(key).await?;
                }
            }
        }
        tracing::debug!(rows = count, "deleted");
        Ok(count)
    }

    /// Fetches and builds the records behind index rows, such as a raw
    /// [`iquery`](Table::iquery) page.
    pub async fn batch_get(&self, index_rows: &[Item]) -> Result<BuildOutcome<T>> {
        batch_get_and_build(self.store.as_ref(), &self.schema, index_rows).await
    }

    /// Key attributes of `rows`, deduplicated.
    pub fn extract_keys(rows: &[Item]) -> Result<Vec<ItemKey>> {
        extract_keys(rows)
    }

    /// Rows for one saved record: the `primary` row (when the schema has
    /// non-fat fields, or there is nothing else to write) followed by the
    /// slices of each fat field. Unset fields produce nothing.
    fn chunk_rows(&self, envelope: &Envelope, data: &T) -> Result<Vec<Item>> {
        let mut fields = payload_fields(data)?;
        let base = envelope.to_item();
        let mut slim = serde_json::Map::new();
        let mut slices = Vec::new();
        for field in self.schema.fields() {
            let value = fields.remove(*field).unwrap_or(Value::Null);
            if !self.schema.is_fat(field) {
                if !value.is_null() {
                    slim.insert(field.to_string(), value);
                }
                continue;
            }
            let Some(encoded) = codec::encode(&value)? else {
                continue;
            };
            let parts = codec::split(&encoded, self.options.max_chunk_size)?;
            for (name, part) in slice_names(field, parts.len()).into_iter().zip(parts) {
                slices.push(base.clone().with(CHUNK_TYPE, name).with(DATA, part));
            }
        }

        let mut rows = Vec::with_capacity(slices.len() + 1);
        if self.schema.slim_fields().next().is_some() || slices.is_empty() {
            let encoded = codec::encode(&slim)?.unwrap_or_default();
            rows.push(base.with(CHUNK_TYPE, PRIMARY_CHUNK).with(DATA, encoded));
        }
        rows.extend(slices);
        Ok(rows)
    }

    async fn read_records(
        &self,
        lookup: &Lookup,
        chunk_prefix: Option<&str>,
    ) -> Result<BuildOutcome<T>> {
        let (rows, hydrate) = self.lookup_rows(lookup, chunk_prefix).await?;
        if rows.is_empty() {
            return Ok(BuildOutcome::default());
        }
        let outcome = if hydrate {
            batch_get_and_build(self.store.as_ref(), &self.schema, &rows).await?
        } else {
            build_batch(&self.schema, rows)
        };
        tracing::debug!(
            records = outcome.records.len(),
            error_items = outcome.error_items.len(),
            "rebuilt records"
        );
        Ok(outcome)
    }

    /// Rows `lookup` resolves to, and whether they are index projections
    /// that still need hydrating.
    async fn lookup_rows(
        &self,
        lookup: &Lookup,
        chunk_prefix: Option<&str>,
    ) -> Result<(Vec<Item>, bool)> {
        let page_size = lookup.limit.unwrap_or(self.options.page_size);
        let prefix_filter = chunk_prefix.map(|prefix| Attr::new(CHUNK_TYPE).begins_with(prefix));
        let (mut request, hydrate) = if let Some(record_id) = &lookup.record_id {
            let mut condition = KeyCondition::eq(RECORD_ID, record_id.as_str());
            if let Some(prefix) = chunk_prefix {
                condition =
                    condition.with_sort(CHUNK_TYPE, SortCondition::BeginsWith(prefix.into()));
            }
            (QueryRequest::new(condition, page_size), false)
        } else {
            let (condition, index, type_filter) = if let Some(source_unique) = &lookup.source_unique
            {
                (
                    KeyCondition::eq(SOURCE_UNIQUE, source_unique.as_str()),
                    IndexName::SourceUnique,
                    Some(Attr::new(DATA_TYPE).eq(T::DATA_TYPE)),
                )
            } else if lookup.by_type {
                (
                    KeyCondition::eq(DATA_TYPE, T::DATA_TYPE),
                    IndexName::DataTypeUpdatedTs,
                    None,
                )
            } else {
                return Err(Error::InvalidInput(
                    "lookup needs a record id, a source_unique or by_type".to_string(),
                ));
            };
            let mut request = QueryRequest::new(condition, page_size).on_index(index);
            if let Some(filter) = conjoin([type_filter, prefix_filter]) {
                request = request.with_filter(filter);
            }
            (request, true)
        };
        if let Some(filter) = lookup.filter.clone() {
            request.filter = conjoin([request.filter.take(), Some(filter)]);
        }

        let rows = match lookup.limit {
            Some(_) => self.store.query(request).await?.items,
            None => drain(Pager::query(self.store.clone(), request)).await?,
        };
        Ok((rows, hydrate))
    }

    async fn record_rows(&self, record_id: &str, filter: Option<Filter>) -> Result<Vec<Item>> {
        record_rows(&self.store, record_id, filter, self.options.page_size).await
    }
}

fn conjoin<const N: usize>(filters: [Option<Filter>; N]) -> Option<Filter> {
    filters
        .into_iter()
        .flatten()
        .reduce(|acc, filter| acc.and(filter))
}

async fn drain(mut pager: Pager) -> Result<Vec<Item>> {
    let mut rows = Vec::new();
    while let Some(page) = pager.next().await? {
        rows.extend(page.items);
    }
    Ok(rows)
}

/// Every base-table row of `record_id` that passes `filter`.
async fn record_rows(
    store: &Arc<dyn ItemStore>,
    record_id: &str,
    filter: Option<Filter>,
    page_size: usize,
) -> Result<Vec<Item>> {
    let mut request = QueryRequest::new(KeyCondition::eq(RECORD_ID, record_id), page_size);
    if let Some(filter) = filter {
        request = request.with_filter(filter);
    }
    drain(Pager::query(store.clone(), request)).await
}

/// Record that a page ending at `token` already produced in full. Tokens
/// that do not decode are left for the store to reject.
fn produced_record(token: &ContinuationToken) -> Option<String> {
    record_id_of_key(token.as_bytes()).ok()
}

/// Tracks records cut by page boundaries.
///
/// Rows of one record are adjacent in every scan or query order, so only the
/// last record of a page can be incomplete. When the page has a successor
/// that record is read in full and its remaining rows are skipped on the
/// next page. A resumed iteration starts out carrying the record its token
/// points into.
#[derive(Debug, Clone, Default)]
struct Boundary {
    carried: Option<String>,
}

impl Boundary {
    /// Splits a page into rows usable as they are and the ids of records to
    /// read in full.
    fn split(&mut self, mut rows: Vec<Item>, more: bool) -> (Vec<Item>, Vec<String>) {
        if let Some(carried) = &self.carried {
            let skip = rows
                .iter()
                .take_while(|row| row.get_str(RECORD_ID) == Some(carried.as_str()))
                .count();
            rows.drain(..skip);
        }
        let record_id = |row: &Item| row.get_str(RECORD_ID).map(str::to_string);

        let mut cut = Vec::new();
        if !more {
            self.carried = None;
        } else if let Some(last) = rows.last().and_then(record_id) {
            cut.push(last.clone());
            self.carried = Some(last);
        }
        rows.retain(|row| {
            row.get_str(RECORD_ID)
                .is_none_or(|id| !cut.iter().any(|c| c == id))
        });
        (rows, cut)
    }
}

/// A pager that keeps a fetched page until it has been fully processed, so a
/// failure while processing it retries the same page.
struct PageCursor {
    pager: Pager,
    pending: Option<Page>,
    boundary: Boundary,
}

impl PageCursor {
    fn new(pager: Pager, resumed: Option<String>) -> Self {
        Self {
            pager,
            pending: None,
            boundary: Boundary { carried: resumed },
        }
    }

    async fn fetch(&mut self) -> Result<Option<Page>> {
        match self.pending.take() {
            Some(page) => Ok(Some(page)),
            None => self.pager.next().await,
        }
    }
}

/// Pages of records from [`Table::iscan`]. Each page is built on its own;
/// a record whose rows straddle a page boundary is read in full and produced
/// once.
pub struct RecordPages<T> {
    cursor: PageCursor,
    store: Arc<dyn ItemStore>,
    schema: TableSchema,
    filter: Filter,
    page_size: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T: TableRecord> RecordPages<T> {
    /// Builds the next page, or `None` after the last one. A failed call can
    /// be retried and yields the same page.
    pub async fn next(&mut self) -> Result<Option<BuildOutcome<T>>> {
        let Some(page) = self.cursor.fetch().await? else {
            return Ok(None);
        };
        let mut boundary = self.cursor.boundary.clone();
        let (rows, cut) = boundary.split(page.items.clone(), page.next_token.is_some());
        let mut completed = Vec::new();
        for record_id in &cut {
            let filter = Some(self.filter.clone());
            match record_rows(&self.store, record_id, filter, self.page_size).await {
                Ok(rows) => completed.extend(rows),
                Err(err) => {
                    self.cursor.pending = Some(page);
                    return Err(err);
                }
            }
        }
        self.cursor.boundary = boundary;

        let mut outcome = build_batch(&self.schema, rows);
        outcome.extend(build_batch(&self.schema, completed));
        tracing::debug!(
            records = outcome.records.len(),
            error_items = outcome.error_items.len(),
            scanned = page.scanned_count,
            "record page"
        );
        Ok(Some(outcome))
    }

    /// Token that resumes after the last produced page.
    pub fn resume_token(&self) -> Option<&ContinuationToken> {
        self.cursor.pager.resume_token()
    }

    pub fn is_done(&self) -> bool {
        self.cursor.pending.is_none() && self.cursor.pager.is_done()
    }
}

/// One page from [`Table::iquery`].
#[derive(Debug, Clone)]
pub enum QueryPage<T> {
    /// Raw rows as the query returned them.
    Rows(Vec<Item>),
    /// Records hydrated from the page's rows.
    Records(BuildOutcome<T>),
}

/// Pages from [`Table::iquery`]. Raw pages are returned exactly as read;
/// hydrated pages treat records cut by a page boundary like
/// [`RecordPages`] does.
pub struct QueryPages<T> {
    cursor: PageCursor,
    store: Arc<dyn ItemStore>,
    schema: TableSchema,
    filter: Option<Filter>,
    page_size: usize,
    verbose: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: TableRecord> QueryPages<T> {
    pub async fn next(&mut self) -> Result<Option<QueryPage<T>>> {
        let Some(page) = self.cursor.fetch().await? else {
            return Ok(None);
        };
        if !self.verbose {
            return Ok(Some(QueryPage::Rows(page.items)));
        }

        let mut boundary = self.cursor.boundary.clone();
        let (rows, cut) = boundary.split(page.items.clone(), page.next_token.is_some());
        let outcome = match self.hydrate(rows, &cut).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cursor.pending = Some(page);
                return Err(err);
            }
        };
        self.cursor.boundary = boundary;
        Ok(Some(QueryPage::Records(outcome)))
    }

    async fn hydrate(&self, rows: Vec<Item>, cut: &[String]) -> Result<BuildOutcome<T>> {
        let mut outcome = batch_get_and_build(self.store.as_ref(), &self.schema, &rows).await?;
        for record_id in cut {
            let full =
                record_rows(&self.store, record_id, self.filter.clone(), self.page_size).await?;
            outcome.extend(build_batch(&self.schema, full));
        }
        Ok(outcome)
    }

    pub fn resume_token(&self) -> Option<&ContinuationToken> {
        self.cursor.pager.resume_token()
    }

    pub fn is_done(&self) -> bool {
        self.cursor.pending.is_none() && self.cursor.pager.is_done()
    }
}

#[cfg(test)]
mod tests {
    use common::clock::MockClock;
    use common::storage::in_memory::{FailingStorage, InMemoryStorage};
    use common::{Storage, StorageError};
    use opendata_macros::storage_test;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::model::UPDATED_TS;
    use crate::record::ProcessStage;
    use crate::retry::RetryPolicy;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        tags: Vec<String>,
        body: Option<String>,
    }

    impl TableRecord for Note {
        const DATA_TYPE: &'static str = "note";

        fn field_names() -> &'static [&'static str] {
            &["title", "tags", "body"]
        }

        fn fat_field_names() -> &'static [&'static str] {
            &["body"]
        }
    }

    fn options() -> TableOptions {
        TableOptions {
            page_size: 4,
            max_chunk_size: 16,
        }
    }

    fn table(storage: Arc<dyn Storage>) -> (Table<Note>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(1_000_000));
        let store: Arc<dyn ItemStore> = Arc::new(TableStore::new(storage, "notes"));
        let table = Table::new(store, options()).unwrap().with_clock(clock.clone());
        (table, clock)
    }

    fn note(title: &str, body: Option<&str>) -> Note {
        Note {
            title: title.to_string(),
            tags: vec!["a".to_string()],
            body: body.map(str::to_string),
        }
    }

    /// A body whose encoded form spans several 16-byte slices.
    fn long_body(seed: u32) -> String {
        let mut state = seed.max(1);
        (0..300)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                char::from(b'a' + (state % 26) as u8)
            })
            .collect()
    }

    fn numbered(i: u32, seed: u32) -> NewRecord<Note> {
        NewRecord::new(note(&format!("n{}", i), Some(&long_body(i + seed))))
    }

    async fn saved(
        table: &Table<Note>,
        title: &str,
        body: Option<&str>,
        source_unique: Option<&str>,
    ) -> LogicalRecord<Note> {
        let mut new = NewRecord::new(note(title, body));
        new.source_unique = source_unique.map(str::to_string);
        table.save(&table.create(new)).await.unwrap()
    }

    async fn stored_rows(table: &Table<Note>, record_id: &str) -> Vec<Item> {
        table.record_rows(record_id, None).await.unwrap()
    }

    #[test]
    fn should_create_record_without_storage() {
        // given
        let (table, _) = table(Arc::new(InMemoryStorage::new()));

        // when
        let record = table.create(
            NewRecord::new(note("t", None))
                .with_source_unique("doi:1")
                .with_author("loader")
                .with_status(ProcessStage::Stage1),
        );

        // then
        assert_eq!(record.state(), RecordState::Defaulted);
        assert_eq!(record.envelope().data_type, "note");
        assert_eq!(record.envelope().created_ts, 1000);
        assert_eq!(record.envelope().updated_ts, 1000);
        assert_eq!(record.envelope().data_status, ProcessStage::Stage1);
        assert_eq!(record.envelope().created_by.as_deref(), Some("loader"));
        assert!(Uuid::parse_str(record.record_id()).is_ok());
        assert!(record.chunks().is_empty());
    }

    #[test]
    fn should_reject_zero_page_size() {
        let store: Arc<dyn ItemStore> =
            Arc::new(TableStore::new(Arc::new(InMemoryStorage::new()), "t"));

        let result = Table::<Note>::new(
            store,
            TableOptions {
                page_size: 0,
                ..TableOptions::default()
            },
        );

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[storage_test]
    async fn should_save_fat_field_as_slices_and_rebuild(storage: Arc<dyn Storage>) {
        // given
        let (table, clock) = table(storage);
        let body = long_body(7);
        let record = table.create(NewRecord::new(note("Slices", Some(&body))));
        clock.advance(5_000);

        // when
        let saved = table.save(&record).await.unwrap();
        let outcome = table.rebuild(Lookup::by_id(record.record_id())).await.unwrap();

        // then
        assert_eq!(record.state(), RecordState::Defaulted);
        assert_eq!(saved.state(), RecordState::Persisted);
        assert_eq!(saved.envelope().updated_ts, 1005);
        assert_eq!(saved.chunks()[0], "primary");
        assert!(saved.chunks().len() > 3);
        assert!(outcome.error_items.is_empty());
        let rebuilt = &outcome.records[0];
        assert_eq!(rebuilt.data(), saved.data());
        assert_eq!(rebuilt.chunks(), saved.chunks());
        assert_eq!(rebuilt.envelope(), saved.envelope());
        assert_eq!(rebuilt.state(), RecordState::Loaded);
    }

    #[storage_test]
    async fn should_write_no_chunks_for_unset_fat_field(storage: Arc<dyn Storage>) {
        let (table, _) = table(storage);
        let mut record = table.create(NewRecord::new(note("no body", None)));

        table.save_in_place(&mut record).await.unwrap();

        assert_eq!(record.chunks(), ["primary".to_string()]);
        let rows = stored_rows(&table, record.record_id()).await;
        assert_eq!(rows.len(), 1);
    }

    #[storage_test]
    async fn should_delete_stale_slices_when_fat_field_shrinks(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let mut record = table.create(NewRecord::new(note("shrinks", Some(&long_body(3)))));
        table.save_in_place(&mut record).await.unwrap();
        let before = record.chunks().len();

        // when
        record.data_mut().body = Some("short".to_string());
        table.save_in_place(&mut record).await.unwrap();

        // then
        let rows = stored_rows(&table, record.record_id()).await;
        assert!(rows.len() < before);
        assert_eq!(rows.len(), record.chunks().len());
        let outcome = table.rebuild(Lookup::by_id(record.record_id())).await.unwrap();
        assert_eq!(outcome.records[0].data().body.as_deref(), Some("short"));
    }

    #[storage_test]
    async fn should_keep_rows_identical_except_updated_ts_when_saved_twice(
        storage: Arc<dyn Storage>,
    ) {
        // given
        let (table, clock) = table(storage);
        let mut record = table.create(NewRecord::new(note("twice", Some(&long_body(11)))));
        table.save_in_place(&mut record).await.unwrap();
        let first = stored_rows(&table, record.record_id()).await;

        // when
        clock.advance(60_000);
        table.save_in_place(&mut record).await.unwrap();
        let second = stored_rows(&table, record.record_id()).await;

        // then
        assert_eq!(first.len(), second.len());
        for (a, b) in first.into_iter().zip(second) {
            assert_eq!(b.get_n(UPDATED_TS), Some(a.get_n(UPDATED_TS).unwrap() + 60));
            let (mut a, mut b) = (a, b);
            a.remove(UPDATED_TS);
            b.remove(UPDATED_TS);
            assert_eq!(a, b);
        }
    }

    #[storage_test]
    async fn should_rebuild_by_source_unique_and_by_type(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        for i in 0..3 {
            let record = table.create(
                NewRecord::new(note(&format!("n{}", i), Some(&long_body(i + 1))))
                    .with_source_unique(format!("doi:{}", i)),
            );
            table.save(&record).await.unwrap();
        }

        // when
        let one = table.rebuild(Lookup::by_source_unique("doi:1")).await.unwrap();
        let all = table.rebuild(Lookup::by_type()).await.unwrap();
        let none = table.rebuild(Lookup::by_source_unique("doi:9")).await.unwrap();

        // then
        assert_eq!(one.records.len(), 1);
        assert_eq!(one.records[0].data().title, "n1");
        assert_eq!(all.records.len(), 3);
        assert!(all.error_items.is_empty());
        assert!(none.is_empty());
    }

    #[storage_test]
    async fn should_prefer_record_id_over_other_lookups(storage: Arc<dyn Storage>) {
        let (table, _) = table(storage);
        let first = saved(&table, "first", None, Some("s1")).await;
        saved(&table, "second", None, Some("s2")).await;

        let lookup = Lookup {
            record_id: Some(first.record_id().to_string()),
            source_unique: Some("s2".to_string()),
            by_type: true,
            ..Lookup::default()
        };
        let outcome = table.rebuild(lookup).await.unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].data().title, "first");
    }

    #[tokio::test]
    async fn should_reject_lookup_without_strategy() {
        let (table, _) = table(Arc::new(InMemoryStorage::new()));

        let result = table.rebuild(Lookup::default()).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[storage_test]
    async fn should_read_single_page_with_limit(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        for i in 0..3 {
            let record = table.create(NewRecord::new(note(&format!("n{}", i), None)));
            table.save(&record).await.unwrap();
        }

        // when
        let limited = table.rebuild(Lookup::by_type().with_limit(2)).await.unwrap();
        let all = table.rebuild(Lookup::by_type()).await.unwrap();

        // then
        assert_eq!(limited.records.len(), 2);
        assert_eq!(all.records.len(), 3);
    }

    #[storage_test]
    async fn should_rebuild_only_requested_field(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let body = long_body(9);
        let record = saved(&table, "partial", Some(&body), Some("p")).await;

        // when
        let by_id = table.partial("body", Lookup::by_id(record.record_id())).await.unwrap();
        let by_index = table.partial("body", Lookup::by_source_unique("p")).await.unwrap();

        // then
        for outcome in [by_id, by_index] {
            let rebuilt = &outcome.records[0];
            assert_eq!(rebuilt.data().body.as_deref(), Some(body.as_str()));
            assert_eq!(rebuilt.data().title, "");
            assert!(rebuilt.data().tags.is_empty());
            assert!(!rebuilt.chunks().contains(&"primary".to_string()));
        }
    }

    #[storage_test]
    async fn should_scan_records_of_own_type_across_page_boundaries(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage.clone());
        let mut expected = Vec::new();
        for i in 0..5 {
            let record = table.create(numbered(i, 20));
            expected.push(table.save(&record).await.unwrap().record_id().to_string());
        }
        let other = TableStore::new(storage, "notes");
        other
            .put_item(ItemKey::new("zzz", "primary").to_item().with(DATA_TYPE, "grant"))
            .await
            .unwrap();

        // when
        let mut pages = table.iscan(ScanOptions::default());
        let mut ids = Vec::new();
        let mut errors = 0;
        while let Some(outcome) = pages.next().await.unwrap() {
            ids.extend(outcome.records.iter().map(|r| r.record_id().to_string()));
            errors += outcome.error_items.len();
        }

        // then
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(errors, 0);
        assert!(pages.is_done());
    }

    #[storage_test]
    async fn should_resume_scan_from_token_without_losing_records(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let mut expected = Vec::new();
        for i in 0..4 {
            let record = table.create(numbered(i, 40));
            expected.push(table.save(&record).await.unwrap().record_id().to_string());
        }
        let mut first = table.iscan(ScanOptions::default());
        let mut ids: Vec<String> = first
            .next()
            .await
            .unwrap()
            .unwrap()
            .records
            .iter()
            .map(|r| r.record_id().to_string())
            .collect();
        let token = first.resume_token().cloned();
        drop(first);

        // when
        let mut resumed = table.iscan(ScanOptions {
            token,
            ..ScanOptions::default()
        });
        let mut errors = 0;
        while let Some(outcome) = resumed.next().await.unwrap() {
            ids.extend(outcome.records.iter().map(|r| r.record_id().to_string()));
            errors += outcome.error_items.len();
        }

        // then
        assert_eq!(ids.len(), expected.len(), "produced: {:?}", ids);
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(errors, 0);
    }

    #[storage_test]
    async fn should_resume_hydrated_query_without_repeating_records(storage: Arc<dyn Storage>) {
        // given
        let (table, clock) = table(storage);
        let mut expected = Vec::new();
        for i in 0..4 {
            clock.advance(1_000);
            let record = table.create(numbered(i, 300));
            expected.push(table.save(&record).await.unwrap().record_id().to_string());
        }
        let verbose = QueryOptions {
            verbose: true,
            ..QueryOptions::default()
        };
        let record_ids = |page: QueryPage<Note>| match page {
            QueryPage::Records(outcome) => outcome
                .records
                .iter()
                .map(|r| r.record_id().to_string())
                .collect::<Vec<_>>(),
            QueryPage::Rows(_) => panic!("expected records"),
        };
        let mut first = table.iquery(verbose.clone());
        let mut ids = record_ids(first.next().await.unwrap().unwrap());
        let token = first.resume_token().cloned();
        assert!(token.is_some());
        drop(first);

        // when
        let mut resumed = table.iquery(QueryOptions { token, ..verbose });
        while let Some(page) = resumed.next().await.unwrap() {
            ids.extend(record_ids(page));
        }

        // then
        assert_eq!(ids.len(), expected.len(), "produced: {:?}", ids);
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[storage_test]
    async fn should_return_raw_or_hydrated_query_pages(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        for i in 0..3 {
            let record = table.create(numbered(i, 60));
            table.save(&record).await.unwrap();
        }

        // when
        let mut raw = table.iquery(QueryOptions::default());
        let mut raw_rows = 0;
        while let Some(page) = raw.next().await.unwrap() {
            match page {
                QueryPage::Rows(rows) => raw_rows += rows.len(),
                QueryPage::Records(_) => panic!("expected raw rows"),
            }
        }
        let mut hydrated = table.iquery(QueryOptions {
            verbose: true,
            ..QueryOptions::default()
        });
        let mut records = Vec::new();
        while let Some(page) = hydrated.next().await.unwrap() {
            match page {
                QueryPage::Records(outcome) => {
                    assert!(outcome.error_items.is_empty());
                    records.extend(outcome.records);
                }
                QueryPage::Rows(_) => panic!("expected records"),
            }
        }

        // then
        assert!(raw_rows > 3);
        assert_eq!(records.len(), 3);
    }

    #[storage_test]
    async fn should_hydrate_raw_query_rows_later(storage: Arc<dyn Storage>) {
        let (table, _) = table(storage);
        let record = saved(&table, "later", Some("b"), Some("s")).await;
        let mut pages = table.iquery(QueryOptions {
            condition: Some(KeyCondition::eq(SOURCE_UNIQUE, "s")),
            index: Some(IndexName::SourceUnique),
            page_size: Some(100),
            ..QueryOptions::default()
        });

        let Some(QueryPage::Rows(rows)) = pages.next().await.unwrap() else {
            panic!("expected raw rows");
        };
        let keys = Table::<Note>::extract_keys(&rows).unwrap();
        let outcome = table.batch_get(&rows).await.unwrap();

        assert_eq!(keys.len(), record.chunks().len());
        assert_eq!(outcome.records[0].data().title, "later");
    }

    #[storage_test]
    async fn should_insert_only_when_source_unique_absent(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let mut first = table.create(NewRecord::new(note("a", None)).with_source_unique("doi:x"));
        let mut second = table.create(NewRecord::new(note("b", None)).with_source_unique("doi:x"));

        // when
        let inserted_first = table.insert_if_absent(&mut first).await.unwrap();
        let inserted_second = table.insert_if_absent(&mut second).await.unwrap();

        // then
        assert!(inserted_first);
        assert!(!inserted_second);
        assert_eq!(second.state(), RecordState::Defaulted);
        assert!(table.exists("doi:x").await.unwrap());
        assert!(!table.exists("doi:y").await.unwrap());
    }

    #[tokio::test]
    async fn should_reject_insert_without_source_unique() {
        let (table, _) = table(Arc::new(InMemoryStorage::new()));
        let mut record = table.create(NewRecord::new(note("a", None)));

        let result = table.insert_if_absent(&mut record).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[storage_test]
    async fn should_delete_all_chunks_of_record(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let record = saved(&table, "gone", Some(&long_body(2)), None).await;
        let kept = saved(&table, "kept", None, None).await;

        // when
        let deleted = table
            .delete(DeleteTarget::Lookup(Lookup::by_id(record.record_id())), DeleteMode::Batch)
            .await
            .unwrap();

        // then
        assert_eq!(deleted, record.chunks().len());
        assert!(table.rebuild(Lookup::by_id(record.record_id())).await.unwrap().is_empty());
        assert_eq!(table.rebuild(Lookup::by_id(kept.record_id())).await.unwrap().records.len(), 1);
    }

    #[storage_test]
    async fn should_delete_sequentially_by_source_unique_and_by_key(storage: Arc<dyn Storage>) {
        // given
        let (table, _) = table(storage);
        let record = saved(&table, "seq", Some(&long_body(4)), Some("s")).await;
        let single = saved(&table, "single", None, None).await;

        // when
        let by_index = table
            .delete(DeleteTarget::Lookup(Lookup::by_source_unique("s")), DeleteMode::Sequential)
            .await
            .unwrap();
        let by_key = table
            .delete(
                DeleteTarget::Key(ItemKey::new(single.record_id(), PRIMARY_CHUNK)),
                DeleteMode::Batch,
            )
            .await
            .unwrap();

        // then
        assert_eq!(by_index, record.chunks().len());
        assert_eq!(by_key, 1);
        assert!(table.rebuild(Lookup::by_type()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_retry_scan_page_after_failed_completion() {
        // given
        let failing = FailingStorage::wrap(Arc::new(InMemoryStorage::new()));
        let store: Arc<dyn ItemStore> = Arc::new(
            TableStore::new(failing.clone(), "notes").with_retry_policy(RetryPolicy::no_retries()),
        );
        let table: Table<Note> = Table::new(store, options()).unwrap();
        for i in 0..2 {
            let record = table.create(numbered(i, 80));
            table.save(&record).await.unwrap();
        }
        let mut pages = table.iscan(ScanOptions::default());

        // when
        // first read is the page itself, the second completes the cut record
        failing.fail_reads_after(1, StorageError::Storage("blip".into()));
        let failed = pages.next().await;
        failing.clear();
        let mut records = 0;
        while let Some(outcome) = pages.next().await.unwrap() {
            records += outcome.records.len();
        }

        // then
        assert!(failed.is_err());
        assert_eq!(records, 2);
    }
}
