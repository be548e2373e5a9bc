//! OpenData ChunkStore - size-unbounded records over a size-bounded item store.
//!
//! ChunkStore persists typed business records whose serialized form may be
//! far larger than a single storage item allows. Each logical record is
//! spread over several physical rows that share a `record_id`, and is
//! reassembled on read.
//!
//! # Architecture
//!
//! Records live in a table of items keyed by `(record_id, chunk_type)`. The
//! `primary` row carries the record envelope and its slim fields, compressed
//! together. Each fat field is compressed on its own, cut into slices of at
//! most [`MAX_CHUNK_SIZE`] bytes, and written to rows named `{field}_{n}`
//! with `n` counting from 1. Two secondary indexes, by `source_unique` and by
//! `(data_type, updated_ts)`, are maintained in the same atomic write as the
//! rows they project.
//!
//! The table runs on any [`common::Storage`] backend through [`TableStore`],
//! which retries transient storage failures with exponential backoff.
//!
//! # Key Concepts
//!
//! - **TableRecord**: Trait implemented by a business type to declare its
//!   data type, its fields, and which of them are fat.
//! - **Table**: Typed entry point for creating, saving, rebuilding, scanning,
//!   querying and deleting records of one type.
//! - **LogicalRecord**: A record with its envelope, payload and the chunk
//!   names it was last persisted with.
//! - **BuildOutcome**: Records rebuilt from a set of rows together with the
//!   rows of record groups that could not be rebuilt.
//! - **Pager**: Resumable page-by-page iteration over scans and queries.
//!
//! # Example
//!
//! ```ignore
//! use chunkstore::{Config, Lookup, NewRecord, ScanOptions, Table, TableRecord};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Article {
//!     title: Option<String>,
//!     body: Option<String>,
//! }
//!
//! impl TableRecord for Article {
//!     const DATA_TYPE: &'static str = "Article";
//!
//!     fn field_names() -> &'static [&'static str] {
//!         &["title", "body"]
//!     }
//!
//!     fn fat_field_names() -> &'static [&'static str] {
//!         &["body"]
//!     }
//! }
//!
//! let table = Table::<Article>::open(&Config::new("articles")).await?;
//!
//! // Create and persist a record
//! let record = table.create(NewRecord::new(article).with_source_unique("doi:10.1/x"));
//! let saved = table.save(&record).await?;
//!
//! // Rebuild it from its rows
//! let outcome = table.rebuild(Lookup::by_id(saved.record_id())).await?;
//! assert_eq!(outcome.records[0].data().title, saved.data().title);
//!
//! // Walk every record of the type, page by page
//! let mut pages = table.iscan(ScanOptions::default());
//! while let Some(page) = pages.next().await? {
//!     for record in page.records {
//!         println!("{}", record.record_id());
//!     }
//! }
//! ```

mod builder;
mod chunk;
mod codec;
mod config;
mod error;
mod model;
mod pager;
mod record;
mod retry;
mod schema;
mod serde;
mod settings;
mod store;
mod table;

pub use builder::{BuildOutcome, ChunkGroup, build_batch, build_one, group_by_record_id};
pub use chunk::{ChunkType, PRIMARY_CHUNK, slice_names};
pub use codec::{MAX_CHUNK_SIZE, decode, encode, join, split};
pub use config::Config;
pub use error::{Error, Result};
pub use model::{
    Attr, AttributeValue, BUCKET_KEY, CHUNK_TYPE, CREATED_BY, CREATED_TS, ContinuationToken, DATA,
    DATA_STATUS, DATA_TYPE, Filter, IndexName, Item, ItemKey, KeyCondition, Page, QueryRequest,
    RECORD_ID, SOURCE, SOURCE_UNIQUE, ScanRequest, SortCondition, UPDATED_BY, UPDATED_TS,
};
pub use pager::Pager;
pub use record::{Envelope, LogicalRecord, NewRecord, ProcessStage, RecordState, TableRecord};
pub use retry::RetryPolicy;
pub use schema::TableSchema;
pub use settings::Settings;
pub use store::{
    BATCH_GET_LIMIT, BATCH_WRITE_LIMIT, ItemStore, MAX_ITEM_SIZE, TableStore, WriteRequest,
};
pub use table::{
    DeleteMode, DeleteTarget, Lookup, QueryOptions, QueryPage, QueryPages, RecordPages,
    ScanOptions, Table, TableOptions,
};
