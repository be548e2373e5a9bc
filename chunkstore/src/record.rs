//! Logical records: a typed payload plus the envelope attributes every stored
//! row of the record carries.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{
    AttributeValue, BUCKET_KEY, CREATED_BY, CREATED_TS, DATA_STATUS, DATA_TYPE, Item, RECORD_ID,
    SOURCE, SOURCE_UNIQUE, UPDATED_BY, UPDATED_TS,
};

/// A record type that can be stored in a [`Table`](crate::Table).
///
/// The payload must serialize to a JSON object whose keys include every name
/// in [`field_names`](TableRecord::field_names). Fields named in
/// [`fat_field_names`](TableRecord::fat_field_names) are stored in their own
/// rows and sliced when large; the remaining fields share the `primary` row.
pub trait TableRecord:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Value of the `data_type` attribute for records of this type.
    const DATA_TYPE: &'static str;

    fn field_names() -> &'static [&'static str];

    fn fat_field_names() -> &'static [&'static str] {
        &[]
    }
}

/// Processing stage of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStage {
    #[default]
    Import,
    #[serde(rename = "stage_1")]
    Stage1,
}

impl ProcessStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStage::Import => "import",
            ProcessStage::Stage1 => "stage_1",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "import" => Ok(ProcessStage::Import),
            "stage_1" => Ok(ProcessStage::Stage1),
            other => Err(Error::InvalidInput(format!(
                "unknown data status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an in-memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Constructed from defaults, never read or written.
    Defaulted,
    /// Built from stored rows.
    Loaded,
    /// Changed since it was constructed, loaded or saved.
    Mutated,
    /// Matches what the last save wrote.
    Persisted,
}

/// Attributes shared by every row of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub record_id: String,
    pub source_unique: Option<String>,
    pub data_type: String,
    pub data_status: ProcessStage,
    /// Seconds since the Unix epoch.
    pub created_ts: i64,
    /// Seconds since the Unix epoch. Refreshed on every save.
    pub updated_ts: i64,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub source: Option<String>,
    /// Pointer to a blob kept outside the table.
    pub bucket_key: Option<String>,
}

impl Envelope {
    /// Reads the envelope attributes of a stored row.
    pub fn from_item(item: &Item) -> Result<Self> {
        let record_id = item
            .get_str(RECORD_ID)
            .ok_or_else(|| Error::Build(format!("row has no {}", RECORD_ID)))?;
        let data_type = item
            .get_str(DATA_TYPE)
            .ok_or_else(|| Error::Build(format!("row of {} has no {}", record_id, DATA_TYPE)))?;
        let data_status = match item.get_str(DATA_STATUS) {
            Some(status) => {
                ProcessStage::parse(status).map_err(|e| Error::Build(e.to_string()))?
            }
            None => ProcessStage::default(),
        };
        let text = |name: &str| item.get_str(name).map(str::to_string);
        Ok(Self {
            record_id: record_id.to_string(),
            source_unique: text(SOURCE_UNIQUE),
            data_type: data_type.to_string(),
            data_status,
            created_ts: item.get_n(CREATED_TS).unwrap_or_default(),
            updated_ts: item.get_n(UPDATED_TS).unwrap_or_default(),
            created_by: text(CREATED_BY),
            updated_by: text(UPDATED_BY),
            source: text(SOURCE),
            bucket_key: text(BUCKET_KEY),
        })
    }

    /// Envelope attributes as a row. Unset attributes are omitted.
    pub fn to_item(&self) -> Item {
        let mut item = Item::new()
            .with(RECORD_ID, self.record_id.as_str())
            .with(DATA_TYPE, self.data_type.as_str())
            .with(DATA_STATUS, self.data_status.as_str())
            .with(CREATED_TS, self.created_ts)
            .with(UPDATED_TS, self.updated_ts);
        item.insert_opt(SOURCE_UNIQUE, self.source_unique.as_deref());
        item.insert_opt(CREATED_BY, self.created_by.as_deref());
        item.insert_opt(UPDATED_BY, self.updated_by.as_deref());
        item.insert_opt(SOURCE, self.source.as_deref());
        item.insert_opt(BUCKET_KEY, self.bucket_key.as_deref());
        item
    }
}

/// Inputs for [`Table::create`](crate::Table::create).
#[derive(Debug, Clone, Default)]
pub struct NewRecord<T> {
    pub data: T,
    /// Generated when unset.
    pub record_id: Option<String>,
    pub source_unique: Option<String>,
    pub data_status: ProcessStage,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub source: Option<String>,
    pub bucket_key: Option<String>,
}

impl<T> NewRecord<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            record_id: None,
            source_unique: None,
            data_status: ProcessStage::default(),
            created_by: None,
            updated_by: None,
            source: None,
            bucket_key: None,
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_source_unique(mut self, source_unique: impl Into<String>) -> Self {
        self.source_unique = Some(source_unique.into());
        self
    }

    pub fn with_status(mut self, status: ProcessStage) -> Self {
        self.data_status = status;
        self
    }

    /// Sets both `created_by` and `updated_by`.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        let author = author.into();
        self.created_by = Some(author.clone());
        self.updated_by = Some(author);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_bucket_key(mut self, bucket_key: impl Into<String>) -> Self {
        self.bucket_key = Some(bucket_key.into());
        self
    }
}

/// A record as seen by callers: envelope, typed payload and the chunk names
/// it was last read from or written to.
#[derive(Debug, Clone)]
pub struct LogicalRecord<T> {
    envelope: Envelope,
    data: T,
    chunks: Vec<String>,
    state: RecordState,
}

impl<T: TableRecord> LogicalRecord<T> {
    pub(crate) fn new(envelope: Envelope, data: T, state: RecordState) -> Self {
        Self {
            envelope,
            data,
            chunks: Vec::new(),
            state,
        }
    }

    pub(crate) fn loaded(envelope: Envelope, data: T, chunks: Vec<String>) -> Self {
        Self {
            envelope,
            data,
            chunks,
            state: RecordState::Loaded,
        }
    }

    pub fn record_id(&self) -> &str {
        &self.envelope.record_id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Mutable envelope access. Marks the record mutated.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        self.state = RecordState::Mutated;
        &mut self.envelope
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutable payload access. Marks the record mutated.
    pub fn data_mut(&mut self) -> &mut T {
        self.state = RecordState::Mutated;
        &mut self.data
    }

    pub fn set_data(&mut self, data: T) {
        self.state = RecordState::Mutated;
        self.data = data;
    }

    pub fn into_data(self) -> T {
        self.data
    }

    /// Chunk names, ordered as read or as written by the last save.
    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub(crate) fn mark_persisted(&mut self, updated_ts: i64, chunks: Vec<String>) {
        self.envelope.updated_ts = updated_ts;
        self.chunks = chunks;
        self.state = RecordState::Persisted;
    }

    /// Envelope and payload as one flat mapping, the shape in which a
    /// record is handed to other systems. Unset attributes are omitted.
    pub fn as_mapping(&self) -> Result<Map<String, Value>> {
        let mut mapping = payload_fields(&self.data)?;
        mapping.retain(|_, value| !value.is_null());
        for (name, value) in self.envelope.to_item() {
            let value = match value {
                AttributeValue::S(s) => Value::String(s),
                AttributeValue::N(n) => Value::from(n),
                AttributeValue::Bool(b) => Value::Bool(b),
                AttributeValue::B(_) => continue,
            };
            mapping.insert(name, value);
        }
        Ok(mapping)
    }
}

/// Serializes a payload into its top-level fields.
pub(crate) fn payload_fields<T: Serialize>(data: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(data).map_err(|e| Error::Encode(e.to_string()))? {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::Encode(format!(
            "record payload must serialize to an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
