//! Reassembly of logical records from chunk rows.
//!
//! Rows arrive in whatever order the store returned them, possibly mixing
//! several records. They are grouped by `record_id`, each group's chunks are
//! put in [`ChunkType`] order, slices of a field are concatenated and every
//! field payload is decoded. A group that cannot be built never fails the
//! batch: its raw rows are handed back as error items.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use serde_json::Value;

use crate::chunk::ChunkType;
use crate::codec;
use crate::error::{Error, Result};
use crate::model::{
    CHUNK_TYPE, DATA, DATA_TYPE, Item, ItemKey, RECORD_ID, SOURCE_UNIQUE, UPDATED_TS,
};
use crate::record::{Envelope, LogicalRecord, TableRecord};
use crate::schema::TableSchema;
use crate::store::ItemStore;

/// Attributes that must agree across all rows of one record.
const INDEX_ATTRIBUTES: [&str; 3] = [SOURCE_UNIQUE, DATA_TYPE, UPDATED_TS];

/// Records built from a batch of rows, plus the rows that could not be built.
#[derive(Debug, Clone)]
pub struct BuildOutcome<T> {
    pub records: Vec<LogicalRecord<T>>,
    pub error_items: Vec<Item>,
}

impl<T> Default for BuildOutcome<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            error_items: Vec::new(),
        }
    }
}

impl<T> BuildOutcome<T> {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.error_items.is_empty()
    }

    pub fn extend(&mut self, other: BuildOutcome<T>) {
        self.records.extend(other.records);
        self.error_items.extend(other.error_items);
    }
}

/// Rows sharing one record id, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroup {
    pub record_id: String,
    pub rows: Vec<Item>,
}

/// Groups rows by record id. Groups keep first-seen order and rows keep
/// input order. Rows without a record id are returned separately.
pub fn group_by_record_id(rows: Vec<Item>) -> (Vec<ChunkGroup>, Vec<Item>) {
    let mut groups: Vec<ChunkGroup> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut orphans = Vec::new();
    for row in rows {
        let Some(record_id) = row.get_str(RECORD_ID).map(str::to_string) else {
            orphans.push(row);
            continue;
        };
        match positions.get(&record_id) {
            Some(&pos) => groups[pos].rows.push(row),
            None => {
                positions.insert(record_id.clone(), groups.len());
                groups.push(ChunkGroup {
                    record_id,
                    rows: vec![row],
                });
            }
        }
    }
    (groups, orphans)
}

/// Builds one record from the rows of a single record id.
///
/// Returns `None` for an empty group.
pub fn build_one<T: TableRecord>(
    schema: &TableSchema,
    rows: &[Item],
) -> Result<Option<LogicalRecord<T>>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let record_id = first
        .get_str(RECORD_ID)
        .ok_or_else(|| Error::Build(format!("row has no {}", RECORD_ID)))?;

    let mut chunks: Vec<(ChunkType, &str, &Item)> = Vec::with_capacity(rows.len());
    let mut seen = HashSet::new();
    for row in rows {
        if row.get_str(RECORD_ID) != Some(record_id) {
            return Err(Error::Build(format!(
                "group of {} contains a row of another record",
                record_id
            )));
        }
        for attr in INDEX_ATTRIBUTES {
            if row.get(attr) != first.get(attr) {
                return Err(Error::Build(format!(
                    "rows of {} disagree on {}",
                    record_id, attr
                )));
            }
        }
        let name = row
            .get_str(CHUNK_TYPE)
            .ok_or_else(|| Error::Build(format!("row of {} has no {}", record_id, CHUNK_TYPE)))?;
        if !seen.insert(name) {
            return Err(Error::Build(format!(
                "record {} has chunk {} twice",
                record_id, name
            )));
        }
        chunks.push((ChunkType::parse(name), name, row));
    }
    chunks.sort_by(|a, b| a.0.cmp(&b.0));

    let envelope = Envelope::from_item(chunks[0].2)?;
    if envelope.data_type != schema.data_type() {
        return Err(Error::Build(format!(
            "record {} has data type {}, expected {}",
            record_id,
            envelope.data_type,
            schema.data_type()
        )));
    }

    let mut payload = match serde_json::to_value(T::default()) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => {
            return Err(Error::Build(format!(
                "default payload of {} is not an object",
                schema.data_type()
            )));
        }
        Err(e) => return Err(Error::Encode(e.to_string())),
    };
    // field -> (next expected ordinal, slices so far)
    let mut slices: BTreeMap<&str, (u32, Vec<Bytes>)> = BTreeMap::new();
    for (chunk_type, name, row) in &chunks {
        let data = row.get_bytes(DATA).ok_or_else(|| {
            Error::Build(format!("chunk {} of {} has no {}", name, record_id, DATA))
        })?;
        match chunk_type {
            ChunkType::Primary => {
                let decoded: Option<serde_json::Map<String, Value>> =
                    codec::decode(Some(data.as_ref()))?;
                for (field, value) in decoded.unwrap_or_default() {
                    if schema.is_field(&field) {
                        payload.insert(field, value);
                    }
                }
            }
            ChunkType::Whole(field) => {
                known_field(schema, record_id, field)?;
                let value: Option<Value> = codec::decode(Some(data.as_ref()))?;
                payload.insert(field.clone(), value.unwrap_or(Value::Null));
            }
            ChunkType::Slice { field, ordinal } => {
                known_field(schema, record_id, field)?;
                let (expected, parts) = slices.entry(field.as_str()).or_insert((1, Vec::new()));
                if *ordinal != *expected {
                    return Err(Error::Build(format!(
                        "record {} field {}: expected slice {}, found {}",
                        record_id, field, expected, ordinal
                    )));
                }
                *expected += 1;
                parts.push(data.clone());
            }
        }
    }
    for (field, (_, parts)) in slices {
        let value: Option<Value> = codec::decode(Some(codec::join(&parts).as_ref()))?;
        payload.insert(field.to_string(), value.unwrap_or(Value::Null));
    }

    let data: T = serde_json::from_value(Value::Object(payload))
        .map_err(|e| Error::Decode(format!("record {}: {}", record_id, e)))?;
    let names = chunks.iter().map(|(_, name, _)| name.to_string()).collect();
    Ok(Some(LogicalRecord::loaded(envelope, data, names)))
}

fn known_field(schema: &TableSchema, record_id: &str, field: &str) -> Result<()> {
    if schema.is_field(field) {
        Ok(())
    } else {
        Err(Error::Build(format!(
            "record {} has chunk for unknown field {}",
            record_id, field
        )))
    }
}

/// Builds every record found in `rows`. Never fails: rows of groups that
/// cannot be built are collected in [`BuildOutcome::error_items`].
pub fn build_batch<T: TableRecord>(schema: &TableSchema, rows: Vec<Item>) -> BuildOutcome<T> {
    let (groups, orphans) = group_by_record_id(rows);
    let mut outcome = BuildOutcome::default();
    if !orphans.is_empty() {
        tracing::warn!(rows = orphans.len(), "rows without {} skipped", RECORD_ID);
        outcome.error_items.extend(orphans);
    }
    for group in groups {
        match build_one(schema, &group.rows) {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    record_id = %group.record_id,
                    rows = group.rows.len(),
                    error = %err,
                    "failed to build record"
                );
                outcome.error_items.extend(group.rows);
            }
        }
    }
    outcome
}

/// Key attributes of `rows`, deduplicated, in first-seen order.
pub fn extract_keys(rows: &[Item]) -> Result<Vec<ItemKey>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let key = ItemKey::from_item(row)?;
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// Fetches the full rows behind index rows and builds them.
pub async fn batch_get_and_build<T: TableRecord>(
    store: &dyn ItemStore,
    schema: &TableSchema,
    index_rows: &[Item],
) -> Result<BuildOutcome<T>> {
    if index_rows.is_empty() {
        return Ok(BuildOutcome::default());
    }
    let keys = extract_keys(index_rows)?;
    let rows = store.batch_get(keys, true).await?;
    Ok(build_batch(schema, rows))
}
