//! Storage encoding of table rows and index entries.
//!
//! # Key Format
//!
//! All keys start with the shared 2-byte prefix (version, record tag):
//!
//! ```text
//! Row:    | version | tag(Row)   | table | record_id | chunk_type |
//! Index:  | version | tag(Index) | table | index (u8) | partition value | [sort value] | record_id | chunk_type |
//! ```
//!
//! Strings (`table`, `record_id`, `chunk_type`) use terminated bytes so that
//! byte order equals string order and a value never prefixes another.
//! Index key values carry a type byte followed by terminated bytes
//! (strings, binary), a sortable big-endian i64 (numbers) or a single byte
//! (booleans).
//!
//! # Value Format
//!
//! Rows and index projections store an encoded [`Item`]:
//!
//! ```text
//! | version (u8) | count (u16) | attribute * count |
//! attribute: | name_len (u16) | name (utf8) | type (u8) | payload |
//! payload:   S: | len (u32) | utf8 |   N: | i64 BE |   B: | len (u32) | bytes |   Bool: | u8 |
//! ```

use std::ops::Bound;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::BytesRange;
use common::bytes::lex_increment;
use common::serde::key_prefix::KeyPrefix;
use common::serde::{sortable, terminated_bytes};

use crate::error::{Error, Result};
use crate::model::{
    AttributeValue, CHUNK_TYPE, IndexName, Item, ItemKey, KeyCondition, RECORD_ID, SortCondition,
};

/// Key format version.
pub const KEY_VERSION: u8 = 0x01;

/// Value format version.
pub const VALUE_VERSION: u8 = 0x01;

/// Record type discriminators for chunk store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A table row (one chunk of one record).
    Row = 0x01,
    /// A secondary index entry pointing at a row.
    IndexEntry = 0x02,
}

impl RecordType {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(RecordType::Row),
            0x02 => Ok(RecordType::IndexEntry),
            _ => Err(Error::Decode(format!("invalid record type: 0x{:02x}", id))),
        }
    }

    fn prefix(&self) -> KeyPrefix {
        KeyPrefix::new(KEY_VERSION, self.id())
    }
}

const TYPE_S: u8 = 0x01;
const TYPE_N: u8 = 0x02;
const TYPE_B: u8 = 0x03;
const TYPE_BOOL: u8 = 0x04;

fn index_id(index: IndexName) -> u8 {
    match index {
        IndexName::SourceUnique => 0x01,
        IndexName::DataTypeUpdatedTs => 0x02,
    }
}

/// Key of a table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub table: String,
    pub key: ItemKey,
}

impl RowKey {
    pub fn new(table: impl Into<String>, key: ItemKey) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let prefix = Self::partition_prefix(&self.table, &self.key.record_id);
        let mut buf = BytesMut::from(prefix.as_ref());
        terminated_bytes::serialize(self.key.chunk_type.as_bytes(), &mut buf);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let prefix = KeyPrefix::from_bytes_versioned(data, KEY_VERSION)?;
        let record_type = RecordType::from_id(prefix.record_type())?;
        if record_type != RecordType::Row {
            return Err(Error::Decode(format!(
                "invalid record type: expected Row, got {:?}",
                record_type
            )));
        }

        let mut buf = &data[KeyPrefix::LEN..];
        let table = read_string(&mut buf)?;
        let record_id = read_string(&mut buf)?;
        let chunk_type = read_string(&mut buf)?;
        if !buf.is_empty() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after row key",
                buf.len()
            )));
        }
        Ok(Self::new(table, ItemKey::new(record_id, chunk_type)))
    }

    fn table_prefix(table: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        RecordType::Row.prefix().write_to(&mut buf);
        terminated_bytes::serialize(table.as_bytes(), &mut buf);
        buf
    }

    fn partition_prefix(table: &str, record_id: &str) -> Bytes {
        let mut buf = Self::table_prefix(table);
        terminated_bytes::serialize(record_id.as_bytes(), &mut buf);
        buf.freeze()
    }

    /// Every row of `table`.
    pub fn table_range(table: &str) -> BytesRange {
        BytesRange::prefix(Self::table_prefix(table).freeze())
    }

    /// Rows matching a base-table key condition (`record_id` equality, with
    /// an optional condition on `chunk_type`).
    pub fn query_range(table: &str, condition: &KeyCondition) -> Result<BytesRange> {
        if condition.partition_attr != RECORD_ID {
            return Err(Error::InvalidInput(format!(
                "base table partition key is {}, got {}",
                RECORD_ID, condition.partition_attr
            )));
        }
        let record_id = condition.partition_value.as_str().ok_or_else(|| {
            Error::InvalidInput(format!("{} must be a string", RECORD_ID))
        })?;
        let prefix = Self::partition_prefix(table, record_id);

        match &condition.sort {
            None => Ok(BytesRange::prefix(prefix)),
            Some((attr, sort)) => {
                if attr != CHUNK_TYPE {
                    return Err(Error::InvalidInput(format!(
                        "base table sort key is {}, got {}",
                        CHUNK_TYPE, attr
                    )));
                }
                sort_range(&prefix, sort, |value| {
                    let s = value.as_str().ok_or_else(|| {
                        Error::InvalidInput(format!("{} must be a string", CHUNK_TYPE))
                    })?;
                    Ok(terminated_bytes::serialize_to_bytes(s.as_bytes()))
                })
            }
        }
    }
}

/// Key of a secondary index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntryKey<'a> {
    pub table: &'a str,
    pub index: IndexName,
    pub partition: &'a AttributeValue,
    pub sort: Option<&'a AttributeValue>,
    pub key: ItemKey,
}

impl<'a> IndexEntryKey<'a> {
    /// Index entry for `row`, or `None` when the row lacks the index's key
    /// attributes.
    pub fn for_row(table: &'a str, index: IndexName, row: &'a Item) -> Option<Self> {
        let partition = row.get(index.partition_attr())?;
        let sort = match index.sort_attr() {
            Some(attr) => Some(row.get(attr)?),
            None => None,
        };
        let key = ItemKey::from_item(row).ok()?;
        Some(Self {
            table,
            index,
            partition,
            sort,
            key,
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::from(Self::index_prefix(self.table, self.index).as_ref());
        write_index_value(self.partition, &mut buf);
        if let Some(sort) = self.sort {
            write_index_value(sort, &mut buf);
        }
        terminated_bytes::serialize(self.key.record_id.as_bytes(), &mut buf);
        terminated_bytes::serialize(self.key.chunk_type.as_bytes(), &mut buf);
        buf.freeze()
    }

    fn index_prefix(table: &str, index: IndexName) -> Bytes {
        let mut buf = BytesMut::new();
        RecordType::IndexEntry.prefix().write_to(&mut buf);
        terminated_bytes::serialize(table.as_bytes(), &mut buf);
        buf.put_u8(index_id(index));
        buf.freeze()
    }

    /// Entries matching a key condition on `index`.
    pub fn query_range(
        table: &str,
        index: IndexName,
        condition: &KeyCondition,
    ) -> Result<BytesRange> {
        if condition.partition_attr != index.partition_attr() {
            return Err(Error::InvalidInput(format!(
                "{} partition key is {}, got {}",
                index,
                index.partition_attr(),
                condition.partition_attr
            )));
        }
        let mut prefix = BytesMut::from(Self::index_prefix(table, index).as_ref());
        write_index_value(&condition.partition_value, &mut prefix);
        let prefix = prefix.freeze();

        match (&condition.sort, index.sort_attr()) {
            (None, _) => Ok(BytesRange::prefix(prefix)),
            (Some((attr, sort)), Some(sort_attr)) if attr == sort_attr => {
                sort_range(&prefix, sort, |value| {
                    let mut buf = BytesMut::new();
                    write_index_value(value, &mut buf);
                    Ok(buf.freeze())
                })
            }
            (Some((attr, _)), _) => Err(Error::InvalidInput(format!(
                "{} has no sort key {}",
                index, attr
            ))),
        }
    }
}

/// The `record_id` a row key or index entry key points at.
pub fn record_id_of_key(data: &[u8]) -> Result<String> {
    let prefix = KeyPrefix::from_bytes_versioned(data, KEY_VERSION)?;
    match RecordType::from_id(prefix.record_type())? {
        RecordType::Row => Ok(RowKey::deserialize(data)?.key.record_id),
        RecordType::IndexEntry => {
            let mut buf = &data[KeyPrefix::LEN..];
            read_string(&mut buf)?;
            let Some((&id, rest)) = buf.split_first() else {
                return Err(Error::Decode("index key has no index id".to_string()));
            };
            buf = rest;
            let index = IndexName::ALL
                .into_iter()
                .find(|index| index_id(*index) == id)
                .ok_or_else(|| Error::Decode(format!("invalid index id: 0x{:02x}", id)))?;
            skip_index_value(&mut buf)?;
            if index.sort_attr().is_some() {
                skip_index_value(&mut buf)?;
            }
            read_string(&mut buf)
        }
    }
}

fn write_index_value(value: &AttributeValue, buf: &mut BytesMut) {
    match value {
        AttributeValue::S(s) => {
            buf.put_u8(TYPE_S);
            terminated_bytes::serialize(s.as_bytes(), buf);
        }
        AttributeValue::N(n) => {
            buf.put_u8(TYPE_N);
            sortable::write_i64(*n, buf);
        }
        AttributeValue::B(b) => {
            buf.put_u8(TYPE_B);
            terminated_bytes::serialize(b, buf);
        }
        AttributeValue::Bool(b) => {
            buf.put_u8(TYPE_BOOL);
            buf.put_u8(u8::from(*b));
        }
    }
}

fn skip_index_value(buf: &mut &[u8]) -> Result<()> {
    let Some((&kind, rest)) = buf.split_first() else {
        return Err(Error::Decode("index key value is missing".to_string()));
    };
    *buf = rest;
    match kind {
        TYPE_S | TYPE_B => {
            terminated_bytes::deserialize(buf)?;
        }
        TYPE_N => {
            sortable::read_i64(buf)?;
        }
        TYPE_BOOL => {
            let Some((_, rest)) = buf.split_first() else {
                return Err(Error::Decode("index key boolean is missing".to_string()));
            };
            *buf = rest;
        }
        other => {
            return Err(Error::Decode(format!(
                "invalid index value type: 0x{:02x}",
                other
            )));
        }
    }
    Ok(())
}

/// Range of keys under `prefix` whose next encoded component satisfies
/// `condition`. Keys may continue past the component, so bounds that must
/// include every key starting with an encoded value use its lexicographic
/// successor.
fn sort_range(
    prefix: &Bytes,
    condition: &SortCondition,
    encode: impl Fn(&AttributeValue) -> Result<Bytes>,
) -> Result<BytesRange> {
    let at = |value: &AttributeValue| -> Result<Bytes> {
        let mut buf = BytesMut::from(prefix.as_ref());
        buf.extend_from_slice(&encode(value)?);
        Ok(buf.freeze())
    };
    let after = |key: Bytes| match lex_increment(&key) {
        Some(next) => Bound::Excluded(next),
        None => Bound::Unbounded,
    };
    let partition_start = Bound::Included(prefix.clone());
    let partition_end = after(prefix.clone());

    let range = match condition {
        SortCondition::Eq(value) => BytesRange::prefix(at(value)?),
        SortCondition::Lt(value) => BytesRange::new(partition_start, Bound::Excluded(at(value)?)),
        SortCondition::Le(value) => BytesRange::new(partition_start, after(at(value)?)),
        SortCondition::Gt(value) => {
            let start = match lex_increment(&at(value)?) {
                Some(next) => Bound::Included(next),
                None => {
                    let empty = Bound::Excluded(prefix.clone());
                    return Ok(BytesRange::new(empty.clone(), empty));
                }
            };
            BytesRange::new(start, partition_end)
        }
        SortCondition::Ge(value) => BytesRange::new(Bound::Included(at(value)?), partition_end),
        SortCondition::Between(low, high) => {
            BytesRange::new(Bound::Included(at(low)?), after(at(high)?))
        }
        SortCondition::BeginsWith(text) => {
            // strings only; the prefix must stop before the terminator
            let type_head = encode(&AttributeValue::S(String::new()))?;
            let mut head = BytesMut::from(prefix.as_ref());
            head.extend_from_slice(&type_head[..type_head.len() - 1]);
            terminated_bytes::field_prefix_range(&head, text.as_bytes())
        }
    };
    Ok(range)
}

/// Encodes a row or index projection.
pub fn encode_item(item: &Item) -> Result<Bytes> {
    let count = u16::try_from(item.len())
        .map_err(|_| Error::Encode(format!("too many attributes: {}", item.len())))?;
    let mut buf = BytesMut::new();
    buf.put_u8(VALUE_VERSION);
    buf.put_u16(count);
    for (name, value) in item.iter() {
        let name_len = u16::try_from(name.len())
            .map_err(|_| Error::Encode(format!("attribute name too long: {}", name.len())))?;
        buf.put_u16(name_len);
        buf.put_slice(name.as_bytes());
        match value {
            AttributeValue::S(s) => {
                buf.put_u8(TYPE_S);
                put_len_prefixed(s.as_bytes(), &mut buf)?;
            }
            AttributeValue::N(n) => {
                buf.put_u8(TYPE_N);
                buf.put_i64(*n);
            }
            AttributeValue::B(b) => {
                buf.put_u8(TYPE_B);
                put_len_prefixed(b, &mut buf)?;
            }
            AttributeValue::Bool(b) => {
                buf.put_u8(TYPE_BOOL);
                buf.put_u8(u8::from(*b));
            }
        }
    }
    Ok(buf.freeze())
}

/// Decodes a value written by [`encode_item`]. Binary attributes share the
/// input buffer.
pub fn decode_item(data: &Bytes) -> Result<Item> {
    let mut buf = data.clone();
    need(&buf, 3, "item header")?;
    let version = buf.get_u8();
    if version != VALUE_VERSION {
        return Err(Error::Decode(format!(
            "invalid value version: expected 0x{:02x}, got 0x{:02x}",
            VALUE_VERSION, version
        )));
    }
    let count = buf.get_u16();

    let mut item = Item::new();
    for _ in 0..count {
        need(&buf, 2, "attribute name length")?;
        let name_len = buf.get_u16() as usize;
        need(&buf, name_len, "attribute name")?;
        let name = utf8(buf.split_to(name_len))?;

        need(&buf, 1, "attribute type")?;
        let value = match buf.get_u8() {
            TYPE_S => AttributeValue::S(utf8(take_len_prefixed(&mut buf)?)?),
            TYPE_N => {
                need(&buf, 8, "number")?;
                AttributeValue::N(buf.get_i64())
            }
            TYPE_B => AttributeValue::B(take_len_prefixed(&mut buf)?),
            TYPE_BOOL => {
                need(&buf, 1, "boolean")?;
                AttributeValue::Bool(buf.get_u8() != 0)
            }
            other => {
                return Err(Error::Decode(format!(
                    "invalid attribute type: 0x{:02x}",
                    other
                )));
            }
        };
        item.insert(name, value);
    }
    if buf.has_remaining() {
        return Err(Error::Decode(format!(
            "{} trailing bytes after item",
            buf.remaining()
        )));
    }
    Ok(item)
}

fn put_len_prefixed(data: &[u8], buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::Encode(format!("attribute too large: {} bytes", data.len())))?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn take_len_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    need(buf, 4, "length")?;
    let len = buf.get_u32() as usize;
    need(buf, len, "attribute payload")?;
    Ok(buf.split_to(len))
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Decode(format!(
            "buffer too short for {}: need {} bytes, got {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn utf8(bytes: Bytes) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    let raw = terminated_bytes::deserialize(buf)?;
    utf8(raw)
}
