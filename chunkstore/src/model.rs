//! Item model shared by the store adapter, the record builder and the table.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Partition key attribute of every row.
pub const RECORD_ID: &str = "record_id";
/// Sort key attribute of every row.
pub const CHUNK_TYPE: &str = "chunk_type";
pub const SOURCE_UNIQUE: &str = "source_unique";
pub const DATA_TYPE: &str = "data_type";
pub const DATA_STATUS: &str = "data_status";
pub const CREATED_TS: &str = "created_ts";
pub const UPDATED_TS: &str = "updated_ts";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";
pub const SOURCE: &str = "source";
pub const BUCKET_KEY: &str = "bucket_key";
/// Encoded payload (or payload slice) of a row.
pub const DATA: &str = "data";

/// A single attribute value of a stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    S(String),
    N(i64),
    B(Bytes),
    Bool(bool),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            AttributeValue::B(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Orders two values of the same kind. Values of different kinds, and
    /// booleans, are not ordered.
    pub fn compare(&self, other: &AttributeValue) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::S(a), AttributeValue::S(b)) => Some(a.cmp(b)),
            (AttributeValue::N(a), AttributeValue::N(b)) => Some(a.cmp(b)),
            (AttributeValue::B(a), AttributeValue::B(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn begins_with(&self, prefix: &str) -> bool {
        match self {
            AttributeValue::S(s) => s.starts_with(prefix),
            AttributeValue::B(b) => b.starts_with(prefix.as_bytes()),
            _ => false,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::S(s) => write!(f, "{:?}", s),
            AttributeValue::N(n) => write!(f, "{}", n),
            AttributeValue::B(b) => write!(f, "<{} bytes>", b.len()),
            AttributeValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::S(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::S(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::N(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::N(value.into())
    }
}

impl From<Bytes> for AttributeValue {
    fn from(value: Bytes) -> Self {
        AttributeValue::B(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// A stored row: attribute name to value, ordered by name. Unset attributes
/// are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    attrs: BTreeMap<String, AttributeValue>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.attrs.insert(name.into(), value.into())
    }

    /// Inserts `value` if present, otherwise leaves the attribute unset.
    pub fn insert_opt<V: Into<AttributeValue>>(&mut self, name: &str, value: Option<V>) {
        if let Some(value) = value {
            self.insert(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attrs.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attrs.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_str)
    }

    pub fn get_n(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttributeValue::as_n)
    }

    pub fn get_bytes(&self, name: &str) -> Option<&Bytes> {
        self.get(name).and_then(AttributeValue::as_bytes)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attrs.iter()
    }

    /// Copies only the named attributes.
    pub fn project(&self, names: &[&str]) -> Item {
        names
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }
}

impl FromIterator<(String, AttributeValue)> for Item {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        Self {
            attrs: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Item {
    type Item = (String, AttributeValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.attrs.into_iter()
    }
}

/// Primary key of a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub record_id: String,
    pub chunk_type: String,
}

impl ItemKey {
    pub fn new(record_id: impl Into<String>, chunk_type: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            chunk_type: chunk_type.into(),
        }
    }

    /// Reads the key attributes of a row.
    pub fn from_item(item: &Item) -> Result<Self> {
        let record_id = item
            .get_str(RECORD_ID)
            .ok_or_else(|| Error::InvalidInput(format!("item has no string {}", RECORD_ID)))?;
        let chunk_type = item
            .get_str(CHUNK_TYPE)
            .ok_or_else(|| Error::InvalidInput(format!("item has no string {}", CHUNK_TYPE)))?;
        Ok(Self::new(record_id, chunk_type))
    }

    pub fn to_item(&self) -> Item {
        Item::new()
            .with(RECORD_ID, self.record_id.as_str())
            .with(CHUNK_TYPE, self.chunk_type.as_str())
    }
}

/// Secondary indexes maintained on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    /// Partition `source_unique`, no sort key.
    SourceUnique,
    /// Partition `data_type`, sort `updated_ts`.
    DataTypeUpdatedTs,
}

impl IndexName {
    pub const ALL: [IndexName; 2] = [IndexName::SourceUnique, IndexName::DataTypeUpdatedTs];

    pub fn name(&self) -> &'static str {
        match self {
            IndexName::SourceUnique => "source_unique_index",
            IndexName::DataTypeUpdatedTs => "data_type_updated_ts_index",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        IndexName::ALL
            .into_iter()
            .find(|index| index.name() == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown index '{}'", name)))
    }

    pub fn partition_attr(&self) -> &'static str {
        match self {
            IndexName::SourceUnique => SOURCE_UNIQUE,
            IndexName::DataTypeUpdatedTs => DATA_TYPE,
        }
    }

    pub fn sort_attr(&self) -> Option<&'static str> {
        match self {
            IndexName::SourceUnique => None,
            IndexName::DataTypeUpdatedTs => Some(UPDATED_TS),
        }
    }

    /// Attributes returned by a query on this index.
    pub fn projection(&self) -> &'static [&'static str] {
        &[RECORD_ID, CHUNK_TYPE, SOURCE_UNIQUE, DATA_TYPE, UPDATED_TS]
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Filter expression evaluated against each row a query or scan reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, AttributeValue),
    Ne(String, AttributeValue),
    Lt(String, AttributeValue),
    Le(String, AttributeValue),
    Gt(String, AttributeValue),
    Ge(String, AttributeValue),
    Between(String, AttributeValue, AttributeValue),
    BeginsWith(String, String),
    Exists(String),
    NotExists(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Comparisons against a missing attribute are false, except `Ne`.
    pub fn matches(&self, item: &Item) -> bool {
        let cmp = |name: &str, value: &AttributeValue| {
            item.get(name).and_then(|actual| actual.compare(value))
        };
        match self {
            Filter::Eq(name, value) => item.get(name) == Some(value),
            Filter::Ne(name, value) => item.get(name) != Some(value),
            Filter::Lt(name, value) => cmp(name, value) == Some(Ordering::Less),
            Filter::Le(name, value) => {
                matches!(cmp(name, value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::Gt(name, value) => cmp(name, value) == Some(Ordering::Greater),
            Filter::Ge(name, value) => {
                matches!(cmp(name, value), Some(Ordering::Greater | Ordering::Equal))
            }
            Filter::Between(name, low, high) => {
                matches!(cmp(name, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp(name, high), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::BeginsWith(name, prefix) => {
                item.get(name).is_some_and(|v| v.begins_with(prefix))
            }
            Filter::Exists(name) => item.contains(name),
            Filter::NotExists(name) => !item.contains(name),
            Filter::And(a, b) => a.matches(item) && b.matches(item),
            Filter::Or(a, b) => a.matches(item) || b.matches(item),
            Filter::Not(inner) => !inner.matches(item),
        }
    }
}

/// Entry point for building [`Filter`]s: `Attr::new("chunk_type").begins_with("title")`.
#[derive(Debug, Clone)]
pub struct Attr(String);

impl Attr {
    pub fn new(name: impl Into<String>) -> Self {
        Attr(name.into())
    }

    pub fn eq(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Eq(self.0, value.into())
    }

    pub fn ne(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Ne(self.0, value.into())
    }

    pub fn lt(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Lt(self.0, value.into())
    }

    pub fn le(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Le(self.0, value.into())
    }

    pub fn gt(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Gt(self.0, value.into())
    }

    pub fn ge(self, value: impl Into<AttributeValue>) -> Filter {
        Filter::Ge(self.0, value.into())
    }

    pub fn between(
        self,
        low: impl Into<AttributeValue>,
        high: impl Into<AttributeValue>,
    ) -> Filter {
        Filter::Between(self.0, low.into(), high.into())
    }

    pub fn begins_with(self, prefix: impl Into<String>) -> Filter {
        Filter::BeginsWith(self.0, prefix.into())
    }

    pub fn exists(self) -> Filter {
        Filter::Exists(self.0)
    }

    pub fn not_exists(self) -> Filter {
        Filter::NotExists(self.0)
    }
}

/// Condition on the sort key of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SortCondition {
    Eq(AttributeValue),
    Lt(AttributeValue),
    Le(AttributeValue),
    Gt(AttributeValue),
    Ge(AttributeValue),
    Between(AttributeValue, AttributeValue),
    BeginsWith(String),
}

impl SortCondition {
    pub fn matches(&self, value: &AttributeValue) -> bool {
        let ord = |other: &AttributeValue| value.compare(other);
        match self {
            SortCondition::Eq(v) => value == v,
            SortCondition::Lt(v) => ord(v) == Some(Ordering::Less),
            SortCondition::Le(v) => matches!(ord(v), Some(Ordering::Less | Ordering::Equal)),
            SortCondition::Gt(v) => ord(v) == Some(Ordering::Greater),
            SortCondition::Ge(v) => matches!(ord(v), Some(Ordering::Greater | Ordering::Equal)),
            SortCondition::Between(low, high) => {
                matches!(ord(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(ord(high), Some(Ordering::Less | Ordering::Equal))
            }
            SortCondition::BeginsWith(prefix) => value.begins_with(prefix),
        }
    }
}

/// Key condition of a query: partition equality plus an optional sort key
/// condition.
///
/// ```ignore
/// let condition = KeyCondition::eq("data_type", "article")
///     .with_sort("updated_ts", SortCondition::Gt(AttributeValue::N(since)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    pub partition_attr: String,
    pub partition_value: AttributeValue,
    pub sort: Option<(String, SortCondition)>,
}

impl KeyCondition {
    pub fn eq(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            partition_attr: name.into(),
            partition_value: value.into(),
            sort: None,
        }
    }

    pub fn with_sort(mut self, name: impl Into<String>, condition: SortCondition) -> Self {
        self.sort = Some((name.into(), condition));
        self
    }
}

/// Opaque resume position of a scan or query: the storage key of the last
/// row the previous page evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken(Bytes);

impl ContinuationToken {
    pub(crate) fn new(last_key: Bytes) -> Self {
        Self(last_key)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// One page of a scan or query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Rows that passed the filter.
    pub items: Vec<Item>,
    /// Present when rows remain after this page.
    pub next_token: Option<ContinuationToken>,
    /// Rows evaluated, before filtering.
    pub scanned_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub filter: Option<Filter>,
    /// Rows evaluated per page.
    pub page_size: usize,
    pub token: Option<ContinuationToken>,
}

impl ScanRequest {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_token(mut self, token: Option<ContinuationToken>) -> Self {
        self.token = token;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// `None` queries the base table by `record_id` / `chunk_type`.
    pub index: Option<IndexName>,
    pub condition: KeyCondition,
    pub filter: Option<Filter>,
    /// Rows evaluated per page.
    pub page_size: usize,
    pub token: Option<ContinuationToken>,
}

impl QueryRequest {
    pub fn new(condition: KeyCondition, page_size: usize) -> Self {
        Self {
            index: None,
            condition,
            filter: None,
            page_size,
            token: None,
        }
    }

    pub fn on_index(mut self, index: IndexName) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_token(mut self, token: Option<ContinuationToken>) -> Self {
        self.token = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Item {
        Item::new()
            .with(RECORD_ID, "r1")
            .with(CHUNK_TYPE, "title_2")
            .with(UPDATED_TS, 100)
            .with(DATA_TYPE, "article")
    }

    #[test]
    fn should_evaluate_comparison_filters() {
        let item = row();

        assert!(Attr::new(UPDATED_TS).gt(99).matches(&item));
        assert!(Attr::new(UPDATED_TS).le(100).matches(&item));
        assert!(!Attr::new(UPDATED_TS).lt(100).matches(&item));
        assert!(Attr::new(UPDATED_TS).between(50, 100).matches(&item));
        assert!(Attr::new(CHUNK_TYPE).begins_with("title").matches(&item));
        assert!(!Attr::new(CHUNK_TYPE).begins_with("body").matches(&item));
    }

    #[test]
    fn should_treat_missing_attribute_as_non_matching_except_ne() {
        let item = row();

        assert!(!Attr::new(SOURCE_UNIQUE).eq("x").matches(&item));
        assert!(!Attr::new(SOURCE_UNIQUE).gt("a").matches(&item));
        assert!(Attr::new(SOURCE_UNIQUE).ne("x").matches(&item));
        assert!(Attr::new(SOURCE_UNIQUE).not_exists().matches(&item));
    }

    #[test]
    fn should_not_order_values_of_different_kinds() {
        let item = row();

        assert!(!Attr::new(UPDATED_TS).gt("0").matches(&item));
        assert_eq!(AttributeValue::N(1).compare(&AttributeValue::from("1")), None);
    }

    #[test]
    fn should_combine_filters() {
        // given
        let item = row();
        let filter = Attr::new(DATA_TYPE)
            .eq("article")
            .and(Attr::new(CHUNK_TYPE).eq("primary").or(Attr::new(UPDATED_TS).ge(100)));

        // when / then
        assert!(filter.matches(&item));
        assert!(!filter.clone().not().matches(&item));
    }

    #[test]
    fn should_match_sort_conditions() {
        let value = AttributeValue::from("title_2");

        assert!(SortCondition::BeginsWith("title".into()).matches(&value));
        assert!(SortCondition::Eq("title_2".into()).matches(&value));
        assert!(SortCondition::Between("a".into(), "u".into()).matches(&value));
        assert!(!SortCondition::Gt("title_2".into()).matches(&value));
    }

    #[test]
    fn should_read_item_key_from_row() {
        let key = ItemKey::from_item(&row()).unwrap();

        assert_eq!(key, ItemKey::new("r1", "title_2"));
        assert_eq!(ItemKey::from_item(&key.to_item()).unwrap(), key);
    }

    #[test]
    fn should_fail_item_key_without_chunk_type() {
        let item = Item::new().with(RECORD_ID, "r1");

        assert!(matches!(
            ItemKey::from_item(&item),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn should_resolve_index_names() {
        for index in IndexName::ALL {
            assert_eq!(IndexName::from_name(index.name()).unwrap(), index);
        }
        assert!(IndexName::from_name("missing_index").is_err());
    }

    #[test]
    fn should_project_only_named_attributes() {
        let projected = row().project(&[RECORD_ID, SOURCE_UNIQUE]);

        assert_eq!(projected, Item::new().with(RECORD_ID, "r1"));
    }
}
