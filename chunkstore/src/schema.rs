//! Static table schemas, validated once per record type.

use std::collections::HashSet;

use crate::chunk::{PRIMARY_CHUNK, looks_like_slice};
use crate::error::{Error, Result};
use crate::model::RECORD_ID;
use crate::record::{TableRecord, payload_fields};

/// Field layout of a [`TableRecord`] type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    data_type: &'static str,
    fields: &'static [&'static str],
    fat_fields: &'static [&'static str],
}

impl TableSchema {
    /// Reads and validates the schema of `T`.
    ///
    /// Fails with [`Error::Schema`] when the field list is empty or has
    /// duplicates, when a fat field is not a listed field or could be taken
    /// for a chunk name, or when the default payload lacks a listed field.
    pub fn of<T: TableRecord>() -> Result<Self> {
        let schema = Self {
            data_type: T::DATA_TYPE,
            fields: T::field_names(),
            fat_fields: T::fat_field_names(),
        };
        schema.validate()?;

        let defaults = payload_fields(&T::default()).map_err(|e| Error::Schema(e.to_string()))?;
        if let Some(missing) = schema.fields.iter().find(|f| !defaults.contains_key(**f)) {
            return Err(Error::Schema(format!(
                "{}: field {} is not part of the serialized payload",
                schema.data_type, missing
            )));
        }
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Schema(format!("{}: {}", self.data_type, msg)));
        if self.data_type.is_empty() {
            return Err(Error::Schema("data type must not be empty".to_string()));
        }
        if self.fields.is_empty() {
            return fail("no fields declared".to_string());
        }
        let mut seen = HashSet::new();
        for field in self.fields {
            if !seen.insert(*field) {
                return fail(format!("duplicate field {}", field));
            }
        }
        for fat in self.fat_fields {
            if !seen.contains(fat) {
                return fail(format!("fat field {} is not a declared field", fat));
            }
            if *fat == PRIMARY_CHUNK {
                return fail(format!("fat field may not be named {}", PRIMARY_CHUNK));
            }
            if looks_like_slice(fat) {
                return fail(format!("fat field {} ends like a slice ordinal", fat));
            }
        }
        Ok(())
    }

    pub fn data_type(&self) -> &'static str {
        self.data_type
    }

    pub fn fields(&self) -> &'static [&'static str] {
        self.fields
    }

    pub fn fat_fields(&self) -> &'static [&'static str] {
        self.fat_fields
    }

    /// Attribute that identifies a record across its rows.
    pub fn record_id_attr(&self) -> &'static str {
        RECORD_ID
    }

    pub fn is_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| *f == name)
    }

    pub fn is_fat(&self, name: &str) -> bool {
        self.fat_fields.iter().any(|f| *f == name)
    }

    /// Fields stored together in the `primary` row.
    pub fn slim_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().copied().filter(|f| !self.is_fat(f))
    }
}
