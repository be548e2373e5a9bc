//! Chunk naming.
//!
//! Every row of a record is identified by its `chunk_type`:
//!
//! ```text
//! primary            non-fat attributes of the record
//! <field>_<ordinal>  one slice of a fat field's encoded payload, ordinal >= 1
//! <field>            a fat field stored whole, without slicing
//! ```
//!
//! Ordinals are written without padding, so rows must be ordered with
//! [`ChunkType`]'s `Ord` (numeric on the ordinal) rather than by name.

use std::cmp::Ordering;
use std::fmt;

/// Chunk type of the row that holds a record's non-fat attributes.
pub const PRIMARY_CHUNK: &str = "primary";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Primary,
    /// A field payload stored in one row.
    Whole(String),
    /// Slice `ordinal` (starting at 1) of a field payload.
    Slice { field: String, ordinal: u32 },
}

impl ChunkType {
    pub fn slice(field: impl Into<String>, ordinal: u32) -> Self {
        ChunkType::Slice {
            field: field.into(),
            ordinal,
        }
    }

    /// Parses a stored chunk type. Never fails: names that are neither
    /// `primary` nor `<field>_<digits>` are whole-field chunks.
    pub fn parse(name: &str) -> Self {
        if name == PRIMARY_CHUNK {
            return ChunkType::Primary;
        }
        if let Some(pos) = name.rfind('_') {
            let (field, digits) = (&name[..pos], &name[pos + 1..]);
            if !field.is_empty() && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
            {
                if let Ok(ordinal) = digits.parse::<u32>() {
                    return ChunkType::slice(field, ordinal);
                }
            }
        }
        ChunkType::Whole(name.to_string())
    }

    /// Field this chunk belongs to, `None` for the primary chunk.
    pub fn field(&self) -> Option<&str> {
        match self {
            ChunkType::Primary => None,
            ChunkType::Whole(field) | ChunkType::Slice { field, .. } => Some(field),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ChunkType::Primary)
    }

    fn rank(&self) -> u8 {
        match self {
            ChunkType::Primary => 0,
            ChunkType::Whole(_) => 1,
            ChunkType::Slice { .. } => 2,
        }
    }
}

impl Ord for ChunkType {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChunkType::Whole(a), ChunkType::Whole(b)) => a.cmp(b),
            (
                ChunkType::Slice {
                    field: fa,
                    ordinal: oa,
                },
                ChunkType::Slice {
                    field: fb,
                    ordinal: ob,
                },
            ) => fa.cmp(fb).then(oa.cmp(ob)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for ChunkType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkType::Primary => f.write_str(PRIMARY_CHUNK),
            ChunkType::Whole(field) => f.write_str(field),
            ChunkType::Slice { field, ordinal } => write!(f, "{}_{}", field, ordinal),
        }
    }
}

/// Chunk type names for `count` slices of `field`: `field_1 ..= field_count`.
pub fn slice_names(field: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|ordinal| format!("{}_{}", field, ordinal))
        .collect()
}

/// Whether `name` could be mistaken for a slice chunk type if used as a field
/// name.
pub fn looks_like_slice(name: &str) -> bool {
    matches!(ChunkType::parse(name), ChunkType::Slice { .. })
}
