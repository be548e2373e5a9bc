//! Key ranges over the ordered byte key space.

use std::ops::Bound::{self, Excluded, Included, Unbounded};
use std::ops::RangeBounds;

use bytes::{Bytes, BytesMut};

/// Smallest byte string strictly greater than every string starting with
/// `data`, or `None` when `data` is empty or all `0xFF`.
///
/// `[0x61, 0xFF]` becomes `[0x62]`: trailing `0xFF` bytes are dropped before
/// the last remaining byte is incremented.
pub fn lex_increment(data: &[u8]) -> Option<Bytes> {
    let keep = data.iter().rposition(|&b| b != 0xFF)?;
    let mut next = BytesMut::from(&data[..=keep]);
    next[keep] += 1;
    Some(next.freeze())
}

/// A range of storage keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytesRange {
    pub start: Bound<Bytes>,
    pub end: Bound<Bytes>,
}

impl BytesRange {
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Every key starting with `prefix`. An empty prefix selects all keys.
    pub fn prefix(prefix: Bytes) -> Self {
        if prefix.is_empty() {
            return Self::unbounded();
        }
        let end = lex_increment(&prefix).map_or(Unbounded, Excluded);
        Self {
            start: Included(prefix),
            end,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            start: Unbounded,
            end: Unbounded,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Included(s) => key >= s.as_ref(),
            Excluded(s) => key > s.as_ref(),
            Unbounded => true,
        };
        let before_end = match &self.end {
            Included(e) => key <= e.as_ref(),
            Excluded(e) => key < e.as_ref(),
            Unbounded => true,
        };
        after_start && before_end
    }

    /// The part of the range strictly after `key`, for continuing a paged
    /// read from the last key a page evaluated. `None` when `key` lies
    /// outside the range, i.e. it came from another read.
    pub fn resume_after(&self, key: &Bytes) -> Option<Self> {
        if !self.contains(key) {
            return None;
        }
        Some(Self {
            start: Excluded(key.clone()),
            end: self.end.clone(),
        })
    }
}

impl RangeBounds<Bytes> for BytesRange {
    fn start_bound(&self) -> Bound<&Bytes> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&Bytes> {
        self.end.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn should_bound_every_extension_of_prefix(prefix: Vec<u8>, suffix: Vec<u8>) {
            prop_assume!(prefix.iter().any(|&b| b != 0xFF));

            let end = lex_increment(&prefix).unwrap();
            let mut extended = prefix.clone();
            extended.extend(&suffix);

            prop_assert!(end.as_ref() > extended.as_slice());
            prop_assert!(BytesRange::prefix(Bytes::from(prefix)).contains(&extended));
        }
    }

    #[test]
    fn should_drop_trailing_ff_before_incrementing() {
        assert_eq!(lex_increment(b"record").unwrap().as_ref(), b"recore");
        assert_eq!(lex_increment(&[0x01, 0xFF, 0xFF]).unwrap().as_ref(), &[0x02]);
        assert_eq!(lex_increment(&[0xFF, 0xFF]), None);
        assert_eq!(lex_increment(&[]), None);
    }

    #[test]
    fn should_select_one_record_partition() {
        // given
        let range = BytesRange::prefix(Bytes::from_static(b"notes\x00r1\x00"));

        // then
        assert!(range.contains(b"notes\x00r1\x00primary\x00"));
        assert!(range.contains(b"notes\x00r1\x00body_1\x00"));
        assert!(!range.contains(b"notes\x00r10\x00primary\x00"));
        assert!(!range.contains(b"notes\x00r2\x00primary\x00"));
    }

    #[test]
    fn should_leave_end_open_for_all_ff_prefix() {
        let range = BytesRange::prefix(Bytes::from_static(&[0xFF, 0xFF]));

        assert_eq!(range.end, Unbounded);
        assert!(range.contains(&[0xFF, 0xFF, 0xFF]));
        assert!(!range.contains(&[0xFF]));
    }

    #[test]
    fn should_resume_strictly_after_last_evaluated_key() {
        // given
        let range = BytesRange::prefix(Bytes::from("t\x00"));

        // when
        let resumed = range.resume_after(&Bytes::from("t\x00b")).unwrap();

        // then
        assert!(!resumed.contains(b"t\x00b"));
        assert!(resumed.contains(b"t\x00c"));
        assert!(!resumed.contains(b"u"));
    }

    #[test]
    fn should_refuse_to_resume_from_foreign_key() {
        let range = BytesRange::prefix(Bytes::from("t\x00"));

        assert_eq!(range.resume_after(&Bytes::from("other")), None);
    }

    #[test]
    fn should_treat_empty_prefix_as_unbounded() {
        assert_eq!(BytesRange::prefix(Bytes::new()), BytesRange::unbounded());
    }
}
