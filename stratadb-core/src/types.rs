//! Core types for StrataDB

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Bound, RangeBounds};

/// User key: a fixed-width signed integer
pub type Key = i64;

/// Global mutation order
pub type SeqNum = u64;

/// Kind of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    /// Key holds a value
    Put = 1,
    /// Key was deleted as of this sequence number
    Tombstone = 2,
}

impl RecordKind {
    /// Decode from the on-disk tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Put),
            2 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }
}

/// A single versioned mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub seq: SeqNum,
    pub kind: RecordKind,
    /// Always `None` for tombstones
    pub value: Option<Bytes>,
}

impl Record {
    /// Create a put record
    pub fn put(key: Key, seq: SeqNum, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            seq,
            kind: RecordKind::Put,
            value: Some(value.into()),
        }
    }

    /// Create a tombstone record
    pub fn tombstone(key: Key, seq: SeqNum) -> Self {
        Self {
            key,
            seq,
            kind: RecordKind::Tombstone,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Tombstone
    }

    /// Approximate in-memory footprint
    pub fn size(&self) -> usize {
        8 + 8 + 1 + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Ordering key of this record
    pub fn internal_key(&self) -> InternalKey {
        InternalKey::new(self.key, self.seq)
    }
}

/// Ordering key for versioned records: key ascending, sequence descending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub key: Key,
    pub seq: SeqNum,
}

impl InternalKey {
    pub fn new(key: Key, seq: SeqNum) -> Self {
        Self { key, seq }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key range for scans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Key>,
    pub end: Bound<Key>,
}

impl KeyRange {
    /// Range over every key
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Inclusive range `[start, end]`
    pub fn inclusive(start: Key, end: Key) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// Build from any standard range expression
    pub fn from_bounds<R: RangeBounds<Key>>(range: R) -> Self {
        Self {
            start: range.start_bound().cloned(),
            end: range.end_bound().cloned(),
        }
    }

    /// Check if a key is within the range
    pub fn contains(&self, key: Key) -> bool {
        let after_start = match self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let before_end = match self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// True if `key` lies beyond the end of the range
    pub fn is_past_end(&self, key: Key) -> bool {
        match self.end {
            Bound::Included(e) => key > e,
            Bound::Excluded(e) => key >= e,
            Bound::Unbounded => false,
        }
    }

    /// Smallest key that can be in the range, if any
    pub fn lower_key(&self) -> Option<Key> {
        match self.start {
            Bound::Included(s) => Some(s),
            Bound::Excluded(s) => s.checked_add(1),
            Bound::Unbounded => Some(Key::MIN),
        }
    }

    /// Largest key that can be in the range, if any
    pub fn upper_key(&self) -> Option<Key> {
        match self.end {
            Bound::Included(e) => Some(e),
            Bound::Excluded(e) => e.checked_sub(1),
            Bound::Unbounded => Some(Key::MAX),
        }
    }

    /// True if no key can satisfy the range
    pub fn is_empty(&self) -> bool {
        match (self.lower_key(), self.upper_key()) {
            (Some(lo), Some(hi)) => lo > hi,
            _ => true,
        }
    }

    /// Check if the range overlaps `[min, max]`
    pub fn overlaps(&self, min: Key, max: Key) -> bool {
        match (self.lower_key(), self.upper_key()) {
            (Some(lo), Some(hi)) => lo <= max && hi >= min,
            _ => false,
        }
    }

    /// Intersection of two ranges
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        match (self.lower_key(), self.upper_key(), other.lower_key(), other.upper_key()) {
            (Some(a), Some(b), Some(c), Some(d)) => KeyRange::inclusive(a.max(c), b.min(d)),
            // one side is empty; produce an empty range
            _ => KeyRange {
                start: Bound::Excluded(Key::MAX),
                end: Bound::Unbounded,
            },
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::full()
    }
}

impl RangeBounds<Key> for KeyRange {
    fn start_bound(&self) -> Bound<&Key> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&Key> {
        self.end.as_ref()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Bound::Included(s) => write!(f, "[{}", s)?,
            Bound::Excluded(s) => write!(f, "({}", s)?,
            Bound::Unbounded => write!(f, "(-inf")?,
        }
        match self.end {
            Bound::Included(e) => write!(f, ", {}]", e),
            Bound::Excluded(e) => write!(f, ", {})", e),
            Bound::Unbounded => write!(f, ", +inf)"),
        }
    }
}
