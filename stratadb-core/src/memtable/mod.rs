//! MemTable implementation using skip list
//!
//! The MemTable is an in-memory data structure that stores recent writes
//! in sorted order, allowing for fast writes and efficient range scans.
//! Entries are keyed by `(key, seq)` and never modified in place: a newer
//! write for the same key is a new entry with a higher sequence number.

use crate::types::{InternalKey, Key, KeyRange, Record, RecordKind, SeqNum};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-entry bookkeeping overhead counted towards the flush threshold
const ENTRY_OVERHEAD: usize = 32;

/// MemTable for in-memory writes
pub struct MemTable {
    /// `None` marks a tombstone
    data: SkipMap<InternalKey, Option<Bytes>>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Highest sequence number inserted
    max_seq: AtomicU64,
    /// Unique ID for this memtable
    id: u64,
    /// First WAL segment holding this memtable's entries
    wal_segment: u64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64, wal_segment: u64) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            id,
            wal_segment,
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// WAL segment this memtable started in
    pub fn wal_segment(&self) -> u64 {
        self.wal_segment
    }

    /// Insert a value
    pub fn put(&self, key: Key, value: Bytes, seq: SeqNum) {
        let size = ENTRY_OVERHEAD + value.len();
        self.data.insert(InternalKey::new(key, seq), Some(value));
        self.account(size, seq);
    }

    /// Insert a tombstone
    pub fn delete(&self, key: Key, seq: SeqNum) {
        self.data.insert(InternalKey::new(key, seq), None);
        self.account(ENTRY_OVERHEAD, seq);
    }

    /// Insert a record of either kind
    pub fn apply(&self, record: Record) {
        match record.kind {
            RecordKind::Put => self.put(record.key, record.value.unwrap_or_default(), record.seq),
            RecordKind::Tombstone => self.delete(record.key, record.seq),
        }
    }

    fn account(&self, size: usize, seq: SeqNum) {
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
    }

    /// Newest record for `key` with `seq <= snapshot`, tombstones included
    pub fn get(&self, key: Key, snapshot: SeqNum) -> Option<Record> {
        // (key, snapshot) sorts before every older version of key
        let start = InternalKey::new(key, snapshot);
        let end = InternalKey::new(key, 0);
        self.data
            .range(start..=end)
            .next()
            .map(|entry| to_record(entry.key(), entry.value()))
    }

    /// All records in `range`, ordered by key ascending then seq descending
    pub fn iter(&self, range: &KeyRange) -> Vec<Record> {
        if range.is_empty() {
            return Vec::new();
        }
        let start = match range.lower_key() {
            Some(k) => Bound::Included(InternalKey::new(k, SeqNum::MAX)),
            None => return Vec::new(),
        };
        let end = match range.upper_key() {
            Some(k) => Bound::Included(InternalKey::new(k, 0)),
            None => return Vec::new(),
        };
        self.data
            .range((start, end))
            .map(|entry| to_record(entry.key(), entry.value()))
            .collect()
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= size_limit
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Highest sequence number held
    pub fn max_seq(&self) -> SeqNum {
        self.max_seq.load(Ordering::Relaxed)
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn to_record(key: &InternalKey, value: &Option<Bytes>) -> Record {
    match value {
        Some(v) => Record::put(key.key, key.seq, v.clone()),
        None => Record::tombstone(key.key, key.seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memtable_versions() {
        let memtable = MemTable::new(1, 1);
        memtable.put(5, Bytes::from_static(b"v1"), 1);
        memtable.put(5, Bytes::from_static(b"v2"), 3);
        memtable.delete(5, 4);

        assert!(memtable.get(5, 10).unwrap().is_tombstone());
        assert_eq!(memtable.get(5, 3).unwrap().value.unwrap(), "v2");
        assert_eq!(memtable.get(5, 2).unwrap().value.unwrap(), "v1");
        assert!(memtable.get(5, 0).is_none());
        assert!(memtable.get(6, 10).is_none());
        assert_eq!(memtable.len(), 3);
        assert_eq!(memtable.max_seq(), 4);
    }

    #[test]
    fn test_memtable_range_order() {
        let memtable = MemTable::new(1, 1);
        for (i, key) in [30, 10, 20, 10].iter().enumerate() {
            memtable.put(*key, Bytes::from(format!("v{}", i)), i as u64 + 1);
        }

        let records = memtable.iter(&KeyRange::inclusive(10, 20));
        let order: Vec<(Key, SeqNum)> = records.iter().map(|r| (r.key, r.seq)).collect();
        assert_eq!(order, vec![(10, 4), (10, 2), (20, 3)]);

        assert_eq!(memtable.iter(&KeyRange::full()).len(), 4);
        assert!(memtable.iter(&KeyRange::from_bounds(11..20)).is_empty());
    }

    #[test]
    fn test_extreme_keys() {
        let memtable = MemTable::new(1, 1);
        memtable.put(i64::MIN, Bytes::from_static(b"min"), 1);
        memtable.put(i64::MAX, Bytes::from_static(b"max"), 2);

        assert_eq!(memtable.iter(&KeyRange::full()).len(), 2);
        assert_eq!(memtable.get(i64::MAX, u64::MAX).unwrap().value.unwrap(), "max");
    }

    #[test]
    fn test_should_flush() {
        let memtable = MemTable::new(1, 1);
        assert!(!memtable.should_flush(100));
        memtable.put(1, Bytes::from(vec![0u8; 100]), 1);
        assert!(memtable.should_flush(100));
    }
}
