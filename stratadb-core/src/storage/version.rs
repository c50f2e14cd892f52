//! Immutable views of the memtables and table levels, plus the snapshot list

use crate::iterator::{newest_visible, RecordSource};
use crate::manifest::TableEntry;
use crate::memtable::MemTable;
use crate::sstable::SSTableReader;
use crate::types::{Key, KeyRange, Record, SeqNum};
use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One consistent view of everything a read may consult.
///
/// Versions are never mutated; a structural change (freeze, flush,
/// compaction) publishes a new `Arc<Version>`. A reader holding an old
/// version keeps its memtables and tables alive until it drops it.
#[derive(Clone)]
pub(crate) struct Version {
    /// Active memtable
    pub mem: Arc<MemTable>,
    /// Frozen memtables awaiting flush, newest first
    pub imm: Vec<Arc<MemTable>>,
    /// L0 newest first; deeper levels sorted by `min_key`
    pub levels: Vec<Vec<Arc<SSTableReader>>>,
}

impl Version {
    pub fn new(mem: Arc<MemTable>, levels: Vec<Vec<Arc<SSTableReader>>>) -> Self {
        Self {
            mem,
            imm: Vec::new(),
            levels,
        }
    }

    /// Newest record for `key` visible at `snapshot`, tombstones included.
    ///
    /// Sources are probed newest layer first and the first layer holding a
    /// visible version answers: for any key, every version in a newer layer
    /// has a higher sequence number than every version below it.
    pub fn get(&self, key: Key, snapshot: SeqNum) -> Result<Option<Record>> {
        for mem in std::iter::once(&self.mem).chain(self.imm.iter()) {
            if let Some(record) = mem.get(key, snapshot) {
                return Ok(Some(record));
            }
        }

        // L0 tables may overlap each other
        let mut candidates = Vec::new();
        for table in &self.levels[0] {
            if let Some(record) = table.get(key, snapshot)? {
                candidates.push(record);
            }
        }
        if let Some(record) = newest_visible(candidates, snapshot) {
            return Ok(Some(record));
        }

        for level in self.levels.iter().skip(1) {
            // at most one table per level can hold the key
            let idx = level.partition_point(|t| t.meta().max_key < key);
            if let Some(table) = level.get(idx) {
                if let Some(record) = table.get(key, snapshot)? {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Sorted sources covering `range`, newest first
    pub fn sources(&self, range: KeyRange) -> Vec<RecordSource> {
        let mut sources: Vec<RecordSource> = Vec::new();
        if range.is_empty() {
            return sources;
        }

        for mem in std::iter::once(&self.mem).chain(self.imm.iter()) {
            let records = mem.iter(&range);
            if !records.is_empty() {
                sources.push(Box::new(records.into_iter().map(Ok)));
            }
        }
        for table in self.levels.iter().flatten() {
            if table.meta().overlaps(&range) {
                sources.push(Box::new(table.iter(range)));
            }
        }
        sources
    }

    /// Manifest entries for the live tables
    pub fn table_entries(&self) -> Vec<TableEntry> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| {
                tables
                    .iter()
                    .map(move |t| TableEntry::from_meta(t.meta(), level))
            })
            .collect()
    }

    /// Oldest WAL segment still holding unflushed writes
    pub fn wal_checkpoint(&self) -> u64 {
        std::iter::once(&self.mem)
            .chain(self.imm.iter())
            .map(|m| m.wal_segment())
            .min()
            .unwrap_or(0)
    }
}

/// Sequence numbers pinned by live [`crate::Snapshot`]s
#[derive(Default)]
pub(crate) struct SnapshotList {
    pinned: Mutex<BTreeMap<SeqNum, usize>>,
}

impl SnapshotList {
    /// Pin the sequence returned by `current`.
    ///
    /// `current` runs under the list lock so a concurrent
    /// [`oldest`](Self::oldest) never misses a snapshot being taken.
    pub fn acquire(&self, current: impl FnOnce() -> SeqNum) -> SeqNum {
        let mut pinned = self.pinned.lock();
        let seq = current();
        *pinned.entry(seq).or_insert(0) += 1;
        seq
    }

    pub fn release(&self, seq: SeqNum) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&seq);
            }
        }
    }

    /// Oldest pinned sequence, or `current()` when nothing is pinned
    pub fn oldest(&self, current: impl FnOnce() -> SeqNum) -> SeqNum {
        let pinned = self.pinned.lock();
        pinned.keys().next().copied().unwrap_or_else(current)
    }

    pub fn len(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}
