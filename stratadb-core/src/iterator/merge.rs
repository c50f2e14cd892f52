//! K-way merge of sorted record sources

use crate::types::{Key, Record, SeqNum};
use crate::Result;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A sorted stream of records in `(key asc, seq desc)` order
pub type RecordSource = Box<dyn Iterator<Item = Result<Record>> + Send>;

struct HeapEntry {
    record: Record,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the smallest internal key pops
        // first, lower source index breaking ties
        other
            .record
            .internal_key()
            .cmp(&self.record.internal_key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges sorted sources into one `(key asc, seq desc)` stream.
///
/// Every version from every source is yielded; see [`LiveIterator`] for the
/// user-visible view. The first source error ends the stream.
pub struct MergeIterator {
    sources: Vec<RecordSource>,
    heap: BinaryHeap<HeapEntry>,
    primed: bool,
    done: bool,
}

impl MergeIterator {
    /// Create a new MergeIterator from multiple sorted sources
    pub fn new(sources: Vec<RecordSource>) -> Self {
        let capacity = sources.len();
        Self {
            sources,
            heap: BinaryHeap::with_capacity(capacity),
            primed: false,
            done: false,
        }
    }

    /// Pull the next record of `source` into the heap
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                record: next?,
                source,
            });
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        for source in 0..self.sources.len() {
            self.advance(source)?;
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let HeapEntry { record, source } = match self.heap.pop() {
            Some(entry) => entry,
            None => {
                self.done = true;
                return None;
            }
        };
        if let Err(e) = self.advance(source) {
            self.done = true;
            return Some(Err(e));
        }
        Some(Ok(record))
    }
}

/// User-visible view of a merged stream at a snapshot: the newest version of
/// each key with `seq <= snapshot`, with deleted keys suppressed
pub struct LiveIterator {
    inner: MergeIterator,
    snapshot: SeqNum,
    last_key: Option<Key>,
}

impl LiveIterator {
    pub fn new(inner: MergeIterator, snapshot: SeqNum) -> Self {
        Self {
            inner,
            snapshot,
            last_key: None,
        }
    }
}

impl Iterator for LiveIterator {
    type Item = Result<(Key, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.inner.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            if record.seq > self.snapshot || self.last_key == Some(record.key) {
                continue;
            }
            self.last_key = Some(record.key);
            if let Some(value) = record.value {
                return Some(Ok((record.key, value)));
            }
        }
    }
}
