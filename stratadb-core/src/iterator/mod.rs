//! Read-side merging of memtables and sorted tables
//!
//! Every read combines several sorted sources: the active memtable, frozen
//! memtables awaiting flush, and tables of every level. Sources may hold
//! several versions of a key; the newest version visible at the read's
//! snapshot wins and tombstones hide older values.

mod merge;

pub use merge::{LiveIterator, MergeIterator, RecordSource};

use crate::types::{Record, SeqNum};

/// Pick the visible record for a point lookup from per-source candidates.
///
/// Each candidate is the newest record its source holds at `snapshot`; the
/// highest sequence number wins. Returns `None` when no source has the key.
pub fn newest_visible<I>(candidates: I, snapshot: SeqNum) -> Option<Record>
where
    I: IntoIterator<Item = Record>,
{
    candidates
        .into_iter()
        .filter(|r| r.seq <= snapshot)
        .max_by_key(|r| r.seq)
}
