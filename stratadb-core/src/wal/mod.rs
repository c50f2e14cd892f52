//! Write-Ahead Log (WAL) implementation
//!
//! The WAL provides durability by writing all changes to disk before
//! committing them to memory. In case of crashes, the WAL can be
//! replayed to recover the database state.
//!
//! The log is split into numbered segments. A segment is sealed (flushed and
//! fsynced) whenever the active memtable is frozen, so every memtable maps to
//! a contiguous run of segments and captured segments can be deleted once
//! their memtable has been flushed to a sorted table.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType};
pub use reader::{WalReader, WalReplay};
pub use writer::WalWriter;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Only sync when `sync()` is called or a segment is sealed
    #[default]
    Manual,
}

/// WAL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalConfig {
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

/// Position of an appended entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalPosition {
    pub segment: u64,
    pub offset: u64,
}

pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", segment_id))
}

pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// List segment ids in a WAL directory, ascending
pub(crate) fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        if let Some(id) = parse_segment_id(&entry?.path()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
