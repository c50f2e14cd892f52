//! StrataDB Core - Embedded Ordered Key-Value Storage Engine
//!
//! A Rust-based log-structured merge store optimized for:
//! - Durable, acknowledged writes under crash
//! - Fast point lookups and ordered range scans over integer keys
//! - Predicate-filtered scans over structured values
//!
//! # Architecture
//!
//! StrataDB uses an LSM-tree based storage engine with the following components:
//!
//! - **WAL (Write-Ahead Log)**: Durability guarantee through sequential writes
//! - **MemTable**: In-memory skip-list for fast writes
//! - **SSTable**: Immutable sorted files on disk with block compression
//! - **Block Cache**: Shared LRU of decoded blocks
//! - **Manifest**: Atomic record of the live table set
//! - **Compaction**: Background leveled merging to bound read amplification
//! - **Query**: Predicate-filtered scans over decoded values

pub mod cache;
pub mod compaction;
pub mod compression;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod query;
pub mod sstable;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use compression::Compression;
pub use error::{ErrorKind, Result, StrataError};
pub use query::{QueryResponse, QueryResult, QueryStatus};
pub use storage::{Database, DatabaseStats, Scan, Snapshot, StorageConfig};
pub use types::*;

/// StrataDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Block cache capacity (64MB)
    pub const CACHE_SIZE: usize = 64 * 1024 * 1024;

    /// Open sorted-table file handles kept at once
    pub const MAX_OPEN_FILES: usize = 100;

    /// Maximum MemTable size before flush (4MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 4 * 1024 * 1024;

    /// Frozen memtables allowed before writers flush inline
    pub const MAX_IMMUTABLE_MEMTABLES: usize = 2;

    /// SSTable block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Bloom filter bits per key (~1% false positives)
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Maximum SSTables in L0 before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Size ratio between levels
    pub const LEVEL_SIZE_MULTIPLIER: usize = 10;

    /// Target size of L1 (10MB)
    pub const BASE_LEVEL_SIZE: u64 = 10 * 1024 * 1024;

    /// Compaction output file size (2MB)
    pub const TARGET_FILE_SIZE: u64 = 2 * 1024 * 1024;

    /// Number of levels
    pub const MAX_LEVELS: usize = 7;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
