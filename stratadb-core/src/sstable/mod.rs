//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage for versioned records with:
//! - Block-based format with per-block compression and checksums
//! - Sparse index of block key ranges for fast lookups
//! - Bloom filters for existence checks
//!
//! File layout: `data blocks | index | bloom filter | footer`. The footer has
//! a fixed size so a reader can locate everything else from the end of the
//! file.

mod block;
mod bloom;
mod builder;
mod reader;

pub use block::{Block, BlockBuilder, BlockHeader};
pub use bloom::BloomFilter;
pub use builder::SSTableBuilder;
pub use reader::{SSTableReader, TableIterator};

use crate::compression::Compression;
use crate::types::{Key, KeyRange, SeqNum};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};

/// SSTable file format version
pub const FORMAT_VERSION: u32 = 1;

/// Trailing magic ("STRT")
pub const MAGIC: u32 = 0x5452_5453;

/// SSTable metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSTableMeta {
    /// Unique ID
    pub id: u64,
    /// File path
    pub path: PathBuf,
    /// Number of records (all versions)
    pub entry_count: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Minimum key
    pub min_key: Key,
    /// Maximum key
    pub max_key: Key,
    /// Highest sequence number stored
    pub max_seq: SeqNum,
    /// Codec of every block in the file
    pub compression: Compression,
}

impl SSTableMeta {
    /// Check if the SSTable may contain a key
    pub fn may_contain_key(&self, key: Key) -> bool {
        key >= self.min_key && key <= self.max_key
    }

    /// Check if the SSTable may contain keys in a range
    pub fn overlaps(&self, range: &KeyRange) -> bool {
        range.overlaps(self.min_key, self.max_key)
    }
}

/// SSTable configuration
#[derive(Debug, Clone)]
pub struct SSTableConfig {
    /// Block size in bytes (uncompressed)
    pub block_size: usize,
    /// Codec for new blocks
    pub compression: Compression,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
}

impl Default for SSTableConfig {
    fn default() -> Self {
        Self {
            block_size: crate::config::BLOCK_SIZE,
            compression: Compression::default(),
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
        }
    }
}

/// Path of table `id` inside `dir`
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("sst_{:020}.sst", id))
}

/// Parse a table id from its file name
pub fn parse_table_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("sst_"))
        .and_then(|s| s.strip_suffix(".sst"))
        .and_then(|s| s.parse().ok())
}

/// Index entry describing one data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub first_key: Key,
    pub last_key: Key,
    pub offset: u64,
    pub size: u32,
}

impl IndexEntry {
    const SIZE: usize = 8 + 8 + 8 + 4;
}

pub(crate) fn encode_index(entries: &[IndexEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + entries.len() * IndexEntry::SIZE + 4);
    buf.put_u32_le(entries.len() as u32);
    for e in entries {
        buf.put_i64_le(e.first_key);
        buf.put_i64_le(e.last_key);
        buf.put_u64_le(e.offset);
        buf.put_u32_le(e.size);
    }
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.freeze()
}

pub(crate) fn decode_index(data: &[u8]) -> Result<Vec<IndexEntry>> {
    if data.len() < 8 {
        return Err(StrataError::Corruption("Index block too short".into()));
    }
    let body = &data[..data.len() - 4];
    let expected = (&data[data.len() - 4..]).get_u32_le();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(StrataError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = body;
    let count = cursor.get_u32_le() as usize;
    if cursor.remaining() != count * IndexEntry::SIZE {
        return Err(StrataError::Corruption(format!(
            "Index holds {} bytes for {} entries",
            cursor.remaining(),
            count
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(IndexEntry {
            first_key: cursor.get_i64_le(),
            last_key: cursor.get_i64_le(),
            offset: cursor.get_u64_le(),
            size: cursor.get_u32_le(),
        });
    }
    Ok(entries)
}

/// Fixed-size trailer of every table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footer {
    pub index_offset: u64,
    pub index_len: u32,
    pub bloom_offset: u64,
    pub bloom_len: u32,
    pub entry_count: u64,
    pub min_key: Key,
    pub max_key: Key,
    pub max_seq: SeqNum,
    pub compression: Compression,
}

impl Footer {
    pub const SIZE: usize = 8 + 4 + 8 + 4 + 8 + 8 + 8 + 8 + 1 + 4 + 4 + 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.index_offset);
        buf.put_u32_le(self.index_len);
        buf.put_u64_le(self.bloom_offset);
        buf.put_u32_le(self.bloom_len);
        buf.put_u64_le(self.entry_count);
        buf.put_i64_le(self.min_key);
        buf.put_i64_le(self.max_key);
        buf.put_u64_le(self.max_seq);
        buf.put_u8(self.compression.tag());
        buf.put_u32_le(FORMAT_VERSION);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.put_u32_le(MAGIC);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(StrataError::Corruption("Footer has wrong size".into()));
        }
        let magic = (&data[Self::SIZE - 4..]).get_u32_le();
        if magic != MAGIC {
            return Err(StrataError::Corruption(format!(
                "Invalid SSTable magic: {:#010x}",
                magic
            )));
        }
        let body = &data[..Self::SIZE - 8];
        let expected = (&data[Self::SIZE - 8..Self::SIZE - 4]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let footer = Footer {
            index_offset: cursor.get_u64_le(),
            index_len: cursor.get_u32_le(),
            bloom_offset: cursor.get_u64_le(),
            bloom_len: cursor.get_u32_le(),
            entry_count: cursor.get_u64_le(),
            min_key: cursor.get_i64_le(),
            max_key: cursor.get_i64_le(),
            max_seq: cursor.get_u64_le(),
            compression: Compression::from_tag(cursor.get_u8())?,
        };
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::Corruption(format!(
                "Unsupported SSTable version: {}",
                version
            )));
        }
        Ok(footer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let dir = Path::new("/data");
        let path = table_path(dir, 42);
        assert_eq!(path, Path::new("/data/sst_00000000000000000042.sst"));
        assert_eq!(parse_table_id(&path), Some(42));
        assert_eq!(parse_table_id(Path::new("/data/MANIFEST")), None);
    }

    #[test]
    fn test_footer_detects_damage() {
        let footer = Footer {
            index_offset: 4096,
            index_len: 60,
            bloom_offset: 4156,
            bloom_len: 130,
            entry_count: 1000,
            min_key: -5,
            max_key: 995,
            max_seq: 1200,
            compression: Compression::Snappy,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), Footer::SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);

        let mut damaged = encoded.to_vec();
        damaged[20] ^= 0x10;
        assert!(Footer::decode(&damaged).unwrap_err().is_corruption());

        let mut bad_magic = encoded.to_vec();
        bad_magic[Footer::SIZE - 1] = 0;
        assert!(Footer::decode(&bad_magic).is_err());
    }

    #[test]
    fn test_index_checksum() {
        let entries = vec![
            IndexEntry { first_key: 1, last_key: 40, offset: 0, size: 900 },
            IndexEntry { first_key: 40, last_key: 77, offset: 900, size: 870 },
        ];
        let encoded = encode_index(&entries);
        assert_eq!(decode_index(&encoded).unwrap(), entries);

        let mut damaged = encoded.to_vec();
        damaged[6] ^= 0xFF;
        assert!(decode_index(&damaged).is_err());
    }
}
