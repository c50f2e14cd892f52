//! SSTable reader for querying data

use super::{decode_index, Block, BloomFilter, Footer, IndexEntry, SSTableMeta};
use crate::cache::{BlockCache, FileCache};
use crate::error::IoContext;
use crate::types::{Key, KeyRange, Record, SeqNum};
use crate::{Result, StrataError};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// SSTable reader
///
/// Shared as `Arc<SSTableReader>` by the current version, in-flight reads and
/// compactions. A reader marked obsolete deletes its file when the last
/// reference drops.
pub struct SSTableReader {
    meta: SSTableMeta,
    index: Vec<IndexEntry>,
    bloom_filter: BloomFilter,
    blocks: Arc<BlockCache>,
    files: Arc<FileCache>,
    obsolete: AtomicBool,
}

impl SSTableReader {
    /// Open an SSTable file, validating its footer, index and bloom filter
    pub fn open(
        path: PathBuf,
        id: u64,
        blocks: Arc<BlockCache>,
        files: Arc<FileCache>,
    ) -> Result<Self> {
        let file_size = fs::metadata(&path)
            .context(|| format!("stat table {:?}", path))?
            .len();
        if file_size < Footer::SIZE as u64 {
            return Err(StrataError::Corruption(format!(
                "SSTable {:?} too small: {} bytes",
                path, file_size
            )));
        }

        // Read footer
        let footer_data = read_at(&files, id, &path, file_size - Footer::SIZE as u64, Footer::SIZE)?;
        let footer = Footer::decode(&footer_data)?;

        let index_end = footer.index_offset + footer.index_len as u64;
        let bloom_end = footer.bloom_offset + footer.bloom_len as u64;
        if index_end > footer.bloom_offset || bloom_end + Footer::SIZE as u64 != file_size {
            return Err(StrataError::Corruption(format!(
                "SSTable {:?} footer offsets do not match file size {}",
                path, file_size
            )));
        }

        // Read index
        let index_data = read_at(&files, id, &path, footer.index_offset, footer.index_len as usize)?;
        let index = decode_index(&index_data)?;

        // Read bloom filter
        let bloom_data = read_at(&files, id, &path, footer.bloom_offset, footer.bloom_len as usize)?;
        let bloom_filter = BloomFilter::decode(&bloom_data)?;

        let meta = SSTableMeta {
            id,
            path,
            entry_count: footer.entry_count,
            file_size,
            min_key: footer.min_key,
            max_key: footer.max_key,
            max_seq: footer.max_seq,
            compression: footer.compression,
        };

        Ok(Self {
            meta,
            index,
            bloom_filter,
            blocks,
            files,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Get metadata
    pub fn meta(&self) -> &SSTableMeta {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Number of data blocks
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Bloom and key-range check
    pub fn may_contain(&self, key: Key) -> bool {
        self.meta.may_contain_key(key) && self.bloom_filter.may_contain(key)
    }

    /// Newest record for `key` with `seq <= snapshot`, tombstones included
    pub fn get(&self, key: Key, snapshot: SeqNum) -> Result<Option<Record>> {
        if !self.may_contain(key) {
            return Ok(None);
        }

        let mut idx = self.index.partition_point(|e| e.last_key < key);
        while idx < self.index.len() && self.index[idx].first_key <= key {
            let block = self.block(idx)?;
            if let Some(record) = block.get(key, snapshot) {
                return Ok(Some(record.clone()));
            }
            // older versions continue in the next block only if this one ends with key
            if self.index[idx].last_key != key {
                break;
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Iterate records in `range` in `(key asc, seq desc)` order
    pub fn iter(self: &Arc<Self>, range: KeyRange) -> TableIterator {
        let block_idx = match range.lower_key() {
            Some(lower) if !range.is_empty() && self.meta.overlaps(&range) => {
                self.index.partition_point(|e| e.last_key < lower)
            }
            _ => self.index.len(),
        };

        TableIterator {
            table: Arc::clone(self),
            range,
            block_idx,
            block: None,
            pos: 0,
            done: false,
        }
    }

    /// Fetch a block through the block cache
    fn block(&self, idx: usize) -> Result<Arc<Block>> {
        self.blocks
            .get_or_load(self.meta.id, idx, || self.load_block(idx))
    }

    /// Read a block from disk, retrying once on a checksum failure
    fn load_block(&self, idx: usize) -> Result<Arc<Block>> {
        let entry = self.index[idx];
        match self.read_block(&entry) {
            Ok(block) => Ok(Arc::new(block)),
            Err(e) if e.is_corruption() => {
                warn!(
                    "Block {} of SSTable {} failed verification ({}), re-reading",
                    idx, self.meta.id, e
                );
                self.blocks.evict(self.meta.id, idx);
                self.files.evict(self.meta.id);
                self.read_block(&entry).map(Arc::new)
            }
            Err(e) => Err(e),
        }
    }

    fn read_block(&self, entry: &IndexEntry) -> Result<Block> {
        let frame = read_at(
            &self.files,
            self.meta.id,
            &self.meta.path,
            entry.offset,
            entry.size as usize,
        )?;
        Block::decode(&frame)
    }

    /// Delete the file once the last reference is gone
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        self.blocks.evict_table(self.meta.id, self.index.len());
        self.files.evict(self.meta.id);
        match fs::remove_file(&self.meta.path) {
            Ok(()) => info!("Removed obsolete SSTable {}", self.meta.id),
            Err(e) => warn!("Failed to remove obsolete SSTable {:?}: {}", self.meta.path, e),
        }
    }
}

fn read_at(files: &FileCache, id: u64, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let handle = files.get(id, path)?;
    let mut file = handle.lock();
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut buf))
        .context(|| format!("read {} bytes at {} from {:?}", len, offset, path))?;
    Ok(buf)
}

/// Forward iterator over one table, decoding blocks lazily
pub struct TableIterator {
    table: Arc<SSTableReader>,
    range: KeyRange,
    block_idx: usize,
    block: Option<Arc<Block>>,
    pos: usize,
    done: bool,
}

impl Iterator for TableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let block = match self.block.clone() {
                Some(block) => block,
                None => {
                    let entry = match self.table.index.get(self.block_idx) {
                        Some(entry) => *entry,
                        None => {
                            self.done = true;
                            return None;
                        }
                    };
                    if self.range.is_past_end(entry.first_key) {
                        self.done = true;
                        return None;
                    }
                    let block = match self.table.block(self.block_idx) {
                        Ok(block) => block,
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    };
                    self.pos = match self.range.lower_key() {
                        Some(lower) if entry.first_key < lower => block.seek(lower),
                        _ => 0,
                    };
                    self.block = Some(Arc::clone(&block));
                    block
                }
            };

            match block.records().get(self.pos) {
                Some(record) => {
                    if self.range.is_past_end(record.key) {
                        self.done = true;
                        return None;
                    }
                    self.pos += 1;
                    if self.range.contains(record.key) {
                        return Some(Ok(record.clone()));
                    }
                }
                None => {
                    self.block = None;
                    self.block_idx += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::sstable::{SSTableBuilder, SSTableConfig};
    use tempfile::TempDir;

    fn caches() -> (Arc<BlockCache>, Arc<FileCache>) {
        (Arc::new(BlockCache::new(1 << 20)), Arc::new(FileCache::new(8)))
    }

    fn write_table(dir: &Path, id: u64, records: &[Record], block_size: usize) -> SSTableMeta {
        let config = SSTableConfig {
            block_size,
            compression: Compression::Lz4,
            bloom_bits_per_key: 10,
        };
        let mut builder = SSTableBuilder::new(dir, id, config).unwrap();
        for r in records {
            builder.add(r).unwrap();
        }
        builder.finish().unwrap()
    }

    fn open(meta: &SSTableMeta) -> Arc<SSTableReader> {
        let (blocks, files) = caches();
        Arc::new(SSTableReader::open(meta.path.clone(), meta.id, blocks, files).unwrap())
    }

    #[test]
    fn test_point_lookup() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..500)
            .map(|k| Record::put(k * 2, k as u64 + 1, format!("books|{}|Product {}", k, k)))
            .collect();
        let meta = write_table(dir.path(), 1, &records, 256);
        let table = open(&meta);
        assert!(table.block_count() > 1);

        let hit = table.get(400, u64::MAX).unwrap().unwrap();
        assert_eq!(hit.value.unwrap(), "books|200|Product 200");
        assert!(table.get(401, u64::MAX).unwrap().is_none());
        assert!(table.get(-1, u64::MAX).unwrap().is_none());
        // written at seq 201, invisible before it
        assert!(table.get(400, 200).unwrap().is_none());
    }

    #[test]
    fn test_versions_spanning_blocks() {
        let dir = TempDir::new().unwrap();
        let mut records = vec![Record::put(1, 1, "one")];
        for seq in (10..60).rev() {
            records.push(Record::put(7, seq, format!("version {}", seq)));
        }
        records.push(Record::tombstone(9, 5));
        let meta = write_table(dir.path(), 1, &records, 64);
        let table = open(&meta);

        assert_eq!(table.get(7, 100).unwrap().unwrap().seq, 59);
        assert_eq!(table.get(7, 10).unwrap().unwrap().seq, 10);
        assert!(table.get(7, 9).unwrap().is_none());
        assert!(table.get(9, 100).unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn test_range_iteration() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (1..=1000).map(|k| Record::put(k, k as u64, "x")).collect();
        let meta = write_table(dir.path(), 1, &records, 512);
        let table = open(&meta);

        let keys: Vec<Key> = table
            .iter(KeyRange::inclusive(100, 110))
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, (100..=110).collect::<Vec<_>>());

        assert_eq!(table.iter(KeyRange::full()).count(), 1000);
        assert_eq!(table.iter(KeyRange::from_bounds(990..)).count(), 11);
        assert_eq!(table.iter(KeyRange::inclusive(2000, 3000)).count(), 0);
        assert_eq!(table.iter(KeyRange::from_bounds(5..5)).count(), 0);
    }

    #[test]
    fn test_corrupted_block_is_reported() {
        let dir = TempDir::new().unwrap();
        let records: Vec<Record> = (0..100).map(|k| Record::put(k, 1, "payload")).collect();
        let meta = write_table(dir.path(), 1, &records, 4096);

        let mut data = fs::read(&meta.path).unwrap();
        data[20] ^= 0xFF;
        fs::write(&meta.path, &data).unwrap();

        let table = open(&meta);
        let err = table.get(5, u64::MAX).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_obsolete_table_removed_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), 1, &[Record::put(1, 1, "a")], 4096);
        let table = open(&meta);
        let reader_ref = Arc::clone(&table);

        table.mark_obsolete();
        drop(table);
        assert!(meta.path.exists());

        drop(reader_ref);
        assert!(!meta.path.exists());
    }

    #[test]
    fn test_truncated_table_fails_open() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), 1, &[Record::put(1, 1, "a")], 4096);
        let data = fs::read(&meta.path).unwrap();
        fs::write(&meta.path, &data[..data.len() - 3]).unwrap();

        let (blocks, files) = caches();
        let err = SSTableReader::open(meta.path.clone(), 1, blocks, files).err().unwrap();
        assert!(err.is_corruption());
    }
}
