//! SSTable builder for writing sorted data to disk

use super::{
    encode_index, table_path, BlockBuilder, BloomFilter, Footer, IndexEntry, SSTableConfig,
    SSTableMeta,
};
use crate::error::IoContext;
use crate::manifest::sync_dir;
use crate::types::{InternalKey, Key, Record, SeqNum};
use crate::{Result, StrataError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// SSTable builder
///
/// Records must be added in `(key asc, seq desc)` order. The table is written
/// under a temporary name and only appears under its final name once it is
/// complete and durable; a builder dropped before [`finish`](Self::finish)
/// removes its partial file.
pub struct SSTableBuilder {
    config: SSTableConfig,
    id: u64,
    dir: PathBuf,
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,

    // Current state
    block: BlockBuilder,
    offset: u64,
    last: Option<InternalKey>,

    // Index data
    index: Vec<IndexEntry>,
    keys: Vec<Key>,

    // Stats
    entry_count: u64,
    min_key: Option<Key>,
    max_key: Key,
    max_seq: SeqNum,
}

impl SSTableBuilder {
    /// Create a new SSTable builder for table `id` in `dir`
    pub fn new(dir: &Path, id: u64, config: SSTableConfig) -> Result<Self> {
        let path = table_path(dir, id);
        let tmp_path = path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context(|| format!("create table {:?}", tmp_path))?;

        Ok(Self {
            config,
            id,
            dir: dir.to_path_buf(),
            path,
            tmp_path,
            writer: Some(BufWriter::new(file)),
            block: BlockBuilder::new(),
            offset: 0,
            last: None,
            index: Vec::new(),
            keys: Vec::new(),
            entry_count: 0,
            min_key: None,
            max_key: 0,
            max_seq: 0,
        })
    }

    /// Add a record to the SSTable
    pub fn add(&mut self, record: &Record) -> Result<()> {
        let ikey = record.internal_key();
        if let Some(last) = self.last {
            if ikey <= last {
                return Err(StrataError::Internal(format!(
                    "SSTable {} records out of order: ({}, {}) after ({}, {})",
                    self.id, ikey.key, ikey.seq, last.key, last.seq
                )));
            }
        }

        if self.last.map_or(true, |l| l.key != record.key) {
            self.keys.push(record.key);
        }
        self.last = Some(ikey);

        // Update stats
        self.entry_count += 1;
        self.min_key.get_or_insert(record.key);
        self.max_key = record.key;
        self.max_seq = self.max_seq.max(record.seq);

        self.block.add(record);
        if self.block.estimated_size() >= self.config.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the pending block
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.estimated_size() as u64
    }

    /// Number of records added
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Key of the last record added
    pub fn last_key(&self) -> Option<Key> {
        self.last.map(|l| l.key)
    }

    fn flush_block(&mut self) -> Result<()> {
        let first_key = match self.block.first_key() {
            Some(k) => k,
            None => return Ok(()),
        };
        let last_key = self.block.last_key();
        let frame = self.block.finish(self.config.compression)?;
        self.write(&frame)?;

        self.index.push(IndexEntry {
            first_key,
            last_key,
            offset: self.offset,
            size: frame.len() as u32,
        });
        self.offset += frame.len() as u64;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let tmp_path = &self.tmp_path;
        match self.writer.as_mut() {
            Some(w) => w
                .write_all(data)
                .context(|| format!("write table {:?}", tmp_path)),
            None => Err(StrataError::Internal("SSTable builder already finished".into())),
        }
    }

    /// Finish writing and make the table visible under its final name
    pub fn finish(mut self) -> Result<SSTableMeta> {
        self.flush_block()?;
        let min_key = match self.min_key {
            Some(k) => k,
            None => {
                return Err(StrataError::Internal(format!(
                    "SSTable {} has no records",
                    self.id
                )))
            }
        };

        let index_offset = self.offset;
        let index = encode_index(&self.index);
        self.write(&index)?;

        let bloom_offset = index_offset + index.len() as u64;
        let bloom = BloomFilter::build(&self.keys, self.config.bloom_bits_per_key).encode();
        self.write(&bloom)?;

        let footer = Footer {
            index_offset,
            index_len: index.len() as u32,
            bloom_offset,
            bloom_len: bloom.len() as u32,
            entry_count: self.entry_count,
            min_key,
            max_key: self.max_key,
            max_seq: self.max_seq,
            compression: self.config.compression,
        };
        self.write(&footer.encode())?;
        let file_size = bloom_offset + bloom.len() as u64 + Footer::SIZE as u64;

        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .and_then(|_| writer.get_ref().sync_all())
                .context(|| format!("sync table {:?}", self.tmp_path))?;
        }
        fs::rename(&self.tmp_path, &self.path)
            .context(|| format!("rename {:?} to {:?}", self.tmp_path, self.path))?;
        sync_dir(&self.dir)?;

        debug!(
            "Wrote SSTable {} ({} entries, {} blocks, {} bytes)",
            self.id,
            self.entry_count,
            self.index.len(),
            file_size
        );

        Ok(SSTableMeta {
            id: self.id,
            path: self.path.clone(),
            entry_count: self.entry_count,
            file_size,
            min_key,
            max_key: self.max_key,
            max_seq: self.max_seq,
            compression: self.config.compression,
        })
    }
}

impl Drop for SSTableBuilder {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                warn!("Failed to remove partial table {:?}: {}", self.tmp_path, e);
            }
        }
    }
}
