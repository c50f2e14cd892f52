//! Manifest: durable record of the live table set
//!
//! The manifest is a single file rewritten in full on every change. A new
//! version is written to `MANIFEST.tmp`, fsynced and renamed over `MANIFEST`,
//! so a crash leaves either the old or the new table set, never a mix.
//!
//! Format: `magic u32 | len u32 | crc32 u32 | bincode(ManifestData)`

use crate::compression::Compression;
use crate::error::IoContext;
use crate::sstable::{parse_table_id, SSTableMeta};
use crate::types::{Key, SeqNum};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP: &str = "MANIFEST.tmp";
const MANIFEST_MAGIC: u32 = 0x4d41_4e31;
const HEADER_SIZE: usize = 12;

/// One live table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub id: u64,
    pub level: usize,
    pub min_key: Key,
    pub max_key: Key,
    pub entry_count: u64,
    pub file_size: u64,
    pub compression: Compression,
}

impl TableEntry {
    pub fn from_meta(meta: &SSTableMeta, level: usize) -> Self {
        Self {
            id: meta.id,
            level,
            min_key: meta.min_key,
            max_key: meta.max_key,
            entry_count: meta.entry_count,
            file_size: meta.file_size,
            compression: meta.compression,
        }
    }
}

/// Persistent engine state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestData {
    /// Next table id to allocate
    pub next_table_id: u64,
    /// Every write up to this sequence is contained in a listed table
    pub last_sequence: SeqNum,
    /// Oldest WAL segment still needed for recovery
    pub wal_checkpoint: u64,
    /// Live tables
    pub tables: Vec<TableEntry>,
}

/// Manifest file handle
pub struct Manifest {
    dir: PathBuf,
    data: ManifestData,
}

impl Manifest {
    /// Load the manifest in `dir`, or start an empty one
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MANIFEST_FILE);

        let data = if path.exists() {
            let raw = fs::read(&path).context(|| format!("read manifest {:?}", path))?;
            let data = Self::decode(&raw)?;
            debug!(
                "Loaded manifest: {} tables, last sequence {}, WAL checkpoint {}",
                data.tables.len(),
                data.last_sequence,
                data.wal_checkpoint
            );
            data
        } else {
            info!("No manifest in {:?}, starting empty", dir);
            ManifestData {
                next_table_id: 1,
                ..Default::default()
            }
        };

        Ok(Self { dir, data })
    }

    /// Current state
    pub fn data(&self) -> &ManifestData {
        &self.data
    }

    /// Reserve a table id
    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.data.next_table_id;
        self.data.next_table_id += 1;
        id
    }

    /// Atomically replace the on-disk manifest with `data`
    pub fn commit(&mut self, data: ManifestData) -> Result<()> {
        let encoded = Self::encode(&data)?;
        let tmp = self.dir.join(MANIFEST_TMP);
        let path = self.dir.join(MANIFEST_FILE);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .context(|| format!("create {:?}", tmp))?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .context(|| format!("write {:?}", tmp))?;
        drop(file);

        fs::rename(&tmp, &path).context(|| format!("rename {:?} to {:?}", tmp, path))?;
        sync_dir(&self.dir)?;

        debug!(
            "Committed manifest: {} tables, last sequence {}, WAL checkpoint {}",
            data.tables.len(),
            data.last_sequence,
            data.wal_checkpoint
        );
        self.data = data;
        Ok(())
    }

    /// Delete table files that the manifest does not list and leftover
    /// temporary files from interrupted writes
    pub fn remove_orphans(&self) -> Result<usize> {
        let live: HashSet<u64> = self.data.tables.iter().map(|t| t.id).collect();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir).context(|| format!("list {:?}", self.dir))? {
            let path = entry.context(|| format!("list {:?}", self.dir))?.path();
            let is_tmp = path.extension().map_or(false, |ext| ext == "tmp");
            let is_orphan = parse_table_id(&path).map_or(false, |id| !live.contains(&id));
            if is_tmp || is_orphan {
                warn!("Removing orphaned file {:?}", path);
                fs::remove_file(&path).context(|| format!("remove {:?}", path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn encode(data: &ManifestData) -> Result<Vec<u8>> {
        let body = bincode::serialize(data)
            .map_err(|e| StrataError::Internal(format!("encode manifest: {}", e)))?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u32_le(MANIFEST_MAGIC);
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    fn decode(raw: &[u8]) -> Result<ManifestData> {
        if raw.len() < HEADER_SIZE {
            return Err(StrataError::Corruption("Manifest too short".into()));
        }
        let mut header = &raw[..HEADER_SIZE];
        let magic = header.get_u32_le();
        let len = header.get_u32_le() as usize;
        let expected = header.get_u32_le();

        if magic != MANIFEST_MAGIC {
            return Err(StrataError::Corruption(format!(
                "Invalid manifest magic: {:#010x}",
                magic
            )));
        }
        let body = &raw[HEADER_SIZE..];
        if body.len() != len {
            return Err(StrataError::Corruption(format!(
                "Manifest body is {} bytes, header says {}",
                body.len(),
                len
            )));
        }
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        bincode::deserialize(body)
            .map_err(|e| StrataError::Corruption(format!("decode manifest: {}", e)))
    }
}

/// Persist directory entries (new or renamed files)
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .context(|| format!("sync directory {:?}", dir))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: u64, level: usize) -> TableEntry {
        TableEntry {
            id,
            level,
            min_key: 0,
            max_key: 100,
            entry_count: 101,
            file_size: 4096,
            compression: Compression::Snappy,
        }
    }

    #[test]
    fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::open(dir.path()).unwrap();
        assert_eq!(manifest.data().next_table_id, 1);
        assert_eq!(manifest.allocate_table_id(), 1);

        let data = ManifestData {
            next_table_id: 3,
            last_sequence: 250,
            wal_checkpoint: 4,
            tables: vec![entry(1, 0), entry(2, 1)],
        };
        manifest.commit(data.clone()).unwrap();
        assert!(!dir.path().join(MANIFEST_TMP).exists());

        let reloaded = Manifest::open(dir.path()).unwrap();
        assert_eq!(reloaded.data(), &data);
    }

    #[test]
    fn test_damaged_manifest_fails() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::open(dir.path()).unwrap();
        manifest
            .commit(ManifestData {
                next_table_id: 2,
                tables: vec![entry(1, 0)],
                ..Default::default()
            })
            .unwrap();

        let path = dir.path().join(MANIFEST_FILE);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let err = Manifest::open(dir.path()).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_remove_orphans() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::open(dir.path()).unwrap();
        manifest
            .commit(ManifestData {
                next_table_id: 3,
                tables: vec![entry(1, 0)],
                ..Default::default()
            })
            .unwrap();

        let live = crate::sstable::table_path(dir.path(), 1);
        let orphan = crate::sstable::table_path(dir.path(), 2);
        let partial = dir.path().join("sst_00000000000000000005.sst.tmp");
        for path in [&live, &orphan, &partial] {
            fs::write(path, b"data").unwrap();
        }

        assert_eq!(manifest.remove_orphans().unwrap(), 2);
        assert!(live.exists());
        assert!(!orphan.exists());
        assert!(!partial.exists());
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }
}
