//! WAL writer implementation

use super::{list_segments, segment_path, SyncPolicy, WalConfig, WalEntry, WalPosition};
use crate::error::IoContext;
use crate::manifest::sync_dir;
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// WAL writer for appending entries to disk
pub struct WalWriter {
    dir: PathBuf,
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
    /// A failed append may have left bytes past `bytes_written`
    needs_repair: bool,
}

impl WalWriter {
    /// Open a writer on a fresh segment.
    ///
    /// Existing segments are never appended to; the new segment id is one
    /// past the highest segment on disk and at least `min_segment`.
    pub fn open(dir: impl AsRef<Path>, config: WalConfig, min_segment: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(|| format!("create WAL dir {:?}", dir))?;

        let latest = list_segments(&dir)
            .context(|| format!("list WAL dir {:?}", dir))?
            .last()
            .copied();
        let segment_id = latest.map_or(0, |id| id + 1).max(min_segment).max(1);
        let file = Self::open_segment(&dir, segment_id)?;
        sync_dir(&dir)?;

        debug!("WAL writer opened segment {}", segment_id);

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            bytes_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
            needs_repair: false,
        };

        Ok(Self {
            dir,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Append an entry to the WAL.
    ///
    /// The frame is handed to the OS before returning; it is fsynced
    /// according to the sync policy. On error nothing of the frame is left
    /// in the segment, so a rejected write never replays.
    pub fn append(&self, entry: &WalEntry) -> Result<WalPosition> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        if inner.needs_repair {
            Self::discard_unwritten(&mut inner)?;
        }

        // Check if we need to rotate to a new segment
        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        let position = WalPosition {
            segment: inner.segment_id,
            offset: inner.bytes_written as u64,
        };

        inner.writes_since_sync += 1;
        let sync = self.should_sync(&inner);
        if let Err(e) = Self::write_frame(&mut inner, &serialized, sync) {
            inner.writes_since_sync -= 1;
            inner.needs_repair = true;
            if let Err(repair) = Self::discard_unwritten(&mut inner) {
                warn!(
                    "WAL segment {} not repaired after failed append: {}",
                    inner.segment_id, repair
                );
            }
            return Err(e);
        }
        inner.bytes_written += serialized.len();

        Ok(position)
    }

    /// Force sync to disk; returns once the data is durable
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Seal the current segment and start the next one.
    ///
    /// Returns the id of the new segment.
    pub fn rotate(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.rotate_segment(&mut inner)?;
        Ok(inner.segment_id)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Delete every segment older than `segment_id` (used after memtable flush)
    pub fn remove_segments_before(&self, segment_id: u64) -> Result<usize> {
        let mut removed = 0;
        let segments =
            list_segments(&self.dir).context(|| format!("list WAL dir {:?}", self.dir))?;
        for id in segments.into_iter().filter(|id| *id < segment_id) {
            let path = segment_path(&self.dir, id);
            fs::remove_file(&path).context(|| format!("remove WAL segment {:?}", path))?;
            removed += 1;
        }
        if removed > 0 {
            debug!("Removed {} WAL segments before {}", removed, segment_id);
        }
        Ok(removed)
    }

    fn write_frame(inner: &mut WalWriterInner, frame: &[u8], sync: bool) -> Result<()> {
        let segment = inner.segment_id;
        inner
            .file
            .write_all(frame)
            .and_then(|_| inner.file.flush())
            .context(|| format!("append to WAL segment {}", segment))?;
        if sync {
            Self::sync_inner(inner)?;
        }
        Ok(())
    }

    /// Drop buffered bytes and cut the segment back to the last acknowledged frame
    fn discard_unwritten(inner: &mut WalWriterInner) -> Result<()> {
        let segment = inner.segment_id;
        let file = inner
            .file
            .get_ref()
            .try_clone()
            .context(|| format!("reopen WAL segment {}", segment))?;
        // into_parts hands back the buffer instead of flushing it on drop
        let (_, _unwritten) = std::mem::replace(&mut inner.file, BufWriter::new(file)).into_parts();

        let file = inner.file.get_ref();
        file.set_len(inner.bytes_written as u64)
            .and_then(|_| file.sync_data())
            .context(|| format!("truncate WAL segment {}", segment))?;
        inner.needs_repair = false;
        debug!(
            "WAL segment {} cut back to {} bytes",
            segment, inner.bytes_written
        );
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n.max(1),
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::Manual => false,
        }
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        let segment = inner.segment_id;
        inner
            .file
            .flush()
            .and_then(|_| inner.file.get_ref().sync_data())
            .context(|| format!("sync WAL segment {}", segment))?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        // Seal current segment
        Self::sync_inner(inner)?;

        let next = inner.segment_id + 1;
        let file = Self::open_segment(&self.dir, next)?;
        sync_dir(&self.dir)?;
        inner.segment_id = next;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;

        info!("WAL rotated to segment {}", inner.segment_id);
        Ok(())
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let path = segment_path(dir, segment_id);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(|| format!("open WAL segment {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_wal_writer() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            sync_policy: SyncPolicy::Immediate,
            segment_size: 1024,
        };

        let writer = WalWriter::open(temp_dir.path(), config, 0).unwrap();
        assert_eq!(writer.current_segment(), 1);

        let entry = WalEntry::put(1, 10, Bytes::from_static(b"home|19.99|Product 10"));
        let first = writer.append(&entry).unwrap();
        assert_eq!(first, WalPosition { segment: 1, offset: 0 });

        let second = writer.append(&entry).unwrap();
        assert_eq!(second.offset, entry.encoded_len() as u64);

        writer.sync().unwrap();
    }

    #[test]
    fn test_size_rotation_and_removal() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            sync_policy: SyncPolicy::Manual,
            segment_size: 128,
        };
        let writer = WalWriter::open(temp_dir.path(), config, 0).unwrap();

        for i in 0..20 {
            writer
                .append(&WalEntry::put(i + 1, i as i64, Bytes::from(vec![b'x'; 40])))
                .unwrap();
        }
        let current = writer.current_segment();
        assert!(current > 1);

        let removed = writer.remove_segments_before(current).unwrap();
        assert_eq!(removed as u64, current - 1);
        assert_eq!(list_segments(temp_dir.path()).unwrap(), vec![current]);
    }

    #[test]
    fn test_failed_append_leaves_no_trace() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(temp_dir.path(), WalConfig::default(), 0).unwrap();
        writer.append(&WalEntry::put(1, 1, Bytes::from_static(b"kept"))).unwrap();

        // what an interrupted append leaves: half a frame on disk, the rest buffered
        let rejected = WalEntry::put(2, 2, Bytes::from_static(b"rejected")).serialize_with_checksum();
        {
            let mut inner = writer.inner.lock();
            let (on_disk, buffered) = rejected.split_at(10);
            (&*inner.file.get_ref()).write_all(on_disk).unwrap();
            inner.file.write_all(buffered).unwrap();
            inner.needs_repair = true;
        }

        // the next write reuses the rejected sequence number
        let pos = writer.append(&WalEntry::put(2, 3, Bytes::from_static(b"accepted"))).unwrap();
        assert_eq!(pos.offset, WalEntry::put(1, 1, Bytes::from_static(b"kept")).encoded_len() as u64);
        writer.sync().unwrap();
        drop(writer);

        let replay = crate::wal::WalReader::new(temp_dir.path()).replay(0).unwrap();
        assert_eq!(replay.truncated_bytes, 0);
        let seen: Vec<_> = replay.entries.iter().map(|e| (e.seq, e.value.clone())).collect();
        assert_eq!(
            seen,
            vec![
                (1, Bytes::from_static(b"kept")),
                (2, Bytes::from_static(b"accepted")),
            ]
        );
    }

    #[test]
    fn test_reopen_starts_new_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let writer = WalWriter::open(temp_dir.path(), WalConfig::default(), 0).unwrap();
            assert_eq!(writer.rotate().unwrap(), 2);
        }

        let writer = WalWriter::open(temp_dir.path(), WalConfig::default(), 0).unwrap();
        assert_eq!(writer.current_segment(), 3);

        let writer = WalWriter::open(temp_dir.path(), WalConfig::default(), 10).unwrap();
        assert_eq!(writer.current_segment(), 10);
    }
}
