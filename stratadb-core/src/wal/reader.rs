//! WAL reader for recovery

use super::{list_segments, segment_path, WalEntry};
use crate::error::IoContext;
use crate::{Result, StrataError};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of replaying the log
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Valid entries in log order
    pub entries: Vec<WalEntry>,
    /// Highest segment id seen
    pub last_segment: Option<u64>,
    /// Bytes discarded from the tail of the final segment
    pub truncated_bytes: u64,
}

/// WAL reader for recovering entries after crash
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Replay every segment with id `>= from_segment`.
    ///
    /// A damaged frame at the very end of the final segment is an interrupted
    /// append: it is cut off (the file is truncated) and replay succeeds with
    /// the entries before it. Damage anywhere else is an error.
    pub fn replay(&self, from_segment: u64) -> Result<WalReplay> {
        let segments: Vec<u64> = list_segments(&self.dir)
            .context(|| format!("list WAL dir {:?}", self.dir))?
            .into_iter()
            .filter(|id| *id >= from_segment)
            .collect();

        let mut replay = WalReplay {
            last_segment: segments.last().copied(),
            ..Default::default()
        };

        for (i, &segment_id) in segments.iter().enumerate() {
            let is_final = i + 1 == segments.len();
            let path = segment_path(&self.dir, segment_id);
            let data = fs::read(&path).context(|| format!("read WAL segment {:?}", path))?;

            let (entries, valid_len) = Self::read_segment(segment_id, &data, is_final)?;
            if valid_len < data.len() {
                let dropped = (data.len() - valid_len) as u64;
                warn!(
                    "WAL segment {} has a torn tail at offset {}, discarding {} bytes",
                    segment_id, valid_len, dropped
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .context(|| format!("open WAL segment {:?}", path))?;
                file.set_len(valid_len as u64)
                    .and_then(|_| file.sync_all())
                    .context(|| format!("truncate WAL segment {:?}", path))?;
                replay.truncated_bytes += dropped;
            }

            if !entries.is_empty() {
                info!(
                    "Recovered {} entries from WAL segment {}",
                    entries.len(),
                    segment_id
                );
            }
            replay.entries.extend(entries);
        }

        Ok(replay)
    }

    /// Decode a segment, returning its entries and the length of its valid prefix
    fn read_segment(segment_id: u64, data: &[u8], is_final: bool) -> Result<(Vec<WalEntry>, usize)> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, bytes_read)) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Err(e) => {
                    // a frame running past the end of the log was never completed
                    let frame_end = WalEntry::framed_len(&data[offset..])
                        .map(|len| offset + len)
                        .filter(|end| *end <= data.len());
                    let is_tail = match frame_end {
                        Some(end) => !Self::has_valid_frame_after(data, end),
                        None => true,
                    };
                    if !is_final || !is_tail {
                        warn!(
                            "WAL segment {} corrupted at offset {}: {}",
                            segment_id, offset, e
                        );
                        return Err(StrataError::WalCorruption {
                            segment: segment_id,
                            offset: offset as u64,
                        });
                    }
                    break;
                }
            }
        }

        Ok((entries, offset))
    }

    /// Check whether any intact frame starts at or after `from`
    fn has_valid_frame_after(data: &[u8], from: usize) -> bool {
        (from..data.len()).any(|start| WalEntry::deserialize_with_checksum(&data[start..]).is_ok())
    }
}
