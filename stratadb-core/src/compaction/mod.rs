//! Background compaction for LSM tree
//!
//! Leveled policy: L0 holds whole flushed memtables and may overlap; every
//! deeper level is a sorted run of non-overlapping tables whose target size
//! grows by `level_size_multiplier` per level.

use crate::iterator::{MergeIterator, RecordSource};
use crate::sstable::{SSTableBuilder, SSTableConfig, SSTableMeta, SSTableReader};
use crate::types::{Key, KeyRange, Record, SeqNum};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Tables of every level, as seen by one version
pub type Levels = [Vec<Arc<SSTableReader>>];

/// Compaction task type
#[derive(Clone)]
pub enum CompactionTask {
    /// Compact L0 files to L1
    L0ToL1 {
        l0_files: Vec<Arc<SSTableReader>>,
        l1_files: Vec<Arc<SSTableReader>>,
    },
    /// Compact files from one level to the next
    LevelToLevel {
        source_level: usize,
        source_files: Vec<Arc<SSTableReader>>,
        target_level: usize,
        target_files: Vec<Arc<SSTableReader>>,
    },
    /// Merge every table into the bottom level
    Major {
        files: Vec<Arc<SSTableReader>>,
        target_level: usize,
    },
}

impl CompactionTask {
    /// Level the outputs are installed into
    pub fn target_level(&self) -> usize {
        match self {
            CompactionTask::L0ToL1 { .. } => 1,
            CompactionTask::LevelToLevel { target_level, .. } => *target_level,
            CompactionTask::Major { target_level, .. } => *target_level,
        }
    }

    /// Input tables, newest data first
    pub fn inputs(&self) -> Vec<Arc<SSTableReader>> {
        match self {
            CompactionTask::L0ToL1 { l0_files, l1_files } => {
                l0_files.iter().chain(l1_files.iter()).cloned().collect()
            }
            CompactionTask::LevelToLevel {
                source_files,
                target_files,
                ..
            } => source_files.iter().chain(target_files.iter()).cloned().collect(),
            CompactionTask::Major { files, .. } => files.clone(),
        }
    }

    /// Ids of the input tables
    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs().iter().map(|t| t.id()).collect()
    }

    fn describe(&self) -> String {
        match self {
            CompactionTask::L0ToL1 { l0_files, l1_files } => format!(
                "{} L0 files with {} L1 files",
                l0_files.len(),
                l1_files.len()
            ),
            CompactionTask::LevelToLevel {
                source_level,
                source_files,
                target_level,
                target_files,
            } => format!(
                "{} L{} files with {} L{} files",
                source_files.len(),
                source_level,
                target_files.len(),
                target_level
            ),
            CompactionTask::Major {
                files,
                target_level,
            } => format!("{} files into L{} (major)", files.len(), target_level),
        }
    }
}

impl std::fmt::Debug for CompactionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactionTask({}, inputs {:?})", self.describe(), self.input_ids())
    }
}

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Maximum files in L0 before triggering compaction
    pub l0_file_trigger: usize,
    /// Size multiplier between levels
    pub level_size_multiplier: u64,
    /// Base level size (L1) in bytes
    pub base_level_size: u64,
    /// Output tables are cut at this size
    pub target_file_size: u64,
    /// Maximum levels
    pub max_levels: usize,
    /// SSTable configuration
    pub sstable_config: SSTableConfig,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_file_trigger: crate::config::L0_COMPACTION_TRIGGER,
            level_size_multiplier: crate::config::LEVEL_SIZE_MULTIPLIER as u64,
            base_level_size: crate::config::BASE_LEVEL_SIZE,
            target_file_size: crate::config::TARGET_FILE_SIZE,
            max_levels: crate::config::MAX_LEVELS,
            sstable_config: SSTableConfig::default(),
        }
    }
}

/// Compaction scheduler: picks tasks and runs the merge
pub struct CompactionScheduler {
    data_dir: PathBuf,
    config: CompactionConfig,
}

impl CompactionScheduler {
    /// Create a new compaction scheduler
    pub fn new(data_dir: PathBuf, config: CompactionConfig) -> Self {
        Self { data_dir, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Check if compaction is needed and return task
    pub fn select_compaction(&self, levels: &Levels) -> Option<CompactionTask> {
        // Check L0 file count
        if levels[0].len() >= self.config.l0_file_trigger {
            let l0_files = levels[0].clone();
            let min = l0_files.iter().map(|t| t.meta().min_key).min()?;
            let max = l0_files.iter().map(|t| t.meta().max_key).max()?;
            let l1_files = Self::find_overlapping(&levels[1], min, max);
            return Some(CompactionTask::L0ToL1 { l0_files, l1_files });
        }

        // Check level sizes
        for i in 1..levels.len().saturating_sub(1) {
            let size: u64 = levels[i].iter().map(|t| t.meta().file_size).sum();
            if size > self.target_size_for_level(i) {
                if let Some(file) = Self::pick_file_to_compact(&levels[i]) {
                    let target_files = Self::find_overlapping(
                        &levels[i + 1],
                        file.meta().min_key,
                        file.meta().max_key,
                    );
                    return Some(CompactionTask::LevelToLevel {
                        source_level: i,
                        source_files: vec![file],
                        target_level: i + 1,
                        target_files,
                    });
                }
            }
        }

        None
    }

    /// Task merging every table into the bottom level
    pub fn select_major(&self, levels: &Levels) -> Option<CompactionTask> {
        let files: Vec<Arc<SSTableReader>> = levels.iter().flatten().cloned().collect();
        if files.is_empty() {
            return None;
        }
        Some(CompactionTask::Major {
            files,
            target_level: levels.len() - 1,
        })
    }

    /// Execute a compaction task, writing the merged output tables.
    ///
    /// `levels` is the version the task was picked from; it tells which
    /// deeper tables may still hold older versions of a key. Versions newer
    /// than `oldest_snapshot` are kept; of the rest only the newest survives.
    pub fn execute<F>(
        &self,
        task: &CompactionTask,
        levels: &Levels,
        oldest_snapshot: SeqNum,
        mut next_table_id: F,
    ) -> Result<Vec<SSTableMeta>>
    where
        F: FnMut() -> u64,
    {
        info!("Compacting {}", task.describe());

        let sources: Vec<RecordSource> = task
            .inputs()
            .iter()
            .map(|t| Box::new(t.iter(KeyRange::full())) as RecordSource)
            .collect();
        let merged = MergeIterator::new(sources);

        let target_level = task.target_level();
        let deeper: Vec<(Key, Key)> = levels
            .iter()
            .skip(target_level + 1)
            .flatten()
            .map(|t| (t.meta().min_key, t.meta().max_key))
            .collect();
        let mut retention = Retention::new(oldest_snapshot, deeper);

        let mut outputs = Vec::new();
        let mut builder: Option<SSTableBuilder> = None;
        let mut dropped = 0u64;

        for record in merged {
            let record = record?;
            if !retention.keep(&record) {
                dropped += 1;
                continue;
            }

            // cut only between keys so output tables never overlap
            let cut = builder.as_ref().map_or(false, |b| {
                b.estimated_size() >= self.config.target_file_size
                    && b.last_key() != Some(record.key)
            });
            if cut {
                if let Some(b) = builder.take() {
                    outputs.push(b.finish()?);
                }
            }

            if builder.is_none() {
                builder = Some(SSTableBuilder::new(
                    &self.data_dir,
                    next_table_id(),
                    self.config.sstable_config.clone(),
                )?);
            }
            if let Some(b) = builder.as_mut() {
                b.add(&record)?;
            }
        }

        if let Some(b) = builder.take() {
            outputs.push(b.finish()?);
        }

        info!(
            "Compaction into L{} wrote {} tables, dropped {} obsolete records",
            target_level,
            outputs.len(),
            dropped
        );
        Ok(outputs)
    }

    fn target_size_for_level(&self, level: usize) -> u64 {
        // deep levels saturate rather than overflow
        let exponent = u32::try_from(level.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config
            .level_size_multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.config.base_level_size.checked_mul(factor))
            .unwrap_or(u64::MAX)
    }

    fn pick_file_to_compact(level: &[Arc<SSTableReader>]) -> Option<Arc<SSTableReader>> {
        // Simple strategy: pick oldest file
        level.iter().min_by_key(|t| t.id()).cloned()
    }

    fn find_overlapping(level: &[Arc<SSTableReader>], min: Key, max: Key) -> Vec<Arc<SSTableReader>> {
        level
            .iter()
            .filter(|f| f.meta().max_key >= min && f.meta().min_key <= max)
            .cloned()
            .collect()
    }
}

/// Decides which versions of a key survive a compaction
struct Retention {
    oldest_snapshot: SeqNum,
    deeper: Vec<(Key, Key)>,
    current_key: Option<Key>,
    /// A version at or below the oldest snapshot was already emitted
    settled: bool,
}

impl Retention {
    fn new(oldest_snapshot: SeqNum, deeper: Vec<(Key, Key)>) -> Self {
        Self {
            oldest_snapshot,
            deeper,
            current_key: None,
            settled: false,
        }
    }

    /// Records must arrive in `(key asc, seq desc)` order
    fn keep(&mut self, record: &Record) -> bool {
        if self.current_key != Some(record.key) {
            self.current_key = Some(record.key);
            self.settled = false;
        }
        if record.seq > self.oldest_snapshot {
            return true;
        }
        if self.settled {
            return false;
        }
        self.settled = true;

        if record.is_tombstone() {
            let shadowed = self
                .deeper
                .iter()
                .any(|(min, max)| record.key >= *min && record.key <= *max);
            if !shadowed {
                debug!("Dropping tombstone for key {} at seq {}", record.key, record.seq);
            }
            return shadowed;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BlockCache, FileCache};
    use crate::compression::Compression;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        blocks: Arc<BlockCache>,
        files: Arc<FileCache>,
        next_id: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                blocks: Arc::new(BlockCache::new(1 << 20)),
                files: Arc::new(FileCache::new(16)),
                next_id: 1,
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn table(&mut self, records: &[Record]) -> Arc<SSTableReader> {
            let id = self.next_id;
            self.next_id += 1;
            let mut builder =
                SSTableBuilder::new(self.dir.path(), id, SSTableConfig::default()).unwrap();
            for r in records {
                builder.add(r).unwrap();
            }
            let meta = builder.finish().unwrap();
            Arc::new(
                SSTableReader::open(meta.path, id, self.blocks.clone(), self.files.clone())
                    .unwrap(),
            )
        }

        fn open(&self, meta: &SSTableMeta) -> Arc<SSTableReader> {
            Arc::new(
                SSTableReader::open(meta.path.clone(), meta.id, self.blocks.clone(), self.files.clone())
                    .unwrap(),
            )
        }
    }

    fn scheduler(dir: &Path, target_file_size: u64) -> CompactionScheduler {
        CompactionScheduler::new(
            dir.to_path_buf(),
            CompactionConfig {
                l0_file_trigger: 2,
                target_file_size,
                max_levels: 4,
                sstable_config: SSTableConfig {
                    compression: Compression::None,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn versions(tables: &[Arc<SSTableReader>]) -> Vec<(Key, SeqNum, bool)> {
        let sources = tables
            .iter()
            .map(|t| Box::new(t.iter(KeyRange::full())) as RecordSource)
            .collect();
        MergeIterator::new(sources)
            .map(|r| r.unwrap())
            .map(|r| (r.key, r.seq, r.is_tombstone()))
            .collect()
    }

    #[test]
    fn test_select_l0_compaction() {
        let mut fx = Fixture::new();
        let a = fx.table(&[Record::put(1, 1, "a"), Record::put(5, 2, "b")]);
        let b = fx.table(&[Record::put(3, 3, "c")]);
        let l1_hit = fx.table(&[Record::put(4, 0, "old")]);
        let l1_miss = fx.table(&[Record::put(50, 0, "far")]);
        let levels = vec![vec![b, a], vec![l1_hit, l1_miss], vec![], vec![]];

        let sched = scheduler(fx.path(), 1 << 20);
        match sched.select_compaction(&levels) {
            Some(CompactionTask::L0ToL1 { l0_files, l1_files }) => {
                assert_eq!(l0_files.len(), 2);
                assert_eq!(l1_files.len(), 1);
                assert_eq!(l1_files[0].meta().min_key, 4);
            }
            other => panic!("unexpected task {:?}", other),
        }

        let quiet = vec![vec![], vec![], vec![], vec![]];
        assert!(sched.select_compaction(&quiet).is_none());
        assert!(sched.select_major(&quiet).is_none());
    }

    #[test]
    fn test_deepest_levels_saturate_target_size() {
        let fx = Fixture::new();
        let config = crate::StorageConfig {
            max_levels: 16,
            ..Default::default()
        };
        config.validate().unwrap();
        let sched = CompactionScheduler::new(fx.path().to_path_buf(), config.compaction_config());

        assert!(sched.select_compaction(&vec![Vec::new(); 16]).is_none());
        assert_eq!(sched.target_size_for_level(1), config.compaction_config().base_level_size);
        assert_eq!(sched.target_size_for_level(15), u64::MAX);
    }

    #[test]
    fn test_compaction_keeps_newest_and_drops_tombstones() {
        let mut fx = Fixture::new();
        let newer = fx.table(&[Record::put(1, 10, "new"), Record::tombstone(2, 11)]);
        let older = fx.table(&[
            Record::put(1, 3, "old"),
            Record::put(2, 4, "gone"),
            Record::put(3, 5, "kept"),
        ]);
        let levels = vec![vec![newer.clone(), older.clone()], vec![], vec![], vec![]];

        let sched = scheduler(fx.path(), 1 << 20);
        let task = sched.select_compaction(&levels).unwrap();
        let mut id = 100;
        let outputs = sched
            .execute(&task, &levels, 20, || {
                id += 1;
                id
            })
            .unwrap();

        assert_eq!(outputs.len(), 1);
        let out = fx.open(&outputs[0]);
        assert_eq!(versions(&[out]), vec![(1, 10, false), (3, 5, false)]);
    }

    #[test]
    fn test_compaction_respects_snapshots() {
        let mut fx = Fixture::new();
        let table = fx.table(&[
            Record::put(1, 9, "v9"),
            Record::put(1, 6, "v6"),
            Record::put(1, 4, "v4"),
            Record::put(1, 2, "v2"),
            Record::tombstone(2, 8),
            Record::put(2, 1, "w1"),
        ]);
        let levels = vec![vec![], vec![table.clone()], vec![], vec![]];
        let task = CompactionTask::LevelToLevel {
            source_level: 1,
            source_files: vec![table],
            target_level: 2,
            target_files: vec![],
        };

        let sched = scheduler(fx.path(), 1 << 20);
        let mut id = 100;
        let outputs = sched
            .execute(&task, &levels, 5, || {
                id += 1;
                id
            })
            .unwrap();
        let out = fx.open(&outputs[0]);

        // above the snapshot everything stays; at or below it only the newest
        assert_eq!(
            versions(&[out]),
            vec![(1, 9, false), (1, 6, false), (1, 4, false), (2, 8, true), (2, 1, false)]
        );
    }

    #[test]
    fn test_tombstone_kept_when_deeper_level_overlaps() {
        let mut fx = Fixture::new();
        let l1 = fx.table(&[Record::tombstone(7, 9)]);
        let l3 = fx.table(&[Record::put(7, 1, "ancient")]);
        let levels = vec![vec![], vec![l1.clone()], vec![], vec![l3]];
        let task = CompactionTask::LevelToLevel {
            source_level: 1,
            source_files: vec![l1],
            target_level: 2,
            target_files: vec![],
        };

        let sched = scheduler(fx.path(), 1 << 20);
        let outputs = sched.execute(&task, &levels, 100, || 50).unwrap();
        assert_eq!(versions(&[fx.open(&outputs[0])]), vec![(7, 9, true)]);
    }

    #[test]
    fn test_outputs_split_on_key_boundaries() {
        let mut fx = Fixture::new();
        let records: Vec<Record> = (0..2000)
            .map(|k: Key| Record::put(k, k as u64 + 1, vec![b'v'; 64]))
            .collect();
        let big = fx.table(&records);
        let levels = vec![vec![], vec![], vec![], vec![big]];

        let sched = scheduler(fx.path(), 16 * 1024);
        let task = sched.select_major(&levels).unwrap();
        let mut id = 100;
        let outputs = sched
            .execute(&task, &levels, u64::MAX, || {
                id += 1;
                id
            })
            .unwrap();

        assert!(outputs.len() > 1);
        for pair in outputs.windows(2) {
            assert!(pair[0].max_key < pair[1].min_key);
        }
        let total: u64 = outputs.iter().map(|m| m.entry_count).sum();
        assert_eq!(total, 2000);
    }
}
