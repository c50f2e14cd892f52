//! Database - a single embedded StrataDB instance
//!
//! Write path: WAL append, memtable insert, then publication of the sequence
//! number (the commit point). A full memtable is frozen, the WAL is rotated
//! so the frozen memtable owns a closed run of segments, and a background
//! worker flushes it to an L0 table and runs compactions.
//!
//! Read path: a read captures the current [`Version`] and the last
//! published sequence and merges every source through the read iterators.

use super::version::{SnapshotList, Version};
use super::StorageConfig;
use crate::cache::{BlockCache, FileCache};
use crate::compaction::{CompactionScheduler, CompactionTask};
use crate::error::IoContext;
use crate::iterator::{LiveIterator, MergeIterator};
use crate::manifest::{Manifest, ManifestData};
use crate::memtable::MemTable;
use crate::query::{QueryExecutor, QueryParams, QueryParser, QueryResponse, QueryResult, QueryStatus};
use crate::sstable::{table_path, SSTableBuilder, SSTableReader};
use crate::types::{Key, KeyRange, SeqNum};
use crate::wal::{WalEntry, WalReader, WalWriter};
use crate::{ErrorKind, Result, StrataError};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const WAL_DIR: &str = "wal";

/// Work for the background thread
enum Task {
    /// Flush frozen memtables, then compact
    Flush,
    /// Run compactions until no level needs one
    Compact,
    Shutdown,
}

/// A single StrataDB database
pub struct Database {
    inner: Arc<DbInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct DbInner {
    dir: PathBuf,
    config: StorageConfig,

    // Write path
    wal: WalWriter,
    /// Serializes writers and memtable freezes
    write_lock: Mutex<()>,
    /// Last committed sequence number
    last_seq: AtomicU64,
    next_memtable_id: AtomicU64,

    // Read path
    version: RwLock<Arc<Version>>,
    snapshots: SnapshotList,
    blocks: Arc<BlockCache>,
    files: Arc<FileCache>,

    // Structure: table-set changes happen under the manifest lock
    manifest: Mutex<Manifest>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    compactor: CompactionScheduler,

    tasks: Sender<Task>,
    closed: AtomicBool,
}

impl Database {
    /// Open or create the database in `path`.
    ///
    /// Loads the manifest, opens every live table, deletes orphaned files,
    /// replays the WAL from the manifest checkpoint and starts the
    /// background worker.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(|| format!("create data dir {:?}", dir))?;
        info!("Opening database in {:?}", dir);

        let mut manifest = Manifest::open(&dir)?;
        let removed = manifest.remove_orphans()?;
        if removed > 0 {
            info!("Removed {} orphaned files", removed);
        }

        let blocks = Arc::new(BlockCache::new(config.cache_size));
        let files = Arc::new(FileCache::new(config.max_open_files));
        let levels = Self::open_tables(&dir, &config, manifest.data(), &blocks, &files)?;

        // Replay before the writer opens its segment, so a torn tail is cut
        // while its segment is still the last one
        let wal_dir = dir.join(WAL_DIR);
        let checkpoint = manifest.data().wal_checkpoint;
        let replay = WalReader::new(&wal_dir).replay(checkpoint)?;
        let wal = WalWriter::open(&wal_dir, config.wal.clone(), checkpoint)?;

        let recovered_segment = if replay.entries.is_empty() {
            wal.current_segment()
        } else {
            checkpoint
        };
        let mem = MemTable::new(1, recovered_segment);
        let mut last_seq = manifest.data().last_sequence;
        let mut applied = 0usize;
        for entry in replay.entries {
            if entry.seq <= manifest.data().last_sequence {
                continue;
            }
            last_seq = last_seq.max(entry.seq);
            mem.apply(entry.into_record());
            applied += 1;
        }
        if applied > 0 || replay.truncated_bytes > 0 {
            info!(
                "Recovered {} WAL entries (last sequence {}, {} torn bytes discarded)",
                applied, last_seq, replay.truncated_bytes
            );
        }

        let mut data = manifest.data().clone();
        data.wal_checkpoint = mem.wal_segment();
        manifest.commit(data)?;

        let table_count: usize = levels.iter().map(Vec::len).sum();
        let (tasks, receiver) = crossbeam_channel::unbounded();
        let inner = Arc::new(DbInner {
            compactor: CompactionScheduler::new(dir.clone(), config.compaction_config()),
            dir,
            wal,
            write_lock: Mutex::new(()),
            last_seq: AtomicU64::new(last_seq),
            next_memtable_id: AtomicU64::new(2),
            version: RwLock::new(Arc::new(Version::new(Arc::new(mem), levels))),
            snapshots: SnapshotList::default(),
            blocks,
            files,
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            tasks,
            closed: AtomicBool::new(false),
            config,
        });

        let worker = Self::start_worker(Arc::clone(&inner), receiver)?;
        let db = Self {
            inner,
            worker: Mutex::new(Some(worker)),
        };

        {
            let _guard = db.inner.write_lock.lock();
            if db.inner.current().mem.should_flush(db.inner.config.memtable_size_limit) {
                db.inner.freeze_memtable()?;
            }
        }
        db.inner.schedule(Task::Compact);

        info!(
            "Database open: {} tables, last sequence {}",
            table_count, last_seq
        );
        Ok(db)
    }

    fn open_tables(
        dir: &Path,
        config: &StorageConfig,
        data: &ManifestData,
        blocks: &Arc<BlockCache>,
        files: &Arc<FileCache>,
    ) -> Result<Vec<Vec<Arc<SSTableReader>>>> {
        let mut levels: Vec<Vec<Arc<SSTableReader>>> = vec![Vec::new(); config.max_levels];
        for entry in &data.tables {
            if entry.level >= levels.len() {
                return Err(StrataError::Config(format!(
                    "Table {} is on level {} but max_levels is {}",
                    entry.id, entry.level, config.max_levels
                )));
            }
            let reader = SSTableReader::open(
                table_path(dir, entry.id),
                entry.id,
                Arc::clone(blocks),
                Arc::clone(files),
            )
            .map_err(|e| e.during("open", format!("table {}", entry.id)))?;
            levels[entry.level].push(Arc::new(reader));
        }

        levels[0].sort_by(|a, b| b.id().cmp(&a.id()));
        for level in levels.iter_mut().skip(1) {
            level.sort_by_key(|t| t.meta().min_key);
        }
        Ok(levels)
    }

    fn start_worker(inner: Arc<DbInner>, receiver: Receiver<Task>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("stratadb-background".to_owned())
            .spawn(move || {
                debug!("Background worker started");
                for task in receiver.iter() {
                    let result = match task {
                        Task::Flush => inner
                            .flush_immutables()
                            .and_then(|_| inner.compact_until_settled()),
                        Task::Compact => inner.compact_until_settled(),
                        Task::Shutdown => break,
                    };
                    if let Err(e) = result {
                        error!("Background task failed: {}", e);
                    }
                }
                debug!("Background worker stopped");
            })
            .context(|| "spawn background worker".to_string())
    }

    /// Data directory
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Insert or overwrite `key`
    pub fn put(&self, key: Key, value: impl Into<Bytes>) -> Result<()> {
        self.inner
            .write(key, Some(value.into()))
            .map_err(|e| e.during("put", format!("key {}", key)))
    }

    /// Current value of `key`, `None` if absent or deleted
    pub fn get(&self, key: Key) -> Result<Option<Bytes>> {
        self.inner.check_open()?;
        let (version, snapshot) = self.inner.read_view();
        version
            .get(key, snapshot)
            .map(|record| record.and_then(|r| r.value))
            .map_err(|e| e.during("get", format!("key {}", key)))
    }

    /// Delete `key`; deleting an absent key is not an error
    pub fn remove(&self, key: Key) -> Result<()> {
        self.inner
            .write(key, None)
            .map_err(|e| e.during("remove", format!("key {}", key)))
    }

    /// Live entries between `start` and `end` in key order; `end` is
    /// included when `inclusive` is set
    pub fn range(&self, start: Key, end: Key, inclusive: bool) -> Result<Vec<(Key, Bytes)>> {
        let scan = if inclusive {
            self.scan(start..=end)?
        } else {
            self.scan(start..end)?
        };
        scan.collect()
    }

    /// Lazy, snapshot-consistent scan; may be dropped at any point
    pub fn scan<R: RangeBounds<Key>>(&self, range: R) -> Result<Scan> {
        self.inner.check_open()?;
        let (version, snapshot) = self.inner.read_view();
        Ok(Scan::new(&version, KeyRange::from_bounds(range), snapshot))
    }

    /// Pin the current state for repeatable reads
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.check_open()?;
        let inner = &self.inner;
        let seq = inner
            .snapshots
            .acquire(|| inner.last_seq.load(Ordering::Acquire));
        Ok(Snapshot {
            inner: Arc::clone(&self.inner),
            seq,
        })
    }

    /// Run a predicate query (SELECT statement or bare predicate)
    pub fn query(&self, statement: &str, params: &QueryParams) -> Result<QueryResult> {
        let query = QueryParser::parse(statement, params)?;
        let scan = self.scan(query.range)?;
        QueryExecutor::execute(&query, scan)
    }

    /// Like [`query`](Self::query) but reports failures in the response
    /// status: parse failures are `Unsupported` with no results
    pub fn execute_query(&self, statement: &str, params: &QueryParams) -> QueryResponse {
        match self.query(statement, params) {
            Ok(result) => QueryResponse::ok(result),
            Err(e) if e.kind() == ErrorKind::QueryParse => {
                debug!("Unsupported query {:?}: {}", statement, e);
                QueryResponse::failed(QueryStatus::Unsupported, e.to_string())
            }
            Err(e) => {
                warn!("Query {:?} failed: {}", statement, e);
                QueryResponse::failed(QueryStatus::Error, e.to_string())
            }
        }
    }

    /// Force every acknowledged write to durable storage
    pub fn sync(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.wal.sync().map_err(|e| e.during("sync", "WAL"))
    }

    /// Freeze the active memtable and flush every frozen memtable now
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.flush_all().map_err(|e| e.during("flush", "memtables"))
    }

    /// Flush, then merge every table into the bottom level
    pub fn compact(&self) -> Result<()> {
        self.flush()?;
        self.inner
            .compact_major()
            .map_err(|e| e.during("compact", "all levels"))
    }

    pub fn stats(&self) -> DatabaseStats {
        let version = self.inner.current();
        DatabaseStats {
            memtable_size: version.mem.size(),
            memtable_entries: version.mem.len(),
            immutable_memtables: version.imm.len(),
            tables_per_level: version.levels.iter().map(Vec::len).collect(),
            total_entries: version.levels.iter().flatten().map(|t| t.meta().entry_count).sum(),
            total_size_bytes: version.levels.iter().flatten().map(|t| t.meta().file_size).sum(),
            cache_hits: self.inner.blocks.hits(),
            cache_misses: self.inner.blocks.misses(),
            cache_usage: self.inner.blocks.usage(),
            open_files: self.inner.files.open_count(),
            active_snapshots: self.inner.snapshots.len(),
            last_sequence: self.inner.last_seq.load(Ordering::Acquire),
            wal_segment: self.inner.wal.current_segment(),
        }
    }

    /// Flush the active memtable, stop the background worker and sync the
    /// WAL. Later calls are no-ops; other operations fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing database in {:?}", self.inner.dir);
        self.stop_worker();

        self.inner.flush_all()?;
        self.inner.wal.sync()?;
        info!("Database closed");
        Ok(())
    }

    fn stop_worker(&self) {
        self.inner.schedule(Task::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Background worker panicked");
            }
        }
    }

    /// Stop without flushing or syncing, leaving the directory as a crash
    /// would
    #[cfg(test)]
    pub(crate) fn abandon(self) {
        self.inner.closed.store(true, Ordering::Release);
        self.stop_worker();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close database: {}", e);
        }
    }
}

impl DbInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StrataError::Closed)
        } else {
            Ok(())
        }
    }

    fn current(&self) -> Arc<Version> {
        self.version.read().clone()
    }

    /// Version plus the last sequence committed into it.
    ///
    /// The version is captured first: every write it is missing belongs to
    /// a newer memtable, so the view is always a prefix of the write order.
    fn read_view(&self) -> (Arc<Version>, SeqNum) {
        let version = self.version.read();
        (Arc::clone(&*version), self.last_seq.load(Ordering::Acquire))
    }

    fn schedule(&self, task: Task) {
        // the worker only hangs up after Shutdown
        let _ = self.tasks.send(task);
    }

    fn write(&self, key: Key, value: Option<Bytes>) -> Result<()> {
        self.check_open()?;
        let _guard = self.write_lock.lock();

        let seq = self.last_seq.load(Ordering::Acquire) + 1;
        let entry = match value {
            Some(value) => WalEntry::put(seq, key, value),
            None => WalEntry::delete(seq, key),
        };
        self.wal.append(&entry)?;

        let mem = Arc::clone(&self.version.read().mem);
        mem.apply(entry.into_record());
        self.last_seq.store(seq, Ordering::Release);

        if mem.should_flush(self.config.memtable_size_limit) {
            self.freeze_memtable()?;
        }
        Ok(())
    }

    /// Swap in a fresh memtable; the caller holds `write_lock`
    fn freeze_memtable(&self) -> Result<()> {
        if self.current().mem.is_empty() {
            return Ok(());
        }
        let segment = self.wal.rotate()?;
        let id = self.next_memtable_id.fetch_add(1, Ordering::Relaxed);

        let pending = {
            let mut version = self.version.write();
            let mut next = (**version).clone();
            let frozen = std::mem::replace(&mut next.mem, Arc::new(MemTable::new(id, segment)));
            info!(
                "Froze memtable {} ({} entries, {} bytes)",
                frozen.id(),
                frozen.len(),
                frozen.size()
            );
            next.imm.insert(0, frozen);
            let pending = next.imm.len();
            *version = Arc::new(next);
            pending
        };

        if pending > self.config.max_immutable_memtables {
            debug!("{} frozen memtables pending, flushing inline", pending);
            self.flush_immutables()
        } else {
            self.schedule(Task::Flush);
            Ok(())
        }
    }

    fn flush_all(&self) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            self.freeze_memtable()?;
        }
        self.flush_immutables()
    }

    /// Flush frozen memtables to L0, oldest first
    fn flush_immutables(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        loop {
            let oldest = match self.current().imm.last() {
                Some(mem) => Arc::clone(mem),
                None => return Ok(()),
            };
            self.flush_memtable(&oldest)?;
        }
    }

    fn flush_memtable(&self, mem: &Arc<MemTable>) -> Result<()> {
        let id = self.manifest.lock().allocate_table_id();
        let mut builder = SSTableBuilder::new(&self.dir, id, self.config.sstable_config())?;
        for record in mem.iter(&KeyRange::full()) {
            builder.add(&record)?;
        }
        let meta = builder.finish()?;
        let reader = Arc::new(SSTableReader::open(
            meta.path.clone(),
            id,
            Arc::clone(&self.blocks),
            Arc::clone(&self.files),
        )?);

        let checkpoint = self.install(mem.max_seq(), |version| {
            version.imm.retain(|m| m.id() != mem.id());
            version.levels[0].insert(0, Arc::clone(&reader));
        })?;
        info!(
            "Flushed memtable {} to table {} ({} entries, {} bytes)",
            mem.id(),
            id,
            meta.entry_count,
            meta.file_size
        );

        self.wal.remove_segments_before(checkpoint)?;
        Ok(())
    }

    /// Apply `edit` to the current version, persist the resulting table set
    /// and publish it. Returns the new WAL checkpoint.
    ///
    /// The manifest lock serializes table-set changes; the version lock is
    /// held only for the swap, so readers never wait on the manifest fsync.
    /// A memtable freeze may land between the commit and the swap, which is
    /// why `edit` is re-applied to the version current at swap time.
    fn install<F>(&self, flushed_seq: SeqNum, edit: F) -> Result<u64>
    where
        F: Fn(&mut Version),
    {
        let mut manifest = self.manifest.lock();

        let mut next = (*self.current()).clone();
        edit(&mut next);
        let checkpoint = next.wal_checkpoint();
        let data = ManifestData {
            next_table_id: manifest.data().next_table_id,
            last_sequence: manifest.data().last_sequence.max(flushed_seq),
            wal_checkpoint: checkpoint,
            tables: next.table_entries(),
        };
        manifest.commit(data)?;

        let mut version = self.version.write();
        let mut next = (**version).clone();
        edit(&mut next);
        *version = Arc::new(next);
        Ok(checkpoint)
    }

    fn oldest_snapshot(&self) -> SeqNum {
        self.snapshots
            .oldest(|| self.last_seq.load(Ordering::Acquire))
    }

    fn compact_until_settled(&self) -> Result<()> {
        while !self.closed.load(Ordering::Acquire) {
            let _guard = self.compaction_lock.lock();
            let version = self.current();
            match self.compactor.select_compaction(&version.levels) {
                Some(task) => self.run_compaction(&task, &version)?,
                None => break,
            }
        }
        Ok(())
    }

    fn compact_major(&self) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        let version = self.current();
        match self.compactor.select_major(&version.levels) {
            Some(task) => self.run_compaction(&task, &version),
            None => Ok(()),
        }
    }

    /// Merge the task's inputs and swap the outputs in; the caller holds
    /// `compaction_lock`
    fn run_compaction(&self, task: &CompactionTask, version: &Version) -> Result<()> {
        let outputs = self.compactor.execute(
            task,
            &version.levels,
            self.oldest_snapshot(),
            || self.manifest.lock().allocate_table_id(),
        )?;
        let readers = outputs
            .iter()
            .map(|meta| {
                SSTableReader::open(
                    meta.path.clone(),
                    meta.id,
                    Arc::clone(&self.blocks),
                    Arc::clone(&self.files),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let input_ids: HashSet<u64> = task.input_ids().into_iter().collect();
        let target = task.target_level();
        self.install(0, |version| {
            for level in version.levels.iter_mut() {
                level.retain(|t| !input_ids.contains(&t.id()));
            }
            let level = &mut version.levels[target];
            level.extend(readers.iter().cloned());
            level.sort_by_key(|t| t.meta().min_key);
        })?;

        for table in task.inputs() {
            table.mark_obsolete();
        }
        debug!(
            "Installed compaction: removed {:?}, added {:?}",
            input_ids,
            readers.iter().map(|r| r.id()).collect::<Vec<_>>()
        );
        Ok(())
    }
}

/// Lazy range scan over a consistent view.
///
/// Holds its memtables and tables alive; dropping it mid-way has no side
/// effects.
pub struct Scan {
    inner: LiveIterator,
    range: KeyRange,
    failed: bool,
}

impl Scan {
    fn new(version: &Version, range: KeyRange, snapshot: SeqNum) -> Self {
        let merge = MergeIterator::new(version.sources(range));
        Self {
            inner: LiveIterator::new(merge, snapshot),
            range,
            failed: false,
        }
    }
}

impl Iterator for Scan {
    type Item = Result<(Key, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.failed = true;
                Some(Err(e.during("scan", self.range)))
            }
        }
    }
}

/// Repeatable-read view pinned at a sequence number.
///
/// Compaction keeps every version a live snapshot can see.
pub struct Snapshot {
    inner: Arc<DbInner>,
    seq: SeqNum,
}

impl Snapshot {
    /// Sequence number this snapshot reads at
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn get(&self, key: Key) -> Result<Option<Bytes>> {
        self.inner.check_open()?;
        self.inner
            .current()
            .get(key, self.seq)
            .map(|record| record.and_then(|r| r.value))
            .map_err(|e| e.during("get", format!("key {} at snapshot {}", key, self.seq)))
    }

    pub fn scan<R: RangeBounds<Key>>(&self, range: R) -> Result<Scan> {
        self.inner.check_open()?;
        Ok(Scan::new(
            &self.inner.current(),
            KeyRange::from_bounds(range),
            self.seq,
        ))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.snapshots.release(self.seq);
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub memtable_size: usize,
    pub memtable_entries: usize,
    pub immutable_memtables: usize,
    pub tables_per_level: Vec<usize>,
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_usage: usize,
    pub open_files: usize,
    pub active_snapshots: usize,
    pub last_sequence: SeqNum,
    pub wal_segment: u64,
}
