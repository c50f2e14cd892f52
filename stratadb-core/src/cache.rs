//! Bounded LRU caches shared by all open tables
//!
//! [`LruCache`] is an index-linked LRU list over a slab: nodes live in a
//! `Vec`, links are slot indices and a hash map points keys at their slot.
//! Every operation is O(1). Capacity is counted in caller supplied weight
//! units, so the same structure bounds decoded blocks by bytes and open
//! files by count.

use crate::error::IoContext;
use crate::sstable::Block;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    weight: usize,
    prev: usize,
    next: usize,
}

/// Weighted least-recently-used cache
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used
    head: usize,
    /// Least recently used
    tail: usize,
    weight: usize,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` weight units
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            weight: 0,
            capacity,
        }
    }

    /// Look up a key and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|n| &n.value)
    }

    /// Check for a key without touching recency
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or replace an entry, evicting least recently used entries until
    /// the total weight fits. Returns false if the entry alone exceeds
    /// capacity; it is not stored.
    pub fn insert(&mut self, key: K, value: V, weight: usize) -> bool {
        self.remove(&key);
        if weight > self.capacity {
            return false;
        }

        while self.weight + weight > self.capacity && self.tail != NIL {
            let lru = self.tail;
            self.remove_slot(lru);
        }

        let node = Node {
            key: key.clone(),
            value,
            weight,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key, idx);
        self.weight += weight;
        true
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        self.remove_slot(idx)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total weight of cached entries
    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn remove_slot(&mut self, idx: usize) -> Option<V> {
        self.detach(idx);
        let node = self.slots[idx].take()?;
        self.map.remove(&node.key);
        self.free.push(idx);
        self.weight -= node.weight;
        Some(node.value)
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match &self.slots[idx] {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            NIL => self.head = next,
            p => self.set_next(p, next),
        }
        match next {
            NIL => self.tail = prev,
            n => self.set_prev(n, prev),
        }
        self.set_prev(idx, NIL);
        self.set_next(idx, NIL);
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        self.set_prev(idx, NIL);
        self.set_next(idx, old_head);
        if old_head != NIL {
            self.set_prev(old_head, idx);
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    // linked indices always point at occupied slots
    fn set_prev(&mut self, idx: usize, prev: usize) {
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: usize) {
        if let Some(node) = self.slots[idx].as_mut() {
            node.next = next;
        }
    }
}

/// Cache key: (table id, block index)
pub type BlockKey = (u64, usize);

/// Shared cache of decoded data blocks, bounded by decoded bytes
pub struct BlockCache {
    inner: Mutex<LruCache<BlockKey, Arc<Block>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a cache of `capacity` bytes; zero disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached block or load, admit and return it.
    ///
    /// The loader runs without holding the cache lock.
    pub fn get_or_load<F>(&self, table_id: u64, block_idx: usize, loader: F) -> Result<Arc<Block>>
    where
        F: FnOnce() -> Result<Arc<Block>>,
    {
        let key = (table_id, block_idx);
        if let Some(block) = self.inner.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(block));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let block = loader()?;
        let weight = block.size().max(1);
        self.inner.lock().insert(key, Arc::clone(&block), weight);
        Ok(block)
    }

    /// Drop one block
    pub fn evict(&self, table_id: u64, block_idx: usize) {
        self.inner.lock().remove(&(table_id, block_idx));
    }

    /// Drop every block of a table with `block_count` blocks
    pub fn evict_table(&self, table_id: u64, block_count: usize) {
        let mut inner = self.inner.lock();
        for idx in 0..block_count {
            inner.remove(&(table_id, idx));
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Bytes currently cached
    pub fn usage(&self) -> usize {
        self.inner.lock().weight()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }
}

/// Shared handle to an open table file
pub type FileHandle = Arc<Mutex<File>>;

/// LRU of open table files bounded by a maximum handle count.
///
/// Evicted handles close once no in-flight read holds them.
pub struct FileCache {
    inner: Mutex<LruCache<u64, FileHandle>>,
    opened: AtomicU64,
}

impl FileCache {
    pub fn new(max_open_files: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(max_open_files.max(1))),
            opened: AtomicU64::new(0),
        }
    }

    /// Handle for table `id`, opening `path` if it is not cached
    pub fn get(&self, id: u64, path: &Path) -> Result<FileHandle> {
        if let Some(handle) = self.inner.lock().get(&id) {
            return Ok(Arc::clone(handle));
        }

        let file = File::open(path).context(|| format!("open table {:?}", path))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        trace!("Opened table file {:?}", path);

        let handle = Arc::new(Mutex::new(file));
        self.inner.lock().insert(id, Arc::clone(&handle), 1);
        Ok(handle)
    }

    /// Close the cached handle of a table
    pub fn evict(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    /// Handles currently open through the cache
    pub fn open_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total opens performed, including reopens after eviction
    pub fn total_opens(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}
