//! Tensor buffer cache: page-aligned staging buffers under a strict LRU budget.
//!
//! Buffers are keyed by [`CacheKey`] and owned by the cache. Callers never get
//! the buffer itself; they get a [`BufferLease`] that pins the entry until it
//! is dropped. Eviction (explicit, LRU, or budget-driven) skips pinned entries,
//! so a buffer another thread is still reading or filling is never reclaimed
//! underneath it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::lru::LruIndex;
use crate::cache::stats::{Budget, CacheKey, CacheStats};
use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum TensorCacheError {
    #[error("Zero-length allocation requested for {key}")]
    ZeroSize { key: CacheKey },

    #[error("{key} is cached with {cached} bytes but {requested} bytes were requested")]
    SizeMismatch {
        key: CacheKey,
        cached: usize,
        requested: usize,
    },

    #[error("Cannot fit {requested} bytes for {key}: budget {budget}, {pinned} bytes pinned")]
    OutOfBudget {
        key: CacheKey,
        requested: usize,
        budget: usize,
        pinned: usize,
    },

    #[error("Failed to map {size} bytes for {key}: {source}")]
    AllocationFailed {
        key: CacheKey,
        size: usize,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for TensorCacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            TensorCacheError::ZeroSize { .. } | TensorCacheError::SizeMismatch { .. } => {
                ErrorKind::InvalidInput
            }
            TensorCacheError::OutOfBudget { .. } | TensorCacheError::AllocationFailed { .. } => {
                ErrorKind::OutOfBudget
            }
        }
    }
}

/// A page-aligned, zero-initialised byte buffer.
///
/// Backed by an anonymous mapping, which always starts on a page boundary,
/// so the buffer can be the target of direct-I/O reads.
#[derive(Debug)]
pub struct TensorBuffer {
    map: MmapMut,
}

impl TensorBuffer {
    fn new(size: usize) -> std::io::Result<Self> {
        Ok(Self {
            map: MmapMut::map_anon(size)?,
        })
    }
}

impl Deref for TensorBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl DerefMut for TensorBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

type SharedBuffer = Arc<RwLock<TensorBuffer>>;

/// A pinned borrow of a cached buffer.
///
/// While any lease for a key is alive the entry cannot be evicted.
/// Dropping the lease (or calling [`BufferLease::release`]) unpins it.
#[derive(Debug, Clone)]
pub struct BufferLease {
    key: CacheKey,
    size: usize,
    buffer: SharedBuffer,
}

impl BufferLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Shared access to the bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, TensorBuffer> {
        self.buffer.read()
    }

    /// Exclusive access to the bytes, e.g. to fill a freshly allocated slot.
    pub fn write(&self) -> RwLockWriteGuard<'_, TensorBuffer> {
        self.buffer.write()
    }

    /// Unpin the entry.
    pub fn release(self) {}
}

/// Snapshot of one entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub size: usize,
    /// Logical clock value of the last touch; higher is more recent.
    pub last_access: u64,
    pub access_count: u64,
    pub pinned: bool,
}

#[derive(Debug)]
struct Entry {
    buffer: SharedBuffer,
    size: usize,
    last_access: u64,
    access_count: u64,
}

impl Entry {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.buffer) > 1
    }
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    lru: LruIndex<CacheKey>,
    budget: Budget,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    loads: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lease(&mut self, key: &CacheKey) -> Option<BufferLease> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        entry.access_count += 1;
        let lease = BufferLease {
            key: key.clone(),
            size: entry.size,
            buffer: entry.buffer.clone(),
        };
        self.lru.touch(key);
        Some(lease)
    }

    fn pinned_bytes(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.is_pinned())
            .map(|e| e.size)
            .sum()
    }

    /// Remove an entry that is known to be present and unpinned.
    fn remove(&mut self, key: &CacheKey) -> usize {
        let Some(entry) = self.entries.remove(key) else {
            return 0;
        };
        self.lru.remove(key);
        self.budget.release(entry.size);
        self.evictions += 1;
        debug!(
            key = %key,
            size = entry.size,
            accesses = entry.access_count,
            used = self.budget.used_bytes,
            "Evicted tensor buffer"
        );
        entry.size
    }

    /// Least recently used key that is not pinned.
    fn oldest_unpinned(&self) -> Option<CacheKey> {
        self.lru
            .iter()
            .find(|key| self.entries.get(*key).is_some_and(|e| !e.is_pinned()))
            .cloned()
    }

    fn evict_lru(&mut self) -> usize {
        match self.oldest_unpinned() {
            Some(key) => self.remove(&key),
            None => 0,
        }
    }

    fn evict_until_free(&mut self, required: usize) -> bool {
        while self.budget.available() < required {
            if self.evict_lru() == 0 {
                break;
            }
        }
        self.budget.available() >= required
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            loads: self.loads,
            entries: self.entries.len(),
            used_bytes: self.budget.used_bytes,
            budget_bytes: self.budget.max_bytes,
        }
    }

    fn check_invariants(&self) {
        debug_assert_eq!(self.entries.len(), self.lru.len());
        debug_assert!(self.lru.iter().all(|k| self.entries.contains_key(k)));
        debug_assert!(self.budget.used_bytes <= self.budget.max_bytes);
        debug_assert_eq!(
            self.budget.used_bytes,
            self.entries.values().map(|e| e.size).sum::<usize>()
        );
    }
}

/// Budgeted cache of page-aligned tensor buffers.
pub struct TensorCache {
    inner: Mutex<Inner>,
}

impl TensorCache {
    /// Create a cache that holds at most `budget_bytes`.
    pub fn new(budget_bytes: usize) -> Self {
        info!(
            budget_mb = budget_bytes as f64 / (1024.0 * 1024.0),
            "Tensor cache initialized"
        );
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruIndex::new(),
                budget: Budget::new(budget_bytes),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                loads: 0,
            }),
        }
    }

    /// Return the buffer for `key`, allocating it if absent.
    ///
    /// On a hit the size must match the cached size. On a miss, unpinned
    /// least-recently-used entries are evicted until `size` fits; if that is
    /// impossible the call fails before evicting anything.
    pub fn allocate_or_get(
        &self,
        key: &CacheKey,
        size: usize,
    ) -> Result<BufferLease, TensorCacheError> {
        if size == 0 {
            return Err(TensorCacheError::ZeroSize { key: key.clone() });
        }

        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(key) {
            if entry.size != size {
                return Err(TensorCacheError::SizeMismatch {
                    key: key.clone(),
                    cached: entry.size,
                    requested: size,
                });
            }
            inner.hits += 1;
            if let Some(lease) = inner.lease(key) {
                return Ok(lease);
            }
        }

        inner.misses += 1;

        let pinned = inner.pinned_bytes();
        let reachable = inner.budget.max_bytes.saturating_sub(pinned);
        if size > reachable {
            warn!(
                key = %key,
                size,
                budget = inner.budget.max_bytes,
                pinned,
                "Tensor does not fit even after full eviction"
            );
            return Err(TensorCacheError::OutOfBudget {
                key: key.clone(),
                requested: size,
                budget: inner.budget.max_bytes,
                pinned,
            });
        }

        if !inner.budget.fits(size) && !inner.evict_until_free(size) {
            // Unreachable given the pinned-bytes pre-check, but the budget
            // must never be exceeded.
            inner.check_invariants();
            return Err(TensorCacheError::OutOfBudget {
                key: key.clone(),
                requested: size,
                budget: inner.budget.max_bytes,
                pinned,
            });
        }

        let buffer = TensorBuffer::new(size).map_err(|source| {
            TensorCacheError::AllocationFailed {
                key: key.clone(),
                size,
                source,
            }
        })?;

        let buffer = Arc::new(RwLock::new(buffer));
        let lease = BufferLease {
            key: key.clone(),
            size,
            buffer: buffer.clone(),
        };

        let now = inner.tick();
        inner.entries.insert(
            key.clone(),
            Entry {
                buffer,
                size,
                last_access: now,
                access_count: 1,
            },
        );
        inner.lru.insert(key.clone());
        inner.budget.charge(size);
        inner.loads += 1;

        debug!(
            key = %key,
            size,
            used = inner.budget.used_bytes,
            budget = inner.budget.max_bytes,
            "Allocated tensor buffer"
        );

        inner.check_invariants();
        Ok(lease)
    }

    /// Lease an existing buffer without allocating. Counts a hit or a miss.
    pub fn get(&self, key: &CacheKey) -> Option<BufferLease> {
        let mut inner = self.inner.lock();
        match inner.lease(key) {
            Some(lease) => {
                inner.hits += 1;
                Some(lease)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Remove `key`. Returns false if it is absent or currently leased.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let pinned = match inner.entries.get(key) {
            Some(entry) => entry.is_pinned(),
            None => return false,
        };
        if pinned {
            warn!(key = %key, "Refusing to evict leased tensor buffer");
            return false;
        }
        inner.remove(key);
        inner.check_invariants();
        true
    }

    /// Remove the least recently used unpinned entry. Returns bytes freed.
    pub fn evict_lru(&self) -> usize {
        let mut inner = self.inner.lock();
        let freed = inner.evict_lru();
        inner.check_invariants();
        freed
    }

    /// Evict unpinned entries until `required_bytes` are free.
    pub fn evict_until_free(&self, required_bytes: usize) -> bool {
        let mut inner = self.inner.lock();
        let ok = inner.evict_until_free(required_bytes);
        inner.check_invariants();
        ok
    }

    /// Drop every unpinned entry. Returns the number of leased entries kept.
    ///
    /// Leased buffers stay cached and charged to the budget until their last
    /// lease is dropped and they are evicted normally.
    pub fn clear_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let unpinned: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|key| inner.entries.get(*key).is_some_and(|e| !e.is_pinned()))
            .cloned()
            .collect();
        let kept = inner.entries.len() - unpinned.len();
        info!(
            entries = inner.entries.len(),
            used_mb = inner.budget.used_bytes as f64 / (1024.0 * 1024.0),
            leased = kept,
            "Clearing tensor cache"
        );
        for key in &unpinned {
            inner.remove(key);
        }
        inner.check_invariants();
        kept
    }

    pub fn cached_keys(&self) -> Vec<CacheKey> {
        self.inner.lock().lru.iter().cloned().collect()
    }

    /// Size of a cached entry, or None if absent.
    pub fn entry_size(&self, key: &CacheKey) -> Option<usize> {
        self.inner.lock().entries.get(key).map(|e| e.size)
    }

    /// Bookkeeping for a cached entry, or None if absent.
    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.inner.lock().entries.get(key).map(|e| EntryInfo {
            size: e.size,
            last_access: e.last_access,
            access_count: e.access_count,
            pinned: e.is_pinned(),
        })
    }

    /// Whether a live lease currently pins `key`.
    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.is_pinned())
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().budget.used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.inner.lock().budget.max_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn utilization(&self) -> f64 {
        self.inner.lock().budget.utilization()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }
}

impl Drop for TensorCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let stats = inner.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = stats.hit_rate(),
            evictions = stats.evictions,
            "Tensor cache shutdown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new("model", name)
    }

    #[test]
    fn test_eviction_under_pressure() {
        let cache = TensorCache::new(100);
        cache.allocate_or_get(&key("a"), 40).unwrap();
        cache.allocate_or_get(&key("b"), 40).unwrap();
        cache.allocate_or_get(&key("c"), 40).unwrap();

        assert!(!cache.is_cached(&key("a")));
        assert!(cache.is_cached(&key("b")));
        assert!(cache.is_cached(&key("c")));
        assert_eq!(cache.used_bytes(), 80);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_hit_returns_same_buffer() {
        let cache = TensorCache::new(4096);
        let first = cache.allocate_or_get(&key("a"), 16).unwrap();
        first.write()[..4].copy_from_slice(&[1, 2, 3, 4]);
        drop(first);

        let second = cache.allocate_or_get(&key("a"), 16).unwrap();
        assert_eq!(&second.read()[..4], &[1, 2, 3, 4]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
    }

    #[test]
    fn test_hit_with_wrong_size_is_rejected() {
        let cache = TensorCache::new(4096);
        cache.allocate_or_get(&key("a"), 16).unwrap();
        let err = cache.allocate_or_get(&key("a"), 32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(cache.entry_size(&key("a")), Some(16));
    }

    #[test]
    fn test_zero_size_rejected() {
        let cache = TensorCache::new(4096);
        let err = cache.allocate_or_get(&key("a"), 0).unwrap_err();
        assert!(matches!(err, TensorCacheError::ZeroSize { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oversized_request_leaves_cache_untouched() {
        let cache = TensorCache::new(100);
        cache.allocate_or_get(&key("a"), 50).unwrap();

        let err = cache.allocate_or_get(&key("big"), 101).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBudget);
        assert!(cache.is_cached(&key("a")));
        assert_eq!(cache.used_bytes(), 50);
    }

    #[test]
    fn test_buffers_are_page_aligned() {
        let cache = TensorCache::new(1 << 20);
        let lease = cache.allocate_or_get(&key("a"), 1000).unwrap();
        let ptr = lease.read().as_ptr() as usize;
        assert_eq!(ptr % 4096, 0);
        assert!(lease.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_leased_entry_survives_eviction() {
        let cache = TensorCache::new(100);
        let pinned = cache.allocate_or_get(&key("a"), 40).unwrap();
        cache.allocate_or_get(&key("b"), 40).unwrap();

        // "a" is older but leased, so "b" goes instead.
        cache.allocate_or_get(&key("c"), 40).unwrap();
        assert!(cache.is_cached(&key("a")));
        assert!(!cache.is_cached(&key("b")));

        assert!(!cache.evict(&key("a")));
        pinned.release();
        assert!(cache.evict(&key("a")));
    }

    #[test]
    fn test_out_of_budget_when_everything_pinned() {
        let cache = TensorCache::new(100);
        let _a = cache.allocate_or_get(&key("a"), 60).unwrap();
        let err = cache.allocate_or_get(&key("b"), 50).unwrap_err();
        assert!(matches!(err, TensorCacheError::OutOfBudget { pinned: 60, .. }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_lru_order() {
        let cache = TensorCache::new(1000);
        for name in ["a", "b", "c"] {
            cache.allocate_or_get(&key(name), 10).unwrap();
        }
        // Touch "a" so "b" becomes oldest.
        cache.get(&key("a")).unwrap();

        assert_eq!(cache.evict_lru(), 10);
        assert!(!cache.is_cached(&key("b")));
        assert_eq!(cache.evict_lru(), 10);
        assert!(!cache.is_cached(&key("c")));
        assert_eq!(cache.evict_lru(), 10);
        assert_eq!(cache.evict_lru(), 0);
    }

    #[test]
    fn test_clear_all_keeps_leased_entries() {
        let cache = TensorCache::new(1000);
        let lease = cache.allocate_or_get(&key("a"), 8).unwrap();
        lease.write()[0] = 7;
        cache.allocate_or_get(&key("b"), 8).unwrap();

        assert_eq!(cache.clear_all(), 1);
        assert!(cache.is_cached(&key("a")));
        assert!(!cache.is_cached(&key("b")));
        assert_eq!(cache.used_bytes(), 8);
        assert_eq!(lease.read()[0], 7);

        drop(lease);
        assert_eq!(cache.clear_all(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_clear_all_never_duplicates_a_leased_key() {
        let cache = TensorCache::new(100);
        let old = cache.allocate_or_get(&key("a"), 60).unwrap();
        old.write()[0] = 1;
        cache.clear_all();

        let again = cache.allocate_or_get(&key("a"), 60).unwrap();
        assert_eq!(again.read()[0], 1);
        assert!(Arc::ptr_eq(&old.buffer, &again.buffer));

        // The leased 60 bytes still count, so 50 more cannot fit.
        let err = cache.allocate_or_get(&key("b"), 50).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBudget);
        assert_eq!(cache.used_bytes(), 60);
    }

    #[test]
    fn test_entry_info_tracks_access() {
        let cache = TensorCache::new(1000);
        cache.allocate_or_get(&key("a"), 8).unwrap();
        let before = cache.entry_info(&key("a")).unwrap();
        assert_eq!(before.access_count, 1);

        let lease = cache.get(&key("a")).unwrap();
        let after = cache.entry_info(&key("a")).unwrap();
        assert_eq!(after.access_count, 2);
        assert!(after.last_access > before.last_access);
        assert!(after.pinned);
        drop(lease);
        assert!(!cache.is_pinned(&key("a")));
    }

    #[test]
    fn test_get_counts_miss() {
        let cache = TensorCache::new(1000);
        assert!(cache.get(&key("nope")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }
}
