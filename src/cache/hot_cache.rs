//! Hot RAM tier: owned copies of frequently read tensors.
//!
//! The hot tier only swaps data in when told to. A read miss hands back the
//! caller's fallback (the slower primary location) and never populates the
//! cache; [`HotCache::prefetch`] is the only way in. Deciding what deserves a
//! hot copy belongs upstream.
//!
//! Cached payloads are `Arc<[f32]>`, so a reader keeps its copy alive even if
//! the entry is evicted a moment later.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use half::f16;
use half::slice::HalfFloatSliceExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::lru::LruIndex;
use crate::cache::stats::{Budget, CacheKey, CacheStats};
use crate::error::{Classify, ErrorKind};

const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug)]
pub enum HotCacheError {
    #[error("Prefetch of {key} requested zero elements")]
    Empty { key: CacheKey },

    #[error("Prefetch of {key} requested {count} elements but the source holds {available}")]
    SourceTooShort {
        key: CacheKey,
        count: usize,
        available: usize,
    },
}

impl Classify for HotCacheError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

/// Where a read was served from.
#[derive(Debug, Clone)]
pub enum TensorData<'a> {
    /// Owned hot copy from RAM.
    Hot(Arc<[f32]>),
    /// The caller-supplied fallback.
    Cold(&'a [f32]),
}

impl TensorData<'_> {
    pub fn is_hot(&self) -> bool {
        matches!(self, TensorData::Hot(_))
    }
}

impl Deref for TensorData<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            TensorData::Hot(data) => data,
            TensorData::Cold(data) => data,
        }
    }
}

#[derive(Debug)]
struct HotEntry {
    data: Arc<[f32]>,
    size_bytes: usize,
    access_count: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    loads: u64,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<CacheKey, HotEntry>,
    lru: LruIndex<CacheKey>,
    budget: Budget,
    clock: u64,
    counters: Counters,
}

impl Inner {
    fn remove(&mut self, key: &CacheKey) -> usize {
        let Some(entry) = self.entries.remove(key) else {
            return 0;
        };
        self.lru.remove(key);
        self.budget.release(entry.size_bytes);
        self.counters.evictions += 1;
        entry.size_bytes
    }

    fn make_space(&mut self, needed: usize) -> bool {
        while !self.budget.fits(needed) {
            let Some(victim) = self.lru.front().cloned() else {
                return false;
            };
            let freed = self.remove(&victim);
            debug!(key = %victim, freed, "Evicted hot tensor");
        }
        true
    }

    fn insert(&mut self, key: &CacheKey, data: Arc<[f32]>) {
        let size_bytes = data.len() * ELEMENT_BYTES;
        self.clock += 1;
        self.entries.insert(
            key.clone(),
            HotEntry {
                data,
                size_bytes,
                access_count: 1,
                last_access: self.clock,
            },
        );
        self.lru.insert(key.clone());
        self.budget.charge(size_bytes);
        self.counters.loads += 1;
        debug_assert_eq!(self.entries.len(), self.lru.len());
        debug_assert!(self.budget.used_bytes <= self.budget.max_bytes);
    }
}

/// Budgeted, prefetch-only RAM cache of `f32` tensor copies.
pub struct HotCache {
    inner: Mutex<Inner>,
}

impl HotCache {
    pub fn new(max_size_bytes: usize) -> Self {
        info!(
            budget_gb = max_size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            "Hot cache initialized"
        );
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruIndex::new(),
                budget: Budget::new(max_size_bytes),
                clock: 0,
                counters: Counters::default(),
            }),
        }
    }

    /// Serve `key` from RAM if present, otherwise return `fallback` untouched.
    pub fn get_or_fallback<'a>(&self, key: &CacheKey, fallback: &'a [f32]) -> TensorData<'a> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;

        let hit = inner.entries.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.last_access = now;
            entry.data.clone()
        });

        match hit {
            Some(data) => {
                inner.lru.touch(key);
                inner.counters.hits += 1;
                TensorData::Hot(data)
            }
            None => {
                inner.counters.misses += 1;
                TensorData::Cold(fallback)
            }
        }
    }

    /// Peek at a hot copy without touching counters or recency.
    pub fn get_if_cached(&self, key: &CacheKey) -> Option<Arc<[f32]>> {
        self.inner.lock().entries.get(key).map(|e| e.data.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Copy the first `count` elements of `source` into the hot tier.
    ///
    /// Returns `Ok(true)` if the tensor is cached afterwards (including when
    /// it already was) and `Ok(false)` if it is larger than the whole budget.
    pub fn prefetch(
        &self,
        key: &CacheKey,
        source: &[f32],
        count: usize,
    ) -> Result<bool, HotCacheError> {
        let source = Self::checked_source(key, source, count)?;
        self.admit(key, count, || Arc::from(source))
    }

    /// Dequantise an `f16` source into an `f32` hot copy.
    pub fn prefetch_f16(&self, key: &CacheKey, source: &[f16]) -> Result<bool, HotCacheError> {
        let source = Self::checked_source(key, source, source.len())?;
        self.admit(key, source.len(), || {
            let mut out = vec![0f32; source.len()];
            source.convert_to_f32_slice(&mut out);
            Arc::from(out)
        })
    }

    fn checked_source<'s, T>(
        key: &CacheKey,
        source: &'s [T],
        count: usize,
    ) -> Result<&'s [T], HotCacheError> {
        if count == 0 {
            return Err(HotCacheError::Empty { key: key.clone() });
        }
        source
            .get(..count)
            .ok_or_else(|| HotCacheError::SourceTooShort {
                key: key.clone(),
                count,
                available: source.len(),
            })
    }

    fn admit(
        &self,
        key: &CacheKey,
        count: usize,
        load: impl FnOnce() -> Arc<[f32]>,
    ) -> Result<bool, HotCacheError> {
        let size_bytes = count * ELEMENT_BYTES;
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(key) {
            return Ok(true);
        }

        if size_bytes > inner.budget.max_bytes {
            debug!(
                key = %key,
                size_bytes,
                budget = inner.budget.max_bytes,
                "Tensor larger than hot cache, not caching"
            );
            return Ok(false);
        }

        if !inner.make_space(size_bytes) {
            return Ok(false);
        }

        inner.insert(key, load());
        debug!(
            key = %key,
            size_bytes,
            used = inner.budget.used_bytes,
            "Prefetched tensor into hot cache"
        );
        Ok(true)
    }

    /// Drop every entry owned by `owner`. Returns how many were removed.
    pub fn evict_model(&self, owner: &str) -> usize {
        let mut inner = self.inner.lock();
        let victims: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.owner == owner)
            .cloned()
            .collect();
        for key in &victims {
            inner.remove(key);
        }
        info!(owner, evicted = victims.len(), "Evicted model from hot cache");
        victims.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.budget.reset();
        info!("Hot cache cleared");
    }

    /// Access count and last-access ordinal for a cached entry.
    pub fn access_info(&self, key: &CacheKey) -> Option<(u64, u64)> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| (e.access_count, e.last_access))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            evictions: inner.counters.evictions,
            loads: inner.counters.loads,
            entries: inner.entries.len(),
            used_bytes: inner.budget.used_bytes,
            budget_bytes: inner.budget.max_bytes,
        }
    }

    /// Zero hit/miss/eviction/load counters; occupancy is unaffected.
    pub fn reset_stats(&self) {
        self.inner.lock().counters = Counters::default();
    }

    pub fn current_size(&self) -> usize {
        self.inner.lock().budget.used_bytes
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().budget.max_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn utilization(&self) -> f64 {
        self.inner.lock().budget.utilization()
    }
}
