//! Whole-model residency under a device memory budget.
//!
//! Tracks which model contexts are loaded and how much device memory each
//! holds. Making room for a new model evicts the least recently used models
//! first, on the same [`LruIndex`] the tensor tiers use.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::lru::LruIndex;
use crate::cache::stats::{Budget, CacheStats};
use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum ResidencyError {
    #[error("Model {model} needs {requested} bytes but the residency budget is {budget}")]
    OutOfBudget {
        model: String,
        requested: usize,
        budget: usize,
    },

    #[error("Model {0} registered with zero bytes")]
    ZeroSize(String),
}

impl Classify for ResidencyError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResidencyError::OutOfBudget { .. } => ErrorKind::OutOfBudget,
            ResidencyError::ZeroSize(_) => ErrorKind::InvalidInput,
        }
    }
}

#[derive(Debug)]
struct Inner {
    models: HashMap<String, usize>,
    lru: LruIndex<String>,
    budget: Budget,
    evictions: u64,
    loads: u64,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn drop_model(&mut self, model: &str) -> Option<usize> {
        let bytes = self.models.remove(model)?;
        self.lru.remove(model);
        self.budget.release(bytes);
        Some(bytes)
    }

    fn make_room(&mut self, needed: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while !self.budget.fits(needed) {
            let Some(victim) = self.lru.pop_front() else {
                break;
            };
            if let Some(bytes) = self.models.remove(&victim) {
                self.budget.release(bytes);
                self.evictions += 1;
                info!(model = %victim, freed = bytes, "Evicted model context");
            }
            evicted.push(victim);
        }
        evicted
    }
}

/// Loaded-model accounting with LRU eviction.
pub struct ModelResidency {
    inner: Mutex<Inner>,
}

impl ModelResidency {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                models: HashMap::new(),
                lru: LruIndex::new(),
                budget: Budget::new(budget_bytes),
                evictions: 0,
                loads: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Evict least recently used models until `bytes` fit.
    ///
    /// Returns the evicted model names, oldest first. The caller unloads them.
    /// Fails without evicting anything if `bytes` exceeds the whole budget.
    pub fn ensure_space(&self, model: &str, bytes: usize) -> Result<Vec<String>, ResidencyError> {
        let mut inner = self.inner.lock();
        if bytes > inner.budget.max_bytes {
            return Err(ResidencyError::OutOfBudget {
                model: model.to_string(),
                requested: bytes,
                budget: inner.budget.max_bytes,
            });
        }
        Ok(inner.make_room(bytes))
    }

    /// Record `model` as resident with `bytes` of device memory, evicting
    /// other models as needed. Re-registering replaces the old size.
    pub fn register(&self, model: &str, bytes: usize) -> Result<Vec<String>, ResidencyError> {
        if bytes == 0 {
            return Err(ResidencyError::ZeroSize(model.to_string()));
        }
        let mut inner = self.inner.lock();
        if bytes > inner.budget.max_bytes {
            return Err(ResidencyError::OutOfBudget {
                model: model.to_string(),
                requested: bytes,
                budget: inner.budget.max_bytes,
            });
        }

        inner.drop_model(model);
        let evicted = inner.make_room(bytes);
        inner.models.insert(model.to_string(), bytes);
        inner.lru.insert(model.to_string());
        inner.budget.charge(bytes);
        inner.loads += 1;

        debug!(
            model,
            bytes,
            used = inner.budget.used_bytes,
            evicted = evicted.len(),
            "Model resident"
        );
        debug_assert_eq!(inner.models.len(), inner.lru.len());
        Ok(evicted)
    }

    /// Mark `model` as just used. Returns false if it is not resident.
    pub fn touch(&self, model: &str) -> bool {
        let mut inner = self.inner.lock();
        let found = inner.lru.touch(model);
        if found {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Forget `model`. Returns the bytes it held.
    pub fn unregister(&self, model: &str) -> Option<usize> {
        self.inner.lock().drop_model(model)
    }

    pub fn is_resident(&self, model: &str) -> bool {
        self.inner.lock().models.contains_key(model)
    }

    /// Resident models, least recently used first.
    pub fn resident_models(&self) -> Vec<String> {
        self.inner.lock().lru.iter().cloned().collect()
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().budget.used_bytes
    }

    pub fn budget_bytes(&self) -> usize {
        self.inner.lock().budget.max_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            loads: inner.loads,
            entries: inner.models.len(),
            used_bytes: inner.budget.used_bytes,
            budget_bytes: inner.budget.max_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_evicts_least_recent() {
        let residency = ModelResidency::new(100);
        residency.register("a", 40).unwrap();
        residency.register("b", 40).unwrap();
        residency.touch("a");

        let evicted = residency.register("c", 40).unwrap();
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(residency.resident_models(), vec!["a", "c"]);
        assert_eq!(residency.used_bytes(), 80);

        let stats = residency.stats();
        assert_eq!((stats.loads, stats.evictions, stats.hits), (3, 1, 1));
        assert!(!residency.touch("b"));
        assert_eq!(residency.stats().misses, 1);
    }

    #[test]
    fn test_oversized_model_rejected_without_eviction() {
        let residency = ModelResidency::new(100);
        residency.register("a", 60).unwrap();
        let err = residency.register("huge", 150).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBudget);
        assert!(residency.is_resident("a"));
    }

    #[test]
    fn test_reregister_replaces_size() {
        let residency = ModelResidency::new(100);
        residency.register("a", 60).unwrap();
        residency.register("a", 30).unwrap();
        assert_eq!(residency.used_bytes(), 30);
        assert_eq!(residency.resident_models(), vec!["a"]);
    }

    #[test]
    fn test_ensure_space_and_unregister() {
        let residency = ModelResidency::new(100);
        residency.register("a", 50).unwrap();
        residency.register("b", 50).unwrap();

        let evicted = residency.ensure_space("c", 60).unwrap();
        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(residency.evictions(), 2);
        assert_eq!(residency.unregister("a"), None);
        assert_eq!(residency.used_bytes(), 0);
    }
}
