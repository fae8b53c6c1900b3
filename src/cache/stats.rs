//! Byte budgets, cache keys, and the counter set every tier reports.

use serde::{Deserialize, Serialize};

/// Composite key: owner (e.g. model name) plus resource (e.g. tensor name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub owner: String,
    pub resource: String,
}

impl CacheKey {
    pub fn new(owner: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            resource: resource.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.resource)
    }
}

/// Maximum bytes a tier may hold and what it holds right now.
///
/// `used_bytes <= max_bytes` holds after every completed mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_bytes: usize,
    pub used_bytes: usize,
}

impl Budget {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
        }
    }

    /// Whether `size` more bytes fit without eviction.
    pub fn fits(&self, size: usize) -> bool {
        self.used_bytes
            .checked_add(size)
            .is_some_and(|total| total <= self.max_bytes)
    }

    pub fn available(&self) -> usize {
        self.max_bytes.saturating_sub(self.used_bytes)
    }

    pub fn charge(&mut self, size: usize) {
        self.used_bytes += size;
    }

    pub fn release(&mut self, size: usize) {
        self.used_bytes = self.used_bytes.saturating_sub(size);
    }

    pub fn reset(&mut self) {
        self.used_bytes = 0;
    }

    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.max_bytes as f64
    }
}

/// Point-in-time counters for one tier, for external reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Successful populations (allocations or prefetch copies).
    pub loads: u64,
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
