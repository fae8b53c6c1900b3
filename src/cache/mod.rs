//! Budgeted in-memory cache tiers and the codec they persist through.
//!
//! - [`lru`]: slab-backed LRU index shared by every tier
//! - [`stats`]: cache keys, byte budgets, hit/miss counters
//! - [`tensor_cache`]: page-aligned tensor buffers handed out as leases
//! - [`hot_cache`]: prefetch-only RAM copies of read-only tensors
//! - [`residency`]: whole-model accounting against a device budget
//! - [`compressor`]: self-describing compression container

pub mod compressor;
pub mod hot_cache;
pub mod lru;
pub mod residency;
pub mod stats;
pub mod tensor_cache;

pub use compressor::{Codec, CodecError, Compressed, Compressor};
pub use hot_cache::{HotCache, HotCacheError, TensorData};
pub use residency::{ModelResidency, ResidencyError};
pub use stats::{Budget, CacheKey, CacheStats};
pub use tensor_cache::{BufferLease, TensorCache, TensorCacheError};
