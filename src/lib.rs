//! hotswap-cache: budgeted caches for switching between large-model
//! execution contexts without reloading or recomputing their working data.
//!
//! Tiers, each with its own byte budget and LRU order:
//!   tensor buffers (page-aligned, leased) → hot RAM copies (prefetch-only)
//!   → compressed blobs on disk
//!
//! Per-sequence inference state is extracted from and injected back into an
//! external runtime through [`state::StateExtractor`].

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod store;

pub use error::{Classify, ErrorKind};
