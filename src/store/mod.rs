//! Persistent cold tier.

pub mod blob_store;

pub use blob_store::{BlobMeta, BlobStore, StoreError};
