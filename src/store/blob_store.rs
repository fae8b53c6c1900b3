//! Byte-budgeted on-disk blob store (the cold tier).
//!
//! Blobs are encoded with the compression container and written atomically
//! (temp file + rename) under `<root>/blobs/<shard>/<id>.blob`. A JSON index
//! sidecar records owner, sizes, codec and recency so the store can be
//! reopened. When `capacity_bytes` is set, least recently used blobs are
//! deleted to make room.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::compressor::{Codec, CodecError, Compressor};
use crate::cache::lru::LruIndex;
use crate::cache::stats::CacheStats;
use crate::config::StoreConfig;
use crate::error::{Classify, ErrorKind};
use crate::state::blob::{EnvelopeError, StateBlob};

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob id {0:?}")]
    InvalidId(String),

    #[error("Refusing to store an empty blob")]
    EmptyBlob,

    #[error("Blob {id} needs {size} bytes but store capacity is {capacity}")]
    OutOfBudget { id: String, size: u64, capacity: u64 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Corrupt store index: {0}")]
    Index(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::NotFound(_) | StoreError::InvalidId(_) | StoreError::EmptyBlob => {
                ErrorKind::InvalidInput
            }
            StoreError::OutOfBudget { .. } => ErrorKind::OutOfBudget,
            StoreError::Codec(e) => e.kind(),
            StoreError::Envelope(_) | StoreError::Index(_) => ErrorKind::CorruptContainer,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn delete_blob_file(root: &Path, id: &str) {
    let path = BlobStore::blob_path_in(root, id);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(id, path = %path.display(), error = %e, "Failed to delete blob file");
        }
    }
}

/// Index record for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub id: String,
    pub owner: String,
    pub original_size: u64,
    /// Container size on disk.
    pub stored_size: u64,
    pub codec: Codec,
    /// Unix seconds.
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    /// Least recently used first.
    entries: Vec<BlobMeta>,
}

struct Inner {
    entries: HashMap<String, BlobMeta>,
    lru: LruIndex<String>,
    used_bytes: u64,
    dirty: bool,
    hits: u64,
    misses: u64,
    evictions: u64,
    loads: u64,
}

impl Inner {
    fn forget(&mut self, id: &str) -> Option<BlobMeta> {
        let meta = self.entries.remove(id)?;
        self.lru.remove(id);
        self.used_bytes -= meta.stored_size;
        Some(meta)
    }

    /// Least recently used blobs, other than `incoming`, that must go for
    /// `size` more bytes to fit. Nothing is removed.
    fn victims_for(&self, incoming: &str, size: u64, capacity: u64) -> Vec<String> {
        if capacity == 0 {
            return Vec::new();
        }
        let mut used = self.used_bytes
            - self.entries.get(incoming).map_or(0, |m| m.stored_size);
        let mut victims = Vec::new();
        for id in self.lru.iter().filter(|id| id.as_str() != incoming) {
            if used + size <= capacity {
                break;
            }
            if let Some(meta) = self.entries.get(id) {
                used -= meta.stored_size;
                victims.push(id.clone());
            }
        }
        victims
    }

    fn evict(&mut self, root: &Path, id: &str) {
        if let Some(meta) = self.forget(id) {
            self.evictions += 1;
            self.dirty = true;
            delete_blob_file(root, id);
            info!(id, owner = %meta.owner, freed = meta.stored_size, "Evicted blob");
        }
    }
}

/// Directory-backed blob store with LRU capacity eviction.
pub struct BlobStore {
    root: PathBuf,
    capacity_bytes: u64,
    compressor: Compressor,
    inner: Mutex<Inner>,
}

impl BlobStore {
    /// Open (or create) the store at `config.path`, reloading its index.
    ///
    /// Index entries whose files have disappeared are dropped.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let root = config.path.clone();
        std::fs::create_dir_all(root.join("blobs")).map_err(io_err(&root))?;

        let mut inner = Inner {
            entries: HashMap::new(),
            lru: LruIndex::new(),
            used_bytes: 0,
            dirty: false,
            hits: 0,
            misses: 0,
            evictions: 0,
            loads: 0,
        };

        let index_path = root.join(INDEX_FILE);
        if index_path.exists() {
            let raw = std::fs::read(&index_path).map_err(io_err(&index_path))?;
            let index: IndexFile = serde_json::from_slice(&raw)?;
            for meta in index.entries {
                if !Self::blob_path_in(&root, &meta.id).exists() {
                    warn!(id = %meta.id, "Indexed blob missing on disk, dropping");
                    inner.dirty = true;
                    continue;
                }
                inner.used_bytes += meta.stored_size;
                inner.lru.insert(meta.id.clone());
                inner.entries.insert(meta.id.clone(), meta);
            }
        }

        // A smaller capacity than last time trims the oldest blobs now.
        let victims = inner.victims_for("", 0, config.capacity_bytes);
        for id in &victims {
            inner.evict(&root, id);
        }

        info!(
            path = %root.display(),
            blobs = inner.entries.len(),
            used = inner.used_bytes,
            capacity = config.capacity_bytes,
            "Blob store opened"
        );

        Ok(Self {
            root,
            capacity_bytes: config.capacity_bytes,
            compressor: Compressor::new(config.compression.clone()),
            inner: Mutex::new(inner),
        })
    }

    fn validate_id(id: &str) -> Result<(), StoreError> {
        let ok = !id.is_empty()
            && id.len() <= 128
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    fn blob_path_in(root: &Path, id: &str) -> PathBuf {
        let shard: String = id.chars().take(2).collect();
        root.join("blobs").join(shard).join(format!("{id}.blob"))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        Self::blob_path_in(&self.root, id)
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        tmp.write_all(data).map_err(io_err(path))?;
        tmp.as_file().sync_all().map_err(io_err(path))?;
        tmp.persist(path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    fn save_index(&self, inner: &mut Inner) -> Result<(), StoreError> {
        let entries = inner
            .lru
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect();
        let json = serde_json::to_vec_pretty(&IndexFile {
            version: INDEX_VERSION,
            entries,
        })?;
        Self::write_atomic(&self.root.join(INDEX_FILE), &json)?;
        inner.dirty = false;
        Ok(())
    }

    /// Compress and store `data` under `id`, replacing any previous blob.
    pub fn put(&self, id: &str, owner: &str, data: &[u8]) -> Result<BlobMeta, StoreError> {
        Self::validate_id(id)?;
        if data.is_empty() {
            return Err(StoreError::EmptyBlob);
        }

        let encoded = self.compressor.encode(data)?;
        let size = encoded.compressed_size() as u64;
        if self.capacity_bytes > 0 && size > self.capacity_bytes {
            return Err(StoreError::OutOfBudget {
                id: id.to_string(),
                size,
                capacity: self.capacity_bytes,
            });
        }

        let mut inner = self.inner.lock();
        let victims = inner.victims_for(id, size, self.capacity_bytes);

        // Nothing changes until the new container is safely on disk.
        Self::write_atomic(&self.blob_path(id), &encoded.data)?;

        inner.forget(id);
        for victim in &victims {
            inner.evict(&self.root, victim);
        }

        let meta = BlobMeta {
            id: id.to_string(),
            owner: owner.to_string(),
            original_size: data.len() as u64,
            stored_size: size,
            codec: encoded.codec,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        };
        inner.entries.insert(id.to_string(), meta.clone());
        inner.lru.insert(id.to_string());
        inner.used_bytes += size;
        inner.loads += 1;
        self.save_index(&mut inner)?;

        debug!(
            id,
            owner,
            original = meta.original_size,
            stored = size,
            codec = %meta.codec,
            used = inner.used_bytes,
            "Stored blob"
        );
        Ok(meta)
    }

    /// Read, validate and decode the blob stored under `id`.
    pub fn get(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(id) {
            inner.misses += 1;
            return Err(StoreError::NotFound(id.to_string()));
        }
        let path = self.blob_path(id);
        let raw = std::fs::read(&path).map_err(io_err(&path))?;
        let data = self.compressor.decode(&raw)?;
        inner.lru.touch(id);
        inner.hits += 1;
        inner.dirty = true;
        Ok(data)
    }

    /// Decode `id` without returning it; errors describe the damage.
    pub fn verify(&self, id: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        let meta = inner
            .entries
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let path = self.blob_path(id);
        let raw = std::fs::read(&path).map_err(io_err(&path))?;
        let header = Compressor::read_header(&raw)?;
        if header.original_size() != meta.original_size {
            return Err(CodecError::SizeMismatch {
                expected: meta.original_size,
                actual: header.original_size(),
            }
            .into());
        }
        self.compressor.decode(&raw)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.forget(id).is_none() {
            return Ok(false);
        }
        delete_blob_file(&self.root, id);
        self.save_index(&mut inner)?;
        Ok(true)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Every blob, least recently used first.
    pub fn list(&self) -> Vec<BlobMeta> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub fn list_by_owner(&self, owner: &str) -> Vec<BlobMeta> {
        self.list().into_iter().filter(|m| m.owner == owner).collect()
    }

    /// Delete every blob.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner.lru.iter().cloned().collect();
        for id in &ids {
            delete_blob_file(&self.root, id);
        }
        inner.entries.clear();
        inner.lru.clear();
        inner.used_bytes = 0;
        self.save_index(&mut inner)?;
        info!(removed = ids.len(), "Blob store cleared");
        Ok(())
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            loads: inner.loads,
            entries: inner.entries.len(),
            used_bytes: usize::try_from(inner.used_bytes).unwrap_or(usize::MAX),
            budget_bytes: usize::try_from(self.capacity_bytes).unwrap_or(usize::MAX),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist recency changes made by reads.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            self.save_index(&mut inner)?;
        }
        Ok(())
    }

    /// Store an extracted state under its blob id, owned by its model.
    pub fn put_state(&self, blob: &StateBlob) -> Result<BlobMeta, StoreError> {
        self.put(&blob.id.to_string(), &blob.model, &blob.to_bytes())
    }

    pub fn get_state(&self, id: &Uuid) -> Result<StateBlob, StoreError> {
        let raw = self.get(&id.to_string())?;
        Ok(StateBlob::from_bytes(&raw)?)
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush blob store index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;

    fn config(dir: &Path, capacity: u64) -> StoreConfig {
        StoreConfig {
            path: dir.to_path_buf(),
            capacity_bytes: capacity,
            compression: CompressionConfig {
                codec: Codec::None,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();

        let meta = store.put("a1", "llama", b"hello blob").unwrap();
        assert_eq!(meta.original_size, 10);
        assert!(store.contains("a1"));
        assert_eq!(store.get("a1").unwrap(), b"hello blob");
        assert_eq!(store.used_bytes(), meta.stored_size);

        assert!(store.remove("a1").unwrap());
        assert!(!store.remove("a1").unwrap());
        assert_eq!(store.used_bytes(), 0);
        assert!(matches!(store.get("a1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        // Uncompressed containers: 16-byte header + 40 bytes each.
        let store = BlobStore::open(&config(dir.path(), 120)).unwrap();
        store.put("a", "m", &[1u8; 40]).unwrap();
        store.put("b", "m", &[2u8; 40]).unwrap();
        store.get("a").unwrap();
        store.put("c", "m", &[3u8; 40]).unwrap();

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        assert!(store.used_bytes() <= 120);
        assert_eq!(store.stats().evictions, 1);

        let err = store.put("huge", "m", &[0u8; 200]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBudget);
    }

    #[test]
    fn test_reopen_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
            store.put("x", "alpha", b"one").unwrap();
            store.put("y", "beta", b"two").unwrap();
            store.get("x").unwrap();
        }
        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
        let ids: Vec<_> = store.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["y", "x"]);
        assert_eq!(store.list_by_owner("alpha").len(), 1);
        assert_eq!(store.get("y").unwrap(), b"two");
    }

    #[test]
    fn test_failed_write_keeps_previous_blob_and_victims() {
        let dir = tempfile::tempdir().unwrap();
        // Room for two 56-byte containers.
        let store = BlobStore::open(&config(dir.path(), 120)).unwrap();
        store.put("a1", "m", &[1u8; 40]).unwrap();
        store.put("b1", "m", &[2u8; 40]).unwrap();

        // A plain file where the shard directory belongs makes the write fail.
        let shard = dir.path().join("blobs").join("c1");
        std::fs::write(&shard, b"not a directory").unwrap();
        let err = store.put("c1", "m", &[3u8; 40]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        // "a1" was the planned victim and must survive.
        assert!(store.contains("a1"));
        assert_eq!(store.get("a1").unwrap(), vec![1u8; 40]);
        assert!(!store.contains("c1"));
        assert_eq!(store.used_bytes(), 112);
        assert_eq!(store.stats().evictions, 0);

        // Same for replacing an existing id.
        let b_shard = dir.path().join("blobs").join("b1");
        let moved = dir.path().join("b1-moved");
        std::fs::rename(&b_shard, &moved).unwrap();
        std::fs::write(&b_shard, b"not a directory").unwrap();
        assert!(store.put("b1", "m", &[9u8; 40]).is_err());
        assert!(store.contains("b1"));

        std::fs::remove_file(&b_shard).unwrap();
        std::fs::rename(&moved, &b_shard).unwrap();
        assert_eq!(store.get("b1").unwrap(), vec![2u8; 40]);
        assert_eq!(store.used_bytes(), 112);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_trims_lru() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
            store.put("a", "m", &[1u8; 40]).unwrap();
            store.put("b", "m", &[2u8; 40]).unwrap();
            store.put("c", "m", &[3u8; 40]).unwrap();
            store.get("a").unwrap();
        }
        let store = BlobStore::open(&config(dir.path(), 120)).unwrap();
        assert!(store.used_bytes() <= 120);
        assert!(!store.contains("b"));
        assert!(!store.blob_path("b").exists());
        assert!(store.contains("c"));
        assert!(store.contains("a"));
        drop(store);

        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_invalid_ids_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
        for bad in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                store.put(bad, "m", b"x"),
                Err(StoreError::InvalidId(_))
            ));
        }
        assert!(matches!(store.put("ok", "m", b""), Err(StoreError::EmptyBlob)));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
        store.put("v1", "m", b"payload").unwrap();
        store.verify("v1").unwrap();

        std::fs::write(store.blob_path("v1"), b"garbage").unwrap();
        let err = store.verify("v1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptContainer);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&config(dir.path(), 0)).unwrap();
        store.put("a", "m", b"1").unwrap();
        store.put("b", "m", b"2").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(!store.blob_path("a").exists());
    }
}
