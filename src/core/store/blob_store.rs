// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Capped content store keyed by hex hash, sled-backed, LRU-evicted.
//!
//! The recency index lives in memory and doubles as the last-access
//! record; `get` promotes. The byte counter is incremented only after a
//! successful write, so a failed insert never corrupts accounting.

use crate::core::types::{digest, digest_matches, Hash32};
use lru::LruCache;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Default capacity: 2 GiB.
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Blob storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bytes did not digest to the expected hash.
    #[error("hash mismatch")]
    HashMismatch,
    /// A single block larger than the configured capacity.
    #[error("storage full")]
    Full,
    /// Backing store cannot serve or ingest.
    #[error("storage unavailable")]
    Unavailable,
}

/// Store counters snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of blocks.
    pub items: u64,
    /// Total stored bytes.
    pub bytes: u64,
    /// Capacity in bytes.
    pub max_bytes: u64,
}

struct Index {
    // LRU order is the last-access record; value is the block length.
    recency: LruCache<String, u64>,
    total_bytes: u64,
    max_bytes: u64,
}

/// Capped content-addressed block store.
pub struct BlobStore {
    tree: sled::Tree,
    index: Mutex<Index>,
}

impl BlobStore {
    /// Open a standalone store at `path` (directory).
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::Unavailable)?;
        let tree = db.open_tree("blobs").map_err(|_| StoreError::Unavailable)?;
        Self::with_tree(tree, max_bytes)
    }

    /// Wrap an existing sled tree (shared-db wiring).
    pub fn with_tree(tree: sled::Tree, max_bytes: u64) -> Result<Self, StoreError> {
        let mut recency = LruCache::unbounded();
        let mut total_bytes: u64 = 0;
        for item in tree.iter() {
            let (k, v) = item.map_err(|_| StoreError::Unavailable)?;
            let hash_hex = String::from_utf8_lossy(&k).to_string();
            total_bytes += v.len() as u64;
            recency.put(hash_hex, v.len() as u64);
        }
        Ok(Self {
            tree,
            index: Mutex::new(Index {
                recency,
                total_bytes,
                max_bytes,
            }),
        })
    }

    fn insert(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let len = bytes.len() as u64;
        let mut idx = self.index.lock().map_err(|_| StoreError::Unavailable)?;
        if idx.recency.get(hash_hex).is_some() {
            // Idempotent on the hash; touching is enough.
            return Ok(());
        }
        if len > idx.max_bytes {
            return Err(StoreError::Full);
        }
        // Evict LRU until the new entry fits. The entry being written is
        // not in the index yet, so it can never evict itself.
        while idx.total_bytes + len > idx.max_bytes {
            let Some((victim, victim_len)) = idx.recency.pop_lru() else {
                break;
            };
            self.tree
                .remove(victim.as_bytes())
                .map_err(|_| StoreError::Unavailable)?;
            idx.total_bytes = idx.total_bytes.saturating_sub(victim_len);
            debug!(hash = %victim, "evicted block");
        }
        self.tree
            .insert(hash_hex.as_bytes(), bytes)
            .map_err(|_| StoreError::Unavailable)?;
        idx.total_bytes += len;
        idx.recency.put(hash_hex.to_string(), len);
        Ok(())
    }

    /// Store `bytes`, returning the hex hash. A non-trusted put re-hashes
    /// defensively before committing.
    pub fn put(&self, bytes: &[u8], trusted: bool) -> Result<String, StoreError> {
        let hash = digest(bytes);
        if !trusted && !digest_matches(&hash, bytes) {
            return Err(StoreError::HashMismatch);
        }
        let hash_hex = hash.to_hex();
        self.insert(&hash_hex, bytes)?;
        Ok(hash_hex)
    }

    /// Store bytes under a caller-supplied hash, verifying it.
    pub fn put_by_hash(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let expected = Hash32::from_hex(hash_hex).map_err(|_| StoreError::HashMismatch)?;
        if !digest_matches(&expected, bytes) {
            return Err(StoreError::HashMismatch);
        }
        self.insert(hash_hex, bytes)
    }

    /// Store bytes under a caller-supplied hash without verification.
    /// Callable only from paths that just computed the hash.
    pub fn put_by_hash_trusted(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.insert(hash_hex, bytes)
    }

    /// Fetch a block, promoting it in the recency order.
    pub fn get(&self, hash_hex: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let found = self
            .tree
            .get(hash_hex.as_bytes())
            .map_err(|_| StoreError::Unavailable)?;
        let Some(bytes) = found else {
            return Ok(None);
        };
        let mut idx = self.index.lock().map_err(|_| StoreError::Unavailable)?;
        if idx.recency.get(hash_hex).is_none() {
            let len = bytes.len() as u64;
            idx.recency.put(hash_hex.to_string(), len);
        }
        Ok(Some(bytes.to_vec()))
    }

    /// Whether a block is present.
    pub fn has(&self, hash_hex: &str) -> bool {
        if let Ok(idx) = self.index.lock() {
            if idx.recency.peek(hash_hex).is_some() {
                return true;
            }
        }
        self.tree.contains_key(hash_hex.as_bytes()).unwrap_or(false)
    }

    /// Remove a block.
    pub fn delete(&self, hash_hex: &str) -> Result<(), StoreError> {
        let mut idx = self.index.lock().map_err(|_| StoreError::Unavailable)?;
        if let Some(len) = idx.recency.pop(hash_hex) {
            idx.total_bytes = idx.total_bytes.saturating_sub(len);
        }
        self.tree
            .remove(hash_hex.as_bytes())
            .map_err(|_| StoreError::Unavailable)?;
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StoreStats {
        match self.index.lock() {
            Ok(idx) => StoreStats {
                items: idx.recency.len() as u64,
                bytes: idx.total_bytes,
                max_bytes: idx.max_bytes,
            },
            Err(_) => StoreStats {
                items: 0,
                bytes: 0,
                max_bytes: 0,
            },
        }
    }

    /// Change capacity, evicting LRU entries until under the new cap.
    pub fn set_max_bytes(&self, max_bytes: u64) -> Result<(), StoreError> {
        let mut idx = self.index.lock().map_err(|_| StoreError::Unavailable)?;
        idx.max_bytes = max_bytes;
        while idx.total_bytes > idx.max_bytes {
            let Some((victim, victim_len)) = idx.recency.pop_lru() else {
                break;
            };
            self.tree
                .remove(victim.as_bytes())
                .map_err(|_| StoreError::Unavailable)?;
            idx.total_bytes = idx.total_bytes.saturating_sub(victim_len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(max: u64) -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path(), max).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_returns_equal_bytes() {
        let (_dir, store) = temp_store(1 << 20);
        let hash = store.put(b"block bytes", false).unwrap();
        assert_eq!(store.get(&hash).unwrap().unwrap(), b"block bytes");
        assert!(store.has(&hash));
    }

    #[test]
    fn put_is_idempotent_on_hash() {
        let (_dir, store) = temp_store(1 << 20);
        let h1 = store.put(b"same", false).unwrap();
        let h2 = store.put(b"same", true).unwrap();
        assert_eq!(h1, h2);
        let stats = store.stats();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.bytes, 4);
    }

    #[test]
    fn put_by_hash_verifies() {
        let (_dir, store) = temp_store(1 << 20);
        let good = digest(b"payload").to_hex();
        store.put_by_hash(&good, b"payload").unwrap();
        let bad = digest(b"other").to_hex();
        assert!(matches!(
            store.put_by_hash(&bad, b"payload"),
            Err(StoreError::HashMismatch)
        ));
    }

    #[test]
    fn eviction_is_lru_and_accounting_holds() {
        let (_dir, store) = temp_store(30);
        let a = store.put(b"aaaaaaaaaa", true).unwrap(); // 10 bytes
        let b = store.put(b"bbbbbbbbbb", true).unwrap();
        let c = store.put(b"cccccccccc", true).unwrap();
        assert_eq!(store.stats().bytes, 30);

        // Touch `a` so `b` is LRU, then insert a fourth block.
        store.get(&a).unwrap();
        let d = store.put(b"dddddddddd", true).unwrap();

        assert!(store.has(&a));
        assert!(!store.has(&b));
        assert!(store.has(&c));
        assert!(store.has(&d));
        assert_eq!(store.stats().bytes, 30);
    }

    #[test]
    fn oversized_block_is_rejected() {
        let (_dir, store) = temp_store(4);
        assert!(matches!(
            store.put(b"too large", true),
            Err(StoreError::Full)
        ));
        assert_eq!(store.stats().bytes, 0);
    }

    #[test]
    fn shrink_capacity_evicts() {
        let (_dir, store) = temp_store(30);
        store.put(b"aaaaaaaaaa", true).unwrap();
        store.put(b"bbbbbbbbbb", true).unwrap();
        store.put(b"cccccccccc", true).unwrap();
        store.set_max_bytes(10).unwrap();
        assert_eq!(store.stats().bytes, 10);
        assert_eq!(store.stats().items, 1);
    }

    #[test]
    fn delete_updates_accounting() {
        let (_dir, store) = temp_store(1 << 20);
        let h = store.put(b"to be removed", true).unwrap();
        store.delete(&h).unwrap();
        assert!(!store.has(&h));
        assert_eq!(store.stats().bytes, 0);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = {
            let store = BlobStore::open(dir.path(), 1 << 20).unwrap();
            store.put(b"persistent block", true).unwrap()
        };
        let store = BlobStore::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(store.get(&hash).unwrap().unwrap(), b"persistent block");
        assert_eq!(store.stats().items, 1);
    }
}
