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
#![deny(missing_docs)]

//! Local key→bytes store abstraction used for small persisted snapshots
//! (the tree-root cache). Browser-side this is backed by origin storage;
//! node-side it is a sled tree.

use std::path::Path;
use thiserror::Error;

/// Key-value store errors.
#[derive(Debug, Error)]
pub enum KvError {
    /// Backing store failed.
    #[error("kv unavailable")]
    Unavailable,
}

/// Minimal key→bytes store seam.
pub trait KvStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    /// Write a value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;
    /// Remove a value.
    fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Sled-backed key-value store.
pub struct SledKvStore {
    tree: sled::Tree,
}

impl SledKvStore {
    /// Open a standalone store at `path` (directory).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = sled::open(path).map_err(|_| KvError::Unavailable)?;
        let tree = db.open_tree("kv").map_err(|_| KvError::Unavailable)?;
        Ok(Self { tree })
    }

    /// Wrap an existing sled tree (shared-db wiring).
    pub fn with_tree(tree: sled::Tree) -> Self {
        Self { tree }
    }
}

impl KvStore for SledKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let v = self
            .tree
            .get(key.as_bytes())
            .map_err(|_| KvError::Unavailable)?;
        Ok(v.map(|iv| iv.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.tree
            .insert(key.as_bytes(), value)
            .map_err(|_| KvError::Unavailable)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|_| KvError::Unavailable)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemKvStore {
    map: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl MemKvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let map = self.map.lock().map_err(|_| KvError::Unavailable)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut map = self.map.lock().map_err(|_| KvError::Unavailable)?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut map = self.map.lock().map_err(|_| KvError::Unavailable)?;
        map.remove(key);
        Ok(())
    }
}
