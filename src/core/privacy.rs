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

//! Privacy guard: decides which digests may leave the node to peers.
//!
//! Only blocks belonging to an encrypted tree the local user authored or
//! explicitly pinned are peer-shareable. Unencrypted content is never
//! served to peers. Violations are logged locally and never surfaced to
//! the peer.

use crate::core::tree::{TreeEngine, TreeError};
use crate::core::types::Cid;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::error;

/// Guard failures. Always logged, never sent to peers.
#[derive(Debug, Error)]
pub enum PrivacyError {
    /// An upload path produced a CID without a key.
    #[error("invariant violated: upload cid missing key")]
    MissingKey,
}

/// In-memory peer-shareable hash set.
#[derive(Default)]
pub struct PrivacyGuard {
    shareable: Mutex<HashSet<String>>,
}

impl PrivacyGuard {
    /// Empty guard: nothing is shareable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail closed when an upload CID lacks a key.
    pub fn assert_encrypted_upload_cid(&self, cid: &Cid) -> Result<(), PrivacyError> {
        if cid.key.is_none() {
            error!(hash = %cid.hash, "refusing unencrypted cid on upload path");
            return Err(PrivacyError::MissingKey);
        }
        Ok(())
    }

    /// Whether this hash may be served to a peer.
    pub fn should_serve_hash_to_peer(&self, hash_hex: &str) -> bool {
        self.shareable
            .lock()
            .map(|s| s.contains(hash_hex))
            .unwrap_or(false)
    }

    /// Mark a single hash shareable (peer write-back path).
    pub fn mark_hash_shareable(&self, hash_hex: &str) {
        if let Ok(mut s) = self.shareable.lock() {
            s.insert(hash_hex.to_string());
        }
    }

    /// Sweep every block reachable from an encrypted CID and mark it
    /// shareable. Called after a successful encrypted put; callers run
    /// [`PrivacyGuard::assert_encrypted_upload_cid`] first.
    pub async fn mark_tree_shareable(
        &self,
        engine: &TreeEngine,
        cid: &Cid,
    ) -> Result<u64, TreeError> {
        let mut marked = 0u64;
        let mut walk = engine.walk_blocks(cid);
        while let Some(block) = walk.next().await? {
            self.mark_hash_shareable(&block.hash.to_hex());
            marked += 1;
        }
        Ok(marked)
    }
}
