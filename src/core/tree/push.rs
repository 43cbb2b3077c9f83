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

//! Tree walks and the post-order push.
//!
//! Push uploads deepest levels first, so a consumer racing against the
//! push never sees a parent whose children cannot be fetched.

use crate::core::codec::chk::decrypt_chk;
use crate::core::codec::node::try_decode_tree_node;
use crate::core::tree::engine::{TreeEngine, TreeError};
use crate::core::types::{Cid, Hash32};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Default concurrent upload window.
pub const DEFAULT_PUSH_CONCURRENCY: usize = 4;

/// Errors a push target can report per block.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Target could not be reached.
    #[error("server unreachable")]
    Unreachable,
    /// Target refused with an HTTP status.
    #[error("server rejected ({0})")]
    Rejected(u16),
    /// Target requires a signed capability.
    #[error("signature required")]
    SignatureRequired,
    /// Deadline fired.
    #[error("timeout")]
    Timeout,
}

/// Destination of a push: anything that can receive blocks by hash.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Whether the target already holds this block.
    async fn has(&self, hash_hex: &str) -> bool;
    /// Upload one block.
    async fn put(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Push options.
#[derive(Clone, Default)]
pub struct PushOptions {
    /// Concurrent upload window; 0 means the default.
    pub concurrency: usize,
    /// Cooperative cancellation flag.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Per-level progress callback `(processed, total)`.
    pub on_progress: Option<Arc<dyn Fn(u64, u64) + Send + Sync>>,
}

/// Push outcome summary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushResult {
    /// Blocks uploaded.
    pub pushed: u64,
    /// Blocks the target already had.
    pub skipped: u64,
    /// Blocks that failed to upload.
    pub failed: u64,
    /// Bytes uploaded.
    pub bytes: u64,
    /// Per-block error descriptions.
    pub errors: Vec<String>,
    /// Whether the caller cancelled mid-push.
    pub cancelled: bool,
}

/// One block yielded by a tree walk.
#[derive(Clone, Debug)]
pub struct WalkedBlock {
    /// Block address.
    pub hash: Hash32,
    /// Stored block bytes (ciphertext for encrypted trees).
    pub bytes: Vec<u8>,
    /// Depth below the walk root (root = 0).
    pub depth: usize,
}

/// Lazy depth-first walk over every block reachable from a CID.
pub struct BlockWalk<'a> {
    engine: &'a TreeEngine,
    stack: Vec<(Cid, usize)>,
}

impl TreeEngine {
    /// Walk all blocks reachable from `cid` in depth-first order.
    pub fn walk_blocks(&self, cid: &Cid) -> BlockWalk<'_> {
        BlockWalk {
            engine: self,
            stack: vec![(*cid, 0)],
        }
    }
}

impl BlockWalk<'_> {
    /// Next reachable block; `Ok(None)` when the walk is exhausted.
    pub async fn next(&mut self) -> Result<Option<WalkedBlock>, TreeError> {
        let Some((cid, depth)) = self.stack.pop() else {
            return Ok(None);
        };
        let hash_hex = cid.hash.to_hex();
        let Some(block) = self.engine.get_block(&hash_hex).await else {
            return Err(TreeError::NotFound);
        };
        let plain = match &cid.key {
            Some(key) => decrypt_chk(&block, key).map_err(|_| TreeError::Decryption)?,
            None => block.clone(),
        };
        if let Some(node) = try_decode_tree_node(&plain) {
            for link in node.links.iter().rev() {
                self.stack.push((link.cid, depth + 1));
            }
        }
        Ok(Some(WalkedBlock {
            hash: cid.hash,
            bytes: block,
            depth,
        }))
    }
}

enum Outcome {
    Pushed(u64),
    Skipped,
    Failed(String),
    Cancelled,
}

impl TreeEngine {
    /// Copy all blocks reachable from `cid` out of local storage into
    /// `target`, children before parents, skipping blocks the target has.
    pub async fn push(&self, cid: &Cid, target: &dyn BlockSink, opts: PushOptions) -> PushResult {
        let mut result = PushResult::default();

        // Plan: deepest occurrence per hash so every child level uploads
        // before any level that references it.
        let mut depth_of: HashMap<String, usize> = HashMap::new();
        let mut walk = self.walk_blocks(cid);
        loop {
            match walk.next().await {
                Ok(Some(block)) => {
                    let entry = depth_of.entry(block.hash.to_hex()).or_insert(block.depth);
                    if block.depth > *entry {
                        *entry = block.depth;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(err = %e, "push walk aborted");
                    result.failed += 1;
                    result.errors.push(format!("walk: {e}"));
                    return result;
                }
            }
        }

        let total = depth_of.len() as u64;
        let max_depth = depth_of.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
        for (hash, depth) in depth_of {
            levels[depth].push(hash);
        }
        for level in &mut levels {
            level.sort();
        }

        let concurrency = if opts.concurrency == 0 {
            DEFAULT_PUSH_CONCURRENCY
        } else {
            opts.concurrency
        };

        let mut processed: u64 = 0;
        for level in levels.into_iter().rev() {
            let outcomes: Vec<Outcome> = stream::iter(level)
                .map(|hash_hex| {
                    let cancel = opts.cancel.clone();
                    async move {
                        if cancel
                            .map(|c| c.load(Ordering::Relaxed))
                            .unwrap_or(false)
                        {
                            return Outcome::Cancelled;
                        }
                        if target.has(&hash_hex).await {
                            return Outcome::Skipped;
                        }
                        let bytes = match self.store().get(&hash_hex) {
                            Ok(Some(bytes)) => bytes,
                            _ => return Outcome::Failed(format!("{hash_hex}: missing locally")),
                        };
                        match target.put(&hash_hex, &bytes).await {
                            Ok(()) => Outcome::Pushed(bytes.len() as u64),
                            Err(e) => Outcome::Failed(format!("{hash_hex}: {e}")),
                        }
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                processed += 1;
                match outcome {
                    Outcome::Pushed(len) => {
                        result.pushed += 1;
                        result.bytes += len;
                    }
                    Outcome::Skipped => result.skipped += 1,
                    Outcome::Failed(e) => {
                        result.failed += 1;
                        result.errors.push(e);
                    }
                    Outcome::Cancelled => result.cancelled = true,
                }
            }
            if let Some(progress) = &opts.on_progress {
                progress(processed, total);
            }
            if result.cancelled {
                break;
            }
        }
        result
    }
}
