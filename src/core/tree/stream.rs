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

//! Streaming writes and lazy range reads.
//!
//! The writer accumulates at most one fan-out worth of links per tree
//! level, emitting interior nodes as levels fill, so memory stays bounded
//! regardless of input size. The range stream walks the tree lazily and
//! never materializes the full plaintext.

use crate::core::codec::chk::encode_leaf;
use crate::core::codec::chunker::{ChunkProfile, ChunkSplitter};
use crate::core::codec::node::{encode_tree_node, MAX_LINKS_PER_NODE};
use crate::core::store::blob_store::BlobStore;
use crate::core::tree::engine::{Decoded, TreeEngine, TreeError};
use crate::core::types::{Cid, Link, LinkKind, TreeNode};
use std::sync::Arc;

/// Streaming writer options.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    /// Chunking profile.
    pub profile: ChunkProfile,
    /// Write public (unencrypted) blocks. Default is encrypted.
    pub unencrypted: bool,
}

/// Single-pass streaming writer producing a hash tree.
pub struct TreeWriter {
    store: Arc<BlobStore>,
    splitter: Box<dyn ChunkSplitter>,
    encrypt: bool,
    // levels[0] holds chunk links; higher levels hold interior-node links.
    levels: Vec<Vec<Link>>,
    size: u64,
}

impl TreeWriter {
    pub(crate) fn new(store: Arc<BlobStore>, opts: StreamOptions) -> Self {
        Self {
            store,
            splitter: opts.profile.splitter(),
            encrypt: !opts.unencrypted,
            levels: Vec::new(),
            size: 0,
        }
    }

    /// Encode and store one tree node, returning its address.
    pub(crate) fn write_node_to(
        store: &Arc<BlobStore>,
        node: &TreeNode,
        encrypt: bool,
    ) -> Result<Cid, TreeError> {
        let bytes = encode_tree_node(node);
        let leaf = encode_leaf(&bytes, encrypt).map_err(|_| TreeError::Storage)?;
        store
            .put_by_hash_trusted(&leaf.hash.to_hex(), &leaf.bytes)
            .map_err(|_| TreeError::Storage)?;
        Ok(match leaf.key {
            Some(key) => Cid::encrypted(leaf.hash, key),
            None => Cid::public(leaf.hash),
        })
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TreeError> {
        let leaf = encode_leaf(chunk, self.encrypt).map_err(|_| TreeError::Storage)?;
        self.store
            .put_by_hash_trusted(&leaf.hash.to_hex(), &leaf.bytes)
            .map_err(|_| TreeError::Storage)?;
        let cid = match leaf.key {
            Some(key) => Cid::encrypted(leaf.hash, key),
            None => Cid::public(leaf.hash),
        };
        self.size += chunk.len() as u64;
        self.push_link(
            0,
            Link {
                name: None,
                cid,
                size: chunk.len() as u64,
                kind: LinkKind::Blob,
            },
        )
    }

    fn push_link(&mut self, level: usize, link: Link) -> Result<(), TreeError> {
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(link);
        if self.levels[level].len() >= MAX_LINKS_PER_NODE {
            self.flush_level(level)?;
        }
        Ok(())
    }

    fn flush_level(&mut self, level: usize) -> Result<(), TreeError> {
        let links = std::mem::take(&mut self.levels[level]);
        if links.is_empty() {
            return Ok(());
        }
        let node = TreeNode { links };
        let size = node.total_size();
        let cid = Self::write_node_to(&self.store, &node, self.encrypt)?;
        self.push_link(
            level + 1,
            Link {
                name: None,
                cid,
                size,
                kind: LinkKind::Blob,
            },
        )
    }

    /// Feed more content bytes; completed chunks are written immediately.
    pub fn append(&mut self, data: &[u8]) -> Result<(), TreeError> {
        for chunk in self.splitter.append(data) {
            self.write_chunk(&chunk)?;
        }
        Ok(())
    }

    /// Flush the tail and close out the tree. Returns `(cid, size)`; the
    /// CID carries a key unless the writer was opened unencrypted.
    pub fn finalize(mut self) -> Result<(Cid, u64), TreeError> {
        if let Some(tail) = self.splitter.finish() {
            self.write_chunk(&tail)?;
        }
        if self.levels.is_empty() {
            // Empty input still produces an addressable (empty) leaf.
            let leaf = encode_leaf(&[], self.encrypt).map_err(|_| TreeError::Storage)?;
            self.store
                .put_by_hash_trusted(&leaf.hash.to_hex(), &leaf.bytes)
                .map_err(|_| TreeError::Storage)?;
            let cid = match leaf.key {
                Some(key) => Cid::encrypted(leaf.hash, key),
                None => Cid::public(leaf.hash),
            };
            return Ok((cid, 0));
        }

        let mut level = 0;
        loop {
            let is_top = level + 1 == self.levels.len();
            let links = std::mem::take(&mut self.levels[level]);
            if is_top {
                match links.len() {
                    1 => {
                        let mut links = links;
                        let link = links.remove(0);
                        return Ok((link.cid, self.size));
                    }
                    _ => {
                        let node = TreeNode { links };
                        let cid = Self::write_node_to(&self.store, &node, self.encrypt)?;
                        return Ok((cid, self.size));
                    }
                }
            }
            if !links.is_empty() {
                let node = TreeNode { links };
                let size = node.total_size();
                let cid = Self::write_node_to(&self.store, &node, self.encrypt)?;
                self.push_link(
                    level + 1,
                    Link {
                        name: None,
                        cid,
                        size,
                        kind: LinkKind::Blob,
                    },
                )?;
            }
            level += 1;
        }
    }
}

/// Lazy, ordered plaintext slices of a file range. Backs streamed HTTP
/// ranges; drop it to cancel.
pub struct RangeChunkStream<'a> {
    engine: &'a TreeEngine,
    stack: Vec<(Cid, u64)>,
    start: u64,
    end: u64,
    chunk_size: usize,
    buf: Vec<u8>,
}

impl TreeEngine {
    /// Stream `[start, end)` of a file as plaintext slices of at most
    /// `chunk_size` bytes each.
    pub fn stream_file_range_chunks(
        &self,
        cid: &Cid,
        start: u64,
        end: u64,
        chunk_size: usize,
    ) -> RangeChunkStream<'_> {
        RangeChunkStream {
            engine: self,
            stack: if start < end {
                vec![(*cid, 0)]
            } else {
                Vec::new()
            },
            start,
            end,
            chunk_size: chunk_size.max(1),
            buf: Vec::new(),
        }
    }
}

impl RangeChunkStream<'_> {
    /// Next slice in order; `Ok(None)` when the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, TreeError> {
        while self.buf.len() < self.chunk_size {
            let Some((cid, base)) = self.stack.pop() else {
                break;
            };
            match self.engine.load(&cid).await? {
                None => return Err(TreeError::NotFound),
                Some(Decoded::Leaf(plain)) => {
                    let len = plain.len() as u64;
                    let lo = self.start.saturating_sub(base).min(len);
                    let hi = self.end.saturating_sub(base).min(len);
                    if lo < hi {
                        self.buf.extend_from_slice(&plain[lo as usize..hi as usize]);
                    }
                }
                Some(Decoded::Node(node)) => {
                    let mut offset = base;
                    let mut wanted = Vec::new();
                    for link in &node.links {
                        let link_end = offset + link.size;
                        if link_end > self.start && offset < self.end {
                            wanted.push((link.cid, offset));
                        }
                        offset = link_end;
                    }
                    for item in wanted.into_iter().rev() {
                        self.stack.push(item);
                    }
                }
            }
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        let take = self.buf.len().min(self.chunk_size);
        let rest = self.buf.split_off(take);
        let out = std::mem::replace(&mut self.buf, rest);
        Ok(Some(out))
    }
}
