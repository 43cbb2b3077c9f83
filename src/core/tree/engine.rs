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

//! Hash-tree engine: reads and writes over the tiered block sources.
//!
//! Reads consult the local store, then the transport federation, then the
//! peer fetcher; tier errors are swallowed and fall through. Blocks that
//! arrive remotely are cached locally before being returned.

use crate::core::codec::chk::decrypt_chk;
use crate::core::codec::node::try_decode_tree_node;
use crate::core::store::blob_store::BlobStore;
use crate::core::tree::stream::{StreamOptions, TreeWriter};
use crate::core::types::{digest, Cid, Link, LinkKind, TreeNode};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Remote block tier consulted after the local store.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch a block by hex hash; implementations verify the digest.
    async fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>>;
}

/// Engine errors. Read misses are `Ok(None)`, not errors.
#[derive(Debug, Error)]
pub enum TreeError {
    /// AEAD verification failed while opening a block.
    #[error("decryption failed")]
    Decryption,
    /// A block that had to be a tree node did not decode as one.
    #[error("malformed node")]
    Malformed,
    /// Local store failed to ingest.
    #[error("storage unavailable")]
    Storage,
    /// Path component is not a directory.
    #[error("not a directory")]
    NotDirectory,
    /// A block required mid-operation was not available from any tier.
    #[error("not found")]
    NotFound,
}

/// A decoded block: interior node or leaf plaintext.
pub enum Decoded {
    /// Tree node with links.
    Node(TreeNode),
    /// Leaf content (plaintext if the CID carried a key).
    Leaf(Vec<u8>),
}

/// Directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Child address.
    pub cid: Cid,
    /// Content size under the entry.
    pub size: u64,
    /// Entry kind.
    pub kind: LinkKind,
}

/// Hash-tree engine over the tiered block sources.
pub struct TreeEngine {
    store: Arc<BlobStore>,
    transports: Option<Arc<dyn BlockSource>>,
    peers: Option<Arc<dyn BlockSource>>,
}

impl TreeEngine {
    /// Engine over a local store only.
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            transports: None,
            peers: None,
        }
    }

    /// Attach the transport federation tier.
    pub fn with_transports(mut self, transports: Arc<dyn BlockSource>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Attach the peer fetcher tier.
    pub fn with_peers(mut self, peers: Arc<dyn BlockSource>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// The local store.
    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Fetch raw block bytes through the tiers. Tier errors fall through.
    pub async fn get_block(&self, hash_hex: &str) -> Option<Vec<u8>> {
        if let Ok(Some(bytes)) = self.store.get(hash_hex) {
            return Some(bytes);
        }
        if let Some(transports) = &self.transports {
            if let Some(bytes) = transports.fetch(hash_hex).await {
                // The tier verified the digest before returning.
                let _ = self.store.put_by_hash_trusted(hash_hex, &bytes);
                return Some(bytes);
            }
        }
        if let Some(peers) = &self.peers {
            if let Some(bytes) = peers.fetch(hash_hex).await {
                let _ = self.store.put_by_hash_trusted(hash_hex, &bytes);
                return Some(bytes);
            }
        }
        None
    }

    /// Fetch and open a block: decrypt when the CID carries a key, then
    /// try the tree-node frame.
    pub async fn load(&self, cid: &Cid) -> Result<Option<Decoded>, TreeError> {
        let Some(block) = self.get_block(&cid.hash.to_hex()).await else {
            return Ok(None);
        };
        let plain = match &cid.key {
            Some(key) => decrypt_chk(&block, key).map_err(|_| TreeError::Decryption)?,
            None => block,
        };
        Ok(Some(match try_decode_tree_node(&plain) {
            Some(node) => Decoded::Node(node),
            None => Decoded::Leaf(plain),
        }))
    }

    /// Store an unencrypted raw single block. The returned CID never
    /// carries a key.
    pub async fn put_blob(&self, bytes: &[u8]) -> Result<Cid, TreeError> {
        let hash_hex = self
            .store
            .put(bytes, false)
            .map_err(|_| TreeError::Storage)?;
        // put() hashed the bytes; recompute for the typed handle.
        debug_assert_eq!(hash_hex, digest(bytes).to_hex());
        Ok(Cid::public(digest(bytes)))
    }

    /// Store an encrypted file. The returned CID always carries a key.
    pub async fn put_file(&self, bytes: &[u8]) -> Result<(Cid, u64), TreeError> {
        let mut writer = self.create_stream(StreamOptions::default());
        writer.append(bytes)?;
        writer.finalize()
    }

    /// Single-pass streaming writer.
    pub fn create_stream(&self, opts: StreamOptions) -> TreeWriter {
        TreeWriter::new(Arc::clone(&self.store), opts)
    }

    /// Store an empty directory node.
    pub fn create_directory(&self, encrypt: bool) -> Result<Cid, TreeError> {
        self.write_node(&TreeNode::default(), encrypt)
    }

    /// Read a whole file, decrypting block by block.
    pub async fn read_file(&self, cid: &Cid) -> Result<Option<Vec<u8>>, TreeError> {
        let mut out = Vec::new();
        let mut stack = vec![*cid];
        while let Some(cur) = stack.pop() {
            match self.load(&cur).await? {
                None => return Ok(None),
                Some(Decoded::Leaf(plain)) => out.extend_from_slice(&plain),
                Some(Decoded::Node(node)) => {
                    for link in node.links.iter().rev() {
                        stack.push(link.cid);
                    }
                }
            }
        }
        Ok(Some(out))
    }

    /// Read `[start, end)` of a file, skipping subtrees that cannot
    /// intersect the range.
    pub async fn read_file_range(
        &self,
        cid: &Cid,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, TreeError> {
        if start >= end {
            return Ok(Some(Vec::new()));
        }
        let mut out = Vec::new();
        // (cid, absolute offset of this subtree)
        let mut stack = vec![(*cid, 0u64)];
        while let Some((cur, base)) = stack.pop() {
            match self.load(&cur).await? {
                None => return Ok(None),
                Some(Decoded::Leaf(plain)) => {
                    let len = plain.len() as u64;
                    let lo = start.saturating_sub(base).min(len);
                    let hi = end.saturating_sub(base).min(len);
                    if lo < hi {
                        out.extend_from_slice(&plain[lo as usize..hi as usize]);
                    }
                }
                Some(Decoded::Node(node)) => {
                    let mut offset = base;
                    let mut wanted = Vec::new();
                    for link in &node.links {
                        let link_end = offset + link.size;
                        if link_end > start && offset < end {
                            wanted.push((link.cid, offset));
                        }
                        offset = link_end;
                    }
                    for item in wanted.into_iter().rev() {
                        stack.push(item);
                    }
                }
            }
        }
        Ok(Some(out))
    }

    /// Walk named directory nodes along `path` (slash-separated).
    pub async fn resolve_path(&self, cid: &Cid, path: &str) -> Result<Option<Link>, TreeError> {
        let mut current = Link {
            name: None,
            cid: *cid,
            size: 0,
            kind: LinkKind::Dir,
        };
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let node = match self.load(&current.cid).await? {
                Some(Decoded::Node(node)) => node,
                Some(Decoded::Leaf(_)) => return Err(TreeError::NotDirectory),
                None => return Ok(None),
            };
            let Some(link) = node.find(part) else {
                return Ok(None);
            };
            current = link.clone();
        }
        Ok(Some(current))
    }

    /// List a directory node.
    pub async fn list_directory(&self, cid: &Cid) -> Result<Option<Vec<DirEntry>>, TreeError> {
        match self.load(cid).await? {
            None => Ok(None),
            Some(Decoded::Leaf(_)) => Err(TreeError::NotDirectory),
            Some(Decoded::Node(node)) => Ok(Some(
                node.links
                    .iter()
                    .filter_map(|l| {
                        l.name.as_ref().map(|name| DirEntry {
                            name: name.clone(),
                            cid: l.cid,
                            size: l.size,
                            kind: l.kind,
                        })
                    })
                    .collect(),
            )),
        }
    }

    /// Functional directory update: write `name -> child` into the
    /// directory at `dir_path` under `root`, rebuilding nodes up to a new
    /// root. Cost is O(depth).
    pub async fn set_entry(
        &self,
        root: &Cid,
        dir_path: &str,
        name: &str,
        child_cid: Cid,
        child_size: u64,
        kind: LinkKind,
    ) -> Result<Cid, TreeError> {
        let parts: Vec<&str> = dir_path.split('/').filter(|p| !p.is_empty()).collect();
        let encrypt = root.is_encrypted();

        // Descend, collecting each directory node on the path. Missing
        // intermediate directories materialize empty.
        let mut chain: Vec<TreeNode> = Vec::with_capacity(parts.len() + 1);
        let mut cursor = Some(*root);
        for part in &parts {
            let node = match cursor {
                Some(cid) => match self.load(&cid).await? {
                    Some(Decoded::Node(node)) => node,
                    Some(Decoded::Leaf(_)) => return Err(TreeError::NotDirectory),
                    None => TreeNode::default(),
                },
                None => TreeNode::default(),
            };
            cursor = node.find(part).map(|l| l.cid);
            chain.push(node);
        }
        let leaf_dir = match cursor {
            Some(cid) => match self.load(&cid).await? {
                Some(Decoded::Node(node)) => node,
                Some(Decoded::Leaf(_)) => return Err(TreeError::NotDirectory),
                None => TreeNode::default(),
            },
            None => TreeNode::default(),
        };
        chain.push(leaf_dir);

        // Rebuild bottom-up.
        let (mut child_cid, mut child_size, mut child_kind, mut child_name) =
            (child_cid, child_size, kind, name.to_string());
        for (i, node) in chain.into_iter().enumerate().rev() {
            let mut node = node;
            node.links.retain(|l| l.name.as_deref() != Some(&child_name));
            node.links.push(Link {
                name: Some(child_name.clone()),
                cid: child_cid,
                size: child_size,
                kind: child_kind,
            });
            node.links.sort_by(|a, b| a.name.cmp(&b.name));

            let new_cid = self.write_node(&node, encrypt)?;
            child_size = node.total_size();
            child_cid = new_cid;
            child_kind = LinkKind::Dir;
            if i > 0 {
                child_name = parts[i - 1].to_string();
            }
        }
        Ok(child_cid)
    }

    /// Encode and store a tree node, encrypting when `encrypt` is set.
    pub(crate) fn write_node(&self, node: &TreeNode, encrypt: bool) -> Result<Cid, TreeError> {
        TreeWriter::write_node_to(&self.store, node, encrypt)
    }

    /// Content size addressed by `hash_hex`: sum of link sizes for a
    /// (public) tree node, else the raw block length.
    pub async fn get_size(&self, hash_hex: &str) -> Option<u64> {
        let block = self.get_block(hash_hex).await?;
        match try_decode_tree_node(&block) {
            Some(node) => Some(node.total_size()),
            None => Some(block.len() as u64),
        }
    }
}
