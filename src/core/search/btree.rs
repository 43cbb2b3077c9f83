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

//! Persistent B-tree keyword index stored as hash-tree blocks.
//!
//! Every B-tree node is a tree-node block. Internal nodes carry `Dir`
//! links named by the maximum key of the child subtree; leaves carry
//! `Blob` links named by the full posting key (`prefix || term`), each
//! pointing at a canonical-bincode posting list. Updates are functional:
//! a change rewrites the path to the root and returns the new root CID.
//! Empty leaves propagate removal upward.

use crate::core::search::tokenize::tokenize;
use crate::core::tree::engine::Decoded;
use crate::core::tree::{TreeEngine, TreeError, TreeWriter};
use crate::core::types::{
    decode_canonical_limited, encode_canonical, Cid, Link, LinkKind, TreeNode,
};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Maximum keys per B-tree node before it splits.
pub const BTREE_ORDER: usize = 16;

const MAX_POSTING_BYTES: usize = 4 * 1024 * 1024;

/// Search index errors.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Underlying block error.
    #[error("tree: {0}")]
    Tree(#[from] TreeError),
    /// A node or posting block did not decode.
    #[error("malformed index block")]
    Malformed,
}

/// One `(id, payload)` posting.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Posting {
    /// Document id.
    pub id: String,
    /// Opaque payload returned with hits.
    pub payload: String,
}

/// A ranked search hit.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    /// Document id.
    pub id: String,
    /// Fraction of query terms matched, in (0, 1].
    pub score: f64,
    /// Payload from the best posting.
    pub payload: String,
}

/// Search options.
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Posting key prefix (namespace).
    pub prefix: String,
    /// Maximum hits returned.
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            limit: 10,
        }
    }
}

struct ChildRef {
    max_key: String,
    cid: Cid,
    size: u64,
}

enum InsertOutcome {
    One(ChildRef),
    Split(ChildRef, ChildRef),
}

/// Keyword index over a hash-tree engine.
pub struct SearchIndex {
    engine: Arc<TreeEngine>,
}

impl SearchIndex {
    /// Index over `engine`.
    pub fn new(engine: Arc<TreeEngine>) -> Self {
        Self { engine }
    }

    /// Root CID of an empty index.
    pub fn empty_root(&self) -> Result<Cid, SearchError> {
        Ok(self.write_node(&TreeNode::default())?.cid)
    }

    fn write_node(&self, node: &TreeNode) -> Result<ChildRef, SearchError> {
        let cid = TreeWriter::write_node_to(self.engine.store(), node, false)?;
        let max_key = node
            .links
            .last()
            .and_then(|l| l.name.clone())
            .unwrap_or_default();
        Ok(ChildRef {
            max_key,
            cid,
            size: node.total_size(),
        })
    }

    async fn load_node(&self, cid: &Cid) -> Result<TreeNode, SearchError> {
        match self.engine.load(cid).await? {
            Some(Decoded::Node(node)) => Ok(node),
            Some(Decoded::Leaf(_)) => Err(SearchError::Malformed),
            None => Err(SearchError::Tree(TreeError::NotFound)),
        }
    }

    fn is_internal(node: &TreeNode) -> bool {
        node.links.first().map(|l| l.kind == LinkKind::Dir).unwrap_or(false)
    }

    async fn read_postings(&self, cid: &Cid) -> Result<Vec<Posting>, SearchError> {
        let Some(bytes) = self.engine.get_block(&cid.hash.to_hex()).await else {
            return Err(SearchError::Tree(TreeError::NotFound));
        };
        decode_canonical_limited(&bytes, MAX_POSTING_BYTES).map_err(|_| SearchError::Malformed)
    }

    fn write_postings(&self, postings: &[Posting]) -> Result<(Cid, u64), SearchError> {
        let bytes = encode_canonical(&postings.to_vec()).map_err(|_| SearchError::Malformed)?;
        let hash = crate::core::types::digest(&bytes);
        self.engine
            .store()
            .put_by_hash_trusted(&hash.to_hex(), &bytes)
            .map_err(|_| SearchError::Tree(TreeError::Storage))?;
        Ok((Cid::public(hash), bytes.len() as u64))
    }

    /// Insert postings for every term of a document. Returns the new root.
    pub async fn index(
        &self,
        root: &Cid,
        prefix: &str,
        terms: &[String],
        id: &str,
        payload: &str,
    ) -> Result<Cid, SearchError> {
        let mut root = *root;
        for term in terms {
            let key = format!("{prefix}{term}");
            root = self.insert_key(&root, &key, id, payload).await?;
        }
        Ok(root)
    }

    async fn insert_key(
        &self,
        root: &Cid,
        key: &str,
        id: &str,
        payload: &str,
    ) -> Result<Cid, SearchError> {
        match self.insert_rec(*root, key, id, payload).await? {
            InsertOutcome::One(child) => Ok(child.cid),
            InsertOutcome::Split(left, right) => {
                // Root split grows the tree by one level.
                let node = TreeNode {
                    links: vec![
                        Link {
                            name: Some(left.max_key),
                            cid: left.cid,
                            size: left.size,
                            kind: LinkKind::Dir,
                        },
                        Link {
                            name: Some(right.max_key),
                            cid: right.cid,
                            size: right.size,
                            kind: LinkKind::Dir,
                        },
                    ],
                };
                Ok(self.write_node(&node)?.cid)
            }
        }
    }

    fn insert_rec<'a>(
        &'a self,
        node_cid: Cid,
        key: &'a str,
        id: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<InsertOutcome, SearchError>> {
        async move {
            let mut node = self.load_node(&node_cid).await?;
            if Self::is_internal(&node) {
                // Descend into the first child whose max key covers `key`.
                let idx = node
                    .links
                    .iter()
                    .position(|l| l.name.as_deref().map(|n| key <= n).unwrap_or(false))
                    .unwrap_or(node.links.len() - 1);
                let child_cid = node.links[idx].cid;
                match self.insert_rec(child_cid, key, id, payload).await? {
                    InsertOutcome::One(child) => {
                        node.links[idx] = Link {
                            name: Some(child.max_key),
                            cid: child.cid,
                            size: child.size,
                            kind: LinkKind::Dir,
                        };
                    }
                    InsertOutcome::Split(left, right) => {
                        node.links[idx] = Link {
                            name: Some(left.max_key),
                            cid: left.cid,
                            size: left.size,
                            kind: LinkKind::Dir,
                        };
                        node.links.insert(
                            idx + 1,
                            Link {
                                name: Some(right.max_key),
                                cid: right.cid,
                                size: right.size,
                                kind: LinkKind::Dir,
                            },
                        );
                    }
                }
                return self.finish_node(node);
            }

            // Leaf: update or insert the posting link.
            let posting = match node
                .links
                .iter()
                .position(|l| l.name.as_deref() == Some(key))
            {
                Some(idx) => {
                    let mut postings = self.read_postings(&node.links[idx].cid).await?;
                    if !postings.iter().any(|p| p.id == id) {
                        postings.push(Posting {
                            id: id.to_string(),
                            payload: payload.to_string(),
                        });
                        postings.sort();
                    }
                    let (cid, size) = self.write_postings(&postings)?;
                    node.links[idx].cid = cid;
                    node.links[idx].size = size;
                    None
                }
                None => {
                    let (cid, size) = self.write_postings(&[Posting {
                        id: id.to_string(),
                        payload: payload.to_string(),
                    }])?;
                    Some(Link {
                        name: Some(key.to_string()),
                        cid,
                        size,
                        kind: LinkKind::Blob,
                    })
                }
            };
            if let Some(link) = posting {
                let at = node
                    .links
                    .iter()
                    .position(|l| l.name.as_deref().map(|n| key < n).unwrap_or(false))
                    .unwrap_or(node.links.len());
                node.links.insert(at, link);
            }
            self.finish_node(node)
        }
        .boxed()
    }

    fn finish_node(&self, node: TreeNode) -> Result<InsertOutcome, SearchError> {
        if node.links.len() <= BTREE_ORDER {
            return Ok(InsertOutcome::One(self.write_node(&node)?));
        }
        let mid = node.links.len() / 2;
        let mut links = node.links;
        let right_links = links.split_off(mid);
        let left = self.write_node(&TreeNode { links })?;
        let right = self.write_node(&TreeNode { links: right_links })?;
        Ok(InsertOutcome::Split(left, right))
    }

    /// Remove a document's postings for the given terms. Returns the new
    /// root.
    pub async fn remove(
        &self,
        root: &Cid,
        prefix: &str,
        terms: &[String],
        id: &str,
    ) -> Result<Cid, SearchError> {
        let mut root = *root;
        for term in terms {
            let key = format!("{prefix}{term}");
            if let Some(child) = self.remove_rec(root, &key, id).await? {
                root = child.cid;
            } else {
                root = self.empty_root()?;
            }
        }
        Ok(root)
    }

    fn remove_rec<'a>(
        &'a self,
        node_cid: Cid,
        key: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ChildRef>, SearchError>> {
        async move {
            let mut node = self.load_node(&node_cid).await?;
            if Self::is_internal(&node) {
                let idx = node
                    .links
                    .iter()
                    .position(|l| l.name.as_deref().map(|n| key <= n).unwrap_or(false))
                    .unwrap_or(node.links.len() - 1);
                let child_cid = node.links[idx].cid;
                match self.remove_rec(child_cid, key, id).await? {
                    Some(child) => {
                        node.links[idx] = Link {
                            name: Some(child.max_key),
                            cid: child.cid,
                            size: child.size,
                            kind: LinkKind::Dir,
                        };
                    }
                    None => {
                        node.links.remove(idx);
                    }
                }
                if node.links.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.write_node(&node)?));
            }

            let Some(idx) = node
                .links
                .iter()
                .position(|l| l.name.as_deref() == Some(key))
            else {
                return Ok(Some(self.write_node(&node)?));
            };
            let mut postings = self.read_postings(&node.links[idx].cid).await?;
            postings.retain(|p| p.id != id);
            if postings.is_empty() {
                node.links.remove(idx);
            } else {
                let (cid, size) = self.write_postings(&postings)?;
                node.links[idx].cid = cid;
                node.links[idx].size = size;
            }
            if node.links.is_empty() {
                return Ok(None);
            }
            Ok(Some(self.write_node(&node)?))
        }
        .boxed()
    }

    async fn lookup(&self, root: &Cid, key: &str) -> Result<Vec<Posting>, SearchError> {
        let mut cid = *root;
        loop {
            let node = self.load_node(&cid).await?;
            if node.links.is_empty() {
                return Ok(Vec::new());
            }
            if Self::is_internal(&node) {
                let idx = node
                    .links
                    .iter()
                    .position(|l| l.name.as_deref().map(|n| key <= n).unwrap_or(false));
                let Some(idx) = idx else {
                    return Ok(Vec::new());
                };
                cid = node.links[idx].cid;
                continue;
            }
            return match node.links.iter().find(|l| l.name.as_deref() == Some(key)) {
                Some(link) => self.read_postings(&link.cid).await,
                None => Ok(Vec::new()),
            };
        }
    }

    /// Tokenize the query, gather postings per term, and rank by term
    /// overlap.
    pub async fn search(
        &self,
        root: &Cid,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut matched: HashMap<String, (u32, String)> = HashMap::new();
        for term in &terms {
            let key = format!("{}{}", options.prefix, term);
            for posting in self.lookup(root, &key).await? {
                let entry = matched.entry(posting.id).or_insert((0, posting.payload));
                entry.0 += 1;
            }
        }
        let mut hits: Vec<SearchHit> = matched
            .into_iter()
            .map(|(id, (count, payload))| SearchHit {
                id,
                score: f64::from(count) / terms.len() as f64,
                payload,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(options.limit);
        Ok(hits)
    }
}
