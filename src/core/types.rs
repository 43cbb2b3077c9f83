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

//! Content-addressing primitives and canonical encoding helpers.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization")]
    Serialize,
    #[error("deserialization")]
    Deserialize,
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap/BTreeSet).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Defensive cap inside the deserializer to prevent memory/CPU bombs via large container lengths.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// 256-bit digest (32 bytes). Also used for convergent keys, which are
/// themselves plaintext digests.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl Hash32 {
    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    /// Construct from a slice of exactly 32 bytes.
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        if b.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Some(Self(out))
    }

    /// Return bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex string (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-char hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let raw = hex::decode(s).map_err(|_| HashParseError)?;
        Self::from_slice(&raw).ok_or(HashParseError)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex parse failure for a 32-byte digest.
#[derive(Debug, Error)]
#[error("malformed hash")]
pub struct HashParseError;

/// SHA-256 digest of `bytes`.
pub fn digest(bytes: &[u8]) -> Hash32 {
    let d = ring::digest::digest(&ring::digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    Hash32(out)
}

/// Constant-time check that `bytes` digests to `expected`.
pub fn digest_matches(expected: &Hash32, bytes: &[u8]) -> bool {
    let got = digest(bytes);
    got.0.ct_eq(&expected.0).into()
}

/// Content identifier: digest plus optional convergent key.
///
/// The key is never persisted with the block; it travels in the address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid {
    /// Digest of the stored block (ciphertext when a key is present).
    pub hash: Hash32,
    /// Convergent key (plaintext digest), present iff the content is encrypted.
    pub key: Option<Hash32>,
}

impl Cid {
    /// CID of a public (unencrypted) block.
    pub fn public(hash: Hash32) -> Self {
        Self { hash, key: None }
    }

    /// CID of an encrypted block.
    pub fn encrypted(hash: Hash32, key: Hash32) -> Self {
        Self {
            hash,
            key: Some(key),
        }
    }

    /// Whether this CID denotes encrypted content.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

/// What a tree-node link points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Opaque content block (file chunk or raw blob).
    Blob,
    /// Child directory node.
    Dir,
    /// Small content carried inline by the parent.
    Inline,
}

impl LinkKind {
    /// Wire byte. Values 3..=15 are reserved for future link kinds.
    pub fn as_byte(&self) -> u8 {
        match self {
            LinkKind::Blob => 0,
            LinkKind::Dir => 1,
            LinkKind::Inline => 2,
        }
    }

    /// Parse a wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(LinkKind::Blob),
            1 => Some(LinkKind::Dir),
            2 => Some(LinkKind::Inline),
            _ => None,
        }
    }
}

/// One child reference inside a tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    /// Entry name; `None` for ordered file chunks.
    pub name: Option<String>,
    /// Child address.
    pub cid: Cid,
    /// Total content size reachable through this link.
    pub size: u64,
    /// Link kind.
    pub kind: LinkKind,
}

/// A block whose decoded payload is a list of links.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeNode {
    /// Child links, ordered (chunk order for files, entry order for directories).
    pub links: Vec<Link>,
}

impl TreeNode {
    /// Sum of link sizes.
    pub fn total_size(&self) -> u64 {
        self.links.iter().map(|l| l.size).sum()
    }

    /// Look up a named entry.
    pub fn find(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name.as_deref() == Some(name))
    }
}

/// One federation blob server endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobServerEndpoint {
    /// Base URL, e.g. `https://blobs.example.org`.
    pub url: String,
    /// Serve GET/HEAD from this server.
    pub read: bool,
    /// Upload to this server.
    pub write: bool,
}

/// Node configuration root (TOML).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    pub node: NodeSettings,
    /// HTTP blob server.
    pub http: HttpConfig,
    /// Local cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Federation endpoints.
    #[serde(default)]
    pub transports: TransportsConfig,
    /// Peer pool settings.
    #[serde(default)]
    pub peers: PeersConfig,
}

/// Node settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (db + keys).
    pub data_dir: String,
}

/// HTTP blob-server config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address, e.g. 0.0.0.0:9090.
    pub listen_addr: String,
    /// Require a signed capability on uploads.
    #[serde(default)]
    pub require_auth: bool,
    /// Reject uploads larger than this (bytes).
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: u64,
}

fn default_max_blob_bytes() -> u64 {
    2 * 1024 * 1024
}

/// Local cache config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of the local blob store in bytes.
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Federation config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Blob servers.
    #[serde(default)]
    pub servers: Vec<BlobServerEndpoint>,
}

/// Peer pool config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Follows pool cap.
    pub follows_max: usize,
    /// Follows pool satisfaction target.
    pub follows_satisfied: usize,
    /// Other pool cap.
    pub other_max: usize,
    /// Other pool satisfaction target.
    pub other_satisfied: usize,
    /// Per-peer request deadline in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            follows_max: 10,
            follows_satisfied: 3,
            other_max: 5,
            other_satisfied: 2,
            request_timeout_ms: 1500,
        }
    }
}
