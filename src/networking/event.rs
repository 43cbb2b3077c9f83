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

//! Signed events on the publish/subscribe bus.
//!
//! `id = SHA-256(canonical array [0, pubkey, created_at, kind, tags,
//! content])`, `sig` is Ed25519 over the raw id bytes. Events carrying an
//! `expiration` tag in the past, or older than [`MAX_EVENT_AGE_SECS`],
//! are dropped by receivers.

use crate::core::security::keystore::{verify_pubkey_bytes, Keystore, Signature, SignerBackend};
use crate::core::types::digest;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Signalling event kind.
pub const SIGNALING_KIND: u64 = 25050;
/// Upload-capability event kind.
pub const UPLOAD_AUTH_KIND: u64 = 24242;
/// Events older than this are dropped (seconds).
pub const MAX_EVENT_AGE_SECS: u64 = 30;

/// Event codec/verification errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// Bad hex, bad id, or unparseable frame.
    #[error("malformed event")]
    Malformed,
    /// Signature does not verify.
    #[error("bad event signature")]
    BadSignature,
}

/// One event on the bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Hex SHA-256 of the canonical array.
    pub id: String,
    /// Author identity (hex Ed25519 key).
    pub pubkey: String,
    /// Author wall-clock seconds since the UNIX epoch.
    pub created_at: u64,
    /// Event kind.
    pub kind: u64,
    /// Tag rows `[name, ...values]`.
    pub tags: Vec<Vec<String>>,
    /// Payload (cleartext or sealed, by kind).
    pub content: String,
    /// Hex Ed25519 signature over the id bytes.
    pub sig: String,
}

/// Current wall-clock seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn canonical_bytes(
    pubkey: &str,
    created_at: u64,
    kind: u64,
    tags: &[Vec<String>],
    content: &str,
) -> Result<Vec<u8>, EventError> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    serde_json::to_vec(&arr).map_err(|_| EventError::Malformed)
}

/// Build and sign an event with the local identity.
pub fn build_event<B: SignerBackend>(
    keystore: &Keystore<B>,
    kind: u64,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<WireEvent, EventError> {
    let pubkey = keystore.public_key_hex();
    let created_at = now_secs();
    let bytes = canonical_bytes(&pubkey, created_at, kind, &tags, &content)?;
    let id = digest(&bytes);
    let sig = keystore
        .sign(id.as_bytes())
        .map_err(|_| EventError::BadSignature)?;
    Ok(WireEvent {
        id: id.to_hex(),
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig: hex::encode(sig.0),
    })
}

/// Build an event signed by a fresh ephemeral key (outer gift-wrap
/// envelopes, so observers cannot link the sender identity).
pub fn build_ephemeral_event(
    kind: u64,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<WireEvent, EventError> {
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| EventError::BadSignature)?;
    let keypair =
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| EventError::BadSignature)?;
    let pubkey = hex::encode(keypair.public_key().as_ref());
    let created_at = now_secs();
    let bytes = canonical_bytes(&pubkey, created_at, kind, &tags, &content)?;
    let id = digest(&bytes);
    let sig = keypair.sign(id.as_bytes());
    Ok(WireEvent {
        id: id.to_hex(),
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig: hex::encode(sig.as_ref()),
    })
}

impl WireEvent {
    /// Recompute the id and verify the signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let bytes = canonical_bytes(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        let id = digest(&bytes);
        if id.to_hex() != self.id {
            return Err(EventError::Malformed);
        }
        let pk_raw = hex::decode(&self.pubkey).map_err(|_| EventError::Malformed)?;
        let pk: [u8; 32] = pk_raw.try_into().map_err(|_| EventError::Malformed)?;
        let sig_raw = hex::decode(&self.sig).map_err(|_| EventError::Malformed)?;
        verify_pubkey_bytes(&pk, id.as_bytes(), &Signature(sig_raw))
            .map_err(|_| EventError::BadSignature)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(|n| n == name).unwrap_or(false))
            .and_then(|t| t.get(1))
            .map(|s| s.as_str())
    }

    /// Whether the event is expired or stale at `now` (seconds).
    pub fn is_expired(&self, now: u64) -> bool {
        if let Some(exp) = self.tag_value("expiration").and_then(|v| v.parse::<u64>().ok()) {
            if exp < now {
                return true;
            }
        }
        self.created_at + MAX_EVENT_AGE_SECS < now
    }

    /// Whether this is a hello broadcast frame.
    pub fn is_hello(&self) -> bool {
        self.tag_value("l") == Some("hello")
    }
}
