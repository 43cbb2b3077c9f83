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

//! Gift wrap for directed signalling frames.
//!
//! An ephemeral X25519 key agrees with the recipient's static
//! conversation key; HKDF-SHA256 derives the AEAD key; the sealed inner
//! event is a complete signed event whose authorship is verified after
//! unsealing. Envelope: `eph_pub(32) || nonce(12) || ct+tag`, hex.

use crate::networking::event::WireEvent;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

const NONCE_LEN: usize = 12;
const CONV_SALT: &[u8] = b"hashtree-conversation-v2";
const CONV_INFO: &[u8] = b"frame";

/// Seal/unseal failures. Receivers drop failures silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GiftWrapError {
    /// Bad envelope layout or hex.
    #[error("malformed envelope")]
    Malformed,
    /// AEAD open failed or inner authorship did not verify.
    #[error("unwrap failed")]
    Failed,
}

fn conversation_key(shared: &[u8; 32]) -> Result<[u8; 32], GiftWrapError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, CONV_SALT);
    let prk = salt.extract(shared);
    let okm = prk
        .expand(&[CONV_INFO], hkdf::HKDF_SHA256)
        .map_err(|_| GiftWrapError::Failed)?;
    let mut key = [0u8; 32];
    okm.fill(&mut key).map_err(|_| GiftWrapError::Failed)?;
    Ok(key)
}

/// Seal a signed inner event to the recipient's conversation key.
pub fn seal(inner: &WireEvent, recipient_conv_pub: &[u8; 32]) -> Result<String, GiftWrapError> {
    let rng = SystemRandom::new();
    let mut eph_raw = [0u8; 32];
    rng.fill(&mut eph_raw).map_err(|_| GiftWrapError::Failed)?;
    let eph = StaticSecret::from(eph_raw);
    let eph_pub = X25519Public::from(&eph);

    let shared = eph.diffie_hellman(&X25519Public::from(*recipient_conv_pub));
    let key = conversation_key(shared.as_bytes())?;

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| GiftWrapError::Failed)?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key).map_err(|_| GiftWrapError::Failed)?;
    let sealing = LessSafeKey::new(unbound);

    let mut buf = serde_json::to_vec(inner).map_err(|_| GiftWrapError::Malformed)?;
    sealing
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
        .map_err(|_| GiftWrapError::Failed)?;

    let mut out = Vec::with_capacity(32 + NONCE_LEN + buf.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);
    Ok(hex::encode(out))
}

/// Unseal an envelope with the local conversation secret, verifying the
/// inner event's authorship.
pub fn unseal(content_hex: &str, secret: &StaticSecret) -> Result<WireEvent, GiftWrapError> {
    let raw = hex::decode(content_hex).map_err(|_| GiftWrapError::Malformed)?;
    if raw.len() < 32 + NONCE_LEN + 16 {
        return Err(GiftWrapError::Malformed);
    }
    let eph_pub: [u8; 32] = raw[..32].try_into().map_err(|_| GiftWrapError::Malformed)?;
    let nonce: [u8; NONCE_LEN] = raw[32..32 + NONCE_LEN]
        .try_into()
        .map_err(|_| GiftWrapError::Malformed)?;

    let shared = secret.diffie_hellman(&X25519Public::from(eph_pub));
    let key = conversation_key(shared.as_bytes())?;

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key).map_err(|_| GiftWrapError::Failed)?;
    let opening = LessSafeKey::new(unbound);

    let mut buf = raw[32 + NONCE_LEN..].to_vec();
    let plain = opening
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
        .map_err(|_| GiftWrapError::Failed)?;

    let inner: WireEvent = serde_json::from_slice(plain).map_err(|_| GiftWrapError::Failed)?;
    inner.verify().map_err(|_| GiftWrapError::Failed)?;
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::keystore::Keystore;
    use crate::networking::event::{build_event, SIGNALING_KIND};

    #[test]
    fn seal_unseal_roundtrip() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let sender = Keystore::open(dir_a.path().to_str().unwrap()).unwrap();
        let recipient = Keystore::open(dir_b.path().to_str().unwrap()).unwrap();

        let inner = build_event(
            &sender,
            SIGNALING_KIND,
            vec![vec!["type".into(), "offer".into()]],
            "sdp".into(),
        )
        .unwrap();

        let sealed = seal(&inner, &recipient.conversation_public()).unwrap();
        let opened = unseal(&sealed, recipient.conversation_secret()).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn wrong_recipient_fails() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let sender = Keystore::open(dirs[0].path().to_str().unwrap()).unwrap();
        let recipient = Keystore::open(dirs[1].path().to_str().unwrap()).unwrap();
        let eavesdropper = Keystore::open(dirs[2].path().to_str().unwrap()).unwrap();

        let inner = build_event(&sender, SIGNALING_KIND, vec![], "sdp".into()).unwrap();
        let sealed = seal(&inner, &recipient.conversation_public()).unwrap();
        assert!(unseal(&sealed, eavesdropper.conversation_secret()).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(
            unseal("zz", ks.conversation_secret()),
            Err(GiftWrapError::Malformed)
        );
        assert_eq!(
            unseal("00ff00", ks.conversation_secret()),
            Err(GiftWrapError::Malformed)
        );
    }
}
