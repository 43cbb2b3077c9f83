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

//! Convergent encryption envelope (CHK).
//!
//! `key = SHA-256(plaintext)`, `nonce = key[..12]`,
//! `block = nonce || ChaCha20-Poly1305(key, nonce, plaintext)`,
//! `hash = SHA-256(block)`.
//!
//! The nonce is derived from the key and the key is unique per plaintext,
//! so the deterministic nonce never repeats under one key. Anyone holding
//! the plaintext can recreate the block; anyone without the key cannot
//! open it.

use crate::core::types::{digest, Hash32};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Nonce prefix length inside an encrypted block.
pub const NONCE_BYTES: usize = 12;
/// Poly1305 tag length appended by the AEAD.
pub const TAG_BYTES: usize = 16;

/// CHK envelope errors.
#[derive(Debug, Error)]
pub enum ChkError {
    /// AEAD sealing failed (key setup).
    #[error("encrypt")]
    Encrypt,
    /// Nonce or tag verification failed.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// An encoded leaf ready for storage.
#[derive(Clone, Debug)]
pub struct EncodedLeaf {
    /// Digest of `bytes` (the block address).
    pub hash: Hash32,
    /// Stored block bytes.
    pub bytes: Vec<u8>,
    /// Convergent key, present iff the leaf is encrypted.
    pub key: Option<Hash32>,
}

fn nonce_from_key(key: &Hash32) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce.copy_from_slice(&key.as_bytes()[..NONCE_BYTES]);
    nonce
}

/// Encrypt `plain` convergently. Returns `(hash, block, key)`.
pub fn encrypt_convergent(plain: &[u8]) -> Result<(Hash32, Vec<u8>, Hash32), ChkError> {
    let key = digest(plain);
    let nonce = nonce_from_key(&key);

    let unbound =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| ChkError::Encrypt)?;
    let sealing = LessSafeKey::new(unbound);

    let mut ct = plain.to_vec();
    sealing
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut ct)
        .map_err(|_| ChkError::Encrypt)?;

    let mut block = Vec::with_capacity(NONCE_BYTES + ct.len());
    block.extend_from_slice(&nonce);
    block.extend_from_slice(&ct);

    let hash = digest(&block);
    Ok((hash, block, key))
}

/// Open an encrypted block with its convergent key.
pub fn decrypt_chk(block: &[u8], key: &Hash32) -> Result<Vec<u8>, ChkError> {
    if block.len() < NONCE_BYTES + TAG_BYTES {
        return Err(ChkError::DecryptionFailed);
    }
    let (nonce, ct) = block.split_at(NONCE_BYTES);

    // The nonce is redundant with the key prefix; a mismatch means the
    // block was not produced under this key.
    let expected = nonce_from_key(key);
    if !bool::from(nonce.ct_eq(&expected)) {
        return Err(ChkError::DecryptionFailed);
    }

    let unbound = UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes())
        .map_err(|_| ChkError::DecryptionFailed)?;
    let opening = LessSafeKey::new(unbound);

    let mut buf = ct.to_vec();
    let plain = opening
        .open_in_place(Nonce::assume_unique_for_key(expected), Aad::empty(), &mut buf)
        .map_err(|_| ChkError::DecryptionFailed)?;
    Ok(plain.to_vec())
}

/// Encode a leaf block, optionally encrypted.
pub fn encode_leaf(plain: &[u8], encrypt: bool) -> Result<EncodedLeaf, ChkError> {
    if !encrypt {
        return Ok(EncodedLeaf {
            hash: digest(plain),
            bytes: plain.to_vec(),
            key: None,
        });
    }
    let (hash, bytes, key) = encrypt_convergent(plain)?;
    Ok(EncodedLeaf {
        hash,
        bytes,
        key: Some(key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let plain = b"hello hashtree test file";
        let (hash, block, key) = encrypt_convergent(plain).unwrap();
        assert_eq!(hash, digest(&block));
        assert_eq!(key, digest(plain));
        assert_eq!(decrypt_chk(&block, &key).unwrap(), plain.to_vec());
    }

    #[test]
    fn convergent_blocks_are_identical() {
        let a = encrypt_convergent(b"same bytes").unwrap();
        let b = encrypt_convergent(b"same bytes").unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn wrong_key_fails() {
        let (_, block, _) = encrypt_convergent(b"secret payload").unwrap();
        let wrong = digest(b"other");
        assert!(matches!(
            decrypt_chk(&block, &wrong),
            Err(ChkError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_block_fails() {
        let (_, mut block, key) = encrypt_convergent(b"secret payload").unwrap();
        let last = block.len() - 1;
        block[last] ^= 0x01;
        assert!(matches!(
            decrypt_chk(&block, &key),
            Err(ChkError::DecryptionFailed)
        ));
    }

    #[test]
    fn encode_leaf_public_has_no_key() {
        let leaf = encode_leaf(b"public bytes", false).unwrap();
        assert!(leaf.key.is_none());
        assert_eq!(leaf.hash, digest(b"public bytes"));
        assert_eq!(leaf.bytes, b"public bytes");
    }
}
