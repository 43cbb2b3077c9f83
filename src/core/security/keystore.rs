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

//! Node identity keystore.
//!
//! Two keys live in the data directory:
//! - `identity.key`: Ed25519 PKCS#8, signs wire events and upload
//!   capabilities.
//! - `conversation.key`: raw X25519 static secret used to derive
//!   conversation keys for gift-wrapped directed frames.
//!
//! Both are written atomically (tmp + rename) with 0600 permissions, and
//! sensitive buffers are zeroized best-effort.

use ring::{
    rand::{SecureRandom, SystemRandom},
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

/// Keystore errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// Key material did not parse.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Key generation or sealing failed.
    #[error("crypto")]
    Crypto,
    /// Signature verification failed.
    #[error("bad signature")]
    BadSignature,
}

/// Ed25519 signature bytes (expected 64).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), KeystoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| KeystoreError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| KeystoreError::Io)?;
        f.write_all(bytes).map_err(|_| KeystoreError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| KeystoreError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

/// Signer backend abstraction (HSM compatible).
pub trait SignerBackend: Send + Sync {
    /// Return public key bytes (Ed25519, 32 bytes).
    fn public_key(&self) -> [u8; 32];
    /// Sign message bytes.
    fn sign(&self, msg: &[u8]) -> Result<Signature, KeystoreError>;
}

/// Simple file-backed Ed25519 backend.
pub struct FileEd25519Backend {
    keypair: Ed25519KeyPair,
}

impl FileEd25519Backend {
    /// Load or create an Ed25519 PKCS#8 key file.
    pub fn load_or_create(path: &Path) -> Result<Self, KeystoreError> {
        if path.exists() {
            let bytes = fs::read(path).map_err(|_| KeystoreError::Io)?;
            let kp = Ed25519KeyPair::from_pkcs8(&bytes).map_err(|_| KeystoreError::InvalidKey)?;
            return Ok(Self { keypair: kp });
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| KeystoreError::Crypto)?;
        atomic_write_private(path, pkcs8.as_ref())?;

        let kp =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| KeystoreError::InvalidKey)?;
        Ok(Self { keypair: kp })
    }
}

impl SignerBackend for FileEd25519Backend {
    fn public_key(&self) -> [u8; 32] {
        let pk = self.keypair.public_key().as_ref();
        let mut out = [0u8; 32];
        out.copy_from_slice(pk);
        out
    }

    fn sign(&self, msg: &[u8]) -> Result<Signature, KeystoreError> {
        let sig = self.keypair.sign(msg);
        Ok(Signature(sig.as_ref().to_vec()))
    }
}

fn load_or_create_conversation_key(path: &Path) -> Result<StaticSecret, KeystoreError> {
    if path.exists() {
        let mut bytes = fs::read(path).map_err(|_| KeystoreError::Io)?;
        if bytes.len() != 32 {
            return Err(KeystoreError::InvalidKey);
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes);
        bytes.zeroize();
        let secret = StaticSecret::from(raw);
        raw.zeroize();
        return Ok(secret);
    }

    let rng = SystemRandom::new();
    let mut raw = [0u8; 32];
    rng.fill(&mut raw).map_err(|_| KeystoreError::Crypto)?;
    atomic_write_private(path, &raw)?;
    let secret = StaticSecret::from(raw);
    raw.zeroize();
    Ok(secret)
}

/// Keystore wrapper holding the identity and conversation keys.
pub struct Keystore<B: SignerBackend = FileEd25519Backend> {
    backend: B,
    conversation: StaticSecret,
}

impl Keystore<FileEd25519Backend> {
    /// Load or create keys under `data_dir`.
    pub fn open(data_dir: &str) -> Result<Self, KeystoreError> {
        let mut identity_path = PathBuf::from(data_dir);
        identity_path.push("identity.key");
        let mut conversation_path = PathBuf::from(data_dir);
        conversation_path.push("conversation.key");

        let backend = FileEd25519Backend::load_or_create(&identity_path)?;
        let conversation = load_or_create_conversation_key(&conversation_path)?;
        Ok(Self {
            backend,
            conversation,
        })
    }
}

impl<B: SignerBackend> Keystore<B> {
    /// Identity public key (Ed25519).
    pub fn public_key(&self) -> [u8; 32] {
        self.backend.public_key()
    }

    /// Identity public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Sign with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Result<Signature, KeystoreError> {
        self.backend.sign(msg)
    }

    /// X25519 public half of the conversation key.
    pub fn conversation_public(&self) -> [u8; 32] {
        X25519Public::from(&self.conversation).to_bytes()
    }

    /// X25519 static secret (used for conversation-key agreement).
    pub fn conversation_secret(&self) -> &StaticSecret {
        &self.conversation
    }
}

/// Verify an Ed25519 signature given raw pubkey bytes.
pub fn verify_pubkey_bytes(
    pk_bytes: &[u8; 32],
    msg: &[u8],
    sig: &Signature,
) -> Result<(), KeystoreError> {
    // ring requires signature length 64 for Ed25519
    if sig.0.len() != 64 {
        return Err(KeystoreError::BadSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
    pk.verify(msg, &sig.0)
        .map_err(|_| KeystoreError::BadSignature)
}
