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

//! Human-readable content addresses: `nhash1...`
//!
//! Bech32m over `hash || key?` with HRP `nhash`. Payload is 32 bytes for
//! public content, 64 bytes when the convergent key rides along.

use crate::core::types::{Cid, Hash32};
use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};
use thiserror::Error;

/// Human-readable prefix for content addresses.
pub const NHASH_HRP: &str = "nhash";

/// Address codec failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NhashError {
    /// Bad HRP, checksum, or payload length.
    #[error("malformed address")]
    Malformed,
}

fn hrp() -> Result<Hrp, NhashError> {
    Hrp::parse(NHASH_HRP).map_err(|_| NhashError::Malformed)
}

/// Encode a CID as `nhash1...`.
pub fn nhash_encode(cid: &Cid) -> Result<String, NhashError> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(cid.hash.as_bytes());
    if let Some(key) = &cid.key {
        payload.extend_from_slice(key.as_bytes());
    }
    bech32::encode::<Bech32m>(hrp()?, &payload).map_err(|_| NhashError::Malformed)
}

/// Decode an `nhash1...` string back into a CID.
pub fn nhash_decode(s: &str) -> Result<Cid, NhashError> {
    let checked = CheckedHrpstring::new::<Bech32m>(s).map_err(|_| NhashError::Malformed)?;
    if checked.hrp() != hrp()? {
        return Err(NhashError::Malformed);
    }
    let payload: Vec<u8> = checked.byte_iter().collect();
    match payload.len() {
        32 => {
            let hash = Hash32::from_slice(&payload).ok_or(NhashError::Malformed)?;
            Ok(Cid::public(hash))
        }
        64 => {
            let hash = Hash32::from_slice(&payload[..32]).ok_or(NhashError::Malformed)?;
            let key = Hash32::from_slice(&payload[32..]).ok_or(NhashError::Malformed)?;
            Ok(Cid::encrypted(hash, key))
        }
        _ => Err(NhashError::Malformed),
    }
}
