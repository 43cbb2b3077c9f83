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

//! Dense integer ids for 32-byte identities.

use std::collections::HashMap;

/// Dense user id.
pub type Uid = u32;

/// Bijection between hex identities and dense integer uids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniqueIds {
    by_key: HashMap<[u8; 32], Uid>,
    keys: Vec<[u8; 32]>,
}

impl UniqueIds {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uid for a raw key, assigning the next dense id if unseen.
    pub fn id_for_key(&mut self, key: [u8; 32]) -> Uid {
        if let Some(uid) = self.by_key.get(&key) {
            return *uid;
        }
        let uid = self.keys.len() as Uid;
        self.keys.push(key);
        self.by_key.insert(key, uid);
        uid
    }

    /// Uid for a hex identity, assigning if unseen. `None` on bad hex.
    pub fn id_for_hex(&mut self, hex_key: &str) -> Option<Uid> {
        let raw = hex::decode(hex_key).ok()?;
        let key: [u8; 32] = raw.try_into().ok()?;
        Some(self.id_for_key(key))
    }

    /// Uid lookup without assignment.
    pub fn get_hex(&self, hex_key: &str) -> Option<Uid> {
        let raw = hex::decode(hex_key).ok()?;
        let key: [u8; 32] = raw.try_into().ok()?;
        self.by_key.get(&key).copied()
    }

    /// Raw key for a uid.
    pub fn key(&self, uid: Uid) -> Option<&[u8; 32]> {
        self.keys.get(uid as usize)
    }

    /// Hex identity for a uid.
    pub fn hex(&self, uid: Uid) -> Option<String> {
        self.key(uid).map(hex::encode)
    }

    /// Number of assigned ids.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no ids are assigned.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut ids = UniqueIds::new();
        let a = ids.id_for_key([1u8; 32]);
        let b = ids.id_for_key([2u8; 32]);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(ids.id_for_key([1u8; 32]), a);
        assert_eq!(ids.hex(a).unwrap(), hex::encode([1u8; 32]));
        assert_eq!(ids.get_hex(&hex::encode([2u8; 32])), Some(b));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let mut ids = UniqueIds::new();
        assert!(ids.id_for_hex("zz").is_none());
        assert!(ids.id_for_hex("abcd").is_none()); // wrong length
    }
}
