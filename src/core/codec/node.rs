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

//! Tree-node block frame.
//!
//! Layout: `"HTN1"` magic, varint link count, then per link
//! `varint name_len || name || hash(32) || key_flag(1) || key(32)? ||
//! varint size || kind(1)`. Payloads without the magic are leaves.
//! Kind bytes 3..=15 and magic versions `HTN2..` are reserved; a decoder
//! that meets them treats the payload as a leaf rather than failing hard.

use crate::core::codec::varint::{read_uvarint, write_uvarint};
use crate::core::types::{Cid, Hash32, Link, LinkKind, TreeNode};

/// Magic prefix distinguishing tree nodes from raw leaves.
pub const NODE_MAGIC: &[u8; 4] = b"HTN1";

/// Maximum links per encoded node. Keeps an encoded node comfortably
/// inside one block (174 * ~300 B worst case is well under 64 KiB).
pub const MAX_LINKS_PER_NODE: usize = 174;

const MAX_NAME_BYTES: u64 = 4096;

/// Encode a tree node into block bytes.
pub fn encode_tree_node(node: &TreeNode) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + node.links.len() * 48);
    out.extend_from_slice(NODE_MAGIC);
    write_uvarint(&mut out, node.links.len() as u64);
    for link in &node.links {
        let name = link.name.as_deref().unwrap_or("");
        write_uvarint(&mut out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(link.cid.hash.as_bytes());
        match &link.cid.key {
            Some(key) => {
                out.push(1);
                out.extend_from_slice(key.as_bytes());
            }
            None => out.push(0),
        }
        write_uvarint(&mut out, link.size);
        out.push(link.kind.as_byte());
    }
    out
}

/// Decode a tree node. Never fails: returns `None` when the payload is a
/// leaf (missing magic) or the frame does not parse.
pub fn try_decode_tree_node(bytes: &[u8]) -> Option<TreeNode> {
    if bytes.len() < NODE_MAGIC.len() || &bytes[..NODE_MAGIC.len()] != NODE_MAGIC {
        return None;
    }
    let mut pos = NODE_MAGIC.len();
    let count = read_uvarint(bytes, &mut pos).ok()?;
    if count > MAX_LINKS_PER_NODE as u64 {
        return None;
    }
    let mut links = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = read_uvarint(bytes, &mut pos).ok()?;
        if name_len > MAX_NAME_BYTES {
            return None;
        }
        let name_end = pos.checked_add(name_len as usize)?;
        let name_bytes = bytes.get(pos..name_end)?;
        let name = if name_len == 0 {
            None
        } else {
            Some(std::str::from_utf8(name_bytes).ok()?.to_string())
        };
        pos = name_end;

        let hash = Hash32::from_slice(bytes.get(pos..pos + 32)?)?;
        pos += 32;

        let key = match bytes.get(pos)? {
            0 => {
                pos += 1;
                None
            }
            1 => {
                pos += 1;
                let k = Hash32::from_slice(bytes.get(pos..pos + 32)?)?;
                pos += 32;
                Some(k)
            }
            _ => return None,
        };

        let size = read_uvarint(bytes, &mut pos).ok()?;
        let kind = LinkKind::from_byte(*bytes.get(pos)?)?;
        pos += 1;

        links.push(Link {
            name,
            cid: Cid { hash, key },
            size,
            kind,
        });
    }
    if pos != bytes.len() {
        return None;
    }
    Some(TreeNode { links })
}
