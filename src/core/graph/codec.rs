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

//! Compact varint-framed binary codec for the social graph (version 2).
//!
//! ```text
//! varint version                 ; current = 2
//! varint idCount
//! repeat idCount:
//!   32 bytes raw pubkey
//!   varint uid
//! varint followListCount
//! repeat:
//!   varint owner_uid
//!   varint created_at
//!   varint targetCount
//!   repeat targetCount: varint target_uid
//! varint muteListCount           ; same shape as follow lists
//! ```
//!
//! Bounded serialization honors `max_nodes`, `max_edges`, `max_distance`
//! and `max_edges_per_node` simultaneously: edges are planned by
//! ascending BFS distance, per-owner edges are admitted up to the
//! per-node cap, an edge is emitted only if both endpoints fit inside the
//! node budget, and emission stops once the edge budget is spent.
//! Decoding tolerates any subset that respects the layout.

use crate::core::graph::engine::SocialGraph;
use crate::core::graph::ids::Uid;
use crate::core::codec::varint::{read_uvarint, write_uvarint};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Current codec version.
pub const GRAPH_CODEC_VERSION: u64 = 2;

/// Codec failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphCodecError {
    /// Bad varint or truncated frame.
    #[error("malformed graph frame")]
    Malformed,
    /// Version is not supported.
    #[error("unsupported graph codec version")]
    UnsupportedVersion,
}

/// Serialization caps; `None` means unbounded.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializeOptions {
    /// Cap on distinct identities in the output.
    pub max_nodes: Option<usize>,
    /// Cap on total emitted edges (follows plus mutes).
    pub max_edges: Option<usize>,
    /// Skip list owners farther than this from root.
    pub max_distance: Option<u32>,
    /// Cap on emitted edges per list owner.
    pub max_edges_per_node: Option<usize>,
}

impl SerializeOptions {
    fn unbounded(&self) -> bool {
        self.max_nodes.is_none()
            && self.max_edges.is_none()
            && self.max_distance.is_none()
            && self.max_edges_per_node.is_none()
    }
}

struct ListEntry {
    owner: Uid,
    created_at: u64,
    targets: Vec<Uid>,
}

fn plan_lists(
    graph: &SocialGraph,
    lists: &BTreeMap<Uid, (u64, Vec<Uid>)>,
    opts: &SerializeOptions,
    used: &mut BTreeSet<Uid>,
    edges: &mut usize,
    exhausted: &mut bool,
) -> Vec<ListEntry> {
    // Owners by ascending BFS distance, uid as the tiebreak.
    let mut owners: Vec<Uid> = lists.keys().copied().collect();
    owners.sort_by_key(|uid| (graph.distance_uid(*uid), *uid));

    let mut out = Vec::new();
    for owner in owners {
        if *exhausted {
            break;
        }
        if let Some(max_distance) = opts.max_distance {
            if graph.distance_uid(owner) > max_distance {
                continue;
            }
        }
        let (created_at, targets) = match lists.get(&owner) {
            Some(entry) => entry,
            None => continue,
        };
        let mut emitted = Vec::new();
        for target in targets {
            if let Some(max_edges) = opts.max_edges {
                if *edges >= max_edges {
                    *exhausted = true;
                    break;
                }
            }
            if let Some(per_node) = opts.max_edges_per_node {
                if emitted.len() >= per_node {
                    break;
                }
            }
            let missing = usize::from(!used.contains(&owner)) + usize::from(!used.contains(target));
            if let Some(max_nodes) = opts.max_nodes {
                if used.len() + missing > max_nodes {
                    continue;
                }
            }
            used.insert(owner);
            used.insert(*target);
            emitted.push(*target);
            *edges += 1;
        }
        if !emitted.is_empty() || opts.unbounded() {
            if opts.unbounded() {
                used.insert(owner);
            }
            out.push(ListEntry {
                owner,
                created_at: *created_at,
                targets: emitted,
            });
        }
    }
    out
}

/// Serialize a graph, honoring every cap in `opts` simultaneously.
pub fn to_binary(graph: &SocialGraph, opts: &SerializeOptions) -> Vec<u8> {
    let follow_lists: BTreeMap<Uid, (u64, Vec<Uid>)> = graph
        .follow_list_created_at
        .iter()
        .map(|(uid, ts)| {
            let targets = graph
                .followed_by_user
                .get(uid)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            (*uid, (*ts, targets))
        })
        .collect();
    let mute_lists: BTreeMap<Uid, (u64, Vec<Uid>)> = graph
        .mute_list_created_at
        .iter()
        .map(|(uid, ts)| {
            let targets = graph
                .muted_by_user
                .get(uid)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            (*uid, (*ts, targets))
        })
        .collect();

    let mut used: BTreeSet<Uid> = BTreeSet::new();
    used.insert(graph.root_uid());
    let mut edges = 0usize;
    let mut exhausted = false;

    let follows = plan_lists(graph, &follow_lists, opts, &mut used, &mut edges, &mut exhausted);
    let mutes = plan_lists(graph, &mute_lists, opts, &mut used, &mut edges, &mut exhausted);

    let mut out = Vec::new();
    write_uvarint(&mut out, GRAPH_CODEC_VERSION);
    write_uvarint(&mut out, used.len() as u64);
    for uid in &used {
        match graph.ids.key(*uid) {
            Some(key) => out.extend_from_slice(key),
            None => out.extend_from_slice(&[0u8; 32]),
        }
        write_uvarint(&mut out, u64::from(*uid));
    }
    for lists in [&follows, &mutes] {
        write_uvarint(&mut out, lists.len() as u64);
        for entry in lists.iter() {
            write_uvarint(&mut out, u64::from(entry.owner));
            write_uvarint(&mut out, entry.created_at);
            write_uvarint(&mut out, entry.targets.len() as u64);
            for target in &entry.targets {
                write_uvarint(&mut out, u64::from(*target));
            }
        }
    }
    out
}

fn read_lists(
    buf: &[u8],
    pos: &mut usize,
) -> Result<Vec<(u64, u64, Vec<u64>)>, GraphCodecError> {
    let count = read_uvarint(buf, pos).map_err(|_| GraphCodecError::Malformed)?;
    let mut out = Vec::new();
    for _ in 0..count {
        let owner = read_uvarint(buf, pos).map_err(|_| GraphCodecError::Malformed)?;
        let created_at = read_uvarint(buf, pos).map_err(|_| GraphCodecError::Malformed)?;
        let target_count = read_uvarint(buf, pos).map_err(|_| GraphCodecError::Malformed)?;
        let mut targets = Vec::new();
        for _ in 0..target_count {
            targets.push(read_uvarint(buf, pos).map_err(|_| GraphCodecError::Malformed)?);
        }
        out.push((owner, created_at, targets));
    }
    Ok(out)
}

/// Rebuild a graph rooted at `root_hex` from its binary form.
pub fn from_binary(root_hex: &str, bytes: &[u8]) -> Result<SocialGraph, GraphCodecError> {
    let mut pos = 0usize;
    let version = read_uvarint(bytes, &mut pos).map_err(|_| GraphCodecError::Malformed)?;
    if version != GRAPH_CODEC_VERSION {
        return Err(GraphCodecError::UnsupportedVersion);
    }

    let id_count = read_uvarint(bytes, &mut pos).map_err(|_| GraphCodecError::Malformed)?;
    let mut hex_by_file_uid: BTreeMap<u64, String> = BTreeMap::new();
    for _ in 0..id_count {
        let end = pos.checked_add(32).ok_or(GraphCodecError::Malformed)?;
        let key = bytes.get(pos..end).ok_or(GraphCodecError::Malformed)?;
        pos = end;
        let file_uid = read_uvarint(bytes, &mut pos).map_err(|_| GraphCodecError::Malformed)?;
        hex_by_file_uid.insert(file_uid, hex::encode(key));
    }

    let follow_lists = read_lists(bytes, &mut pos)?;
    let mute_lists = read_lists(bytes, &mut pos)?;
    if pos != bytes.len() {
        return Err(GraphCodecError::Malformed);
    }

    let mut graph = SocialGraph::new(root_hex);
    for (owner, created_at, targets) in follow_lists {
        let Some(owner_hex) = hex_by_file_uid.get(&owner) else {
            continue;
        };
        let Some(author) = graph.ids.id_for_hex(owner_hex) else {
            continue;
        };
        let target_uids: BTreeSet<Uid> = targets
            .iter()
            .filter_map(|t| hex_by_file_uid.get(t))
            .filter_map(|hex_key| graph.ids.id_for_hex(hex_key))
            .collect();
        graph.set_follow_list(author, target_uids, created_at);
    }
    for (owner, created_at, targets) in mute_lists {
        let Some(owner_hex) = hex_by_file_uid.get(&owner) else {
            continue;
        };
        let Some(author) = graph.ids.id_for_hex(owner_hex) else {
            continue;
        };
        let target_uids: BTreeSet<Uid> = targets
            .iter()
            .filter_map(|t| hex_by_file_uid.get(t))
            .filter_map(|hex_key| graph.ids.id_for_hex(hex_key))
            .collect();
        graph.set_mute_list(author, target_uids, created_at);
    }
    graph.recalculate_sync();
    Ok(graph)
}
