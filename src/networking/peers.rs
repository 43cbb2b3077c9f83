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

//! Peer bookkeeping: pools, admission, negotiation state, counters.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Peer identifier (session-scoped, hex).
pub type PeerId = String;

/// Follows-vs-other pool classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerPool {
    /// Peers the local user follows.
    Follows,
    /// Everyone else.
    Other,
}

/// Negotiation role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// We dial and send the offer.
    Initiator,
    /// We answer.
    Acceptor,
}

/// Per-peer negotiation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerFsm {
    /// Known, nothing exchanged.
    New,
    /// Offer sent or received.
    Offered,
    /// Answer exchanged; ICE may flow.
    Answered,
    /// Data channel open.
    Connected,
    /// Torn down.
    Closed,
}

/// Per-peer transfer counters. Counters vanish with the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Payload bytes sent over the data channel.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// `get` requests sent to this peer.
    pub requests_sent: u64,
    /// `get` requests received from this peer.
    pub requests_received: u64,
    /// Responses sent to this peer.
    pub responses_sent: u64,
    /// Responses received from this peer.
    pub responses_received: u64,
    /// Requests forwarded on behalf of this peer.
    pub forwarded_requests: u64,
    /// Forwarded requests that resolved.
    pub forwarded_resolved: u64,
    /// Forwards suppressed by the hop budget.
    pub forwarded_suppressed: u64,
}

/// One peer session.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Session peer id.
    pub peer_id: PeerId,
    /// Identity key (hex).
    pub pubkey: String,
    /// Static conversation key learned from the hello.
    pub conv_pubkey: [u8; 32],
    /// Pool assignment.
    pub pool: PeerPool,
    /// Negotiation role.
    pub role: PeerRole,
    /// Negotiation state.
    pub fsm: PeerFsm,
    /// Transfer counters.
    pub stats: PeerStats,
    /// ICE candidates buffered until the peer reaches `Answered`.
    pub pending_ice: Vec<String>,
}

/// Cap and satisfaction target for one pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Hard cap on connections in the pool.
    pub max: usize,
    /// Below this, new hellos are actively welcomed.
    pub satisfied: usize,
}

/// Per-pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct PoolsConfig {
    /// Follows pool.
    pub follows: PoolConfig,
    /// Everyone else.
    pub other: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            follows: PoolConfig {
                max: 10,
                satisfied: 3,
            },
            other: PoolConfig {
                max: 5,
                satisfied: 2,
            },
        }
    }
}

impl PoolsConfig {
    /// Config for a pool.
    pub fn get(&self, pool: PeerPool) -> PoolConfig {
        match pool {
            PeerPool::Follows => self.follows,
            PeerPool::Other => self.other,
        }
    }
}

/// Interval between admissions once a pool is satisfied.
pub const SATISFIED_ADMIT_INTERVAL: Duration = Duration::from_secs(15);

/// Peer map with admission control.
#[derive(Default)]
pub struct PeerMap {
    peers: HashMap<PeerId, Peer>,
    last_admit: HashMap<PeerPool, Instant>,
}

impl PeerMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup.
    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Find a peer by identity key.
    pub fn by_pubkey_mut(&mut self, pubkey: &str) -> Option<&mut Peer> {
        self.peers.values_mut().find(|p| p.pubkey == pubkey)
    }

    /// Insert a peer session.
    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.peer_id.clone(), peer);
    }

    /// Remove a session; its stats vanish with it.
    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        self.peers.remove(peer_id)
    }

    /// All sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Count sessions in a pool, `Connected` only.
    pub fn connected_count(&self, pool: PeerPool) -> usize {
        self.peers
            .values()
            .filter(|p| p.pool == pool && p.fsm == PeerFsm::Connected)
            .count()
    }

    /// Count live (non-closed) sessions in a pool.
    pub fn live_count(&self, pool: PeerPool) -> usize {
        self.peers
            .values()
            .filter(|p| p.pool == pool && p.fsm != PeerFsm::Closed)
            .count()
    }

    /// Connected peer ids, follows pool first, each pool ordered by id.
    pub fn ranked_connected(&self) -> Vec<PeerId> {
        let mut follows: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.fsm == PeerFsm::Connected && p.pool == PeerPool::Follows)
            .collect();
        let mut other: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| p.fsm == PeerFsm::Connected && p.pool == PeerPool::Other)
            .collect();
        follows.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        other.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        follows
            .into_iter()
            .chain(other)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Admission decision for an incoming hello: below the cap always;
    /// below the satisfaction target eagerly, above it rate-limited.
    pub fn should_admit(&mut self, pool: PeerPool, config: &PoolsConfig, now: Instant) -> bool {
        let pool_config = config.get(pool);
        let live = self.live_count(pool);
        if live >= pool_config.max {
            return false;
        }
        if live < pool_config.satisfied {
            self.last_admit.insert(pool, now);
            return true;
        }
        let ok = self
            .last_admit
            .get(&pool)
            .map(|last| now.duration_since(*last) >= SATISFIED_ADMIT_INTERVAL)
            .unwrap_or(true);
        if ok {
            self.last_admit.insert(pool, now);
        }
        ok
    }
}
