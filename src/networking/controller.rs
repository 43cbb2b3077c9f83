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

//! Signalling/discovery controller.
//!
//! Discovers peers via cleartext hello broadcasts, negotiates WebRTC data
//! channels through gift-wrapped directed frames, and answers
//! `get(hash)` over the channels. The controller never writes relay
//! frames itself: it publishes through the injected [`SignalBus`] and
//! drives the WebRTC proxy through the injected [`WebRtcProxy`]; events
//! come back through `handle_signaling_message` and
//! `handle_proxy_event`. Undecryptable and expired events are dropped
//! silently.

use crate::core::privacy::PrivacyGuard;
use crate::core::store::blob_store::BlobStore;
use crate::core::types::{decode_canonical_limited, digest_matches, encode_canonical, Hash32};
use crate::monitoring::metrics::Metrics;
use crate::networking::event::{
    build_ephemeral_event, build_event, now_secs, WireEvent, SIGNALING_KIND,
};
use crate::networking::fetcher::{PeerFetcher, PeerNetwork};
use crate::networking::giftwrap::{seal, unseal};
use crate::networking::peers::{
    Peer, PeerFsm, PeerId, PeerMap, PeerPool, PeerRole, PoolsConfig,
};
use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hello broadcast cadence.
pub const HELLO_INTERVAL: Duration = Duration::from_secs(5);
/// Per-request deadline for peer asks.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);
/// Frame decode cap (block + envelope headroom).
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
/// Request fanout per ask.
pub const REQUEST_FANOUT: usize = 3;
/// A request arriving with this hop count is answered locally only.
pub const FORWARD_HOP_BUDGET: u8 = 1;
/// Directed frames expire this many seconds after sending.
const DIRECTED_FRAME_TTL_SECS: u64 = 30;

/// Publish seam to the relay bus.
pub trait SignalBus: Send + Sync {
    /// Publish one event (broadcast or p-tag directed; routing is the
    /// relay's concern).
    fn publish(&self, event: WireEvent);
}

/// SDP description kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    /// Offer from the initiator.
    Offer,
    /// Answer from the acceptor.
    Answer,
}

/// Commands to the WebRTC proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Start dialing a peer (proxy replies with a local offer).
    Connect {
        /// Target session.
        peer_id: PeerId,
    },
    /// Apply a remote offer (proxy replies with a local answer).
    AcceptOffer {
        /// Source session.
        peer_id: PeerId,
        /// Opaque SDP.
        sdp: String,
    },
    /// Apply a remote answer.
    AcceptAnswer {
        /// Source session.
        peer_id: PeerId,
        /// Opaque SDP.
        sdp: String,
    },
    /// Apply a remote ICE candidate.
    AddCandidate {
        /// Source session.
        peer_id: PeerId,
        /// Opaque candidate.
        candidate: String,
    },
    /// Send bytes over the data channel.
    Send {
        /// Target session.
        peer_id: PeerId,
        /// Frame bytes.
        payload: Vec<u8>,
    },
    /// Tear a session down.
    Close {
        /// Target session.
        peer_id: PeerId,
    },
}

/// Command seam to the WebRTC proxy.
pub trait WebRtcProxy: Send + Sync {
    /// Dispatch one command.
    fn send_command(&self, cmd: ProxyCommand);
}

/// Events bubbling back from the WebRTC proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The proxy produced a local SDP description to be signalled.
    LocalDescription {
        /// Session it belongs to.
        peer_id: PeerId,
        /// Offer or answer.
        kind: SdpKind,
        /// Opaque SDP.
        sdp: String,
    },
    /// The proxy produced a local ICE candidate to be signalled.
    LocalCandidate {
        /// Session it belongs to.
        peer_id: PeerId,
        /// Opaque candidate.
        candidate: String,
    },
    /// Data channel opened.
    Open {
        /// Session.
        peer_id: PeerId,
    },
    /// Data channel closed.
    Closed {
        /// Session.
        peer_id: PeerId,
    },
    /// Bytes arrived on the data channel.
    Message {
        /// Session.
        peer_id: PeerId,
        /// Frame bytes.
        payload: Vec<u8>,
    },
}

/// Request/response frames on the data channel (canonical bincode).
#[derive(Clone, Debug, Serialize, Deserialize)]
enum PeerFrame {
    Get {
        request_id: u64,
        hash: String,
        hop: u8,
    },
    Found {
        request_id: u64,
        bytes: Vec<u8>,
    },
    NotFound {
        request_id: u64,
    },
}

/// Controller knobs.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Pool caps and satisfaction targets.
    pub pools: PoolsConfig,
    /// Hello cadence.
    pub hello_interval: Duration,
    /// Per-ask deadline.
    pub request_timeout: Duration,
    /// Peers asked per request.
    pub fanout: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pools: PoolsConfig::default(),
            hello_interval: HELLO_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
            fanout: REQUEST_FANOUT,
        }
    }
}

struct PendingAsk {
    tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
}

struct CtrlState {
    running: bool,
    hello_task: Option<tokio::task::JoinHandle<()>>,
    peers: PeerMap,
}

struct Ctrl {
    config: ControllerConfig,
    keystore: Arc<crate::core::security::keystore::Keystore>,
    bus: Arc<dyn SignalBus>,
    proxy: Arc<dyn WebRtcProxy>,
    store: Arc<BlobStore>,
    privacy: Arc<PrivacyGuard>,
    fetcher: Arc<PeerFetcher>,
    metrics: Option<Arc<Metrics>>,
    session_peer_id: String,
    follows: Mutex<HashSet<String>>,
    state: Mutex<CtrlState>,
    pending: Mutex<HashMap<u64, PendingAsk>>,
}

/// Peer signalling/discovery controller handle.
#[derive(Clone)]
pub struct SignalController {
    inner: Arc<Ctrl>,
}

fn random_peer_id() -> String {
    let rng = SystemRandom::new();
    let mut raw = [0u8; 16];
    if rng.fill(&mut raw).is_err() {
        warn!("rng failure; falling back to time-derived peer id");
        return format!("{:x}", now_secs());
    }
    hex::encode(raw)
}

impl SignalController {
    /// Build a controller around the injected seams.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        keystore: Arc<crate::core::security::keystore::Keystore>,
        bus: Arc<dyn SignalBus>,
        proxy: Arc<dyn WebRtcProxy>,
        store: Arc<BlobStore>,
        privacy: Arc<PrivacyGuard>,
        fetcher: Arc<PeerFetcher>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Ctrl {
                config,
                keystore,
                bus,
                proxy,
                store,
                privacy,
                fetcher,
                metrics,
                session_peer_id: random_peer_id(),
                follows: Mutex::new(HashSet::new()),
                state: Mutex::new(CtrlState {
                    running: false,
                    hello_task: None,
                    peers: PeerMap::new(),
                }),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Session peer id advertised in hellos.
    pub fn session_peer_id(&self) -> &str {
        &self.inner.session_peer_id
    }

    /// Replace the follows set used for pool classification.
    pub fn set_follows(&self, pubkeys: HashSet<String>) {
        if let Ok(mut follows) = self.inner.follows.lock() {
            *follows = pubkeys;
        }
    }

    /// Publish a hello now and then every hello interval until `stop`.
    pub fn start(&self) {
        {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.running {
                return;
            }
            st.running = true;
        }
        self.inner.publish_hello();
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.hello_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let running = inner.state.lock().map(|st| st.running).unwrap_or(false);
                if !running {
                    break;
                }
                inner.publish_hello();
            }
        });
        if let Ok(mut st) = self.inner.state.lock() {
            st.hello_task = Some(task);
        }
        info!(peer_id = %self.inner.session_peer_id, "signalling controller started");
    }

    /// Cancel timers, close all peers, stop signalling.
    pub fn stop(&self) {
        let closed: Vec<PeerId> = {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            st.running = false;
            if let Some(task) = st.hello_task.take() {
                task.abort();
            }
            let ids: Vec<PeerId> = st.peers.iter().map(|p| p.peer_id.clone()).collect();
            for id in &ids {
                st.peers.remove(id);
            }
            ids
        };
        for peer_id in closed {
            self.inner.proxy.send_command(ProxyCommand::Close { peer_id });
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.p2p_peers.set(0);
        }
        info!("signalling controller stopped");
    }

    /// Inbound event from the relay bus.
    pub fn handle_signaling_message(&self, event: &WireEvent) {
        self.inner.handle_signaling_message(event);
    }

    /// Inbound event from the WebRTC proxy.
    pub fn handle_proxy_event(&self, event: ProxyEvent) {
        Ctrl::handle_proxy_event(&self.inner, event);
    }

    /// Ask connected peers for a block: follows pool first, bounded
    /// fanout, first digest-verified response wins. On success the block
    /// is cached locally and marked shareable.
    pub async fn get(&self, hash_hex: &str) -> Option<Vec<u8>> {
        let targets = {
            let st = self.inner.state.lock().ok()?;
            let mut ranked = st.peers.ranked_connected();
            ranked.truncate(self.inner.config.fanout);
            ranked
        };
        if targets.is_empty() {
            return None;
        }
        let bytes = self.inner.ask_peers(&targets, hash_hex, 0).await?;
        if self.inner.store.put_by_hash_trusted(hash_hex, &bytes).is_ok() {
            self.inner.privacy.mark_hash_shareable(hash_hex);
        }
        Some(bytes)
    }

    /// Snapshot of peer sessions `(peer_id, pool, connected, stats)`.
    pub fn peer_snapshot(
        &self,
    ) -> Vec<(PeerId, PeerPool, bool, crate::networking::peers::PeerStats)> {
        match self.inner.state.lock() {
            Ok(st) => st
                .peers
                .iter()
                .map(|p| {
                    (
                        p.peer_id.clone(),
                        p.pool,
                        p.fsm == PeerFsm::Connected,
                        p.stats,
                    )
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl PeerNetwork for SignalController {
    async fn get(&self, hash_hex: &str) -> Option<Vec<u8>> {
        SignalController::get(self, hash_hex).await
    }
}

impl Ctrl {
    fn publish_hello(&self) {
        let tags = vec![
            vec!["l".to_string(), "hello".to_string()],
            vec!["peerId".to_string(), self.session_peer_id.clone()],
            vec!["conv".to_string(), hex::encode(self.keystore.conversation_public())],
        ];
        match build_event(self.keystore.as_ref(), SIGNALING_KIND, tags, String::new()) {
            Ok(event) => self.bus.publish(event),
            Err(e) => warn!(err = %e, "failed to build hello"),
        }
    }

    fn handle_signaling_message(self: &Arc<Self>, event: &WireEvent) {
        if event.kind != SIGNALING_KIND {
            return;
        }
        if event.verify().is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.invalid_event_total.inc();
            }
            return;
        }
        if event.is_expired(now_secs()) {
            debug!(id = %event.id, "dropping expired signalling event");
            return;
        }
        if event.pubkey == self.keystore.public_key_hex() {
            return;
        }
        if event.is_hello() {
            self.handle_hello(event);
            return;
        }
        if event.tag_value("p") == Some(self.keystore.public_key_hex().as_str()) {
            self.handle_directed(event);
        }
    }

    fn handle_hello(self: &Arc<Self>, event: &WireEvent) {
        let Some(peer_id) = event.tag_value("peerId") else {
            return;
        };
        let Some(conv_hex) = event.tag_value("conv") else {
            return;
        };
        let conv_raw = match hex::decode(conv_hex) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let conv_pubkey: [u8; 32] = match conv_raw.try_into() {
            Ok(key) => key,
            Err(_) => return,
        };

        let pool = if self
            .follows
            .lock()
            .map(|f| f.contains(&event.pubkey))
            .unwrap_or(false)
        {
            PeerPool::Follows
        } else {
            PeerPool::Other
        };

        let initiate = {
            let mut st = match self.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.peers.get(peer_id).is_some() {
                return; // idempotent on repeated hellos
            }
            if !st.peers.should_admit(pool, &self.config.pools, Instant::now()) {
                debug!(%peer_id, ?pool, "hello not admitted");
                return;
            }
            // Deterministic tie-break: the smaller identity key dials.
            let role = if self.keystore.public_key_hex() < event.pubkey {
                PeerRole::Initiator
            } else {
                PeerRole::Acceptor
            };
            st.peers.insert(Peer {
                peer_id: peer_id.to_string(),
                pubkey: event.pubkey.clone(),
                conv_pubkey,
                pool,
                role,
                fsm: PeerFsm::New,
                stats: Default::default(),
                pending_ice: Vec::new(),
            });
            info!(%peer_id, ?pool, ?role, "peer candidate admitted");
            role == PeerRole::Initiator
        };
        if initiate {
            self.proxy.send_command(ProxyCommand::Connect {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn handle_directed(self: &Arc<Self>, event: &WireEvent) {
        // Failed unwraps are dropped without a trace to the sender.
        let Ok(inner) = unseal(&event.content, self.keystore.conversation_secret()) else {
            debug!(id = %event.id, "dropping undecryptable directed frame");
            return;
        };
        let Some(frame_type) = inner.tag_value("type").map(str::to_string) else {
            return;
        };
        let Some(peer_id) = inner.tag_value("peerId").map(str::to_string) else {
            return;
        };
        let conv_pubkey: Option<[u8; 32]> = inner
            .tag_value("conv")
            .and_then(|hex_key| hex::decode(hex_key).ok())
            .and_then(|raw| raw.try_into().ok());

        let mut commands: Vec<ProxyCommand> = Vec::new();
        {
            let mut st = match self.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            if st.peers.get(&peer_id).is_none() {
                // Offer from a peer whose hello we missed: admit as acceptor.
                let Some(conv_pubkey) = conv_pubkey else {
                    return;
                };
                let pool = if self
                    .follows
                    .lock()
                    .map(|f| f.contains(&inner.pubkey))
                    .unwrap_or(false)
                {
                    PeerPool::Follows
                } else {
                    PeerPool::Other
                };
                if !st.peers.should_admit(pool, &self.config.pools, Instant::now()) {
                    return;
                }
                st.peers.insert(Peer {
                    peer_id: peer_id.clone(),
                    pubkey: inner.pubkey.clone(),
                    conv_pubkey,
                    pool,
                    role: PeerRole::Acceptor,
                    fsm: PeerFsm::New,
                    stats: Default::default(),
                    pending_ice: Vec::new(),
                });
            }
            let Some(peer) = st.peers.get_mut(&peer_id) else {
                return;
            };
            if peer.pubkey != inner.pubkey {
                // Identity must stay pinned to the session.
                return;
            }
            match frame_type.as_str() {
                "offer" => {
                    if peer.fsm == PeerFsm::New {
                        peer.fsm = PeerFsm::Offered;
                        commands.push(ProxyCommand::AcceptOffer {
                            peer_id: peer_id.clone(),
                            sdp: inner.content.clone(),
                        });
                    }
                }
                "answer" => {
                    if peer.fsm == PeerFsm::Offered {
                        peer.fsm = PeerFsm::Answered;
                        commands.push(ProxyCommand::AcceptAnswer {
                            peer_id: peer_id.clone(),
                            sdp: inner.content.clone(),
                        });
                        for candidate in peer.pending_ice.drain(..) {
                            commands.push(ProxyCommand::AddCandidate {
                                peer_id: peer_id.clone(),
                                candidate,
                            });
                        }
                    }
                }
                "ice" => {
                    if peer.fsm >= PeerFsm::Answered {
                        commands.push(ProxyCommand::AddCandidate {
                            peer_id: peer_id.clone(),
                            candidate: inner.content.clone(),
                        });
                    } else {
                        // Buffer until the peer answers.
                        peer.pending_ice.push(inner.content.clone());
                    }
                }
                _ => {}
            }
        }
        for cmd in commands {
            self.proxy.send_command(cmd);
        }
    }

    fn handle_proxy_event(self: &Arc<Self>, event: ProxyEvent) {
        match event {
            ProxyEvent::LocalDescription { peer_id, kind, sdp } => {
                let frame_type = match kind {
                    SdpKind::Offer => "offer",
                    SdpKind::Answer => "answer",
                };
                let mut flushed: Vec<ProxyCommand> = Vec::new();
                let target = {
                    let mut st = match self.state.lock() {
                        Ok(st) => st,
                        Err(_) => return,
                    };
                    let Some(peer) = st.peers.get_mut(&peer_id) else {
                        return;
                    };
                    match kind {
                        SdpKind::Offer => {
                            if peer.fsm == PeerFsm::New {
                                peer.fsm = PeerFsm::Offered;
                            }
                        }
                        SdpKind::Answer => {
                            if peer.fsm == PeerFsm::Offered {
                                peer.fsm = PeerFsm::Answered;
                                for candidate in peer.pending_ice.drain(..) {
                                    flushed.push(ProxyCommand::AddCandidate {
                                        peer_id: peer_id.clone(),
                                        candidate,
                                    });
                                }
                            }
                        }
                    }
                    (peer.pubkey.clone(), peer.conv_pubkey)
                };
                self.send_directed(&target.0, &target.1, frame_type, sdp);
                for cmd in flushed {
                    self.proxy.send_command(cmd);
                }
            }
            ProxyEvent::LocalCandidate { peer_id, candidate } => {
                let target = {
                    let st = match self.state.lock() {
                        Ok(st) => st,
                        Err(_) => return,
                    };
                    st.peers
                        .get(&peer_id)
                        .map(|p| (p.pubkey.clone(), p.conv_pubkey))
                };
                if let Some((pubkey, conv)) = target {
                    self.send_directed(&pubkey, &conv, "ice", candidate);
                }
            }
            ProxyEvent::Open { peer_id } => {
                if let Ok(mut st) = self.state.lock() {
                    if let Some(peer) = st.peers.get_mut(&peer_id) {
                        peer.fsm = PeerFsm::Connected;
                        info!(%peer_id, "peer connected");
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.p2p_peers.inc();
                }
            }
            ProxyEvent::Closed { peer_id } => {
                let removed = self
                    .state
                    .lock()
                    .ok()
                    .and_then(|mut st| st.peers.remove(&peer_id));
                if removed.is_some() {
                    info!(%peer_id, "peer closed");
                    if let Some(metrics) = &self.metrics {
                        metrics.p2p_peers.dec();
                    }
                }
            }
            ProxyEvent::Message { peer_id, payload } => {
                self.handle_channel_message(peer_id, payload);
            }
        }
    }

    fn handle_channel_message(self: &Arc<Self>, peer_id: PeerId, payload: Vec<u8>) {
        if let Ok(mut st) = self.state.lock() {
            if let Some(peer) = st.peers.get_mut(&peer_id) {
                peer.stats.bytes_received += payload.len() as u64;
            }
        }
        let frame: PeerFrame = match decode_canonical_limited(&payload, MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.invalid_event_total.inc();
                }
                warn!(%peer_id, "invalid peer frame");
                return;
            }
        };
        match frame {
            PeerFrame::Get {
                request_id,
                hash,
                hop,
            } => {
                if let Ok(mut st) = self.state.lock() {
                    if let Some(peer) = st.peers.get_mut(&peer_id) {
                        peer.stats.requests_received += 1;
                    }
                }
                let ctrl = Arc::clone(self);
                tokio::spawn(async move {
                    ctrl.serve_peer_get(peer_id, request_id, hash, hop).await;
                });
            }
            PeerFrame::Found { request_id, bytes } => {
                if let Ok(mut st) = self.state.lock() {
                    if let Some(peer) = st.peers.get_mut(&peer_id) {
                        peer.stats.responses_received += 1;
                    }
                }
                self.resolve_pending(request_id, Some(bytes));
            }
            PeerFrame::NotFound { request_id } => {
                if let Ok(mut st) = self.state.lock() {
                    if let Some(peer) = st.peers.get_mut(&peer_id) {
                        peer.stats.responses_received += 1;
                    }
                }
                self.resolve_pending(request_id, None);
            }
        }
    }

    fn resolve_pending(&self, request_id: u64, outcome: Option<Vec<u8>>) {
        let tx = self
            .pending
            .lock()
            .ok()
            .and_then(|p| p.get(&request_id).map(|ask| ask.tx.clone()));
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }

    async fn serve_peer_get(
        self: &Arc<Self>,
        requester: PeerId,
        request_id: u64,
        hash: String,
        hop: u8,
    ) {
        // Local read under the bridge guard so a miss cannot recurse back
        // out to peers.
        let local = {
            let _guard = self.fetcher.local_read_guard();
            if self.privacy.should_serve_hash_to_peer(&hash) {
                self.store.get(&hash).ok().flatten()
            } else {
                None
            }
        };
        if let Some(bytes) = local {
            if let Some(metrics) = &self.metrics {
                metrics.blocks_served_total.inc();
            }
            self.send_response(&requester, request_id, Some(bytes));
            return;
        }

        if hop >= FORWARD_HOP_BUDGET {
            if let Ok(mut st) = self.state.lock() {
                if let Some(peer) = st.peers.get_mut(&requester) {
                    peer.stats.forwarded_suppressed += 1;
                }
            }
            self.send_response(&requester, request_id, None);
            return;
        }

        // One forward hop through the follows pool.
        let targets: Vec<PeerId> = {
            let st = match self.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            st.peers
                .ranked_connected()
                .into_iter()
                .filter(|id| *id != requester)
                .take(self.config.fanout)
                .collect()
        };
        if targets.is_empty() {
            self.send_response(&requester, request_id, None);
            return;
        }
        if let Ok(mut st) = self.state.lock() {
            if let Some(peer) = st.peers.get_mut(&requester) {
                peer.stats.forwarded_requests += 1;
            }
        }
        let resolved = self.ask_peers(&targets, &hash, hop + 1).await;
        if let Ok(mut st) = self.state.lock() {
            if let Some(peer) = st.peers.get_mut(&requester) {
                if resolved.is_some() {
                    peer.stats.forwarded_resolved += 1;
                }
            }
        }
        self.send_response(&requester, request_id, resolved);
    }

    fn send_response(&self, peer_id: &str, request_id: u64, outcome: Option<Vec<u8>>) {
        let frame = match outcome {
            Some(bytes) => PeerFrame::Found { request_id, bytes },
            None => PeerFrame::NotFound { request_id },
        };
        if self.send_frame(peer_id, &frame) {
            if let Ok(mut st) = self.state.lock() {
                if let Some(peer) = st.peers.get_mut(peer_id) {
                    peer.stats.responses_sent += 1;
                }
            }
        }
    }

    fn send_frame(&self, peer_id: &str, frame: &PeerFrame) -> bool {
        let Ok(payload) = encode_canonical(frame) else {
            return false;
        };
        if let Ok(mut st) = self.state.lock() {
            if let Some(peer) = st.peers.get_mut(peer_id) {
                peer.stats.bytes_sent += payload.len() as u64;
            } else {
                return false;
            }
        }
        self.proxy.send_command(ProxyCommand::Send {
            peer_id: peer_id.to_string(),
            payload,
        });
        true
    }

    /// Fan a `get` out to `targets` and wait for the first verified
    /// response; early-exits when every target reported not-found.
    async fn ask_peers(&self, targets: &[PeerId], hash_hex: &str, hop: u8) -> Option<Vec<u8>> {
        let expected = Hash32::from_hex(hash_hex).ok()?;
        let request_id = self.fetcher.next_request_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id, PendingAsk { tx });
        }

        let mut asked = 0usize;
        for peer_id in targets {
            let sent = self.send_frame(
                peer_id,
                &PeerFrame::Get {
                    request_id,
                    hash: hash_hex.to_string(),
                    hop,
                },
            );
            if sent {
                asked += 1;
                if let Ok(mut st) = self.state.lock() {
                    if let Some(peer) = st.peers.get_mut(peer_id) {
                        peer.stats.requests_sent += 1;
                    }
                }
            }
        }
        if asked == 0 {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&request_id);
            }
            return None;
        }

        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let mut misses = 0usize;
        let result = loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break None;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some(Some(bytes))) => {
                    if digest_matches(&expected, &bytes) {
                        if let Some(metrics) = &self.metrics {
                            metrics.blocks_fetched_total.inc();
                        }
                        break Some(bytes);
                    }
                    // Mismatching body counts as a miss.
                    misses += 1;
                    if misses >= asked {
                        break None;
                    }
                }
                Ok(Some(None)) => {
                    misses += 1;
                    if misses >= asked {
                        break None;
                    }
                }
                Ok(None) | Err(_) => break None,
            }
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request_id);
        }
        result
    }

    fn send_directed(&self, pubkey: &str, conv_pubkey: &[u8; 32], frame_type: &str, body: String) {
        let expiration = (now_secs() + DIRECTED_FRAME_TTL_SECS).to_string();
        let tags = vec![
            vec!["p".to_string(), pubkey.to_string()],
            vec!["type".to_string(), frame_type.to_string()],
            vec!["peerId".to_string(), self.session_peer_id.clone()],
            vec!["conv".to_string(), hex::encode(self.keystore.conversation_public())],
            vec!["expiration".to_string(), expiration.clone()],
        ];
        let inner = match build_event(self.keystore.as_ref(), SIGNALING_KIND, tags, body) {
            Ok(event) => event,
            Err(e) => {
                warn!(err = %e, "failed to build directed frame");
                return;
            }
        };
        let sealed = match seal(&inner, conv_pubkey) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(err = %e, "failed to seal directed frame");
                return;
            }
        };
        let outer_tags = vec![
            vec!["p".to_string(), pubkey.to_string()],
            vec!["expiration".to_string(), expiration],
        ];
        match build_ephemeral_event(SIGNALING_KIND, outer_tags, sealed) {
            Ok(outer) => self.bus.publish(outer),
            Err(e) => warn!(err = %e, "failed to wrap directed frame"),
        }
    }
}
