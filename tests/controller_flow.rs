// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use hashtree::core::privacy::PrivacyGuard;
use hashtree::core::security::keystore::Keystore;
use hashtree::core::store::blob_store::BlobStore;
use hashtree::networking::controller::{
    ControllerConfig, ProxyCommand, ProxyEvent, SdpKind, SignalBus, SignalController, WebRtcProxy,
};
use hashtree::networking::event::{build_event, now_secs, WireEvent, SIGNALING_KIND};
use hashtree::networking::fetcher::PeerFetcher;
use hashtree::networking::giftwrap::seal;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

struct CountingBus {
    events: Mutex<Vec<WireEvent>>,
}

impl CountingBus {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn hellos(&self) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.is_hello()).count()
    }
}

impl SignalBus for CountingBus {
    fn publish(&self, event: WireEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct RecordingProxy {
    commands: Mutex<Vec<ProxyCommand>>,
}

impl RecordingProxy {
    fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<ProxyCommand> {
        self.commands.lock().unwrap().clone()
    }
}

impl WebRtcProxy for RecordingProxy {
    fn send_command(&self, cmd: ProxyCommand) {
        self.commands.lock().unwrap().push(cmd);
    }
}

struct Node {
    controller: SignalController,
    keystore: Arc<Keystore>,
    store: Arc<BlobStore>,
    privacy: Arc<PrivacyGuard>,
    _dir: tempfile::TempDir,
}

fn build_node(bus: Arc<dyn SignalBus>, proxy: Arc<dyn WebRtcProxy>) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let keystore = Arc::new(Keystore::open(dir.path().to_str().unwrap()).unwrap());
    let store = Arc::new(BlobStore::open(dir.path().join("db"), 1 << 30).unwrap());
    let privacy = Arc::new(PrivacyGuard::new());
    let fetcher = Arc::new(PeerFetcher::new());
    let controller = SignalController::new(
        ControllerConfig::default(),
        Arc::clone(&keystore),
        bus,
        proxy,
        Arc::clone(&store),
        Arc::clone(&privacy),
        Arc::clone(&fetcher),
        None,
    );
    fetcher.set_network(Arc::new(controller.clone()));
    Node {
        controller,
        keystore,
        store,
        privacy,
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn hello_cadence_is_one_then_every_five_seconds() {
    let bus = Arc::new(CountingBus::new());
    let proxy = Arc::new(RecordingProxy::new());
    let node = build_node(bus.clone(), proxy);

    node.controller.start();
    assert_eq!(bus.hellos(), 1);

    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(bus.hellos(), 2);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(bus.hellos(), 3);

    node.controller.stop();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(bus.hellos(), 3);
}

#[tokio::test(start_paused = true)]
async fn ice_is_buffered_until_answered() {
    let bus = Arc::new(CountingBus::new());
    let proxy = Arc::new(RecordingProxy::new());
    let node = build_node(bus.clone(), proxy.clone());

    // A remote sender whose hello we never saw.
    let sender_dir = tempfile::tempdir().unwrap();
    let sender = Keystore::open(sender_dir.path().to_str().unwrap()).unwrap();
    let directed = |frame_type: &str, body: &str| -> WireEvent {
        let tags = vec![
            vec!["p".to_string(), node.keystore.public_key_hex()],
            vec!["type".to_string(), frame_type.to_string()],
            vec!["peerId".to_string(), "remote-1".to_string()],
            vec!["conv".to_string(), hex::encode(sender.conversation_public())],
            vec!["expiration".to_string(), (now_secs() + 30).to_string()],
        ];
        let inner = build_event(&sender, SIGNALING_KIND, tags, body.to_string()).unwrap();
        let sealed = seal(&inner, &node.keystore.conversation_public()).unwrap();
        hashtree::networking::event::build_ephemeral_event(
            SIGNALING_KIND,
            vec![
                vec!["p".to_string(), node.keystore.public_key_hex()],
                vec!["expiration".to_string(), (now_secs() + 30).to_string()],
            ],
            sealed,
        )
        .unwrap()
    };

    node.controller.handle_signaling_message(&directed("offer", "sdp-offer"));
    assert!(matches!(
        proxy.commands().last(),
        Some(ProxyCommand::AcceptOffer { .. })
    ));

    // ICE before our answer is buffered, not forwarded.
    node.controller.handle_signaling_message(&directed("ice", "candidate-1"));
    assert!(!proxy
        .commands()
        .iter()
        .any(|c| matches!(c, ProxyCommand::AddCandidate { .. })));

    // Our answer flushes the buffer.
    node.controller.handle_proxy_event(ProxyEvent::LocalDescription {
        peer_id: "remote-1".to_string(),
        kind: SdpKind::Answer,
        sdp: "sdp-answer".to_string(),
    });
    let commands = proxy.commands();
    assert!(commands.iter().any(|c| matches!(
        c,
        ProxyCommand::AddCandidate { candidate, .. } if candidate == "candidate-1"
    )));

    // Further ICE flows straight through.
    node.controller.handle_signaling_message(&directed("ice", "candidate-2"));
    assert!(proxy.commands().iter().any(|c| matches!(
        c,
        ProxyCommand::AddCandidate { candidate, .. } if candidate == "candidate-2"
    )));
}

// ---- two linked nodes ----------------------------------------------------

struct LinkedBus {
    peer: OnceLock<SignalController>,
}

impl SignalBus for LinkedBus {
    fn publish(&self, event: WireEvent) {
        if let Some(peer) = self.peer.get() {
            peer.handle_signaling_message(&event);
        }
    }
}

struct LinkedProxy {
    local: OnceLock<SignalController>,
    remote: OnceLock<SignalController>,
    local_session: OnceLock<String>,
}

impl LinkedProxy {
    fn new() -> Self {
        Self {
            local: OnceLock::new(),
            remote: OnceLock::new(),
            local_session: OnceLock::new(),
        }
    }
}

impl WebRtcProxy for LinkedProxy {
    fn send_command(&self, cmd: ProxyCommand) {
        let (Some(local), Some(remote), Some(local_session)) =
            (self.local.get(), self.remote.get(), self.local_session.get())
        else {
            return;
        };
        match cmd {
            ProxyCommand::Connect { peer_id } => {
                local.handle_proxy_event(ProxyEvent::LocalDescription {
                    peer_id,
                    kind: SdpKind::Offer,
                    sdp: "offer-sdp".to_string(),
                });
            }
            ProxyCommand::AcceptOffer { peer_id, .. } => {
                local.handle_proxy_event(ProxyEvent::LocalDescription {
                    peer_id,
                    kind: SdpKind::Answer,
                    sdp: "answer-sdp".to_string(),
                });
            }
            ProxyCommand::AcceptAnswer { peer_id, .. } => {
                // Both data channels open.
                local.handle_proxy_event(ProxyEvent::Open { peer_id });
                remote.handle_proxy_event(ProxyEvent::Open {
                    peer_id: local_session.clone(),
                });
            }
            ProxyCommand::AddCandidate { .. } => {}
            ProxyCommand::Send { payload, .. } => {
                remote.handle_proxy_event(ProxyEvent::Message {
                    peer_id: local_session.clone(),
                    payload,
                });
            }
            ProxyCommand::Close { .. } => {}
        }
    }
}

fn link_nodes() -> (Node, Node) {
    let bus_a = Arc::new(LinkedBus {
        peer: OnceLock::new(),
    });
    let bus_b = Arc::new(LinkedBus {
        peer: OnceLock::new(),
    });
    let proxy_a = Arc::new(LinkedProxy::new());
    let proxy_b = Arc::new(LinkedProxy::new());

    let a = build_node(bus_a.clone(), proxy_a.clone());
    let b = build_node(bus_b.clone(), proxy_b.clone());

    let _ = bus_a.peer.set(b.controller.clone());
    let _ = bus_b.peer.set(a.controller.clone());
    let _ = proxy_a.local.set(a.controller.clone());
    let _ = proxy_a.remote.set(b.controller.clone());
    let _ = proxy_a
        .local_session
        .set(a.controller.session_peer_id().to_string());
    let _ = proxy_b.local.set(b.controller.clone());
    let _ = proxy_b.remote.set(a.controller.clone());
    let _ = proxy_b
        .local_session
        .set(b.controller.session_peer_id().to_string());
    (a, b)
}

#[tokio::test]
async fn peers_negotiate_and_serve_blocks() {
    let (a, b) = link_nodes();
    a.controller.start();
    b.controller.start();

    // Hello exchange plus the scripted negotiation connects both sides.
    let a_connected = a.controller.peer_snapshot().iter().any(|(_, _, c, _)| *c);
    let b_connected = b.controller.peer_snapshot().iter().any(|(_, _, c, _)| *c);
    assert!(a_connected && b_connected);

    // B holds a shareable block; A fetches it over the channel.
    let payload = b"peer served block";
    let hash = b.store.put(payload, false).unwrap();
    b.privacy.mark_hash_shareable(&hash);

    let got = a.controller.get(&hash).await;
    assert_eq!(got, Some(payload.to_vec()));
    // The fetched block was cached locally and marked shareable.
    assert_eq!(a.store.get(&hash).unwrap().unwrap(), payload.to_vec());
    assert!(a.privacy.should_serve_hash_to_peer(&hash));

    // Counters moved on both sides.
    let a_stats = &a.controller.peer_snapshot()[0].3;
    assert_eq!(a_stats.requests_sent, 1);
    assert_eq!(a_stats.responses_received, 1);
    let b_stats = &b.controller.peer_snapshot()[0].3;
    assert_eq!(b_stats.requests_received, 1);
    assert_eq!(b_stats.responses_sent, 1);

    a.controller.stop();
    b.controller.stop();
}

#[tokio::test]
async fn unshareable_blocks_are_not_served() {
    let (a, b) = link_nodes();
    a.controller.start();
    b.controller.start();

    let hash = b.store.put(b"private block", false).unwrap();
    // Never marked shareable: the peer answers not-found quickly.
    let start = std::time::Instant::now();
    assert!(a.controller.get(&hash).await.is_none());
    assert!(start.elapsed() < Duration::from_millis(1500));

    // Entirely unknown hashes are also a fast miss.
    let missing = hashtree::core::types::digest(b"nowhere").to_hex();
    assert!(a.controller.get(&missing).await.is_none());

    a.controller.stop();
    b.controller.stop();
}
