// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use hashtree::core::security::keystore::Keystore;
use hashtree::core::store::blob_store::BlobStore;
use hashtree::core::tree::{BlockSink, PushOptions, TreeEngine};
use hashtree::core::types::{digest, BlobServerEndpoint};
use hashtree::monitoring::metrics::Metrics;
use hashtree::networking::server::{router, BlobServerState};
use hashtree::networking::transports::{TransportPool, UploadEvent, UploadProgressTracker};
use std::sync::{Arc, Mutex};

struct TestServer {
    url: String,
    store: Arc<BlobStore>,
    _dir: tempfile::TempDir,
}

async fn spawn_server(require_auth: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlobStore::open(dir.path(), 1 << 30).unwrap());
    let state = Arc::new(BlobServerState {
        store: Arc::clone(&store),
        metrics: Arc::new(Metrics::new().unwrap()),
        require_auth,
        max_blob_bytes: 1 << 20,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    TestServer {
        url: format!("http://{addr}"),
        store,
        _dir: dir,
    }
}

fn endpoint(url: &str) -> BlobServerEndpoint {
    BlobServerEndpoint {
        url: url.to_string(),
        read: true,
        write: true,
    }
}

#[tokio::test]
async fn fetch_races_servers_and_verifies_digest() {
    let empty = spawn_server(false).await;
    let full = spawn_server(false).await;
    let payload = b"federated block".to_vec();
    let hash = full.store.put(&payload, false).unwrap();

    let pool = TransportPool::new(None);
    pool.set_servers(vec![endpoint(&empty.url), endpoint(&full.url)]);

    assert_eq!(pool.fetch(&hash).await, Some(payload));
    assert_eq!(pool.fetch(&digest(b"missing").to_hex()).await, None);

    let stats = pool.bandwidth_stats().borrow().clone();
    let downloaded: u64 = stats
        .iter()
        .filter(|s| s.direction == hashtree::networking::transports::Direction::Down)
        .map(|s| s.bytes)
        .sum();
    assert!(downloaded > 0);
}

#[tokio::test]
async fn upload_store_heads_then_puts_and_reports_events() {
    let keystore_dir = tempfile::tempdir().unwrap();
    let keystore = Arc::new(Keystore::open(keystore_dir.path().to_str().unwrap()).unwrap());
    let server = spawn_server(true).await;

    let pool = Arc::new(TransportPool::new(Some(keystore)));
    pool.set_servers(vec![endpoint(&server.url)]);

    let events: Arc<Mutex<Vec<UploadEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);
    let progress = Arc::new(UploadProgressTracker::new(1, 1));
    let sink = pool.create_upload_store(
        Some(Arc::new(move |ev| events2.lock().unwrap().push(ev))),
        Some(Arc::clone(&progress)),
    );

    let payload = b"signed upload".to_vec();
    let hash = digest(&payload).to_hex();
    assert!(!sink.has(&hash).await);
    sink.put(&hash, &payload).await.unwrap();
    assert!(sink.has(&hash).await);
    assert_eq!(server.store.get(&hash).unwrap().unwrap(), payload);

    // A second put is skipped via HEAD.
    sink.put(&hash, &payload).await.unwrap();
    let log = events.lock().unwrap().clone();
    assert!(matches!(log[0], UploadEvent::Uploaded { .. }));
    assert!(matches!(log[1], UploadEvent::Skipped { .. }));

    let snapshot = progress.snapshot();
    assert_eq!(snapshot.uploaded_servers, 1);
    assert_eq!(snapshot.skipped_servers, 1);
    assert_eq!(snapshot.processed_chunks, 2);
}

#[tokio::test]
async fn unsigned_uploads_are_rejected_when_auth_required() {
    let server = spawn_server(true).await;
    let pool = Arc::new(TransportPool::new(None)); // no signer
    pool.set_servers(vec![endpoint(&server.url)]);

    let sink = pool.create_upload_store(None, None);
    let payload = b"unsigned".to_vec();
    let hash = digest(&payload).to_hex();
    let err = sink.put(&hash, &payload).await.unwrap_err();
    assert!(matches!(
        err,
        hashtree::core::tree::SinkError::SignatureRequired
    ));
}

#[tokio::test]
async fn push_through_federation_end_to_end() {
    let server = spawn_server(false).await;
    let keystore_dir = tempfile::tempdir().unwrap();
    let keystore = Arc::new(Keystore::open(keystore_dir.path().to_str().unwrap()).unwrap());

    let local_dir = tempfile::tempdir().unwrap();
    let local = Arc::new(BlobStore::open(local_dir.path(), 1 << 30).unwrap());
    let engine = TreeEngine::new(Arc::clone(&local));

    let pool = Arc::new(TransportPool::new(Some(keystore)));
    pool.set_servers(vec![endpoint(&server.url)]);

    let (cid, _) = engine.put_file(b"content that travels the federation").await.unwrap();
    let sink = pool.create_upload_store(None, None);
    let result = engine.push(&cid, &sink, PushOptions::default()).await;
    assert_eq!(result.failed, 0);
    assert!(result.pushed >= 1);

    // A fresh node with only the federation configured can read it back.
    let remote_dir = tempfile::tempdir().unwrap();
    let remote_store = Arc::new(BlobStore::open(remote_dir.path(), 1 << 30).unwrap());
    let remote_engine = TreeEngine::new(remote_store).with_transports(pool);
    assert_eq!(
        remote_engine.read_file(&cid).await.unwrap().unwrap(),
        b"content that travels the federation".to_vec()
    );
}
