// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use async_trait::async_trait;
use hashtree::core::codec::chunker::{ChunkProfile, MEDIA_CHUNK_BYTES};
use hashtree::core::codec::nhash::nhash_encode;
use hashtree::core::store::blob_store::BlobStore;
use hashtree::core::tree::{BlockSink, PushOptions, SinkError, StreamOptions, TreeEngine};
use hashtree::core::types::{digest, LinkKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn engine_at(path: &std::path::Path) -> TreeEngine {
    let store = Arc::new(BlobStore::open(path, 1 << 30).unwrap());
    TreeEngine::new(store)
}

fn media_bytes(len: usize) -> Vec<u8> {
    let mut x: u64 = 0x2545f4914f6cdd1d;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

#[tokio::test]
async fn encrypted_file_roundtrip_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"hello hashtree test file";

    let cid = {
        let engine = engine_at(dir.path());
        let (cid, size) = engine.put_file(payload).await.unwrap();
        assert!(cid.key.is_some());
        assert_eq!(size, payload.len() as u64);
        assert!(nhash_encode(&cid).unwrap().starts_with("nhash1"));
        assert_eq!(
            engine.read_file(&cid).await.unwrap().unwrap(),
            payload.to_vec()
        );
        cid
    };

    // Worker restart: a fresh engine over the same persisted store.
    let engine = engine_at(dir.path());
    assert_eq!(
        engine.read_file(&cid).await.unwrap().unwrap(),
        payload.to_vec()
    );
}

#[tokio::test]
async fn put_blob_is_public_and_addressed_by_digest() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let cid = engine.put_blob(b"public block").await.unwrap();
    assert!(cid.key.is_none());
    assert_eq!(cid.hash, digest(b"public block"));
    assert_eq!(
        engine.read_file(&cid).await.unwrap().unwrap(),
        b"public block".to_vec()
    );
}

#[tokio::test]
async fn multi_chunk_stream_and_range_reads() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let data = media_bytes(2 * MEDIA_CHUNK_BYTES + 999);

    let mut writer = engine.create_stream(StreamOptions {
        profile: ChunkProfile::Media,
        unencrypted: false,
    });
    for part in data.chunks(10_000) {
        writer.append(part).unwrap();
    }
    let (cid, size) = writer.finalize().unwrap();
    assert!(cid.key.is_some());
    assert_eq!(size, data.len() as u64);

    assert_eq!(engine.read_file(&cid).await.unwrap().unwrap(), data);

    // Ranges crossing chunk boundaries and clamped past the end.
    for (start, end) in [
        (0u64, 10u64),
        (MEDIA_CHUNK_BYTES as u64 - 5, MEDIA_CHUNK_BYTES as u64 + 5),
        (size - 7, size + 100),
        (17, 17),
    ] {
        let got = engine.read_file_range(&cid, start, end).await.unwrap().unwrap();
        let lo = (start as usize).min(data.len());
        let hi = (end as usize).min(data.len());
        assert_eq!(got, data[lo.min(hi)..hi].to_vec(), "range {start}..{end}");
    }

    // Lazy range stream reassembles the same bytes in bounded slices.
    let mut stream = engine.stream_file_range_chunks(&cid, 100, size - 100, 4096);
    let mut streamed = Vec::new();
    while let Some(slice) = stream.next().await.unwrap() {
        assert!(slice.len() <= 4096);
        streamed.extend_from_slice(&slice);
    }
    assert_eq!(streamed, data[100..(size as usize - 100)].to_vec());
}

#[tokio::test]
async fn directories_resolve_and_update_functionally() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());

    let (file_a, size_a) = engine.put_file(b"alpha contents").await.unwrap();
    let (file_b, size_b) = engine.put_file(b"beta contents").await.unwrap();

    let empty_root = engine.create_directory(true).unwrap();
    let root = engine
        .set_entry(&empty_root, "docs", "a.txt", file_a, size_a, LinkKind::Blob)
        .await
        .unwrap();
    let root2 = engine
        .set_entry(&root, "docs", "b.txt", file_b, size_b, LinkKind::Blob)
        .await
        .unwrap();

    let entry = engine.resolve_path(&root2, "docs/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.cid, file_a);
    assert_eq!(
        engine.read_file(&entry.cid).await.unwrap().unwrap(),
        b"alpha contents".to_vec()
    );

    let listing = engine
        .resolve_path(&root2, "docs")
        .await
        .unwrap()
        .unwrap();
    let entries = engine.list_directory(&listing.cid).await.unwrap().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    // The first root is untouched: functional update.
    let old = engine.resolve_path(&root, "docs/b.txt").await.unwrap();
    assert!(old.is_none());
}

struct MemSink {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
    order: Mutex<Vec<String>>,
}

impl MemSink {
    fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BlockSink for MemSink {
    async fn has(&self, hash_hex: &str) -> bool {
        self.blocks.lock().unwrap().contains_key(hash_hex)
    }

    async fn put(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), SinkError> {
        self.blocks
            .lock()
            .unwrap()
            .insert(hash_hex.to_string(), bytes.to_vec());
        self.order.lock().unwrap().push(hash_hex.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn push_is_post_order_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());
    let data = media_bytes(3 * MEDIA_CHUNK_BYTES);

    let mut writer = engine.create_stream(StreamOptions {
        profile: ChunkProfile::Media,
        unencrypted: false,
    });
    writer.append(&data).unwrap();
    let (cid, _) = writer.finalize().unwrap();

    let sink = MemSink::new();
    let result = engine.push(&cid, &sink, PushOptions::default()).await;
    assert_eq!(result.failed, 0);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.pushed, 4); // 3 chunks + root node
    assert!(!result.cancelled);
    assert!(result.bytes > data.len() as u64); // AEAD overhead

    // Children land before the root.
    let order = sink.order.lock().unwrap().clone();
    assert_eq!(order.last().unwrap(), &cid.hash.to_hex());

    // Second push skips everything.
    let again = engine.push(&cid, &sink, PushOptions::default()).await;
    assert_eq!(again.pushed, 0);
    assert_eq!(again.skipped, 4);
}

#[tokio::test]
async fn walk_and_get_size() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path());

    let cid = engine.put_blob(b"sized block").await.unwrap();
    assert_eq!(
        engine.get_size(&cid.hash.to_hex()).await,
        Some(b"sized block".len() as u64)
    );

    let data = media_bytes(2 * MEDIA_CHUNK_BYTES);
    let mut writer = engine.create_stream(StreamOptions {
        profile: ChunkProfile::Media,
        unencrypted: true,
    });
    writer.append(&data).unwrap();
    let (root, size) = writer.finalize().unwrap();
    assert!(root.key.is_none());
    assert_eq!(engine.get_size(&root.hash.to_hex()).await, Some(size));

    let mut walk = engine.walk_blocks(&root);
    let mut seen = 0;
    while let Some(_block) = walk.next().await.unwrap() {
        seen += 1;
    }
    assert_eq!(seen, 3); // 2 chunks + root node
}
