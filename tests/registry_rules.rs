// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use async_trait::async_trait;
use hashtree::core::registry::{
    RegistryConfig, RootOptions, RootPublisher, RootSource, TreeRootRegistry, TreeRootRecord,
    Visibility,
};
use hashtree::core::store::kv::{KvStore, MemKvStore};
use hashtree::core::types::digest;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingPublisher {
    calls: Mutex<Vec<(String, String, TreeRootRecord)>>,
    outcome: Mutex<bool>,
}

impl RecordingPublisher {
    fn new(outcome: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            outcome: Mutex::new(outcome),
        }
    }

    fn calls(&self) -> Vec<(String, String, TreeRootRecord)> {
        self.calls.lock().unwrap().clone()
    }

    fn set_outcome(&self, outcome: bool) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl RootPublisher for RecordingPublisher {
    async fn publish(&self, identity: &str, tree_name: &str, record: TreeRootRecord) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push((identity.to_string(), tree_name.to_string(), record));
        *self.outcome.lock().unwrap()
    }
}

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        publish_delay: Duration::from_millis(1000),
        retry_delay: Duration::from_millis(5000),
    }
}

fn registry(publisher: Arc<RecordingPublisher>) -> TreeRootRegistry {
    TreeRootRegistry::new(Arc::new(MemKvStore::new()), publisher, fast_config())
}

#[tokio::test(start_paused = true)]
async fn throttled_publish_clears_dirty_on_success() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(Arc::clone(&publisher));
    let hash = digest(b"H");

    reg.set_local("id", "tree", hash, RootOptions::default());
    let record = reg.get("id", "tree").unwrap();
    assert!(record.dirty);
    assert_eq!(record.source, RootSource::LocalWrite);
    assert!(publisher.calls().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let calls = publisher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "id");
    assert_eq!(calls[0].1, "tree");
    assert_eq!(calls[0].2.hash, hash);
    assert!(calls[0].2.dirty);
    assert!(!reg.get("id", "tree").unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn second_local_write_cancels_first_publish() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(Arc::clone(&publisher));
    let h1 = digest(b"H1");
    let h2 = digest(b"H2");

    reg.set_local("id", "tree", h1, RootOptions::default());
    tokio::time::sleep(Duration::from_millis(400)).await;
    reg.set_local("id", "tree", h2, RootOptions::default());
    tokio::time::sleep(Duration::from_millis(2000)).await;

    let calls = publisher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2.hash, h2);
}

#[tokio::test(start_paused = true)]
async fn failed_publish_retries_and_keeps_dirty() {
    let publisher = Arc::new(RecordingPublisher::new(false));
    let reg = registry(Arc::clone(&publisher));
    let hash = digest(b"H");

    reg.set_local("id", "tree", hash, RootOptions::default());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(publisher.calls().len(), 1);
    assert!(reg.get("id", "tree").unwrap().dirty);

    // Retry after the retry delay; succeed this time.
    publisher.set_outcome(true);
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(publisher.calls().len(), 2);
    assert!(!reg.get("id", "tree").unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn flush_drains_pending_immediately() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(Arc::clone(&publisher));

    reg.set_local("id", "tree", digest(b"H"), RootOptions::default());
    reg.flush_pending_publishes().await;
    assert_eq!(publisher.calls().len(), 1);
    assert!(!reg.get("id", "tree").unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn flush_with_failing_publisher_returns_and_leaves_retry_scheduled() {
    let publisher = Arc::new(RecordingPublisher::new(false));
    let reg = registry(Arc::clone(&publisher));

    reg.set_local("id", "tree", digest(b"H"), RootOptions::default());
    // Flush settles after the single immediate attempt; it must not block
    // on the retry chain.
    reg.flush_pending_publishes().await;
    assert_eq!(publisher.calls().len(), 1);
    assert!(reg.get("id", "tree").unwrap().dirty);

    // The retry is still scheduled and succeeds once the sink recovers.
    publisher.set_outcome(true);
    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(publisher.calls().len(), 2);
    assert!(!reg.get("id", "tree").unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn resolver_fills_missing_key_and_tightens_visibility() {
    // Scenario: an external prefetch stores the record, then a worker
    // with an older timestamp fills the key.
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let hash = digest(b"H");
    let key = digest(b"K");

    assert!(reg.set_from_external(
        "id",
        "tree",
        hash,
        RootSource::Prefetch,
        RootOptions {
            updated_at: Some(200),
            ..RootOptions::default()
        },
    ));
    let stored = reg.get("id", "tree").unwrap();
    assert_eq!(stored.visibility, Visibility::Public);
    assert!(stored.key.is_none());

    assert!(reg.set_from_worker(
        "id",
        "tree",
        hash,
        100,
        RootOptions {
            key: Some(key),
            visibility: Some(Visibility::LinkVisible),
            ..RootOptions::default()
        },
    ));
    let merged = reg.get("id", "tree").unwrap();
    assert_eq!(merged.hash, hash);
    assert_eq!(merged.key, Some(key));
    assert_eq!(merged.visibility, Visibility::LinkVisible);
    assert_eq!(merged.updated_at, 200); // not lowered
    assert_eq!(merged.source, RootSource::Prefetch); // unchanged

    // Visibility never loosens on a later same-hash merge.
    assert!(!reg.set_from_worker(
        "id",
        "tree",
        hash,
        150,
        RootOptions {
            visibility: Some(Visibility::Public),
            ..RootOptions::default()
        },
    ));
    assert_eq!(reg.get("id", "tree").unwrap().visibility, Visibility::LinkVisible);
}

#[tokio::test(start_paused = true)]
async fn older_hash_change_is_rejected() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let ha = digest(b"Ha");
    let hb = digest(b"Hb");

    assert!(reg.set_from_external(
        "id",
        "tree",
        ha,
        RootSource::Prefetch,
        RootOptions {
            updated_at: Some(200),
            ..RootOptions::default()
        },
    ));
    assert!(!reg.set_from_worker(
        "id",
        "tree",
        hb,
        100,
        RootOptions {
            key: Some(digest(b"K")),
            ..RootOptions::default()
        },
    ));
    let record = reg.get("id", "tree").unwrap();
    assert_eq!(record.hash, ha);
    assert!(record.key.is_none());
}

#[tokio::test(start_paused = true)]
async fn newer_and_tie_with_new_content_are_admitted() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let ha = digest(b"Ha");
    let hb = digest(b"Hb");
    let hc = digest(b"Hc");

    assert!(reg.set_from_resolver("id", "t", ha, 100, RootOptions::default()));
    // Strictly newer hash change is admitted.
    assert!(reg.set_from_resolver("id", "t", hb, 200, RootOptions::default()));
    // Tie with new hash is admitted.
    assert!(reg.set_from_resolver("id", "t", hc, 200, RootOptions::default()));
    // Tie with identical content is not.
    assert!(!reg.set_from_resolver("id", "t", hc, 200, RootOptions::default()));
    assert_eq!(reg.get("id", "t").unwrap().hash, hc);
}

#[tokio::test(start_paused = true)]
async fn dirty_record_rejects_remote_updates() {
    let publisher = Arc::new(RecordingPublisher::new(false));
    let reg = registry(publisher);
    let local = digest(b"local");
    let remote = digest(b"remote");

    reg.set_local("id", "tree", local, RootOptions::default());
    assert!(!reg.set_from_resolver("id", "tree", remote, u64::MAX, RootOptions::default()));
    assert_eq!(reg.get("id", "tree").unwrap().hash, local);
}

#[tokio::test(start_paused = true)]
async fn merge_key_fills_without_touching_metadata() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let hash = digest(b"H");
    let key = digest(b"K");

    assert!(reg.set_from_resolver("id", "tree", hash, 100, RootOptions::default()));
    assert!(reg.merge_key("id", "tree", hash, key));
    let record = reg.get("id", "tree").unwrap();
    assert_eq!(record.key, Some(key));
    assert_eq!(record.updated_at, 100);

    // Wrong hash or already-filled key is refused.
    assert!(!reg.merge_key("id", "tree", digest(b"other"), key));
    assert!(!reg.merge_key("id", "tree", hash, digest(b"K2")));
}

#[tokio::test(start_paused = true)]
async fn subscribe_sees_snapshot_then_updates() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let h1 = digest(b"H1");
    let h2 = digest(b"H2");
    assert!(reg.set_from_resolver("id", "tree", h1, 100, RootOptions::default()));

    let seen: Arc<Mutex<Vec<Option<TreeRootRecord>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let sub = reg.subscribe(
        "id",
        "tree",
        Arc::new(move |record| {
            seen2.lock().unwrap().push(record);
        }),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().unwrap().len(), 1); // snapshot first

    assert!(reg.set_from_resolver("id", "tree", h2, 200, RootOptions::default()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    {
        let log = seen.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].as_ref().unwrap().hash, h1);
        assert_eq!(log[1].as_ref().unwrap().hash, h2);
    }

    sub.unsubscribe();
    assert!(reg.set_from_resolver("id", "tree", digest(b"H3"), 300, RootOptions::default()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn resolve_waits_for_first_update() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(publisher);
    let hash = digest(b"H");

    let reg2 = reg.clone();
    let waiter = tokio::spawn(async move {
        reg2.resolve("id", "tree", Duration::from_secs(2)).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reg.set_from_resolver("id", "tree", hash, 100, RootOptions::default()));
    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.hash, hash);

    // Timeout path.
    assert!(reg
        .resolve("nobody", "tree", Duration::from_millis(100))
        .await
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn delete_cancels_pending_and_notifies_null() {
    let publisher = Arc::new(RecordingPublisher::new(true));
    let reg = registry(Arc::clone(&publisher));

    let seen: Arc<Mutex<Vec<Option<TreeRootRecord>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let _sub = reg.subscribe(
        "id",
        "tree",
        Arc::new(move |record| {
            seen2.lock().unwrap().push(record);
        }),
    );

    reg.set_local("id", "tree", digest(b"H"), RootOptions::default());
    reg.delete("id", "tree");
    assert!(reg.get("id", "tree").is_none());

    tokio::time::sleep(Duration::from_millis(3000)).await;
    // Pending publish was cancelled with the record.
    assert!(publisher.calls().is_empty());
    let log = seen.lock().unwrap();
    assert!(log.last().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn hydration_requeues_dirty_records() {
    let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
    let first_publisher = Arc::new(RecordingPublisher::new(false));
    {
        let reg = TreeRootRegistry::new(
            Arc::clone(&kv),
            Arc::clone(&first_publisher) as Arc<dyn RootPublisher>,
            fast_config(),
        );
        reg.set_local("id", "tree", digest(b"H"), RootOptions::default());
        // Shut the session down before the publish window elapses.
    }

    let second_publisher = Arc::new(RecordingPublisher::new(true));
    let reg = TreeRootRegistry::new(
        kv,
        Arc::clone(&second_publisher) as Arc<dyn RootPublisher>,
        fast_config(),
    );
    let record = reg.get("id", "tree").unwrap();
    assert!(record.dirty);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(second_publisher.calls().len(), 1);
    assert!(!reg.get("id", "tree").unwrap().dirty);
}
