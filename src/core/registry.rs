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

//! Tree-root registry: mutable `(identity, tree-name) -> root` map with
//! subscriptions, last-writer-wins merge rules, and throttled publishing.
//!
//! Merge rules: a remote update is admitted iff it is strictly newer, or
//! ties in `updated_at` with new hash-or-key content, or leaves the hash
//! unchanged while filling at least one missing metadata field. A dirty
//! record (local write not yet acknowledged as published) is never
//! overwritten by a remote source. Same-hash merges may tighten
//! visibility, never loosen it, and never lower `updated_at`.

use crate::core::store::kv::KvStore;
use crate::core::types::Hash32;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Persisted snapshot key in the local key-value store.
pub const LOCAL_ROOT_CACHE_KEY: &str = "hashtree:localRootCache";

/// Default delay before a local write is published.
pub const DEFAULT_PUBLISH_DELAY: Duration = Duration::from_millis(1000);
/// Default delay before a failed publish is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Who a record came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RootSource {
    /// Local application write.
    LocalWrite,
    /// Update observed on the external event bus.
    RemoteEvent,
    /// Background worker resolution.
    Worker,
    /// Speculative prefetch.
    Prefetch,
}

/// Record visibility; later variants are strictly tighter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Anyone may resolve the record.
    Public,
    /// Only holders of the link key.
    LinkVisible,
    /// Owner only.
    Private,
}

/// One tree-root record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeRootRecord {
    /// Current root digest.
    pub hash: Hash32,
    /// Convergent key for the root, when known.
    pub key: Option<Hash32>,
    /// Visibility of the record.
    pub visibility: Visibility,
    /// Milliseconds since the UNIX epoch.
    pub updated_at: u64,
    /// Origin of the record.
    pub source: RootSource,
    /// True iff a local write has not yet been acknowledged as published.
    pub dirty: bool,
    /// Root key encrypted to a recipient.
    pub encrypted_key: Option<String>,
    /// Identifier of the wrapping key.
    pub key_id: Option<String>,
    /// Root key encrypted to the owner.
    pub self_encrypted_key: Option<String>,
    /// Link key encrypted to the owner.
    pub self_encrypted_link_key: Option<String>,
}

/// Optional fields accompanying a root update.
#[derive(Clone, Debug, Default)]
pub struct RootOptions {
    /// Convergent key.
    pub key: Option<Hash32>,
    /// Requested visibility.
    pub visibility: Option<Visibility>,
    /// Timestamp override (external sources).
    pub updated_at: Option<u64>,
    /// Root key encrypted to a recipient.
    pub encrypted_key: Option<String>,
    /// Identifier of the wrapping key.
    pub key_id: Option<String>,
    /// Root key encrypted to the owner.
    pub self_encrypted_key: Option<String>,
    /// Link key encrypted to the owner.
    pub self_encrypted_link_key: Option<String>,
}

/// Publish sink for dirty records. Returns true on success.
#[async_trait]
pub trait RootPublisher: Send + Sync {
    /// Publish one record to the external bus.
    async fn publish(&self, identity: &str, tree_name: &str, record: TreeRootRecord) -> bool;
}

/// Registry timing knobs.
#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// Delay before a local write publishes.
    pub publish_delay: Duration,
    /// Delay before a failed publish retries.
    pub retry_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            publish_delay: DEFAULT_PUBLISH_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

type KeyListener = Arc<dyn Fn(Option<TreeRootRecord>) + Send + Sync>;
type GlobalListener = Arc<dyn Fn(String, Option<TreeRootRecord>) + Send + Sync>;

enum NotifyJob {
    Key(KeyListener, Option<TreeRootRecord>),
    Global(GlobalListener, String, Option<TreeRootRecord>),
}

type AttemptWaiters = Arc<Mutex<Vec<tokio::sync::oneshot::Sender<()>>>>;

struct PendingPublish {
    generation: u64,
    kick: Arc<Notify>,
    // Flush callers parked until the next attempt settles.
    attempt_waiters: AttemptWaiters,
    handle: tokio::task::JoinHandle<()>,
}

struct State {
    records: HashMap<String, TreeRootRecord>,
    key_listeners: HashMap<String, Vec<(u64, KeyListener)>>,
    global_listeners: Vec<(u64, GlobalListener)>,
    next_listener_id: u64,
    next_generation: u64,
    pending: HashMap<String, PendingPublish>,
}

struct Inner {
    state: Mutex<State>,
    kv: Arc<dyn KvStore>,
    publisher: Arc<dyn RootPublisher>,
    config: RegistryConfig,
    notify_tx: mpsc::UnboundedSender<NotifyJob>,
}

/// Shared handle to the registry.
#[derive(Clone)]
pub struct TreeRootRegistry {
    inner: Arc<Inner>,
}

/// Handle returned by `subscribe*`; call `unsubscribe` to detach.
pub struct Subscription {
    inner: Arc<Inner>,
    key: Option<String>,
    id: u64,
}

impl Subscription {
    /// Detach the listener.
    pub fn unsubscribe(self) {
        if let Ok(mut st) = self.inner.state.lock() {
            match &self.key {
                Some(key) => {
                    if let Some(list) = st.key_listeners.get_mut(key) {
                        list.retain(|(id, _)| *id != self.id);
                    }
                }
                None => st.global_listeners.retain(|(id, _)| *id != self.id),
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn registry_key(identity: &str, tree_name: &str) -> String {
    format!("{identity}/{tree_name}")
}

fn split_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((identity, tree)) => (identity.to_string(), tree.to_string()),
        None => (key.to_string(), String::new()),
    }
}

impl TreeRootRegistry {
    /// Build a registry, hydrate the persisted snapshot, and re-queue any
    /// dirty records for publishing.
    pub fn new(
        kv: Arc<dyn KvStore>,
        publisher: Arc<dyn RootPublisher>,
        config: RegistryConfig,
    ) -> Self {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<NotifyJob>();
        tokio::spawn(async move {
            while let Some(job) = notify_rx.recv().await {
                match job {
                    NotifyJob::Key(listener, record) => listener(record),
                    NotifyJob::Global(listener, key, record) => listener(key, record),
                }
            }
        });

        let registry = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    records: HashMap::new(),
                    key_listeners: HashMap::new(),
                    global_listeners: Vec::new(),
                    next_listener_id: 0,
                    next_generation: 0,
                    pending: HashMap::new(),
                }),
                kv,
                publisher,
                config,
                notify_tx,
            }),
        };
        registry.hydrate();
        registry
    }

    // ---- reads ----------------------------------------------------------

    /// Cached record for `(identity, tree_name)`.
    pub fn get(&self, identity: &str, tree_name: &str) -> Option<TreeRootRecord> {
        self.get_by_key(&registry_key(identity, tree_name))
    }

    /// Cached record by joined key.
    pub fn get_by_key(&self, key: &str) -> Option<TreeRootRecord> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|st| st.records.get(key).cloned())
    }

    /// Whether a record exists.
    pub fn has(&self, identity: &str, tree_name: &str) -> bool {
        self.get(identity, tree_name).is_some()
    }

    /// Visibility of a record, if present.
    pub fn get_visibility(&self, identity: &str, tree_name: &str) -> Option<Visibility> {
        self.get(identity, tree_name).map(|r| r.visibility)
    }

    /// Resolve a record: the cache immediately, else the first update
    /// within `timeout`.
    pub async fn resolve(
        &self,
        identity: &str,
        tree_name: &str,
        timeout: Duration,
    ) -> Option<TreeRootRecord> {
        if let Some(record) = self.get(identity, tree_name) {
            return Some(record);
        }
        let (tx, rx) = tokio::sync::oneshot::channel::<TreeRootRecord>();
        let tx = Mutex::new(Some(tx));
        let sub = self.subscribe(
            identity,
            tree_name,
            Arc::new(move |record: Option<TreeRootRecord>| {
                if let Some(record) = record {
                    if let Ok(mut guard) = tx.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(record);
                        }
                    }
                }
            }),
        );
        let out = tokio::time::timeout(timeout, rx).await.ok().and_then(|r| r.ok());
        sub.unsubscribe();
        out
    }

    // ---- subscriptions --------------------------------------------------

    /// Subscribe to one key. If a record is present the callback receives
    /// that snapshot on the next async tick, then every future update.
    pub fn subscribe(
        &self,
        identity: &str,
        tree_name: &str,
        callback: KeyListener,
    ) -> Subscription {
        let key = registry_key(identity, tree_name);
        let id = {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => {
                    return Subscription {
                        inner: Arc::clone(&self.inner),
                        key: Some(key),
                        id: u64::MAX,
                    }
                }
            };
            let id = st.next_listener_id;
            st.next_listener_id += 1;
            st.key_listeners
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&callback)));
            if let Some(record) = st.records.get(&key).cloned() {
                let _ = self
                    .inner
                    .notify_tx
                    .send(NotifyJob::Key(Arc::clone(&callback), Some(record)));
            }
            id
        };
        Subscription {
            inner: Arc::clone(&self.inner),
            key: Some(key),
            id,
        }
    }

    /// Subscribe to every change (external bridges).
    pub fn subscribe_all(&self, callback: GlobalListener) -> Subscription {
        let id = {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => {
                    return Subscription {
                        inner: Arc::clone(&self.inner),
                        key: None,
                        id: u64::MAX,
                    }
                }
            };
            let id = st.next_listener_id;
            st.next_listener_id += 1;
            st.global_listeners.push((id, callback));
            id
        };
        Subscription {
            inner: Arc::clone(&self.inner),
            key: None,
            id,
        }
    }

    // ---- writes ---------------------------------------------------------

    /// Record a local write: dirty, `updated_at = now`, publish scheduled.
    pub fn set_local(&self, identity: &str, tree_name: &str, hash: Hash32, opts: RootOptions) {
        let key = registry_key(identity, tree_name);
        {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            let prior = st.records.get(&key);
            let record = TreeRootRecord {
                hash,
                key: opts.key.or_else(|| prior.and_then(|p| p.key)),
                visibility: opts
                    .visibility
                    .or(prior.map(|p| p.visibility))
                    .unwrap_or(Visibility::Public),
                updated_at: opts.updated_at.unwrap_or_else(now_ms),
                source: RootSource::LocalWrite,
                dirty: true,
                encrypted_key: opts.encrypted_key.or_else(|| prior.and_then(|p| p.encrypted_key.clone())),
                key_id: opts.key_id.or_else(|| prior.and_then(|p| p.key_id.clone())),
                self_encrypted_key: opts
                    .self_encrypted_key
                    .or_else(|| prior.and_then(|p| p.self_encrypted_key.clone())),
                self_encrypted_link_key: opts
                    .self_encrypted_link_key
                    .or_else(|| prior.and_then(|p| p.self_encrypted_link_key.clone())),
            };
            st.records.insert(key.clone(), record.clone());
            self.inner.persist_locked(&st);
            self.inner.notify_locked(&st, &key, Some(&record));
        }
        self.schedule_publish(&key, self.inner.config.publish_delay);
    }

    /// Admit a resolver update under the merge rules.
    pub fn set_from_resolver(
        &self,
        identity: &str,
        tree_name: &str,
        hash: Hash32,
        updated_at: u64,
        opts: RootOptions,
    ) -> bool {
        self.admit(identity, tree_name, hash, updated_at, RootSource::RemoteEvent, opts)
    }

    /// Admit a worker update under the merge rules.
    pub fn set_from_worker(
        &self,
        identity: &str,
        tree_name: &str,
        hash: Hash32,
        updated_at: u64,
        opts: RootOptions,
    ) -> bool {
        self.admit(identity, tree_name, hash, updated_at, RootSource::Worker, opts)
    }

    /// Admit an external update; `updated_at` defaults to now.
    pub fn set_from_external(
        &self,
        identity: &str,
        tree_name: &str,
        hash: Hash32,
        source: RootSource,
        opts: RootOptions,
    ) -> bool {
        let updated_at = opts.updated_at.unwrap_or_else(now_ms);
        self.admit(identity, tree_name, hash, updated_at, source, opts)
    }

    /// Fill a missing key without changing `updated_at` or `source`.
    pub fn merge_key(&self, identity: &str, tree_name: &str, hash: Hash32, key: Hash32) -> bool {
        let map_key = registry_key(identity, tree_name);
        let mut st = match self.inner.state.lock() {
            Ok(st) => st,
            Err(_) => return false,
        };
        let Some(record) = st.records.get_mut(&map_key) else {
            return false;
        };
        if record.hash != hash || record.key.is_some() {
            return false;
        }
        record.key = Some(key);
        let snapshot = record.clone();
        self.inner.persist_locked(&st);
        self.inner.notify_locked(&st, &map_key, Some(&snapshot));
        true
    }

    /// Drop a record, cancelling any pending publish.
    pub fn delete(&self, identity: &str, tree_name: &str) {
        let key = registry_key(identity, tree_name);
        let mut st = match self.inner.state.lock() {
            Ok(st) => st,
            Err(_) => return,
        };
        if let Some(pending) = st.pending.remove(&key) {
            pending.handle.abort();
        }
        if st.records.remove(&key).is_some() {
            self.inner.persist_locked(&st);
            self.inner.notify_locked(&st, &key, None);
        }
    }

    // ---- publish throttling ---------------------------------------------

    /// Cancel a pending publish without touching the record.
    pub fn cancel_pending_publish(&self, identity: &str, tree_name: &str) {
        let key = registry_key(identity, tree_name);
        if let Ok(mut st) = self.inner.state.lock() {
            if let Some(pending) = st.pending.remove(&key) {
                pending.handle.abort();
            }
        }
    }

    /// Fire every pending publish now and wait for each attempt to
    /// settle. A failed attempt leaves the record dirty with its retry
    /// still scheduled; flush does not wait for the retry chain.
    pub async fn flush_pending_publishes(&self) {
        let mut attempts = Vec::new();
        {
            let st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            for pending in st.pending.values() {
                let (tx, rx) = tokio::sync::oneshot::channel();
                if let Ok(mut waiters) = pending.attempt_waiters.lock() {
                    waiters.push(tx);
                }
                pending.kick.notify_one();
                attempts.push(rx);
            }
        }
        // A cancelled or replaced task drops its waiters; a recv error is
        // as settled as a signal.
        for rx in attempts {
            let _ = rx.await;
        }
    }

    fn schedule_publish(&self, key: &str, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let kick = Arc::new(Notify::new());
        let attempt_waiters: AttemptWaiters = Arc::new(Mutex::new(Vec::new()));

        let mut st = match self.inner.state.lock() {
            Ok(st) => st,
            Err(_) => return,
        };
        let generation = st.next_generation;
        st.next_generation += 1;

        if let Some(prior) = st.pending.remove(&key) {
            prior.handle.abort();
        }

        let task_kick = Arc::clone(&kick);
        let task_waiters = Arc::clone(&attempt_waiters);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            publish_loop(inner, task_key, generation, task_kick, task_waiters, delay).await;
        });

        st.pending.insert(
            key,
            PendingPublish {
                generation,
                kick,
                attempt_waiters,
                handle,
            },
        );
    }

    // ---- internals ------------------------------------------------------

    fn admit(
        &self,
        identity: &str,
        tree_name: &str,
        hash: Hash32,
        updated_at: u64,
        source: RootSource,
        opts: RootOptions,
    ) -> bool {
        let key = registry_key(identity, tree_name);
        let mut st = match self.inner.state.lock() {
            Ok(st) => st,
            Err(_) => return false,
        };

        let candidate_visibility = opts.visibility.unwrap_or(Visibility::Public);
        let Some(existing) = st.records.get(&key) else {
            let record = TreeRootRecord {
                hash,
                key: opts.key,
                visibility: candidate_visibility,
                updated_at,
                source,
                dirty: false,
                encrypted_key: opts.encrypted_key,
                key_id: opts.key_id,
                self_encrypted_key: opts.self_encrypted_key,
                self_encrypted_link_key: opts.self_encrypted_link_key,
            };
            st.records.insert(key.clone(), record.clone());
            self.inner.persist_locked(&st);
            self.inner.notify_locked(&st, &key, Some(&record));
            return true;
        };

        if existing.dirty {
            debug!(key = %key, "rejecting remote update over dirty record");
            return false;
        }

        if existing.hash == hash {
            // Same hash: fill missing metadata, tighten visibility, keep
            // source, never lower updated_at.
            let mut merged = existing.clone();
            let mut changed = false;
            if merged.key.is_none() {
                if let Some(k) = opts.key {
                    merged.key = Some(k);
                    changed = true;
                }
            }
            if candidate_visibility > merged.visibility {
                merged.visibility = candidate_visibility;
                changed = true;
            }
            if merged.encrypted_key.is_none() && opts.encrypted_key.is_some() {
                merged.encrypted_key = opts.encrypted_key;
                changed = true;
            }
            if merged.key_id.is_none() && opts.key_id.is_some() {
                merged.key_id = opts.key_id;
                changed = true;
            }
            if merged.self_encrypted_key.is_none() && opts.self_encrypted_key.is_some() {
                merged.self_encrypted_key = opts.self_encrypted_key;
                changed = true;
            }
            if merged.self_encrypted_link_key.is_none() && opts.self_encrypted_link_key.is_some() {
                merged.self_encrypted_link_key = opts.self_encrypted_link_key;
                changed = true;
            }
            if updated_at > merged.updated_at {
                merged.updated_at = updated_at;
                changed = true;
            }
            if !changed {
                return false;
            }
            st.records.insert(key.clone(), merged.clone());
            self.inner.persist_locked(&st);
            self.inner.notify_locked(&st, &key, Some(&merged));
            return true;
        }

        // Different hash: admit only strictly-newer, or a tie carrying new
        // content.
        let newer = updated_at > existing.updated_at;
        let tie_with_new_content = updated_at == existing.updated_at;
        if !(newer || tie_with_new_content) {
            return false;
        }
        let record = TreeRootRecord {
            hash,
            key: opts.key,
            visibility: candidate_visibility,
            updated_at,
            source,
            dirty: false,
            encrypted_key: opts.encrypted_key,
            key_id: opts.key_id,
            self_encrypted_key: opts.self_encrypted_key,
            self_encrypted_link_key: opts.self_encrypted_link_key,
        };
        st.records.insert(key.clone(), record.clone());
        self.inner.persist_locked(&st);
        self.inner.notify_locked(&st, &key, Some(&record));
        true
    }

    fn hydrate(&self) {
        let Ok(Some(bytes)) = self.inner.kv.get(LOCAL_ROOT_CACHE_KEY) else {
            return;
        };
        let parsed: HashMap<String, PersistedRecord> = match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(err = %e, "dropping unreadable root cache");
                return;
            }
        };
        let mut dirty_keys = Vec::new();
        {
            let mut st = match self.inner.state.lock() {
                Ok(st) => st,
                Err(_) => return,
            };
            for (key, persisted) in parsed {
                match persisted.into_record() {
                    Some(record) => {
                        if record.dirty {
                            dirty_keys.push(key.clone());
                        }
                        st.records.insert(key, record);
                    }
                    None => warn!(key = %key, "dropping invalid root cache entry"),
                }
            }
        }
        // Dirty records re-enter the publish queue on startup.
        for key in dirty_keys {
            self.schedule_publish(&key, self.inner.config.publish_delay);
        }
    }
}

impl Inner {
    fn notify_locked(&self, st: &State, key: &str, record: Option<&TreeRootRecord>) {
        if let Some(listeners) = st.key_listeners.get(key) {
            for (_, listener) in listeners {
                let _ = self
                    .notify_tx
                    .send(NotifyJob::Key(Arc::clone(listener), record.cloned()));
            }
        }
        for (_, listener) in &st.global_listeners {
            let _ = self.notify_tx.send(NotifyJob::Global(
                Arc::clone(listener),
                key.to_string(),
                record.cloned(),
            ));
        }
    }

    fn persist_locked(&self, st: &State) {
        let snapshot: HashMap<String, PersistedRecord> = st
            .records
            .iter()
            .map(|(k, v)| (k.clone(), PersistedRecord::from(v)))
            .collect();
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = self.kv.put(LOCAL_ROOT_CACHE_KEY, &bytes) {
                    warn!(err = %e, "failed to persist root cache");
                }
            }
            Err(e) => warn!(err = %e, "failed to serialize root cache"),
        }
    }
}

fn signal_attempt(waiters: &AttemptWaiters) {
    if let Ok(mut waiters) = waiters.lock() {
        for tx in waiters.drain(..) {
            let _ = tx.send(());
        }
    }
}

async fn publish_loop(
    inner: Arc<Inner>,
    key: String,
    generation: u64,
    kick: Arc<Notify>,
    waiters: AttemptWaiters,
    initial_delay: Duration,
) {
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = kick.notified() => {}
        }

        let record = match inner.state.lock() {
            Ok(st) => st.records.get(&key).cloned(),
            Err(_) => None,
        };
        let Some(record) = record else {
            signal_attempt(&waiters);
            break; // deleted meanwhile
        };
        if !record.dirty {
            signal_attempt(&waiters);
            break;
        }

        let (identity, tree_name) = split_key(&key);
        let published_hash = record.hash;
        let ok = inner
            .publisher
            .publish(&identity, &tree_name, record.clone())
            .await;

        if ok {
            if let Ok(mut st) = inner.state.lock() {
                let mut snapshot = None;
                if let Some(current) = st.records.get_mut(&key) {
                    // Clear dirty only if the hash did not move meanwhile.
                    if current.hash == published_hash {
                        current.dirty = false;
                        snapshot = Some(current.clone());
                    }
                }
                if let Some(record) = snapshot {
                    inner.persist_locked(&st);
                    inner.notify_locked(&st, &key, Some(&record));
                }
                if st
                    .pending
                    .get(&key)
                    .map(|p| p.generation == generation)
                    .unwrap_or(false)
                {
                    st.pending.remove(&key);
                }
            }
            signal_attempt(&waiters);
            break;
        }
        // One attempt settled; flush callers unpark while the retry stays
        // scheduled.
        signal_attempt(&waiters);
        debug!(key = %key, "publish failed; retrying");
        delay = inner.config.retry_delay;
    }
}

/// Wire form of a persisted record (`hash`/`key` as hex).
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    visibility: Visibility,
    updated_at: u64,
    source: RootSource,
    dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encrypted_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    self_encrypted_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    self_encrypted_link_key: Option<String>,
}

impl From<&TreeRootRecord> for PersistedRecord {
    fn from(r: &TreeRootRecord) -> Self {
        Self {
            hash: r.hash.to_hex(),
            key: r.key.map(|k| k.to_hex()),
            visibility: r.visibility,
            updated_at: r.updated_at,
            source: r.source,
            dirty: r.dirty,
            encrypted_key: r.encrypted_key.clone(),
            key_id: r.key_id.clone(),
            self_encrypted_key: r.self_encrypted_key.clone(),
            self_encrypted_link_key: r.self_encrypted_link_key.clone(),
        }
    }
}

impl PersistedRecord {
    fn into_record(self) -> Option<TreeRootRecord> {
        let hash = Hash32::from_hex(&self.hash).ok()?;
        let key = match self.key {
            Some(k) => Some(Hash32::from_hex(&k).ok()?),
            None => None,
        };
        Some(TreeRootRecord {
            hash,
            key,
            visibility: self.visibility,
            updated_at: self.updated_at,
            source: self.source,
            dirty: self.dirty,
            encrypted_key: self.encrypted_key,
            key_id: self.key_id,
            self_encrypted_key: self.self_encrypted_key,
            self_encrypted_link_key: self.self_encrypted_link_key,
        })
    }
}
