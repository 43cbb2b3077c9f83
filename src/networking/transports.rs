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

//! Blob transport federation: concurrent multi-server GET/PUT with
//! bandwidth accounting.
//!
//! Downloads race every read server and return the first digest-verified
//! body. Uploads HEAD each write server first, then PUT a signed
//! capability for the ones that miss. Per-server byte counters are
//! published as snapshots with a monotonic `updated_at`.

use crate::core::security::keystore::Keystore;
use crate::core::tree::{BlockSink, BlockSource, SinkError};
use crate::core::types::{digest_matches, BlobServerEndpoint, Hash32};
use crate::networking::event::{build_event, now_secs, UPLOAD_AUTH_KIND};
use async_trait::async_trait;
use base64::Engine;
use futures::future::{join_all, select_ok};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Per-request deadline for transport HTTP calls.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);
/// Seconds an upload capability stays valid.
pub const UPLOAD_AUTH_TTL_SECS: u64 = 300;

/// Transfer direction of a bandwidth snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Bytes sent to the server.
    Up,
    /// Bytes received from the server.
    Down,
}

/// One `(server, direction)` counter snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    /// Server base URL.
    pub url: String,
    /// Transfer direction.
    pub direction: Direction,
    /// Total bytes so far.
    pub bytes: u64,
    /// Monotonic timestamp (ms).
    pub updated_at: u64,
}

struct ServerState {
    endpoint: BlobServerEndpoint,
    bytes_sent: u64,
    bytes_received: u64,
    updated_at: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// HTTP federation over the configured blob servers.
pub struct TransportPool {
    client: reqwest::Client,
    servers: Mutex<Vec<ServerState>>,
    stats_tx: watch::Sender<Vec<BandwidthSnapshot>>,
    signer: Option<Arc<Keystore>>,
}

impl TransportPool {
    /// Empty pool. `signer` signs upload capabilities; uploads to servers
    /// that demand one fail with `SignatureRequired` without it.
    pub fn new(signer: Option<Arc<Keystore>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .unwrap_or_default();
        let (stats_tx, _) = watch::channel(Vec::new());
        Self {
            client,
            servers: Mutex::new(Vec::new()),
            stats_tx,
            signer,
        }
    }

    /// Atomically replace the server configuration.
    pub fn set_servers(&self, endpoints: Vec<BlobServerEndpoint>) {
        let mut servers = match self.servers.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        *servers = endpoints
            .into_iter()
            .map(|endpoint| ServerState {
                endpoint,
                bytes_sent: 0,
                bytes_received: 0,
                updated_at: now_ms(),
            })
            .collect();
        drop(servers);
        self.publish_stats();
    }

    /// Snapshot stream of per-server byte counters.
    pub fn bandwidth_stats(&self) -> watch::Receiver<Vec<BandwidthSnapshot>> {
        self.stats_tx.subscribe()
    }

    fn record(&self, url: &str, sent: u64, received: u64) {
        if let Ok(mut servers) = self.servers.lock() {
            if let Some(server) = servers.iter_mut().find(|s| s.endpoint.url == url) {
                server.bytes_sent += sent;
                server.bytes_received += received;
                // updated_at never moves backwards.
                server.updated_at = now_ms().max(server.updated_at + 1);
            }
        }
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let Ok(servers) = self.servers.lock() else {
            return;
        };
        let mut out = Vec::with_capacity(servers.len() * 2);
        for server in servers.iter() {
            out.push(BandwidthSnapshot {
                url: server.endpoint.url.clone(),
                direction: Direction::Up,
                bytes: server.bytes_sent,
                updated_at: server.updated_at,
            });
            out.push(BandwidthSnapshot {
                url: server.endpoint.url.clone(),
                direction: Direction::Down,
                bytes: server.bytes_received,
                updated_at: server.updated_at,
            });
        }
        let _ = self.stats_tx.send(out);
    }

    fn read_urls(&self) -> Vec<String> {
        self.servers
            .lock()
            .map(|servers| {
                servers
                    .iter()
                    .filter(|s| s.endpoint.read)
                    .map(|s| s.endpoint.url.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_urls(&self) -> Vec<String> {
        self.servers
            .lock()
            .map(|servers| {
                servers
                    .iter()
                    .filter(|s| s.endpoint.write)
                    .map(|s| s.endpoint.url.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Race read servers; first digest-verified body wins. `None` on
    /// timeout or all-failure.
    pub async fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>> {
        let expected = Hash32::from_hex(hash_hex).ok()?;
        let urls = self.read_urls();
        if urls.is_empty() {
            return None;
        }
        let races = urls.iter().map(|url| {
            let client = self.client.clone();
            let url = url.clone();
            let hash_hex = hash_hex.to_string();
            Box::pin(async move {
                let resp = client
                    .get(format!("{url}/{hash_hex}"))
                    .send()
                    .await
                    .map_err(|_| ())?;
                if !resp.status().is_success() {
                    return Err(());
                }
                let body = resp.bytes().await.map_err(|_| ())?;
                if !digest_matches(&expected, &body) {
                    return Err(());
                }
                Ok::<_, ()>((url, body.to_vec()))
            })
        });
        match select_ok(races).await {
            Ok(((url, bytes), _rest)) => {
                self.record(&url, 0, bytes.len() as u64);
                debug!(%url, hash = %hash_hex, len = bytes.len(), "transport fetch hit");
                Some(bytes)
            }
            Err(()) => None,
        }
    }

    async fn head(&self, url: &str, hash_hex: &str) -> bool {
        self.client
            .head(format!("{url}/{hash_hex}"))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    fn auth_header(&self, hash_hex: &str) -> Option<String> {
        let signer = self.signer.as_ref()?;
        let tags = vec![
            vec!["t".to_string(), "upload".to_string()],
            vec!["x".to_string(), hash_hex.to_string()],
            vec![
                "expiration".to_string(),
                (now_secs() + UPLOAD_AUTH_TTL_SECS).to_string(),
            ],
        ];
        let event = build_event(signer.as_ref(), UPLOAD_AUTH_KIND, tags, String::new()).ok()?;
        let json = serde_json::to_vec(&event).ok()?;
        Some(format!(
            "Nostr {}",
            base64::engine::general_purpose::STANDARD.encode(json)
        ))
    }

    async fn put_one(&self, url: &str, hash_hex: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let mut request = self
            .client
            .put(format!("{url}/upload"))
            .body(bytes.to_vec());
        if let Some(auth) = self.auth_header(hash_hex) {
            request = request.header("Authorization", auth);
        }
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout
            } else {
                SinkError::Unreachable
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            self.record(url, bytes.len() as u64, 0);
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(SinkError::SignatureRequired),
            code => Err(SinkError::Rejected(code)),
        }
    }

    /// Build the block sink the hash-tree engine consumes during `push`.
    pub fn create_upload_store(
        self: &Arc<Self>,
        on_event: Option<UploadEventFn>,
        progress: Option<Arc<UploadProgressTracker>>,
    ) -> UploadStore {
        UploadStore {
            pool: Arc::clone(self),
            on_event,
            progress,
        }
    }
}

#[async_trait]
impl BlockSource for TransportPool {
    async fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>> {
        TransportPool::fetch(self, hash_hex).await
    }
}

/// Per-server upload notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    /// HEAD reported the block present.
    Skipped {
        /// Server URL.
        url: String,
        /// Block hash.
        hash: String,
    },
    /// PUT succeeded.
    Uploaded {
        /// Server URL.
        url: String,
        /// Block hash.
        hash: String,
        /// Block size.
        bytes: u64,
    },
    /// PUT failed.
    Failed {
        /// Server URL.
        url: String,
        /// Block hash.
        hash: String,
        /// Failure description.
        error: String,
    },
}

/// Upload event callback.
pub type UploadEventFn = Arc<dyn Fn(UploadEvent) + Send + Sync>;

/// Block sink fanning out to every write server.
pub struct UploadStore {
    pool: Arc<TransportPool>,
    on_event: Option<UploadEventFn>,
    progress: Option<Arc<UploadProgressTracker>>,
}

impl UploadStore {
    fn emit(&self, event: UploadEvent) {
        if let Some(progress) = &self.progress {
            progress.on_server_event(&event);
        }
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}

#[async_trait]
impl BlockSink for UploadStore {
    async fn has(&self, hash_hex: &str) -> bool {
        let urls = self.pool.write_urls();
        if urls.is_empty() {
            return false;
        }
        let checks = urls.iter().map(|url| self.pool.head(url, hash_hex));
        join_all(checks).await.into_iter().all(|present| present)
    }

    async fn put(&self, hash_hex: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let urls = self.pool.write_urls();
        if urls.is_empty() {
            return Err(SinkError::Unreachable);
        }
        let attempts = urls.iter().map(|url| {
            let pool = Arc::clone(&self.pool);
            let url = url.clone();
            async move {
                if pool.head(&url, hash_hex).await {
                    return (url, Ok(None));
                }
                match pool.put_one(&url, hash_hex, bytes).await {
                    Ok(()) => (url, Ok(Some(bytes.len() as u64))),
                    Err(e) => (url, Err(e)),
                }
            }
        });
        let mut ok = 0usize;
        let mut first_err: Option<SinkError> = None;
        for (url, outcome) in join_all(attempts).await {
            match outcome {
                Ok(None) => {
                    ok += 1;
                    self.emit(UploadEvent::Skipped {
                        url,
                        hash: hash_hex.to_string(),
                    });
                }
                Ok(Some(len)) => {
                    ok += 1;
                    self.emit(UploadEvent::Uploaded {
                        url,
                        hash: hash_hex.to_string(),
                        bytes: len,
                    });
                }
                Err(e) => {
                    warn!(%url, hash = %hash_hex, err = %e, "upload failed");
                    self.emit(UploadEvent::Failed {
                        url,
                        hash: hash_hex.to_string(),
                        error: e.to_string(),
                    });
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(progress) = &self.progress {
            progress.chunk_done();
        }
        if ok > 0 {
            Ok(())
        } else {
            Err(first_err.unwrap_or(SinkError::Unreachable))
        }
    }
}

/// Upload progress state. All counters are monotone; `complete` flips
/// false→true exactly once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadProgress {
    /// Write servers in the federation.
    pub total_servers: u64,
    /// Per-server outcomes seen so far.
    pub processed_servers: u64,
    /// Servers that accepted an upload.
    pub uploaded_servers: u64,
    /// Servers that already had blocks.
    pub skipped_servers: u64,
    /// Servers that failed.
    pub failed_servers: u64,
    /// Blocks in the upload.
    pub total_chunks: u64,
    /// Blocks fully processed.
    pub processed_chunks: u64,
    /// Fraction complete in [0, 1].
    pub progress_ratio: f64,
    /// Terminal flag.
    pub complete: bool,
    /// Terminal error, if any.
    pub error: Option<String>,
}

/// Tracker publishing monotone progress snapshots.
pub struct UploadProgressTracker {
    state: Mutex<UploadProgress>,
    tx: watch::Sender<UploadProgress>,
}

impl UploadProgressTracker {
    /// Tracker for an upload of `total_chunks` blocks to `total_servers`
    /// write servers.
    pub fn new(total_chunks: u64, total_servers: u64) -> Self {
        let initial = UploadProgress {
            total_servers,
            total_chunks,
            ..UploadProgress::default()
        };
        let (tx, _) = watch::channel(initial.clone());
        Self {
            state: Mutex::new(initial),
            tx,
        }
    }

    /// Subscribe to progress snapshots.
    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.tx.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> UploadProgress {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn publish(&self, state: &UploadProgress) {
        let _ = self.tx.send(state.clone());
    }

    /// Fold one per-server outcome in.
    pub fn on_server_event(&self, event: &UploadEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.processed_servers += 1;
        match event {
            UploadEvent::Uploaded { .. } => state.uploaded_servers += 1,
            UploadEvent::Skipped { .. } => state.skipped_servers += 1,
            UploadEvent::Failed { .. } => state.failed_servers += 1,
        }
        self.publish(&state);
    }

    /// Mark one block fully processed.
    pub fn chunk_done(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.processed_chunks += 1;
        if state.total_chunks > 0 {
            let ratio = state.processed_chunks as f64 / state.total_chunks as f64;
            // Monotone even if totals were estimated low.
            state.progress_ratio = state.progress_ratio.max(ratio.min(1.0));
        }
        self.publish(&state);
    }

    /// Flip the terminal flag (at most once) and record an error.
    pub fn finish(&self, error: Option<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.complete {
            return;
        }
        state.complete = true;
        state.error = error;
        if state.error.is_none() {
            state.progress_ratio = 1.0;
        }
        self.publish(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotone_and_completes_once() {
        let tracker = UploadProgressTracker::new(2, 3);
        tracker.on_server_event(&UploadEvent::Uploaded {
            url: "u".into(),
            hash: "h".into(),
            bytes: 10,
        });
        tracker.chunk_done();
        let mid = tracker.snapshot();
        assert_eq!(mid.processed_chunks, 1);
        assert!(mid.progress_ratio > 0.0 && !mid.complete);

        tracker.chunk_done();
        tracker.finish(None);
        let done = tracker.snapshot();
        assert!(done.complete);
        assert_eq!(done.progress_ratio, 1.0);

        // A second finish with an error must not un-complete or mutate.
        tracker.finish(Some("late".into()));
        assert_eq!(tracker.snapshot().error, None);
    }

    #[test]
    fn empty_pool_fetch_is_none() {
        let pool = TransportPool::new(None);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(rt.block_on(pool.fetch(&"ab".repeat(32))).is_none());
    }
}
