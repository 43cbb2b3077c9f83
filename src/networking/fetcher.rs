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
#![deny(missing_docs)]

//! Peer fetcher bridge between storage reads and the signalling
//! controller.
//!
//! While the controller reads the local store to answer a peer's request
//! it holds a [`LocalReadGuard`]; any storage miss during that window must
//! not recurse back out to peers, or a request would loop. The controller
//! is injected after construction to break the ownership cycle.

use crate::core::tree::BlockSource;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Hard deadline for one peer fetch.
pub const PEER_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Capability the controller exposes to the fetcher.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Ask connected peers for a block.
    async fn get(&self, hash_hex: &str) -> Option<Vec<u8>>;
}

/// Bridge with re-entrancy guard and per-ask request ids.
#[derive(Default)]
pub struct PeerFetcher {
    network: OnceLock<Arc<dyn PeerNetwork>>,
    local_read_depth: AtomicUsize,
    next_request_id: AtomicU64,
}

/// RAII guard marking a controller-side local read in progress.
pub struct LocalReadGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for LocalReadGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PeerFetcher {
    /// Bridge with no network attached yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject the controller capability (once).
    pub fn set_network(&self, network: Arc<dyn PeerNetwork>) {
        let _ = self.network.set(network);
    }

    /// Enter a controller-side local read.
    pub fn local_read_guard(&self) -> LocalReadGuard<'_> {
        self.local_read_depth.fetch_add(1, Ordering::SeqCst);
        LocalReadGuard {
            depth: &self.local_read_depth,
        }
    }

    /// Whether a controller-side local read is in progress.
    pub fn in_local_read(&self) -> bool {
        self.local_read_depth.load(Ordering::SeqCst) > 0
    }

    /// Unique id for one outbound ask.
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Round-trip a block request through the controller, bounded by
    /// [`PEER_FETCH_TIMEOUT`]. Refuses to recurse while a local read is
    /// being served.
    pub async fn fetch_from_peers(&self, hash_hex: &str) -> Option<Vec<u8>> {
        if self.in_local_read() {
            return None;
        }
        let network = self.network.get()?;
        tokio::time::timeout(PEER_FETCH_TIMEOUT, network.get(hash_hex))
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl BlockSource for PeerFetcher {
    async fn fetch(&self, hash_hex: &str) -> Option<Vec<u8>> {
        self.fetch_from_peers(hash_hex).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoNetwork;

    #[async_trait]
    impl PeerNetwork for EchoNetwork {
        async fn get(&self, hash_hex: &str) -> Option<Vec<u8>> {
            Some(hash_hex.as_bytes().to_vec())
        }
    }

    struct SlowNetwork;

    #[async_trait]
    impl PeerNetwork for SlowNetwork {
        async fn get(&self, _hash_hex: &str) -> Option<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            None
        }
    }

    #[tokio::test]
    async fn without_network_returns_none() {
        let fetcher = PeerFetcher::new();
        assert!(fetcher.fetch_from_peers("ab").await.is_none());
    }

    #[tokio::test]
    async fn guard_blocks_reentrancy() {
        let fetcher = PeerFetcher::new();
        fetcher.set_network(Arc::new(EchoNetwork));
        assert_eq!(fetcher.fetch_from_peers("ab").await, Some(b"ab".to_vec()));
        {
            let _guard = fetcher.local_read_guard();
            assert!(fetcher.in_local_read());
            assert!(fetcher.fetch_from_peers("ab").await.is_none());
        }
        assert!(!fetcher.in_local_read());
        assert_eq!(fetcher.fetch_from_peers("ab").await, Some(b"ab".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_none() {
        let fetcher = PeerFetcher::new();
        fetcher.set_network(Arc::new(SlowNetwork));
        assert!(fetcher.fetch_from_peers("ab").await.is_none());
    }

    #[test]
    fn request_ids_are_unique() {
        let fetcher = PeerFetcher::new();
        let a = fetcher.next_request_id();
        let b = fetcher.next_request_id();
        assert_ne!(a, b);
    }
}
