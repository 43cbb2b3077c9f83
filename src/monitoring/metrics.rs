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

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peers gauge.
    pub p2p_peers: IntGauge,
    /// Blocks served to peers and the federation.
    pub blocks_served_total: IntCounter,
    /// Blocks fetched from peers.
    pub blocks_fetched_total: IntCounter,
    /// Blocks ingested through the upload endpoint.
    pub blobs_stored_total: IntCounter,
    /// Dropped undecodable or unverifiable events and frames.
    pub invalid_event_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers = IntGauge::new("hashtree_p2p_peers", "Connected peers")
            .map_err(|_| MetricsError::Prom)?;
        let blocks_served_total = IntCounter::new(
            "hashtree_blocks_served_total",
            "Blocks served to peers and the federation",
        )
        .map_err(|_| MetricsError::Prom)?;
        let blocks_fetched_total =
            IntCounter::new("hashtree_blocks_fetched_total", "Blocks fetched from peers")
                .map_err(|_| MetricsError::Prom)?;
        let blobs_stored_total = IntCounter::new(
            "hashtree_blobs_stored_total",
            "Blocks ingested through the upload endpoint",
        )
        .map_err(|_| MetricsError::Prom)?;
        let invalid_event_total = IntCounter::new(
            "hashtree_invalid_event_total",
            "Dropped undecodable or unverifiable events",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(p2p_peers.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(blocks_served_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(blocks_fetched_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(blobs_stored_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(invalid_event_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            p2p_peers,
            blocks_served_total,
            blocks_fetched_total,
            blobs_stored_total,
            invalid_event_total,
        })
    }
}
