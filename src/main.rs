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

//! Hashtree node entrypoint (systemd-friendly).
//! Serves the blob federation protocol and metrics until interrupted.

use std::sync::Arc;

use hashtree::core::store::blob_store::BlobStore;
use hashtree::core::security::keystore::Keystore;
use hashtree::core::types::{CacheConfig, HttpConfig, NodeConfig, NodeSettings};
use hashtree::monitoring::metrics::Metrics;
use hashtree::networking::server::{router, BlobServerState};
use tracing::info;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> NodeConfig {
    let path = env("HASHTREE_CONFIG", "");
    if !path.is_empty() {
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => return config,
                Err(e) => {
                    eprintln!("bad config {path}: {e}");
                    std::process::exit(2);
                }
            },
            Err(e) => {
                eprintln!("cannot read config {path}: {e}");
                std::process::exit(2);
            }
        }
    }
    NodeConfig {
        node: NodeSettings {
            name: env("HASHTREE_NODE_NAME", "hashtree"),
            data_dir: env("HASHTREE_DATA_DIR", "./data"),
        },
        http: HttpConfig {
            listen_addr: env("HASHTREE_HTTP_ADDR", "0.0.0.0:9090"),
            require_auth: cfg!(feature = "production"),
            max_blob_bytes: 2 * 1024 * 1024,
        },
        cache: CacheConfig::default(),
        transports: Default::default(),
        peers: Default::default(),
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config = load_config();
    info!(name = %config.node.name, data_dir = %config.node.data_dir, "hashtree node starting");

    let store = match BlobStore::open(&config.node.data_dir, config.cache.max_bytes) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("blob store open failed: {e}");
            std::process::exit(1);
        }
    };
    let _keystore = match Keystore::open(&config.node.data_dir) {
        Ok(ks) => {
            info!(pubkey = %ks.public_key_hex(), "node identity loaded");
            Arc::new(ks)
        }
        Err(e) => {
            eprintln!("keystore open failed: {e}");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            eprintln!("metrics init failed: {e}");
            std::process::exit(1);
        }
    };

    let state = Arc::new(BlobServerState {
        store,
        metrics,
        require_auth: config.http.require_auth,
        max_blob_bytes: config.http.max_blob_bytes,
    });

    let listener = match tokio::net::TcpListener::bind(&config.http.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("bind {} failed: {e}", config.http.listen_addr);
            std::process::exit(1);
        }
    };
    info!(addr = %config.http.listen_addr, "blob server listening");

    let serve = axum::serve(listener, router(state));
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                eprintln!("server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
