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

//! Blob server: the serving side of the federation HTTP protocol.
//!
//! `HEAD /{hash}` and `GET /{hash}` answer presence and bytes; callers
//! verify digests themselves. `PUT /upload` ingests a block, optionally
//! demanding a signed capability in the `Authorization` header, and
//! answers `{sha256, size}`. `GET /metrics` exposes the prometheus
//! registry.

use crate::core::store::blob_store::BlobStore;
use crate::core::types::digest;
use crate::monitoring::metrics::Metrics;
use crate::networking::event::{now_secs, WireEvent, UPLOAD_AUTH_KIND};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use base64::Engine;
use prometheus::TextEncoder;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state behind the routes.
pub struct BlobServerState {
    /// Local block store served to the federation.
    pub store: Arc<BlobStore>,
    /// Metrics registry.
    pub metrics: Arc<Metrics>,
    /// Demand a signed capability on uploads.
    pub require_auth: bool,
    /// Reject uploads larger than this.
    pub max_blob_bytes: u64,
}

/// Build the router. HEAD is answered from the GET handler with the body
/// dropped, so only the status is meaningful, as the protocol requires.
pub fn router(state: Arc<BlobServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_text))
        .route("/upload", put(upload_blob))
        .route("/:hash", get(get_blob))
        .with_state(state)
}

async fn get_blob(
    State(state): State<Arc<BlobServerState>>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&hash) {
        Ok(Some(bytes)) => {
            state.metrics.blocks_served_total.inc();
            (StatusCode::OK, bytes).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(err = %e, "blob read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn capability_ok(headers: &HeaderMap, hash_hex: &str) -> bool {
    let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(b64) = auth.strip_prefix("Nostr ") else {
        return false;
    };
    let Ok(json) = base64::engine::general_purpose::STANDARD.decode(b64) else {
        return false;
    };
    let Ok(event) = serde_json::from_slice::<WireEvent>(&json) else {
        return false;
    };
    if event.verify().is_err() {
        return false;
    }
    if event.kind != UPLOAD_AUTH_KIND {
        return false;
    }
    if event.tag_value("x") != Some(hash_hex) {
        return false;
    }
    match event
        .tag_value("expiration")
        .and_then(|v| v.parse::<u64>().ok())
    {
        Some(expiration) => expiration >= now_secs(),
        None => false,
    }
}

async fn upload_blob(
    State(state): State<Arc<BlobServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if body.len() as u64 > state.max_blob_bytes {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }
    let hash_hex = digest(&body).to_hex();
    if state.require_auth && !capability_ok(&headers, &hash_hex) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.store.put_by_hash_trusted(&hash_hex, &body) {
        Ok(()) => {
            state.metrics.blobs_stored_total.inc();
            debug!(hash = %hash_hex, len = body.len(), "blob ingested");
            Json(serde_json::json!({
                "sha256": hash_hex,
                "size": body.len(),
            }))
            .into_response()
        }
        Err(e) => {
            warn!(err = %e, "blob ingest failed");
            StatusCode::INSUFFICIENT_STORAGE.into_response()
        }
    }
}

async fn metrics_text(State(state): State<Arc<BlobServerState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    match encoder.encode_to_string(&families) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
