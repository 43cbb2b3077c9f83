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

//! Hashtree - peer-to-peer content-addressed hash-tree platform core.
//!
//! This crate provides:
//! - Content codec: rolling chunker, convergent encryption (CHK),
//!   tree-node frames, `nhash` bech32m addresses
//! - Capped LRU blob store over sled and a multi-tier read path
//!   (local cache, HTTP blob federation, WebRTC peers)
//! - Hash-tree engine: streaming writes, range reads, walks, post-order
//!   push, with a privacy guard over what peers may fetch
//! - Tree-root registry pinning mutable names to immutable roots with
//!   subscriptions and throttled publishing
//! - Signalling/discovery controller for peer hellos, gift-wrapped
//!   directed frames, and `get(hash)` over data channels
//! - Social graph engine with distances, overmute detection, and a
//!   bounded varint binary codec
//! - Keyword search as a persistent B-tree of hash-tree blocks
//! - Monitoring via Prometheus metrics and structured logging

/// Core primitives (codec, storage, tree engine, registry, graph, search).
pub mod core;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// Networking stack (events, transports, fetcher, controller, server).
pub mod networking;
/// Small shared utilities.
pub mod util;
