#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Core protocol primitives: codec, storage, hash-tree engine, privacy
//! guard, tree-root registry, social graph, search index, keystore.

pub mod codec;
pub mod graph;
pub mod privacy;
pub mod registry;
pub mod search;
pub mod security;
pub mod store;
pub mod tree;
pub mod types;
