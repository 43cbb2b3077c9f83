#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Content codec: chunking, convergent encryption, tree-node frames,
//! human-readable addresses.

pub mod chk;
pub mod chunker;
pub mod nhash;
pub mod node;
pub mod varint;
