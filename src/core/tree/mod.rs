#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Hash-tree engine: tiered reads, streaming writes, walks, push.

pub mod engine;
pub mod push;
pub mod stream;

pub use engine::{BlockSource, Decoded, DirEntry, TreeEngine, TreeError};
pub use push::{BlockSink, BlockWalk, PushOptions, PushResult, SinkError, WalkedBlock};
pub use stream::{RangeChunkStream, StreamOptions, TreeWriter};
