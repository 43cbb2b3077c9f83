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

//! Content-defined chunking.
//!
//! The rolling profile cuts where the low 18 bits of a multiplicative
//! rolling hash over a 48-byte window are all set, clamped to
//! [64 KiB, 1 MiB]. The media profile cuts at fixed 256 KiB boundaries so
//! range requests land on power-of-two offsets. Boundaries are not part of
//! interop: the address embeds the key and receivers read blocks by hash.

/// Minimum chunk size for the rolling profile.
pub const MIN_CHUNK_BYTES: usize = 64 * 1024;
/// Maximum chunk size for the rolling profile.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;
/// Fixed chunk size for the media profile.
pub const MEDIA_CHUNK_BYTES: usize = 256 * 1024;

const WINDOW: usize = 48;
const BOUNDARY_MASK: u64 = (1 << 18) - 1;
const PRIME: u64 = 1_099_511_628_211; // FNV-1a prime, odd multiplier

/// Chunking profile selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChunkProfile {
    /// Content-defined rolling boundaries.
    #[default]
    Content,
    /// Fixed power-of-two boundaries for seekable media.
    Media,
}

impl ChunkProfile {
    /// Build the incremental splitter for this profile.
    pub fn splitter(&self) -> Box<dyn ChunkSplitter> {
        match self {
            ChunkProfile::Content => Box::new(RollingChunker::new()),
            ChunkProfile::Media => Box::new(FixedChunker::new(MEDIA_CHUNK_BYTES)),
        }
    }
}

/// Incremental chunk boundary finder consumed by the streaming writer.
pub trait ChunkSplitter: Send {
    /// Feed bytes; returns every chunk completed by this append.
    fn append(&mut self, data: &[u8]) -> Vec<Vec<u8>>;
    /// Drain the trailing partial chunk, if any.
    fn finish(&mut self) -> Option<Vec<u8>>;
}

/// One-shot split of a full buffer.
pub fn split(bytes: &[u8], profile: ChunkProfile) -> Vec<Vec<u8>> {
    let mut splitter = profile.splitter();
    let mut chunks = splitter.append(bytes);
    if let Some(tail) = splitter.finish() {
        chunks.push(tail);
    }
    chunks
}

/// Rolling-boundary chunker (Rabin-style multiplicative hash).
pub struct RollingChunker {
    buf: Vec<u8>,
    hash: u64,
    // PRIME^WINDOW, used to remove the byte leaving the window.
    out_factor: u64,
}

impl RollingChunker {
    /// New chunker with the default bounds.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            hash: 0,
            out_factor: PRIME.wrapping_pow(WINDOW as u32),
        }
    }

    fn push_byte(&mut self, b: u8) -> bool {
        self.buf.push(b);
        self.hash = self.hash.wrapping_mul(PRIME).wrapping_add(u64::from(b));
        if self.buf.len() > WINDOW {
            let out = self.buf[self.buf.len() - 1 - WINDOW];
            self.hash = self
                .hash
                .wrapping_sub(self.out_factor.wrapping_mul(u64::from(out)));
        }
        if self.buf.len() >= MAX_CHUNK_BYTES {
            return true;
        }
        self.buf.len() >= MIN_CHUNK_BYTES && (self.hash & BOUNDARY_MASK) == BOUNDARY_MASK
    }

    fn cut(&mut self) -> Vec<u8> {
        self.hash = 0;
        std::mem::take(&mut self.buf)
    }
}

impl Default for RollingChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSplitter for RollingChunker {
    fn append(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in data {
            if self.push_byte(b) {
                out.push(self.cut());
            }
        }
        out
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.cut())
        }
    }
}

/// Fixed-size chunker (media profile).
pub struct FixedChunker {
    size: usize,
    buf: Vec<u8>,
}

impl FixedChunker {
    /// New fixed chunker cutting every `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buf: Vec::new(),
        }
    }
}

impl ChunkSplitter for FixedChunker {
    fn append(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let want = self.size - self.buf.len();
            let take = want.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.size {
                out.push(std::mem::take(&mut self.buf));
            }
        }
        out
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}
