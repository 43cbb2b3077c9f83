// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use proptest::prelude::*;

use hashtree::core::codec::chk::{decrypt_chk, encrypt_convergent};
use hashtree::core::codec::chunker::{split, ChunkProfile, MAX_CHUNK_BYTES, MIN_CHUNK_BYTES};
use hashtree::core::codec::nhash::{nhash_decode, nhash_encode};
use hashtree::core::codec::varint::{read_uvarint, write_uvarint};
use hashtree::core::types::{digest, Cid, Hash32};

proptest! {
    #[test]
    fn nhash_roundtrips_any_cid(hash in any::<[u8; 32]>(), key in proptest::option::of(any::<[u8; 32]>())) {
        let cid = Cid {
            hash: Hash32::from_bytes(hash),
            key: key.map(Hash32::from_bytes),
        };
        let encoded = nhash_encode(&cid).unwrap();
        prop_assert!(encoded.starts_with("nhash1"));
        prop_assert_eq!(nhash_decode(&encoded).unwrap(), cid);
    }

    #[test]
    fn nhash_decode_never_panics(s in "\\PC*") {
        let _ = nhash_decode(&s);
    }

    #[test]
    fn varint_roundtrips(v in any::<u64>()) {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, v);
        let mut pos = 0;
        prop_assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), v);
        prop_assert_eq!(pos, buf.len());
    }

    #[test]
    fn chk_roundtrips(plain in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let (hash, block, key) = encrypt_convergent(&plain).unwrap();
        prop_assert_eq!(hash, digest(&block));
        prop_assert_eq!(key, digest(&plain));
        prop_assert_eq!(decrypt_chk(&block, &key).unwrap(), plain);
    }

    #[test]
    fn chunker_reassembles_and_respects_bounds(seed in any::<u64>(), len in 0usize..(MAX_CHUNK_BYTES + MAX_CHUNK_BYTES / 2)) {
        let mut x = seed | 1;
        let data: Vec<u8> = (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();
        let chunks = split(&data, ChunkProfile::Content);
        prop_assert_eq!(chunks.concat(), data);
        let n = chunks.len();
        for (i, c) in chunks.iter().enumerate() {
            prop_assert!(c.len() <= MAX_CHUNK_BYTES);
            if i + 1 != n {
                prop_assert!(c.len() >= MIN_CHUNK_BYTES);
            }
        }
    }
}
