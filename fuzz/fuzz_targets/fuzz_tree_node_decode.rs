#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary payloads decode to Some(node) or None, never a panic; a
    // decoded node must round-trip byte-identically.
    if let Some(node) = hashtree::core::codec::node::try_decode_tree_node(data) {
        let enc = hashtree::core::codec::node::encode_tree_node(&node);
        assert_eq!(enc, data);
    }
});
