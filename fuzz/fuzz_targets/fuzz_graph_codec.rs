#![no_main]
use libfuzzer_sys::fuzz_target;

const ROOT: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames must decode cleanly or fail cleanly.
    let _ = hashtree::core::graph::from_binary(ROOT, data);
});
