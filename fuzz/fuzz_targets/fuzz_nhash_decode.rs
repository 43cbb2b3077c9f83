#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary text must never panic, and any address that
    // decodes must re-encode to an equal CID.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(cid) = hashtree::core::codec::nhash::nhash_decode(s) {
            let re = hashtree::core::codec::nhash::nhash_encode(&cid).unwrap();
            assert_eq!(hashtree::core::codec::nhash::nhash_decode(&re), Ok(cid));
        }
    }
});
