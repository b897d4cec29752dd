#![no_main]

use libfuzzer_sys::fuzz_target;
use infw_engine::codec::decode_key;

fuzz_target!(|data: &[u8]| {
    if let Ok(key) = decode_key(data) {
        // ifindex 32비트 + 주소 128비트
        assert!(key.lpm_prefix_len() <= 160);
    }
});
