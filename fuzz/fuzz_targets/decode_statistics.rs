#![no_main]

use libfuzzer_sys::fuzz_target;
use infw_engine::codec::decode_statistics;

fuzz_target!(|data: &[u8]| {
    let _ = decode_statistics(data);
});
