#![no_main]

use libfuzzer_sys::fuzz_target;
use infw_engine::codec::{decode_bucket, encode_bucket};

fuzz_target!(|data: &[u8]| {
    if let Ok(bucket) = decode_bucket(data) {
        // 디코딩된 버킷은 다시 인코딩/디코딩할 수 있어야 함
        let bytes = encode_bucket(&bucket);
        let again = decode_bucket(&bytes).expect("re-encoded bucket must decode");
        assert_eq!(again.num_rules, bucket.num_rules);
    }
});
