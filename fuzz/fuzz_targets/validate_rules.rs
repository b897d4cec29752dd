#![no_main]

use libfuzzer_sys::fuzz_target;
use infw_core::types::InterfaceRules;
use infw_engine::codec;

fuzz_target!(|data: &[u8]| {
    // 오프로드 페이로드와 같은 JSON 형식의 룰 맵
    if let Ok(rules) = serde_json::from_slice::<InterfaceRules>(data) {
        let _ = codec::validate(&rules);
    }
});
