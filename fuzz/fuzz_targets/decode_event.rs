#![no_main]

use libfuzzer_sys::fuzz_target;
use infw_engine::FirewallEvent;

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = FirewallEvent::from_bytes(data) {
        let _ = event.to_string();
    }
});
