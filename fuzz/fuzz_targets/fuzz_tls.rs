#![no_main]

use libfuzzer_sys::fuzz_target;
use netflow_collector::{ja3, tls};

fuzz_target!(|data: &[u8]| {
    if let Some(hello) = tls::parse(data) {
        let _ = ja3::ja3_fingerprint(&hello);
    }
});
