#![no_main]

use libfuzzer_sys::fuzz_target;
use loadout_rpc::{Reply, Request};

fuzz_target!(|data: &[u8]| {
    if let Ok(reply) = serde_json::from_slice::<Reply>(data) {
        let _ = reply.into_result();
    }
    let _ = serde_json::from_slice::<Request>(data);
});
