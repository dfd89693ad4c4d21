#![no_main]

use libfuzzer_sys::fuzz_target;
use loadout_types::{is_valid_repo_url, safe_url};

fuzz_target!(|data: &str| {
    let once = safe_url(data);
    assert_eq!(safe_url(&once), once);

    // validation must never panic either
    let _ = is_valid_repo_url(data);
});
