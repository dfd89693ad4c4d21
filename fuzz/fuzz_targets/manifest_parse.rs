#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use loadout::manifest::{parse_file, serialize};
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("config.ini");
    if fs::write(&path, data).is_err() {
        return;
    }

    let manifest = parse_file(&path);

    // a parsed manifest must survive its own serialization
    if fs::write(&path, serialize(&manifest)).is_ok() {
        assert_eq!(parse_file(&path), manifest);
    }
});
