#![no_main]

use libfuzzer_sys::fuzz_target;
use loadout::resolver::grab_conflicts;

fuzz_target!(|data: &str| {
    let specs: Vec<&str> = data.split_whitespace().collect();
    let conflicts = grab_conflicts(specs.iter().copied());

    // conflicts are reconstructed specifiers; each must parse back
    for conflict in &conflicts {
        assert!(loadout::resolver::normalize(conflict).is_some());
    }
});
