#![no_main]

use libfuzzer_sys::fuzz_target;
use loadout_types::ConstraintRule;

fuzz_target!(|data: &str| {
    let rule = ConstraintRule::parse(data);

    // parsing is idempotent on the normalized raw form
    let reparsed = ConstraintRule::parse(&rule.raw);
    assert_eq!(reparsed, rule);

    // a fully-empty rule never matches
    if rule.repo.is_none() && rule.category.is_none() && rule.plugin.is_none() {
        assert!(!rule.matches("repo", "category", "plugin"));
    }
});
