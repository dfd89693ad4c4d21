//! Requirement conflict detection.
//!
//! Takes the union of `name<op>version` specifiers across the selected
//! plugins and returns the subset that is inconsistent with a sibling
//! specifier on the same package.
//!
//! The heuristic walks each package's versions in descending order looking
//! for a pivot: the first version whose operator combination matches one of
//! an ordered pattern list. Operators matched there are consumed; once the
//! pivot is found, lower-bound operators on lower versions are consumed as
//! compatible. Whatever operators survive the sweep are conflicts. A pivot
//! that left conflicts behind is itself contradicted, so its own specifiers
//! are reported too.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

const GT: &str = ">";
const GE: &str = ">=";
const EQ: &str = "==";
const LE: &str = "<=";
const LT: &str = "<";
const NE: &str = "!=";

/// Operator rows the pattern list is generated from.
const SEQUENCE: [[&str; 3]; 3] = [[GT, GE, NE], [GE, EQ, LE], [LE, LT, NE]];

/// Operators compatible with an already-found pivot.
const COMPATIBLE: [&str; 3] = [GT, GE, NE];

/// The "less-than" family; a pattern made only of these never declares a
/// pivot.
const LESS: [&str; 3] = [LE, LT, NE];

fn spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)(<=|>=|==|!=|~=|<|>)(.+)$").expect("valid spec pattern"))
}

/// Split a specifier into `(name, op, version)`, folding `~=` into `>=`.
fn parse_spec(spec: &str) -> Option<(String, &'static str, String)> {
    let caps = spec_re().captures(spec.trim())?;

    let name = caps[1].to_string();
    let version = caps[3].to_string();
    let op = match &caps[2] {
        "~=" | ">=" => GE,
        ">" => GT,
        "==" => EQ,
        "<=" => LE,
        "<" => LT,
        "!=" => NE,
        _ => return None,
    };

    Some((name, op, version))
}

/// Canonical form of a specifier (`~=` folded), used to match resolver
/// output back against a plugin's declared packages.
pub fn normalize(spec: &str) -> Option<String> {
    parse_spec(spec).map(|(name, op, version)| format!("{name}{op}{version}"))
}

/// The ordered operator-combination patterns: per sequence row, the triple,
/// its pairs, then a growing tail of singles.
fn patterns() -> Vec<Vec<&'static str>> {
    let mut out = Vec::new();

    for (i, seq) in SEQUENCE.iter().enumerate() {
        out.push(seq.to_vec());
        out.push(vec![seq[0], seq[1]]);
        out.push(vec![seq[0], seq[2]]);
        out.push(vec![seq[1], seq[2]]);
        for op in seq.iter().take(i + 1) {
            out.push(vec![*op]);
        }
    }

    out
}

/// Return the specifiers that conflict with a sibling on the same package.
pub fn grab_conflicts<'a>(specs: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut audit: BTreeMap<String, BTreeMap<String, BTreeSet<&'static str>>> = BTreeMap::new();

    for spec in specs {
        if !spec.contains(['=', '<', '>']) {
            continue;
        }
        let Some((name, op, version)) = parse_spec(spec) else {
            continue;
        };
        audit
            .entry(name)
            .or_default()
            .entry(version)
            .or_default()
            .insert(op);
    }

    let patterns = patterns();
    let mut conflicts = BTreeSet::new();

    for (name, mut versions) in audit {
        let mut order: Vec<String> = versions.keys().cloned().collect();
        order.sort();
        order.reverse();

        let mut found = false;
        let mut pivot: Option<(String, Vec<&'static str>)> = None;

        for version in &order {
            let ops = versions.get_mut(version).expect("version present");

            if found {
                for op in COMPATIBLE {
                    ops.remove(op);
                }
                continue;
            }

            for pattern in &patterns {
                if pattern.iter().all(|op| ops.contains(op)) {
                    for op in pattern {
                        ops.remove(op);
                    }
                    if !pattern.iter().all(|op| LESS.contains(op)) {
                        found = true;
                        pivot = Some((version.clone(), pattern.clone()));
                    }
                    break;
                }
            }
        }

        let mut leftovers = BTreeSet::new();
        for (version, ops) in &versions {
            for op in ops {
                leftovers.insert(format!("{name}{op}{version}"));
            }
        }

        // a pivot that anything still contradicts is itself a conflict
        if !leftovers.is_empty()
            && let Some((version, ops)) = pivot
        {
            for op in ops {
                leftovers.insert(format!("{name}{op}{version}"));
            }
        }

        conflicts.extend(leftovers);
    }

    conflicts
}
