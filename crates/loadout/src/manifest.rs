//! Plugin manifest parsing.
//!
//! Each plugin ships a single-section `config.ini` at its root. Parsing is
//! deliberately forgiving: a missing file, missing key, or unparsable value
//! leaves the field unset instead of raising. Comma-separated sets are
//! split, trimmed, lower-cased, with empties dropped.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use configparser::ini::Ini;

use loadout_types::{ClientType, PluginManifest};

/// File name of the manifest inside a plugin directory.
pub const MANIFEST_FILE: &str = "config.ini";

/// Flattened view over the manifest's sections; the nominal single section
/// may be headerless (the `default` section) or named.
struct Fields {
    values: BTreeMap<String, String>,
}

impl Fields {
    fn load(path: &Path) -> Self {
        let mut values = BTreeMap::new();

        let mut ini = Ini::new();
        if let Ok(sections) = ini.load(path) {
            let mut names: Vec<&String> = sections.keys().collect();
            names.sort_by(|a, b| {
                (a.as_str() != "default", a.as_str()).cmp(&(b.as_str() != "default", b.as_str()))
            });

            for name in names {
                for (key, value) in &sections[name] {
                    if let Some(value) = value {
                        values
                            .entry(key.to_lowercase())
                            .or_insert_with(|| value.trim().to_string());
                    }
                }
            }
        }

        Self { values }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.to_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Some(true),
            "0" | "no" | "false" | "off" => Some(false),
            _ => None,
        }
    }

    fn get_int(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse().ok()
    }

    fn get_set(&self, key: &str) -> BTreeSet<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse the manifest at a plugin directory root.
pub fn parse(plugin_dir: &Path) -> PluginManifest {
    parse_file(&plugin_dir.join(MANIFEST_FILE))
}

/// Parse a manifest file directly.
pub fn parse_file(path: &Path) -> PluginManifest {
    let fields = Fields::load(path);

    PluginManifest {
        available: fields.get_bool("available"),
        min_core: fields.get_int("min_core"),
        max_core: fields.get_int("max_core"),
        client_type: fields
            .get("client_type")
            .and_then(|v| v.parse::<ClientType>().ok()),
        envs: fields.get_set("envs"),
        bins: fields.get_set("bins"),
        depends: fields.get_set("depends"),
        packages: fields.get_set("packages"),
    }
}

/// Render a manifest back to its file form; `parse_file` of the output
/// yields the same manifest.
pub fn serialize(manifest: &PluginManifest) -> String {
    let mut out = String::from("[default]\n");
    let mut push = |key: &str, value: String| {
        out.push_str(&format!("{key} = {value}\n"));
    };

    if let Some(available) = manifest.available {
        push("available", available.to_string());
    }
    if let Some(min_core) = manifest.min_core {
        push("min_core", min_core.to_string());
    }
    if let Some(max_core) = manifest.max_core {
        push("max_core", max_core.to_string());
    }
    if let Some(client_type) = manifest.client_type {
        push("client_type", client_type.to_string());
    }

    for (key, set) in [
        ("envs", &manifest.envs),
        ("bins", &manifest.bins),
        ("depends", &manifest.depends),
        ("packages", &manifest.packages),
    ] {
        if !set.is_empty() {
            push(key, set.iter().cloned().collect::<Vec<_>>().join(", "));
        }
    }

    out
}
