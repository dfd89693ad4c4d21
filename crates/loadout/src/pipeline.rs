//! The materialization pipeline.
//!
//! Stages run in order, each guarded by its sentinel:
//!
//! 1. fetch + init the core, wiping and repopulating the child source tree
//! 2. fetch + init the plugin repos: select, resolve, copy
//! 3. install the pending package requirements
//!
//! Per-repo and per-plugin failures shrink the result and are logged; only
//! the core and the installer can abort the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use tracing::{info, warn};

use loadout_git::GitError;
use loadout_types::{ClientType, Plugin, safe_url};

use crate::Loader;
use crate::checks;
use crate::error::{LoaderError, LoaderResult};
use crate::layout::{BUILTIN_CATEGORY, Layout, copy_tree};
use crate::resolver;

/// Run every stage. The client mode is pinned here, once per pass.
pub fn run(loader: &mut Loader) -> LoaderResult<()> {
    loader.client_mode = checks::client_mode(&loader.env);

    init_core(loader)?;
    init_repos(loader)?;
    install_requirements(loader)
}

/// Init + fetch the core repo, persisting tracking changes.
pub fn fetch_core(loader: &mut Loader) -> LoaderResult<()> {
    info!("fetching core");

    let core = loader.repos.core_mut();
    core.handle_mut().init();
    if core.handle_mut().fetch() {
        core.persist(&loader.store)?;
    }

    Ok(())
}

/// Init + fetch every plugin repo, persisting tracking changes. Per-repo
/// failures are recorded on the handle, not raised.
pub fn fetch_repos(loader: &mut Loader) -> LoaderResult<()> {
    info!("fetching repos");

    let store = loader.store.clone();
    for repo in loader.repos.iter_mut() {
        repo.handle_mut().init();
        if repo.handle_mut().fetch() {
            repo.persist(&store)?;
        }
    }

    Ok(())
}

/// Materialize the core into the child source tree unless the core
/// sentinel says it already is.
pub fn init_core(loader: &mut Loader) -> LoaderResult<()> {
    fetch_core(loader)?;
    if loader.sig.core_exists() {
        return Ok(());
    }

    info!("initializing core");

    let core = loader.repos.core();
    if core.handle().failed() {
        let error = core.handle().error().cloned().unwrap_or(GitError {
            code: -1,
            stderr: "core repo not initialized".to_string(),
        });
        return Err(LoaderError::CoreUnavailable(error));
    }

    core.handle()
        .checkout_version()
        .map_err(LoaderError::CoreUnavailable)?;

    if let Some(reqs) = core.grab_requirements() {
        loader.requirements.update(reqs.iter().map(String::as_str));
    }

    let child_src = loader.layout.child_src();
    if child_src.exists() {
        fs::remove_dir_all(&child_src)?;
    }
    core.copy_source(&child_src)?;

    core.handle()
        .checkout_branch()
        .map_err(LoaderError::CoreUnavailable)?;

    loader.sig.repos_remove();
    loader.sig.core_make();
    Ok(())
}

/// Select, resolve, and materialize the plugin tree unless the repos
/// sentinel says it is current.
pub fn init_repos(loader: &mut Loader) -> LoaderResult<()> {
    fetch_repos(loader)?;
    if !loader.repos.has_repos() || loader.sig.repos_exists() {
        return Ok(());
    }

    info!("initializing repos");

    let core_count = loader.repos.core().info().count;
    let mode = loader.client_mode;
    let mut selection: BTreeMap<String, Plugin> = BTreeMap::new();
    let mut repos_seen = 0usize;

    // The list is sorted ascending by priority value; walking it in
    // reverse makes the numerically-lowest (most important) repo the last
    // writer, so it wins every name collision.
    let removed = loader.removed.clone();
    let constraints = loader.constraints.clone();
    let env = loader.env.clone();

    for repo in loader.repos.iter_mut().rev() {
        if repo.handle().failed() {
            let error = repo.handle().error().cloned().unwrap_or(GitError {
                code: -1,
                stderr: "not initialized".to_string(),
            });
            warn!(
                url = %safe_url(&repo.info().url),
                code = error.code,
                "skipping repo: {}",
                error.stderr.trim()
            );
            continue;
        }

        if let Err(e) = repo.handle().checkout_version() {
            warn!(url = %safe_url(&repo.info().url), "skipping repo: {}", e);
            continue;
        }
        repo.load_plugins();

        let mut ignored = 0usize;
        let mut overridden = 0usize;

        for plugin in repo.plugins() {
            match eligibility(plugin, core_count, mode, &removed, &constraints, &env) {
                Err(reason) => {
                    ignored += 1;
                    info!("plugin [{}] ignored: {}", plugin.label(), reason);
                }
                Ok(()) => {
                    if let Some(old) = selection.insert(plugin.name.clone(), plugin.clone()) {
                        overridden += 1;
                        info!(
                            "plugin [{}] overrides repo ({})",
                            plugin.label(),
                            safe_url(&old.repo_url)
                        );
                    }
                }
            }
        }

        repos_seen += 1;
        info!(
            url = %safe_url(&repo.info().url),
            ignored, overridden, "scanned repo"
        );
    }

    for builtin in loader.repos.core().builtin_plugins() {
        if let Some(plugin) = selection.remove(&builtin) {
            info!(
                "plugin [{}] removed: matching builtin found",
                plugin.label()
            );
        }
    }

    resolve_depends(&mut selection);

    let specs = grab_specs(&selection);
    if !specs.is_empty() {
        let conflicts = resolver::grab_conflicts(specs.iter().map(String::as_str));

        if !conflicts.is_empty() {
            for conflict in &conflicts {
                selection.retain(|_, plugin| {
                    let hit = plugin
                        .manifest
                        .packages
                        .iter()
                        .any(|spec| resolver::normalize(spec).as_deref() == Some(conflict.as_str()));
                    if hit {
                        info!(
                            "plugin [{}] removed: conflicting requirement ({conflict})",
                            plugin.label()
                        );
                    }
                    !hit
                });
            }

            resolve_depends(&mut selection);
        }

        let specs = grab_specs(&selection);
        loader
            .requirements
            .update(specs.iter().map(String::as_str));
    }

    clean_plugin_tree(&loader.layout)?;
    for plugin in selection.values() {
        let dest = loader
            .layout
            .plugins_dir()
            .join(&plugin.category)
            .join(&plugin.name);
        copy_tree(&plugin.path, &dest)?;
    }

    info!(plugins = selection.len(), repos = repos_seen, "materialized plugins");

    for repo in loader.repos.iter_mut() {
        if let Err(e) = repo.handle().checkout_branch() {
            warn!(url = %safe_url(&repo.info().url), "branch restore failed: {}", e);
        }
    }

    loader.sig.repos_make();
    Ok(())
}

/// Install everything pending, including operator extras from
/// `CUSTOM_PIP_PACKAGES`.
pub fn install_requirements(loader: &mut Loader) -> LoaderResult<()> {
    if let Some(extra) = loader.env.get("CUSTOM_PIP_PACKAGES") {
        let extra = extra.to_string();
        loader.requirements.update(extra.split_whitespace());
    }

    loader.requirements.install()
}

/// First failing predicate wins; the reason feeds the ignore log.
fn eligibility(
    plugin: &Plugin,
    core_count: u64,
    mode: Option<ClientType>,
    removed: &crate::repos::RemovedPlugins,
    constraints: &crate::constraint::Constraints,
    env: &checks::Env,
) -> Result<(), String> {
    let manifest = &plugin.manifest;

    if manifest.available != Some(true) {
        return Err("not available".to_string());
    }

    if removed.contains(&plugin.name) {
        return Err("removed".to_string());
    }

    if let Some(min) = manifest.min_core
        && min > core_count
    {
        return Err(format!(
            "min core version {min} required, current {core_count}"
        ));
    }

    if let Some(max) = manifest.max_core
        && max < core_count
    {
        return Err(format!(
            "max core version {max} required, current {core_count}"
        ));
    }

    if let Some(required) = manifest.client_type {
        let satisfied = mode.is_some_and(|current| required.satisfied_by(current));
        if !satisfied {
            let current = mode.map(|m| m.to_string()).unwrap_or_else(|| "none".into());
            return Err(format!(
                "client type {required} required, current {current}"
            ));
        }
    }

    for var in &manifest.envs {
        if !env.is_set(var) && !env.is_set(&var.to_uppercase()) {
            return Err(format!("env {var} required"));
        }
    }

    for bin in &manifest.bins {
        if !loadout_process::command_exists(bin) {
            return Err(format!("bin {bin} required"));
        }
    }

    if !constraints.is_empty()
        && let Some(reason) = constraints.check(
            &plugin.repo_name,
            &plugin.category.to_lowercase(),
            &plugin.name.to_lowercase(),
        )
    {
        return Err(reason);
    }

    Ok(())
}

/// Repeatedly drop plugins whose dependencies are not all selected, until
/// a full pass removes nothing.
fn resolve_depends(selection: &mut BTreeMap<String, Plugin>) {
    loop {
        let names: BTreeSet<String> = selection.keys().cloned().collect();

        let mut dropped = Vec::new();
        for (name, plugin) in selection.iter() {
            if let Some(dep) = plugin
                .manifest
                .depends
                .iter()
                .find(|dep| !names.contains(*dep))
            {
                dropped.push((name.clone(), dep.clone(), plugin.label()));
            }
        }

        if dropped.is_empty() {
            return;
        }

        for (name, dep, label) in dropped {
            selection.remove(&name);
            info!("plugin [{label}] removed: plugin ({dep}) not found");
        }
    }
}

fn grab_specs(selection: &BTreeMap<String, Plugin>) -> BTreeSet<String> {
    selection
        .values()
        .flat_map(|plugin| plugin.manifest.packages.iter().cloned())
        .collect()
}

/// Wipe every loader-owned category under the child plugin tree; the
/// builtin category belongs to the core.
fn clean_plugin_tree(layout: &Layout) -> std::io::Result<()> {
    let dir = layout.plugins_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
        return Ok(());
    }

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name() == BUILTIN_CATEGORY {
            continue;
        }
        fs::remove_dir_all(entry.path())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraints;
    use crate::repos::RemovedPlugins;
    use loadout_types::{ConstraintKind, PluginManifest};
    use std::path::PathBuf;

    fn plugin(name: &str, manifest: PluginManifest) -> Plugin {
        Plugin {
            path: PathBuf::from(format!("/repo/plugins/misc/{name}")),
            category: "misc".to_string(),
            name: name.to_string(),
            manifest,
            repo_name: "myrepo".to_string(),
            repo_url: "https://github.com/a/myrepo".to_string(),
        }
    }

    fn available() -> PluginManifest {
        PluginManifest {
            available: Some(true),
            ..Default::default()
        }
    }

    fn check(plugin: &Plugin) -> Result<(), String> {
        eligibility(
            plugin,
            500,
            Some(ClientType::Dual),
            &RemovedPlugins::default(),
            &Constraints::default(),
            &checks::Env::default(),
        )
    }

    #[test]
    fn unavailable_is_first_reason() {
        let p = plugin("x", PluginManifest::default());
        assert_eq!(check(&p).unwrap_err(), "not available");
    }

    #[test]
    fn core_bounds_are_enforced() {
        let mut manifest = available();
        manifest.min_core = Some(900);
        let p = plugin("x", manifest);
        assert!(check(&p).unwrap_err().contains("min core version 900"));

        let mut manifest = available();
        manifest.max_core = Some(100);
        let p = plugin("x", manifest);
        assert!(check(&p).unwrap_err().contains("max core version 100"));

        let mut manifest = available();
        manifest.min_core = Some(500);
        manifest.max_core = Some(500);
        let p = plugin("x", manifest);
        assert!(check(&p).is_ok());
    }

    #[test]
    fn client_type_must_be_satisfied() {
        let mut manifest = available();
        manifest.client_type = Some(ClientType::Bot);
        let p = plugin("x", manifest);

        let ok = eligibility(
            &p,
            500,
            Some(ClientType::Dual),
            &RemovedPlugins::default(),
            &Constraints::default(),
            &checks::Env::default(),
        );
        assert!(ok.is_ok(), "dual mode satisfies a bot requirement");

        let err = eligibility(
            &p,
            500,
            Some(ClientType::User),
            &RemovedPlugins::default(),
            &Constraints::default(),
            &checks::Env::default(),
        )
        .unwrap_err();
        assert!(err.contains("client type bot required"));
    }

    #[test]
    fn missing_env_is_a_reason() {
        let mut manifest = available();
        manifest.envs.insert("some_api_key".to_string());
        let p = plugin("x", manifest);

        assert_eq!(check(&p).unwrap_err(), "env some_api_key required");

        let env = checks::Env::from_iter([("SOME_API_KEY", "value")]);
        let ok = eligibility(
            &p,
            500,
            Some(ClientType::Dual),
            &RemovedPlugins::default(),
            &Constraints::default(),
            &env,
        );
        assert!(ok.is_ok(), "upper-cased process vars satisfy manifest names");
    }

    #[test]
    fn missing_bin_is_a_reason() {
        let mut manifest = available();
        manifest.bins.insert("no-such-binary-xyz".to_string());
        let p = plugin("x", manifest);
        assert!(check(&p).unwrap_err().contains("bin no-such-binary-xyz"));

        let mut manifest = available();
        manifest.bins.insert("git".to_string());
        let p = plugin("x", manifest);
        assert!(check(&p).is_ok());
    }

    #[test]
    fn constraints_run_last() {
        let mut constraints = Constraints::default();
        constraints.add(ConstraintKind::Exclude, ["misc/"]);

        let p = plugin("x", available());
        let err = eligibility(
            &p,
            500,
            Some(ClientType::Dual),
            &RemovedPlugins::default(),
            &constraints,
            &checks::Env::default(),
        )
        .unwrap_err();
        assert!(err.contains("excluded by constraint"));
    }

    #[test]
    fn closure_drops_transitively() {
        let mut selection = BTreeMap::new();

        let mut needs_b = available();
        needs_b.depends.insert("b".to_string());
        selection.insert("a".to_string(), plugin("a", needs_b));

        let mut needs_missing = available();
        needs_missing.depends.insert("missing".to_string());
        selection.insert("b".to_string(), plugin("b", needs_missing));

        let mut needs_a = available();
        needs_a.depends.insert("a".to_string());
        selection.insert("c".to_string(), plugin("c", needs_a));

        selection.insert("d".to_string(), plugin("d", available()));

        resolve_depends(&mut selection);

        let names: Vec<&String> = selection.keys().collect();
        assert_eq!(names, vec!["d"]);
    }

    #[test]
    fn grab_specs_unions_packages() {
        let mut selection = BTreeMap::new();

        let mut a = available();
        a.packages.insert("requests>=2.28".to_string());
        selection.insert("a".to_string(), plugin("a", a));

        let mut b = available();
        b.packages.insert("requests>=2.28".to_string());
        b.packages.insert("pillow".to_string());
        selection.insert("b".to_string(), plugin("b", b));

        let specs = grab_specs(&selection);
        assert_eq!(specs.len(), 2);
    }
}
