//! Repository handles and the loader's repo set.
//!
//! A [`RepoHandle`] owns one git working copy plus its [`RepoInfo`]. A
//! handle that fails to clone or fetch records the git status and stderr
//! and turns inert: every later operation is a no-op (or returns empty),
//! never an error. [`Repos`] holds the core handle and the priority-sorted
//! plugin repo handles, backed by the store.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use loadout_git::{GitError, GitWorkdir};
use loadout_store::{CoreDoc, RepoDoc, Store, StoreResult};
use loadout_types::{
    CORE_REPO_ID, Plugin, RepoInfo, Update, is_valid_repo_url, repo_short_name, safe_url,
};

use crate::layout::{BUILTIN_CATEGORY, CORE_SOURCE_SUBDIR, Layout, copy_tree, repo_dir_name};
use crate::manifest;

/// Core repo origin when `CORE_REPO_URL` is not configured.
pub const DEFAULT_CORE_URL: &str = "https://github.com/EffortlessMetrics/loadout-app";

/// Branch assumed for the core before the store has a pin.
pub const DEFAULT_CORE_BRANCH: &str = "new";

#[derive(Debug, Clone)]
enum HandleState {
    /// `init` has not run yet.
    Pending,
    Ready,
    Failed(GitError),
}

/// One git-backed repository: working copy, tracking info, failure record.
#[derive(Debug, Clone)]
pub struct RepoHandle {
    pub info: RepoInfo,
    workdir: GitWorkdir,
    state: HandleState,
}

impl RepoHandle {
    pub fn new(info: RepoInfo, path: PathBuf) -> Self {
        Self {
            info,
            workdir: GitWorkdir::new(path),
            state: HandleState::Pending,
        }
    }

    pub fn failed(&self) -> bool {
        !matches!(self.state, HandleState::Ready)
    }

    /// The recorded `(status, stderr)` of a failed handle.
    pub fn error(&self) -> Option<&GitError> {
        match &self.state {
            HandleState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        self.workdir.path()
    }

    /// Open the working copy, or clone it. A clone failure marks the
    /// handle failed; later operations no-op.
    pub fn init(&mut self) {
        if !matches!(self.state, HandleState::Pending) {
            return;
        }

        if self.workdir.path().exists() && self.workdir.is_valid() {
            self.state = HandleState::Ready;
            return;
        }

        self.workdir.delete();
        match GitWorkdir::clone_from(&self.info.url, self.workdir.path()) {
            Ok(workdir) => {
                self.workdir = workdir;
                self.state = HandleState::Ready;
            }
            Err(e) => self.state = HandleState::Failed(e),
        }
    }

    fn fail(&mut self, error: GitError) {
        self.state = HandleState::Failed(error);
    }

    /// Fetch the remote, reselect the tracked branch if it vanished,
    /// resolve the pinned version, and refresh the commit counts.
    ///
    /// Returns true when the info changed and needs persisting. A git
    /// failure marks the handle failed and returns false.
    pub fn fetch(&mut self) -> bool {
        if self.failed() {
            return false;
        }

        if let Err(e) = self.workdir.fetch() {
            self.fail(e);
            return false;
        }

        let branches = match self.workdir.local_branches() {
            Ok(branches) => branches,
            Err(e) => {
                self.fail(e);
                return false;
            }
        };

        let mut dirty = false;

        let selected = if !self.info.branch.is_empty() && branches.contains(&self.info.branch) {
            self.info.branch.clone()
        } else {
            let Some(first) = branches.first() else {
                self.fail(GitError {
                    code: -1,
                    stderr: "repository has no branches".to_string(),
                });
                return false;
            };
            self.info.branch = first.clone();
            dirty = true;
            first.clone()
        };

        if let Err(e) = self
            .workdir
            .checkout(&selected)
            .and_then(|()| self.workdir.pull(&selected))
        {
            self.fail(e);
            return false;
        }

        if self.info.version.is_empty() || !self.workdir.commit_exists(&self.info.version) {
            match self.workdir.head_commit() {
                Ok(head) => {
                    self.info.version = head;
                    dirty = true;
                }
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }

        self.info.count = self.workdir.commit_count(&self.info.version).unwrap_or(0);
        self.info.max_count = self.workdir.commit_count(&selected).unwrap_or(0);
        self.info.branches = branches.into_iter().collect::<BTreeSet<_>>();

        dirty
    }

    /// Force-checkout the pinned version commit.
    pub fn checkout_version(&self) -> Result<(), GitError> {
        if self.failed() {
            return Ok(());
        }

        if self.workdir.head_commit().as_deref() != Ok(self.info.version.as_str()) {
            self.workdir.checkout(&self.info.version)?;
        }
        Ok(())
    }

    /// Force-checkout the tracked branch, restoring head after a pinned
    /// checkout.
    pub fn checkout_branch(&self) -> Result<(), GitError> {
        if self.failed() {
            return Ok(());
        }
        self.workdir.checkout(&self.info.branch)
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        !self.failed() && self.workdir.branch_exists(branch)
    }

    pub fn version_exists(&self, rev: &str) -> bool {
        !self.failed() && self.workdir.commit_exists(rev)
    }

    /// Commits on the tracked branch newer than the pinned version,
    /// newest first. Empty when the pinned version is not reachable.
    pub fn new_commits(&self) -> Vec<Update> {
        let version = self.info.version.clone();
        if !self.version_exists(&version) {
            return Vec::new();
        }

        let Ok(mut walk) = self.workdir.walk(&self.info.branch) else {
            return Vec::new();
        };

        let mut updates = Vec::new();
        let mut found = false;

        while let Some(commit) = walk.next() {
            if commit.hash == version {
                found = true;
                break;
            }
            updates.push(self.update_for(&commit));
        }

        if !found {
            updates.clear();
        }
        updates
    }

    /// Up to `limit` commits older than the pinned version, newest first.
    pub fn old_commits(&self, limit: u64) -> Vec<Update> {
        let version = self.info.version.clone();
        if limit == 0 || !self.version_exists(&version) {
            return Vec::new();
        }

        let Ok(mut walk) = self.workdir.walk(&self.info.branch) else {
            return Vec::new();
        };

        let mut updates = Vec::new();
        let mut found = false;

        while let Some(commit) = walk.next() {
            if !found {
                found = commit.hash == version;
                continue;
            }

            updates.push(self.update_for(&commit));
            if updates.len() as u64 >= limit {
                break;
            }
        }

        updates
    }

    fn update_for(&self, commit: &loadout_git::CommitEntry) -> Update {
        let count = self.workdir.commit_count(&commit.hash).unwrap_or(0);
        Update::new(
            &self.info.url,
            &commit.hash,
            &commit.summary,
            &commit.author,
            count,
        )
    }

    /// Remove the working tree from disk.
    pub fn delete(&self) {
        self.workdir.delete();
    }
}

/// The single required upstream repository.
#[derive(Debug, Clone)]
pub struct CoreRepo {
    handle: RepoHandle,
}

impl CoreRepo {
    pub fn parse(branch: &str, version: &str, url: &str, layout: &Layout) -> Self {
        let info = RepoInfo::new(CORE_REPO_ID, -1, branch, version, url);
        let path = layout.core_cache().join(repo_dir_name(url));

        Self {
            handle: RepoHandle::new(info, path),
        }
    }

    pub fn handle(&self) -> &RepoHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut RepoHandle {
        &mut self.handle
    }

    pub fn info(&self) -> &RepoInfo {
        &self.handle.info
    }

    /// Package specifiers from the core's `requirements.txt`, if present.
    pub fn grab_requirements(&self) -> Option<Vec<String>> {
        let path = self.handle.path().join("requirements.txt");
        let text = fs::read_to_string(path).ok()?;

        Some(
            text.split_whitespace()
                .map(str::to_string)
                .collect(),
        )
    }

    /// Names of the plugins the core ships under `plugins/builtin/`.
    pub fn builtin_plugins(&self) -> Vec<String> {
        let path = self
            .handle
            .path()
            .join("plugins")
            .join(BUILTIN_CATEGORY);

        let mut names: Vec<String> = list_dirs(&path)
            .into_iter()
            .filter(|name| !name.starts_with('_'))
            .collect();
        names.sort();
        names
    }

    /// Copy the core's source subdirectory into the child tree.
    pub fn copy_source(&self, dest: &Path) -> std::io::Result<()> {
        copy_tree(&self.handle.path().join(CORE_SOURCE_SUBDIR), dest)
    }

    fn doc(&self) -> CoreDoc {
        CoreDoc {
            branch: self.handle.info.branch.clone(),
            version: self.handle.info.version.clone(),
        }
    }

    /// Persist branch/version to the store.
    pub fn persist(&self, store: &Store) -> StoreResult<()> {
        store.upsert_core(&self.doc())
    }
}

/// One auxiliary repository contributing plugin directories.
#[derive(Debug, Clone)]
pub struct PluginRepo {
    handle: RepoHandle,
    plugins: Vec<Plugin>,
}

impl PluginRepo {
    pub fn parse(
        id: i32,
        priority: i32,
        branch: &str,
        version: &str,
        url: &str,
        layout: &Layout,
    ) -> Self {
        let info = RepoInfo::new(id, priority, branch, version, url);
        let path = layout.repos_cache().join(repo_dir_name(url));

        Self {
            handle: RepoHandle::new(info, path),
            plugins: Vec::new(),
        }
    }

    pub fn handle(&self) -> &RepoHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut RepoHandle {
        &mut self.handle
    }

    pub fn info(&self) -> &RepoInfo {
        &self.handle.info
    }

    pub fn info_mut(&mut self) -> &mut RepoInfo {
        &mut self.handle.info
    }

    /// Rescan `plugins/<category>/<name>/` in the working copy.
    ///
    /// Skips the builtin category and any category or plugin directory
    /// whose name starts with `_`. Deterministic: directories are visited
    /// in sorted order.
    pub fn load_plugins(&mut self) {
        self.plugins.clear();

        let plugins_path = self.handle.path().join("plugins");
        let repo_name = repo_short_name(&self.handle.info.url);

        for category in list_dirs(&plugins_path) {
            if category == BUILTIN_CATEGORY || category.starts_with('_') {
                continue;
            }

            let category_path = plugins_path.join(&category);
            for name in list_dirs(&category_path) {
                if name.starts_with('_') {
                    continue;
                }

                let path = category_path.join(&name);
                self.plugins.push(Plugin {
                    manifest: manifest::parse(&path),
                    path,
                    category: category.clone(),
                    name,
                    repo_name: repo_name.clone(),
                    repo_url: self.handle.info.url.clone(),
                });
            }
        }
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    fn doc(&self) -> RepoDoc {
        RepoDoc {
            priority: self.handle.info.priority,
            branch: self.handle.info.branch.clone(),
            version: self.handle.info.version.clone(),
            url: self.handle.info.url.clone(),
        }
    }

    /// Persist priority/branch/version to the store.
    pub fn persist(&self, store: &Store) -> StoreResult<()> {
        store.update_repo(&self.doc())
    }
}

fn list_dirs(path: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            if entry.file_type().ok()?.is_dir() {
                entry.file_name().to_str().map(str::to_string)
            } else {
                None
            }
        })
        .collect();
    names.sort();
    names
}

/// The loader's repo set: the core plus the priority-sorted plugin repos.
#[derive(Debug, Clone)]
pub struct Repos {
    core: CoreRepo,
    plugins: Vec<PluginRepo>,
}

impl Repos {
    /// Build from the store. Repo ids are assigned 1..n in document order;
    /// the core pin falls back to branch "new", head version.
    pub fn load(store: &Store, layout: &Layout, core_url: &str) -> StoreResult<Self> {
        let core_doc = store.load_core()?.unwrap_or(CoreDoc {
            branch: DEFAULT_CORE_BRANCH.to_string(),
            version: String::new(),
        });
        let core = CoreRepo::parse(&core_doc.branch, &core_doc.version, core_url, layout);

        let mut plugins = Vec::new();
        for (index, doc) in store.list_repos()?.into_iter().enumerate() {
            plugins.push(PluginRepo::parse(
                index as i32 + 1,
                doc.priority,
                &doc.branch,
                &doc.version,
                &doc.url,
                layout,
            ));
        }

        let mut repos = Self { core, plugins };
        repos.sort();
        Ok(repos)
    }

    /// Stable sort by priority; lower values sort first.
    pub fn sort(&mut self) {
        self.plugins.sort_by_key(|repo| repo.info().priority);
    }

    pub fn core(&self) -> &CoreRepo {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut CoreRepo {
        &mut self.core
    }

    pub fn has_repos(&self) -> bool {
        !self.plugins.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PluginRepo> {
        self.plugins.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PluginRepo> {
        self.plugins.iter_mut()
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut PluginRepo> {
        self.plugins.iter_mut().find(|repo| repo.info().id == id)
    }

    pub fn get_by_url(&self, url: &str) -> Option<&PluginRepo> {
        self.plugins.iter().find(|repo| repo.info().url == url)
    }

    /// Register a repo. Invalid or duplicate URLs are a silent no-op;
    /// returns whether anything was added.
    pub fn add(
        &mut self,
        store: &Store,
        layout: &Layout,
        priority: i32,
        branch: &str,
        url: &str,
    ) -> StoreResult<bool> {
        if !is_valid_repo_url(url) || self.get_by_url(url).is_some() {
            return Ok(false);
        }

        let id = self
            .plugins
            .iter()
            .map(|repo| repo.info().id)
            .max()
            .unwrap_or(0)
            + 1;

        let repo = PluginRepo::parse(id, priority, branch, "", url, layout);
        store.insert_repo(&repo.doc())?;
        self.plugins.push(repo);
        self.sort();

        info!(url = %safe_url(url), id, "added repo");
        Ok(true)
    }

    /// Drop a repo by id: store document, working copy, and handle.
    /// Returns whether anything was removed.
    pub fn remove(&mut self, store: &Store, id: i32) -> StoreResult<bool> {
        let Some(index) = self.plugins.iter().position(|repo| repo.info().id == id) else {
            return Ok(false);
        };

        let repo = self.plugins.remove(index);
        store.delete_repo_by_url(&repo.info().url)?;
        repo.handle().delete();

        info!(url = %safe_url(&repo.info().url), id, "removed repo");
        Ok(true)
    }
}

/// Plugin names the operator removed, shadowing any repo that ships them.
#[derive(Debug, Clone, Default)]
pub struct RemovedPlugins {
    names: BTreeSet<String>,
}

impl RemovedPlugins {
    pub fn load(store: &Store) -> StoreResult<Self> {
        Ok(Self {
            names: store.list_removed()?.into_iter().collect(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    /// Add names; returns whether the set changed.
    pub fn add<'a>(
        &mut self,
        store: &Store,
        names: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<bool> {
        let to_add: Vec<String> = names
            .into_iter()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !self.names.contains(*name))
            .map(str::to_string)
            .collect();

        if to_add.is_empty() {
            return Ok(false);
        }

        store.insert_many_removed(to_add.iter().map(String::as_str))?;
        self.names.extend(to_add);
        Ok(true)
    }

    /// Remove names; returns whether the set changed.
    pub fn remove<'a>(
        &mut self,
        store: &Store,
        names: impl IntoIterator<Item = &'a str>,
    ) -> StoreResult<bool> {
        let to_remove: Vec<String> = names
            .into_iter()
            .map(str::trim)
            .filter(|name| self.names.contains(*name))
            .map(str::to_string)
            .collect();

        if to_remove.is_empty() {
            return Ok(false);
        }

        store.delete_removed_by_names(to_remove.iter().map(String::as_str))?;
        for name in &to_remove {
            self.names.remove(name);
        }
        Ok(true)
    }

    /// Clear the whole set; returns whether anything was dropped.
    pub fn clear(&mut self, store: &Store) -> StoreResult<bool> {
        if self.names.is_empty() {
            return Ok(false);
        }

        store.drop_removed()?;
        self.names.clear();
        Ok(true)
    }
}
