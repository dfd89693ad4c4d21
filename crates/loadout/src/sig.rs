//! Cache-validity sentinels.
//!
//! Two zero-byte marker files signal that a materialization phase
//! completed: `.sig_core` for the core tree, `.sig_repos` for the plugin
//! tree. Pipeline stages create them on success; any operation that
//! invalidates a phase removes the matching file. Removing the core
//! sentinel also removes the repos sentinel, since the plugin tree is
//! built against the materialized core.

use std::fs;
use std::path::PathBuf;

use crate::layout::Layout;

#[derive(Debug, Clone)]
pub struct Sig {
    core: PathBuf,
    repos: PathBuf,
}

impl Sig {
    pub fn new(layout: &Layout) -> Self {
        Self {
            core: layout.sig_core(),
            repos: layout.sig_repos(),
        }
    }

    fn make(path: &PathBuf) {
        if !path.exists() {
            let _ = fs::File::create(path);
        }
    }

    fn remove(path: &PathBuf) {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    pub fn core_exists(&self) -> bool {
        self.core.exists()
    }

    pub fn core_make(&self) {
        Self::make(&self.core);
    }

    pub fn core_remove(&self) {
        Self::remove(&self.core);
        self.repos_remove();
    }

    pub fn repos_exists(&self) -> bool {
        self.repos.exists()
    }

    pub fn repos_make(&self) {
        Self::make(&self.repos);
    }

    pub fn repos_remove(&self) {
        Self::remove(&self.repos);
    }
}
