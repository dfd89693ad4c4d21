//! On-disk layout of the loader's working directory.
//!
//! Everything the loader owns lives under one root: the repo cache with its
//! sentinel files, the child's source tree, and the dotenv files. The child
//! source tree is wiped and repopulated by the pipeline; only
//! `app/plugins/builtin/` inside it belongs to the core.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory name of the child source tree under the root.
pub const CHILD_SRC: &str = "app";

/// Subdirectory of the core repo that is copied into the child tree.
pub const CORE_SOURCE_SUBDIR: &str = "app";

/// Category owned by the core; never touched by the plugin stage.
pub const BUILTIN_CATEGORY: &str = "builtin";

const CACHE_DIR: &str = ".rcache";

/// Paths derived from the loader's working directory root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Cache subtree for the core working copy.
    pub fn core_cache(&self) -> PathBuf {
        self.cache_dir().join("core")
    }

    /// Cache subtree for plugin repo working copies.
    pub fn repos_cache(&self) -> PathBuf {
        self.cache_dir().join("repos")
    }

    pub fn sig_core(&self) -> PathBuf {
        self.cache_dir().join(".sig_core")
    }

    pub fn sig_repos(&self) -> PathBuf {
        self.cache_dir().join(".sig_repos")
    }

    /// Control-plane socket the child connects back to.
    pub fn socket_path(&self) -> PathBuf {
        self.cache_dir().join("loadout.sock")
    }

    /// The child's source tree, fully owned by the loader.
    pub fn child_src(&self) -> PathBuf {
        self.root.join(CHILD_SRC)
    }

    /// Plugin tree inside the child source.
    pub fn plugins_dir(&self) -> PathBuf {
        self.child_src().join("plugins")
    }

    pub fn conf_path(&self) -> PathBuf {
        self.root.join("config.env")
    }

    /// Overriding dotenv file, also the target of `set_env` writes.
    pub fn conf_tmp_path(&self) -> PathBuf {
        self.root.join("config.env.tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Download directory for a (possibly relative) `DOWN_PATH` value.
    pub fn down_path(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// On-disk working-copy directory for a repo URL: the last two URL path
/// segments joined with a dot, so `github.com/alice/foo` maps to
/// `alice.foo`.
pub fn repo_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let mut segments: Vec<&str> = trimmed.rsplit('/').take(2).collect();
    segments.reverse();
    segments.join(".")
}

/// Recursively copy a directory tree.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
