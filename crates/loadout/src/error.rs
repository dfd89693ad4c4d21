//! Fatal error kinds of the loader.
//!
//! Per-plugin and per-repo problems are not errors at this level: they are
//! logged and shrink the plugin set. Everything here terminates the loader
//! (except [`LoaderError::Interrupted`], which asks the entry point to
//! re-execute the host binary).

use loadout_git::GitError;
use loadout_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The environment or configuration fails validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The store backend cannot be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The core repo could not be cloned or fetched.
    #[error("core unavailable: git status {}: {}", .0.code, .0.stderr)]
    CoreUnavailable(GitError),

    /// The package installer exited non-zero.
    #[error("dependency install failed with code {code}: {stderr}")]
    DependencyInstallFailed { code: i32, stderr: String },

    /// The loader was upgraded in place; the entry point re-executes.
    #[error("interrupted for re-exec")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for LoaderError {
    fn from(e: StoreError) -> Self {
        LoaderError::StoreUnavailable(e.to_string())
    }
}

pub type LoaderResult<T> = Result<T, LoaderError>;
