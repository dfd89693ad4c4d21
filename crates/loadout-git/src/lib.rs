//! Git operations for loadout.
//!
//! This crate drives the `git` CLI against one working copy at a time:
//! clone/open, fetch with remote-branch tracking, forced checkouts, commit
//! existence checks, commit counts, and newest-to-oldest commit walks.
//!
//! Failures carry the git exit status and stderr so callers can record them
//! and turn the owning handle inert instead of raising.
//!
//! # Example
//!
//! ```ignore
//! use loadout_git::GitWorkdir;
//! use std::path::Path;
//!
//! let wd = GitWorkdir::new(Path::new(".rcache/repos/alice.foo"));
//! if wd.is_valid() {
//!     let head = wd.head_commit()?;
//!     println!("at {head}");
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use loadout_process::{CommandResult, run, run_in_dir};

/// Separators used in the `git log` format string for the commit walks.
const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// A git command failure: exit status plus captured stderr.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("git exited with code {code}: {stderr}")]
pub struct GitError {
    pub code: i32,
    pub stderr: String,
}

impl GitError {
    fn spawn(message: String) -> Self {
        Self {
            code: -1,
            stderr: message,
        }
    }
}

pub type GitResult<T> = Result<T, GitError>;

fn check(result: anyhow::Result<CommandResult>) -> GitResult<CommandResult> {
    let result = result.map_err(|e| GitError::spawn(e.to_string()))?;
    if result.success {
        Ok(result)
    } else {
        Err(GitError {
            code: result.exit_code,
            stderr: result.stderr,
        })
    }
}

/// One commit yielded by a [`CommitWalk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub hash: String,
    pub summary: String,
    pub author: String,
}

/// Cursor over the commits of a branch, newest first.
///
/// Built eagerly from one `git log` invocation; [`CommitWalk::next`]
/// consumes entries front to back.
#[derive(Debug)]
pub struct CommitWalk {
    entries: std::vec::IntoIter<CommitEntry>,
}

impl CommitWalk {
    fn parse(stdout: &str) -> Self {
        let entries: Vec<CommitEntry> = stdout
            .split(RECORD_SEP)
            .filter_map(|record| {
                let record = record.trim_matches(['\n', ' ']);
                let mut fields = record.split(FIELD_SEP);
                let hash = fields.next()?.trim().to_string();
                if hash.is_empty() {
                    return None;
                }
                let summary = fields.next().unwrap_or_default().to_string();
                let author = fields.next().unwrap_or_default().to_string();
                Some(CommitEntry {
                    hash,
                    summary,
                    author,
                })
            })
            .collect();

        Self {
            entries: entries.into_iter(),
        }
    }

    /// Next commit, or `None` when the branch root has been passed.
    #[allow(clippy::should_implement_trait, reason = "cursor per design, not an Iterator")]
    pub fn next(&mut self) -> Option<CommitEntry> {
        self.entries.next()
    }
}

/// One git working copy on disk.
#[derive(Debug, Clone)]
pub struct GitWorkdir {
    path: PathBuf,
}

impl GitWorkdir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path holds a usable repository of its own.
    pub fn is_valid(&self) -> bool {
        self.path.join(".git").exists()
            && run_in_dir("git", &["rev-parse", "--git-dir"], &self.path)
                .map(|r| r.success)
                .unwrap_or(false)
    }

    /// Clone `url` into `path`, creating parent directories as needed.
    pub fn clone_from(url: &str, path: impl Into<PathBuf>) -> GitResult<Self> {
        let path: PathBuf = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GitError::spawn(format!("failed to create {}: {e}", parent.display())))?;
        }

        let path_str = path.to_string_lossy().into_owned();
        check(run("git", &["clone", url, &path_str]))?;

        Ok(Self { path })
    }

    fn git(&self, args: &[&str]) -> GitResult<CommandResult> {
        check(run_in_dir("git", args, &self.path))
    }

    /// Fetch the default remote and create local tracking branches for any
    /// remote head not yet present locally.
    pub fn fetch(&self) -> GitResult<()> {
        self.git(&["fetch", "origin"])?;

        let local = self.local_branches()?;
        for branch in self.remote_branches()? {
            if !local.contains(&branch) {
                self.git(&["branch", "--track", &branch, &format!("origin/{branch}")])?;
            }
        }

        Ok(())
    }

    /// Local branch names.
    pub fn local_branches(&self) -> GitResult<Vec<String>> {
        let out = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Branch names on the default remote, without the remote prefix.
    pub fn remote_branches(&self) -> GitResult<Vec<String>> {
        let out = self.git(&[
            "for-each-ref",
            "--format=%(refname:short)",
            "refs/remotes/origin",
        ])?;

        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("origin/"))
            .filter(|name| *name != "HEAD")
            .map(str::to_string)
            .collect())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        !branch.is_empty()
            && self
                .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
                .is_ok()
    }

    /// Whether `rev` resolves to a commit in this repository.
    pub fn commit_exists(&self, rev: &str) -> bool {
        !rev.is_empty()
            && self
                .git(&["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
                .is_ok()
    }

    /// Resolve `rev` to a full commit hash.
    pub fn resolve(&self, rev: &str) -> GitResult<String> {
        let out = self.git(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn head_commit(&self) -> GitResult<String> {
        self.resolve("HEAD")
    }

    /// Force-checkout a branch or commit.
    pub fn checkout(&self, rev: &str) -> GitResult<()> {
        self.git(&["checkout", "--force", rev]).map(|_| ())
    }

    /// Force-pull the given branch from the default remote.
    pub fn pull(&self, branch: &str) -> GitResult<()> {
        self.git(&["pull", "--force", "origin", branch]).map(|_| ())
    }

    /// Commit distance from root at `rev`.
    pub fn commit_count(&self, rev: &str) -> GitResult<u64> {
        let out = self.git(&["rev-list", "--count", rev])?;
        out.stdout
            .trim()
            .parse()
            .map_err(|e| GitError::spawn(format!("unparsable rev-list count: {e}")))
    }

    /// Walk the commits of `branch`, newest first.
    pub fn walk(&self, branch: &str) -> GitResult<CommitWalk> {
        let format = format!("--format=%H{FIELD_SEP}%s{FIELD_SEP}%aN{RECORD_SEP}");
        let out = self.git(&["log", &format, branch])?;
        Ok(CommitWalk::parse(&out.stdout))
    }

    /// Remove the working tree from disk. Missing paths are fine.
    pub fn delete(&self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git");
        assert!(status.status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git_in(dir, &["init", "-b", "main"]);
        git_in(dir, &["config", "user.email", "test@example.com"]);
        git_in(dir, &["config", "user.name", "Test User"]);
    }

    fn commit(dir: &Path, msg: &str) {
        git_in(dir, &["commit", "--allow-empty", "-m", msg]);
    }

    #[test]
    fn is_valid_detects_repo() {
        let td = tempdir().expect("tempdir");
        init_repo(td.path());

        assert!(GitWorkdir::new(td.path()).is_valid());
    }

    #[test]
    fn is_valid_rejects_plain_dir() {
        let td = tempdir().expect("tempdir");
        assert!(!GitWorkdir::new(td.path()).is_valid());
    }

    #[test]
    fn clone_failure_records_status_and_stderr() {
        let td = tempdir().expect("tempdir");
        let err = GitWorkdir::clone_from(
            &format!("file://{}/does-not-exist", td.path().display()),
            td.path().join("clone"),
        )
        .unwrap_err();

        assert_ne!(err.code, 0);
        assert!(!err.stderr.is_empty());
    }

    #[test]
    fn clone_and_fetch_tracks_remote_branches() {
        let td = tempdir().expect("tempdir");
        let upstream = td.path().join("upstream");
        fs::create_dir_all(&upstream).expect("mkdir");
        init_repo(&upstream);
        commit(&upstream, "one");
        git_in(&upstream, &["branch", "feature"]);

        let url = format!("file://{}", upstream.display());
        let wd = GitWorkdir::clone_from(&url, td.path().join("clone")).expect("clone");

        wd.fetch().expect("fetch");
        let branches = wd.local_branches().expect("branches");
        assert!(branches.contains(&"main".to_string()));
        assert!(branches.contains(&"feature".to_string()));
    }

    #[test]
    fn branch_and_commit_predicates() {
        let td = tempdir().expect("tempdir");
        init_repo(td.path());
        commit(td.path(), "one");

        let wd = GitWorkdir::new(td.path());
        assert!(wd.branch_exists("main"));
        assert!(!wd.branch_exists("nope"));
        assert!(!wd.branch_exists(""));

        let head = wd.head_commit().expect("head");
        assert_eq!(head.len(), 40);
        assert!(wd.commit_exists(&head));
        assert!(!wd.commit_exists("0000000000000000000000000000000000000000"));
        assert!(!wd.commit_exists(""));
    }

    #[test]
    fn commit_count_grows() {
        let td = tempdir().expect("tempdir");
        init_repo(td.path());
        commit(td.path(), "one");
        let wd = GitWorkdir::new(td.path());
        assert_eq!(wd.commit_count("HEAD").expect("count"), 1);

        commit(td.path(), "two");
        assert_eq!(wd.commit_count("HEAD").expect("count"), 2);
    }

    #[test]
    fn walk_yields_newest_first() {
        let td = tempdir().expect("tempdir");
        init_repo(td.path());
        commit(td.path(), "first");
        commit(td.path(), "second");

        let wd = GitWorkdir::new(td.path());
        let mut walk = wd.walk("main").expect("walk");

        let newest = walk.next().expect("newest");
        assert_eq!(newest.summary, "second");
        assert_eq!(newest.author, "Test User");
        assert_eq!(newest.hash.len(), 40);

        let older = walk.next().expect("older");
        assert_eq!(older.summary, "first");

        assert!(walk.next().is_none());
    }

    #[test]
    fn checkout_moves_head() {
        let td = tempdir().expect("tempdir");
        init_repo(td.path());
        commit(td.path(), "first");
        let wd = GitWorkdir::new(td.path());
        let first = wd.head_commit().expect("head");

        commit(td.path(), "second");
        wd.checkout(&first).expect("checkout");
        assert_eq!(wd.head_commit().expect("head"), first);

        wd.checkout("main").expect("checkout branch");
        assert_ne!(wd.head_commit().expect("head"), first);
    }

    #[test]
    fn delete_removes_tree() {
        let td = tempdir().expect("tempdir");
        let repo = td.path().join("repo");
        fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);

        let wd = GitWorkdir::new(&repo);
        wd.delete();
        assert!(!repo.exists());

        // deleting again is a no-op
        wd.delete();
    }
}
