//! # Types
//!
//! Core domain types for loadout, shared between the engine, the store,
//! and the RPC surface:
//!
//! - [`RepoInfo`] - Identity and tracking state of one source repository
//! - [`Update`] - One commit on a tracked branch, newer than the pinned version
//! - [`ClientType`] - Runtime client mode a plugin may require
//! - [`PluginManifest`] - Parsed declarative metadata of one plugin
//! - [`Plugin`] - A plugin directory discovered in a repository
//! - [`ConstraintRule`] / [`ConstraintKind`] - Selection constraint patterns
//!
//! ## Serialization
//!
//! All types implement `Serialize` and `Deserialize` from `serde`; they are
//! persisted as store documents and travel over the RPC pipe as JSON.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Repository id reserved for the core repo.
pub const CORE_REPO_ID: i32 = -1;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ghp_[0-9A-Za-z]{36}").expect("valid token pattern"))
}

fn repo_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https://(ghp_[0-9A-Za-z]{36}@)?github\.com/[^/\s]+/[^/\s]+$")
            .expect("valid repo url pattern")
    })
}

/// Redact embedded access tokens from a repository URL.
///
/// Idempotent: `safe_url(safe_url(u)) == safe_url(u)`.
pub fn safe_url(url: &str) -> String {
    token_re().replace_all(url, "private").into_owned()
}

/// Whether a URL is acceptable as a plugin repository origin.
///
/// Only GitHub over https, optionally with an embedded `ghp_` token.
pub fn is_valid_repo_url(url: &str) -> bool {
    repo_url_re().is_match(url)
}

/// Short repository name used in constraint patterns: the last URL path
/// segment, lower-cased.
pub fn repo_short_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// Identity and tracking state of one git-backed source repository.
///
/// `version` is either empty ("head of branch") or a 40-hex commit id
/// reachable from some local branch. `count` is the commit distance from
/// root at the pinned version, `max_count` the distance at the branch head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Auto-assigned id; [`CORE_REPO_ID`] for the core repo.
    pub id: i32,
    /// Sort key across plugin repos; lower sorts first.
    pub priority: i32,
    /// Tracked branch name.
    pub branch: String,
    /// Pinned commit id, or empty for head of branch.
    pub version: String,
    /// Origin URL, possibly carrying an access token.
    pub url: String,
    /// Commit distance from root at the pinned version.
    #[serde(default)]
    pub count: u64,
    /// Commit distance from root at the branch head.
    #[serde(default)]
    pub max_count: u64,
    /// Known local branch names.
    #[serde(default)]
    pub branches: BTreeSet<String>,
}

impl RepoInfo {
    pub fn new(id: i32, priority: i32, branch: &str, version: &str, url: &str) -> Self {
        Self {
            id,
            priority,
            branch: branch.to_string(),
            version: version.to_string(),
            url: url.to_string(),
            count: 0,
            max_count: 0,
            branches: BTreeSet::new(),
        }
    }

    /// Copy of this info with the origin URL token-redacted, safe to hand
    /// back over RPC or write to logs.
    pub fn sanitized(&self) -> Self {
        let mut info = self.clone();
        info.url = safe_url(&info.url);
        info
    }
}

/// One commit on a tracked branch, as reported by the commit walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Commit subject line.
    pub summary: String,
    /// Author display name.
    pub author: String,
    /// Full commit hash.
    pub version: String,
    /// Commit distance from root.
    pub count: u64,
    /// Web URL of the commit, token-redacted.
    pub url: String,
}

impl Update {
    /// Build an update for `hash` on the repo at `repo_url`.
    pub fn new(repo_url: &str, hash: &str, summary: &str, author: &str, count: u64) -> Self {
        Self {
            summary: summary.to_string(),
            author: author.to_string(),
            version: hash.to_string(),
            count,
            url: format!("{}/commit/{}", safe_url(repo_url), hash),
        }
    }
}

/// Runtime client mode, derived once from the environment at pipeline start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Bot,
    User,
    Dual,
}

impl ClientType {
    /// Whether a plugin requiring `self` can run under the `current` mode.
    pub fn satisfied_by(self, current: ClientType) -> bool {
        self == current || current == ClientType::Dual
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientType::Bot => write!(f, "bot"),
            ClientType::User => write!(f, "user"),
            ClientType::Dual => write!(f, "dual"),
        }
    }
}

/// Error parsing a [`ClientType`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown client type: {0}")]
pub struct ClientTypeParseError(pub String);

impl FromStr for ClientType {
    type Err = ClientTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bot" => Ok(ClientType::Bot),
            "user" => Ok(ClientType::User),
            "dual" => Ok(ClientType::Dual),
            other => Err(ClientTypeParseError(other.to_string())),
        }
    }
}

/// Parsed declarative metadata of one plugin (`config.ini`).
///
/// Scalar fields stay unset when absent or unparsable; set fields default to
/// empty. An absent `available` makes the plugin ineligible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    /// Lower bound on the core repo commit distance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_core: Option<u64>,
    /// Upper bound on the core repo commit distance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_core: Option<u64>,
    /// Required runtime client mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<ClientType>,
    /// Environment variables that must be present and non-empty.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub envs: BTreeSet<String>,
    /// Executables that must resolve on PATH.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub bins: BTreeSet<String>,
    /// Plugin names that must also be selected.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends: BTreeSet<String>,
    /// External package version specifiers.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub packages: BTreeSet<String>,
}

/// A plugin directory discovered under `plugins/<category>/<name>/` in a
/// source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    /// Absolute path of the plugin directory in the repo working copy.
    pub path: PathBuf,
    pub category: String,
    pub name: String,
    pub manifest: PluginManifest,
    /// Short name of the source repo, for constraint matching.
    pub repo_name: String,
    /// Origin URL of the source repo.
    pub repo_url: String,
}

impl Plugin {
    /// `category/name` label used in log lines.
    pub fn label(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }
}

/// Which of the three ordered constraint sets a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Include,
    Exclude,
    In,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintKind::Include => write!(f, "include"),
            ConstraintKind::Exclude => write!(f, "exclude"),
            ConstraintKind::In => write!(f, "in"),
        }
    }
}

/// Error parsing a [`ConstraintKind`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown constraint kind: {0}")]
pub struct ConstraintKindParseError(pub String);

impl FromStr for ConstraintKind {
    type Err = ConstraintKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "include" => Ok(ConstraintKind::Include),
            "exclude" => Ok(ConstraintKind::Exclude),
            "in" => Ok(ConstraintKind::In),
            other => Err(ConstraintKindParseError(other.to_string())),
        }
    }
}

/// A parsed pattern over `repo_name / category / plugin_name`.
///
/// The raw string is case-folded and slash-split:
///
/// - `x` matches plugin name `x`
/// - `a/b` (b non-empty) matches repo `a` AND plugin `b`
/// - `a/` matches category `a`
/// - `a/b/` matches repo `a` AND category `b`
/// - `a/b/c` matches repo `a` AND category `b` AND plugin `c`
///
/// A fully-empty rule never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintRule {
    /// Normalized raw form, used for de-duplication and the RPC listing.
    pub raw: String,
    pub repo: Option<String>,
    pub category: Option<String>,
    pub plugin: Option<String>,
}

impl ConstraintRule {
    /// Parse a raw pattern, normalizing case and whitespace.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_lowercase();
        let parts: Vec<String> = raw.split('/').map(|p| p.trim().to_string()).collect();

        let some = |s: &String| {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        };

        let (repo, category, plugin) = match parts.as_slice() {
            [x] => (None, None, some(x)),
            [a, b] if !b.is_empty() => (some(a), None, some(b)),
            [a, _] => (None, some(a), None),
            [a, b, c] if !c.is_empty() => (some(a), some(b), some(c)),
            [a, b, _] => (some(a), some(b), None),
            _ => (None, None, None),
        };

        Self {
            raw,
            repo,
            category,
            plugin,
        }
    }

    /// Whether every specified component equals the corresponding input.
    ///
    /// Inputs are expected to be lower-cased already.
    pub fn matches(&self, repo: &str, category: &str, plugin: &str) -> bool {
        if self.repo.is_none() && self.category.is_none() && self.plugin.is_none() {
            return false;
        }

        self.repo.as_deref().is_none_or(|r| r == repo)
            && self.category.as_deref().is_none_or(|c| c == category)
            && self.plugin.as_deref().is_none_or(|p| p == plugin)
    }
}
