//! Environment validation and the loader's owned environment map.
//!
//! The loader never mutates its own process environment. It captures the
//! environment once at startup into an [`Env`] map, applies defaults and
//! validation there, serves `set_env`/`unset_env` against it, and hands the
//! whole map to the child process at spawn time. The `config.env.tmp`
//! dotenv file is kept in sync so mutations survive a restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::info;

use loadout_types::ClientType;

use crate::error::{LoaderError, LoaderResult};
use crate::layout::Layout;

const REQUIRED_VARS: [&str; 4] = ["API_ID", "API_HASH", "DATABASE_URL", "LOG_CHANNEL_ID"];

const MAX_WORKERS: u32 = 16;

/// The loader's view of the environment.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: BTreeMap<String, String>,
}

impl Env {
    /// Snapshot the process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_iter<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Present and non-empty.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_empty())
    }

    /// Insert unless already present.
    pub fn set_default(&mut self, key: &str, value: &str) {
        self.vars
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }

    /// Set a variable; returns true when the key was not present before.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        self.vars
            .insert(key.to_string(), value.to_string())
            .is_none()
    }

    /// Remove a variable; returns true when the key was present.
    pub fn unset(&mut self, key: &str) -> bool {
        self.vars.remove(key).is_some()
    }

    /// All entries, for handing to the child process.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Derive the runtime client mode from the credentials present.
///
/// Both credentials give `dual`; validation guarantees at least one is set.
pub fn client_mode(env: &Env) -> Option<ClientType> {
    let token = env.is_set("BOT_TOKEN");
    let string = env.is_set("SESSION_STRING");

    match (token, string) {
        (true, true) => Some(ClientType::Dual),
        (true, false) => Some(ClientType::Bot),
        (false, true) => Some(ClientType::User),
        (false, false) => None,
    }
}

/// The store path configured through `DATABASE_URL`, `sled:` prefix
/// optional.
pub fn database_path(env: &Env) -> Option<std::path::PathBuf> {
    let raw = env.get("DATABASE_URL")?.trim();
    let path = raw.strip_prefix("sled:").unwrap_or(raw).trim();
    if path.is_empty() {
        None
    } else {
        Some(std::path::PathBuf::from(path))
    }
}

/// The `git` CLI is required for everything the loader does.
pub fn ensure_git() -> LoaderResult<()> {
    info!("checking git");

    if !loadout_process::command_exists("git") {
        return Err(LoaderError::ConfigInvalid("required git on PATH".into()));
    }

    Ok(())
}

fn default_workers() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    (cpus + 4).clamp(1, MAX_WORKERS)
}

/// Validate required variables, apply defaults, and create the working
/// directories. Mutates only the owned [`Env`] map.
pub fn validate_env(env: &mut Env, layout: &Layout) -> LoaderResult<()> {
    info!("checking env vars");

    for var in REQUIRED_VARS {
        if !env.is_set(var) {
            return Err(LoaderError::ConfigInvalid(format!("required {var} var")));
        }
    }

    let has_bot = env.is_set("BOT_TOKEN");
    if !has_bot && !env.is_set("SESSION_STRING") {
        return Err(LoaderError::ConfigInvalid(
            "required SESSION_STRING or BOT_TOKEN var".into(),
        ));
    }
    if has_bot && !env.is_set("OWNER_ID") {
        return Err(LoaderError::ConfigInvalid("required OWNER_ID var".into()));
    }
    if !has_bot {
        info!("BOT_TOKEN not found, advanced log features stay off");
    }

    env.set_default("DOWN_PATH", "downloads");
    env.set_default("CMD_TRIGGER", ".");
    env.set_default("SUDO_TRIGGER", "!");

    let workers = env
        .get("WORKERS")
        .and_then(|w| w.parse::<u32>().ok())
        .filter(|w| *w > 0)
        .map(|w| w.clamp(1, MAX_WORKERS))
        .unwrap_or_else(default_workers);
    env.set("WORKERS", &workers.to_string());

    let down_path = format!(
        "{}/",
        env.get("DOWN_PATH").unwrap_or("downloads").trim_end_matches('/')
    );
    env.set("DOWN_PATH", &down_path);

    let cmd = env.get("CMD_TRIGGER").unwrap_or_default().to_string();
    let sudo = env.get("SUDO_TRIGGER").unwrap_or_default().to_string();

    if cmd == sudo {
        return Err(LoaderError::ConfigInvalid(format!(
            "can't use {cmd} as both CMD_TRIGGER and SUDO_TRIGGER"
        )));
    }
    if cmd == "/" || sudo == "/" {
        return Err(LoaderError::ConfigInvalid(
            "can't use / as CMD_TRIGGER or SUDO_TRIGGER".into(),
        ));
    }

    for dir in [
        layout.down_path(&down_path),
        layout.logs_dir(),
        layout.cache_dir(),
    ] {
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
    }

    Ok(())
}

/// Set `key` in a dotenv file, replacing an existing line or appending.
pub fn write_env_key(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let mut lines = read_env_lines(path);
    let prefix = format!("{key}=");

    match lines.iter_mut().find(|l| l.starts_with(&prefix)) {
        Some(line) => *line = format!("{key}={value}"),
        None => lines.push(format!("{key}={value}")),
    }

    write_env_lines(path, &lines)
}

/// Drop `key` from a dotenv file if present.
pub fn remove_env_key(path: &Path, key: &str) -> std::io::Result<()> {
    let mut lines = read_env_lines(path);
    let prefix = format!("{key}=");
    lines.retain(|l| !l.starts_with(&prefix));

    write_env_lines(path, &lines)
}

fn read_env_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn write_env_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_env() -> Env {
        Env::from_iter([
            ("API_ID", "12345"),
            ("API_HASH", "hash"),
            ("DATABASE_URL", "sled:/tmp/loadout-db"),
            ("LOG_CHANNEL_ID", "-100"),
            ("SESSION_STRING", "session"),
        ])
    }

    fn layout() -> (tempfile::TempDir, Layout) {
        let td = tempdir().expect("tempdir");
        let layout = Layout::new(td.path());
        (td, layout)
    }

    #[test]
    fn missing_required_var_is_invalid() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.unset("API_HASH");

        let err = validate_env(&mut env, &layout).unwrap_err();
        assert!(err.to_string().contains("API_HASH"));
    }

    #[test]
    fn needs_session_or_bot_token() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.unset("SESSION_STRING");

        let err = validate_env(&mut env, &layout).unwrap_err();
        assert!(err.to_string().contains("SESSION_STRING or BOT_TOKEN"));
    }

    #[test]
    fn bot_token_requires_owner_id() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.set("BOT_TOKEN", "token");

        let err = validate_env(&mut env, &layout).unwrap_err();
        assert!(err.to_string().contains("OWNER_ID"));
    }

    #[test]
    fn defaults_are_applied() {
        let (_td, layout) = layout();
        let mut env = base_env();

        validate_env(&mut env, &layout).expect("valid");
        assert_eq!(env.get("DOWN_PATH"), Some("downloads/"));
        assert_eq!(env.get("CMD_TRIGGER"), Some("."));
        assert_eq!(env.get("SUDO_TRIGGER"), Some("!"));

        let workers: u32 = env.get("WORKERS").expect("set").parse().expect("number");
        assert!((1..=16).contains(&workers));
    }

    #[test]
    fn down_path_gains_trailing_slash() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.set("DOWN_PATH", "files");

        validate_env(&mut env, &layout).expect("valid");
        assert_eq!(env.get("DOWN_PATH"), Some("files/"));
    }

    #[test]
    fn workers_is_clamped() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.set("WORKERS", "99");

        validate_env(&mut env, &layout).expect("valid");
        assert_eq!(env.get("WORKERS"), Some("16"));
    }

    #[test]
    fn equal_triggers_are_invalid() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.set("CMD_TRIGGER", "!");

        let err = validate_env(&mut env, &layout).unwrap_err();
        assert!(matches!(err, LoaderError::ConfigInvalid(_)));
    }

    #[test]
    fn slash_trigger_is_invalid() {
        let (_td, layout) = layout();
        let mut env = base_env();
        env.set("CMD_TRIGGER", "/");

        let err = validate_env(&mut env, &layout).unwrap_err();
        assert!(matches!(err, LoaderError::ConfigInvalid(_)));
    }

    #[test]
    fn directories_are_created() {
        let (td, layout) = layout();
        let mut env = base_env();

        validate_env(&mut env, &layout).expect("valid");
        assert!(td.path().join("downloads").is_dir());
        assert!(td.path().join("logs").is_dir());
        assert!(td.path().join(".rcache").is_dir());
    }

    #[test]
    fn client_mode_derivation() {
        let mut env = base_env();
        assert_eq!(client_mode(&env), Some(ClientType::User));

        env.set("BOT_TOKEN", "token");
        assert_eq!(client_mode(&env), Some(ClientType::Dual));

        env.unset("SESSION_STRING");
        assert_eq!(client_mode(&env), Some(ClientType::Bot));

        env.unset("BOT_TOKEN");
        assert_eq!(client_mode(&env), None);
    }

    #[test]
    fn database_path_strips_prefix() {
        let env = base_env();
        assert_eq!(
            database_path(&env),
            Some(std::path::PathBuf::from("/tmp/loadout-db"))
        );

        let env = Env::from_iter([("DATABASE_URL", "/plain/path")]);
        assert_eq!(database_path(&env), Some(std::path::PathBuf::from("/plain/path")));
    }

    #[test]
    fn env_set_reports_novelty() {
        let mut env = Env::default();
        assert!(env.set("FOO", "bar"));
        assert!(!env.set("FOO", "baz"));
        assert_eq!(env.get("FOO"), Some("baz"));
    }

    #[test]
    fn write_env_key_replaces_and_appends() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("config.env.tmp");

        write_env_key(&path, "FOO", "bar").expect("write");
        write_env_key(&path, "BAZ", "qux").expect("write");
        write_env_key(&path, "FOO", "updated").expect("write");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("FOO=updated"));
        assert!(text.contains("BAZ=qux"));
        assert_eq!(text.matches("FOO=").count(), 1);
    }

    #[test]
    fn remove_env_key_drops_line() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("config.env.tmp");

        write_env_key(&path, "FOO", "bar").expect("write");
        write_env_key(&path, "BAZ", "qux").expect("write");
        remove_env_key(&path, "FOO").expect("remove");

        let text = fs::read_to_string(&path).expect("read");
        assert!(!text.contains("FOO"));
        assert!(text.contains("BAZ=qux"));
    }
}
