//! Task registry: job code to handler dispatch for the RPC loop.
//!
//! Handlers take the loader plus the positional JSON arguments of the
//! request frame and return a value or a [`TaskError`]. Errors never
//! propagate out of [`Tasks::handle`]; they become error objects in the
//! reply frame and re-raise on the child side.
//!
//! Every handler that mutates the store or the sentinels completes before
//! the reply is sent, so the child observes its own writes.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use loadout_rpc::{Reply, ReplyError, Request, job};
use loadout_store::StoreError;
use loadout_types::{ConstraintKind, Update};

use crate::Loader;
use crate::checks;
use crate::pipeline;

/// Failure of a single dispatched job.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("no handler for job {0}")]
    UnknownJob(u32),
    #[error("bad arguments: {0}")]
    BadArgs(String),
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    fn kind(&self) -> &'static str {
        match self {
            TaskError::UnknownJob(_) => "unknown_job",
            TaskError::BadArgs(_) => "bad_args",
            TaskError::Failed(_) => "handler_error",
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Failed(e.to_string())
    }
}

type Handler = fn(&mut Loader, &[Value]) -> Result<Value, TaskError>;

/// Decode the argument at `index`.
fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, TaskError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| TaskError::BadArgs(format!("missing argument {index}")))?;

    serde_json::from_value(value)
        .map_err(|e| TaskError::BadArgs(format!("argument {index}: {e}")))
}

/// The registration map of job codes to handlers.
pub struct Tasks {
    handlers: HashMap<u32, Handler>,
}

impl Tasks {
    /// Registry with every control-plane job wired up.
    pub fn with_defaults() -> Self {
        let mut tasks = Self {
            handlers: HashMap::new(),
        };

        tasks.register(job::SOFT_RESTART, soft_restart);
        tasks.register(job::HARD_RESTART, hard_restart);
        tasks.register(job::FETCH_CORE, fetch_core);
        tasks.register(job::FETCH_REPOS, fetch_repos);
        tasks.register(job::GET_CORE, get_core);
        tasks.register(job::GET_REPOS, get_repos);
        tasks.register(job::ADD_REPO, add_repo);
        tasks.register(job::REMOVE_REPO, remove_repo);
        tasks.register(job::GET_CORE_NEW_COMMITS, get_core_new_commits);
        tasks.register(job::GET_CORE_OLD_COMMITS, get_core_old_commits);
        tasks.register(job::GET_REPO_NEW_COMMITS, get_repo_new_commits);
        tasks.register(job::GET_REPO_OLD_COMMITS, get_repo_old_commits);
        tasks.register(job::SET_CORE_BRANCH, set_core_branch);
        tasks.register(job::SET_CORE_VERSION, set_core_version);
        tasks.register(job::SET_REPO_BRANCH, set_repo_branch);
        tasks.register(job::SET_REPO_VERSION, set_repo_version);
        tasks.register(job::SET_REPO_PRIORITY, set_repo_priority);
        tasks.register(job::ADD_CONSTRAINTS, add_constraints);
        tasks.register(job::REMOVE_CONSTRAINTS, remove_constraints);
        tasks.register(job::GET_CONSTRAINTS, get_constraints);
        tasks.register(job::CLEAR_CONSTRAINTS, clear_constraints);
        tasks.register(job::INVALIDATE_REPOS_CACHE, invalidate_repos_cache);
        tasks.register(job::SET_ENV, set_env);
        tasks.register(job::UNSET_ENV, unset_env);

        tasks
    }

    pub fn register(&mut self, code: u32, handler: Handler) {
        self.handlers.insert(code, handler);
    }

    /// Dispatch one request; always yields a reply frame.
    pub fn handle(&self, loader: &mut Loader, request: &Request) -> Reply {
        let result = match self.handlers.get(&request.job) {
            None => Err(TaskError::UnknownJob(request.job)),
            Some(handler) => handler(loader, &request.args),
        };

        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Err(ReplyError {
                kind: e.kind().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn soft_restart(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    loader.session.request_restart(false);
    Ok(Value::Null)
}

fn hard_restart(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    loader.session.request_restart(true);
    Ok(Value::Null)
}

fn fetch_core(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    pipeline::fetch_core(loader).map_err(|e| TaskError::Failed(e.to_string()))?;
    Ok(Value::Null)
}

fn fetch_repos(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    pipeline::fetch_repos(loader).map_err(|e| TaskError::Failed(e.to_string()))?;
    Ok(Value::Null)
}

fn get_core(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    Ok(json!(loader.repos.core().info().sanitized()))
}

fn get_repos(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    let infos: Vec<_> = loader
        .repos
        .iter()
        .map(|repo| repo.info().sanitized())
        .collect();
    Ok(json!(infos))
}

fn add_repo(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let priority: i32 = arg(args, 0)?;
    let branch: String = arg(args, 1)?;
    let url: String = arg(args, 2)?;

    if loader
        .repos
        .add(&loader.store, &loader.layout, priority, &branch, &url)?
    {
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn remove_repo(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;

    if loader.repos.remove(&loader.store, repo_id)? {
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn get_core_new_commits(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    Ok(json!(loader.repos.core().handle().new_commits()))
}

fn get_core_old_commits(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let limit: u64 = arg(args, 0)?;
    Ok(json!(loader.repos.core().handle().old_commits(limit)))
}

fn get_repo_new_commits(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;

    let updates: Option<Vec<Update>> = loader
        .repos
        .get_mut(repo_id)
        .map(|repo| repo.handle().new_commits());
    Ok(json!(updates))
}

fn get_repo_old_commits(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;
    let limit: u64 = arg(args, 1)?;

    let updates: Option<Vec<Update>> = loader
        .repos
        .get_mut(repo_id)
        .map(|repo| repo.handle().old_commits(limit));
    Ok(json!(updates))
}

fn set_core_branch(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let branch: String = arg(args, 0)?;

    let core = loader.repos.core_mut();
    if core.info().branch != branch && core.handle().branch_exists(&branch) {
        core.handle_mut().info.branch = branch;
        core.handle_mut().info.version.clear();
        core.persist(&loader.store)?;
        loader.sig.core_remove();
    }
    Ok(Value::Null)
}

fn set_core_version(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let version: String = arg(args, 0)?;

    let core = loader.repos.core_mut();
    if core.info().version != version && core.handle().version_exists(&version) {
        core.handle_mut().info.version = version;
        core.persist(&loader.store)?;
        loader.sig.core_remove();
    }
    Ok(Value::Null)
}

fn set_repo_branch(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;
    let branch: String = arg(args, 1)?;

    if let Some(repo) = loader.repos.get_mut(repo_id)
        && repo.info().branch != branch
        && repo.handle().branch_exists(&branch)
    {
        repo.info_mut().branch = branch;
        repo.info_mut().version.clear();
        repo.persist(&loader.store)?;
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn set_repo_version(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;
    let version: String = arg(args, 1)?;

    if let Some(repo) = loader.repos.get_mut(repo_id)
        && repo.info().version != version
        && repo.handle().version_exists(&version)
    {
        repo.info_mut().version = version;
        repo.persist(&loader.store)?;
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn set_repo_priority(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let repo_id: i32 = arg(args, 0)?;
    let priority: i32 = arg(args, 1)?;

    let mut changed = false;
    if let Some(repo) = loader.repos.get_mut(repo_id)
        && repo.info().priority != priority
    {
        repo.info_mut().priority = priority;
        repo.persist(&loader.store)?;
        changed = true;
    }

    if changed {
        loader.repos.sort();
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn add_constraints(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let kind: ConstraintKind = arg(args, 0)?;
    let data: Vec<String> = arg(args, 1)?;

    let added = loader
        .constraints
        .add(kind, data.iter().map(String::as_str));
    if !added.is_empty() {
        loader
            .store
            .insert_constraints(kind, added.iter().map(String::as_str))?;
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn remove_constraints(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let kind: Option<ConstraintKind> = arg(args, 0)?;
    let data: Vec<String> = arg(args, 1)?;

    let removed = loader
        .constraints
        .remove(kind, data.iter().map(String::as_str));
    if !removed.is_empty() {
        loader
            .store
            .delete_constraints(kind, removed.iter().map(String::as_str))?;
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn get_constraints(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    Ok(json!(loader.constraints.list()))
}

fn clear_constraints(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let kind: Option<ConstraintKind> = arg(args, 0)?;

    if loader.constraints.clear(kind) {
        loader.store.clear_constraints(kind)?;
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn invalidate_repos_cache(loader: &mut Loader, _args: &[Value]) -> Result<Value, TaskError> {
    loader.sig.repos_remove();
    Ok(Value::Null)
}

fn set_env(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let key: String = arg(args, 0)?;
    let value: String = arg(args, 1)?;

    checks::write_env_key(&loader.layout.conf_tmp_path(), &key, &value)?;
    if loader.env.set(&key, &value) {
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}

fn unset_env(loader: &mut Loader, args: &[Value]) -> Result<Value, TaskError> {
    let key: String = arg(args, 0)?;

    checks::remove_env_key(&loader.layout.conf_tmp_path(), &key)?;
    if loader.env.unset(&key) {
        loader.sig.repos_remove();
    }
    Ok(Value::Null)
}
