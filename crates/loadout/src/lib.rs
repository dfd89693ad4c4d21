//! # Loadout
//!
//! A plugin loader and supervisor for an external application ("the
//! child"). Loadout maintains a set of git-backed source repositories
//! (one core plus any number of plugin repos), materializes a curated tree
//! of plugin directories into the child's workspace, installs the
//! external packages those plugins declare, then launches the child and
//! serves control-plane requests from it over a duplex pipe.
//!
//! ## Pipeline
//!
//! The materialization flow is **load → core → repos → install**:
//!
//! 1. [`Loader::new`] validates the environment, opens the store, and
//!    loads the repo set, removed-plugin set, and constraint rules.
//! 2. [`pipeline::init_core`] fetches the core, checks out its pinned
//!    version, and repopulates the child source tree.
//! 3. [`pipeline::init_repos`] fetches every plugin repo, applies the
//!    per-plugin eligibility predicates and constraint rules, shadows
//!    core builtins, closes over dependencies, eliminates requirement
//!    conflicts, and copies the survivors into the child tree.
//! 4. [`pipeline::install_requirements`] hands the accumulated package
//!    specifiers to the installer.
//!
//! Two cache sentinels (`.sig_core`, `.sig_repos`) make every stage
//! skippable: running the pipeline twice with no store mutations in
//! between performs zero work the second time.
//!
//! ## Supervision
//!
//! [`supervisor::serve`] spawns the child, serves RPC jobs from it in
//! strict request/reply order, and honors soft (child only) and hard
//! (pipeline + child) restarts requested over the pipe.
//!
//! ## Modules
//!
//! - [`layout`] — on-disk layout of the working directory
//! - [`checks`] — environment validation and the owned env map
//! - [`manifest`] — plugin `config.ini` parsing
//! - [`constraint`] — include/exclude/in selection rules
//! - [`resolver`] — requirement conflict detection
//! - [`sig`] — cache-validity sentinels
//! - [`repos`] — repo handles and the priority-sorted repo set
//! - [`requirements`] — pending package installs
//! - [`pipeline`] — the materialization stages
//! - [`tasks`] — job-code → handler registry for RPC dispatch
//! - [`supervisor`] — child spawn, serve loop, restart session

pub mod checks;
pub mod constraint;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod repos;
pub mod requirements;
pub mod resolver;
pub mod sig;
pub mod supervisor;
pub mod tasks;

use tracing::info;

use loadout_store::Store;
use loadout_types::ClientType;

use crate::checks::Env;
use crate::constraint::Constraints;
use crate::error::{LoaderError, LoaderResult};
use crate::layout::Layout;
use crate::repos::{DEFAULT_CORE_URL, RemovedPlugins, Repos};
use crate::requirements::Requirements;
use crate::sig::Sig;
use crate::supervisor::Session;
use crate::tasks::Tasks;

/// How a completed run wants the entry point to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// Re-execute the host binary (after an in-place upgrade).
    Reexec,
}

/// All loader state, created once at `main` and threaded everywhere by
/// reference. No ambient globals.
pub struct Loader {
    pub layout: Layout,
    pub env: Env,
    pub store: Store,
    pub sig: Sig,
    pub repos: Repos,
    pub removed: RemovedPlugins,
    pub constraints: Constraints,
    pub requirements: Requirements,
    pub session: Session,
    pub client_mode: Option<ClientType>,
}

impl Loader {
    /// Validate the environment, open the store, and load every snapshot.
    ///
    /// Store unavailability here is fatal; the store is the source of
    /// truth and the in-memory state is write-through.
    pub fn new(layout: Layout, mut env: Env) -> LoaderResult<Self> {
        checks::ensure_git()?;
        checks::validate_env(&mut env, &layout)?;

        let db_path = checks::database_path(&env)
            .ok_or_else(|| LoaderError::ConfigInvalid("unusable DATABASE_URL".into()))?;
        let store =
            Store::open(&db_path).map_err(|e| LoaderError::StoreUnavailable(e.to_string()))?;

        let core_url = env
            .get("CORE_REPO_URL")
            .unwrap_or(DEFAULT_CORE_URL)
            .to_string();

        info!("loading repos");
        let repos = Repos::load(&store, &layout, &core_url)?;
        let removed = RemovedPlugins::load(&store)?;
        let constraints = Constraints::from_docs(&store.list_constraints()?);
        let client_mode = checks::client_mode(&env);

        let sig = Sig::new(&layout);

        Ok(Self {
            layout,
            env,
            store,
            sig,
            repos,
            removed,
            constraints,
            requirements: Requirements::default(),
            session: Session::new(),
            client_mode,
        })
    }

    /// Run pipeline + supervisor until the child stays down.
    ///
    /// Soft restarts skip the pipeline; hard restarts re-run it. A
    /// requested re-exec surfaces as [`Outcome::Reexec`] for the entry
    /// point to honor.
    pub fn run(&mut self, tasks: &Tasks, child_cmd: &[String]) -> LoaderResult<Outcome> {
        if child_cmd.is_empty() {
            return Err(LoaderError::ConfigInvalid("empty child command".into()));
        }

        loop {
            if self.session.should_init() {
                pipeline::run(self)?;
            }

            supervisor::serve(self, tasks, child_cmd)?;

            if self.session.reexec_requested() {
                return Ok(Outcome::Reexec);
            }
            if !self.session.should_restart() {
                return Ok(Outcome::Finished);
            }
        }
    }
}
