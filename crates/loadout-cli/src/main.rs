use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use loadout::checks::Env;
use loadout::error::LoaderError;
use loadout::layout::Layout;
use loadout::tasks::Tasks;
use loadout::{Loader, Outcome};

#[derive(Parser, Debug)]
#[command(name = "loadout", version)]
#[command(about = "Git-backed plugin loader and supervisor for a child application")]
struct Cli {
    /// Working directory root; cache, child tree, and dotenv files live here.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Log filter (tracing env-filter syntax, e.g. "info" or "loadout=debug").
    #[arg(long, default_value = "info")]
    log: String,

    /// Child command to supervise. Falls back to the CHILD_CMD variable.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    child: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .context("invalid --log filter")?,
        )
        .init();

    let workdir = std::fs::canonicalize(&cli.workdir)
        .with_context(|| format!("unusable workdir: {}", cli.workdir.display()))?;
    let layout = Layout::new(workdir);

    // config.env first, config.env.tmp overrides
    let _ = dotenvy::from_path(layout.conf_path());
    let _ = dotenvy::from_path_override(layout.conf_tmp_path());

    let env = Env::capture();
    let child_cmd = resolve_child_cmd(&cli, &env);

    let tasks = Tasks::with_defaults();
    let mut loader = match Loader::new(layout, env) {
        Ok(loader) => loader,
        Err(e) => fail(e),
    };

    match loader.run(&tasks, &child_cmd) {
        Ok(Outcome::Finished) => Ok(()),
        Ok(Outcome::Reexec) | Err(LoaderError::Interrupted) => reexec(),
        Err(e) => fail(e),
    }
}

fn resolve_child_cmd(cli: &Cli, env: &Env) -> Vec<String> {
    if !cli.child.is_empty() {
        return cli.child.clone();
    }

    env.get("CHILD_CMD")
        .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn fail(e: LoaderError) -> ! {
    error!("{e}");
    std::process::exit(1);
}

/// Replace this process with a fresh copy of the host binary, keeping the
/// original arguments. Used after an in-place upgrade of the loader.
fn reexec() -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let err = Command::new(exe).args(std::env::args_os().skip(1)).exec();

    // exec only returns on failure
    Err(err).context("re-exec failed")
}
