//! Process execution for loadout.
//!
//! This crate provides utilities for running external processes with
//! proper error handling and output capture. The loader shells out for
//! two things only: the `git` CLI and the external package installer.
//!
//! # Example
//!
//! ```ignore
//! use loadout_process::run;
//!
//! let result = run("git", &["--version"]).expect("run");
//! assert!(result.success);
//! assert!(result.stdout.contains("git"));
//! ```

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (or -1 when terminated by signal)
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandResult {
    /// Check that the command succeeded, with stderr in the error message.
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {}: {}",
                self.exit_code,
                self.stderr.trim()
            ))
        }
    }

    /// Create a result from a process output
    pub fn from_output(output: &Output) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Run a command and capture its output
pub fn run(program: &str, args: &[&str]) -> Result<CommandResult> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output))
}

/// Run a command in a specific directory
pub fn run_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| {
            format!(
                "failed to run command: {} {:?} in {}",
                program,
                args,
                dir.display()
            )
        })?;

    Ok(CommandResult::from_output(&output))
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which_path(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// The interpreter used to drive the package installer.
pub const PYTHON: &str = "python3";

/// Upgrade the package installer itself.
pub fn pip_upgrade() -> Result<CommandResult> {
    run(PYTHON, &["-m", "pip", "install", "--upgrade", "pip"])
}

/// Install a set of package version specifiers.
pub fn pip_install<'a>(specs: impl IntoIterator<Item = &'a str>) -> Result<CommandResult> {
    let mut args = vec!["-m", "pip", "install"];
    args.extend(specs);
    run(PYTHON, &args)
}
