//! Pending external-package installs.
//!
//! Specifiers accumulate here across pipeline stages (core
//! `requirements.txt`, surviving plugins, operator extras) and are handed
//! to the package installer in one batch. Installing takes the set, so a
//! failed install does not retry the same batch on the next pass.

use std::collections::BTreeSet;

use tracing::info;

use crate::error::{LoaderError, LoaderResult};

#[derive(Debug, Clone, Default)]
pub struct Requirements {
    specs: BTreeSet<String>,
}

impl Requirements {
    pub fn has(&self) -> bool {
        !self.specs.is_empty()
    }

    pub fn specs(&self) -> &BTreeSet<String> {
        &self.specs
    }

    /// Add specifiers, trimming and dropping empties.
    pub fn update<'a>(&mut self, specs: impl IntoIterator<Item = &'a str>) {
        self.specs.extend(
            specs
                .into_iter()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }

    /// Upgrade the installer, then install the pending set. The set is
    /// consumed either way.
    pub fn install(&mut self) -> LoaderResult<()> {
        if self.specs.is_empty() {
            return Ok(());
        }

        let specs = std::mem::take(&mut self.specs);
        info!(count = specs.len(), "installing requirements");

        let failed = |e: loadout_process::CommandResult| LoaderError::DependencyInstallFailed {
            code: e.exit_code,
            stderr: e.stderr,
        };

        let upgrade = loadout_process::pip_upgrade().map_err(|e| {
            LoaderError::DependencyInstallFailed {
                code: -1,
                stderr: e.to_string(),
            }
        })?;
        if !upgrade.success {
            return Err(failed(upgrade));
        }

        let install = loadout_process::pip_install(specs.iter().map(String::as_str))
            .map_err(|e| LoaderError::DependencyInstallFailed {
                code: -1,
                stderr: e.to_string(),
            })?;
        if !install.success {
            return Err(failed(install));
        }

        Ok(())
    }
}
