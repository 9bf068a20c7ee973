//! Removes the job user's sudo grant for the duration of the job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

pub const RUNNER_SUDOERS_FILE: &str = "/etc/sudoers.d/runner";

#[derive(Clone)]
pub struct SudoersFile {
    path: PathBuf,
    backup: PathBuf,
}

impl SudoersFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.as_os_str().to_owned();
        backup.push(".before-gatehouse");

        Self {
            path,
            backup: PathBuf::from(backup),
        }
    }

    /// Backs up and removes the sudoers drop-in.
    pub fn disable(&self) -> Result<()> {
        fs::copy(&self.path, &self.backup)
            .with_context(|| format!("Failed to back up `{}`", self.path.display()))?;
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove `{}`", self.path.display()))?;

        tracing::info!(path = %self.path.display(), "Disabled sudo for the job user");

        Ok(())
    }

    /// Puts the sudoers drop-in back. Idempotent; without a backup there is
    /// nothing to restore.
    pub fn revert(&self) -> Result<()> {
        match fs::copy(&self.backup, &self.path) {
            Ok(_) => {
                tracing::info!(path = %self.path.display(), "Restored sudo for the job user");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to restore `{}`", self.path.display()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
