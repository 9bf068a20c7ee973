//! Takes over the host's name resolution.
//!
//! `systemd-resolved`'s configuration is backed up and rewritten so that
//! every query on the machine lands on the agent's proxy at `127.0.0.1`,
//! with `Domains=~.` forcing even search-domain lookups through it. The
//! service is restarted and its cache flushed so the takeover is immediate.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::cmd::run_checked;

pub const RESOLVED_CONF: &str = "/etc/systemd/resolved.conf";

/// Used to figure out whether we crashed on our last run or not.
///
/// If we did crash, the file on disk is ours and the backup next to it is
/// the operator's original; overwriting the backup would lose it.
const MAGIC_HEADER: &str = "# Managed by gatehouse-agent";

const RESOLVED_DROP_IN: &str = "[Resolve]\nDNS=127.0.0.1\nDomains=~.\n";

#[derive(Clone)]
pub struct ResolvedConfig {
    conf: PathBuf,
    backup: PathBuf,
}

impl ResolvedConfig {
    pub fn new(conf: impl Into<PathBuf>) -> Self {
        let conf = conf.into();
        let backup = backup_path(&conf);

        Self { conf, backup }
    }

    /// Backs up the current configuration and points the host at the proxy.
    pub async fn install(&self) -> Result<()> {
        stop_resolved().await?;
        self.write_config()
            .context("Failed to rewrite resolved configuration")?;
        restart_resolved().await?;
        flush_resolved_cache().await;

        tracing::info!(path = %self.conf.display(), "Host resolver now points at the DNS proxy");

        Ok(())
    }

    /// Restores the backed-up configuration. Idempotent; a missing backup
    /// means there is nothing to undo.
    pub async fn revert(&self) -> Result<()> {
        if !self.restore_config()? {
            return Ok(());
        }

        restart_resolved().await?;
        flush_resolved_cache().await;

        tracing::info!(path = %self.conf.display(), "Reverted host resolver configuration");

        Ok(())
    }

    fn write_config(&self) -> Result<()> {
        let current = match fs::read_to_string(&self.conf) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context("Failed to read resolved configuration"),
        };

        if !current.starts_with(MAGIC_HEADER) {
            // `atomicwrites` handles the fsync and rename-into-place tricks so
            // a power loss cannot leave us with a truncated backup.
            let backup = atomicwrites::AtomicFile::new(
                &self.backup,
                atomicwrites::OverwriteBehavior::AllowOverwrite,
            );
            backup
                .write(|f| f.write_all(current.as_bytes()))
                .context("Failed to back up resolved configuration")?;
        } else {
            tracing::info!(
                "The last run crashed before reverting `{}`; keeping the existing backup",
                self.conf.display()
            );
        }

        fs::write(&self.conf, format!("{MAGIC_HEADER}\n{RESOLVED_DROP_IN}"))?;

        Ok(())
    }

    /// Returns whether a backup existed and was restored.
    fn restore_config(&self) -> Result<bool> {
        match fs::copy(&self.backup, &self.conf) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No resolved configuration backup found, nothing to revert");
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to restore resolved configuration backup"),
        }
    }
}

fn backup_path(conf: &Path) -> PathBuf {
    let mut path = conf.as_os_str().to_owned();
    path.push(".before-gatehouse");

    PathBuf::from(path)
}

async fn stop_resolved() -> Result<()> {
    run_checked("systemctl", &["stop", "systemd-resolved"]).await
}

async fn restart_resolved() -> Result<()> {
    run_checked("systemctl", &["restart", "systemd-resolved"]).await
}

async fn flush_resolved_cache() {
    // Stale positive answers merely delay the takeover; not worth failing over.
    if let Err(e) = run_checked("resolvectl", &["flush-caches"]).await {
        tracing::debug!("Failed to flush resolved cache: {e:#}");
    }
}
