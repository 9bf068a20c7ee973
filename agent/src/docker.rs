//! Points the container runtime at the agent's DNS proxy.
//!
//! Containers cannot reach `127.0.0.1` on the host, so `daemon.json` gets
//! the bridge address instead. `live-restore` keeps already-running
//! containers alive across the daemon restart, and `userns-remap` keeps
//! container processes from acting as the host's root when the operator
//! asked for containers to be restricted. Unrecognised keys are preserved.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use serde_json::{Value, json};

use crate::cmd::run_checked;

pub const DOCKER_DAEMON_CONFIG: &str = "/etc/docker/daemon.json";

/// The address containers reach the host's DNS proxy on.
pub const BRIDGE_DNS_SERVER: &str = "172.17.0.1";

#[derive(Clone)]
pub struct DockerDaemonConfig {
    config: PathBuf,
    backup: PathBuf,
    restrict_containers: bool,
}

impl DockerDaemonConfig {
    pub fn new(config: impl Into<PathBuf>, restrict_containers: bool) -> Self {
        let config = config.into();
        let backup = backup_path(&config);

        Self {
            config,
            backup,
            restrict_containers,
        }
    }

    pub async fn install(&self) -> Result<()> {
        self.write_config()
            .context("Failed to rewrite docker daemon configuration")?;
        restart_docker().await?;

        tracing::info!(path = %self.config.display(), "Containers now resolve through the DNS proxy");

        Ok(())
    }

    /// Restores the previous `daemon.json`, or removes it if none existed.
    pub async fn revert(&self) -> Result<()> {
        if !self.restore_config()? {
            return Ok(());
        }

        restart_docker().await?;

        tracing::info!(path = %self.config.display(), "Reverted docker daemon configuration");

        Ok(())
    }

    fn write_config(&self) -> Result<()> {
        let current = match fs::read_to_string(&self.config) {
            Ok(text) => {
                let backup = atomicwrites::AtomicFile::new(
                    &self.backup,
                    atomicwrites::OverwriteBehavior::AllowOverwrite,
                );
                backup
                    .write(|f| f.write_all(text.as_bytes()))
                    .context("Failed to back up docker daemon configuration")?;

                text
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // No original to restore; a stale backup from an earlier run
                // would make revert resurrect the wrong file.
                let _ = fs::remove_file(&self.backup);

                "{}".to_owned()
            }
            Err(e) => return Err(e).context("Failed to read docker daemon configuration"),
        };

        let updated = updated_config(&current, self.restrict_containers)?;

        if let Some(parent) = self.config.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config, updated)?;

        Ok(())
    }

    /// Returns whether anything changed on disk.
    fn restore_config(&self) -> Result<bool> {
        match fs::copy(&self.backup, &self.config) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // The file didn't exist before us; remove what we wrote.
                match fs::remove_file(&self.config) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e).context("Failed to remove docker daemon configuration"),
                }
            }
            Err(e) => Err(e).context("Failed to restore docker daemon configuration backup"),
        }
    }
}

/// Rewrites `daemon.json` content, preserving unrecognised keys.
fn updated_config(current: &str, restrict_containers: bool) -> Result<String> {
    let mut config = serde_json::from_str::<Value>(current)
        .context("Docker daemon configuration is not valid JSON")?;

    let Some(map) = config.as_object_mut() else {
        bail!("Docker daemon configuration is not a JSON object");
    };

    map.insert("dns".to_owned(), json!([BRIDGE_DNS_SERVER]));
    map.insert("live-restore".to_owned(), json!(true));
    if restrict_containers {
        map.insert("userns-remap".to_owned(), json!("runner:runner"));
    }

    serde_json::to_string_pretty(&config).context("Failed to serialise docker daemon configuration")
}

fn backup_path(config: &Path) -> PathBuf {
    let mut path = config.as_os_str().to_owned();
    path.push(".before-gatehouse");

    PathBuf::from(path)
}

async fn restart_docker() -> Result<()> {
    run_checked("systemctl", &["daemon-reload"]).await?;
    run_checked("systemctl", &["restart", "docker"]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(restrict_containers: bool) -> (tempfile::TempDir, DockerDaemonConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = DockerDaemonConfig::new(dir.path().join("daemon.json"), restrict_containers);
        (dir, config)
    }

    #[test]
    fn preserves_unknown_keys() {
        let updated = updated_config(
            r#"{"log-driver": "journald", "dns": ["8.8.8.8"]}"#,
            false,
        )
        .unwrap();

        let value = serde_json::from_str::<Value>(&updated).unwrap();
        assert_eq!(value["log-driver"], "journald");
        assert_eq!(value["dns"], json!([BRIDGE_DNS_SERVER]));
        assert_eq!(value["live-restore"], json!(true));
        assert!(value.get("userns-remap").is_none());
    }

    #[test]
    fn remaps_user_namespace_when_restricting_containers() {
        let updated = updated_config("{}", true).unwrap();

        let value = serde_json::from_str::<Value>(&updated).unwrap();
        assert_eq!(value["userns-remap"], "runner:runner");
    }

    #[test]
    fn absent_file_is_created_and_removed_on_revert() {
        let (_dir, config) = temp_config(false);

        config.write_config().unwrap();
        assert!(config.config.exists());

        assert!(config.restore_config().unwrap());
        assert!(!config.config.exists());
    }

    #[test]
    fn existing_file_is_backed_up_and_restored() {
        let (_dir, config) = temp_config(false);
        let original = r#"{"log-driver": "journald"}"#;
        fs::write(&config.config, original).unwrap();

        config.write_config().unwrap();
        assert!(config.restore_config().unwrap());

        assert_eq!(fs::read_to_string(&config.config).unwrap(), original);
    }

    #[test]
    fn stale_backup_is_dropped_when_file_is_absent() {
        let (_dir, config) = temp_config(false);
        fs::write(&config.backup, r#"{"stale": true}"#).unwrap();

        config.write_config().unwrap();

        assert!(!config.backup.exists());
    }

    #[test]
    fn rejects_malformed_configuration() {
        assert!(updated_config("{not json", false).is_err());
        assert!(updated_config("[1, 2]", false).is_err());
    }
}
