//! Operator configuration, handed to the agent as a JSON file at startup.

use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressPolicy {
    /// Record every outbound connection; block nothing.
    Audit,
    /// Permit only allow-listed destinations; reject everything else.
    Block,
}

impl Default for EgressPolicy {
    fn default() -> Self {
        Self::Audit
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub one_time_key: String,
    /// Space-delimited `domain[:port]` tokens.
    #[serde(default)]
    pub allowed_endpoints: String,
    #[serde(default)]
    pub egress_policy: EgressPolicy,
    #[serde(default)]
    pub disable_telemetry: bool,
    #[serde(default)]
    pub disable_sudo: bool,
    #[serde(default)]
    pub disable_sudo_and_containers: bool,
    #[serde(default)]
    pub disable_file_monitoring: bool,
    #[serde(default)]
    pub private: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file `{}`", path.display()))?;

        let config = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file `{}`", path.display()))?;

        Ok(config)
    }

    /// Sudo is removed for the job user under either flag.
    pub fn sudo_disabled(&self) -> bool {
        self.disable_sudo || self.disable_sudo_and_containers
    }
}
