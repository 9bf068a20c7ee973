//! Minimal view of the container runtime, used only to map a pid (or a
//! cgroup container id) to the image that spawned it.

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Full (untruncated) container id.
    pub id: String,
    pub image: String,
    /// Pid of the container's init process on the host.
    pub pid: u32,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list(&self) -> Result<Vec<ContainerInfo>>;
}

/// Talks to dockerd through the `docker` CLI.
pub struct DockerCli;

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let ids = run_docker(&["ps", "-q", "--no-trunc"]).await?;
        let ids = ids.split_whitespace().collect::<Vec<_>>();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec![
            "inspect",
            "--format",
            "{{.Id}} {{.State.Pid}} {{.Config.Image}}",
        ];
        args.extend(&ids);

        let output = run_docker(&args).await?;

        Ok(output.lines().filter_map(parse_inspect_line).collect())
    }
}

fn parse_inspect_line(line: &str) -> Option<ContainerInfo> {
    let mut parts = line.split_whitespace();
    let id = parts.next()?.to_owned();
    let pid = parts.next()?.parse().ok()?;
    // Image references may not contain spaces, but don't bet on future fields.
    let image = parts.next()?.to_owned();

    Some(ContainerInfo { id, image, pid })
}

async fn run_docker(args: &[&str]) -> Result<String> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .context("`docker` didn't run")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`docker {}` failed: {}", args.join(" "), stderr.trim());
    }

    String::from_utf8(output.stdout).context("`docker` output was not UTF-8")
}
