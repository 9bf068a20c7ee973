//! Helper for the host commands the agent drives (`systemctl`,
//! `resolvectl`, `auditctl`).

use anyhow::{Context as _, Result, bail};
use tokio::process::Command;

pub(crate) async fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("`{program}` didn't run"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{program} {}` failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}
