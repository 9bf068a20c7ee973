//! The gatehouse agent binary.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use gatehouse_agent::{AgentPaths, run};

/// Command-line args for the agent. Everything has a production default;
/// the overrides exist for development machines.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the JSON configuration the workflow wrote for this job.
    #[arg(long, env = "GATEHOUSE_CONFIG", default_value = "agent.json")]
    config: PathBuf,

    /// Directory for the agent's log, status, and annotation files.
    #[arg(long, env = "GATEHOUSE_STATE_DIR", default_value = "/home/agent")]
    state_dir: PathBuf,

    #[arg(long, hide = true, default_value = gatehouse_agent::resolved::RESOLVED_CONF)]
    resolved_conf: PathBuf,

    #[arg(long, hide = true, default_value = gatehouse_agent::docker::DOCKER_DAEMON_CONFIG)]
    docker_daemon_config: PathBuf,

    #[arg(long, hide = true, default_value = gatehouse_agent::sudo::RUNNER_SUDOERS_FILE)]
    sudoers_file: PathBuf,

    /// Listener for host processes.
    #[arg(long, hide = true, default_value = "127.0.0.1:53")]
    host_dns_listen: SocketAddr,

    /// Listener on the container bridge.
    #[arg(long, hide = true, default_value = "172.17.0.1:53")]
    bridge_dns_listen: SocketAddr,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print chain of errors manually to avoid it looking like a crash
            // with a stacktrace.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let (layer, _logging_handle) = gatehouse_logging::file::layer(&cli.state_dir)?;
    gatehouse_logging::setup_global_subscriber(
        &std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        layer,
    )
    .context("Failed to set up logging")?;

    tracing::info!(
        arch = std::env::consts::ARCH,
        version = env!("CARGO_PKG_VERSION")
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("gatehouse")
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = rt.block_on(run(AgentPaths {
        config: cli.config,
        state_dir: cli.state_dir,
        resolved_conf: cli.resolved_conf,
        docker_daemon_config: cli.docker_daemon_config,
        sudoers_file: cli.sudoers_file,
        host_dns_listen: cli.host_dns_listen,
        bridge_dns_listen: cli.bridge_dns_listen,
    }));

    rt.shutdown_timeout(Duration::from_secs(1));

    result
}
