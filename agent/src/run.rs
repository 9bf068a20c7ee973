//! Brings the agent up in dependency order and tears every host change back
//! down on failure.
//!
//! Bring-up: config → policy/cache → DNS listeners → audit monitor →
//! (block) pre-resolve → resolver takeover → docker takeover → sudo →
//! firewall + sniffer → (block) refresher → "Initialized". The first error
//! from any long-running task, delivered on a shared error bus, cancels
//! everything and reverts.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, NoopSink, TelemetrySink};
use crate::audit::AuditMonitor;
use crate::cache::DnsCache;
use crate::config::{Config, EgressPolicy};
use crate::container::DockerCli;
use crate::correlator::EventCorrelator;
use crate::docker::DockerDaemonConfig;
use crate::error::FatalError;
use crate::firewall::{Firewall, IptablesBackend, NFLOG_GROUP};
use crate::nflog::NfLogReader;
use crate::policy::{Endpoint, EndpointPolicy};
use crate::proxy::{DnsProxy, ReverseIpTable, bind_udp, serve_udp};
use crate::refresher::DnsRefresher;
use crate::resolved::ResolvedConfig;
use crate::resolver::{DohResolver, Resolve};
use crate::signals::{Shutdown, ShutdownListener};
use crate::sniffer::PacketSniffer;
use crate::status::{AnnotationWriter, StatusFiles};
use crate::sudo::SudoersFile;

/// Provider control-plane names the job cannot function without.
const CONTROL_PLANE_ENDPOINTS: [&str; 5] = [
    "pipelines.actions.githubusercontent.com",
    "codeload.github.com",
    "token.actions.githubusercontent.com",
    "vstoken.actions.githubusercontent.com",
    "vstsmms.actions.githubusercontent.com",
];

#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub config: PathBuf,
    pub state_dir: PathBuf,
    pub resolved_conf: PathBuf,
    pub docker_daemon_config: PathBuf,
    pub sudoers_file: PathBuf,
    pub host_dns_listen: SocketAddr,
    pub bridge_dns_listen: SocketAddr,
}

/// Host state the agent has changed so far; revert undoes exactly that, in
/// reverse order, each step best-effort.
struct HostChanges {
    firewall: Arc<Firewall>,
    firewall_installed: bool,
    resolved: ResolvedConfig,
    resolved_installed: bool,
    docker: DockerDaemonConfig,
    docker_installed: bool,
    sudoers: SudoersFile,
    sudo_disabled: bool,
}

impl HostChanges {
    async fn revert(&self) {
        if self.firewall_installed
            && let Err(e) = self.firewall.revert().await
        {
            tracing::warn!("Failed to revert firewall rules: {e:#}");
        }

        if self.resolved_installed
            && let Err(e) = self.resolved.revert().await
        {
            tracing::warn!("Failed to revert resolver configuration: {e:#}");
        }

        if self.docker_installed
            && let Err(e) = self.docker.revert().await
        {
            tracing::warn!("Failed to revert docker configuration: {e:#}");
        }

        if self.sudo_disabled
            && let Err(e) = self.sudoers.revert()
        {
            tracing::warn!("Failed to restore sudoers file: {e:#}");
        }

        tracing::info!("Reverted host changes");
    }
}

pub async fn run(paths: AgentPaths) -> Result<()> {
    let status = StatusFiles::new(&paths.state_dir);

    let config = match Config::load(&paths.config) {
        Ok(config) => config,
        Err(e) => {
            status.write_status(&format!("Error reading config file: {e:#}"));
            return Err(FatalError::Config(e).into());
        }
    };

    // Fixed prefix; log scrapers join the agent log to a build through it.
    tracing::info!("job correlation id: {}", config.correlation_id);

    let mut policy = EndpointPolicy::parse(&config.allowed_endpoints);
    policy.merge_implicit(implicit_endpoints(&config));

    if config.egress_policy == EgressPolicy::Block {
        tracing::info!(allowed = %policy.format(), "Enforcing egress policy");
    }

    let telemetry: Arc<dyn TelemetrySink> = if config.disable_telemetry {
        Arc::new(NoopSink)
    } else {
        Arc::new(ApiClient::new(
            &config.api_url,
            &config.repo,
            &config.correlation_id,
            &config.one_time_key,
        )?)
    };

    let cache = Arc::new(DnsCache::new(config.egress_policy));
    let reverse_ip = Arc::new(ReverseIpTable::default());
    let resolver: Arc<dyn Resolve> = Arc::new(DohResolver::new()?);
    let annotations = Arc::new(AnnotationWriter::new(&paths.state_dir, config.private));
    let firewall = Arc::new(Firewall::new(Arc::new(IptablesBackend)));

    let proxy = Arc::new(DnsProxy::new(
        config.egress_policy,
        policy.clone(),
        cache.clone(),
        resolver.clone(),
        firewall.clone(),
        reverse_ip.clone(),
        telemetry.clone(),
        annotations.clone(),
    ));

    let mut changes = HostChanges {
        firewall: firewall.clone(),
        firewall_installed: false,
        resolved: ResolvedConfig::new(&paths.resolved_conf),
        resolved_installed: false,
        docker: DockerDaemonConfig::new(
            &paths.docker_daemon_config,
            config.disable_sudo_and_containers,
        ),
        docker_installed: false,
        sudoers: SudoersFile::new(&paths.sudoers_file),
        sudo_disabled: false,
    };

    let (errc_tx, errc_rx) = mpsc::channel::<anyhow::Error>(1);
    let mut shutdown = ShutdownListener::new(errc_rx)?;
    let cancel = CancellationToken::new();

    // DNS listeners, one per address, sharing the proxy.
    for addr in [paths.host_dns_listen, paths.bridge_dns_listen] {
        let socket = match bind_udp(addr) {
            Ok(socket) => socket,
            Err(e) => {
                status.write_status(&format!("Error starting DNS proxy: {e:#}"));
                return Err(FatalError::Bind(e).into());
            }
        };

        tracing::info!(%addr, "DNS proxy listening");
        spawn_critical("DNS listener failed", &errc_tx, serve_udp(proxy.clone(), socket));
    }

    // Process/syscall monitor.
    let correlator = Arc::new(EventCorrelator::new(
        reverse_ip.clone(),
        Arc::new(DockerCli),
        telemetry.clone(),
        annotations.clone(),
        status.clone(),
    ));
    let monitor = AuditMonitor::new(correlator, !config.disable_file_monitoring);
    {
        let cancel = cancel.child_token();
        spawn_critical("process monitor failed", &errc_tx, async move {
            monitor.run(cancel).await
        });
    }

    // Block mode stages its initial allow rules from pre-resolved answers.
    let staged_allow_list = if config.egress_policy == EgressPolicy::Block {
        match proxy.preresolve_allowed().await {
            Ok(staged) => staged,
            Err(e) => {
                return fail(
                    &status,
                    &changes,
                    &cancel,
                    FatalError::Resolve(e),
                )
                .await;
            }
        }
    } else {
        Vec::new()
    };

    if let Err(e) = changes.resolved.install().await {
        return fail(&status, &changes, &cancel, FatalError::HostMutation(e)).await;
    }
    changes.resolved_installed = true;

    if let Err(e) = changes.docker.install().await {
        return fail(&status, &changes, &cancel, FatalError::HostMutation(e)).await;
    }
    changes.docker_installed = true;

    if config.sudo_disabled() {
        if let Err(e) = changes.sudoers.disable() {
            return fail(&status, &changes, &cancel, FatalError::HostMutation(e)).await;
        }
        changes.sudo_disabled = true;
    }

    let firewall_setup = match config.egress_policy {
        EgressPolicy::Audit => firewall.setup_audit().await,
        EgressPolicy::Block => firewall.setup_block(&staged_allow_list).await,
    };
    changes.firewall_installed = true;
    if let Err(e) = firewall_setup {
        return fail(&status, &changes, &cancel, FatalError::HostMutation(e)).await;
    }

    let reader = match NfLogReader::bind(NFLOG_GROUP) {
        Ok(reader) => reader,
        Err(e) => {
            return fail(&status, &changes, &cancel, FatalError::HostMutation(e)).await;
        }
    };
    let sniffer = PacketSniffer::new(config.egress_policy, telemetry.clone(), annotations.clone());
    {
        let cancel = cancel.child_token();
        spawn_critical("packet sniffer failed", &errc_tx, async move {
            sniffer.run(reader, cancel).await
        });
    }

    if config.egress_policy == EgressPolicy::Block {
        let refresher = DnsRefresher::new(policy, cache, resolver, firewall);
        let cancel = cancel.child_token();
        tokio::spawn(async move { refresher.run(cancel).await });
    }

    status.write_status("Initialized");
    tracing::info!("Initialized");

    let result = match shutdown.recv().await {
        Shutdown::Requested => {
            tracing::info!("Caught SIGINT / SIGTERM");
            Ok(())
        }
        Shutdown::Fault(error) => {
            tracing::error!("Error in initialization or steady state: {error:#}");
            Err(error)
        }
    };

    cancel.cancel();
    changes.revert().await;

    result
}

async fn fail(
    status: &StatusFiles,
    changes: &HostChanges,
    cancel: &CancellationToken,
    error: FatalError,
) -> Result<()> {
    status.write_status(&format!("Error during initialization: {error}"));
    tracing::error!("Initialization failed: {error}");

    cancel.cancel();
    changes.revert().await;

    Err(error.into())
}

fn spawn_critical<F>(context: &'static str, errc: &mpsc::Sender<anyhow::Error>, future: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let errc = errc.clone();

    tokio::spawn(async move {
        if let Err(e) = future.await {
            // A full bus means another task already reported a fatal error.
            let _ = errc.send(e.context(context)).await;
        }
    });
}

/// Endpoints every job needs regardless of operator configuration: the
/// provider control plane, plus our own telemetry endpoint while telemetry
/// is on.
fn implicit_endpoints(config: &Config) -> Vec<Endpoint> {
    let mut endpoints = CONTROL_PLANE_ENDPOINTS
        .into_iter()
        .map(|domain| Endpoint::new(domain, 443))
        .collect::<Vec<_>>();

    if !config.disable_telemetry
        && let Some(host) = url::Url::parse(&config.api_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
    {
        endpoints.push(Endpoint::new(&host, 443));
    }

    endpoints
}
