//! Programs the host's packet filter.
//!
//! Two chains matter: `OUTPUT` for traffic leaving the host on its primary
//! interface and `DOCKER-USER` for traffic arriving from the container
//! bridge. Every write goes through [`RuleBackend`] so tests can observe the
//! exact rule stream, and every write is made idempotent by checking
//! `exists` first.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

pub const NFLOG_GROUP: u16 = 100;

/// Addresses of the DoH providers; the agent itself must always be able to
/// reach them over TCP 443.
pub const DOH_RESOLVER_ADDRS: [Ipv4Addr; 2] =
    [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];

const FILTER_TABLE: &str = "filter";

/// Azure's virtual public IP; the platform agent on the VM talks to it.
const AZURE_PLATFORM_ADDR: &str = "168.63.129.16";
const CLOUD_METADATA_ADDR: &str = "169.254.169.254";

const PRIVATE_CIDRS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// The two chains the agent manages: `(chain, direction flag, interface)`.
const CHAINS: [(&str, &str, &str); 2] = [
    ("OUTPUT", "-o", "eth0"),
    ("DOCKER-USER", "-i", "docker0"),
];

#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;
    async fn insert(&self, table: &str, chain: &str, position: u32, spec: &[String]) -> Result<()>;
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool>;
    async fn clear(&self, table: &str, chain: &str) -> Result<()>;
}

/// Real backend: shells out to `iptables`.
///
/// The binary serialises concurrent invocations through its own lock
/// (`--wait`), so the controller needs no locking of its own.
pub struct IptablesBackend;

impl IptablesBackend {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("iptables")
            .arg("--wait")
            .args(args)
            .output()
            .await
            .context("`iptables` didn't run")
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`iptables {}` failed: {}", args.join(" "), stderr.trim());
        }

        Ok(())
    }
}

#[async_trait]
impl RuleBackend for IptablesBackend {
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let mut args = vec!["-t", table, "-A", chain];
        args.extend(spec.iter().map(String::as_str));

        self.run_checked(&args).await
    }

    async fn insert(&self, table: &str, chain: &str, position: u32, spec: &[String]) -> Result<()> {
        let position = position.to_string();
        let mut args = vec!["-t", table, "-I", chain, position.as_str()];
        args.extend(spec.iter().map(String::as_str));

        self.run_checked(&args).await
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend(spec.iter().map(String::as_str));

        // `-C` exits 1 when the rule is absent (and when the chain is, which
        // for our purposes is the same thing).
        Ok(self.run(&args).await?.status.success())
    }

    async fn clear(&self, table: &str, chain: &str) -> Result<()> {
        self.run_checked(&["-t", table, "-F", chain]).await
    }
}

/// A destination the firewall should accept traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedAddr {
    pub addr: IpAddr,
    pub port: u16,
}

pub struct Firewall {
    backend: Arc<dyn RuleBackend>,
}

impl Firewall {
    pub fn new(backend: Arc<dyn RuleBackend>) -> Self {
        Self { backend }
    }

    /// Observation-only rules: the job must not bypass the DNS proxy, and
    /// every connection attempt is mirrored to the sniffer.
    pub async fn setup_audit(&self) -> Result<()> {
        for (chain, direction, interface) in CHAINS {
            if chain == "DOCKER-USER" {
                self.backend
                    .clear(FILTER_TABLE, chain)
                    .await
                    .context("Failed to clear container chain")?;
            }

            self.ensure_appended(chain, drop_dns_rule(direction, interface))
                .await?;
            self.ensure_appended(chain, nflog_rule(direction, interface))
                .await?;
        }

        Ok(())
    }

    /// Enforcement rules, ordered: allow-listed destinations first, then the
    /// agent's own dependencies, then the mirror, then the terminal reject.
    pub async fn setup_block(&self, allowed: &[AllowedAddr]) -> Result<()> {
        for (chain, direction, interface) in CHAINS {
            if chain == "DOCKER-USER" {
                self.backend
                    .clear(FILTER_TABLE, chain)
                    .await
                    .context("Failed to clear container chain")?;
            }

            for endpoint in allowed {
                self.ensure_appended(
                    chain,
                    accept_destination_rule(direction, interface, endpoint.addr, endpoint.port),
                )
                .await?;
            }

            for resolver in DOH_RESOLVER_ADDRS {
                self.ensure_appended(chain, accept_host_rule(direction, interface, &resolver.to_string()))
                    .await?;
            }

            self.ensure_appended(chain, drop_dns_rule(direction, interface))
                .await?;

            self.ensure_appended(chain, accept_host_rule(direction, interface, AZURE_PLATFORM_ADDR))
                .await?;
            self.ensure_appended(chain, accept_host_rule(direction, interface, CLOUD_METADATA_ADDR))
                .await?;

            for cidr in PRIVATE_CIDRS {
                self.ensure_appended(chain, accept_network_rule(direction, interface, cidr))
                    .await?;
            }

            // Connections opened before the agent started must not be severed.
            self.ensure_appended(chain, accept_established_rule(direction, interface))
                .await?;

            self.ensure_appended(chain, nflog_rule(direction, interface))
                .await?;

            self.ensure_appended(chain, reject_rule(direction, interface))
                .await?;
        }

        Ok(())
    }

    /// Admits a freshly-resolved address ahead of the terminal reject.
    ///
    /// Callers rely on the rule being visible to the kernel before they act
    /// on the resolution: the proxy must not hand out an address the
    /// firewall would still reject.
    pub async fn insert_allow_rule(&self, addr: IpAddr, port: u16) -> Result<()> {
        for (chain, direction, interface) in CHAINS {
            let spec = accept_destination_rule(direction, interface, addr, port);

            if self
                .backend
                .exists(FILTER_TABLE, chain, &spec)
                .await
                .unwrap_or(false)
            {
                continue;
            }

            self.backend
                .insert(FILTER_TABLE, chain, 1, &spec)
                .await
                .with_context(|| format!("Failed to insert allow rule for {addr}:{port}"))?;
        }

        Ok(())
    }

    /// Clears both managed chains. Best-effort per chain.
    pub async fn revert(&self) -> Result<()> {
        let mut result = Ok(());

        for (chain, _, _) in CHAINS {
            if let Err(e) = self.backend.clear(FILTER_TABLE, chain).await {
                tracing::warn!(%chain, "Failed to clear chain: {e:#}");
                result = Err(e);
            }
        }

        result
    }

    async fn ensure_appended(&self, chain: &str, spec: Vec<String>) -> Result<()> {
        if self
            .backend
            .exists(FILTER_TABLE, chain, &spec)
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }

        self.backend
            .append(FILTER_TABLE, chain, &spec)
            .await
            .with_context(|| format!("Failed to append rule to `{chain}`"))
    }
}

/// Destination match for an allow rule.
///
/// Upstreams rotate addresses inside a subnet between the resolution the
/// firewall saw and the connection the client makes, so IPv4 destinations
/// are widened to their /24. IPv6 assignments don't rotate that way and
/// stay exact.
pub fn widen_destination(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => v6.to_string(),
    }
}

fn accept_destination_rule(
    direction: &str,
    interface: &str,
    addr: IpAddr,
    port: u16,
) -> Vec<String> {
    rule([
        direction,
        interface,
        "-p",
        "tcp",
        "-d",
        &widen_destination(addr),
        "--dport",
        &port.to_string(),
        "-j",
        "ACCEPT",
    ])
}

fn accept_host_rule(direction: &str, interface: &str, addr: &str) -> Vec<String> {
    rule([direction, interface, "-p", "tcp", "-d", addr, "-j", "ACCEPT"])
}

fn accept_network_rule(direction: &str, interface: &str, cidr: &str) -> Vec<String> {
    rule([direction, interface, "-d", cidr, "-j", "ACCEPT"])
}

fn accept_established_rule(direction: &str, interface: &str) -> Vec<String> {
    rule([
        direction,
        interface,
        "-m",
        "state",
        "--state",
        "ESTABLISHED,RELATED",
        "-j",
        "ACCEPT",
    ])
}

fn drop_dns_rule(direction: &str, interface: &str) -> Vec<String> {
    rule([
        direction, interface, "-p", "udp", "--dport", "53", "-j", "DROP",
    ])
}

/// Mirrors connection-initiating TCP packets to the sniffer. Matching only
/// `SYN` (of `SYN,ACK`) bounds the packet rate user space has to keep up with.
fn nflog_rule(direction: &str, interface: &str) -> Vec<String> {
    rule([
        direction,
        interface,
        "-p",
        "tcp",
        "--tcp-flags",
        "SYN,ACK",
        "SYN",
        "-j",
        "NFLOG",
        "--nflog-group",
        &NFLOG_GROUP.to_string(),
    ])
}

fn reject_rule(direction: &str, interface: &str) -> Vec<String> {
    rule([direction, interface, "-p", "all", "-j", "REJECT"])
}

fn rule<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.into_iter().map(str::to_owned).collect()
}

impl fmt::Debug for Firewall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firewall").finish_non_exhaustive()
    }
}
