//! The DNS interception proxy.
//!
//! All name resolution on the machine terminates here; the proxy decides per
//! query whether to serve from cache, resolve upstream, or, in block mode,
//! hand back the sinkhole so the client fails fast at `connect` instead of
//! hanging on DNS. On the wildcard path the firewall is armed *before* the
//! response leaves, so a client can never act on an address the kernel would
//! still reject.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use dns_types::{Opcode, Query, RecordType, Response, ResponseBuilder, ResponseCode, records};
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::api::TelemetrySink;
use crate::cache::{Answer, DnsCache};
use crate::config::EgressPolicy;
use crate::firewall::{AllowedAddr, Firewall};
use crate::policy::{EndpointPolicy, fqdn};
use crate::resolver::Resolve;
use crate::status::AnnotationWriter;

/// Where disallowed names point. Class E, never routable; the client's
/// connect fails immediately and the firewall's terminal reject catches
/// anything that tries anyway.
pub const SINKHOLE_ADDRESS: Ipv4Addr = Ipv4Addr::new(240, 0, 0, 1);

/// Cache lifetime for entries that must never be re-resolved (pinned
/// resolvers, sinkholed names).
pub const MAX_TTL: u32 = u32::MAX;

/// The DoH providers' own names cannot be resolved through themselves;
/// answer them with pinned addresses.
const PINNED_RESOLVERS: [(&str, Ipv4Addr); 2] = [
    ("dns.google.", Ipv4Addr::new(8, 8, 8, 8)),
    ("cloudflare-dns.com.", Ipv4Addr::new(1, 1, 1, 1)),
];

const CLOUDAPP_SUFFIX: &str = ".internal.cloudapp.net.";

/// Background noise every runner produces; annotating it would drown real
/// findings. Still blocked and still in telemetry.
const NOISY_NAME_SUFFIXES: [&str; 5] = [
    "in-addr.arpa.",
    "motd.ubuntu.com.",
    "api.snapcraft.io.",
    "connectivity-check.ubuntu.com.",
    "daily.telemetry.ubuntu.com.",
];

/// Address → most recent name that resolved to it. The proxy writes on
/// every successful resolution; the correlator reads to annotate network
/// events with the domain the process actually asked for.
#[derive(Default)]
pub struct ReverseIpTable {
    entries: RwLock<HashMap<IpAddr, String>>,
}

impl ReverseIpTable {
    pub fn insert(&self, addr: IpAddr, name: &str) {
        self.entries.write().insert(addr, name.to_owned());
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<String> {
        self.entries.read().get(&addr).cloned()
    }
}

pub struct DnsProxy {
    egress_policy: EgressPolicy,
    policy: EndpointPolicy,
    cache: Arc<DnsCache>,
    resolver: Arc<dyn Resolve>,
    firewall: Arc<Firewall>,
    reverse_ip: Arc<ReverseIpTable>,
    telemetry: Arc<dyn TelemetrySink>,
    annotations: Arc<AnnotationWriter>,
}

impl DnsProxy {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        egress_policy: EgressPolicy,
        policy: EndpointPolicy,
        cache: Arc<DnsCache>,
        resolver: Arc<dyn Resolve>,
        firewall: Arc<Firewall>,
        reverse_ip: Arc<ReverseIpTable>,
        telemetry: Arc<dyn TelemetrySink>,
        annotations: Arc<AnnotationWriter>,
    ) -> Self {
        Self {
            egress_policy,
            policy,
            cache,
            resolver,
            firewall,
            reverse_ip,
            telemetry,
            annotations,
        }
    }

    /// Answers one query; `None` means no response is owed (non-QUERY
    /// opcodes are dropped on the floor).
    pub async fn handle(&self, query: &Query) -> Option<Response> {
        if query.opcode() != Opcode::QUERY {
            return None;
        }

        match query.qtype() {
            RecordType::A => Some(self.answer_a(query).await),
            // Authoritative for A only; everything else gets an empty answer.
            _ => Some(Response::no_error(query)),
        }
    }

    async fn answer_a(&self, query: &Query) -> Response {
        let name = fqdn(&query.domain().to_string());

        if let Some(addr) = pinned_resolver(&name) {
            let answer = Answer {
                name: name.clone(),
                addr,
                ttl: MAX_TTL,
            };
            self.cache.set(&name, answer.clone(), false);
            self.reverse_ip.insert(addr.into(), &name);

            return a_response(query, &answer);
        }

        // The cloud prepends a per-VM DNS suffix to short names; resolve
        // what the client actually meant.
        let target = strip_cloudapp_suffix(&name).unwrap_or(name);

        if let Some((answer, _)) = self.cache.get(&target) {
            return a_response(query, &answer);
        }

        match self.egress_policy {
            EgressPolicy::Audit => match self.resolve_and_cache(&target, false).await {
                Ok(answer) => a_response(query, &answer),
                Err(e) => {
                    tracing::debug!(name = %target, "Resolution failed: {e:#}");
                    Response::servfail(query)
                }
            },
            EgressPolicy::Block => self.answer_blocked(query, &target).await,
        }
    }

    async fn answer_blocked(&self, query: &Query, name: &str) -> Response {
        if name.ends_with(".internal.") {
            return Response::nxdomain(query);
        }

        if self.policy.is_exact_allowed(name) {
            return match self.resolve_and_cache(name, false).await {
                Ok(answer) => a_response(query, &answer),
                Err(e) => {
                    tracing::debug!(%name, "Resolution of allowed name failed: {e:#}");
                    Response::servfail(query)
                }
            };
        }

        if let Some((pattern, endpoints)) = self.policy.match_wildcard(name) {
            tracing::debug!(%name, %pattern, "Name matched wildcard endpoint");

            let answer = match self.resolver.resolve(name).await {
                Ok(upstream) => Answer {
                    name: name.to_owned(),
                    addr: upstream.addr,
                    ttl: upstream.ttl,
                },
                Err(e) => {
                    tracing::debug!(%name, "Resolution of wildcard name failed: {e:#}");
                    return Response::servfail(query);
                }
            };

            // The allow rule must be visible to the kernel before the client
            // learns the address.
            for endpoint in endpoints {
                if let Err(e) = self
                    .firewall
                    .insert_allow_rule(answer.addr.into(), endpoint.port)
                    .await
                {
                    tracing::warn!(%name, "Failed to arm firewall for wildcard match: {e:#}");
                    return Response::servfail(query);
                }
            }

            self.cache.set(name, answer.clone(), true);
            self.reverse_ip.insert(answer.addr.into(), name);
            self.telemetry.send_dns_record(name, answer.addr.into()).await;

            return a_response(query, &answer);
        }

        // Disallowed: pin the name to the sinkhole so repeats never resolve
        // again, and surface the finding.
        let answer = Answer {
            name: name.to_owned(),
            addr: SINKHOLE_ADDRESS,
            ttl: MAX_TTL,
        };
        self.cache.set(name, answer.clone(), false);

        tracing::info!(%name, "Blocked resolution of disallowed name");
        self.telemetry
            .send_dns_record(name, SINKHOLE_ADDRESS.into())
            .await;

        if !is_noisy_name(name) {
            self.annotations.write(&format!(
                "DNS resolution for {} was blocked: not in the allowed endpoints",
                self.annotations.printable_domain(name)
            ));
        }

        a_response(query, &answer)
    }

    async fn resolve_and_cache(&self, name: &str, wildcard_origin: bool) -> Result<Answer> {
        let upstream = self.resolver.resolve(name).await?;
        let answer = Answer {
            name: name.to_owned(),
            addr: upstream.addr,
            ttl: upstream.ttl,
        };

        self.cache.set(name, answer.clone(), wildcard_origin);
        self.reverse_ip.insert(answer.addr.into(), name);
        self.telemetry.send_dns_record(name, answer.addr.into()).await;

        Ok(answer)
    }

    /// Resolves every exact-allowed endpoint up front so block mode can stage
    /// its initial firewall rules. Any failure here is fatal to bring-up.
    pub async fn preresolve_allowed(&self) -> Result<Vec<AllowedAddr>> {
        let mut allowed = Vec::new();

        for (name, endpoints) in self.policy.exact() {
            let answer = self
                .resolve_and_cache(name, false)
                .await
                .with_context(|| format!("Failed to resolve allowed endpoint `{name}`"))?;

            for endpoint in endpoints {
                allowed.push(AllowedAddr {
                    addr: answer.addr.into(),
                    port: endpoint.port,
                });
            }
        }

        Ok(allowed)
    }
}

fn a_response(query: &Query, answer: &Answer) -> Response {
    ResponseBuilder::for_query(query, ResponseCode::NOERROR)
        .with_records([(query.domain(), wire_ttl(answer.ttl), records::a(answer.addr))])
        .build()
}

/// The cache distinguishes "practically forever" from real TTLs; the wire
/// should not.
fn wire_ttl(ttl: u32) -> u32 {
    ttl.min(86_400)
}

fn pinned_resolver(name: &str) -> Option<Ipv4Addr> {
    PINNED_RESOLVERS
        .into_iter()
        .find(|(pinned, _)| *pinned == name)
        .map(|(_, addr)| addr)
}

/// Strips the per-VM cloud DNS suffix (`<vm>.<zone>.internal.cloudapp.net.`,
/// six trailing labels counting the root) off a rewritten short name.
fn strip_cloudapp_suffix(name: &str) -> Option<String> {
    if !name.ends_with(CLOUDAPP_SUFFIX) {
        return None;
    }

    let labels = name.split('.').collect::<Vec<_>>();
    if labels.len() <= 6 {
        return None;
    }

    Some(format!("{}.", labels[..labels.len() - 6].join(".")))
}

fn is_noisy_name(name: &str) -> bool {
    NOISY_NAME_SUFFIXES
        .into_iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Binds a UDP/53 listener socket.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)
        .with_context(|| format!("Failed to bind UDP socket on {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("Failed to set socket as non-blocking")?;

    UdpSocket::from_std(socket).context("Failed to convert std to tokio socket")
}

/// Serves queries from one socket forever. Each query is answered on its own
/// task; concurrent queries for the same name may race to the resolver, which
/// is fine: they converge on the same answer.
pub async fn serve_udp(proxy: Arc<DnsProxy>, socket: UdpSocket) -> Result<()> {
    let socket = Arc::new(socket);

    // On the public Internet, any MTU > 1500 is very unlikely so 2000 is a
    // safe bet for a query buffer.
    let mut buf = vec![0u8; 2000];

    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .context("Failed to receive UDP packet")?;

        let query = match Query::parse(&buf[..len]) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(%from, "Failed to parse DNS message: {e}");
                continue;
            }
        };

        let proxy = proxy.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Some(response) = proxy.handle(&query).await
                && let Err(e) = socket.send_to(&response.into_bytes(), from).await
            {
                tracing::debug!(%from, "Failed to send DNS response: {e}");
            }
        });
    }
}
