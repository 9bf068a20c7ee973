//! Keeps block-mode answers and firewall rules in phase.
//!
//! Exact-allowed cache entries never expire from reads (see the cache's
//! eviction rules), so this task re-resolves them shortly before their TTL
//! runs out. The firewall learns the new address *before* the cache does:
//! a client must never read an answer the kernel would still reject.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::{Answer, DnsCache, unix_now};
use crate::firewall::Firewall;
use crate::policy::EndpointPolicy;
use crate::resolver::Resolve;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Entries with this much TTL left (or less) are refreshed.
const REFRESH_HORIZON_SECS: u64 = 10;

pub struct DnsRefresher {
    policy: EndpointPolicy,
    cache: Arc<DnsCache>,
    resolver: Arc<dyn Resolve>,
    firewall: Arc<Firewall>,
}

impl DnsRefresher {
    pub fn new(
        policy: EndpointPolicy,
        cache: Arc<DnsCache>,
        resolver: Arc<dyn Resolve>,
        firewall: Arc<Firewall>,
    ) -> Self {
        Self {
            policy,
            cache,
            resolver,
            firewall,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick_at(unix_now()).await,
            }
        }
    }

    /// One refresh pass. Failures are logged and retried next tick; a
    /// transient upstream error must not stop future refreshes.
    pub async fn tick_at(&self, now: u64) {
        for (name, endpoints) in self.policy.exact() {
            if !self.cache.expiring_within(name, REFRESH_HORIZON_SECS, now) {
                continue;
            }

            let upstream = match self.resolver.resolve(name).await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(%name, "Refresh resolution failed: {e:#}");
                    continue;
                }
            };

            let answer = Answer {
                name: name.to_owned(),
                addr: upstream.addr,
                ttl: upstream.ttl,
            };

            // Arm the firewall first; only then may clients see the address.
            let mut armed = true;
            for endpoint in endpoints {
                if let Err(e) = self
                    .firewall
                    .insert_allow_rule(answer.addr.into(), endpoint.port)
                    .await
                {
                    tracing::warn!(%name, "Failed to arm firewall during refresh: {e:#}");
                    armed = false;
                }
            }

            if armed {
                self.cache.set_at(name, answer, false, now);
                tracing::debug!(%name, "Refreshed allowed endpoint");
            }
        }
    }
}
