//! Policy-aware DNS answer cache.
//!
//! Eviction depends on the egress policy: in audit mode (and for
//! wildcard-originated entries in any mode) an entry dies with its TTL. In
//! block mode an exact-allowed entry outlives its TTL, because the firewall
//! is pinned to the cached address; handing the client a fresher address
//! than the firewall knows about would make it connect somewhere the kernel
//! rejects. The refresher replaces those entries before clients notice.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::config::EgressPolicy;

/// A resolved A record as held by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Fully-qualified name this answer belongs to.
    pub name: String,
    pub addr: Ipv4Addr,
    pub ttl: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    answer: Answer,
    added_at: u64,
    wildcard_origin: bool,
}

pub struct DnsCache {
    entries: RwLock<HashMap<String, Entry>>,
    egress_policy: EgressPolicy,
}

impl DnsCache {
    pub fn new(egress_policy: EgressPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            egress_policy,
        }
    }

    pub fn get(&self, name: &str) -> Option<(Answer, bool)> {
        self.get_at(name, unix_now())
    }

    /// Deterministic variant of [`DnsCache::get`].
    pub fn get_at(&self, name: &str, now: u64) -> Option<(Answer, bool)> {
        let entries = self.entries.read();
        let entry = entries.get(name)?;

        let expires = self.egress_policy == EgressPolicy::Audit || entry.wildcard_origin;
        if expires && now.saturating_sub(entry.added_at) > u64::from(entry.answer.ttl) {
            return None;
        }

        Some((entry.answer.clone(), entry.wildcard_origin))
    }

    pub fn set(&self, name: &str, answer: Answer, wildcard_origin: bool) {
        self.set_at(name, answer, wildcard_origin, unix_now());
    }

    /// Deterministic variant of [`DnsCache::set`].
    pub fn set_at(&self, name: &str, answer: Answer, wildcard_origin: bool, now: u64) {
        self.entries.write().insert(
            name.to_owned(),
            Entry {
                answer,
                added_at: now,
                wildcard_origin,
            },
        );
    }

    /// Whether `name` has an entry whose remaining TTL is at most `horizon`
    /// seconds. Absent entries are not "expiring"; the proxy has never served
    /// the name, so there is nothing for the firewall to be out of phase with.
    pub fn expiring_within(&self, name: &str, horizon: u64, now: u64) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(name) else {
            return false;
        };

        now + horizon > entry.added_at + u64::from(entry.answer.ttl)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
