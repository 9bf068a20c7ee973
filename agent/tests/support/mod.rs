//! Scriptable fakes for the capability seams: upstream resolver, packet
//! filter backend and telemetry sink.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use gatehouse_agent::api::{TelemetrySink, Tool};
use gatehouse_agent::cache::Answer;
use gatehouse_agent::firewall::RuleBackend;
use gatehouse_agent::resolver::Resolve;

/// Upstream resolver fake: answers are scripted per name, in order; the last
/// scripted answer repeats. Unscripted names fail like an exhausted upstream.
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Vec<Answer>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedResolver {
    pub fn script(&self, name: &str, addr: Ipv4Addr, ttl: u32) {
        self.answers
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push(Answer {
                name: name.to_owned(),
                addr,
                ttl,
            });
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Resolve for ScriptedResolver {
    async fn resolve(&self, name: &str) -> Result<Answer> {
        let call = {
            let mut calls = self.calls.lock();
            let counter = calls.entry(name.to_owned()).or_insert(0);
            *counter += 1;
            *counter - 1
        };

        let answers = self.answers.lock();
        let Some(scripted) = answers.get(name).filter(|a| !a.is_empty()) else {
            bail!("no scripted answer for `{name}`");
        };

        Ok(scripted[call.min(scripted.len() - 1)].clone())
    }
}

/// In-memory packet filter: replays the rule stream per chain so tests can
/// assert on ordering and positions.
#[derive(Default)]
pub struct RecordingBackend {
    ops: Mutex<Vec<Op>>,
    fail_writes: Mutex<bool>,
}

#[derive(Debug, Clone)]
enum Op {
    Append { chain: String, spec: Vec<String> },
    Insert { chain: String, position: u32, spec: Vec<String> },
    Clear { chain: String },
}

impl RecordingBackend {
    /// The effective rule list of `chain`, head first.
    pub fn rules(&self, chain: &str) -> Vec<Vec<String>> {
        let mut rules = Vec::new();

        for op in self.ops.lock().iter() {
            match op {
                Op::Append { chain: c, spec } if c == chain => rules.push(spec.clone()),
                Op::Insert { chain: c, position, spec } if c == chain => {
                    rules.insert((*position - 1) as usize, spec.clone());
                }
                Op::Clear { chain: c } if c == chain => rules.clear(),
                _ => {}
            }
        }

        rules
    }

    /// Makes every subsequent write fail, as a broken `iptables` would.
    pub fn fail_writes(&self) {
        *self.fail_writes.lock() = true;
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock() {
            bail!("packet filter is broken");
        }

        Ok(())
    }
}

#[async_trait]
impl RuleBackend for RecordingBackend {
    async fn append(&self, _table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.check_writable()?;
        self.ops.lock().push(Op::Append {
            chain: chain.to_owned(),
            spec: spec.to_vec(),
        });
        Ok(())
    }

    async fn insert(&self, _table: &str, chain: &str, position: u32, spec: &[String]) -> Result<()> {
        self.check_writable()?;
        self.ops.lock().push(Op::Insert {
            chain: chain.to_owned(),
            position,
            spec: spec.to_vec(),
        });
        Ok(())
    }

    async fn exists(&self, _table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        Ok(self.rules(chain).contains(&spec.to_vec()))
    }

    async fn clear(&self, _table: &str, chain: &str) -> Result<()> {
        self.check_writable()?;
        self.ops.lock().push(Op::Clear {
            chain: chain.to_owned(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentConnection {
    pub addr: String,
    pub port: String,
    pub domain: String,
    pub status: String,
    pub tool: Tool,
}

/// Captures everything the agent would have reported.
#[derive(Default)]
pub struct RecordingSink {
    dns_records: Mutex<Vec<(String, IpAddr)>>,
    connections: Mutex<Vec<SentConnection>>,
    file_events: Mutex<Vec<(String, Tool)>>,
}

impl RecordingSink {
    pub fn dns_records(&self) -> Vec<(String, IpAddr)> {
        self.dns_records.lock().clone()
    }

    pub fn connections(&self) -> Vec<SentConnection> {
        self.connections.lock().clone()
    }

    pub fn file_events(&self) -> Vec<(String, Tool)> {
        self.file_events.lock().clone()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn send_dns_record(&self, domain: &str, addr: IpAddr) {
        self.dns_records.lock().push((domain.to_owned(), addr));
    }

    async fn send_network_connection(
        &self,
        addr: &str,
        port: &str,
        domain: &str,
        status: &str,
        _timestamp: DateTime<Utc>,
        tool: &Tool,
    ) {
        self.connections.lock().push(SentConnection {
            addr: addr.to_owned(),
            port: port.to_owned(),
            domain: domain.to_owned(),
            status: status.to_owned(),
            tool: tool.clone(),
        });
    }

    async fn send_file_event(&self, file_type: &str, _timestamp: DateTime<Utc>, tool: &Tool) {
        self.file_events.lock().push((file_type.to_owned(), tool.clone()));
    }
}
