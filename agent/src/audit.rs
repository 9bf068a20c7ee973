//! Consumes the kernel audit stream and reassembles multi-record events.
//!
//! One audit *event* arrives as several records sharing a sequence number
//! (`SYSCALL`, `SOCKADDR`, `CWD`, `EXECVE`, `PATH`, …). The [`Assembler`]
//! merges them into a slot per sequence and releases the event once the
//! fields its kind requires are present; a per-slot sent bit keeps late
//! records from dispatching the same event twice.

pub mod parse;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use nix::sys::socket::SockProtocol;
use tokio_util::sync::CancellationToken;

use crate::cmd::run_checked;
use crate::correlator::EventCorrelator;
use crate::events::{
    Event, FILE_MONITOR_TAG, FileEvent, NET_MONITOR_TAG, NetworkEvent, PROCESS_MONITOR_TAG,
    ProcessEvent,
};
use crate::netlink::{self, NetlinkSocket};
use parse::{AUDIT_EOE, AuditRecord};

const AUDIT_SET: u16 = 1001;

const AUDIT_STATUS_ENABLED: u32 = 0x0001;
const AUDIT_STATUS_PID: u32 = 0x0004;

/// Event records live in 1300..=1399; everything else on the socket is
/// control traffic or user messages.
const AUDIT_EVENT_RANGE: std::ops::RangeInclusive<u16> = 1300..=1399;

/// Directories whose writes the kernel reports to us.
const WATCHED_DIRS: [&str; 2] = ["/home/runner", "/home/agent"];

/// Slots to keep before evicting already-dispatched ones; connect-heavy jobs
/// produce sequences faster than `EOE` records retire them.
const MAX_PENDING_EVENTS: usize = 4096;

pub struct AuditSocket {
    socket: NetlinkSocket,
}

#[derive(Debug, Clone)]
pub struct RawRecord {
    pub rtype: u16,
    pub text: String,
}

impl AuditSocket {
    pub fn open() -> Result<Self> {
        let socket =
            NetlinkSocket::open(SockProtocol::NetlinkAudit).context("Failed to open audit socket")?;

        Ok(Self { socket })
    }

    /// Enables auditing and registers `pid` as the consumer of the stream.
    pub fn claim(&self, pid: u32) -> Result<()> {
        // struct audit_status: mask, enabled, failure, pid, rate_limit,
        // backlog_limit, lost, backlog.
        let mut status = [0u8; 32];
        status[0..4].copy_from_slice(&(AUDIT_STATUS_ENABLED | AUDIT_STATUS_PID).to_ne_bytes());
        status[4..8].copy_from_slice(&1u32.to_ne_bytes());
        status[12..16].copy_from_slice(&pid.to_ne_bytes());

        self.socket
            .send(&netlink::message(
                AUDIT_SET,
                libc::NLM_F_REQUEST as u16,
                &status,
            ))
            .context("Failed to claim the audit stream")
    }

    pub async fn recv_records(&self, buf: &mut [u8]) -> io::Result<Vec<RawRecord>> {
        let len = self.socket.recv(buf).await?;

        let records = netlink::messages(&buf[..len])
            .filter(|(rtype, _)| AUDIT_EVENT_RANGE.contains(rtype))
            .map(|(rtype, payload)| RawRecord {
                rtype,
                text: String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_owned(),
            })
            .collect();

        Ok(records)
    }
}

/// Reassembles records into events, keyed by sequence number.
#[derive(Default)]
pub struct Assembler {
    pending: HashMap<u64, PendingEvent>,
}

#[derive(Debug, Default)]
struct PendingEvent {
    tag: Option<String>,
    syscall: String,
    exe: String,
    pid: Option<u32>,
    ppid: Option<u32>,
    euid: Option<u32>,
    cwd: Option<String>,
    file_name: Option<String>,
    addr: Option<String>,
    port: Option<u16>,
    argv: Vec<String>,
    timestamp: Option<DateTime<Utc>>,
    sent: bool,
}

impl Assembler {
    /// Merges one record; returns the event if this record completed it.
    pub fn ingest(&mut self, record: AuditRecord) -> Option<Event> {
        if record.rtype == AUDIT_EOE {
            if self.pending.get(&record.sequence).is_some_and(|p| p.sent) {
                self.pending.remove(&record.sequence);
            }
            return None;
        }

        if self.pending.len() > MAX_PENDING_EVENTS {
            self.pending.retain(|_, pending| !pending.sent);
        }

        let pending = self.pending.entry(record.sequence).or_default();
        pending.merge(&record);

        if pending.sent {
            return None;
        }

        let event = pending.to_event()?;
        pending.sent = true;

        Some(event)
    }
}

impl PendingEvent {
    fn merge(&mut self, record: &AuditRecord) {
        let fields = &record.fields;

        self.timestamp.get_or_insert(record.timestamp);

        if let Some(tag) = fields.get("key")
            && matches!(
                tag.as_str(),
                NET_MONITOR_TAG | FILE_MONITOR_TAG | PROCESS_MONITOR_TAG
            )
        {
            self.tag = Some(tag.clone());
        }

        if let Some(syscall) = fields.get("syscall") {
            self.syscall = syscall.clone();
        }
        if let Some(exe) = fields.get("exe") {
            self.exe = exe.clone();
        }
        if let Some(pid) = fields.get("pid").and_then(|v| v.parse().ok()) {
            self.pid = Some(pid);
        }
        if let Some(ppid) = fields.get("ppid").and_then(|v| v.parse().ok()) {
            self.ppid = Some(ppid);
        }
        if let Some(euid) = fields.get("euid").and_then(|v| v.parse().ok()) {
            self.euid = Some(euid);
        }

        if let Some(cwd) = fields.get("cwd") {
            self.cwd = Some(cwd.clone());
        }

        // connect(2) destination, decoded from the SOCKADDR record.
        if let Some(addr) = fields.get("addr") {
            self.addr = Some(addr.clone());
            self.port = fields.get("port").and_then(|v| v.parse().ok());
        }

        // execve(2) argument vector.
        if let Some(argc) = fields.get("argc").and_then(|v| v.parse::<usize>().ok()) {
            let argv = (0..argc)
                .map_while(|i| fields.get(&format!("a{i}")))
                .cloned()
                .collect::<Vec<_>>();
            if !argv.is_empty() {
                self.argv = argv;
            }
        }

        // File operations report the touched path in PATH records.
        if let Some(name) = fields.get("name")
            && matches!(
                fields.get("nametype").map(String::as_str),
                Some("CREATE" | "DELETE" | "NORMAL")
            )
        {
            self.file_name = Some(name.clone());
        }
    }

    /// An event is ready once its tag and the fields that kind requires are
    /// all present.
    fn to_event(&self) -> Option<Event> {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let pid = self.pid?;
        let ppid = self.ppid.unwrap_or_default();

        match self.tag.as_deref()? {
            NET_MONITOR_TAG => Some(Event::Network(NetworkEvent {
                pid,
                ppid,
                exe: self.exe.clone(),
                addr: self.addr.clone()?,
                port: self.port?,
                timestamp,
            })),
            FILE_MONITOR_TAG => Some(Event::File(FileEvent {
                pid,
                ppid,
                exe: self.exe.clone(),
                cwd: self.cwd.clone()?,
                name: self.file_name.clone()?,
                syscall: self.syscall.clone(),
                timestamp,
            })),
            PROCESS_MONITOR_TAG => {
                if self.argv.is_empty() {
                    return None;
                }

                Some(Event::Process(ProcessEvent {
                    pid,
                    ppid,
                    exe: self.exe.clone(),
                    argv: self.argv.clone(),
                    euid: self.euid.unwrap_or_default(),
                    cwd: self.cwd.clone()?,
                    timestamp,
                }))
            }
            _ => None,
        }
    }
}

/// Installs the audit rules, claims the stream and feeds events to the
/// correlator until cancelled.
pub struct AuditMonitor {
    correlator: Arc<EventCorrelator>,
    monitor_files: bool,
}

impl AuditMonitor {
    pub fn new(correlator: Arc<EventCorrelator>, monitor_files: bool) -> Self {
        Self {
            correlator,
            monitor_files,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.install_rules()
            .await
            .context("Failed to install audit rules")?;

        let socket = AuditSocket::open()?;
        socket.claim(std::process::id())?;

        tracing::info!("Audit stream claimed; watching connect/execve and file writes");

        let mut assembler = Assembler::default();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let records = tokio::select! {
                () = cancel.cancelled() => {
                    self.remove_rules().await;
                    return Ok(());
                }
                result = socket.recv_records(&mut buf) => match result {
                    Ok(records) => records,
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        tracing::warn!("Audit socket overran; events were lost");
                        continue;
                    }
                    Err(e) => return Err(e).context("Audit receive failed"),
                },
            };

            for raw in records {
                let Some(record) = parse::parse_record(raw.rtype, &raw.text) else {
                    continue;
                };

                if let Some(event) = assembler.ingest(record) {
                    let correlator = self.correlator.clone();
                    tokio::spawn(async move { correlator.handle(event).await });
                }
            }
        }
    }

    async fn install_rules(&self) -> Result<()> {
        // Stale rules from a previous run would double-report.
        run_checked("auditctl", &["-D"]).await?;
        run_checked("auditctl", &["-e", "1"]).await?;

        if self.monitor_files {
            for dir in WATCHED_DIRS {
                run_checked("auditctl", &["-w", dir, "-p", "wa", "-k", FILE_MONITOR_TAG]).await?;
            }
        }

        run_checked(
            "auditctl",
            &["-a", "exit,always", "-S", "connect", "-k", NET_MONITOR_TAG],
        )
        .await?;
        run_checked(
            "auditctl",
            &["-a", "exit,always", "-S", "execve", "-k", PROCESS_MONITOR_TAG],
        )
        .await
    }

    async fn remove_rules(&self) {
        if let Err(e) = run_checked("auditctl", &["-D"]).await {
            tracing::warn!("Failed to remove audit rules: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_all(assembler: &mut Assembler, records: &[(u16, &str)]) -> Vec<Event> {
        records
            .iter()
            .filter_map(|(rtype, text)| {
                assembler.ingest(parse::parse_record(*rtype, text).unwrap())
            })
            .collect()
    }

    #[test]
    fn network_event_assembles_from_syscall_and_sockaddr() {
        let mut assembler = Assembler::default();

        let events = ingest_all(
            &mut assembler,
            &[
                (
                    parse::AUDIT_SYSCALL,
                    r#"audit(1700000000.100:7): syscall=42 pid=4321 ppid=4000 euid=1001 exe="/usr/bin/curl" key="netmon""#,
                ),
                (
                    parse::AUDIT_SOCKADDR,
                    "audit(1700000000.100:7): saddr=020001BB43E192F80000000000000000",
                ),
            ],
        );

        assert_eq!(events.len(), 1);
        let Event::Network(event) = &events[0] else {
            panic!("expected a network event");
        };
        assert_eq!(event.pid, 4321);
        assert_eq!(event.addr, "67.225.146.248");
        assert_eq!(event.port, 443);
        assert_eq!(event.exe, "/usr/bin/curl");
    }

    #[test]
    fn events_dispatch_only_once() {
        let mut assembler = Assembler::default();

        let records = [
            (
                parse::AUDIT_SYSCALL,
                r#"audit(1700000000.100:8): syscall=42 pid=1 exe="/bin/a" key="netmon""#,
            ),
            (
                parse::AUDIT_SOCKADDR,
                "audit(1700000000.100:8): saddr=020001BB43E192F80000000000000000",
            ),
            // A PATH straggler for the same sequence.
            (parse::AUDIT_PATH, r#"audit(1700000000.100:8): item=0 name="x""#),
        ];

        assert_eq!(ingest_all(&mut assembler, &records).len(), 1);
    }

    #[test]
    fn process_event_requires_argv_and_cwd() {
        let mut assembler = Assembler::default();

        let partial = ingest_all(
            &mut assembler,
            &[(
                parse::AUDIT_SYSCALL,
                r#"audit(1700000000.100:9): syscall=59 pid=77 ppid=70 euid=0 exe="/usr/bin/git" key="procmon""#,
            )],
        );
        assert!(partial.is_empty());

        let events = ingest_all(
            &mut assembler,
            &[
                (
                    parse::AUDIT_EXECVE,
                    r#"audit(1700000000.100:9): argc=2 a0="git" a1=636C6F6E65"#,
                ),
                (
                    parse::AUDIT_CWD,
                    r#"audit(1700000000.100:9): cwd="/home/runner/work""#,
                ),
            ],
        );

        assert_eq!(events.len(), 1);
        let Event::Process(event) = &events[0] else {
            panic!("expected a process event");
        };
        assert_eq!(event.argv, ["git", "clone"]);
        assert_eq!(event.euid, 0);
        assert_eq!(event.cwd, "/home/runner/work");
    }

    #[test]
    fn file_event_reads_path_record() {
        let mut assembler = Assembler::default();

        let events = ingest_all(
            &mut assembler,
            &[
                (
                    parse::AUDIT_SYSCALL,
                    r#"audit(1700000000.100:10): syscall=257 pid=88 ppid=80 exe="/usr/bin/python3" key="filemon""#,
                ),
                (
                    parse::AUDIT_CWD,
                    r#"audit(1700000000.100:10): cwd="/home/runner/work""#,
                ),
                (
                    parse::AUDIT_PATH,
                    r#"audit(1700000000.100:10): item=0 name="main.go" nametype=CREATE"#,
                ),
            ],
        );

        assert_eq!(events.len(), 1);
        let Event::File(event) = &events[0] else {
            panic!("expected a file event");
        };
        assert_eq!(event.name, "main.go");
        assert_eq!(event.syscall, "openat");
    }

    #[test]
    fn parent_path_records_are_ignored() {
        let mut assembler = Assembler::default();

        let events = ingest_all(
            &mut assembler,
            &[
                (
                    parse::AUDIT_SYSCALL,
                    r#"audit(1700000000.100:11): syscall=257 pid=88 exe="/usr/bin/touch" key="filemon""#,
                ),
                (
                    parse::AUDIT_CWD,
                    r#"audit(1700000000.100:11): cwd="/home/runner""#,
                ),
                (
                    parse::AUDIT_PATH,
                    r#"audit(1700000000.100:11): item=0 name="work" nametype=PARENT"#,
                ),
            ],
        );

        assert!(events.is_empty());
    }

    #[test]
    fn eoe_retires_dispatched_slots() {
        let mut assembler = Assembler::default();

        ingest_all(
            &mut assembler,
            &[
                (
                    parse::AUDIT_SYSCALL,
                    r#"audit(1700000000.100:12): syscall=42 pid=1 exe="/bin/a" key="netmon""#,
                ),
                (
                    parse::AUDIT_SOCKADDR,
                    "audit(1700000000.100:12): saddr=020001BB43E192F80000000000000000",
                ),
                (parse::AUDIT_EOE, "audit(1700000000.100:12): "),
            ],
        );

        assert!(assembler.pending.is_empty());
    }
}
