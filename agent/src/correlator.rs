//! Attributes kernel events to programs and containers.
//!
//! Keeps the process tree observed through `execve`, deduplicates
//! connections, annotates destinations with the name the proxy resolved for
//! them, and reports the resulting records to telemetry.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::api::{TelemetrySink, Tool};
use crate::container::ContainerRuntime;
use crate::events::{Event, FileEvent, NetworkEvent, ProcessEvent};
use crate::proc;
use crate::proxy::ReverseIpTable;
use crate::status::{AnnotationWriter, StatusFiles};

/// Ancestor walks stop here; deeper chains are runaway fork bombs, not tools.
const MAX_TOOL_CHAIN_DEPTH: usize = 32;

/// At most this many overwrite annotations per writing executable.
const MAX_OVERWRITE_NOTICES_PER_EXE: u32 = 3;

/// The workflow's post step drops this file; seeing it written means the job
/// proper is done.
const POST_STEP_MARKER: &str = "post_event.json";

/// Executable at the root of every job-spawned process chain.
const JOB_RUNNER_PROCESS: &str = "Runner.Worker";

const SOURCE_EXTENSIONS: [&str; 5] = ["c", "cpp", "cs", "go", "java"];

/// Attribute-only changes are not overwrites.
const EXCLUDED_SYSCALLS: [&str; 3] = ["chmod", "unlink", "unlinkat"];

const AZURE_PLATFORM_ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(168, 63, 129, 16));

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub exe: String,
    pub argv: Vec<String>,
    /// Image of the container this process runs in, filled in lazily.
    pub container: Option<String>,
}

pub struct EventCorrelator {
    processes: RwLock<HashMap<u32, ProcessRecord>>,
    seen_connections: RwLock<HashSet<(u32, String, u16)>>,
    /// Written source file → pids that wrote it, first writer first.
    source_writers: RwLock<HashMap<String, Vec<u32>>>,
    /// Writing executable → overwrite notices emitted so far.
    overwrite_notices: RwLock<HashMap<String, u32>>,
    /// Pids whose first interesting file write has been classified.
    classified_writers: RwLock<HashSet<u32>>,
    reverse_ip: Arc<ReverseIpTable>,
    runtime: Arc<dyn ContainerRuntime>,
    telemetry: Arc<dyn TelemetrySink>,
    annotations: Arc<AnnotationWriter>,
    status_files: StatusFiles,
}

impl EventCorrelator {
    pub fn new(
        reverse_ip: Arc<ReverseIpTable>,
        runtime: Arc<dyn ContainerRuntime>,
        telemetry: Arc<dyn TelemetrySink>,
        annotations: Arc<AnnotationWriter>,
        status_files: StatusFiles,
    ) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            seen_connections: RwLock::new(HashSet::new()),
            source_writers: RwLock::new(HashMap::new()),
            overwrite_notices: RwLock::new(HashMap::new()),
            classified_writers: RwLock::new(HashSet::new()),
            reverse_ip,
            runtime,
            telemetry,
            annotations,
            status_files,
        }
    }

    pub async fn handle(&self, event: Event) {
        match event {
            Event::Network(event) => self.handle_network(event).await,
            Event::File(event) => self.handle_file(event).await,
            Event::Process(event) => self.handle_process(event),
        }
    }

    fn handle_process(&self, event: ProcessEvent) {
        self.processes
            .write()
            .entry(event.pid)
            .or_insert_with(|| ProcessRecord {
                pid: event.pid,
                ppid: event.ppid,
                exe: event.exe.clone(),
                argv: event.argv.clone(),
                container: None,
            });

        if event.euid == 0 && self.has_runner_ancestor(event.ppid) {
            tracing::info!(exe = %event.exe, pid = %event.pid, "Job process escalated to root");
            self.annotations.write(&format!(
                "Privilege escalation: `{}` ran as root",
                event.exe
            ));
        }
    }

    async fn handle_network(&self, event: NetworkEvent) {
        if is_filtered_destination(&event.addr) {
            return;
        }

        {
            let key = (event.pid, event.addr.clone(), event.port);
            if !self.seen_connections.write().insert(key) {
                return;
            }
        }

        let domain = event
            .addr
            .parse::<IpAddr>()
            .ok()
            .and_then(|addr| self.reverse_ip.lookup(addr))
            .unwrap_or_default();

        let tool = match self.container_image(event.pid).await {
            // Container workloads are attributed to their image, not a binary.
            Some(image) => Tool {
                name: image.clone(),
                sha256: image,
                parent: None,
            },
            None if !event.exe.is_empty() => self.tool_chain(event.ppid, &event.exe),
            None => Tool::unknown(),
        };

        self.telemetry
            .send_network_connection(
                &event.addr,
                &event.port.to_string(),
                &domain,
                "",
                event.timestamp,
                &tool,
            )
            .await;
    }

    async fn handle_file(&self, event: FileEvent) {
        let path = event.absolute_path();

        if path.contains(POST_STEP_MARKER) {
            tracing::info!("Post-step marker observed");
            self.status_files.write_done();
        }

        self.classify_first_write(&event, &path).await;
        self.detect_overwrite(&event, &path);
    }

    /// Reports the first interesting write per pid as a file event.
    async fn classify_first_write(&self, event: &FileEvent, path: &str) {
        if self.classified_writers.read().contains(&event.pid) {
            return;
        }

        let file_type = if path.contains("/node_modules/") && path.ends_with(".js") {
            "Dependencies"
        } else if path.contains(".git/objects") {
            "Source Code"
        } else {
            return;
        };

        let tool = self.tool_chain(event.ppid, &event.exe);
        self.telemetry
            .send_file_event(file_type, event.timestamp, &tool)
            .await;

        self.classified_writers.write().insert(event.pid);
    }

    /// Flags source files rewritten by a process other than their first
    /// writer. Bounded per executable so a crazed formatter cannot flood the
    /// annotation log.
    fn detect_overwrite(&self, event: &FileEvent, path: &str) {
        if !is_source_code_file(path) || EXCLUDED_SYSCALLS.contains(&event.syscall.as_str()) {
            return;
        }

        {
            let mut writers = self.source_writers.write();
            let writers = writers.entry(path.to_owned()).or_default();

            if writers.is_empty() {
                writers.push(event.pid);
                return;
            }

            if !writers.iter().any(|pid| *pid != event.pid) {
                return;
            }

            writers.push(event.pid);
        }

        {
            let mut notices = self.overwrite_notices.write();
            let count = notices.entry(event.exe.clone()).or_insert(0);
            if *count >= MAX_OVERWRITE_NOTICES_PER_EXE {
                return;
            }
            *count += 1;
        }

        let sha256 = proc::sha256_of(Path::new(&event.exe)).unwrap_or_default();
        self.annotations.write(&format!(
            "Source code overwritten: {path} ({}) by `{}` (sha256 {sha256})",
            event.syscall, event.exe
        ));
    }

    /// Builds the chain of programs behind `exe`, rooted at its ancestors.
    ///
    /// The chain truncates at the first ancestor that can no longer be read.
    pub fn tool_chain(&self, ppid: u32, exe: &str) -> Tool {
        let mut links = vec![tool_link(exe)];
        let mut current = ppid;

        for _ in 0..MAX_TOOL_CHAIN_DEPTH {
            if current == 0 {
                break;
            }

            let Some((parent, exe)) = self.parent_link(current) else {
                break;
            };

            links.push(tool_link(&exe));
            current = parent;
        }

        // Innermost program first, each ancestor nested as its parent.
        let mut chain: Option<Tool> = None;
        for mut link in links.into_iter().rev() {
            link.parent = chain.map(Box::new);
            chain = Some(link);
        }

        chain.expect("chain contains at least the starting executable")
    }

    /// One step up the process tree: `(parent pid, executable)`.
    ///
    /// Ancestors still alive but started before the agent (the job runner
    /// itself, most importantly) are not in the process map; the kernel
    /// never reported an exec for them, so those fall back to `/proc`.
    fn parent_link(&self, pid: u32) -> Option<(u32, String)> {
        {
            let processes = self.processes.read();
            if let Some(record) = processes.get(&pid) {
                return Some((record.ppid, record.exe.clone()));
            }
        }

        let parent = proc::parent_pid(pid).ok()?;
        let exe = proc::exe_path(pid).ok()?;

        Some((parent, exe.to_string_lossy().into_owned()))
    }

    fn has_runner_ancestor(&self, ppid: u32) -> bool {
        let mut current = ppid;

        for _ in 0..MAX_TOOL_CHAIN_DEPTH {
            if current == 0 {
                return false;
            }

            let Some((parent, exe)) = self.parent_link(current) else {
                return false;
            };

            if basename(&exe) == JOB_RUNNER_PROCESS {
                return true;
            }

            current = parent;
        }

        false
    }

    /// Image of the container `pid` runs in, if any. Cached on the process
    /// record; a host-native pid resolves to `None` cheaply via its cgroup.
    async fn container_image(&self, pid: u32) -> Option<String> {
        {
            let processes = self.processes.read();
            if let Some(image) = processes.get(&pid).and_then(|r| r.container.clone()) {
                return Some(image);
            }
        }

        let cgroup = proc::read_cgroup(pid).ok()?;
        let container_id = proc::container_id_from_cgroup(&cgroup)?;

        let image = match self.runtime.list().await {
            Ok(containers) => containers
                .iter()
                .find(|c| c.pid == pid || c.id == container_id)
                .map(|c| c.image.clone())
                // The runtime shows the first 12 id characters in its logs;
                // better than nothing when the container already exited.
                .unwrap_or_else(|| container_id.chars().take(12).collect()),
            Err(e) => {
                tracing::debug!(%pid, "Failed to list containers: {e:#}");
                container_id.chars().take(12).collect()
            }
        };

        if let Some(record) = self.processes.write().get_mut(&pid) {
            record.container = Some(image.clone());
        }

        Some(image)
    }
}

fn tool_link(exe: &str) -> Tool {
    Tool {
        name: basename(exe),
        sha256: proc::sha256_of(Path::new(exe)).unwrap_or_default(),
        parent: None,
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

fn is_source_code_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Destinations that never leave the machine or the provider fabric are not
/// egress and must not be reported.
pub fn is_filtered_destination(addr: &str) -> bool {
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return true;
    };

    match ip {
        IpAddr::V6(_) => true,
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || ip == AZURE_PLATFORM_ADDR
        }
    }
}
