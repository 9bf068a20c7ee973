//! Events produced by the kernel audit stream, after reassembly.

use chrono::{DateTime, Utc};

/// Rule keys the agent attaches when installing its audit rules; they come
/// back on every matching record and classify the event.
pub const NET_MONITOR_TAG: &str = "netmon";
pub const FILE_MONITOR_TAG: &str = "filemon";
pub const PROCESS_MONITOR_TAG: &str = "procmon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Network(NetworkEvent),
    File(FileEvent),
    Process(ProcessEvent),
}

/// A `connect(2)` observed by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub pid: u32,
    pub ppid: u32,
    pub exe: String,
    /// Destination address as text; may be IPv4 or IPv6.
    pub addr: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
}

/// A write or attribute change under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub pid: u32,
    pub ppid: u32,
    pub exe: String,
    /// Working directory of the writing process.
    pub cwd: String,
    /// File name as reported by the kernel; may be relative to `cwd`.
    pub name: String,
    pub syscall: String,
    pub timestamp: DateTime<Utc>,
}

/// An `execve(2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub pid: u32,
    pub ppid: u32,
    pub exe: String,
    pub argv: Vec<String>,
    pub euid: u32,
    pub cwd: String,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// Absolute path of the written file.
    pub fn absolute_path(&self) -> String {
        if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), self.name)
        }
    }
}
