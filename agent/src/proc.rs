//! `/proc` lookups used for attribution of short- and long-lived processes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use sha2::{Digest as _, Sha256};

pub fn parent_pid(pid: u32) -> Result<u32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
        .with_context(|| format!("Failed to read stat for pid {pid}"))?;

    parse_stat_ppid(&stat).with_context(|| format!("Malformed stat for pid {pid}"))
}

pub fn exe_path(pid: u32) -> Result<PathBuf> {
    fs::read_link(format!("/proc/{pid}/exe"))
        .with_context(|| format!("Failed to read exe link for pid {pid}"))
}

pub fn read_cgroup(pid: u32) -> Result<String> {
    fs::read_to_string(format!("/proc/{pid}/cgroup"))
        .with_context(|| format!("Failed to read cgroup for pid {pid}"))
}

/// The ppid is field 4 of `/proc/<pid>/stat`, but the comm field before it
/// is parenthesised and may itself contain spaces and parentheses, so parse
/// from after the *last* closing parenthesis.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];

    // after_comm = " <state> <ppid> <pgrp> ..."
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_of(path: &Path) -> Result<String> {
    let contents =
        fs::read(path).with_context(|| format!("Failed to read `{}`", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);

    Ok(hex::encode(hasher.finalize()))
}

/// Extracts a container id from `/proc/<pid>/cgroup` content.
///
/// Only the memory controller line is considered; the id sits under one of
/// the runtime's known path prefixes. A pid without any such line is
/// host-native.
pub fn container_id_from_cgroup(content: &str) -> Option<String> {
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let _hierarchy = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;

        if controllers != "memory" {
            continue;
        }

        let segments = path.split('/').collect::<Vec<_>>();
        match segments.as_slice() {
            ["", "actions_job", id, ..] if !id.is_empty() => return Some((*id).to_owned()),
            ["", "docker", "buildx", id, ..] if !id.is_empty() => return Some((*id).to_owned()),
            _ => continue,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_survives_hostile_comm_names() {
        let stat = "1234 (weird name) with spaces)) S 987 1234 1234 0 -1 4194560 1secret";

        assert_eq!(parse_stat_ppid(stat), Some(987));
    }

    #[test]
    fn plain_stat_line() {
        let stat = "42 (bash) S 1 42 42 34816 42 4194304";

        assert_eq!(parse_stat_ppid(stat), Some(1));
    }

    #[test]
    fn garbage_stat_is_rejected() {
        assert_eq!(parse_stat_ppid("no parens here"), None);
        assert_eq!(parse_stat_ppid("1 (x)"), None);
    }

    #[test]
    fn actions_job_container_id() {
        let cgroup = "12:pids:/init.scope\n\
                      4:memory:/actions_job/0e3bdbb6a4ba6ba96c93a0e9a1770a35dfa934b43ef861a5db\n\
                      1:cpu:/";

        assert_eq!(
            container_id_from_cgroup(cgroup).as_deref(),
            Some("0e3bdbb6a4ba6ba96c93a0e9a1770a35dfa934b43ef861a5db")
        );
    }

    #[test]
    fn buildx_container_id() {
        let cgroup = "4:memory:/docker/buildx/f00dfeed";

        assert_eq!(container_id_from_cgroup(cgroup).as_deref(), Some("f00dfeed"));
    }

    #[test]
    fn host_native_pid_has_no_container() {
        let cgroup = "4:memory:/user.slice/user-1000.slice\n3:cpu:/";

        assert_eq!(container_id_from_cgroup(cgroup), None);
    }

    #[test]
    fn sha256_of_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            sha256_of(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
