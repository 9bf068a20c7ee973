//! Parses kernel audit records into key→value maps.
//!
//! Record text looks like
//! `audit(1700000000.123:456): arch=c000003e syscall=42 ... exe="/usr/bin/curl" key="netmon"`.
//! Values are bare, double-quoted, or hex-encoded (the kernel hex-encodes
//! anything with untrusted characters). `SOCKADDR` records additionally get
//! their packed `saddr` decoded into synthetic `addr`/`port` fields, and
//! syscall numbers are translated so downstream consumers never see the raw
//! number.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};

pub const AUDIT_SYSCALL: u16 = 1300;
pub const AUDIT_PATH: u16 = 1302;
pub const AUDIT_SOCKADDR: u16 = 1306;
pub const AUDIT_CWD: u16 = 1307;
pub const AUDIT_EXECVE: u16 = 1309;
pub const AUDIT_EOE: u16 = 1320;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub rtype: u16,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: HashMap<String, String>,
}

pub fn parse_record(rtype: u16, text: &str) -> Option<AuditRecord> {
    let rest = text.trim().strip_prefix("audit(")?;
    let (header, rest) = rest.split_once("):")?;
    let (seconds, sequence) = header.split_once(':')?;

    let timestamp = parse_timestamp(seconds).unwrap_or_else(Utc::now);
    let sequence = sequence.parse().ok()?;

    let mut fields = parse_fields(rest);

    match rtype {
        AUDIT_SYSCALL => {
            if let Some(number) = fields.get("syscall") {
                fields.insert("syscall".to_owned(), syscall_name(number));
            }
        }
        AUDIT_SOCKADDR => {
            if let Some((addr, port)) = fields.get("saddr").and_then(|s| decode_sockaddr(s)) {
                fields.insert("addr".to_owned(), addr.to_string());
                fields.insert("port".to_owned(), port.to_string());
            }
        }
        AUDIT_EXECVE => {
            // Arguments with shell metacharacters or spaces arrive
            // hex-encoded and unquoted.
            for (key, value) in fields.iter_mut() {
                if is_argument_key(key)
                    && let Some(decoded) = decode_hex_string(value)
                {
                    *value = decoded;
                }
            }
        }
        _ => {}
    }

    Some(AuditRecord {
        rtype,
        sequence,
        timestamp,
        fields,
    })
}

fn parse_timestamp(seconds: &str) -> Option<DateTime<Utc>> {
    let (secs, millis) = seconds.split_once('.')?;

    DateTime::from_timestamp(secs.parse().ok()?, millis.parse::<u32>().ok()? * 1_000_000)
}

/// Splits `k1=v1 k2="v 2" k3=v3` into a map, honouring double quotes.
fn parse_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = text.trim_start();

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_owned();
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let value = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or("");
            value
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            let value = &rest[..end];
            rest = rest.get(end..).unwrap_or("");
            value
        };

        if !key.is_empty() && !key.contains(' ') {
            fields.insert(key, value.to_owned());
        }

        rest = rest.trim_start();
    }

    fields
}

/// `argc` counts them; `a0`, `a1`, … carry them.
fn is_argument_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix('a') else {
        return false;
    };

    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

/// The kernel hex-encodes values it cannot print verbatim. Even length and
/// uppercase hex digits distinguish them from ordinary values.
fn decode_hex_string(value: &str) -> Option<String> {
    if value.is_empty()
        || value.len() % 2 != 0
        || !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
    {
        return None;
    }

    let bytes = hex::decode(value).ok()?;

    String::from_utf8(bytes).ok()
}

/// Unpacks a `struct sockaddr` captured at `connect(2)` time.
pub fn decode_sockaddr(hex_value: &str) -> Option<(IpAddr, u16)> {
    let bytes = hex::decode(hex_value.to_ascii_lowercase()).ok()?;

    let family = u16::from_le_bytes(bytes.get(0..2)?.try_into().ok()?);
    let port = u16::from_be_bytes(bytes.get(2..4)?.try_into().ok()?);

    let addr = match family {
        AF_INET => {
            let octets: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        AF_INET6 => {
            // sockaddr_in6: family, port, flowinfo (4), address (16).
            let octets: [u8; 16] = bytes.get(8..24)?.try_into().ok()?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some((addr, port))
}

/// x86-64 numbers for the syscalls our audit rules can produce.
fn syscall_name(number: &str) -> String {
    match number {
        "2" => "open",
        "42" => "connect",
        "59" => "execve",
        "76" => "truncate",
        "77" => "ftruncate",
        "82" => "rename",
        "85" => "creat",
        "86" => "link",
        "87" => "unlink",
        "88" => "symlink",
        "90" => "chmod",
        "91" => "fchmod",
        "133" => "mknod",
        "257" => "openat",
        "263" => "unlinkat",
        "264" => "renameat",
        "266" => "symlinkat",
        "268" => "fchmodat",
        "316" => "renameat2",
        "437" => "openat2",
        _ => return number.to_owned(),
    }
    .to_owned()
}
