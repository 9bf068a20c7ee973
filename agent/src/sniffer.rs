//! Consumes the firewall's NFLOG mirror and reports connection attempts.
//!
//! The sniffer sees raw packets with no pid context, so attribution is the
//! `Unknown` sentinel; the audit pipeline carries the attributed view of the
//! same connections.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use etherparse::{IpNumber, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::{TelemetrySink, Tool};
use crate::config::EgressPolicy;
use crate::nflog::NfLogReader;
use crate::proxy::SINKHOLE_ADDRESS;
use crate::status::AnnotationWriter;

/// A decoded connection-initiating packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub dst: Ipv4Addr,
    pub port: u16,
    /// TCP SYN or UDP; anything else is mid-stream traffic.
    pub initiating: bool,
}

pub struct PacketSniffer {
    egress_policy: EgressPolicy,
    seen: Mutex<HashSet<Ipv4Addr>>,
    telemetry: Arc<dyn TelemetrySink>,
    annotations: Arc<AnnotationWriter>,
}

impl PacketSniffer {
    pub fn new(
        egress_policy: EgressPolicy,
        telemetry: Arc<dyn TelemetrySink>,
        annotations: Arc<AnnotationWriter>,
    ) -> Self {
        Self {
            egress_policy,
            seen: Mutex::new(HashSet::new()),
            telemetry,
            annotations,
        }
    }

    pub async fn run(&self, reader: NfLogReader, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let payloads = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = reader.recv_payloads(&mut buf) => {
                    result.context("Failed to receive netfilter log packets")?
                }
            };

            for payload in payloads {
                self.process_payload(&payload).await;
            }
        }
    }

    /// Decodes one mirrored packet and reports it if it is the first
    /// connection attempt towards its destination.
    pub async fn process_payload(&self, payload: &[u8]) {
        let Some(attempt) = decode(payload) else {
            return;
        };

        if !self.observe(attempt) {
            return;
        }

        // The kernel record carries a timestamp attribute, but it is
        // unreliable under load; wall clock it is.
        let timestamp = Utc::now();
        let status = match self.egress_policy {
            EgressPolicy::Audit => "Allowed",
            EgressPolicy::Block => "Dropped",
        };

        tracing::debug!(dst = %attempt.dst, port = %attempt.port, %status, "Connection attempt");

        self.telemetry
            .send_network_connection(
                &attempt.dst.to_string(),
                &attempt.port.to_string(),
                "",
                status,
                timestamp,
                &Tool::unknown(),
            )
            .await;

        // Sinkholed names were already annotated at resolution time.
        if self.egress_policy == EgressPolicy::Block && attempt.dst != SINKHOLE_ADDRESS {
            self.annotations.write(&format!(
                "Blocked outbound connection to {}:{}",
                attempt.dst, attempt.port
            ));
        }
    }

    /// First sighting of a destination wins; only connection-initiating
    /// packets are reported.
    fn observe(&self, attempt: ConnectionAttempt) -> bool {
        let mut seen = self.seen.lock();

        if !seen.insert(attempt.dst) {
            return false;
        }

        attempt.initiating
    }
}

/// Decodes an IPv4 packet down to its destination and protocol flags.
pub(crate) fn decode(payload: &[u8]) -> Option<ConnectionAttempt> {
    let ip = Ipv4HeaderSlice::from_slice(payload).ok()?;
    let header_len = ip.slice().len();
    let rest = payload.get(header_len..)?;

    let protocol = ip.protocol();

    if protocol == IpNumber::TCP {
        let tcp = TcpHeaderSlice::from_slice(rest).ok()?;

        Some(ConnectionAttempt {
            dst: ip.destination_addr(),
            port: tcp.destination_port(),
            initiating: tcp.syn(),
        })
    } else if protocol == IpNumber::UDP {
        let udp = UdpHeaderSlice::from_slice(rest).ok()?;

        Some(ConnectionAttempt {
            dst: ip.destination_addr(),
            port: udp.destination_port(),
            initiating: true,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{Ipv4Header, TcpHeader, UdpHeader};

    fn tcp_packet(dst: Ipv4Addr, port: u16, syn: bool) -> Vec<u8> {
        let mut tcp = TcpHeader::new(50_000, port, 1, 64_000);
        tcp.syn = syn;

        let ip = Ipv4Header::new(
            tcp.header_len() as u16,
            64,
            IpNumber::TCP,
            [10, 0, 0, 5],
            dst.octets(),
        )
        .unwrap();

        let mut packet = Vec::new();
        ip.write(&mut packet).unwrap();
        tcp.write(&mut packet).unwrap();
        packet
    }

    fn udp_packet(dst: Ipv4Addr, port: u16) -> Vec<u8> {
        let udp = UdpHeader {
            source_port: 50_000,
            destination_port: port,
            length: UdpHeader::LEN as u16,
            checksum: 0,
        };

        let ip = Ipv4Header::new(
            UdpHeader::LEN as u16,
            64,
            IpNumber::UDP,
            [10, 0, 0, 5],
            dst.octets(),
        )
        .unwrap();

        let mut packet = Vec::new();
        ip.write(&mut packet).unwrap();
        udp.write(&mut packet).unwrap();
        packet
    }

    #[test]
    fn decodes_tcp_syn() {
        let dst = Ipv4Addr::new(67, 225, 146, 248);

        let attempt = decode(&tcp_packet(dst, 443, true)).unwrap();

        assert_eq!(
            attempt,
            ConnectionAttempt {
                dst,
                port: 443,
                initiating: true
            }
        );
    }

    #[test]
    fn non_syn_tcp_is_not_initiating() {
        let attempt = decode(&tcp_packet(Ipv4Addr::new(1, 2, 3, 4), 443, false)).unwrap();

        assert!(!attempt.initiating);
    }

    #[test]
    fn decodes_udp() {
        let attempt = decode(&udp_packet(Ipv4Addr::new(8, 8, 4, 4), 123)).unwrap();

        assert!(attempt.initiating);
        assert_eq!(attempt.port, 123);
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(decode(b"not an ip packet"), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn duplicate_destinations_are_suppressed() {
        let sniffer = sniffer(EgressPolicy::Audit);
        let dst = Ipv4Addr::new(67, 225, 146, 248);

        assert!(sniffer.observe(attempt(dst, true)));
        assert!(!sniffer.observe(attempt(dst, true)));
    }

    #[test]
    fn first_sighting_must_be_initiating() {
        let sniffer = sniffer(EgressPolicy::Audit);
        let dst = Ipv4Addr::new(67, 225, 146, 248);

        // A stray non-SYN packet claims the seen-slot without reporting.
        assert!(!sniffer.observe(attempt(dst, false)));
        assert!(!sniffer.observe(attempt(dst, true)));
    }

    fn sniffer(egress_policy: EgressPolicy) -> PacketSniffer {
        let dir = tempfile::tempdir().unwrap();

        PacketSniffer::new(
            egress_policy,
            Arc::new(crate::api::NoopSink),
            Arc::new(AnnotationWriter::new(dir.path(), false)),
        )
    }

    fn attempt(dst: Ipv4Addr, initiating: bool) -> ConnectionAttempt {
        ConnectionAttempt {
            dst,
            port: 443,
            initiating,
        }
    }
}
