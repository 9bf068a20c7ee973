//! The observation side: mirrored packets through the sniffer, and audit
//! records through the assembler and correlator.

#![allow(clippy::unwrap_used)]

mod support;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use etherparse::{IpNumber, Ipv4Header, TcpHeader};
use gatehouse_agent::audit::{Assembler, parse};
use gatehouse_agent::config::EgressPolicy;
use gatehouse_agent::container::{ContainerInfo, ContainerRuntime};
use gatehouse_agent::correlator::EventCorrelator;
use gatehouse_agent::proxy::{ReverseIpTable, SINKHOLE_ADDRESS};
use gatehouse_agent::sniffer::PacketSniffer;
use gatehouse_agent::status::{ANNOTATION_FILE_NAME, AnnotationWriter, StatusFiles};

use support::RecordingSink;

fn syn_packet(dst: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut tcp = TcpHeader::new(50_000, port, 1, 64_000);
    tcp.syn = true;

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

/// Audit scenario: the first SYN towards a destination is reported with
/// status "Allowed" and sentinel attribution.
#[tokio::test]
async fn sniffer_reports_first_syn_as_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let sniffer = PacketSniffer::new(
        EgressPolicy::Audit,
        sink.clone(),
        Arc::new(AnnotationWriter::new(dir.path(), false)),
    );

    let dst = Ipv4Addr::new(67, 225, 146, 248);
    sniffer.process_payload(&syn_packet(dst, 443)).await;
    sniffer.process_payload(&syn_packet(dst, 443)).await;

    let connections = sink.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].addr, "67.225.146.248");
    assert_eq!(connections[0].port, "443");
    assert_eq!(connections[0].status, "Allowed");
    assert_eq!(connections[0].tool.name, "Unknown");

    // Audit mode never annotates.
    assert!(!dir.path().join(ANNOTATION_FILE_NAME).exists());
}

/// Block scenario: drops are annotated, except towards the sinkhole (those
/// were already annotated at resolution time).
#[tokio::test]
async fn sniffer_annotates_drops_except_sinkhole() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let sniffer = PacketSniffer::new(
        EgressPolicy::Block,
        sink.clone(),
        Arc::new(AnnotationWriter::new(dir.path(), false)),
    );

    sniffer
        .process_payload(&syn_packet(SINKHOLE_ADDRESS, 443))
        .await;
    sniffer
        .process_payload(&syn_packet(Ipv4Addr::new(203, 0, 113, 9), 8443))
        .await;

    let connections = sink.connections();
    assert_eq!(connections.len(), 2);
    assert!(connections.iter().all(|c| c.status == "Dropped"));

    let annotations = std::fs::read_to_string(dir.path().join(ANNOTATION_FILE_NAME)).unwrap();
    assert!(annotations.contains("203.0.113.9:8443"));
    assert!(!annotations.contains(&SINKHOLE_ADDRESS.to_string()));
}

struct NoContainers;

#[async_trait]
impl ContainerRuntime for NoContainers {
    async fn list(&self) -> Result<Vec<ContainerInfo>> {
        Ok(Vec::new())
    }
}

/// The full audit pipeline: raw records in, attributed telemetry out, with
/// the destination annotated from the proxy's reverse-IP table.
#[tokio::test]
async fn audit_records_become_attributed_connections() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let reverse_ip = Arc::new(ReverseIpTable::default());
    reverse_ip.insert(IpAddr::from(Ipv4Addr::new(67, 225, 146, 248)), "test.com.");

    let correlator = EventCorrelator::new(
        reverse_ip,
        Arc::new(NoContainers),
        sink.clone(),
        Arc::new(AnnotationWriter::new(dir.path(), false)),
        StatusFiles::new(dir.path()),
    );

    let mut assembler = Assembler::default();
    let records = [
        (
            parse::AUDIT_SYSCALL,
            r#"audit(1700000000.100:41): syscall=42 pid=4321 ppid=4000 euid=1001 exe="/usr/bin/curl" key="netmon""#,
        ),
        (
            parse::AUDIT_SOCKADDR,
            "audit(1700000000.100:41): saddr=020001BB43E192F80000000000000000",
        ),
    ];

    for (rtype, text) in records {
        if let Some(event) = assembler.ingest(parse::parse_record(rtype, text).unwrap()) {
            correlator.handle(event).await;
        }
    }

    let connections = sink.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].addr, "67.225.146.248");
    assert_eq!(connections[0].domain, "test.com.");
    assert_eq!(connections[0].tool.name, "curl");
    // Correlator events carry no allow/drop verdict.
    assert_eq!(connections[0].status, "");
}

/// Destinations inside the machine or the provider fabric never become
/// telemetry.
#[tokio::test]
async fn private_destinations_are_never_reported() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let correlator = EventCorrelator::new(
        Arc::new(ReverseIpTable::default()),
        Arc::new(NoContainers),
        sink.clone(),
        Arc::new(AnnotationWriter::new(dir.path(), false)),
        StatusFiles::new(dir.path()),
    );

    let mut assembler = Assembler::default();
    for (sequence, saddr) in [
        (50, "0200005A0A0000050000000000000000"),   // 10.0.0.5
        (51, "020000357F0000010000000000000000"),   // 127.0.0.1
        (52, "02000050A9FEA9FE0000000000000000"),   // 169.254.169.254
    ] {
        let records = [
            (
                parse::AUDIT_SYSCALL,
                format!(
                    r#"audit(1700000000.100:{sequence}): syscall=42 pid=1 exe="/bin/nc" key="netmon""#
                ),
            ),
            (
                parse::AUDIT_SOCKADDR,
                format!("audit(1700000000.100:{sequence}): saddr={saddr}"),
            ),
        ];

        for (rtype, text) in records {
            if let Some(event) = assembler.ingest(parse::parse_record(rtype, &text).unwrap()) {
                correlator.handle(event).await;
            }
        }
    }

    assert!(sink.connections().is_empty());
}

/// The same (pid, addr, port) is reported once.
#[tokio::test]
async fn duplicate_connections_are_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let correlator = EventCorrelator::new(
        Arc::new(ReverseIpTable::default()),
        Arc::new(NoContainers),
        sink.clone(),
        Arc::new(AnnotationWriter::new(dir.path(), false)),
        StatusFiles::new(dir.path()),
    );

    let mut assembler = Assembler::default();
    for sequence in [60, 61] {
        let records = [
            (
                parse::AUDIT_SYSCALL,
                format!(
                    r#"audit(1700000000.100:{sequence}): syscall=42 pid=4321 exe="/usr/bin/curl" key="netmon""#
                ),
            ),
            (
                parse::AUDIT_SOCKADDR,
                format!("audit(1700000000.100:{sequence}): saddr=020001BB43E192F80000000000000000"),
            ),
        ];

        for (rtype, text) in records {
            if let Some(event) = assembler.ingest(parse::parse_record(rtype, &text).unwrap()) {
                correlator.handle(event).await;
            }
        }
    }

    assert_eq!(sink.connections().len(), 1);
}
