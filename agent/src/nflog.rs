//! Receives packets mirrored by the firewall's NFLOG rules.
//!
//! Speaks the nfnetlink_log protocol directly: bind to the address family,
//! bind to the log group, request full-packet copies, then read packet
//! notifications and pull out the raw IP payload attribute.

use std::io;

use anyhow::{Context as _, Result};
use nix::sys::socket::SockProtocol;

use crate::netlink::{self, NetlinkSocket};

const NFNL_SUBSYS_ULOG: u16 = 4;
const NFNETLINK_V0: u8 = 0;

const NFULNL_MSG_PACKET: u16 = 0;
const NFULNL_MSG_CONFIG: u16 = 1;

const NFULNL_CFG_CMD_BIND: u8 = 1;
const NFULNL_CFG_CMD_PF_BIND: u8 = 3;
const NFULNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;

const NFULNL_COPY_PACKET: u8 = 2;

/// Attribute carrying the copied packet, starting at the IP header.
const NFULA_PAYLOAD: u16 = 9;

/// How much of each packet the kernel copies to us. Headers are all we
/// decode, but the rule already limits traffic to connection-initiating
/// packets, so copying generously is cheap.
const COPY_RANGE: u32 = 0xffff;

pub struct NfLogReader {
    socket: NetlinkSocket,
}

impl NfLogReader {
    /// Binds to the given netfilter log group.
    pub fn bind(group: u16) -> Result<Self> {
        let socket = NetlinkSocket::open(SockProtocol::NetlinkNetFilter)
            .context("Failed to open netfilter-log socket")?;

        // A stale binding from a crashed consumer would starve us, so detach
        // the address family first.
        socket.send(&config_message(0, &cfg_cmd(NFULNL_CFG_CMD_PF_UNBIND)))?;
        socket.send(&config_message(0, &cfg_cmd(NFULNL_CFG_CMD_PF_BIND)))?;
        socket.send(&config_message(group, &cfg_cmd(NFULNL_CFG_CMD_BIND)))?;
        socket.send(&config_message(group, &cfg_mode()))?;

        tracing::debug!(%group, "Listening for netfilter log packets");

        Ok(Self { socket })
    }

    /// Waits for the next batch of mirrored packets and returns their raw
    /// IP payloads.
    pub async fn recv_payloads(&self, buf: &mut [u8]) -> io::Result<Vec<Vec<u8>>> {
        let len = self.socket.recv(buf).await?;

        Ok(packet_payloads(&buf[..len]))
    }
}

fn config_message(group: u16, attr: &[u8]) -> Vec<u8> {
    // nfgenmsg: family, version, resource id (the group, big-endian).
    let mut payload = vec![libc::AF_INET as u8, NFNETLINK_V0];
    payload.extend_from_slice(&group.to_be_bytes());
    payload.extend_from_slice(attr);

    netlink::message(
        (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_CONFIG,
        libc::NLM_F_REQUEST as u16,
        &payload,
    )
}

fn cfg_cmd(command: u8) -> Vec<u8> {
    netlink::attr(NFULA_CFG_CMD, &[command])
}

fn cfg_mode() -> Vec<u8> {
    // nfulnl_msg_config_mode: copy range (big-endian), copy mode, padding.
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&COPY_RANGE.to_be_bytes());
    payload.push(NFULNL_COPY_PACKET);
    payload.push(0);

    netlink::attr(NFULA_CFG_MODE, &payload)
}

/// Extracts the packet payloads from the messages in one datagram.
pub(crate) fn packet_payloads(datagram: &[u8]) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();

    for (msg_type, message) in netlink::messages(datagram) {
        if msg_type != (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET {
            continue;
        }

        // Skip the nfgenmsg preamble; attributes follow it.
        let Some(attributes) = message.get(4..) else {
            continue;
        };

        for (atype, value) in netlink::attrs(attributes) {
            if atype == NFULA_PAYLOAD {
                payloads.push(value.to_vec());
            }
        }
    }

    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_message(payload: &[u8]) -> Vec<u8> {
        let mut body = vec![libc::AF_INET as u8, NFNETLINK_V0, 0, 100];
        body.extend_from_slice(&netlink::attr(NFULA_PAYLOAD, payload));

        netlink::message((NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET, 0, &body)
    }

    #[test]
    fn extracts_payload_attribute() {
        let datagram = packet_message(b"ip packet bytes");

        assert_eq!(packet_payloads(&datagram), vec![b"ip packet bytes".to_vec()]);
    }

    #[test]
    fn ignores_unrelated_messages() {
        let mut datagram = netlink::message(2, 0, &[0; 4]); // NLMSG_ERROR
        datagram.extend_from_slice(&packet_message(b"pkt"));

        assert_eq!(packet_payloads(&datagram), vec![b"pkt".to_vec()]);
    }

    #[test]
    fn skips_non_payload_attributes() {
        let mut body = vec![libc::AF_INET as u8, NFNETLINK_V0, 0, 100];
        body.extend_from_slice(&netlink::attr(1, &[0; 4])); // packet header
        body.extend_from_slice(&netlink::attr(NFULA_PAYLOAD, b"pkt"));
        let datagram =
            netlink::message((NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET, 0, &body);

        assert_eq!(packet_payloads(&datagram), vec![b"pkt".to_vec()]);
    }
}
