//! Just enough netlink to talk to the kernel's netfilter-log and audit
//! facilities: a non-blocking socket driven by tokio's [`AsyncFd`], plus
//! message and attribute framing.
//!
//! All header fields are native-endian, per the netlink ABI.

use std::io;
use std::os::fd::{AsRawFd as _, OwnedFd};

use anyhow::{Context as _, Result};
use nix::sys::socket::{
    self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;

const NLMSG_HEADER_LEN: usize = 16;
const NLA_HEADER_LEN: usize = 4;

/// Attribute type bits above this mask carry flags, not the type.
const NLA_TYPE_MASK: u16 = 0x7fff;

pub struct NetlinkSocket {
    fd: AsyncFd<OwnedFd>,
}

impl NetlinkSocket {
    pub fn open(protocol: SockProtocol) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            protocol,
        )
        .context("Failed to open netlink socket")?;

        socket::bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))
            .context("Failed to bind netlink socket")?;

        let fd = AsyncFd::new(fd).context("Failed to register netlink socket with the reactor")?;

        Ok(Self { fd })
    }

    /// Sends a single message to the kernel.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        socket::sendto(
            self.fd.get_ref().as_raw_fd(),
            message,
            &NetlinkAddr::new(0, 0),
            MsgFlags::empty(),
        )
        .context("Failed to send netlink message")?;

        Ok(())
    }

    /// Receives one datagram; it may contain multiple netlink messages.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| {
                socket::recv(inner.get_ref().as_raw_fd(), buf, MsgFlags::empty())
                    .map_err(io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Builds a netlink message: header with the given type and flags, then the
/// payload, padded to the 4-byte message boundary.
pub fn message(msg_type: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
    let len = NLMSG_HEADER_LEN + payload.len();

    let mut buf = Vec::with_capacity(align4(len));
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // sequence
    buf.extend_from_slice(&0u32.to_ne_bytes()); // port id
    buf.extend_from_slice(payload);
    buf.resize(align4(len), 0);

    buf
}

/// Iterates the netlink messages in a received datagram as
/// `(message type, payload)` pairs. Truncated trailing data is dropped.
pub fn messages(datagram: &[u8]) -> MessageIter<'_> {
    MessageIter { rest: datagram }
}

pub struct MessageIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < NLMSG_HEADER_LEN {
            return None;
        }

        let len = u32::from_ne_bytes(self.rest[0..4].try_into().ok()?) as usize;
        let msg_type = u16::from_ne_bytes(self.rest[4..6].try_into().ok()?);

        if len < NLMSG_HEADER_LEN || len > self.rest.len() {
            return None;
        }

        let payload = &self.rest[NLMSG_HEADER_LEN..len];
        self.rest = &self.rest[align4(len).min(self.rest.len())..];

        Some((msg_type, payload))
    }
}

/// Builds a netlink attribute: 4-byte header, payload, padding.
pub fn attr(atype: u16, payload: &[u8]) -> Vec<u8> {
    let len = NLA_HEADER_LEN + payload.len();

    let mut buf = Vec::with_capacity(align4(len));
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&atype.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align4(len), 0);

    buf
}

/// Iterates the attributes in a message payload as `(type, value)` pairs.
pub fn attrs(payload: &[u8]) -> AttrIter<'_> {
    AttrIter { rest: payload }
}

pub struct AttrIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < NLA_HEADER_LEN {
            return None;
        }

        let len = u16::from_ne_bytes(self.rest[0..2].try_into().ok()?) as usize;
        let atype = u16::from_ne_bytes(self.rest[2..4].try_into().ok()?) & NLA_TYPE_MASK;

        if len < NLA_HEADER_LEN || len > self.rest.len() {
            return None;
        }

        let value = &self.rest[NLA_HEADER_LEN..len];
        self.rest = &self.rest[align4(len).min(self.rest.len())..];

        Some((atype, value))
    }
}

pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let one = message(0x0400, 0, b"abcde");
        let two = message(0x0401, 0, b"xy");

        let datagram = [one, two].concat();

        let parsed = messages(&datagram).collect::<Vec<_>>();
        assert_eq!(parsed, vec![(0x0400, &b"abcde"[..]), (0x0401, &b"xy"[..])]);
    }

    #[test]
    fn attr_roundtrip_with_padding() {
        let payload = [attr(1, b"abc"), attr(9, b"payload!")].concat();

        let parsed = attrs(&payload).collect::<Vec<_>>();
        assert_eq!(parsed, vec![(1, &b"abc"[..]), (9, &b"payload!"[..])]);
    }

    #[test]
    fn flag_bits_are_masked_off_attribute_types() {
        let mut nested = attr(2, b"zz");
        nested[2..4].copy_from_slice(&(2u16 | 0x8000).to_ne_bytes());

        let parsed = attrs(&nested).collect::<Vec<_>>();
        assert_eq!(parsed, vec![(2, &b"zz"[..])]);
    }

    #[test]
    fn truncated_data_is_dropped() {
        let mut datagram = message(0x0400, 0, b"abcde");
        datagram.truncate(datagram.len() - 2);

        assert_eq!(messages(&datagram).count(), 0);
    }
}
