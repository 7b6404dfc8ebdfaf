//! Low-level async netlink socket operations (`NETLINK_ROUTE` only).
//!
//! Meteor never touches generic netlink, netfilter or namespaces, so this
//! socket is hard-wired to the routing/TC family rather than generalized
//! over every netlink family.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::error::Result;

/// Async `NETLINK_ROUTE` socket.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    seq: AtomicU32,
    pid: u32,
}

impl NetlinkSocket {
    /// Open a new socket and bind it to get a kernel-assigned port id.
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_ROUTE)?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        // Extended ACKs are a kernel >= 4.12 feature; ignore if unsupported.
        socket.set_ext_ack(true).ok();

        let fd = AsyncFd::new(socket)?;

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
            pid,
        })
    }

    /// Allocate the next outgoing sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Local port id assigned by the kernel at bind time.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a fully-built message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram, which may itself carry several nlmsghdrs.
    pub async fn recv_msg(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(32768);
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}
