//! High-level netlink connection: request/response and ACK handling.

use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{MessageIter, NlMsgError, NlMsgHdr};
use super::socket::NetlinkSocket;

/// A single `NETLINK_ROUTE` connection.
///
/// Meteor opens exactly one of these per process (the scenario player or
/// the live daemon) and funnels every qdisc/class/filter mutation through
/// it: `send_request`, then `send_ack` or `send_dump` depending on what
/// the caller expects back.
pub struct Connection {
    socket: NetlinkSocket,
}

impl Connection {
    /// Open a new connection.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new()?,
        })
    }

    /// Send a request and wait for a single ACK (no payload expected back).
    pub async fn send_ack(&self, mut builder: MessageBuilder) -> Result<()> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        let msg = builder.finish();
        self.socket.send(&msg).await?;

        let response = self.socket.recv_msg().await?;
        Self::process_ack(&response, seq)
    }

    /// Send a dump request (`NLM_F_DUMP`) and collect every reply message
    /// until the kernel signals `NLMSG_DONE`.
    pub async fn send_dump(&self, mut builder: MessageBuilder) -> Result<Vec<Vec<u8>>> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        let msg = builder.finish();
        self.socket.send(&msg).await?;

        let mut responses = Vec::new();
        loop {
            let data = self.socket.recv_msg().await?;
            let mut done = false;

            for result in MessageIter::new(&data) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(Error::from_errno(err.error));
                    }
                }
                if header.is_done() {
                    done = true;
                    break;
                }

                let msg_len = header.nlmsg_len as usize;
                let msg_start = payload.as_ptr() as usize
                    - data.as_ptr() as usize
                    - std::mem::size_of::<NlMsgHdr>();
                if msg_start + msg_len <= data.len() {
                    responses.push(data[msg_start..msg_start + msg_len].to_vec());
                }
            }

            if done {
                break;
            }
        }

        Ok(responses)
    }

    fn process_ack(data: &[u8], expected_seq: u32) -> Result<()> {
        for result in MessageIter::new(data) {
            let (header, payload) = result?;
            if header.nlmsg_seq != expected_seq {
                continue;
            }
            if header.is_error() {
                let err = NlMsgError::from_bytes(payload)?;
                if !err.is_ack() {
                    return Err(Error::from_errno(err.error));
                }
                return Ok(());
            }
        }
        Err(Error::InvalidMessage("expected ACK message".into()))
    }
}
