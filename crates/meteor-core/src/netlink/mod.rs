//! Minimal async `NETLINK_ROUTE` plumbing.
//!
//! Meteor only ever issues qdisc/class/filter/link mutations, so this is a
//! small slice of a full rtnetlink implementation: message framing
//! (`message`), attribute encode/decode (`attr`), a byte-buffer builder
//! (`builder`), the socket itself (`socket`) and a request/ACK/dump-capable
//! connection (`connection`). The [`crate::tc`] module builds the actual
//! qdisc/class/filter messages on top of these primitives.

pub mod attr;
pub mod builder;
pub mod connection;
pub mod error;
pub mod message;
pub mod socket;

pub use attr::{AttrIter, NlAttr};
pub use builder::{MessageBuilder, NestToken};
pub use connection::Connection;
pub use error::{Error, Result};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgHdr, NlMsgType};
pub use socket::NetlinkSocket;
