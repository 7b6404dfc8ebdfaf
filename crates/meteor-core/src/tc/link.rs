//! IFB (Intermediate Functional Block) device lifecycle.
//!
//! Create-or-reuse-by-name, with `create_ifb`/`delete_ifb` as the two
//! operations the controller needs around it.

use crate::netlink::attr::AttrIter;
use crate::netlink::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, NLMSG_HDRLEN, NlMsgType,
};
use crate::netlink::{Connection, MessageBuilder};

use super::error::{Result, TcError};

const AF_UNSPEC: u8 = 0;
const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const IFF_UP: u32 = 0x1;

/// `struct ifinfomsg` (16 bytes, no padding thanks to explicit reserved byte).
#[repr(C)]
#[derive(Clone, Copy)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    ifi_type: u16,
    index: i32,
    flags: u32,
    change: u32,
}

impl IfInfoMsg {
    fn new(index: i32, flags: u32, change: u32) -> Self {
        Self {
            family: AF_UNSPEC,
            _pad: 0,
            ifi_type: 0,
            index,
            flags,
            change,
        }
    }
}

/// Look up an interface's ifindex by name via an `RTM_GETLINK` dump.
pub async fn lookup(conn: &Connection, name: &str) -> Result<Option<u32>> {
    let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
    builder.append(&IfInfoMsg::new(0, 0, 0));

    let messages = conn.send_dump(builder).await?;
    for msg in &messages {
        let payload = &msg[NLMSG_HDRLEN.min(msg.len())..];
        if payload.len() < std::mem::size_of::<IfInfoMsg>() {
            continue;
        }
        let info = unsafe { &*(payload.as_ptr() as *const IfInfoMsg) };
        let attrs = &payload[std::mem::size_of::<IfInfoMsg>()..];
        for (attr_type, attr_payload) in AttrIter::new(attrs) {
            if attr_type == IFLA_IFNAME
                && let Ok(found) = crate::netlink::attr::get::string(attr_payload)
                && found == name
            {
                return Ok(Some(info.index as u32));
            }
        }
    }
    Ok(None)
}

/// Create the IFB device `name` if absent, idempotently reusing an
/// existing device by name and tolerating EEXIST, bring it up, and
/// return its ifindex.
pub async fn create_ifb(conn: &Connection, name: &str) -> Result<u32> {
    if let Some(ifindex) = lookup(conn, name).await? {
        set_up(conn, ifindex).await?;
        return Ok(ifindex);
    }

    let mut builder = MessageBuilder::new(
        NlMsgType::RTM_NEWLINK,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    );
    builder.append(&IfInfoMsg::new(0, 0, 0));
    builder.append_attr_str(IFLA_IFNAME, name);

    let nest = builder.nest_start(IFLA_LINKINFO);
    builder.append_attr_str(IFLA_INFO_KIND, "ifb");
    builder.nest_end(nest);

    match conn.send_ack(builder).await {
        Ok(()) => {}
        Err(e) if netlink_exists(&e) => {}
        Err(e) => return Err(TcError::kernel(format!("create ifb {name}"), e)),
    }

    let ifindex = lookup(conn, name)
        .await?
        .ok_or_else(|| TcError::InterfaceNotFound(name.to_string()))?;
    set_up(conn, ifindex).await?;
    Ok(ifindex)
}

fn netlink_exists(e: &crate::netlink::Error) -> bool {
    matches!(e, crate::netlink::Error::Kernel { errno, .. } if *errno == 17)
}

/// Bring an interface up (`IFF_UP`).
pub async fn set_up(conn: &Connection, ifindex: u32) -> Result<()> {
    let mut builder = MessageBuilder::new(NlMsgType::RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
    builder.append(&IfInfoMsg::new(ifindex as i32, IFF_UP, IFF_UP));
    conn.send_ack(builder)
        .await
        .map_err(|e| TcError::kernel(format!("bring up ifindex {ifindex}"), e))
}

/// Delete an IFB device by ifindex. Cascades all qdiscs/classes/filters on
/// it.
pub async fn delete_ifb(conn: &Connection, ifindex: u32) -> Result<()> {
    let mut builder = MessageBuilder::new(NlMsgType::RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
    builder.append(&IfInfoMsg::new(ifindex as i32, 0, 0));

    match conn.send_ack(builder).await {
        Ok(()) => Ok(()),
        Err(e) if netlink_exists_is_not_found(&e) => Ok(()),
        Err(e) => Err(TcError::kernel(format!("delete ifb index {ifindex}"), e)),
    }
}

fn netlink_exists_is_not_found(e: &crate::netlink::Error) -> bool {
    matches!(e, crate::netlink::Error::Kernel { errno, .. } if matches!(*errno, 2 | 19))
}

/// Resolve a physical interface name to an ifindex, failing loudly if it
/// does not exist (unlike IFB creation, the physical interface must
/// already be present).
pub async fn resolve_ifindex(conn: &Connection, name: &str) -> Result<u32> {
    lookup(conn, name)
        .await?
        .ok_or_else(|| TcError::InterfaceNotFound(name.to_string()))
}
