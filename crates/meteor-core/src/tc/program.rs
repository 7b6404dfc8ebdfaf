//! The TC Programmer: qdisc/class/filter operations over rtnetlink.
//!
//! Narrowed down to the three kinds and one classifier shape Meteor
//! actually needs: `ingress`/`htb`/`netem` qdiscs, HTB classes, and u32
//! filters carrying either a `classify` or a `mirred` redirect action.
//! Message construction follows the same `MessageBuilder` nesting as the
//! rest of this crate's TC action/filter builders; the packed wire structs
//! (`TcHtbOpt`, `TcNetemQopt`, `TcU32Sel`/`TcU32Key`, `TcMirred`) mirror the
//! kernel ABI directly.

use std::net::Ipv4Addr;

use crate::netlink::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgType,
};
use crate::netlink::{Connection, MessageBuilder};

use super::error::{Result, TcError};
use super::units;

const AF_UNSPEC: u8 = 0;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_ALL: u16 = 0x0003;

/// `struct tcmsg`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcMsg {
    family: u8,
    _pad1: u8,
    _pad2: u16,
    ifindex: i32,
    handle: u32,
    parent: u32,
    info: u32,
}

impl TcMsg {
    fn new(ifindex: u32, handle: u32, parent: u32, info: u32) -> Self {
        Self {
            family: AF_UNSPEC,
            _pad1: 0,
            _pad2: 0,
            ifindex: ifindex as i32,
            handle,
            parent,
            info,
        }
    }
}

/// Handle helpers (`major:minor` encoding every TC handle uses).
pub mod handle {
    /// `TC_H_ROOT`: parent of a root qdisc.
    pub const ROOT: u32 = 0xFFFF_FFFF;
    /// `TC_H_INGRESS`: parent given when creating the ingress qdisc itself.
    pub const INGRESS_PARENT: u32 = 0xFFFF_FFF1;
    /// The ingress qdisc's own handle (`ffff:0`), used as the parent of
    /// filters attached to it.
    pub const INGRESS: u32 = 0xFFFF_0000;

    /// Build a `major:minor` handle.
    pub const fn make(major: u16, minor: u16) -> u32 {
        ((major as u32) << 16) | (minor as u32)
    }
}

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;

// --- HTB --------------------------------------------------------------

const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_RATE64: u16 = 6;
const TCA_HTB_CEIL64: u16 = 7;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcRateSpec {
    cell_log: u8,
    linklayer: u8,
    overhead: u16,
    cell_align: i16,
    mpu: u16,
    rate: u32,
}

impl TcRateSpec {
    fn capped(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: rate_bytes_per_sec.min(u32::MAX as u64) as u32,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcHtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcHtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

/// HTB class rate/ceiling, already in bits/s (converted to bytes/s here).
#[derive(Debug, Clone, Copy)]
pub struct HtbClassOpts {
    pub rate_bits_per_sec: f32,
    pub ceil_bits_per_sec: f32,
}

impl HtbClassOpts {
    pub fn uniform(bits_per_sec: f32) -> Self {
        Self {
            rate_bits_per_sec: bits_per_sec,
            ceil_bits_per_sec: bits_per_sec,
        }
    }
}

// --- netem --------------------------------------------------------------

const TCA_NETEM_UNSPEC: u16 = 0;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcNetemQopt {
    latency: u32,
    limit: u32,
    loss: u32,
    gap: u32,
    duplicate: u32,
    jitter: u32,
}

/// Netem leaf parameters in kernel units (already converted).
#[derive(Debug, Clone, Copy)]
pub struct NetemOpts {
    pub delay_micros: u32,
    pub loss_probability: u32,
    pub limit_packets: u32,
}

impl NetemOpts {
    /// The default slot installed for a freshly-added peer:
    /// no delay, 100% loss.
    pub fn drop_all() -> Self {
        Self {
            delay_micros: 0,
            loss_probability: u32::MAX,
            limit_packets: 1000,
        }
    }
}

// --- u32 filter + mirred/classify actions --------------------------------

const TCA_U32_CLASSID: u16 = 1;
const TCA_U32_SEL: u16 = 5;
const TCA_U32_ACT: u16 = 7;

const TC_U32_TERMINAL: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcU32Sel {
    flags: u8,
    offshift: u8,
    nkeys: u8,
    _pad: u8,
    offmask: u16,
    off: u16,
    offoff: i16,
    hoff: i16,
    hmask: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcU32Key {
    mask: u32,
    val: u32,
    off: i32,
    offmask: i32,
}

/// One u32 selector key: `(value, mask, offset, off_mask)`, network byte
/// order.
#[derive(Debug, Clone, Copy)]
pub struct U32Key {
    pub value: u32,
    pub mask: u32,
    pub offset: i32,
    pub off_mask: i32,
}

impl U32Key {
    /// Match-everything key, used for the physical interface's ingress
    /// mirror-to-IFB filter.
    pub fn match_all() -> Self {
        Self {
            value: 0,
            mask: 0,
            offset: 0,
            off_mask: 0,
        }
    }

    /// IPv4 source address match: `(addr, mask, offset=12, 0)`.
    pub fn ipv4_src(addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            value: u32::from_be_bytes(addr.octets()),
            mask: units::prefix_to_mask(prefix),
            offset: 12,
            off_mask: 0,
        }
    }

    /// Ethernet source MAC match, the high 32 bits at offset `-8` from the
    /// classifier anchor.
    pub fn eth_src_high(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&mac[0..4]);
        Self {
            value: u32::from_be_bytes(bytes),
            mask: 0xFFFF_FFFF,
            offset: -8,
            off_mask: 0,
        }
    }

    /// Ethernet source MAC match, the low 16 bits (padded) at offset `-4`.
    pub fn eth_src_low(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; 4];
        bytes[0] = mac[4];
        bytes[1] = mac[5];
        Self {
            value: u32::from_be_bytes(bytes),
            mask: 0xFFFF_0000,
            offset: -4,
            off_mask: 0,
        }
    }
}

/// What a u32 filter does once its keys match.
#[derive(Debug, Clone, Copy)]
pub enum FilterAction {
    /// Classify directly into an HTB class (terminal match).
    Classify(u32),
    /// `mirred egress redirect` to another interface (ingress mirror).
    MirredRedirect(u32),
}

const TCA_ACT_KIND: u16 = 1;
const TCA_ACT_OPTIONS: u16 = 2;
const TCA_MIRRED_PARMS: u16 = 2;
const TCA_EGRESS_REDIR: i32 = 1;
const TC_ACT_STOLEN: i32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcGen {
    index: u32,
    capab: u32,
    action: i32,
    refcnt: i32,
    bindcnt: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct TcMirred {
    gen: TcGen,
    eaction: i32,
    ifindex: u32,
}

/// Which per-peer field a classifier matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ip,
    Mac,
}

/// A peer's identifying addresses, enough to build either classifier kind.
/// Decoupled from [`crate::topology::NodeEntry`] so this module has no
/// dependency on topology parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddress {
    pub ipv4: Option<(Ipv4Addr, u8)>,
    pub mac: Option<[u8; 6]>,
}

impl PeerAddress {
    /// Build the key set a u32 filter needs to match this peer under the
    /// given mode, failing if the topology lacks the needed field.
    fn keys(&self, mode: Mode) -> Result<Vec<U32Key>> {
        match mode {
            Mode::Ip => {
                let (addr, prefix) = self
                    .ipv4
                    .ok_or_else(|| TcError::InterfaceNotFound("peer has no ipv4 address".into()))?;
                Ok(vec![U32Key::ipv4_src(addr, prefix)])
            }
            Mode::Mac => {
                let mac = self
                    .mac
                    .ok_or_else(|| TcError::InterfaceNotFound("peer has no MAC address".into()))?;
                Ok(vec![U32Key::eth_src_high(mac), U32Key::eth_src_low(mac)])
            }
        }
    }
}

/// Link quality in the units the rest of the system works in: bandwidth in
/// bits/s, delay in seconds, loss as a fraction in `[0,1]`. Unit crossing
/// into kernel units (bytes/s, microseconds, `2^32`-scaled probability)
/// happens exactly once, inside this module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkShape {
    pub bandwidth_bits_per_sec: f32,
    pub delay_seconds: f32,
    pub loss_fraction: f64,
}

impl LinkShape {
    /// The slot a peer gets on creation, before any scenario record has
    /// applied to it: full default bandwidth, no delay, 100% loss.
    pub fn default_slot(default_bandwidth_bits_per_sec: f32) -> Self {
        Self {
            bandwidth_bits_per_sec: default_bandwidth_bits_per_sec,
            delay_seconds: 0.0,
            loss_fraction: 1.0,
        }
    }

    /// Map the scenario's undefined-bandwidth sentinel to
    /// the configured default, and clamp delay/loss.
    pub fn from_record(
        bandwidth_bits_per_sec: f32,
        delay_seconds: f32,
        loss_fraction: f64,
        default_bandwidth_bits_per_sec: f32,
    ) -> Self {
        let bandwidth = if bandwidth_bits_per_sec < 0.0 {
            default_bandwidth_bits_per_sec
        } else {
            bandwidth_bits_per_sec
        };
        Self {
            bandwidth_bits_per_sec: bandwidth,
            delay_seconds: delay_seconds.max(0.0),
            loss_fraction: loss_fraction.clamp(0.0, 1.0),
        }
    }

    fn netem(self) -> NetemOpts {
        NetemOpts {
            delay_micros: units::seconds_to_micros(self.delay_seconds),
            loss_probability: units::fraction_to_probability(self.loss_fraction),
            limit_packets: 1000,
        }
    }

    fn htb(self) -> HtbClassOpts {
        HtbClassOpts::uniform(self.bandwidth_bits_per_sec)
    }
}

/// Thin, strict wrapper over rtnetlink implementing the qdisc/class/filter
/// operation set, plus the HTB-tree/netem-leaf/u32-classifier compositions
/// the rule table and player need.
pub struct TcProgrammer {
    conn: Connection,
}

impl TcProgrammer {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// The underlying connection, for link (IFB) lifecycle operations.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // -- literal qdisc/class/filter operations ---------------------------

    async fn qdisc_request(
        &self,
        flags: u16,
        msg_type: u16,
        ifindex: u32,
        parent: u32,
        handle: u32,
        kind: Option<&str>,
        write_opts: impl FnOnce(&mut MessageBuilder) -> Result<()>,
    ) -> Result<()> {
        let mut builder = MessageBuilder::new(msg_type, flags);
        builder.append(&TcMsg::new(ifindex, handle, parent, 0));
        if let Some(kind) = kind {
            builder.append_attr_str(TCA_KIND, kind);
            let opts = builder.nest_start(TCA_OPTIONS);
            write_opts(&mut builder)?;
            builder.nest_end(opts);
        }
        self.conn
            .send_ack(builder)
            .await
            .map_err(|e| TcError::kernel("qdisc operation", e))
    }

    /// `qdisc_add`: create an ingress/htb/netem qdisc.
    pub async fn qdisc_add_ingress(&self, ifindex: u32) -> Result<()> {
        self.qdisc_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            NlMsgType::RTM_NEWQDISC,
            ifindex,
            handle::INGRESS_PARENT,
            handle::INGRESS,
            Some("ingress"),
            |_| Ok(()),
        )
        .await
        .or_else(|e| if e.is_already_exists() { Ok(()) } else { Err(e) })
    }

    pub async fn qdisc_add_htb_root(&self, ifindex: u32, handle: u32, default_minor: u16) -> Result<()> {
        self.qdisc_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            NlMsgType::RTM_NEWQDISC,
            ifindex,
            handle::ROOT,
            handle,
            Some("htb"),
            |b| {
                let glob = TcHtbGlob {
                    version: 3,
                    rate2quantum: 10,
                    defcls: default_minor as u32,
                    debug: 0,
                    direct_pkts: 0,
                };
                b.append_attr(TCA_HTB_INIT, unsafe { as_bytes(&glob) });
                Ok(())
            },
        )
        .await
        .or_else(|e| if e.is_already_exists() { Ok(()) } else { Err(e) })
    }

    pub async fn qdisc_add_netem(&self, ifindex: u32, parent: u32, handle: u32, opts: NetemOpts) -> Result<()> {
        self.qdisc_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            NlMsgType::RTM_NEWQDISC,
            ifindex,
            parent,
            handle,
            Some("netem"),
            |b| write_netem_opts(b, opts),
        )
        .await
        .or_else(|e| if e.is_already_exists() { Ok(()) } else { Err(e) })
    }

    /// `qdisc_change`: replace an existing netem leaf's parameters.
    pub async fn qdisc_change_netem(&self, ifindex: u32, parent: u32, handle: u32, opts: NetemOpts) -> Result<()> {
        self.qdisc_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE,
            NlMsgType::RTM_NEWQDISC,
            ifindex,
            parent,
            handle,
            Some("netem"),
            |b| write_netem_opts(b, opts),
        )
        .await
    }

    /// `qdisc_delete`, tolerating ENOENT.
    pub async fn qdisc_delete(&self, ifindex: u32, parent: u32, handle: u32) -> Result<()> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_DELQDISC, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&TcMsg::new(ifindex, handle, parent, 0));
        match self.conn.send_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = TcError::kernel("delete qdisc", e);
                if e.is_not_found() { Ok(()) } else { Err(e) }
            }
        }
    }

    /// `class_add`/`class_change`: an HTB class with rate/ceil.
    pub async fn class_add_htb(&self, ifindex: u32, parent: u32, handle: u32, opts: HtbClassOpts) -> Result<()> {
        self.class_request(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL, ifindex, parent, handle, opts)
            .await
            .or_else(|e| if e.is_already_exists() { Ok(()) } else { Err(e) })
    }

    pub async fn class_change_htb(&self, ifindex: u32, parent: u32, handle: u32, opts: HtbClassOpts) -> Result<()> {
        self.class_request(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE, ifindex, parent, handle, opts)
            .await
    }

    async fn class_request(
        &self,
        flags: u16,
        ifindex: u32,
        parent: u32,
        handle: u32,
        opts: HtbClassOpts,
    ) -> Result<()> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTCLASS, flags);
        builder.append(&TcMsg::new(ifindex, handle, parent, 0));
        builder.append_attr_str(TCA_KIND, "htb");

        let opts_token = builder.nest_start(TCA_OPTIONS);
        let rate_bytes = units::bits_to_bytes_per_sec(opts.rate_bits_per_sec);
        let ceil_bytes = units::bits_to_bytes_per_sec(opts.ceil_bits_per_sec);
        let htb_opt = TcHtbOpt {
            rate: TcRateSpec::capped(rate_bytes),
            ceil: TcRateSpec::capped(ceil_bytes),
            buffer: 0,
            cbuffer: 0,
            quantum: 0,
            level: 0,
            prio: 0,
        };
        builder.append_attr(TCA_HTB_PARMS, unsafe { as_bytes(&htb_opt) });
        if rate_bytes > u32::MAX as u64 {
            builder.append_attr_u64(TCA_HTB_RATE64, rate_bytes);
        }
        if ceil_bytes > u32::MAX as u64 {
            builder.append_attr_u64(TCA_HTB_CEIL64, ceil_bytes);
        }
        builder.nest_end(opts_token);

        self.conn
            .send_ack(builder)
            .await
            .map_err(|e| TcError::kernel("class operation", e))
    }

    /// `class_delete`, tolerating ENOENT.
    pub async fn class_delete(&self, ifindex: u32, parent: u32, handle: u32) -> Result<()> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_DELTCLASS, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&TcMsg::new(ifindex, handle, parent, 0));
        match self.conn.send_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = TcError::kernel("delete class", e);
                if e.is_not_found() { Ok(()) } else { Err(e) }
            }
        }
    }

    /// `filter_add`: a u32 filter with the given keys and terminal action.
    pub async fn filter_add_u32(
        &self,
        ifindex: u32,
        parent: u32,
        priority: u16,
        fhandle: u32,
        keys: &[U32Key],
        action: FilterAction,
    ) -> Result<()> {
        self.filter_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            ifindex,
            parent,
            priority,
            fhandle,
            keys,
            action,
        )
        .await
        .or_else(|e| if e.is_already_exists() { Ok(()) } else { Err(e) })
    }

    pub async fn filter_replace_u32(
        &self,
        ifindex: u32,
        parent: u32,
        priority: u16,
        fhandle: u32,
        keys: &[U32Key],
        action: FilterAction,
    ) -> Result<()> {
        self.filter_request(
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            ifindex,
            parent,
            priority,
            fhandle,
            keys,
            action,
        )
        .await
    }

    async fn filter_request(
        &self,
        flags: u16,
        ifindex: u32,
        parent: u32,
        priority: u16,
        fhandle: u32,
        keys: &[U32Key],
        action: FilterAction,
    ) -> Result<()> {
        let protocol = if keys.is_empty() { ETH_P_ALL } else { ETH_P_IP };
        let info = ((priority as u32) << 16) | (protocol.to_be() as u32);
        let mut builder = MessageBuilder::new(NlMsgType::RTM_NEWTFILTER, flags);
        builder.append(&TcMsg::new(ifindex, fhandle, parent, info));
        builder.append_attr_str(TCA_KIND, "u32");

        let opts_token = builder.nest_start(TCA_OPTIONS);

        if let FilterAction::Classify(classid) = action {
            builder.append_attr_u32(TCA_U32_CLASSID, classid);
        }

        let sel = TcU32Sel {
            flags: TC_U32_TERMINAL,
            offshift: 0,
            nkeys: keys.len() as u8,
            _pad: 0,
            offmask: 0,
            off: 0,
            offoff: 0,
            hoff: 0,
            hmask: 0,
        };
        let mut sel_bytes = unsafe { as_bytes(&sel) }.to_vec();
        for key in keys {
            let k = TcU32Key {
                mask: key.mask,
                val: key.value,
                off: key.offset,
                offmask: key.off_mask,
            };
            sel_bytes.extend_from_slice(unsafe { as_bytes(&k) });
        }
        builder.append_attr(TCA_U32_SEL, &sel_bytes);

        if let FilterAction::MirredRedirect(dst_ifindex) = action {
            let act_list = builder.nest_start(TCA_U32_ACT);
            let act_entry = builder.nest_start(1);
            builder.append_attr_str(TCA_ACT_KIND, "mirred");
            let act_opts = builder.nest_start(TCA_ACT_OPTIONS);
            let mirred = TcMirred {
                gen: TcGen {
                    action: TC_ACT_STOLEN,
                    ..Default::default()
                },
                eaction: TCA_EGRESS_REDIR,
                ifindex: dst_ifindex,
            };
            builder.append_attr(TCA_MIRRED_PARMS, unsafe { as_bytes(&mirred) });
            builder.nest_end(act_opts);
            builder.nest_end(act_entry);
            builder.nest_end(act_list);
        }

        builder.nest_end(opts_token);

        self.conn
            .send_ack(builder)
            .await
            .map_err(|e| TcError::kernel("filter operation", e))
    }

    /// `filter_delete` for a single u32 filter, tolerating ENOENT.
    pub async fn filter_delete(&self, ifindex: u32, parent: u32, priority: u16, fhandle: u32) -> Result<()> {
        let info = (priority as u32) << 16;
        let mut builder = MessageBuilder::new(NlMsgType::RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&TcMsg::new(ifindex, fhandle, parent, info));
        match self.conn.send_ack(builder).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = TcError::kernel("delete filter", e);
                if e.is_not_found() { Ok(()) } else { Err(e) }
            }
        }
    }

    // -- Meteor-specific compositions ---

    /// One-shot setup of the per-process HTB tree skeleton on the IFB
    /// device.
    pub async fn setup_ifb_tree(&self, ifb_ifindex: u32, default_bandwidth_bits: f32) -> Result<()> {
        const DEFAULT_CLASS_MINOR: u16 = 0xFFFF;
        let root = handle::make(1, 0);
        let root_class = handle::make(1, 1);
        let drop_class = handle::make(1, DEFAULT_CLASS_MINOR);
        let drop_netem = handle::make(DEFAULT_CLASS_MINOR, 0);

        self.qdisc_add_htb_root(ifb_ifindex, root, DEFAULT_CLASS_MINOR).await?;
        self.class_add_htb(ifb_ifindex, root, root_class, HtbClassOpts::uniform(default_bandwidth_bits))
            .await?;
        self.class_add_htb(ifb_ifindex, root, drop_class, HtbClassOpts::uniform(default_bandwidth_bits))
            .await?;
        self.qdisc_add_netem(
            ifb_ifindex,
            drop_class,
            drop_netem,
            NetemOpts::drop_all(),
        )
        .await?;
        Ok(())
    }

    /// Mirror all ingress traffic on the physical interface to the IFB
    /// device.
    pub async fn setup_physical_redirect(&self, phys_ifindex: u32, ifb_ifindex: u32) -> Result<()> {
        self.qdisc_add_ingress(phys_ifindex).await?;
        self.filter_add_u32(
            phys_ifindex,
            handle::INGRESS,
            1,
            0,
            &[],
            FilterAction::MirredRedirect(ifb_ifindex),
        )
        .await
    }

    /// Install a peer's default slot: HTB class, netem leaf, classifier.
    pub async fn install_peer(
        &self,
        ifb_ifindex: u32,
        peer_id: i32,
        address: &PeerAddress,
        mode: Mode,
        slot: LinkShape,
    ) -> Result<()> {
        let classid = Self::classid(peer_id);
        let netem_handle = Self::netem_handle(peer_id);
        let root = handle::make(1, 0);

        self.class_add_htb(ifb_ifindex, root, classid, slot.htb()).await?;
        self.qdisc_add_netem(ifb_ifindex, classid, netem_handle, slot.netem()).await?;

        let keys = address.keys(mode)?;
        self.filter_add_u32(
            ifb_ifindex,
            root,
            1,
            Self::filter_handle(peer_id),
            &keys,
            FilterAction::Classify(classid),
        )
        .await
    }

    /// Mutate a peer's class/netem in place.
    pub async fn update_peer(&self, ifb_ifindex: u32, peer_id: i32, slot: LinkShape) -> Result<()> {
        let classid = Self::classid(peer_id);
        let netem_handle = Self::netem_handle(peer_id);
        self.class_change_htb(ifb_ifindex, handle::make(1, 0), classid, slot.htb())
            .await?;
        self.qdisc_change_netem(ifb_ifindex, classid, netem_handle, slot.netem())
            .await
    }

    /// Tear down a peer's netem, filter, and class in that order,
    /// tolerating ENOENT on any step.
    pub async fn remove_peer(&self, ifb_ifindex: u32, peer_id: i32) -> Result<()> {
        let classid = Self::classid(peer_id);
        let netem_handle = Self::netem_handle(peer_id);
        let root = handle::make(1, 0);

        self.qdisc_delete(ifb_ifindex, classid, netem_handle).await?;
        self.filter_delete(ifb_ifindex, root, 1, Self::filter_handle(peer_id)).await?;
        self.class_delete(ifb_ifindex, root, classid).await
    }

    /// `classid = 1:(10+peer_id)`.
    pub fn classid(peer_id: i32) -> u32 {
        handle::make(1, (10 + peer_id) as u16)
    }

    /// `netem handle = (10+peer_id):0`.
    pub fn netem_handle(peer_id: i32) -> u32 {
        handle::make((10 + peer_id) as u16, 0)
    }

    /// u32 filter node handle for a peer: root hash table (`0x800`), bucket
    /// 0, node id = peer id masked to the kernel's 12-bit node field.
    fn filter_handle(peer_id: i32) -> u32 {
        (0x800 << 20) | ((peer_id as u32) & 0xFFF)
    }
}

/// Append a repr(C) struct's bytes. Safety mirrors
/// [`crate::netlink::builder::MessageBuilder::append`]: `T` must be
/// `repr(C)` with no uninitialized padding that would leak kernel-facing
/// bytes.
unsafe fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

fn write_netem_opts(builder: &mut MessageBuilder, opts: NetemOpts) -> Result<()> {
    let qopt = TcNetemQopt {
        latency: opts.delay_micros,
        limit: opts.limit_packets,
        loss: opts.loss_probability,
        gap: 0,
        duplicate: 0,
        jitter: 0,
    };
    builder.append(&qopt);
    let _ = TCA_NETEM_UNSPEC;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slot_is_full_rate_no_delay_drop_all() {
        let slot = LinkShape::default_slot(1_000_000_000.0);
        assert_eq!(slot.bandwidth_bits_per_sec, 1_000_000_000.0);
        assert_eq!(slot.delay_seconds, 0.0);
        assert_eq!(slot.loss_fraction, 1.0);
    }

    #[test]
    fn undefined_bandwidth_maps_to_default() {
        let slot = LinkShape::from_record(-1.0, 0.02, 0.1, 1_000_000_000.0);
        assert_eq!(slot.bandwidth_bits_per_sec, 1_000_000_000.0);
    }

    #[test]
    fn delay_and_loss_are_clamped() {
        let slot = LinkShape::from_record(1e6, -5.0, 2.0, 1e9);
        assert_eq!(slot.delay_seconds, 0.0);
        assert_eq!(slot.loss_fraction, 1.0);
    }

    #[test]
    fn classid_and_netem_handle_are_10_plus_peer() {
        assert_eq!(TcProgrammer::classid(3), handle::make(1, 13));
        assert_eq!(TcProgrammer::netem_handle(3), handle::make(13, 0));
    }

    #[test]
    fn peer_address_requires_matching_mode_field() {
        let addr = PeerAddress::default();
        assert!(addr.keys(Mode::Ip).is_err());
        assert!(addr.keys(Mode::Mac).is_err());
    }

    #[test]
    fn ip_mode_produces_one_key_mac_mode_two() {
        let addr = PeerAddress {
            ipv4: Some((Ipv4Addr::new(10, 0, 0, 1), 24)),
            mac: Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
        };
        assert_eq!(addr.keys(Mode::Ip).unwrap().len(), 1);
        assert_eq!(addr.keys(Mode::Mac).unwrap().len(), 2);
    }
}
