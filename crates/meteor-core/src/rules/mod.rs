//! The Rule Table: one `RuleSlot` per peer, idempotently kept in sync with
//! kernel TC state.
//!
//! One owned table of per-target state, backed by netlink, with
//! `add`/`change`/`remove` verbs, keyed by peer id rather than by address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::tc::program::{LinkShape, Mode, PeerAddress, TcProgrammer};
use crate::tc::{Result, TcError};

/// A peer's current link-quality slot, mirroring the kernel state installed
/// for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleSlot {
    pub peer_id: i32,
    pub shape: LinkShape,
}

/// State machine for one peer: absent, or present with a known shape.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    Absent,
    Present(LinkShape),
}

/// Owns every peer's TC state on one IFB device and keeps it idempotent:
/// repeating the same `add`/`change`/`remove` call never re-issues a
/// redundant netlink request.
pub struct RuleTable {
    ifb_ifindex: u32,
    mode: Mode,
    default_bandwidth_bits: f32,
    addresses: BTreeMap<i32, PeerAddress>,
    states: BTreeMap<i32, SlotState>,
}

impl RuleTable {
    /// Build an empty table for the given IFB device. Callers are expected
    /// to have already run [`TcProgrammer::setup_ifb_tree`] on `ifb_ifindex`.
    pub fn new(ifb_ifindex: u32, mode: Mode, default_bandwidth_bits: f32) -> Self {
        Self {
            ifb_ifindex,
            mode,
            default_bandwidth_bits,
            addresses: BTreeMap::new(),
            states: BTreeMap::new(),
        }
    }

    /// Register a peer's classifier address ahead of its first `add`. Not
    /// itself a netlink operation.
    pub fn register(&mut self, peer_id: i32, address: PeerAddress) {
        self.addresses.insert(peer_id, address);
        self.states.entry(peer_id).or_insert(SlotState::Absent);
    }

    /// Peer ids that have been registered.
    pub fn peer_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.addresses.keys().copied()
    }

    fn current(&self, peer_id: i32) -> SlotState {
        self.states.get(&peer_id).copied().unwrap_or(SlotState::Absent)
    }

    /// Ensure a peer has its default slot installed: full default bandwidth, no delay, 100% loss.
    /// A no-op if already present.
    pub async fn ensure_default(&mut self, tc: &TcProgrammer, peer_id: i32) -> Result<()> {
        if self.current(peer_id) != SlotState::Absent {
            return Ok(());
        }
        let address = self.address_for(peer_id)?;
        let shape = LinkShape::default_slot(self.default_bandwidth_bits);
        tc.install_peer(self.ifb_ifindex, peer_id, &address, self.mode, shape)
            .await?;
        self.states.insert(peer_id, SlotState::Present(shape));
        Ok(())
    }

    /// Apply a link-quality update for a peer, creating its slot if absent
    /// and changing it in place otherwise.
    pub async fn apply(&mut self, tc: &TcProgrammer, peer_id: i32, shape: LinkShape) -> Result<()> {
        match self.current(peer_id) {
            SlotState::Absent => {
                let address = self.address_for(peer_id)?;
                tc.install_peer(self.ifb_ifindex, peer_id, &address, self.mode, shape)
                    .await?;
            }
            SlotState::Present(existing) if existing == shape => return Ok(()),
            SlotState::Present(_) => {
                tc.update_peer(self.ifb_ifindex, peer_id, shape).await?;
            }
        }
        self.states.insert(peer_id, SlotState::Present(shape));
        Ok(())
    }

    /// Remove a peer's slot entirely, tolerating a peer that was never
    /// installed.
    pub async fn remove(&mut self, tc: &TcProgrammer, peer_id: i32) -> Result<()> {
        if self.current(peer_id) == SlotState::Absent {
            return Ok(());
        }
        tc.remove_peer(self.ifb_ifindex, peer_id).await?;
        self.states.insert(peer_id, SlotState::Absent);
        Ok(())
    }

    /// The slot currently believed installed for a peer, if any.
    pub fn slot(&self, peer_id: i32) -> Option<RuleSlot> {
        match self.current(peer_id) {
            SlotState::Present(shape) => Some(RuleSlot { peer_id, shape }),
            SlotState::Absent => None,
        }
    }

    fn address_for(&self, peer_id: i32) -> Result<PeerAddress> {
        self.addresses
            .get(&peer_id)
            .copied()
            .ok_or_else(|| TcError::InterfaceNotFound(format!("unregistered peer id {peer_id}")))
    }

    /// Tear down every installed peer, in id order.
    pub async fn clear(&mut self, tc: &TcProgrammer) -> Result<()> {
        let ids: Vec<i32> = self.addresses.keys().copied().collect();
        for id in ids {
            self.remove(tc, id).await?;
        }
        Ok(())
    }

    /// The IFB device this table's slots live on.
    pub fn ifb_ifindex(&self) -> u32 {
        self.ifb_ifindex
    }

    /// Mark every slot absent without issuing kernel calls, used after the
    /// IFB device itself has already been deleted.
    pub fn forget_all(&mut self) {
        for state in self.states.values_mut() {
            *state = SlotState::Absent;
        }
    }
}

/// Build a [`PeerAddress`] from topology fields, used when registering
/// peers from a loaded [`crate::topology::Topology`].
pub fn peer_address(ipv4: Option<(Ipv4Addr, u8)>, mac: Option<[u8; 6]>) -> PeerAddress {
    PeerAddress { ipv4, mac }
}
