//! The shared `Controller`: wraps one [`TcProgrammer`] and one [`RuleTable`]
//! behind the single surface both the scenario player and the live control
//! server drive.

use tracing::{info, warn};

use crate::rules::RuleTable;
use crate::tc::{LinkShape, Result, TcProgrammer};

/// Owns the IFB tree's kernel state and the in-memory rule table tracking
/// it. Both `meteor`'s tick loop and `meteord`'s line-oriented command
/// handler call the same three verbs here, so their downstream netlink
/// traffic is identical regardless of which process drives it.
pub struct Controller {
    tc: TcProgrammer,
    table: RuleTable,
}

impl Controller {
    pub fn new(tc: TcProgrammer, table: RuleTable) -> Self {
        Self { tc, table }
    }

    /// Register a peer's classifier address ahead of its first `apply`.
    pub fn register(&mut self, peer_id: i32, address: crate::tc::program::PeerAddress) {
        self.table.register(peer_id, address);
    }

    /// Install a peer's default slot if it has none yet.
    pub async fn ensure_default(&mut self, peer_id: i32) -> Result<()> {
        self.table.ensure_default(&self.tc, peer_id).await
    }

    /// Apply a link-quality update for a peer, installing it on first use.
    pub async fn apply(&mut self, peer_id: i32, shape: LinkShape) -> Result<()> {
        let result = self.table.apply(&self.tc, peer_id, shape).await;
        match &result {
            Ok(()) => info!(
                peer_id,
                bandwidth_bits_per_sec = shape.bandwidth_bits_per_sec,
                delay_seconds = shape.delay_seconds,
                loss_fraction = shape.loss_fraction,
                "applied link quality"
            ),
            Err(err) => warn!(peer_id, %err, "failed to apply link quality"),
        }
        result
    }

    /// Remove a peer's slot entirely.
    pub async fn remove(&mut self, peer_id: i32) -> Result<()> {
        let result = self.table.remove(&self.tc, peer_id).await;
        if let Err(err) = &result {
            warn!(peer_id, %err, "failed to remove peer");
        }
        result
    }

    /// The slot currently believed installed for a peer, if any.
    pub fn slot(&self, peer_id: i32) -> Option<crate::rules::RuleSlot> {
        self.table.slot(peer_id)
    }

    /// Tear down the whole IFB device: deleting the link cascades every
    /// qdisc, class and filter on it, so no per-peer teardown is needed.
    pub async fn shutdown(&mut self) -> Result<()> {
        crate::tc::link::delete_ifb(self.tc.connection(), self.table.ifb_ifindex()).await?;
        self.table.forget_all();
        Ok(())
    }

    /// The underlying TC programmer, for one-shot setup calls
    /// (`setup_ifb_tree`, `setup_physical_redirect`) that don't go through
    /// the rule table.
    pub fn tc(&self) -> &TcProgrammer {
        &self.tc
    }
}
