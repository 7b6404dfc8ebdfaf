//! The Scenario Player: drives a [`Controller`] through one scenario file's
//! ticks on a [`Scheduler`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, info_span, warn};

use crate::controller::Controller;
use crate::error::Result;
use crate::scenario::{LinkRecord, ScenarioReader};
use crate::scheduler::{Scheduler, WaitOutcome};
use crate::tc::LinkShape;
use crate::topology::Topology;

/// Picks which peer id (classifier key into the rule table) a given
/// [`LinkRecord`] applies to: a tagged variant with two small trait
/// implementations, replacing a branch on a mode flag scattered through
/// the tick loop.
pub trait SlotSelector {
    /// Return the peer id this record should update the slot for, or
    /// `None` if the record doesn't concern this process.
    fn select(&self, record: &LinkRecord) -> Option<i32>;
}

/// Ingress mode: this process shapes traffic *from* every other node, so a
/// record applies when its `to_id` names this node; the slot to update is
/// keyed by the record's `from_id`.
pub struct IngressSelector {
    self_id: i32,
}

impl IngressSelector {
    pub fn new(self_id: i32) -> Self {
        Self { self_id }
    }
}

impl SlotSelector for IngressSelector {
    fn select(&self, record: &LinkRecord) -> Option<i32> {
        if record.to_id == self.self_id {
            Some(record.from_id)
        } else {
            None
        }
    }
}

/// Bridge mode: an explicit `(from_id, to_id) -> slot_index` table, loaded
/// from a plaintext connection list (two ids per line), stands in for the
/// ingress selector's implicit "to me" rule.
pub struct BridgeSelector {
    connections: HashMap<(i32, i32), i32>,
}

impl BridgeSelector {
    pub fn new(connections: HashMap<(i32, i32), i32>) -> Self {
        Self { connections }
    }

    /// Parse a connection list file: whitespace-separated `from_id to_id`
    /// pairs, one per line, assigned slot indices in file order. Blank
    /// lines and lines starting with `#` are skipped.
    pub fn from_connections_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(crate::scenario::ScenarioError::Io)?;
        let mut connections = HashMap::new();
        let mut slot_index = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let from = fields.next().and_then(|f| f.parse::<i32>().ok());
            let to = fields.next().and_then(|f| f.parse::<i32>().ok());
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            connections.insert((from, to), slot_index);
            slot_index += 1;
        }
        Ok(Self { connections })
    }
}

impl SlotSelector for BridgeSelector {
    fn select(&self, record: &LinkRecord) -> Option<i32> {
        self.connections.get(&(record.from_id, record.to_id)).copied()
    }
}

impl BridgeSelector {
    /// Every `(slot_index, from_id)` pair this selector drives, used to
    /// prime each slot's classifier with the forwarding flow's source
    /// address before any record has arrived for it. A slot still needs a
    /// classifier address, which here is the connection's source node
    /// rather than the record's `from_id`, since ingress mode and bridge
    /// mode key the rule table differently.
    pub fn slots(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.connections.iter().map(|(&(from_id, _to_id), &slot_index)| (slot_index, from_id))
    }
}

/// Bridge-mode priming: registers every `slot_index` the bridge selector
/// drives with its connection's source-node address, mirroring
/// `Player::prime_defaults`'s ingress-mode walk over topology node ids but
/// keyed by slot index instead of node id.
pub async fn prime_defaults_bridge(
    controller: &mut Controller,
    topology: &Topology,
    selector: &BridgeSelector,
) -> Result<()> {
    for (slot_index, from_id) in selector.slots() {
        let Some(node) = topology.find(from_id) else {
            continue;
        };
        controller.register(slot_index, crate::tc::program::PeerAddress { ipv4: node.ipv4, mac: node.mac });
        controller.ensure_default(slot_index).await?;
    }
    Ok(())
}

/// Drives one scenario file's ticks, applying matching records through a
/// [`Controller`] and pacing itself with a [`Scheduler`].
pub struct Player<S: SlotSelector> {
    reader: ScenarioReader,
    scheduler: Scheduler,
    controller: Controller,
    selector: S,
    default_bandwidth_bits: f32,
    loop_mode: bool,
    restart: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl<S: SlotSelector> Player<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: ScenarioReader,
        scheduler: Scheduler,
        controller: Controller,
        selector: S,
        default_bandwidth_bits: f32,
        loop_mode: bool,
        restart: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reader,
            scheduler,
            controller,
            selector,
            default_bandwidth_bits,
            loop_mode,
            restart,
            shutdown,
        }
    }

    /// Register every peer id other than `self_id` with its topology
    /// address and install its default slot.
    pub async fn prime_defaults(&mut self, topology: &Topology, self_id: i32) -> Result<()> {
        for node in topology.list() {
            let Some(id) = node.id else { continue };
            if id == self_id {
                continue;
            }
            self.controller
                .register(id, crate::tc::program::PeerAddress { ipv4: node.ipv4, mac: node.mac });
            self.controller.ensure_default(id).await?;
        }
        Ok(())
    }

    /// Run the tick loop to completion (or forever, in `-l` loop mode),
    /// honoring `SIGUSR1` restarts.
    pub async fn run(mut self) -> Result<()> {
        'outer: loop {
            self.reader.rewind_to_data_start()?;
            self.scheduler.reset();
            let mut first_tick = true;
            let tick_count = self.reader.header().time_record_count;

            for _ in 0..tick_count {
                if self.shutdown.load(Ordering::Relaxed) {
                    self.controller.shutdown().await?;
                    return Ok(());
                }

                let time_record = self.reader.read_time_record()?;
                let records = self.reader.read_records(time_record.record_count)?;

                if first_tick {
                    self.scheduler.reset();
                    first_tick = false;
                } else {
                    let outcome = tokio::select! {
                        outcome = self.scheduler.wait_until(time_record.time) => outcome,
                        _ = crate::signals::wait_for_flag(&self.shutdown) => {
                            self.controller.shutdown().await?;
                            return Ok(());
                        }
                    };
                    match outcome {
                        WaitOutcome::Reached => {}
                        WaitOutcome::Missed => {
                            warn!(
                                scenario_time = time_record.time,
                                "deadline missed, skipping tick"
                            );
                            continue;
                        }
                        WaitOutcome::Restart => {
                            self.restart.store(false, Ordering::Relaxed);
                            continue 'outer;
                        }
                    }
                }

                let span = info_span!("tick", scenario_time = time_record.time);
                let _enter = span.enter();
                for record in &records {
                    let Some(peer_id) = self.selector.select(record) else {
                        continue;
                    };
                    let shape = LinkShape::from_record(
                        record.bandwidth,
                        record.delay,
                        record.loss_rate as f64,
                        self.default_bandwidth_bits,
                    );
                    // A failed change is logged (by the controller) and
                    // skipped; the tick continues for other peers.
                    let _ = self.controller.apply(peer_id, shape).await;
                }
            }

            if !self.loop_mode {
                break;
            }
            info!("scenario replay complete, looping");
        }

        self.controller.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(from_id: i32, to_id: i32) -> LinkRecord {
        LinkRecord {
            from_id,
            to_id,
            frame_error_rate: 0.0,
            num_retransmissions: 0.0,
            standard: 0,
            operating_rate: 0.0,
            bandwidth: 1_000_000.0,
            loss_rate: 0.0,
            delay: 0.0,
        }
    }

    #[test]
    fn ingress_selector_matches_by_to_id() {
        let selector = IngressSelector::new(2);
        assert_eq!(selector.select(&record(0, 2)), Some(0));
        assert_eq!(selector.select(&record(2, 0)), None);
    }

    #[test]
    fn bridge_selector_matches_explicit_pairs() {
        let mut connections = HashMap::new();
        connections.insert((0, 1), 0);
        connections.insert((2, 1), 1);
        let selector = BridgeSelector::new(connections);
        assert_eq!(selector.select(&record(0, 1)), Some(0));
        assert_eq!(selector.select(&record(2, 1)), Some(1));
        assert_eq!(selector.select(&record(1, 0)), None);
    }

    #[test]
    fn bridge_selector_parses_connection_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_connections.txt");
        std::fs::write(&path, "# comment\n0 1\n2 1\n\n").unwrap();

        let selector = BridgeSelector::from_connections_file(&path).unwrap();
        assert_eq!(selector.select(&record(0, 1)), Some(0));
        assert_eq!(selector.select(&record(2, 1)), Some(1));

        std::fs::remove_file(&path).ok();
    }
}
