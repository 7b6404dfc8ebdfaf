//! The Live Control Server: a newline-delimited JSON TCP event loop driving
//! the same [`Controller`] the scenario player uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::controller::Controller;
use crate::error::Result;
use crate::tc::{LinkShape, program::PeerAddress};
use crate::util::addr;

/// Accepts connections on one TCP listener and drains each as
/// newline-delimited JSON, applying every well-formed command through a
/// [`Controller`].
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections one at a time, until an I/O error on
    /// the listener itself or `shutdown` is raised. Tears down the controller's IFB tree
    /// before returning.
    pub async fn serve(
        self,
        controller: &mut Controller,
        default_bandwidth_bits: f32,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = crate::signals::wait_for_flag(&shutdown) => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "control listener accept failed, shutting down");
                    break;
                }
            };
            info!(%peer, "control connection accepted");
            if let Err(err) = handle_connection(stream, controller, default_bandwidth_bits).await {
                warn!(%peer, %err, "control connection ended with an error");
            }
        }
        controller.shutdown().await?;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    controller: &mut Controller,
    default_bandwidth_bits: f32,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, line, "dropping malformed control message");
                continue;
            }
        };
        apply_message(controller, &message, default_bandwidth_bits).await;
    }
    Ok(())
}

async fn apply_message(controller: &mut Controller, message: &Value, default_bandwidth_bits: f32) {
    if let Some(entries) = message.get("add").and_then(Value::as_object) {
        for (id_str, fields) in entries {
            let Some(id) = parse_id(id_str) else { continue };
            apply_upsert(controller, id, fields, true, default_bandwidth_bits).await;
        }
    }

    if let Some(entries) = message.get("update").and_then(Value::as_object) {
        for (id_str, fields) in entries {
            let Some(id) = parse_id(id_str) else { continue };
            apply_upsert(controller, id, fields, false, default_bandwidth_bits).await;
        }
    }

    if let Some(ids) = message.get("delete").and_then(Value::as_array) {
        for id_value in ids {
            let Some(id) = id_value.as_i64().map(|v| v as i32).or_else(|| {
                id_value.as_str().and_then(parse_id)
            }) else {
                continue;
            };
            if let Err(err) = controller.remove(id).await {
                warn!(peer_id = id, %err, "failed to remove peer");
            }
        }
    }

    // `opts` is accepted and currently ignored.
}

async fn apply_upsert(
    controller: &mut Controller,
    id: i32,
    fields: &Value,
    is_add: bool,
    default_bandwidth_bits: f32,
) {
    if is_add {
        if let Some(address_str) = fields.get("address").and_then(Value::as_str) {
            match addr::parse_prefix(address_str) {
                Ok((std::net::IpAddr::V4(ipv4), prefix)) => {
                    controller.register(id, PeerAddress { ipv4: Some((ipv4, prefix)), mac: None });
                }
                Ok((std::net::IpAddr::V6(_), _)) => {
                    warn!(peer_id = id, "ignoring IPv6 address in control add");
                    return;
                }
                Err(err) => {
                    warn!(peer_id = id, %err, "invalid address in control add");
                    return;
                }
            }
        } else {
            warn!(peer_id = id, "control add with no address, ignoring");
            return;
        }
        if let Err(err) = controller.ensure_default(id).await {
            warn!(peer_id = id, %err, "failed to install default slot");
            return;
        }
    }

    let existing = controller
        .slot(id)
        .map(|slot| slot.shape)
        .unwrap_or_else(|| LinkShape::default_slot(default_bandwidth_bits));

    // The control protocol's bandwidth arrives in kbit/s and delay in
    // milliseconds, unlike the scenario file's native bits/s and seconds
    // (see DESIGN.md's note on this ambiguity).
    let bandwidth_bits_per_sec = fields
        .get("bandwidth")
        .and_then(lenient_f32)
        .map(|kbit| kbit * 1000.0)
        .unwrap_or(existing.bandwidth_bits_per_sec);
    let delay_seconds = fields
        .get("delay")
        .and_then(lenient_f32)
        .map(|millis| millis / 1000.0)
        .unwrap_or(existing.delay_seconds);
    let loss_fraction = fields
        .get("lossrate")
        .and_then(lenient_f64)
        .unwrap_or(existing.loss_fraction);

    let shape = LinkShape::from_record(
        bandwidth_bits_per_sec,
        delay_seconds,
        loss_fraction,
        default_bandwidth_bits,
    );
    if let Err(err) = controller.apply(id, shape).await {
        warn!(peer_id = id, %err, "failed to apply control update");
    }
}

fn lenient_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.parse::<f32>().ok(),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_id(s: &str) -> Option<i32> {
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_numbers_accept_strings_and_numbers() {
        assert_eq!(lenient_f32(&Value::String("8000".into())), Some(8000.0));
        assert_eq!(lenient_f32(&Value::from(8000)), Some(8000.0));
        assert_eq!(lenient_f64(&Value::String("0.1".into())), Some(0.1));
    }

    #[test]
    fn parse_id_rejects_non_numeric() {
        assert_eq!(parse_id("7"), Some(7));
        assert_eq!(parse_id("seven"), None);
    }
}
