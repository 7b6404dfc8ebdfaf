//! Node topology: parses the settings JSON file listing every node's id
//! and address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde_json::Value;

use crate::util::addr;

/// Errors raised while loading or validating a settings file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid address in {entry}: {0}", entry = .0)]
    InvalidAddress(String),

    #[error("invalid MAC address in node entry: {0}")]
    InvalidMac(String),

    #[error("duplicate node id: {0}")]
    DuplicateId(i32),

    #[error("node ids are not contiguous starting at 0")]
    NonContiguousIds,

    #[error("scenario declares {scenario} interfaces but topology has {topology} nodes")]
    CountMismatch { scenario: i32, topology: usize },

    #[error("bridge mode requires a connection list (-c)")]
    MissingConnections,
}

type Result<T> = std::result::Result<T, ConfigError>;

/// One node's topology entry.
#[derive(Debug, Clone, Default)]
pub struct NodeEntry {
    pub name: String,
    pub interface: Option<String>,
    pub id: Option<i32>,
    pub ipv4: Option<(Ipv4Addr, u8)>,
    pub mac: Option<[u8; 6]>,
}

/// Parsed node topology, keyed by scan order and by id.
pub struct Topology {
    entries: Vec<NodeEntry>,
}

impl Topology {
    /// Load and parse a settings JSON file.
    ///
    /// Only top-level keys matching `^node` are treated as node entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse settings JSON already read into memory (used by `load` and
    /// directly by tests).
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().cloned().unwrap_or_default();

        let mut entries = Vec::new();
        let mut seen_ids = BTreeMap::new();

        for (key, node_value) in object.iter() {
            if !key.starts_with("node") {
                continue;
            }
            let entry = Self::parse_entry(key, node_value)?;
            if let Some(id) = entry.id {
                if seen_ids.insert(id, ()).is_some() {
                    return Err(ConfigError::DuplicateId(id));
                }
            }
            entries.push(entry);
        }

        let mut ids: Vec<i32> = entries.iter().filter_map(|e| e.id).collect();
        ids.sort_unstable();
        for (expected, actual) in ids.iter().enumerate() {
            if expected as i32 != *actual {
                return Err(ConfigError::NonContiguousIds);
            }
        }

        Ok(Self { entries })
    }

    fn parse_entry(key: &str, value: &Value) -> Result<NodeEntry> {
        let mut entry = NodeEntry {
            name: key.to_string(),
            ..Default::default()
        };

        let object = match value.as_object() {
            Some(o) => o,
            None => return Ok(entry),
        };

        if let Some(interface) = object.get("interface").and_then(Value::as_str) {
            entry.interface = Some(interface.to_string());
        }
        if let Some(id) = object.get("id") {
            entry.id = id.as_i64().map(|v| v as i32).or_else(|| {
                id.as_str().and_then(|s| s.parse::<i32>().ok())
            });
        }
        if let Some(ipaddr) = object.get("ipaddr").and_then(Value::as_str) {
            entry.ipv4 = Some(Self::parse_ipv4(ipaddr)?);
        }
        if let Some(macaddr) = object.get("macaddr").and_then(Value::as_str) {
            entry.mac = Some(Self::parse_mac(macaddr)?);
        }

        Ok(entry)
    }

    fn parse_ipv4(s: &str) -> Result<(Ipv4Addr, u8)> {
        let (addr, prefix) =
            addr::parse_prefix(s).map_err(|e| ConfigError::InvalidAddress(e.to_string()))?;
        match addr {
            std::net::IpAddr::V4(v4) => Ok((v4, prefix)),
            std::net::IpAddr::V6(_) => Err(ConfigError::InvalidAddress(s.to_string())),
        }
    }

    fn parse_mac(s: &str) -> Result<[u8; 6]> {
        addr::parse_mac(s).map_err(|e| ConfigError::InvalidMac(e.to_string()))
    }

    /// Number of node entries parsed.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Entries in scan order.
    pub fn list(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// Look up an entry by id.
    pub fn find(&self, id: i32) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| e.id == Some(id))
    }

    /// Look up the entry for this process's own id (same as `find`, named
    /// for readability at the player's call sites).
    pub fn find_self(&self, id: i32) -> Option<&NodeEntry> {
        self.find(id)
    }

    /// Check that a scenario file's `interface_count` matches the number of
    /// nodes in this topology.
    pub fn validate_count(&self, scenario_interface_count: i32) -> Result<()> {
        if scenario_interface_count as usize != self.count() {
            return Err(ConfigError::CountMismatch {
                scenario: scenario_interface_count,
                topology: self.count(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_entries() {
        let json = r#"{
            "node0": {"interface": "eth0", "id": 0, "ipaddr": "10.0.0.1/24", "macaddr": "aa:bb:cc:dd:ee:00"},
            "node1": {"interface": "eth1", "id": 1, "ipaddr": "10.0.0.2", "macaddr": "aa:bb:cc:dd:ee:01"},
            "ignored": {"id": 99}
        }"#;

        let topology = Topology::parse(json).unwrap();
        assert_eq!(topology.count(), 2);

        let node0 = topology.find(0).unwrap();
        assert_eq!(node0.interface.as_deref(), Some("eth0"));
        assert_eq!(node0.ipv4, Some((Ipv4Addr::new(10, 0, 0, 1), 24)));

        let node1 = topology.find(1).unwrap();
        assert_eq!(node1.ipv4, Some((Ipv4Addr::new(10, 0, 0, 2), 32)));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"{
            "node0": {"id": 0},
            "node1": {"id": 0}
        }"#;
        assert!(matches!(
            Topology::parse(json),
            Err(ConfigError::DuplicateId(0))
        ));
    }

    #[test]
    fn rejects_non_contiguous_ids() {
        let json = r#"{
            "node0": {"id": 0},
            "node1": {"id": 2}
        }"#;
        assert!(matches!(
            Topology::parse(json),
            Err(ConfigError::NonContiguousIds)
        ));
    }

    #[test]
    fn rejects_malformed_address() {
        let json = r#"{"node0": {"ipaddr": "not-an-address"}}"#;
        assert!(matches!(
            Topology::parse(json),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
