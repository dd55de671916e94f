//! Configuration.
//!
//! Loads node and registry configuration from JSON strings/files. Flag
//! overrides are applied by the binaries.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::net::PeerAddress;

/// Peer node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local entity id. Derived from the advertised address when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Listen address, e.g. `0.0.0.0:9001`.
    pub bind_addr: String,
    /// Address announced to the registry and peers. Defaults to `bind_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Rendezvous registry address.
    #[serde(default = "default_registry_addr")]
    pub registry_addr: String,
    /// When non-empty, discovery is skipped and these peers are dialed.
    #[serde(default)]
    pub static_peers: Vec<String>,
    /// Find peers by UDP broadcast on the local network instead of the
    /// registry. Ignored when `static_peers` is set.
    #[serde(default)]
    pub lan_discovery: bool,
    /// UDP port LAN announcements are sent to and received on.
    #[serde(default = "default_lan_port")]
    pub lan_port: u16,
    /// How long `peers` listens for announcements before answering.
    #[serde(default = "default_lan_window_ms")]
    pub lan_window_ms: u64,
    /// Simulation frames per second.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Delay between elimination and purge.
    #[serde(default = "default_grace_ms")]
    pub grace_period_ms: u64,
    /// Registry contact attempts before giving up.
    #[serde(default = "default_registry_retries")]
    pub registry_retries: u32,
    #[serde(default = "default_registry_retry_delay_ms")]
    pub registry_retry_delay_ms: u64,
    /// Timeout for dialing registry or peers.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound on live peer links.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_registry_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_lan_port() -> u16 {
    9999
}

fn default_lan_window_ms() -> u64 {
    3_000
}

fn default_tick_hz() -> u32 {
    60
}

fn default_grace_ms() -> u64 {
    3_000
}

fn default_registry_retries() -> u32 {
    3
}

fn default_registry_retry_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_max_connections() -> usize {
    64
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_addr: "127.0.0.1:9001".to_string(),
            advertise_addr: None,
            registry_addr: default_registry_addr(),
            static_peers: Vec::new(),
            lan_discovery: false,
            lan_port: default_lan_port(),
            lan_window_ms: default_lan_window_ms(),
            tick_hz: default_tick_hz(),
            grace_period_ms: default_grace_ms(),
            registry_retries: default_registry_retries(),
            registry_retry_delay_ms: default_registry_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl NodeConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Address other nodes should use to reach this one.
    pub fn self_addr(&self) -> PeerAddress {
        PeerAddress::new(self.advertise_addr.as_deref().unwrap_or(&self.bind_addr))
    }

    /// Id of the local entity. Two nodes on default settings still get
    /// distinct ids because their addresses differ.
    pub fn entity_id(&self, self_addr: &PeerAddress) -> String {
        match &self.node_id {
            Some(id) => id.clone(),
            None => format!("player@{self_addr}"),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn lan_window(&self) -> Duration {
        Duration::from_millis(self.lan_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.registry_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

/// Registry process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_bind")]
    pub bind_addr: String,
}

fn default_registry_bind() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_registry_bind(),
        }
    }
}

impl RegistryConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg = NodeConfig::from_json_str(r#"{"bind_addr":"10.0.0.2:9001"}"#).unwrap();
        assert_eq!(cfg.registry_addr, "127.0.0.1:5000");
        assert_eq!(cfg.grace_period(), Duration::from_secs(3));
        assert_eq!(cfg.self_addr(), PeerAddress::from("10.0.0.2:9001"));
        assert!(cfg.static_peers.is_empty());
        assert!(!cfg.lan_discovery);
        assert_eq!(cfg.lan_port, 9999);
    }

    #[test]
    fn advertise_overrides_bind() {
        let cfg = NodeConfig {
            bind_addr: "0.0.0.0:9001".into(),
            advertise_addr: Some("192.168.0.101:9001".into()),
            ..Default::default()
        };
        assert_eq!(cfg.self_addr().as_str(), "192.168.0.101:9001");
    }

    #[test]
    fn entity_id_defaults_to_the_address() {
        let mut cfg = NodeConfig::default();
        let a = PeerAddress::from("10.0.0.1:9001");
        let b = PeerAddress::from("10.0.0.2:9001");
        assert_ne!(cfg.entity_id(&a), cfg.entity_id(&b));

        cfg.node_id = Some("p1".into());
        assert_eq!(cfg.entity_id(&a), "p1");
    }

    #[test]
    fn registry_defaults() {
        let cfg = RegistryConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:5000");
    }
}
