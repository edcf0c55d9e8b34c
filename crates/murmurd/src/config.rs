//! Configuration management for murmurd.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use murmur_common::constants::{
    DEFAULT_BIND_ADDR, DEFAULT_DISCOVERY_INTERVAL_SECS, DEFAULT_ELECTION_CHECK_INTERVAL_SECS,
    DEFAULT_ELECTION_TIMEOUT_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_STALENESS_THRESHOLD_SECS,
};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    /// UDP bind address for the gossip transport
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address advertised to peers (defaults to bind_addr)
    #[serde(default)]
    pub advertised_addr: Option<String>,

    /// Bootstrap peer addresses dialed at startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Region this node reports in heartbeats
    #[serde(default = "default_region")]
    pub region: String,

    /// Services this node offers
    #[serde(default)]
    pub services: Vec<String>,

    /// Protocol timing knobs
    #[serde(default)]
    pub timing: TimingConfig,

    /// Path to a 32-byte ed25519 private key file (ephemeral if unset)
    #[serde(default)]
    pub key_path: Option<String>,

    /// Pre-seeded peer public keys (node_id -> base64 pubkey)
    #[serde(default)]
    pub peer_pubkeys: HashMap<String, String>,

    /// Directory for blob payloads
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Protocol timing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Seconds between heartbeats (and coordinator aggregation cycles)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Election window before an unchallenged candidate claims coordination
    #[serde(default = "default_election_timeout")]
    pub election_timeout_secs: u64,

    /// Seconds between coordinator-liveness checks
    #[serde(default = "default_election_check_interval")]
    pub election_check_interval_secs: u64,

    /// Seconds without a heartbeat before a node is evicted from the view
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_secs: u64,

    /// Seconds between presence broadcasts and peer reconciliation cycles
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            election_timeout_secs: default_election_timeout(),
            election_check_interval_secs: default_election_check_interval(),
            staleness_threshold_secs: default_staleness_threshold(),
            discovery_interval_secs: default_discovery_interval(),
        }
    }
}

// Default value functions
fn default_bind_addr() -> String { DEFAULT_BIND_ADDR.to_string() }
fn default_region() -> String { "unknown".to_string() }
fn default_data_dir() -> String { "data/blobs".to_string() }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_SECS }
fn default_election_timeout() -> u64 { DEFAULT_ELECTION_TIMEOUT_SECS }
fn default_election_check_interval() -> u64 { DEFAULT_ELECTION_CHECK_INTERVAL_SECS }
fn default_staleness_threshold() -> u64 { DEFAULT_STALENESS_THRESHOLD_SECS }
fn default_discovery_interval() -> u64 { DEFAULT_DISCOVERY_INTERVAL_SECS }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref bind) = args.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(ref region) = args.region {
            config.region = region.clone();
        }

        Ok(config)
    }

    /// Address other peers should dial to reach this node
    pub fn advertised_addr(&self) -> &str {
        self.advertised_addr.as_deref().unwrap_or(&self.bind_addr)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            bind_addr: default_bind_addr(),
            advertised_addr: None,
            bootstrap_peers: Vec::new(),
            region: default_region(),
            services: Vec::new(),
            timing: TimingConfig::default(),
            key_path: None,
            peer_pubkeys: HashMap::new(),
            data_dir: default_data_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_node_id_format() {
        let config = AppConfig::default();
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.node_id.len(), "node-".len() + 8);
    }

    #[test]
    fn test_advertised_addr_falls_back_to_bind() {
        let mut config = AppConfig::default();
        assert_eq!(config.advertised_addr(), config.bind_addr);

        config.advertised_addr = Some("203.0.113.7:7946".to_string());
        assert_eq!(config.advertised_addr(), "203.0.113.7:7946");
    }
}
