//! Node lifecycle: wires transport, discovery, election, state, and
//! registry together and runs them as background tasks.

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use murmur_common::{NetworkState, NodeId, unix_now};

use crate::blob::DiskBlobStore;
use crate::cluster::{CoordinatorSlot, ElectionService, Registry, StateService, SyntheticMonitor};
use crate::config::AppConfig;
use crate::crypto::{Identity, KeyRing};
use crate::discovery::PeerDirectory;
use crate::transport::UdpTransport;

/// A running mesh node
pub struct MurmurNode {
    node_id: NodeId,
    transport: Arc<UdpTransport>,
    discovery: PeerDirectory<UdpTransport>,
    election: ElectionService<UdpTransport>,
    state: StateService<UdpTransport>,
    registry: Registry<UdpTransport, DiskBlobStore>,
    config: AppConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl MurmurNode {
    /// Build a node from config: load identity, bind the gossip socket,
    /// open the blob store, and construct every service over shared state
    pub async fn new(config: AppConfig) -> Result<Self> {
        let node_id = NodeId::from(config.node_id.as_str());
        let identity = Arc::new(
            Identity::load_or_generate(node_id.clone(), config.key_path.as_deref())
                .context("Failed to load node identity")?,
        );
        let keyring = KeyRing::strict_with_keys(&config.peer_pubkeys)
            .context("Invalid peer public key in config")?;

        let transport = Arc::new(UdpTransport::bind(&config.bind_addr).await?);
        let blobs = Arc::new(DiskBlobStore::open(&config.data_dir).await?);

        let slot = CoordinatorSlot::new();
        let view = Arc::new(RwLock::new(NetworkState::default()));
        let services: BTreeSet<String> = config.services.iter().cloned().collect();

        let discovery = PeerDirectory::new(
            transport.clone(),
            identity.clone(),
            keyring.clone(),
            config.advertised_addr().to_string(),
            services.clone(),
            config.region.clone(),
            config.bootstrap_peers.clone(),
            Duration::from_secs(config.timing.discovery_interval_secs),
            config.timing.staleness_threshold_secs as f64,
        );

        let election = ElectionService::new(
            node_id.clone(),
            transport.clone(),
            slot.clone(),
            view.clone(),
            Duration::from_secs(config.timing.election_timeout_secs),
            Duration::from_secs(config.timing.election_check_interval_secs),
            config.timing.staleness_threshold_secs as f64,
        );

        let state = StateService::new(
            node_id.clone(),
            transport.clone(),
            slot,
            view,
            Arc::new(SyntheticMonitor),
            services,
            config.region.clone(),
            Duration::from_secs(config.timing.heartbeat_interval_secs),
            config.timing.staleness_threshold_secs as f64,
        );

        let registry = Registry::new(transport.clone(), blobs, identity, keyring);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            node_id,
            transport,
            discovery,
            election,
            state,
            registry,
            config,
            shutdown_tx,
        })
    }

    /// Start the node: dial bootstrap peers, spawn the service loops,
    /// announce presence, and self-register in the replicated registry
    pub async fn start(&self) -> Result<()> {
        tracing::info!(node_id = %self.node_id, region = %self.config.region, "🚀 Node starting");

        self.discovery.connect_bootstrap().await;

        let transport = self.transport.clone();
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = transport.run_receiver(rx).await {
                tracing::error!(error = %e, "Gossip receiver terminated");
            }
        });

        let discovery = self.discovery.clone();
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = discovery.run(rx).await {
                tracing::error!(error = %e, "Discovery terminated");
            }
        });

        let election = self.election.clone();
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = election.run(rx).await {
                tracing::error!(error = %e, "Election service terminated");
            }
        });

        let state = self.state.clone();
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = state.run(rx).await {
                tracing::error!(error = %e, "State service terminated");
            }
        });

        let registry = self.registry.clone();
        let rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = registry.run(rx).await {
                tracing::error!(error = %e, "Registry terminated");
            }
        });

        // Make this node discoverable immediately rather than waiting for
        // the first discovery tick.
        self.discovery.broadcast_presence().await;

        self.registry
            .register_entity(
                "node",
                self.node_id.as_str(),
                json!({
                    "address": self.config.advertised_addr(),
                    "services": self.config.services,
                    "region": self.config.region,
                    "version": env!("CARGO_PKG_VERSION"),
                    "started_at": unix_now(),
                }),
            )
            .await
            .context("Failed to self-register")?;

        tracing::info!(node_id = %self.node_id, "✅ Node started");
        Ok(())
    }

    /// Signal every service loop to stop
    pub async fn stop(&self) {
        tracing::info!(node_id = %self.node_id, "🛑 Node stopping");
        let _ = self.shutdown_tx.send(());
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Replicated entity registry
    pub fn registry(&self) -> &Registry<UdpTransport, DiskBlobStore> {
        &self.registry
    }

    /// Network-state query surface
    pub fn state(&self) -> &StateService<UdpTransport> {
        &self.state
    }

    /// Peer directory
    pub fn peers(&self) -> &PeerDirectory<UdpTransport> {
        &self.discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.bind_addr = "127.0.0.1:0".to_string();
        config.services = vec!["inference".to_string()];
        config.data_dir = std::env::temp_dir()
            .join(format!("murmur-test-{}", config.node_id))
            .to_string_lossy()
            .into_owned();
        config
    }

    #[tokio::test]
    async fn test_lifecycle_start_and_stop() {
        let node = MurmurNode::new(test_config()).await.unwrap();
        node.start().await.unwrap();

        // Self-registration lands in the local registry cache.
        let own = node
            .registry()
            .get_entity("node", node.node_id().as_str())
            .await
            .unwrap();
        assert_eq!(own["region"], "unknown");
        assert_eq!(own["services"][0], "inference");

        node.stop().await;
    }

    #[tokio::test]
    async fn test_zero_bootstrap_start() {
        let node = MurmurNode::new(test_config()).await.unwrap();
        assert!(node.config.bootstrap_peers.is_empty());
        node.start().await.unwrap();
        assert!(node.peers().active_peers().await.is_empty());
        node.stop().await;
    }
}
