//! Peer directory and discovery.
//!
//! Maintains the set of known and currently-reachable peers: dials the
//! configured bootstrap addresses once at startup, broadcasts this node's
//! presence on a fixed interval, and reconciles known-but-disconnected
//! peers with a bounded random sample per cycle so a large rejoin never
//! turns into a connection storm. A node with zero peers is a valid,
//! running state.

use anyhow::Result;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use murmur_common::constants::{RECONNECT_SAMPLE, topics};
use murmur_common::{NodeId, PresenceAnnounce, unix_now};

use crate::crypto::{Identity, KeyRing};
use crate::transport::{Transport, publish_json};

/// What we know about a discovered peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Dialable transport address
    pub address: String,
    pub services: BTreeSet<String>,
    pub region: String,
    /// Timestamp of the last presence announcement seen
    pub last_seen: f64,
}

/// Discovery service maintaining the peer directory
pub struct PeerDirectory<T: Transport> {
    transport: Arc<T>,
    identity: Arc<Identity>,
    keyring: KeyRing,
    advertised_addr: String,
    services: BTreeSet<String>,
    region: String,
    bootstrap_peers: Vec<String>,
    interval: Duration,
    /// Presence age beyond which an active peer is considered disconnected
    staleness_secs: f64,
    /// All peers ever discovered this process lifetime
    known: Arc<RwLock<HashMap<NodeId, PeerRecord>>>,
    /// Peers with a fresh presence and a successful dial
    active: Arc<RwLock<BTreeSet<NodeId>>>,
}

impl<T: Transport> Clone for PeerDirectory<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            identity: self.identity.clone(),
            keyring: self.keyring.clone(),
            advertised_addr: self.advertised_addr.clone(),
            services: self.services.clone(),
            region: self.region.clone(),
            bootstrap_peers: self.bootstrap_peers.clone(),
            interval: self.interval,
            staleness_secs: self.staleness_secs,
            known: self.known.clone(),
            active: self.active.clone(),
        }
    }
}

impl<T: Transport> PeerDirectory<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<T>,
        identity: Arc<Identity>,
        keyring: KeyRing,
        advertised_addr: String,
        services: BTreeSet<String>,
        region: String,
        bootstrap_peers: Vec<String>,
        interval: Duration,
        staleness_secs: f64,
    ) -> Self {
        Self {
            transport,
            identity,
            keyring,
            advertised_addr,
            services,
            region,
            bootstrap_peers,
            interval,
            staleness_secs,
            known: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Dial every configured bootstrap peer. Failures are logged and
    /// skipped; starting with zero reachable peers is fine.
    pub async fn connect_bootstrap(&self) {
        for addr in &self.bootstrap_peers {
            match self.transport.connect(addr).await {
                Ok(()) => {
                    tracing::info!(peer = %addr, "Connected to bootstrap peer");
                }
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "Failed to connect to bootstrap peer");
                }
            }
        }
    }

    /// Run the discovery loop: presence broadcast + reconciliation each
    /// cycle, presence ingestion as messages arrive
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut presence_rx = self.transport.subscribe(topics::PRESENCE).await;

        // Armed once; a sleep inside the select would be re-armed by every
        // presence message and starve the broadcast/reconcile cycle.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "🔭 Discovery started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast_presence().await;
                    self.expire_stale().await;
                    self.reconcile().await;
                }
                Some(bytes) = presence_rx.recv() => {
                    self.handle_presence(&bytes).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("🔭 Discovery shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Publish this node's identity, address, services, and verifying key
    pub async fn broadcast_presence(&self) {
        let announce = PresenceAnnounce {
            node_id: self.identity.node_id().clone(),
            address: self.advertised_addr.clone(),
            services: self.services.clone(),
            region: self.region.clone(),
            public_key: self.identity.public_key_b64(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: unix_now(),
        };

        if let Err(e) = publish_json(&*self.transport, topics::PRESENCE, &announce).await {
            tracing::warn!(error = %e, "Failed to broadcast presence");
        }
    }

    /// Ingest a presence announcement: record the peer, learn its key,
    /// dial it if we are not already connected
    pub async fn handle_presence(&self, bytes: &[u8]) {
        let announce: PresenceAnnounce = match serde_json::from_slice(bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid presence announcement");
                return;
            }
        };

        if &announce.node_id == self.identity.node_id() {
            return;
        }

        if let Err(e) = self
            .keyring
            .add_peer_key(&announce.node_id, &announce.public_key)
            .await
        {
            tracing::warn!(peer = %announce.node_id, error = %e, "Rejected peer public key");
            return;
        }

        let newly_known = self
            .known
            .write()
            .await
            .insert(
                announce.node_id.clone(),
                PeerRecord {
                    address: announce.address.clone(),
                    services: announce.services,
                    region: announce.region,
                    last_seen: announce.timestamp,
                },
            )
            .is_none();

        if newly_known {
            tracing::info!(peer = %announce.node_id, addr = %announce.address, "Discovered peer");
        }

        if !self.active.read().await.contains(&announce.node_id) {
            match self.transport.connect(&announce.address).await {
                Ok(()) => {
                    self.active.write().await.insert(announce.node_id);
                }
                Err(e) => {
                    tracing::debug!(peer = %announce.node_id, error = %e, "Failed to dial peer");
                }
            }
        }
    }

    /// Drop peers whose presence has gone stale from the active set; they
    /// rejoin the reconcile pool and are redialed if they come back
    pub(crate) async fn expire_stale(&self) {
        let now = unix_now();
        let known = self.known.read().await;
        let mut active = self.active.write().await;

        let expired: Vec<NodeId> = active
            .iter()
            .filter(|id| {
                !known
                    .get(id)
                    .is_some_and(|record| now - record.last_seen <= self.staleness_secs)
            })
            .cloned()
            .collect();

        for node_id in expired {
            active.remove(&node_id);
            tracing::info!(peer = %node_id, "Peer presence went stale, marking disconnected");
        }
    }

    /// Retry a bounded random sample of known-but-disconnected peers.
    /// Transient failures are retried on the next cycle, never escalated.
    pub async fn reconcile(&self) {
        let disconnected: Vec<(NodeId, String)> = {
            let known = self.known.read().await;
            let active = self.active.read().await;
            known
                .iter()
                .filter(|(id, _)| !active.contains(*id))
                .map(|(id, record)| (id.clone(), record.address.clone()))
                .collect()
        };

        if disconnected.is_empty() {
            return;
        }

        // Bounded sample to avoid connection storms on mass rejoin.
        let sample: Vec<(NodeId, String)> = {
            let mut rng = rand::rng();
            disconnected
                .into_iter()
                .choose_multiple(&mut rng, RECONNECT_SAMPLE)
        };

        for (node_id, address) in sample {
            match self.transport.connect(&address).await {
                Ok(()) => {
                    self.active.write().await.insert(node_id.clone());
                    tracing::debug!(peer = %node_id, "Reconnected to peer");
                }
                Err(e) => {
                    tracing::debug!(peer = %node_id, error = %e, "Failed to reconnect to peer");
                }
            }
        }
    }

    /// Snapshot of currently-connected peer ids
    pub async fn active_peers(&self) -> Vec<NodeId> {
        self.active.read().await.iter().cloned().collect()
    }

    /// Snapshot of every known peer id
    pub async fn all_peers(&self) -> Vec<NodeId> {
        self.known.read().await.keys().cloned().collect()
    }

    /// (total known, currently active) peer counts
    pub async fn peer_counts(&self) -> (usize, usize) {
        let total = self.known.read().await.len();
        let active = self.active.read().await.len();
        (total, active)
    }
}
