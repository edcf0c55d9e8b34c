//! UDP gossip transport.
//!
//! Each message is a small JSON envelope `{ topic, payload }` fanned out
//! as one datagram per peer. A single receiver task decodes envelopes and
//! routes them to per-topic subscriber channels. Malformed datagrams are
//! dropped and logged; the node's own state is never touched by them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast, mpsc};

use super::Transport;

/// Capacity of each per-topic subscriber channel
const TOPIC_CHANNEL_CAPACITY: usize = 64;

/// Maximum datagram size accepted by the receiver
const MAX_DATAGRAM: usize = 64 * 1024;

/// Wire envelope for a single gossip datagram
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    payload: serde_json::Value,
}

/// UDP-based gossip transport
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Current peer address set; grown at runtime by discovery
    peers: Arc<RwLock<BTreeSet<SocketAddr>>>,
    /// Per-topic subscriber channels
    topics: Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
}

impl UdpTransport {
    /// Bind the gossip socket
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind gossip socket")?;

        tracing::info!(addr = %bind_addr, "📡 Gossip transport bound");

        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(RwLock::new(BTreeSet::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Number of peer addresses currently in the fan-out set
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Run the receive loop, routing inbound envelopes to subscribers
    pub async fn run_receiver(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tracing::info!("👂 Gossip receiver started");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            self.route(&buf[..len], addr).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Gossip receive error");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("👂 Gossip receiver shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decode one datagram and hand it to the topic's subscriber
    async fn route(&self, data: &[u8], addr: SocketAddr) {
        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Invalid gossip datagram");
                return;
            }
        };

        let payload = match serde_json::to_vec(&envelope.payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(topic = %envelope.topic, error = %e, "Unroutable payload");
                return;
            }
        };

        let topics = self.topics.read().await;
        match topics.get(&envelope.topic) {
            Some(tx) => {
                // A slow or stopped consumer drops the message; delivery
                // is best-effort by contract.
                if tx.try_send(payload).is_err() {
                    tracing::debug!(topic = %envelope.topic, "Subscriber channel full, message dropped");
                }
            }
            None => {
                tracing::trace!(topic = %envelope.topic, "No subscriber for topic");
            }
        }
    }
}

impl Transport for UdpTransport {
    async fn connect(&self, addr: &str) -> Result<()> {
        let peer: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid peer address: {addr}"))?;

        let inserted = self.peers.write().await.insert(peer);
        if inserted {
            tracing::debug!(peer = %peer, "Peer added to gossip fan-out");
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let payload: serde_json::Value =
            serde_json::from_slice(&payload).context("Gossip payload must be JSON")?;

        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope).context("Failed to serialize envelope")?;

        let peers: Vec<SocketAddr> = self.peers.read().await.iter().copied().collect();
        for peer in peers {
            if let Err(e) = self.socket.send_to(&bytes, peer).await {
                tracing::warn!(peer = %peer, topic = %topic, error = %e, "Failed to send gossip");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
        self.topics.write().await.insert(topic.to_string(), tx);
        rx
    }
}
