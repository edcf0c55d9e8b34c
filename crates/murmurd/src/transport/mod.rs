//! Gossip transport abstraction.
//!
//! The coordination layer only assumes publish/subscribe-by-topic with
//! at-most-once, unordered delivery; messages may be lost or duplicated
//! and every consumer must tolerate both. [`UdpTransport`] is the
//! production implementation; [`MemoryTransport`] is an in-process
//! loopback used by the test suite.

use anyhow::Result;
use std::future::Future;
use tokio::sync::mpsc;

mod memory;
mod udp;

pub use memory::{MemoryHub, MemoryTransport};
pub use udp::UdpTransport;

/// Topic-based best-effort broadcast among peers.
pub trait Transport: Send + Sync + 'static {
    /// Dial a peer address. For connectionless transports this only
    /// records membership.
    fn connect(&self, addr: &str) -> impl Future<Output = Result<()>> + Send;

    /// Broadcast `payload` to all known peers on `topic`. Per-peer send
    /// failures are transport-internal; they are logged, never raised.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Register a handler channel for `topic`. Messages published by
    /// other peers on that topic arrive on the returned receiver.
    fn subscribe(&self, topic: &str) -> impl Future<Output = mpsc::Receiver<Vec<u8>>> + Send;
}

/// Serialize `msg` as JSON and publish it on `topic`.
pub async fn publish_json<T, M>(transport: &T, topic: &str, msg: &M) -> Result<()>
where
    T: Transport,
    M: serde::Serialize,
{
    let bytes = serde_json::to_vec(msg)?;
    transport.publish(topic, bytes).await
}
