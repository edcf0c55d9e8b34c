//! In-process loopback transport.
//!
//! A [`MemoryHub`] fans every published message out to all attached
//! transports except the publisher, mirroring the gossip delivery model
//! without sockets. Used throughout the test suite and usable for
//! single-process swarms.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};

use super::Transport;

type TopicMap = HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>;

/// Shared hub connecting any number of [`MemoryTransport`]s
#[derive(Clone, Default)]
pub struct MemoryHub {
    members: Arc<RwLock<Vec<(usize, Arc<RwLock<TopicMap>>)>>>,
    next_id: Arc<AtomicUsize>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new transport endpoint to the hub
    pub async fn attach(&self) -> MemoryTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topics = Arc::new(RwLock::new(TopicMap::new()));
        self.members.write().await.push((id, topics.clone()));

        MemoryTransport {
            id,
            topics,
            members: self.members.clone(),
        }
    }
}

/// One endpoint attached to a [`MemoryHub`]
pub struct MemoryTransport {
    id: usize,
    topics: Arc<RwLock<TopicMap>>,
    members: Arc<RwLock<Vec<(usize, Arc<RwLock<TopicMap>>)>>>,
}

impl Transport for MemoryTransport {
    async fn connect(&self, _addr: &str) -> Result<()> {
        // Membership is established by attaching to the hub.
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let members = self.members.read().await.clone();
        for (member_id, topics) in members {
            if member_id == self.id {
                continue;
            }
            let topics = topics.read().await;
            if let Some(senders) = topics.get(topic) {
                for tx in senders {
                    let _ = tx.send(payload.clone()).await;
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
