//! Replicated entity registry.
//!
//! A generic eventually-consistent key -> entity store with last-write-wins
//! conflict resolution. Entries are signed, their payloads live in the blob
//! store, and the gossip message carries only the content address plus
//! metadata. The merge rule (accept iff strictly newer for the key) is
//! commutative, associative, and idempotent, so any delivery order or
//! duplication converges to the same cache.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use murmur_common::constants::topics;
use murmur_common::{EntityKey, RegistryEntry, unix_now};

use crate::blob::BlobStore;
use crate::crypto::{Identity, KeyRing};
use crate::transport::{Transport, publish_json};

/// A cached entry plus its payload, if fetched
#[derive(Debug, Clone)]
struct CachedEntry {
    entry: RegistryEntry,
    /// None when the blob fetch for an inbound entry failed; a redelivery
    /// of the same entry can complete it
    payload: Option<Value>,
}

/// Replicated LWW registry
pub struct Registry<T: Transport, B: BlobStore> {
    transport: Arc<T>,
    blobs: Arc<B>,
    identity: Arc<Identity>,
    keyring: KeyRing,
    /// At most one entry per key: the newest seen by timestamp
    cache: Arc<RwLock<HashMap<EntityKey, CachedEntry>>>,
}

impl<T: Transport, B: BlobStore> Clone for Registry<T, B> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            blobs: self.blobs.clone(),
            identity: self.identity.clone(),
            keyring: self.keyring.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T: Transport, B: BlobStore> Registry<T, B> {
    pub fn new(
        transport: Arc<T>,
        blobs: Arc<B>,
        identity: Arc<Identity>,
        keyring: KeyRing,
    ) -> Self {
        Self {
            transport,
            blobs,
            identity,
            keyring,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run the inbound update loop
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut updates_rx = self.transport.subscribe(topics::REGISTRY).await;

        tracing::info!("📒 Registry started");

        loop {
            tokio::select! {
                Some(bytes) = updates_rx.recv() => {
                    self.handle_update(&bytes).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("📒 Registry shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Register an entity: persist the payload, sign the entry, merge it
    /// locally, and broadcast it. Returns the payload's content address.
    pub async fn register_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> Result<String> {
        let payload_bytes =
            serde_json::to_vec(&data).context("Failed to serialize entity payload")?;
        let content_address = self.blobs.put(payload_bytes).await?;

        let mut entry = RegistryEntry {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            content_address: content_address.clone(),
            timestamp: unix_now(),
            publisher: self.identity.node_id().clone(),
            signature: String::new(),
        };
        entry.signature = self.identity.sign(&entry.signable_bytes());

        self.merge(entry.clone(), Some(data)).await;

        // Broadcast failure is transient: peers converge from a later
        // re-registration or never see this entry. Local state is already
        // updated either way.
        if let Err(e) = publish_json(&*self.transport, topics::REGISTRY, &entry).await {
            tracing::warn!(
                key = %entry.key(),
                error = %e,
                "Failed to broadcast registry update"
            );
        }

        tracing::debug!(key = %entry.key(), addr = %content_address, "Registered entity");
        Ok(content_address)
    }

    /// Update an entity. Identical to [`Self::register_entity`]: a strictly
    /// newer timestamp for the same key always wins, so update has no
    /// distinct code path.
    pub async fn update_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Value,
    ) -> Result<String> {
        self.register_entity(entity_type, entity_id, data).await
    }

    /// Local-cache lookup only; no network round trip. None if never seen
    /// (or the payload fetch has not succeeded yet).
    pub async fn get_entity(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        let cache = self.cache.read().await;
        cache
            .get(&EntityKey::new(entity_type, entity_id))
            .and_then(|cached| cached.payload.clone())
    }

    /// Linear scan over cached entities of `entity_type`, keeping payloads
    /// whose fields equal every field of `predicate`
    pub async fn search_entities(
        &self,
        entity_type: &str,
        predicate: &serde_json::Map<String, Value>,
    ) -> Vec<Value> {
        let cache = self.cache.read().await;
        cache
            .values()
            .filter(|cached| cached.entry.entity_type == entity_type)
            .filter_map(|cached| cached.payload.as_ref())
            .filter(|payload| {
                predicate
                    .iter()
                    .all(|(field, expected)| payload.get(field) == Some(expected))
            })
            .cloned()
            .collect()
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// LWW merge: accept iff strictly newer than the cached entry for the
    /// same key. Returns whether the entry was accepted.
    async fn merge(&self, entry: RegistryEntry, payload: Option<Value>) -> bool {
        let key = entry.key();
        let mut cache = self.cache.write().await;

        match cache.get_mut(&key) {
            Some(cached) if entry.timestamp <= cached.entry.timestamp => {
                // An identical redelivery may still supply a payload the
                // first delivery failed to fetch.
                if cached.payload.is_none()
                    && payload.is_some()
                    && entry.timestamp == cached.entry.timestamp
                    && entry.content_address == cached.entry.content_address
                {
                    cached.payload = payload;
                    return false;
                }
                tracing::debug!(key = %key, "Discarding non-newer registry entry");
                false
            }
            _ => {
                cache.insert(key, CachedEntry { entry, payload });
                true
            }
        }
    }

    /// Ingest a gossiped entry: decode, verify, merge, then fetch the
    /// payload by content address
    pub(crate) async fn handle_update(&self, bytes: &[u8]) {
        let entry: RegistryEntry = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid registry update");
                return;
            }
        };

        if &entry.publisher == self.identity.node_id() {
            return;
        }

        if !self
            .keyring
            .verify(&entry.publisher, &entry.signable_bytes(), &entry.signature)
            .await
        {
            tracing::warn!(
                publisher = %entry.publisher,
                key = %entry.key(),
                "Dropping registry update with unverifiable signature"
            );
            return;
        }

        let payload = match self.blobs.get(&entry.content_address).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key = %entry.key(), error = %e, "Undecodable payload blob");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    key = %entry.key(),
                    addr = %entry.content_address,
                    error = %e,
                    "Payload fetch failed, caching entry address-only"
                );
                None
            }
        };

        if self.merge(entry.clone(), payload).await {
            tracing::debug!(key = %entry.key(), publisher = %entry.publisher, "Applied registry update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::transport::{MemoryHub, MemoryTransport};
    use murmur_common::NodeId;
    use serde_json::json;

    async fn registry(
        hub: &MemoryHub,
        id: &str,
        keyring: KeyRing,
    ) -> Registry<MemoryTransport, MemoryBlobStore> {
        Registry::new(
            Arc::new(hub.attach().await),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(Identity::load_or_generate(NodeId::from(id), None).unwrap()),
            keyring,
        )
    }

    fn entry(identity: &Identity, id: &str, ts: f64, addr: &str) -> RegistryEntry {
        let mut entry = RegistryEntry {
            entity_type: "model".to_string(),
            entity_id: id.to_string(),
            content_address: addr.to_string(),
            timestamp: ts,
            publisher: identity.node_id().clone(),
            signature: String::new(),
        };
        entry.signature = identity.sign(&entry.signable_bytes());
        entry
    }

    #[tokio::test]
    async fn test_register_then_get_round_trip() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "n1", KeyRing::strict()).await;

        let addr = reg
            .register_entity("node", "n1", json!({"region": "us"}))
            .await
            .unwrap();

        assert_eq!(addr.len(), 64);
        assert_eq!(
            reg.get_entity("node", "n1").await,
            Some(json!({"region": "us"}))
        );
        assert_eq!(reg.get_entity("node", "missing").await, None);
    }

    #[tokio::test]
    async fn test_out_of_order_merge_keeps_newest() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "n1", KeyRing::strict()).await;
        let publisher = Identity::load_or_generate(NodeId::from("p"), None).unwrap();

        reg.merge(entry(&publisher, "m1", 200.0, "a2"), Some(json!("v2")))
            .await;
        reg.merge(entry(&publisher, "m1", 100.0, "a1"), Some(json!("v1")))
            .await;

        assert_eq!(reg.get_entity("model", "m1").await, Some(json!("v2")));
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "n1", KeyRing::strict()).await;
        let publisher = Identity::load_or_generate(NodeId::from("p"), None).unwrap();

        let e = entry(&publisher, "m1", 100.0, "a1");
        assert!(reg.merge(e.clone(), Some(json!("v1"))).await);
        assert!(!reg.merge(e, Some(json!("v1"))).await);
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get_entity("model", "m1").await, Some(json!("v1")));
    }

    #[tokio::test]
    async fn test_convergence_under_shuffled_duplicated_delivery() {
        let hub = MemoryHub::new();
        let publisher = Identity::load_or_generate(NodeId::from("p"), None).unwrap();
        let entries = [
            entry(&publisher, "m1", 100.0, "a1"),
            entry(&publisher, "m1", 300.0, "a3"),
            entry(&publisher, "m1", 200.0, "a2"),
        ];

        // Two replicas, different delivery orders, with duplicates.
        let reg_a = registry(&hub, "a", KeyRing::strict()).await;
        let reg_b = registry(&hub, "b", KeyRing::strict()).await;

        for i in [0, 1, 2, 1, 0] {
            reg_a
                .merge(entries[i].clone(), Some(json!(format!("v{i}"))))
                .await;
        }
        for i in [2, 0, 1, 2, 2] {
            reg_b
                .merge(entries[i].clone(), Some(json!(format!("v{i}"))))
                .await;
        }

        assert_eq!(reg_a.get_entity("model", "m1").await, Some(json!("v1")));
        assert_eq!(
            reg_a.get_entity("model", "m1").await,
            reg_b.get_entity("model", "m1").await
        );
    }

    #[tokio::test]
    async fn test_search_entities_field_equality() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "n1", KeyRing::strict()).await;

        reg.register_entity("node", "n1", json!({"region": "us", "tier": "gpu"}))
            .await
            .unwrap();
        reg.register_entity("node", "n2", json!({"region": "eu", "tier": "gpu"}))
            .await
            .unwrap();
        reg.register_entity("model", "m1", json!({"region": "us"}))
            .await
            .unwrap();

        let predicate = json!({"region": "us"});
        let results = reg
            .search_entities("node", predicate.as_object().unwrap())
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["tier"], "gpu");
    }

    #[tokio::test]
    async fn test_update_entity_supersedes() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "n1", KeyRing::strict()).await;

        reg.register_entity("model", "m1", json!({"v": 1}))
            .await
            .unwrap();
        reg.update_entity("model", "m1", json!({"v": 2}))
            .await
            .unwrap();

        assert_eq!(reg.get_entity("model", "m1").await, Some(json!({"v": 2})));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_gossiped_entry_replicates_when_key_known() {
        let hub = MemoryHub::new();
        // Shared payload store so b can fetch what a persisted.
        let blobs = Arc::new(MemoryBlobStore::new());
        let id_a = Arc::new(Identity::load_or_generate(NodeId::from("a"), None).unwrap());
        let id_b = Arc::new(Identity::load_or_generate(NodeId::from("b"), None).unwrap());

        // b learns a's key (normally via presence discovery).
        let ring_b = KeyRing::strict();
        ring_b
            .add_peer_key(id_a.node_id(), &id_a.public_key_b64())
            .await
            .unwrap();

        let reg_a = Registry::new(
            Arc::new(hub.attach().await),
            blobs.clone(),
            id_a,
            KeyRing::strict(),
        );
        let reg_b = Registry::new(Arc::new(hub.attach().await), blobs, id_b, ring_b);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let run_b = reg_b.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { run_b.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        reg_a
            .register_entity("model", "m1", json!({"name": "resnet"}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(
            reg_b.get_entity("model", "m1").await,
            Some(json!({"name": "resnet"}))
        );
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_unverifiable_update_is_dropped() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "b", KeyRing::strict()).await;
        let stranger = Identity::load_or_generate(NodeId::from("stranger"), None).unwrap();

        // No key for "stranger" in b's keyring.
        let e = entry(&stranger, "m1", 100.0, "a1");
        reg.handle_update(&serde_json::to_vec(&e).unwrap()).await;

        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_update_is_dropped() {
        let hub = MemoryHub::new();
        let reg = registry(&hub, "b", KeyRing::strict()).await;

        reg.handle_update(b"not json at all").await;
        assert!(reg.is_empty().await);
    }
}
