//! Core types shared across Murmur components.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Current Unix time as fractional seconds.
///
/// All protocol timestamps use this representation; sub-second precision
/// keeps last-write-wins comparisons meaningful for entries produced in
/// quick succession.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Opaque node identifier, unique per process lifetime.
///
/// Ordered lexicographically; that ordering is the deterministic tie-break
/// for equal resource scores in node selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Resource usage reported in heartbeats (all percentages except bandwidth)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub gpu_pct: f64,
    /// Available bandwidth estimate (Mbps)
    pub bandwidth: f64,
}

impl ResourceUsage {
    /// Mean of cpu/mem/gpu usage; lower is better.
    pub fn load_score(&self) -> f64 {
        (self.cpu_pct + self.mem_pct + self.gpu_pct) / 3.0
    }
}

/// Per-node heartbeat, produced on a fixed interval and consumed by the
/// coordinator. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: NodeId,
    /// Unix seconds at emission
    pub timestamp: f64,
    pub services: BTreeSet<String>,
    pub resources: ResourceUsage,
    pub region: String,
}

/// A node's entry in the aggregated network view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Timestamp of the last heartbeat observed for this node
    pub last_seen: f64,
    pub services: BTreeSet<String>,
    pub resources: ResourceUsage,
    pub region: String,
}

/// Aggregated view of the network.
///
/// Mutated only by the node that currently believes itself coordinator;
/// every other node holds a read-only replica updated by full-state
/// broadcasts. `regions` and `services` are denormalized indices over
/// `nodes` and are always recomputed together via [`NetworkState::reindex`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    pub regions: BTreeMap<String, BTreeSet<NodeId>>,
    pub services: BTreeMap<String, BTreeSet<NodeId>>,
    /// Unix seconds of the last coordinator aggregation cycle
    pub last_updated: f64,
}

impl NetworkState {
    /// Upsert a node entry from a heartbeat. Indices are not touched here;
    /// they are rebuilt on the aggregation cycle.
    pub fn upsert(&mut self, hb: HeartbeatRecord) {
        self.nodes.insert(
            hb.node_id,
            NodeInfo {
                last_seen: hb.timestamp,
                services: hb.services,
                resources: hb.resources,
                region: hb.region,
            },
        );
    }

    /// Remove nodes not heard from within `threshold_secs`, returning the
    /// evicted ids.
    pub fn evict_stale(&mut self, now: f64, threshold_secs: f64) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, info)| now - info.last_seen > threshold_secs)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.nodes.remove(id);
        }
        stale
    }

    /// Rebuild the `services` and `regions` indices from `nodes`.
    ///
    /// Invariant: both indices are derivable from `nodes` and are only ever
    /// replaced wholesale, never patched independently.
    pub fn reindex(&mut self) {
        let mut services: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
        let mut regions: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();

        for (id, info) in &self.nodes {
            for service in &info.services {
                services
                    .entry(service.clone())
                    .or_default()
                    .insert(id.clone());
            }
            regions
                .entry(info.region.clone())
                .or_default()
                .insert(id.clone());
        }

        self.services = services;
        self.regions = regions;
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }
}

/// Candidacy claim broadcast while a node is electing.
///
/// Ephemeral: superseded the instant a higher-priority claim or a
/// coordinator announcement is observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionClaim {
    pub node_id: NodeId,
    pub timestamp: f64,
    /// Uniform random tie-break value in [0, 1)
    pub priority: f64,
}

/// Broadcast by the election winner when its window expires unchallenged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorAnnouncement {
    pub node_id: NodeId,
    pub timestamp: f64,
}

/// Full network-state broadcast from the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBroadcast {
    pub coordinator: NodeId,
    pub timestamp: f64,
    pub state: NetworkState,
}

/// Peer presence announcement on the discovery topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceAnnounce {
    pub node_id: NodeId,
    /// Dialable transport address of this peer
    pub address: String,
    pub services: BTreeSet<String>,
    pub region: String,
    /// Base64 (URL-safe, no pad) ed25519 verifying key
    pub public_key: String,
    pub version: String,
    pub timestamp: f64,
}

/// Composite key identifying a registry entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// A replicated registry entry.
///
/// The gossip message carries only the content address plus metadata; the
/// payload itself lives in the blob store. Entries are never mutated in
/// place: a strictly newer timestamp for the same key supersedes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub entity_type: String,
    pub entity_id: String,
    /// Content address of the payload in the blob store
    pub content_address: String,
    pub timestamp: f64,
    pub publisher: NodeId,
    /// Base64 (URL-safe, no pad) ed25519 signature over [`Self::signable_bytes`]
    pub signature: String,
}

impl RegistryEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Canonical byte string covered by the signature (signature excluded)
    pub fn signable_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}",
            self.entity_type, self.entity_id, self.content_address, self.timestamp, self.publisher
        )
        .into_bytes()
    }
}
