//! Network state aggregation and queries.
//!
//! Every node publishes a heartbeat each cycle and ingests the heartbeats
//! it hears. Only the current coordinator aggregates: evict stale nodes,
//! rebuild the service/region indices, stamp `last_updated`, and broadcast
//! the full state (no deltas). Followers adopt any strictly fresher
//! broadcast wholesale; a coordinator that sees a fresher broadcast from
//! someone else steps down on the spot.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use murmur_common::constants::topics;
use murmur_common::{
    HeartbeatRecord, NetworkState, NodeId, ResourceUsage, StateBroadcast, unix_now,
};

use super::{CoordinatorSlot, Role};
use crate::transport::{Transport, publish_json};

/// Source of this node's resource readings for heartbeats
pub trait ResourceMonitor: Send + Sync + 'static {
    fn sample(&self) -> ResourceUsage;
}

/// Placeholder monitor reporting randomized usage.
///
/// Stands in until a real probe is wired up; selection quality only
/// depends on relative ordering across nodes, which real heartbeats
/// provide.
pub struct SyntheticMonitor;

impl ResourceMonitor for SyntheticMonitor {
    fn sample(&self) -> ResourceUsage {
        use rand::Rng;
        let mut rng = rand::rng();
        ResourceUsage {
            cpu_pct: rng.random_range(10.0..90.0),
            mem_pct: rng.random_range(20.0..80.0),
            gpu_pct: rng.random_range(0.0..100.0),
            bandwidth: rng.random_range(50.0..200.0),
        }
    }
}

/// Heartbeat emission, state aggregation, and the query surface
pub struct StateService<T: Transport> {
    node_id: NodeId,
    transport: Arc<T>,
    slot: CoordinatorSlot,
    /// Local replica; authoritative only while this node coordinates
    view: Arc<RwLock<NetworkState>>,
    monitor: Arc<dyn ResourceMonitor>,
    services: BTreeSet<String>,
    region: String,
    heartbeat_interval: Duration,
    staleness_secs: f64,
}

impl<T: Transport> Clone for StateService<T> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            transport: self.transport.clone(),
            slot: self.slot.clone(),
            view: self.view.clone(),
            monitor: self.monitor.clone(),
            services: self.services.clone(),
            region: self.region.clone(),
            heartbeat_interval: self.heartbeat_interval,
            staleness_secs: self.staleness_secs,
        }
    }
}

impl<T: Transport> StateService<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        transport: Arc<T>,
        slot: CoordinatorSlot,
        view: Arc<RwLock<NetworkState>>,
        monitor: Arc<dyn ResourceMonitor>,
        services: BTreeSet<String>,
        region: String,
        heartbeat_interval: Duration,
        staleness_secs: f64,
    ) -> Self {
        Self {
            node_id,
            transport,
            slot,
            view,
            monitor,
            services,
            region,
            heartbeat_interval,
            staleness_secs,
        }
    }

    /// Run the state loop: heartbeat each cycle, aggregate while
    /// coordinator, ingest inbound heartbeats and state broadcasts
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut heartbeat_rx = self.transport.subscribe(topics::HEARTBEAT).await;
        let mut state_rx = self.transport.subscribe(topics::STATE).await;

        // A standalone interval keeps the cadence fixed; a sleep inside the
        // select would be re-armed by every inbound message and starve the
        // periodic branch under traffic.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval = ?self.heartbeat_interval,
            staleness = self.staleness_secs,
            "💓 State service started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish_heartbeat().await;
                    if self.slot.is_coordinator().await {
                        self.aggregate_and_broadcast().await;
                    }
                }
                Some(bytes) = heartbeat_rx.recv() => {
                    self.handle_heartbeat(&bytes).await;
                }
                Some(bytes) = state_rx.recv() => {
                    self.handle_state_broadcast(&bytes).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("💓 State service shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Emit this node's heartbeat and mirror it into the local view so the
    /// coordinator never evicts itself
    async fn publish_heartbeat(&self) {
        let heartbeat = HeartbeatRecord {
            node_id: self.node_id.clone(),
            timestamp: unix_now(),
            services: self.services.clone(),
            resources: self.monitor.sample(),
            region: self.region.clone(),
        };

        self.view.write().await.upsert(heartbeat.clone());

        if let Err(e) = publish_json(&*self.transport, topics::HEARTBEAT, &heartbeat).await {
            tracing::warn!(error = %e, "Failed to publish heartbeat");
        }
    }

    /// Upsert an inbound heartbeat immediately, independent of the
    /// aggregation cycle
    pub(crate) async fn handle_heartbeat(&self, bytes: &[u8]) {
        let heartbeat: HeartbeatRecord = match serde_json::from_slice(bytes) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid heartbeat");
                return;
            }
        };

        if heartbeat.node_id == self.node_id {
            return;
        }

        tracing::trace!(node = %heartbeat.node_id, "Heartbeat received");
        self.view.write().await.upsert(heartbeat);
    }

    /// Coordinator-only cycle: evict, reindex, stamp, broadcast full state
    pub(crate) async fn aggregate_and_broadcast(&self) {
        let now = unix_now();
        let snapshot = {
            let mut view = self.view.write().await;
            let evicted = view.evict_stale(now, self.staleness_secs);
            for node in &evicted {
                tracing::info!(node = %node, "Evicted stale node from network view");
            }
            view.reindex();
            view.last_updated = now;
            view.clone()
        };

        let broadcast = StateBroadcast {
            coordinator: self.node_id.clone(),
            timestamp: now,
            state: snapshot,
        };
        if let Err(e) = publish_json(&*self.transport, topics::STATE, &broadcast).await {
            tracing::warn!(error = %e, "Failed to broadcast network state");
        }
    }

    /// Adopt a strictly fresher state broadcast: replace the replica,
    /// record its coordinator, and step down if we thought we coordinated
    pub(crate) async fn handle_state_broadcast(&self, bytes: &[u8]) {
        let broadcast: StateBroadcast = match serde_json::from_slice(bytes) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid state broadcast");
                return;
            }
        };

        {
            let mut view = self.view.write().await;
            if broadcast.timestamp <= view.last_updated {
                tracing::trace!(coordinator = %broadcast.coordinator, "Ignoring older state broadcast");
                return;
            }
            *view = broadcast.state;
        }

        if broadcast.coordinator == self.node_id {
            self.slot
                .set(Role::Coordinator, Some(self.node_id.clone()))
                .await;
            return;
        }

        if self.slot.role().await == Role::Coordinator {
            tracing::info!(new = %broadcast.coordinator, "Stepping down as coordinator");
        }
        self.slot
            .set(Role::Follower, Some(broadcast.coordinator))
            .await;
    }

    /// Nodes currently offering `service`
    pub async fn get_service_nodes(&self, service: &str) -> Vec<NodeId> {
        let view = self.view.read().await;
        view.services
            .get(service)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes currently in `region`
    pub async fn get_region_nodes(&self, region: &str) -> Vec<NodeId> {
        let view = self.view.read().await;
        view.regions
            .get(region)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Least-loaded node offering `service`, optionally confined to
    /// `region`. Equal scores resolve to the lexicographically smallest
    /// NodeId (strict `<` over ordered iteration).
    pub async fn get_optimal_node(&self, service: &str, region: Option<&str>) -> Option<NodeId> {
        let view = self.view.read().await;

        let candidates = view.services.get(service)?;
        let region_filter = region.and_then(|r| view.regions.get(r));

        let mut best: Option<(NodeId, f64)> = None;
        for node_id in candidates {
            if let Some(in_region) = region_filter {
                if !in_region.contains(node_id) {
                    continue;
                }
            } else if region.is_some() {
                // Region named but empty: nothing can match.
                return None;
            }

            let Some(info) = view.nodes.get(node_id) else {
                continue;
            };
            let score = info.resources.load_score();

            match &best {
                Some((_, best_score)) if score >= *best_score => {}
                _ => best = Some((node_id.clone(), score)),
            }
        }

        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    async fn service(hub: &MemoryHub, id: &str) -> StateService<MemoryTransport> {
        service_with_interval(hub, id, Duration::from_secs(30)).await
    }

    async fn service_with_interval(
        hub: &MemoryHub,
        id: &str,
        interval: Duration,
    ) -> StateService<MemoryTransport> {
        StateService::new(
            NodeId::from(id),
            Arc::new(hub.attach().await),
            CoordinatorSlot::new(),
            Arc::new(RwLock::new(NetworkState::default())),
            Arc::new(SyntheticMonitor),
            BTreeSet::from(["infer".to_string()]),
            "us".to_string(),
            interval,
            120.0,
        )
    }

    fn heartbeat_bytes(id: &str, ts: f64, services: &[&str], region: &str, load: f64) -> Vec<u8> {
        serde_json::to_vec(&HeartbeatRecord {
            node_id: NodeId::from(id),
            timestamp: ts,
            services: services.iter().map(|s| s.to_string()).collect(),
            resources: ResourceUsage {
                cpu_pct: load,
                mem_pct: load,
                gpu_pct: load,
                bandwidth: 100.0,
            },
            region: region.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeats_keep_cadence_under_inbound_traffic() {
        let hub = MemoryHub::new();
        let svc = service_with_interval(&hub, "svc", Duration::from_millis(100)).await;
        let observer = hub.attach().await;
        let mut hb_rx = observer.subscribe(topics::HEARTBEAT).await;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let run = svc.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { run.run(rx).await });

        // A peer heartbeating far faster than svc's own interval; the
        // inbound stream must not reset svc's periodic timer.
        let chatty = hub.attach().await;
        tokio::spawn(async move {
            loop {
                let bytes = heartbeat_bytes("chatty", unix_now(), &["infer"], "us", 10.0);
                let _ = chatty.publish(topics::HEARTBEAT, bytes).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let mut own = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1000);
        while tokio::time::Instant::now() < deadline {
            let Ok(Some(bytes)) =
                tokio::time::timeout(Duration::from_millis(200), hb_rx.recv()).await
            else {
                break;
            };
            let hb: HeartbeatRecord = serde_json::from_slice(&bytes).unwrap();
            if hb.node_id == NodeId::from("svc") {
                own += 1;
            }
        }

        assert!(own >= 5, "svc published only {own} heartbeats under traffic");
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_eviction_removes_node_from_view_and_indices() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "coord").await;
        svc.slot.set(Role::Coordinator, Some(NodeId::from("coord"))).await;

        let now = unix_now();
        svc.handle_heartbeat(&heartbeat_bytes("fresh", now, &["infer"], "us", 10.0))
            .await;
        svc.handle_heartbeat(&heartbeat_bytes("stale", now - 300.0, &["infer"], "eu", 10.0))
            .await;

        svc.aggregate_and_broadcast().await;

        let view = svc.view.read().await;
        assert!(!view.contains(&NodeId::from("stale")));
        assert!(view.contains(&NodeId::from("fresh")));
        assert!(!view.services["infer"].contains(&NodeId::from("stale")));
        assert!(!view.regions.contains_key("eu"));
    }

    #[tokio::test]
    async fn test_optimal_node_prefers_lowest_load() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "coord").await;

        let now = unix_now();
        svc.handle_heartbeat(&heartbeat_bytes("x", now, &["infer"], "us", 10.0))
            .await;
        svc.handle_heartbeat(&heartbeat_bytes("y", now, &["infer"], "us", 50.0))
            .await;
        svc.view.write().await.reindex();

        assert_eq!(
            svc.get_optimal_node("infer", None).await,
            Some(NodeId::from("x"))
        );
        assert_eq!(svc.get_optimal_node("train", None).await, None);
    }

    #[tokio::test]
    async fn test_optimal_node_tie_breaks_lexicographically() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "coord").await;

        let now = unix_now();
        svc.handle_heartbeat(&heartbeat_bytes("zeta", now, &["infer"], "us", 25.0))
            .await;
        svc.handle_heartbeat(&heartbeat_bytes("alpha", now, &["infer"], "us", 25.0))
            .await;
        svc.view.write().await.reindex();

        assert_eq!(
            svc.get_optimal_node("infer", None).await,
            Some(NodeId::from("alpha"))
        );
    }

    #[tokio::test]
    async fn test_optimal_node_respects_region_filter() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "coord").await;

        let now = unix_now();
        svc.handle_heartbeat(&heartbeat_bytes("cheap-us", now, &["infer"], "us", 10.0))
            .await;
        svc.handle_heartbeat(&heartbeat_bytes("busy-eu", now, &["infer"], "eu", 80.0))
            .await;
        svc.view.write().await.reindex();

        assert_eq!(
            svc.get_optimal_node("infer", Some("eu")).await,
            Some(NodeId::from("busy-eu"))
        );
        assert_eq!(svc.get_optimal_node("infer", Some("ap")).await, None);
    }

    #[tokio::test]
    async fn test_fresher_broadcast_demotes_coordinator() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "old-coord").await;
        svc.slot
            .set(Role::Coordinator, Some(NodeId::from("old-coord")))
            .await;

        let mut state = NetworkState::default();
        state.last_updated = unix_now() + 10.0;
        let bytes = serde_json::to_vec(&StateBroadcast {
            coordinator: NodeId::from("new-coord"),
            timestamp: state.last_updated,
            state,
        })
        .unwrap();
        svc.handle_state_broadcast(&bytes).await;

        assert_eq!(svc.slot.role().await, Role::Follower);
        assert_eq!(svc.slot.coordinator().await, Some(NodeId::from("new-coord")));
    }

    #[tokio::test]
    async fn test_stale_broadcast_is_ignored() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "coord").await;
        svc.slot.set(Role::Coordinator, Some(NodeId::from("coord"))).await;
        svc.view.write().await.last_updated = unix_now();

        let bytes = serde_json::to_vec(&StateBroadcast {
            coordinator: NodeId::from("other"),
            timestamp: 1.0,
            state: NetworkState::default(),
        })
        .unwrap();
        svc.handle_state_broadcast(&bytes).await;

        assert_eq!(svc.slot.role().await, Role::Coordinator);
    }
}
