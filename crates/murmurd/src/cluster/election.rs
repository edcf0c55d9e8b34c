//! Coordinator election.
//!
//! Every node runs the same state machine:
//! `NoCoordinator -> Electing -> Coordinator | Follower`.
//!
//! On entering `Electing` the node draws one uniform random priority in
//! [0, 1), broadcasts a claim, and starts a timer. A strictly higher
//! incoming claim aborts the candidacy; an unchallenged timer expiry makes
//! the node coordinator. There is no fencing token: a partition can
//! briefly yield two coordinators, resolved newest-state-wins when the
//! partition heals (see state.rs).

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use murmur_common::constants::topics;
use murmur_common::{
    CoordinatorAnnouncement, ElectionClaim, NetworkState, NodeId, unix_now,
};

use super::CoordinatorSlot;
use crate::transport::{Transport, publish_json};

/// Election state machine roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No coordinator known yet
    NoCoordinator,
    /// This node is a candidate inside an election window
    Electing,
    /// This node aggregates and broadcasts the network state
    Coordinator,
    /// Another node coordinates
    Follower,
}

/// One election window's candidacy. The window id keys the timer armed
/// for it, so a timer left over from an aborted window cannot end a
/// later one.
#[derive(Debug, Clone, Copy)]
struct Candidacy {
    window: u64,
    priority: f64,
}

/// Coordinator election service
pub struct ElectionService<T: Transport> {
    node_id: NodeId,
    transport: Arc<T>,
    slot: CoordinatorSlot,
    /// Read-only view into the local network-state replica, used to judge
    /// coordinator staleness
    view: Arc<RwLock<NetworkState>>,
    election_timeout: Duration,
    check_interval: Duration,
    staleness_secs: f64,
    /// Candidacy for the current election window, if any
    candidacy: Arc<RwLock<Option<Candidacy>>>,
    next_window: Arc<AtomicU64>,
}

impl<T: Transport> Clone for ElectionService<T> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            transport: self.transport.clone(),
            slot: self.slot.clone(),
            view: self.view.clone(),
            election_timeout: self.election_timeout,
            check_interval: self.check_interval,
            staleness_secs: self.staleness_secs,
            candidacy: self.candidacy.clone(),
            next_window: self.next_window.clone(),
        }
    }
}

impl<T: Transport> ElectionService<T> {
    pub fn new(
        node_id: NodeId,
        transport: Arc<T>,
        slot: CoordinatorSlot,
        view: Arc<RwLock<NetworkState>>,
        election_timeout: Duration,
        check_interval: Duration,
        staleness_secs: f64,
    ) -> Self {
        Self {
            node_id,
            transport,
            slot,
            view,
            election_timeout,
            check_interval,
            staleness_secs,
            candidacy: Arc::new(RwLock::new(None)),
            next_window: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run the election loop: periodic coordinator-liveness checks plus
    /// claim/announcement ingestion
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut claims_rx = self.transport.subscribe(topics::ELECTION).await;
        let mut announce_rx = self.transport.subscribe(topics::COORDINATOR).await;

        // Armed once; a sleep inside the select would be re-armed by every
        // inbound claim and starve the liveness check.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.check_interval,
            self.check_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            timeout = ?self.election_timeout,
            check_interval = ?self.check_interval,
            "🗳️ Election service started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maybe_start_election().await;
                }
                Some(bytes) = claims_rx.recv() => {
                    self.handle_claim(&bytes).await;
                }
                Some(bytes) = announce_rx.recv() => {
                    self.handle_announcement(&bytes).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("🗳️ Election service shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Start an election if there is no known coordinator, or the known
    /// coordinator has gone stale in the network view
    async fn maybe_start_election(&self) {
        if self.slot.role().await == Role::Electing {
            return;
        }

        let needs_election = match self.slot.coordinator().await {
            None => true,
            Some(coordinator) => {
                if coordinator == self.node_id {
                    false
                } else {
                    let view = self.view.read().await;
                    match view.nodes.get(&coordinator) {
                        None => true,
                        Some(info) => unix_now() - info.last_seen > self.staleness_secs,
                    }
                }
            }
        };

        if needs_election {
            self.begin_election().await;
        }
    }

    async fn begin_election(&self) {
        let priority = {
            let mut rng = rand::rng();
            rand::Rng::random::<f64>(&mut rng)
        };
        self.begin_election_with_priority(priority).await;
    }

    /// Enter the `Electing` state with the given priority, broadcast the
    /// claim, and arm the election timer. The priority is held for the
    /// whole window.
    pub(crate) async fn begin_election_with_priority(&self, priority: f64) {
        tracing::info!(priority, "Starting coordinator election");

        let window = self.next_window.fetch_add(1, Ordering::Relaxed);
        *self.candidacy.write().await = Some(Candidacy { window, priority });
        self.slot.set(Role::Electing, None).await;

        let claim = ElectionClaim {
            node_id: self.node_id.clone(),
            timestamp: unix_now(),
            priority,
        };
        if let Err(e) = publish_json(&*self.transport, topics::ELECTION, &claim).await {
            tracing::warn!(error = %e, "Failed to broadcast election claim");
        }

        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(service.election_timeout).await;
            service.finish_election(window).await;
        });
    }

    /// Timer expiry for `window`: claim coordination unless a higher claim
    /// superseded us or a newer window replaced this one
    async fn finish_election(&self, window: u64) {
        let still_candidate = matches!(
            *self.candidacy.read().await,
            Some(Candidacy { window: w, .. }) if w == window
        ) && self.slot.role().await == Role::Electing;
        if !still_candidate {
            return;
        }

        *self.candidacy.write().await = None;
        self.slot
            .set(Role::Coordinator, Some(self.node_id.clone()))
            .await;

        tracing::info!(node = %self.node_id, "👑 Became coordinator");

        let announcement = CoordinatorAnnouncement {
            node_id: self.node_id.clone(),
            timestamp: unix_now(),
        };
        if let Err(e) = publish_json(&*self.transport, topics::COORDINATOR, &announcement).await {
            tracing::warn!(error = %e, "Failed to broadcast coordinator announcement");
        }
    }

    /// A strictly higher-priority claim aborts our candidacy; we then wait
    /// for the winner's announcement
    pub(crate) async fn handle_claim(&self, bytes: &[u8]) {
        let claim: ElectionClaim = match serde_json::from_slice(bytes) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid election claim");
                return;
            }
        };

        if claim.node_id == self.node_id {
            return;
        }

        let ours = (*self.candidacy.read().await).map(|c| c.priority);
        let Some(our_priority) = ours else {
            return;
        };
        if self.slot.role().await != Role::Electing {
            return;
        }

        if claim.priority > our_priority {
            tracing::debug!(
                node = %claim.node_id,
                theirs = claim.priority,
                ours = our_priority,
                "Superseded by higher-priority claim"
            );
            *self.candidacy.write().await = None;
            self.slot.set(Role::Follower, None).await;
        }
    }

    /// Adopt the announced coordinator, whatever our current state
    pub(crate) async fn handle_announcement(&self, bytes: &[u8]) {
        let announcement: CoordinatorAnnouncement = match serde_json::from_slice(bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid coordinator announcement");
                return;
            }
        };

        *self.candidacy.write().await = None;

        if announcement.node_id == self.node_id {
            self.slot
                .set(Role::Coordinator, Some(self.node_id.clone()))
                .await;
            return;
        }

        if self.slot.role().await == Role::Coordinator {
            tracing::info!(new = %announcement.node_id, "Stepping down as coordinator");
        }
        self.slot
            .set(Role::Follower, Some(announcement.node_id.clone()))
            .await;
        tracing::info!(coordinator = %announcement.node_id, "Adopted coordinator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};

    async fn service(hub: &MemoryHub, id: &str, timeout_ms: u64) -> ElectionService<MemoryTransport> {
        ElectionService::new(
            NodeId::from(id),
            Arc::new(hub.attach().await),
            CoordinatorSlot::new(),
            Arc::new(RwLock::new(NetworkState::default())),
            Duration::from_millis(timeout_ms),
            Duration::from_secs(600),
            120.0,
        )
    }

    fn claim_bytes(id: &str, priority: f64) -> Vec<u8> {
        serde_json::to_vec(&ElectionClaim {
            node_id: NodeId::from(id),
            timestamp: unix_now(),
            priority,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_winner_election() {
        let hub = MemoryHub::new();
        let a = service(&hub, "a", 200).await;
        let b = service(&hub, "b", 200).await;
        let c = service(&hub, "c", 200).await;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        for svc in [a.clone(), b.clone(), c.clone()] {
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move { svc.run(rx).await });
        }
        // Let the run loops subscribe before anyone claims.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Claims only abort a candidacy that has already started, so stagger
        // the begins lowest-priority-first to keep the window deterministic.
        b.begin_election_with_priority(0.3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        c.begin_election_with_priority(0.6).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        a.begin_election_with_priority(0.9).await;

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(a.slot.role().await, Role::Coordinator);
        assert_eq!(b.slot.role().await, Role::Follower);
        assert_eq!(c.slot.role().await, Role::Follower);
        assert_eq!(b.slot.coordinator().await, Some(NodeId::from("a")));
        assert_eq!(c.slot.coordinator().await, Some(NodeId::from("a")));

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_lower_priority_claim_does_not_abort_candidacy() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "a", 50).await;

        svc.begin_election_with_priority(0.8).await;
        svc.handle_claim(&claim_bytes("b", 0.2)).await;
        assert_eq!(svc.slot.role().await, Role::Electing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(svc.slot.role().await, Role::Coordinator);
    }

    #[tokio::test]
    async fn test_higher_priority_claim_aborts_candidacy() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "a", 50).await;

        svc.begin_election_with_priority(0.4).await;
        svc.handle_claim(&claim_bytes("b", 0.7)).await;
        assert_eq!(svc.slot.role().await, Role::Follower);

        // The armed timer must not still promote us.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(svc.slot.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_end_later_window() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "a", 200).await;

        // First window, aborted by a higher claim; its timer stays armed.
        svc.begin_election_with_priority(0.4).await;
        svc.handle_claim(&claim_bytes("b", 0.7)).await;
        assert_eq!(svc.slot.role().await, Role::Follower);

        tokio::time::sleep(Duration::from_millis(100)).await;
        svc.begin_election_with_priority(0.9).await;

        // The first window's timer fires around now; the second window is
        // still open and must not be ended by it.
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert_eq!(svc.slot.role().await, Role::Electing);

        // The second window's own timer promotes us.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(svc.slot.role().await, Role::Coordinator);
    }

    #[tokio::test]
    async fn test_announcement_adopts_coordinator_in_any_state() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "a", 50).await;
        svc.slot.set(Role::Coordinator, Some(NodeId::from("a"))).await;

        let announcement = serde_json::to_vec(&CoordinatorAnnouncement {
            node_id: NodeId::from("b"),
            timestamp: unix_now(),
        })
        .unwrap();
        svc.handle_announcement(&announcement).await;

        assert_eq!(svc.slot.role().await, Role::Follower);
        assert_eq!(svc.slot.coordinator().await, Some(NodeId::from("b")));
    }

    #[tokio::test]
    async fn test_malformed_claim_is_dropped() {
        let hub = MemoryHub::new();
        let svc = service(&hub, "a", 50).await;

        svc.begin_election_with_priority(0.5).await;
        svc.handle_claim(b"not json").await;
        assert_eq!(svc.slot.role().await, Role::Electing);
    }
}
