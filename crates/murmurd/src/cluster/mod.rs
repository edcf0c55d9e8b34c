//! Cluster coordination modules.
//!
//! Implements:
//! - Coordinator election (randomized-priority broadcast + timeout)
//! - Network state aggregation (coordinator-only, heartbeat-fed)
//! - Replicated LWW registry

mod election;
mod registry;
mod state;

pub use election::{ElectionService, Role};
pub use registry::Registry;
pub use state::{ResourceMonitor, StateService, SyntheticMonitor};

use std::sync::Arc;
use tokio::sync::RwLock;

use murmur_common::NodeId;

/// Shared view of this node's coordination role.
///
/// Written by the election service and by state-broadcast adoption; read
/// by the aggregator to decide whether to run its coordinator-only cycle.
#[derive(Clone)]
pub struct CoordinatorSlot {
    inner: Arc<RwLock<SlotInner>>,
}

struct SlotInner {
    role: Role,
    coordinator: Option<NodeId>,
}

impl CoordinatorSlot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SlotInner {
                role: Role::NoCoordinator,
                coordinator: None,
            })),
        }
    }

    pub async fn role(&self) -> Role {
        self.inner.read().await.role
    }

    pub async fn coordinator(&self) -> Option<NodeId> {
        self.inner.read().await.coordinator.clone()
    }

    pub async fn is_coordinator(&self) -> bool {
        self.inner.read().await.role == Role::Coordinator
    }

    pub(crate) async fn set(&self, role: Role, coordinator: Option<NodeId>) {
        let mut inner = self.inner.write().await;
        inner.role = role;
        inner.coordinator = coordinator;
    }
}

impl Default for CoordinatorSlot {
    fn default() -> Self {
        Self::new()
    }
}
