//! Shared constants for Murmur components.

/// Default UDP bind address for the gossip transport
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7946";

/// Default heartbeat interval (seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default election window before claiming coordination (seconds)
pub const DEFAULT_ELECTION_TIMEOUT_SECS: u64 = 10;

/// Default interval between coordinator-liveness checks (seconds)
pub const DEFAULT_ELECTION_CHECK_INTERVAL_SECS: u64 = 60;

/// Default staleness threshold before a node is evicted from the
/// network view (seconds)
pub const DEFAULT_STALENESS_THRESHOLD_SECS: u64 = 120;

/// Default interval between presence broadcasts and peer reconciliation
/// cycles (seconds)
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 60;

/// Maximum peers dialed per reconcile cycle (connection-storm guard)
pub const RECONNECT_SAMPLE: usize = 5;

/// Gossip topic names
pub mod topics {
    /// Peer presence announcements: identity, address, services, public key
    pub const PRESENCE: &str = "murmur/presence";

    /// Per-node heartbeats consumed by the coordinator
    pub const HEARTBEAT: &str = "murmur/heartbeat";

    /// Election claims during a coordinator election window
    pub const ELECTION: &str = "murmur/election";

    /// Coordinator announcements at the end of an election
    pub const COORDINATOR: &str = "murmur/coordinator";

    /// Full network-state broadcasts from the coordinator
    pub const STATE: &str = "murmur/state";

    /// Replicated registry entry updates
    pub const REGISTRY: &str = "murmur/registry";
}
