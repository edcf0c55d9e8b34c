//! # Murmur Common
//!
//! Shared types, wire messages, and utilities used across Murmur components.
//!
//! ## Modules
//! - `types` - Core data structures (NodeId, NetworkState, RegistryEntry, etc.)
//! - `error` - Common error types
//! - `constants` - Gossip topics and default protocol timings

pub mod constants;
pub mod error;
pub mod types;

pub use error::MurmurError;
pub use types::*;
