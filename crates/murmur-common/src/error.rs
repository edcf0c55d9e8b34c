//! Common error types for Murmur components.

use thiserror::Error;

/// Common errors across Murmur components
#[derive(Debug, Error)]
pub enum MurmurError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport send/receive/dial error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Blob store error (unknown address, write failure)
    #[error("Blob store error: {0}")]
    Blob(String),

    /// Signing or verification error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Registry operation error
    #[error("Registry error: {0}")]
    Registry(String),

    /// Cluster coordination error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Malformed or unverifiable inbound message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl MurmurError {
    /// Returns true if this error should be retried on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Blob(_) | Self::Timeout(_) | Self::Cluster(_)
        )
    }
}
