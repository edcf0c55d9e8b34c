//! Content-addressable blob store interface.
//!
//! Registry payloads are persisted out-of-band: the gossip message carries
//! only the content address plus metadata. Addresses are the lowercase hex
//! SHA-256 of the stored bytes, so any replica can verify what it fetched.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use murmur_common::MurmurError;

/// Out-of-band payload storage keyed by content address
pub trait BlobStore: Send + Sync + 'static {
    /// Store `bytes`, returning their content address
    fn put(&self, bytes: Vec<u8>) -> impl Future<Output = Result<String>> + Send;

    /// Fetch the bytes for `addr`; unknown addresses are an error the
    /// caller treats as transient
    fn get(&self, addr: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Hex SHA-256 content address for `bytes`
pub fn content_address(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory blob store used in tests
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let addr = content_address(&bytes);
        self.blobs.write().await.insert(addr.clone(), bytes);
        Ok(addr)
    }

    async fn get(&self, addr: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(addr)
            .cloned()
            .ok_or_else(|| MurmurError::Blob(format!("unknown address {addr}")).into())
    }
}

/// Blob store persisting one file per address under a data directory
#[derive(Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    /// Create the store, making the data directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }
}

impl BlobStore for DiskBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let addr = content_address(&bytes);
        let path = self.root.join(&addr);
        // Existing file already holds identical bytes (same hash).
        if !path.exists() {
            tokio::fs::write(&path, &bytes).await?;
        }
        Ok(addr)
    }

    async fn get(&self, addr: &str) -> Result<Vec<u8>> {
        // Addresses are hex digests; reject anything path-like.
        if !addr.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MurmurError::Blob(format!("malformed address {addr}")).into());
        }

        let path = self.root.join(addr);
        tokio::fs::read(&path)
            .await
            .map_err(|_| MurmurError::Blob(format!("unknown address {addr}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_put_get_round_trip() {
        let store = MemoryBlobStore::new();
        let addr = store.put(b"payload".to_vec()).await.unwrap();

        assert_eq!(addr, content_address(b"payload"));
        assert_eq!(addr.len(), 64);
        assert_eq!(store.get(&addr).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_unknown_address_is_error() {
        let store = MemoryBlobStore::new();
        assert!(store.get(&content_address(b"never stored")).await.is_err());
    }

    #[test]
    fn test_content_address_is_deterministic() {
        assert_eq!(content_address(b"abc"), content_address(b"abc"));
        assert_ne!(content_address(b"abc"), content_address(b"abd"));
    }
}
