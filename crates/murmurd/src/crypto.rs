//! Node identity and message authentication.
//!
//! Every node signs the registry entries it publishes with an ed25519 key.
//! Verifying keys travel in presence announcements, so a node learns its
//! peers' keys as it discovers them. The original network-layer behavior
//! of accepting any signature survives only as the loudly-named
//! [`KeyRing::insecure_allow_all`] used by tests; `murmurd` always wires
//! the strict policy.

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use murmur_common::NodeId;

/// This node's signing identity
pub struct Identity {
    node_id: NodeId,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Identity {
    /// Load the identity from a 32-byte key file, or generate an ephemeral
    /// keypair when no path is configured
    pub fn load_or_generate(node_id: NodeId, key_path: Option<&str>) -> Result<Self> {
        let signing_key = if let Some(path) = key_path {
            let key_bytes = std::fs::read(path).context("Failed to read private key file")?;

            if key_bytes.len() != 32 {
                bail!("Invalid private key length (expected 32 bytes)");
            }

            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&key_bytes);
            SigningKey::from_bytes(&bytes)
        } else {
            // Generate ephemeral key using OsRng (compatible with ed25519-dalek)
            use rand_core::OsRng;
            tracing::warn!("Using ephemeral identity key (will change on restart)");
            SigningKey::generate(&mut OsRng)
        };

        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            node_id,
            signing_key,
            verifying_key,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sign `bytes`, returning the base64 signature
    pub fn sign(&self, bytes: &[u8]) -> String {
        let signature = self.signing_key.sign(bytes);
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }

    /// Our verifying key as base64, as carried in presence announcements
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
    }
}

/// Verification policy applied to inbound signed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyPolicy {
    /// Unknown publisher or bad signature rejects the message
    Strict,
    /// Accept everything. Test-only; never the daemon default.
    InsecureAllowAll,
}

/// Known peer verifying keys plus the verification policy
#[derive(Clone)]
pub struct KeyRing {
    policy: VerifyPolicy,
    keys: Arc<RwLock<HashMap<NodeId, VerifyingKey>>>,
}

impl KeyRing {
    /// Strict keyring with no pre-seeded keys
    pub fn strict() -> Self {
        Self {
            policy: VerifyPolicy::Strict,
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Strict keyring pre-seeded from config (node_id -> base64 pubkey)
    pub fn strict_with_keys(seed: &HashMap<String, String>) -> Result<Self> {
        let mut keys = HashMap::new();
        for (node_id, pubkey_b64) in seed {
            keys.insert(NodeId::from(node_id.as_str()), decode_key(pubkey_b64)?);
        }
        Ok(Self {
            policy: VerifyPolicy::Strict,
            keys: Arc::new(RwLock::new(keys)),
        })
    }

    /// Keyring that accepts every signature without looking at it.
    ///
    /// This preserves the legacy "assume valid" behavior for tests; it must
    /// never be wired into a production node.
    pub fn insecure_allow_all() -> Self {
        tracing::warn!("KeyRing accepting ALL signatures - test use only");
        Self {
            policy: VerifyPolicy::InsecureAllowAll,
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Learn a peer's verifying key at runtime (from its presence announce)
    pub async fn add_peer_key(&self, node_id: &NodeId, pubkey_b64: &str) -> Result<()> {
        let key = decode_key(pubkey_b64)?;
        self.keys.write().await.insert(node_id.clone(), key);
        tracing::debug!(node = %node_id, "Learned peer public key");
        Ok(())
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.keys.read().await.contains_key(node_id)
    }

    /// Verify `sig_b64` over `bytes` for `publisher`
    pub async fn verify(&self, publisher: &NodeId, bytes: &[u8], sig_b64: &str) -> bool {
        if self.policy == VerifyPolicy::InsecureAllowAll {
            return true;
        }

        let keys = self.keys.read().await;
        let Some(key) = keys.get(publisher) else {
            tracing::debug!(publisher = %publisher, "No key for publisher");
            return false;
        };

        let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(sig_b64) else {
            return false;
        };
        if sig_bytes.len() != 64 {
            return false;
        }

        let mut sig_array = [0u8; 64];
        sig_array.copy_from_slice(&sig_bytes);
        let signature = Signature::from_bytes(&sig_array);

        key.verify(bytes, &signature).is_ok()
    }
}

fn decode_key(pubkey_b64: &str) -> Result<VerifyingKey> {
    let pubkey_bytes = URL_SAFE_NO_PAD
        .decode(pubkey_b64)
        .context("Failed to decode public key")?;

    if pubkey_bytes.len() != 32 {
        bail!("Invalid public key length");
    }

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&pubkey_bytes);
    VerifyingKey::from_bytes(&bytes).context("Invalid public key")
}
