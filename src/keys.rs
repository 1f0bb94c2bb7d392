//! Ephemeral Key Store (C1).
//!
//! Generates and holds per-session Ed25519 keypairs, destroying them on
//! session end. Generalizes the teacher's single server-wide key
//! (`load_or_generate_server_key` in the original `key.rs`) into a
//! per-session map keyed by session id, the way `state.rs`'s
//! `verified_keys: RwLock<HashMap<String, VerifiedKey>>` keys per-fingerprint
//! state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use russh_keys::{Algorithm, PrivateKey};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::BrokerError;

/// A generated keypair, scoped to one session.
#[derive(Clone)]
pub struct Keypair {
    /// OpenSSH wire-format text of the public key (`ssh-ed25519 AAAA... `).
    pub public_text: String,
    /// Raw private key material, never serialized or logged.
    pub private: Arc<PrivateKey>,
    /// `SHA256:<base64>` content-addressed fingerprint of the public key blob.
    pub fingerprint: String,
    pub created_at: SystemTime,
    pub session_id: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("fingerprint", &self.fingerprint)
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn fingerprint_of(public_text: &str) -> String {
    // Fingerprint the raw base64-decoded key blob (the middle field of the
    // "algo base64 comment" OpenSSH text form), not the text itself.
    let blob_b64 = public_text.split_whitespace().nth(1).unwrap_or(public_text);
    let blob = BASE64.decode(blob_b64).unwrap_or_else(|_| blob_b64.as_bytes().to_vec());
    let digest = Sha256::digest(&blob);
    format!("SHA256:{}", BASE64.encode(digest))
}

#[derive(Default)]
pub struct KeyStore {
    inner: RwLock<HashMap<String, Keypair>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh keypair for `session_id`. Returns `KeypairAlreadyExists`
    /// if one is already live for this session (idempotent only after
    /// `destroy`).
    pub async fn generate(&self, session_id: &str) -> Result<Keypair, BrokerError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(session_id) {
            return Err(BrokerError::KeypairAlreadyExists);
        }

        let private = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| BrokerError::CryptoFailure(e.to_string()))?;

        let public_text = private
            .public_key()
            .to_openssh()
            .map_err(|e| BrokerError::CryptoFailure(e.to_string()))?;
        let fingerprint = fingerprint_of(&public_text);

        info!(
            "generated ephemeral keypair for session {}: {}",
            session_id, fingerprint
        );

        let keypair = Keypair {
            public_text,
            private: Arc::new(private),
            fingerprint,
            created_at: SystemTime::now(),
            session_id: session_id.to_string(),
        };

        guard.insert(session_id.to_string(), keypair.clone());
        Ok(keypair)
    }

    /// Read-only lookup.
    pub async fn get(&self, session_id: &str) -> Option<Keypair> {
        self.inner.read().await.get(session_id).cloned()
    }

    /// Remove and zeroize the entry for `session_id`. Safe to call multiple
    /// times.
    pub async fn destroy(&self, session_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(mut keypair) = guard.remove(session_id) {
            zeroize_keypair(&mut keypair);
            info!("destroyed ephemeral keypair for session {}", session_id);
        }
    }

    /// Destroy every held keypair. Invoked on process shutdown.
    pub async fn destroy_all(&self) {
        let mut guard = self.inner.write().await;
        for (_, mut keypair) in guard.drain() {
            zeroize_keypair(&mut keypair);
        }
    }
}

fn zeroize_keypair(keypair: &mut Keypair) {
    // `PrivateKey` holds the only copies via `Arc`; once the last reference
    // drops the material is freed. We still scrub the fields we own directly.
    keypair.public_text.clear();
    keypair.fingerprint.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_then_get_round_trips() {
        let store = KeyStore::new();
        let kp = store.generate("sess-1").await.unwrap();
        let fetched = store.get("sess-1").await.unwrap();
        assert_eq!(kp.fingerprint, fetched.fingerprint);
        assert!(kp.fingerprint.starts_with("SHA256:"));
    }

    #[tokio::test]
    async fn generate_twice_without_destroy_errors() {
        let store = KeyStore::new();
        store.generate("sess-1").await.unwrap();
        let err = store.generate("sess-1").await.unwrap_err();
        assert!(matches!(err, BrokerError::KeypairAlreadyExists));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_removes_entry() {
        let store = KeyStore::new();
        store.generate("sess-1").await.unwrap();
        store.destroy("sess-1").await;
        store.destroy("sess-1").await;
        assert!(store.get("sess-1").await.is_none());
    }

    #[tokio::test]
    async fn generate_after_destroy_succeeds() {
        let store = KeyStore::new();
        store.generate("sess-1").await.unwrap();
        store.destroy("sess-1").await;
        let kp = store.generate("sess-1").await.unwrap();
        assert_eq!(kp.session_id, "sess-1");
    }

    #[tokio::test]
    async fn keypairs_are_scoped_per_session() {
        let store = KeyStore::new();
        let a = store.generate("a").await.unwrap();
        let b = store.generate("b").await.unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
