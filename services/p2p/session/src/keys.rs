//! Local identity keys and the key-management collaborator.

use crate::error::KeyError;
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use dashmap::DashMap;
use p2p_wire::{HoldingIdentity, NONCE_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

/// Static X25519 key pair of a locally hosted identity
#[derive(Clone)]
pub struct IdentityKeyPair {
    identity: HoldingIdentity,
    secret: [u8; 32],
    public: [u8; 32],
}

impl IdentityKeyPair {
    /// Generate a fresh key pair
    pub fn generate(identity: HoldingIdentity) -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(identity, secret)
    }

    /// Build from an existing secret
    pub fn from_secret(identity: HoldingIdentity, secret: [u8; 32]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        Self {
            identity,
            secret,
            public,
        }
    }

    /// Identity the keys belong to
    pub fn identity(&self) -> &HoldingIdentity {
        &self.identity
    }

    /// Public key bytes
    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Identities hosted on this node
#[derive(Default)]
pub struct LocalIdentities {
    keys: DashMap<HoldingIdentity, Arc<IdentityKeyPair>>,
}

impl LocalIdentities {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Host an identity
    pub fn add(&self, keys: IdentityKeyPair) -> Arc<IdentityKeyPair> {
        let keys = Arc::new(keys);
        self.keys.insert(keys.identity().clone(), keys.clone());
        keys
    }

    /// Keys of a hosted identity
    pub fn get(&self, identity: &HoldingIdentity) -> Option<Arc<IdentityKeyPair>> {
        self.keys.get(identity).map(|k| k.clone())
    }
}

/// Protects session secrets at rest
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Encrypt `plaintext` under the key named `alias`
    async fn encrypt(&self, plaintext: &[u8], alias: &str) -> Result<Vec<u8>, KeyError>;

    /// Decrypt bytes produced by [`KeyManagement::encrypt`]
    async fn decrypt(&self, ciphertext: &[u8], alias: &str) -> Result<Vec<u8>, KeyError>;
}

/// In-process key management: one ChaCha20-Poly1305 key per alias.
///
/// Output layout is `nonce (12) || ciphertext || tag (16)`; the alias is bound
/// as associated data.
#[derive(Default)]
pub struct LocalKeyManagement {
    keys: DashMap<String, [u8; 32]>,
}

impl LocalKeyManagement {
    /// Create with no keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key under `alias`
    pub fn with_key(self, alias: &str, key: [u8; 32]) -> Self {
        self.keys.insert(alias.to_string(), key);
        self
    }

    /// Generate a random key for `alias` unless one exists
    pub fn ensure_key(&self, alias: &str) {
        self.keys.entry(alias.to_string()).or_insert_with(|| {
            debug!("Generating state key for alias {}", alias);
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            key
        });
    }

    fn cipher(&self, alias: &str) -> Result<ChaCha20Poly1305, KeyError> {
        self.keys
            .get(alias)
            .map(|key| ChaCha20Poly1305::new(Key::from_slice(key.value())))
            .ok_or_else(|| KeyError::UnknownAlias(alias.to_string()))
    }
}

#[async_trait]
impl KeyManagement for LocalKeyManagement {
    async fn encrypt(&self, plaintext: &[u8], alias: &str) -> Result<Vec<u8>, KeyError> {
        let cipher = self.cipher(alias)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| KeyError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8], alias: &str) -> Result<Vec<u8>, KeyError> {
        let cipher = self.cipher(alias)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(KeyError::Malformed);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: alias.as_bytes(),
                },
            )
            .map_err(|_| KeyError::Decrypt)
    }
}
