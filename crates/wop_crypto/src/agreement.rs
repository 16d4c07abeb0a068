//! X25519 key agreement and per-connection ephemeral pairs.
//!
//! The shared symmetric key is SHA-256 of the raw X25519 output; both the
//! forward-secret path (ephemeral × ephemeral) and the legacy static path
//! (long-term kx × long-term kx) derive keys the same way.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::identity::PublicKeyBytes;

/// 32-byte AEAD key = SHA-256(X25519(our_secret, their_public)).
pub fn derive_shared(our_secret: &[u8; 32], their_public: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*our_secret);
    let public = X25519Public::from(*their_public);
    let shared = secret.diffie_hellman(&public);
    Sha256::digest(shared.as_bytes()).into()
}

/// Short-lived X25519 pair, one per outbound dial and per accepted inbound
/// connection. Never persisted.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralPair {
    #[zeroize(skip)]
    pub kx_pub: PublicKeyBytes,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub created: DateTime<Utc>,
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

impl EphemeralPair {
    pub fn generate(ttl: Duration) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let now = Utc::now();
        Self {
            kx_pub: PublicKeyBytes(public.as_bytes().to_vec()),
            secret: secret.to_bytes(),
            created: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Derive the shared key against a remote public key (ephemeral or
    /// static — the caller decides which path this connection negotiated).
    pub fn derive_shared(&self, their_public: &PublicKeyBytes) -> Result<[u8; 32], CryptoError> {
        Ok(derive_shared(&self.secret, &their_public.as_array()?))
    }
}
