//! Node identity key management
//!
//! Each node owns exactly one long-term `Identity`: an Ed25519 signing pair
//! plus an X25519 key-agreement pair. The signing public key is the node's
//! name on the overlay — its 8-hex-char `short_id` is the human handle, and
//! SHA-256 of the full key is the DHT rendezvous topic.
//!
//! Rotation policy
//! ---------------
//! A rotation replaces both pairs atomically and produces a `KeyRotation`
//! record signed by the OLD signing key (see `rotation`). `rotated_from`
//! remembers the previous signing public key so the invariant "if
//! `rotated_from` is set, a signed rotation record exists linking old to new"
//! can be checked by callers that persist both.
//!
//! Private halves never leave the process; persistence of secret bytes is the
//! store's concern and files carrying them are owner-only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Newtype wrapper ───────────────────────────────────────────────────────────

/// 32-byte public key (Ed25519 or X25519), base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub Vec<u8>);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Public key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_array(&self) -> Result<[u8; 32], CryptoError> {
        self.0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key not 32 bytes".into()))
    }

    /// First 8 lowercase hex chars of SHA-256 of the key — the short id used
    /// everywhere a human refers to a peer.
    pub fn short_id(&self) -> String {
        short_id(&self.0)
    }

    /// Human-readable fingerprint for out-of-band comparison: SHA-256 of the
    /// key, truncated to 20 bytes, hex in groups of 4.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.0);
        let hex = hex::encode(&hash[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// First 8 lowercase hex chars of SHA-256(pub).
pub fn short_id(public: &[u8]) -> String {
    let hash = Sha256::digest(public);
    hex::encode(&hash[..4])
}

/// 32-byte DHT rendezvous key: SHA-256(pub), used verbatim.
pub fn topic_of(public: &[u8]) -> [u8; 32] {
    Sha256::digest(public).into()
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Long-term node identity. Drop clears secret memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    pub sign_pub: PublicKeyBytes,
    sign_secret: [u8; 32],
    #[zeroize(skip)]
    pub kx_pub: PublicKeyBytes,
    kx_secret: [u8; 32],
    #[zeroize(skip)]
    pub created: DateTime<Utc>,
    #[zeroize(skip)]
    pub rotated_from: Option<PublicKeyBytes>,
    #[zeroize(skip)]
    pub rotated_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let kx = StaticSecret::random_from_rng(OsRng);
        let kx_pub = X25519Public::from(&kx);
        Self {
            sign_pub: PublicKeyBytes(signing.verifying_key().to_bytes().to_vec()),
            sign_secret: signing.to_bytes(),
            kx_pub: PublicKeyBytes(kx_pub.as_bytes().to_vec()),
            kx_secret: kx.to_bytes(),
            created: Utc::now(),
            rotated_from: None,
            rotated_at: None,
        }
    }

    /// Rebuild an identity from stored secret halves. Public halves are
    /// re-derived, never trusted from the caller.
    pub fn from_secret_bytes(
        sign_secret: &[u8],
        kx_secret: &[u8],
        created: DateTime<Utc>,
        rotated_from: Option<PublicKeyBytes>,
        rotated_at: Option<DateTime<Utc>>,
    ) -> Result<Self, CryptoError> {
        let sign_arr: [u8; 32] = sign_secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signing secret must be 32 bytes".into()))?;
        let kx_arr: [u8; 32] = kx_secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("agreement secret must be 32 bytes".into()))?;
        let signing = SigningKey::from_bytes(&sign_arr);
        let kx = StaticSecret::from(kx_arr);
        Ok(Self {
            sign_pub: PublicKeyBytes(signing.verifying_key().to_bytes().to_vec()),
            sign_secret: sign_arr,
            kx_pub: PublicKeyBytes(X25519Public::from(&kx).as_bytes().to_vec()),
            kx_secret: kx_arr,
            created,
            rotated_from,
            rotated_at,
        })
    }

    pub fn sign_secret_bytes(&self) -> &[u8; 32] {
        &self.sign_secret
    }

    pub fn kx_secret_bytes(&self) -> &[u8; 32] {
        &self.kx_secret
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.sign_secret)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    pub fn short_id(&self) -> String {
        self.sign_pub.short_id()
    }

    /// The node's own rendezvous topic.
    pub fn topic(&self) -> [u8; 32] {
        topic_of(&self.sign_pub.0)
    }
}

/// Verify a signature made by any Ed25519 public key. Returns false on any
/// decode or verification failure — callers branch, they do not unwind.
pub fn verify_bytes(public: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    let Ok(pub_arr) = <&[u8; 32]>::try_from(public) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pub_arr) else {
        return false;
    };
    let Ok(sig_arr) = <&[u8; 64]>::try_from(sig) else {
        return false;
    };
    let sig = Signature::from_bytes(sig_arr);
    vk.verify(msg, &sig).is_ok()
}

/// Convenience for the common wire case: base64url key and signature.
pub fn verify_b64(public_b64: &str, msg: &[u8], sig_b64: &str) -> bool {
    let Ok(public) = URL_SAFE_NO_PAD.decode(public_b64) else {
        return false;
    };
    let Ok(sig) = URL_SAFE_NO_PAD.decode(sig_b64) else {
        return false;
    };
    verify_bytes(&public, msg, &sig)
}
