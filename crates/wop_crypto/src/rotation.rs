//! Signed key-rotation records.
//!
//! A rotation announces "the node behind `oldSignPub` is now `newSignPub`"
//! and is signed by the OLD signing key — possession of the old key is the
//! only authority that can hand continuity to the new one. Peers that accept
//! a rotation keep honouring the old key until the grace window closes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::{verify_b64, Identity, PublicKeyBytes};

pub const ROTATION_VERSION: u8 = 1;

/// Fixed grace window: messages signed by the old key stay authorised for
/// 24 hours past `effective_at`.
pub const GRACE_PERIOD_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationReason {
    Scheduled,
    Compromise,
    Upgrade,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationReason::Scheduled => "scheduled",
            RotationReason::Compromise => "compromise",
            RotationReason::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    pub v: u8,
    /// Previous signing public key (base64url) — also the signer.
    pub old_sign_pub: String,
    pub new_sign_pub: String,
    pub new_kx_pub: String,
    pub reason: RotationReason,
    /// Milliseconds since the Unix epoch.
    pub effective_at: i64,
    pub grace_period_ms: i64,
    pub sig: String,
}

impl KeyRotation {
    fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let payload = serde_json::json!({
            "effectiveAt": self.effective_at,
            "gracePeriodMs": self.grace_period_ms,
            "newKxPub": self.new_kx_pub,
            "newSignPub": self.new_sign_pub,
            "oldSignPub": self.old_sign_pub,
            "reason": self.reason,
            "v": self.v,
        });
        serde_json::to_vec(&payload)
    }

    /// End of the grace window, milliseconds since the Unix epoch.
    pub fn grace_deadline_ms(&self) -> i64 {
        self.effective_at + self.grace_period_ms
    }

    /// True while messages from the old key must still be honoured.
    pub fn in_grace(&self) -> bool {
        Utc::now().timestamp_millis() < self.grace_deadline_ms()
    }
}

/// Generate fresh pairs and a rotation record signed by the *current* (soon
/// to be old) signing key. The caller replaces its stored identity with the
/// returned one atomically.
pub fn rotate(current: &Identity, reason: RotationReason) -> Result<(Identity, KeyRotation), CryptoError> {
    let fresh = Identity::generate();
    let now = Utc::now();
    let mut record = KeyRotation {
        v: ROTATION_VERSION,
        old_sign_pub: current.sign_pub.to_b64(),
        new_sign_pub: fresh.sign_pub.to_b64(),
        new_kx_pub: fresh.kx_pub.to_b64(),
        reason,
        effective_at: now.timestamp_millis(),
        grace_period_ms: GRACE_PERIOD_MS,
        sig: String::new(),
    };
    let sig = current.sign(&record.canonical_bytes()?);
    record.sig = URL_SAFE_NO_PAD.encode(sig);

    let rotated = Identity::from_secret_bytes(
        fresh.sign_secret_bytes(),
        fresh.kx_secret_bytes(),
        current.created,
        Some(PublicKeyBytes(current.sign_pub.0.clone())),
        Some(now),
    )?;
    Ok((rotated, record))
}

/// Validate a rotation record against its embedded `old_sign_pub`. Returns
/// false on any decode or signature failure.
pub fn verify(record: &KeyRotation) -> bool {
    if record.v != ROTATION_VERSION {
        return false;
    }
    let Ok(canonical) = record.canonical_bytes() else {
        return false;
    };
    verify_b64(&record.old_sign_pub, &canonical, &record.sig)
}
