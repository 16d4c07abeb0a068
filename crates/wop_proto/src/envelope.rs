//! Wire message envelope — one JSON object per line.
//!
//! Every message is signed by `from` (the sender's current signing key).
//! `hello` and `hello-ack` carry their own signature but bypass the
//! post-handshake verification gate; `key-rotation` is verified against the
//! embedded record's `oldSignPub` instead of `from`.
//!
//! Canonicalisation for signing: the envelope with `sig` absent, serialised
//! by this implementation's stable field order. Sign and verify use the same
//! encoder, which is the only cross-version requirement.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use wop_crypto::rotation::KeyRotation;
use wop_crypto::{verify_b64, Identity};

/// Current protocol version. Version 2 enables per-connection ephemeral keys.
pub const PROTOCOL_VERSION: u32 = 2;
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Pick the highest version both sides speak, if any.
pub fn negotiate(their_versions: &[u32]) -> Option<u32> {
    their_versions
        .iter()
        .copied()
        .filter(|v| (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(v))
        .max()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    /// Sender's signing public key (base64url).
    pub from: String,
    /// 16 random bytes, hex-encoded.
    pub nonce: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello {
        versions: Vec<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kx_pub: Option<String>,
    },
    #[serde(rename = "hello-ack", rename_all = "camelCase")]
    HelloAck {
        version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kx_pub: Option<String>,
    },
    #[serde(rename = "claim", rename_all = "camelCase")]
    Claim {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kx_pub: Option<String>,
    },
    #[serde(rename = "log", rename_all = "camelCase")]
    Log {
        session: String,
        /// base64 of iv || tag || ciphertext.
        payload: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<String>,
    },
    #[serde(rename = "inject", rename_all = "camelCase")]
    Inject {
        session: String,
        payload: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<String>,
    },
    #[serde(rename = "response", rename_all = "camelCase")]
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<String>,
    },
    #[serde(rename = "ack", rename_all = "camelCase")]
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        kx_pub: Option<String>,
    },
    #[serde(rename = "reject")]
    Reject { reason: String },
    #[serde(rename = "key-rotation", rename_all = "camelCase")]
    KeyRotation { key_rotation: KeyRotation },
    /// Catch-all for message types this version does not know; dropped by
    /// the dispatcher.
    #[serde(other)]
    Unknown,
}

impl Body {
    /// Wire name of this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Hello { .. } => "hello",
            Body::HelloAck { .. } => "hello-ack",
            Body::Claim { .. } => "claim",
            Body::Log { .. } => "log",
            Body::Inject { .. } => "inject",
            Body::Response { .. } => "response",
            Body::Ack { .. } => "ack",
            Body::Reject { .. } => "reject",
            Body::KeyRotation { .. } => "key-rotation",
            Body::Unknown => "unknown",
        }
    }
}

impl Envelope {
    /// Build an unsigned envelope with a fresh nonce and current timestamp.
    pub fn new(version: u32, from: String, body: Body) -> Self {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self {
            v: version,
            from,
            nonce: hex::encode(nonce),
            ts: Utc::now().timestamp_millis(),
            sig: None,
            body,
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.sig = None;
        serde_json::to_vec(&unsigned)
    }

    /// Sign with the node's current signing key.
    pub fn sign(&mut self, identity: &Identity) -> Result<(), serde_json::Error> {
        let sig = identity.sign(&self.canonical_bytes()?);
        self.sig = Some(URL_SAFE_NO_PAD.encode(sig));
        Ok(())
    }

    /// Verify the envelope signature against an explicit signer key.
    /// Returns false on a missing signature or any decode failure.
    pub fn verify_signature(&self, signer_pub_b64: &str) -> bool {
        let Some(ref sig) = self.sig else {
            return false;
        };
        let Ok(canonical) = self.canonical_bytes() else {
            return false;
        };
        verify_b64(signer_pub_b64, &canonical, sig)
    }

    /// Verify against the envelope's own `from` field.
    pub fn verify_from(&self) -> bool {
        self.verify_signature(&self.from)
    }
}
