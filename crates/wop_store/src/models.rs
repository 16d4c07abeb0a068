//! Durable record models.
//!
//! `AccessGrant`s are the source of truth for authorization; `PeerRecord`s
//! are a denormalised convenience view over the same keys. Both carry a key
//! history so a rotated-away signing key keeps working until its grace
//! window closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wop_proto::friend::FriendRequest;

/// A key the peer has rotated away from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHistoryEntry {
    /// Historical signing public key (base64url).
    pub sign_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kx_pub: Option<String>,
    pub valid_from: DateTime<Utc>,
    /// End of the grace window; entries past this are dead weight and get
    /// swept by `cleanup_expired_history`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KeyHistoryEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.valid_until {
            Some(until) => until > now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// 8-hex-char prefix of SHA-256 of `sign_pub` — deterministic.
    pub id: String,
    pub sign_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kx_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub sessions: Vec<String>,
    pub caps: Vec<String>,
    pub added: DateTime<Utc>,
    #[serde(default)]
    pub key_history: Vec<KeyHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub id: String,
    pub peer_sign_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_kx_pub: Option<String>,
    pub sessions: Vec<String>,
    pub caps: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub key_history: Vec<KeyHistoryEntry>,
}

impl AccessGrant {
    pub fn covers_session(&self, session: &str) -> bool {
        self.sessions.iter().any(|s| s == "*" || s == session)
    }

    pub fn grants_messaging(&self) -> bool {
        self.caps.iter().any(|c| c == "message" || c == "inject")
    }
}

/// A friend request we have received and not yet answered, or one we sent
/// and are waiting to see accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFriend {
    pub request: FriendRequest,
    pub recorded_at: DateTime<Utc>,
}

/// An invite this node has issued and not yet seen expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedInvite {
    /// Token nonce — the revocation handle.
    pub nonce: String,
    pub sub: String,
    pub ses: Vec<String>,
    pub cap: Vec<String>,
    /// Expiry, milliseconds since the Unix epoch.
    pub exp: i64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

/// Node configuration, durable next to the trust records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Name used in friend handshakes.
    pub display_name: String,
    /// Auto-accept patterns: exact name, `"*"`, or `a|b|c` alternation.
    #[serde(default)]
    pub auto_accept: Vec<String>,
    /// Sub-deadline for the hello/hello-ack exchange on outbound dials.
    pub handshake_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "node".into(),
            auto_accept: vec![],
            handshake_timeout_ms: 5_000,
        }
    }
}
