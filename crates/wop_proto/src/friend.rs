//! Out-of-band friend handshake records.
//!
//! Two self-signed text records carried over an opaque channel:
//!
//! ```text
//! FRIEND_REQUEST | to:<name> | from:<name> | pubkey:<b64> | encryptPub:<b64> | ts:<ms> | sig:<b64>
//! FRIEND_ACCEPT | to:<name> | from:<name> | pubkey:<b64> | encryptPub:<b64> | requestSig:<b64> | ts:<ms> | sig:<b64>
//! ```
//!
//! Parsers reject any deviation in spacing or field order. `sig` covers the
//! canonical object without the `sig` field. Records older than 5 minutes
//! are rejected.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wop_crypto::{verify_b64, Identity, PublicKeyBytes};

/// Freshness bound for both record kinds.
pub const MAX_RECORD_AGE_MS: i64 = 5 * 60 * 1000;

pub const REQUEST_TAG: &str = "FRIEND_REQUEST";
pub const ACCEPT_TAG: &str = "FRIEND_ACCEPT";

#[derive(Debug, Error)]
pub enum FriendRecordError {
    #[error("Not a friend record")]
    WrongTag,

    #[error("Malformed friend record: {0}")]
    Malformed(String),

    #[error("Friend record is stale")]
    Stale,

    #[error("Friend record signature invalid")]
    BadSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub to: String,
    pub from: String,
    /// Sender's signing public key (base64url).
    pub pubkey: String,
    /// Sender's key-agreement public key (base64url).
    pub encrypt_pub: String,
    pub ts: i64,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendAccept {
    pub to: String,
    pub from: String,
    pub pubkey: String,
    pub encrypt_pub: String,
    /// Signature of the request being accepted — the pairing handle.
    pub request_sig: String,
    pub ts: i64,
    pub sig: String,
}

fn request_canonical(r: &FriendRequest) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::json!({
        "encryptPub": r.encrypt_pub,
        "from": r.from,
        "pubkey": r.pubkey,
        "to": r.to,
        "ts": r.ts,
    });
    serde_json::to_vec(&payload)
}

fn accept_canonical(a: &FriendAccept) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::json!({
        "encryptPub": a.encrypt_pub,
        "from": a.from,
        "pubkey": a.pubkey,
        "requestSig": a.request_sig,
        "to": a.to,
        "ts": a.ts,
    });
    serde_json::to_vec(&payload)
}

impl FriendRequest {
    pub fn create(identity: &Identity, to: &str, from: &str) -> Result<Self, serde_json::Error> {
        let mut record = Self {
            to: to.to_string(),
            from: from.to_string(),
            pubkey: identity.sign_pub.to_b64(),
            encrypt_pub: identity.kx_pub.to_b64(),
            ts: Utc::now().timestamp_millis(),
            sig: String::new(),
        };
        let sig = identity.sign(&request_canonical(&record)?);
        record.sig = URL_SAFE_NO_PAD.encode(sig);
        Ok(record)
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{REQUEST_TAG} | to:{} | from:{} | pubkey:{} | encryptPub:{} | ts:{} | sig:{}",
            self.to, self.from, self.pubkey, self.encrypt_pub, self.ts, self.sig
        )
    }

    pub fn parse(wire: &str) -> Result<Self, FriendRecordError> {
        let fields = split_record(wire, REQUEST_TAG, &["to", "from", "pubkey", "encryptPub", "ts", "sig"])?;
        let record = Self {
            to: fields[0].clone(),
            from: fields[1].clone(),
            pubkey: fields[2].clone(),
            encrypt_pub: fields[3].clone(),
            ts: parse_ts(&fields[4])?,
            sig: fields[5].clone(),
        };
        check_freshness(record.ts)?;
        let canonical = request_canonical(&record)
            .map_err(|e| FriendRecordError::Malformed(e.to_string()))?;
        if !verify_b64(&record.pubkey, &canonical, &record.sig) {
            return Err(FriendRecordError::BadSignature);
        }
        Ok(record)
    }
}

impl FriendAccept {
    pub fn create(
        identity: &Identity,
        to: &str,
        from: &str,
        request_sig: &str,
    ) -> Result<Self, serde_json::Error> {
        let mut record = Self {
            to: to.to_string(),
            from: from.to_string(),
            pubkey: identity.sign_pub.to_b64(),
            encrypt_pub: identity.kx_pub.to_b64(),
            request_sig: request_sig.to_string(),
            ts: Utc::now().timestamp_millis(),
            sig: String::new(),
        };
        let sig = identity.sign(&accept_canonical(&record)?);
        record.sig = URL_SAFE_NO_PAD.encode(sig);
        Ok(record)
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{ACCEPT_TAG} | to:{} | from:{} | pubkey:{} | encryptPub:{} | requestSig:{} | ts:{} | sig:{}",
            self.to, self.from, self.pubkey, self.encrypt_pub, self.request_sig, self.ts, self.sig
        )
    }

    pub fn parse(wire: &str) -> Result<Self, FriendRecordError> {
        let fields = split_record(
            wire,
            ACCEPT_TAG,
            &["to", "from", "pubkey", "encryptPub", "requestSig", "ts", "sig"],
        )?;
        let record = Self {
            to: fields[0].clone(),
            from: fields[1].clone(),
            pubkey: fields[2].clone(),
            encrypt_pub: fields[3].clone(),
            request_sig: fields[4].clone(),
            ts: parse_ts(&fields[5])?,
            sig: fields[6].clone(),
        };
        check_freshness(record.ts)?;
        let canonical =
            accept_canonical(&record).map_err(|e| FriendRecordError::Malformed(e.to_string()))?;
        if !verify_b64(&record.pubkey, &canonical, &record.sig) {
            return Err(FriendRecordError::BadSignature);
        }
        Ok(record)
    }
}

/// Deterministic session name for a friend peer:
/// `friend:p2p:<name>(<first-6-hex-of-signPub>)`.
pub fn friend_session_name(name: &str, sign_pub: &PublicKeyBytes) -> String {
    let hex = hex::encode(&sign_pub.0);
    format!("friend:p2p:{name}({})", &hex[..6])
}

fn split_record(
    wire: &str,
    tag: &str,
    keys: &[&str],
) -> Result<Vec<String>, FriendRecordError> {
    let parts: Vec<&str> = wire.split(" | ").collect();
    if parts.first() != Some(&tag) {
        return Err(FriendRecordError::WrongTag);
    }
    if parts.len() != keys.len() + 1 {
        return Err(FriendRecordError::Malformed(format!(
            "expected {} fields, got {}",
            keys.len(),
            parts.len() - 1
        )));
    }
    let mut out = Vec::with_capacity(keys.len());
    for (part, key) in parts[1..].iter().zip(keys) {
        let value = part
            .strip_prefix(&format!("{key}:"))
            .ok_or_else(|| FriendRecordError::Malformed(format!("expected field `{key}`")))?;
        out.push(value.to_string());
    }
    Ok(out)
}

fn parse_ts(s: &str) -> Result<i64, FriendRecordError> {
    s.parse()
        .map_err(|_| FriendRecordError::Malformed("bad timestamp".into()))
}

fn check_freshness(ts: i64) -> Result<(), FriendRecordError> {
    if Utc::now().timestamp_millis() - ts > MAX_RECORD_AGE_MS {
        return Err(FriendRecordError::Stale);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_roundtrip() {
        let id = Identity::generate();
        let req = FriendRequest::create(&id, "alice", "bob").unwrap();
        let wire = req.to_wire();
        assert!(wire.starts_with("FRIEND_REQUEST | to:alice | from:bob | pubkey:"));
        let parsed = FriendRequest::parse(&wire).unwrap();
        assert_eq!(parsed.pubkey, id.sign_pub.to_b64());
        assert_eq!(parsed.sig, req.sig);
    }

    #[test]
    fn accept_wire_roundtrip() {
        let id = Identity::generate();
        let acc = FriendAccept::create(&id, "bob", "alice", "reqsig").unwrap();
        let parsed = FriendAccept::parse(&acc.to_wire()).unwrap();
        assert_eq!(parsed.request_sig, "reqsig");
        assert_eq!(parsed.from, "alice");
    }

    #[test]
    fn field_order_is_strict() {
        let id = Identity::generate();
        let req = FriendRequest::create(&id, "alice", "bob").unwrap();
        let reordered = format!(
            "FRIEND_REQUEST | from:{} | to:{} | pubkey:{} | encryptPub:{} | ts:{} | sig:{}",
            req.from, req.to, req.pubkey, req.encrypt_pub, req.ts, req.sig
        );
        assert!(matches!(
            FriendRequest::parse(&reordered),
            Err(FriendRecordError::Malformed(_))
        ));
    }

    #[test]
    fn spacing_is_strict() {
        let id = Identity::generate();
        let wire = FriendRequest::create(&id, "alice", "bob").unwrap().to_wire();
        let squeezed = wire.replace(" | ", "|");
        assert!(FriendRequest::parse(&squeezed).is_err());
    }

    #[test]
    fn stale_record_rejected() {
        let id = Identity::generate();
        let mut req = FriendRequest {
            to: "alice".into(),
            from: "bob".into(),
            pubkey: id.sign_pub.to_b64(),
            encrypt_pub: id.kx_pub.to_b64(),
            ts: Utc::now().timestamp_millis() - MAX_RECORD_AGE_MS - 1000,
            sig: String::new(),
        };
        let sig = id.sign(&request_canonical(&req).unwrap());
        req.sig = URL_SAFE_NO_PAD.encode(sig);
        assert!(matches!(
            FriendRequest::parse(&req.to_wire()),
            Err(FriendRecordError::Stale)
        ));
    }

    #[test]
    fn forged_signature_rejected() {
        let id = Identity::generate();
        let other = Identity::generate();
        let mut req = FriendRequest::create(&id, "alice", "bob").unwrap();
        // Re-sign with a different key but keep the claimed pubkey.
        let sig = other.sign(&request_canonical(&req).unwrap());
        req.sig = URL_SAFE_NO_PAD.encode(sig);
        assert!(matches!(
            FriendRequest::parse(&req.to_wire()),
            Err(FriendRecordError::BadSignature)
        ));
    }

    #[test]
    fn session_name_shape() {
        let id = Identity::generate();
        let name = friend_session_name("mallory", &id.sign_pub);
        let hex = hex::encode(&id.sign_pub.0);
        assert_eq!(name, format!("friend:p2p:mallory({})", &hex[..6]));
    }
}
