//! Signed invite tokens.
//!
//! Wire form: the literal `wop1://` followed by base64url of the token JSON
//! including its signature. `iss` signs the canonical payload (the object
//! minus `sig`, fields in alphabetical order); `sub` names the signing key of
//! the intended claimant. Expiry is a hard cutoff — no clock-skew allowance.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{verify_b64, Identity};

pub const TOKEN_PREFIX: &str = "wop1://";
pub const TOKEN_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Not an invite token (missing {TOKEN_PREFIX} prefix)")]
    WrongPrefix,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token expired")]
    Expired,

    #[error("Token signature invalid")]
    BadSignature,
}

/// Bearer credential granting `sub` access to `ses` with capabilities `cap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteToken {
    pub v: u8,
    /// Issuer's signing public key (base64url).
    pub iss: String,
    /// Intended claimant's signing public key (base64url).
    pub sub: String,
    pub ses: Vec<String>,
    pub cap: Vec<String>,
    /// Expiry, milliseconds since the Unix epoch.
    pub exp: i64,
    /// 16 random bytes, hex-encoded.
    pub nonce: String,
    pub sig: String,
}

impl InviteToken {
    fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        // Field ordering MUST be stable; `json!` object literals serialise
        // in alphabetical key order.
        let payload = serde_json::json!({
            "cap": self.cap,
            "exp": self.exp,
            "iss": self.iss,
            "nonce": self.nonce,
            "ses": self.ses,
            "sub": self.sub,
            "v": self.v,
        });
        serde_json::to_vec(&payload)
    }

    /// Render the `wop1://…` wire form.
    pub fn to_uri(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }
}

/// Issue a token for `sub_sign_pub` (base64url), valid for `ttl_hours`.
pub fn issue(
    identity: &Identity,
    sub_sign_pub: &str,
    sessions: Vec<String>,
    caps: Vec<String>,
    ttl_hours: i64,
) -> Result<InviteToken, serde_json::Error> {
    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mut token = InviteToken {
        v: TOKEN_VERSION,
        iss: identity.sign_pub.to_b64(),
        sub: sub_sign_pub.to_string(),
        ses: sessions,
        cap: caps,
        exp: (Utc::now() + Duration::hours(ttl_hours)).timestamp_millis(),
        nonce: hex::encode(nonce),
        sig: String::new(),
    };
    let sig = identity.sign(&token.canonical_bytes()?);
    token.sig = URL_SAFE_NO_PAD.encode(sig);
    Ok(token)
}

/// Parse and validate a `wop1://…` string. Error kinds are distinct so the
/// caller can report prefix, encoding, expiry and signature failures apart.
pub fn parse(uri: &str) -> Result<InviteToken, TokenError> {
    let encoded = uri
        .strip_prefix(TOKEN_PREFIX)
        .ok_or(TokenError::WrongPrefix)?;
    let json = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let token: InviteToken =
        serde_json::from_slice(&json).map_err(|e| TokenError::Malformed(e.to_string()))?;

    if token.exp < Utc::now().timestamp_millis() {
        return Err(TokenError::Expired);
    }

    let canonical = token
        .canonical_bytes()
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    if !verify_b64(&token.iss, &canonical, &token.sig) {
        return Err(TokenError::BadSignature);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn issue_parse_roundtrip() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let token = issue(
            &alice,
            &bob.sign_pub.to_b64(),
            vec!["s1".into()],
            vec!["inject".into()],
            1,
        )
        .unwrap();
        let parsed = parse(&token.to_uri().unwrap()).unwrap();
        assert_eq!(parsed.iss, alice.sign_pub.to_b64());
        assert_eq!(parsed.sub, bob.sign_pub.to_b64());
        assert_eq!(parsed.ses, vec!["s1".to_string()]);
        assert_eq!(parsed.cap, vec!["inject".to_string()]);
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(matches!(
            parse("wop2://abcdef"),
            Err(TokenError::WrongPrefix)
        ));
        assert!(matches!(parse("plain text"), Err(TokenError::WrongPrefix)));
    }

    #[test]
    fn rejects_malformed_body() {
        assert!(matches!(
            parse("wop1://%%%not-base64%%%"),
            Err(TokenError::Malformed(_))
        ));
        let not_json = format!("wop1://{}", URL_SAFE_NO_PAD.encode(b"hello"));
        assert!(matches!(parse(&not_json), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn rejects_expired() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let token = issue(&alice, &bob.sign_pub.to_b64(), vec!["s1".into()], vec![], -1).unwrap();
        assert!(matches!(
            parse(&token.to_uri().unwrap()),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn rejects_tampered_sessions() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut token =
            issue(&alice, &bob.sign_pub.to_b64(), vec!["s1".into()], vec![], 1).unwrap();
        token.ses = vec!["s1".into(), "admin".into()];
        assert!(matches!(
            parse(&token.to_uri().unwrap()),
            Err(TokenError::BadSignature)
        ));
    }
}
