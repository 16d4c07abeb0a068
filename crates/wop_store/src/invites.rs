//! Issuer-side ledger of outstanding invites.
//!
//! The wire check on a claim is the token itself (issuer, subject, expiry,
//! signature); this ledger adds the issuer's local view so outstanding
//! invites can be listed and revoked before they are redeemed. Revocation is
//! keyed by the token nonce.

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use wop_crypto::token::InviteToken;

use crate::db::FileStore;
use crate::error::StoreError;
use crate::models::IssuedInvite;

const INVITES_DOC: &str = "invites";

pub struct InviteLedger {
    db: FileStore,
    state: Mutex<Vec<IssuedInvite>>,
}

impl InviteLedger {
    pub fn open(db: FileStore) -> Result<Self, StoreError> {
        let invites = db.load(INVITES_DOC)?.unwrap_or_default();
        Ok(Self { db, state: Mutex::new(invites) })
    }

    pub fn record(&self, token: &InviteToken) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.push(IssuedInvite {
            nonce: token.nonce.clone(),
            sub: token.sub.clone(),
            ses: token.ses.clone(),
            cap: token.cap.clone(),
            exp: token.exp,
            created: Utc::now(),
            revoked: false,
        });
        self.db.save(INVITES_DOC, &*state)
    }

    pub fn list(&self) -> Vec<IssuedInvite> {
        self.state.lock().clone()
    }

    /// Revoke an outstanding invite by its nonce. Fails with `NotFound` for
    /// an unknown or already-revoked nonce.
    pub fn revoke(&self, nonce: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let invite = state
            .iter_mut()
            .find(|i| i.nonce == nonce && !i.revoked)
            .ok_or_else(|| StoreError::NotFound(format!("invite {nonce}")))?;
        invite.revoked = true;
        self.db.save(INVITES_DOC, &*state)?;
        info!(nonce, "invite revoked");
        Ok(())
    }

    pub fn is_revoked(&self, nonce: &str) -> bool {
        self.state
            .lock()
            .iter()
            .any(|i| i.nonce == nonce && i.revoked)
    }

    /// Drop entries whose expiry has passed; revocation of an expired token
    /// is meaningless since the wire check already refuses it.
    pub fn sweep_expired(&self) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock();
        state.retain(|i| i.exp > now);
        self.db.save(INVITES_DOC, &*state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wop_crypto::{token, Identity};

    fn ledger() -> (tempfile::TempDir, InviteLedger) {
        let dir = tempfile::tempdir().unwrap();
        let db = FileStore::open(dir.path()).unwrap();
        (dir, InviteLedger::open(db).unwrap())
    }

    fn sample_token(issuer: &Identity) -> InviteToken {
        let sub = Identity::generate();
        token::issue(issuer, &sub.sign_pub.to_b64(), vec!["s1".into()], vec![], 1).unwrap()
    }

    #[test]
    fn record_list_revoke() {
        let (_dir, ledger) = ledger();
        let issuer = Identity::generate();
        let tok = sample_token(&issuer);
        ledger.record(&tok).unwrap();
        assert_eq!(ledger.list().len(), 1);
        assert!(!ledger.is_revoked(&tok.nonce));

        ledger.revoke(&tok.nonce).unwrap();
        assert!(ledger.is_revoked(&tok.nonce));
        // Double revocation is NotFound.
        assert!(matches!(
            ledger.revoke(&tok.nonce),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn revoking_unknown_nonce_is_not_found() {
        let (_dir, ledger) = ledger();
        assert!(matches!(
            ledger.revoke("feedface"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn sweep_drops_expired_only() {
        let (_dir, ledger) = ledger();
        let issuer = Identity::generate();
        let fresh = sample_token(&issuer);
        let stale = {
            let sub = Identity::generate();
            token::issue(&issuer, &sub.sign_pub.to_b64(), vec!["s1".into()], vec![], -1).unwrap()
        };
        ledger.record(&fresh).unwrap();
        ledger.record(&stale).unwrap();
        ledger.sweep_expired().unwrap();
        let left = ledger.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].nonce, fresh.nonce);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Identity::generate();
        let tok = sample_token(&issuer);
        {
            let ledger = InviteLedger::open(FileStore::open(dir.path()).unwrap()).unwrap();
            ledger.record(&tok).unwrap();
            ledger.revoke(&tok.nonce).unwrap();
        }
        let ledger = InviteLedger::open(FileStore::open(dir.path()).unwrap()).unwrap();
        assert!(ledger.is_revoked(&tok.nonce));
    }
}
