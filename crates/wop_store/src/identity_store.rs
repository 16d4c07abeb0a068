//! Identity persistence.
//!
//! The identity document carries the secret halves, so it rides the same
//! owner-only atomic-write path as everything else. Rotation swaps the
//! document in one rename; a crash leaves either the old identity or the
//! new one, never a mix.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use wop_crypto::rotation::{self, KeyRotation, RotationReason};
use wop_crypto::{Identity, PublicKeyBytes};

use crate::db::FileStore;
use crate::error::StoreError;

const IDENTITY_DOC: &str = "identity";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    sign_pub: String,
    sign_secret: String,
    kx_pub: String,
    kx_secret: String,
    created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotated_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotated_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    fn from_identity(identity: &Identity) -> Self {
        Self {
            sign_pub: identity.sign_pub.to_b64(),
            sign_secret: URL_SAFE_NO_PAD.encode(identity.sign_secret_bytes()),
            kx_pub: identity.kx_pub.to_b64(),
            kx_secret: URL_SAFE_NO_PAD.encode(identity.kx_secret_bytes()),
            created: identity.created,
            rotated_from: identity.rotated_from.as_ref().map(|k| k.to_b64()),
            rotated_at: identity.rotated_at,
        }
    }

    fn into_identity(self) -> Result<Identity, StoreError> {
        let sign_secret = URL_SAFE_NO_PAD
            .decode(&self.sign_secret)
            .map_err(|e| StoreError::Corrupt(format!("identity signing secret: {e}")))?;
        let kx_secret = URL_SAFE_NO_PAD
            .decode(&self.kx_secret)
            .map_err(|e| StoreError::Corrupt(format!("identity agreement secret: {e}")))?;
        let rotated_from = self
            .rotated_from
            .as_deref()
            .map(PublicKeyBytes::from_b64)
            .transpose()?;
        Ok(Identity::from_secret_bytes(
            &sign_secret,
            &kx_secret,
            self.created,
            rotated_from,
            self.rotated_at,
        )?)
    }
}

pub struct IdentityStore {
    db: FileStore,
}

impl IdentityStore {
    pub fn new(db: FileStore) -> Self {
        Self { db }
    }

    pub fn load(&self) -> Result<Option<Identity>, StoreError> {
        match self.db.load::<IdentityRecord>(IDENTITY_DOC)? {
            Some(record) => Ok(Some(record.into_identity()?)),
            None => Ok(None),
        }
    }

    /// Create keys iff none exist. With `force`, an existing identity is
    /// replaced outright (no rotation record — this is a fresh start).
    pub fn init(&self, force: bool) -> Result<Identity, StoreError> {
        if !force && self.db.load::<IdentityRecord>(IDENTITY_DOC)?.is_some() {
            return Err(StoreError::IdentityExists);
        }
        let identity = Identity::generate();
        self.db.save(IDENTITY_DOC, &IdentityRecord::from_identity(&identity))?;
        info!(id = %identity.short_id(), "identity created");
        Ok(identity)
    }

    pub fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        self.db.save(IDENTITY_DOC, &IdentityRecord::from_identity(identity))
    }

    /// Rotate the stored identity: new pairs, a `KeyRotation` signed by the
    /// old key, and an atomic replacement of the document.
    pub fn rotate(
        &self,
        current: &Identity,
        reason: RotationReason,
    ) -> Result<(Identity, KeyRotation), StoreError> {
        let (rotated, record) = rotation::rotate(current, reason)?;
        self.db.save(IDENTITY_DOC, &IdentityRecord::from_identity(&rotated))?;
        info!(
            old = %current.short_id(),
            new = %rotated.short_id(),
            "identity rotated"
        );
        Ok((rotated, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, IdentityStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = FileStore::open(dir.path()).unwrap();
        (dir, IdentityStore::new(db))
    }

    #[test]
    fn init_then_load() {
        let (_dir, store) = store();
        let id = store.init(false).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.sign_pub, id.sign_pub);
        assert_eq!(loaded.kx_pub, id.kx_pub);
    }

    #[test]
    fn init_twice_fails_without_force() {
        let (_dir, store) = store();
        store.init(false).unwrap();
        assert!(matches!(store.init(false), Err(StoreError::IdentityExists)));
        // force replaces
        let replaced = store.init(true).unwrap();
        assert_eq!(store.load().unwrap().unwrap().sign_pub, replaced.sign_pub);
    }

    #[test]
    fn rotate_persists_new_identity_with_lineage() {
        let (_dir, store) = store();
        let id = store.init(false).unwrap();
        let (rotated, record) = store.rotate(&id, RotationReason::Scheduled).unwrap();
        assert!(wop_crypto::rotation::verify(&record));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.sign_pub, rotated.sign_pub);
        assert_eq!(loaded.rotated_from, Some(id.sign_pub.clone()));
    }
}
