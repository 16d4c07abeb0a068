//! Authoritative trust store.
//!
//! Grants decide authorization; peers mirror the same keys for display and
//! key lookup. All writes go through one lock and hit disk before the lock
//! is released, so concurrent grant/revoke on the same peer linearise and a
//! reader sees either the pre- or post-write state.
//!
//! Authorization ordering (observable in tests):
//!   1. active grant on the sender's current key, matching session and cap;
//!   2. otherwise any active grant holding the sender's key in an unexpired
//!      history entry, matching session and cap;
//!   3. otherwise deny.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use wop_crypto::rotation::{self, KeyRotation};
use wop_crypto::short_id;

use crate::db::FileStore;
use crate::error::StoreError;
use crate::models::{AccessGrant, KeyHistoryEntry, PeerRecord};

const PEERS_DOC: &str = "peers";
const GRANTS_DOC: &str = "grants";

#[derive(Default)]
struct TrustState {
    peers: Vec<PeerRecord>,
    grants: Vec<AccessGrant>,
}

pub struct TrustStore {
    db: FileStore,
    state: RwLock<TrustState>,
}

impl TrustStore {
    pub fn open(db: FileStore) -> Result<Self, StoreError> {
        let peers = db.load(PEERS_DOC)?.unwrap_or_default();
        let grants = db.load(GRANTS_DOC)?.unwrap_or_default();
        Ok(Self {
            db,
            state: RwLock::new(TrustState { peers, grants }),
        })
    }

    fn persist(&self, state: &TrustState) -> Result<(), StoreError> {
        self.db.save(PEERS_DOC, &state.peers)?;
        self.db.save(GRANTS_DOC, &state.grants)?;
        Ok(())
    }

    /// Upsert a peer record, merging sessions and caps as unions.
    pub fn add_peer(
        &self,
        sign_pub: &str,
        sessions: &[String],
        caps: &[String],
        kx_pub: Option<&str>,
    ) -> Result<PeerRecord, StoreError> {
        let mut state = self.state.write();
        let peer = match state.peers.iter_mut().find(|p| p.sign_pub == sign_pub) {
            Some(peer) => {
                union_into(&mut peer.sessions, sessions);
                union_into(&mut peer.caps, caps);
                if let Some(kx) = kx_pub {
                    peer.kx_pub = Some(kx.to_string());
                }
                peer.clone()
            }
            None => {
                let peer = PeerRecord {
                    id: short_id_of_b64(sign_pub),
                    sign_pub: sign_pub.to_string(),
                    kx_pub: kx_pub.map(str::to_string),
                    display_name: None,
                    sessions: sessions.to_vec(),
                    caps: caps.to_vec(),
                    added: Utc::now(),
                    key_history: vec![],
                };
                state.peers.push(peer.clone());
                peer
            }
        };
        self.persist(&state)?;
        Ok(peer)
    }

    /// Upsert the active grant for a peer. `target` may be a full signing
    /// key, a short id, or a display name; the latter two are resolved
    /// against known peers and grants.
    pub fn grant_access(
        &self,
        target: &str,
        sessions: &[String],
        caps: &[String],
        kx_pub: Option<&str>,
    ) -> Result<AccessGrant, StoreError> {
        let mut state = self.state.write();
        let sign_pub = resolve_sign_pub(&state, target)?;

        let grant = match state
            .grants
            .iter_mut()
            .find(|g| !g.revoked && g.peer_sign_pub == sign_pub)
        {
            Some(grant) => {
                union_into(&mut grant.sessions, sessions);
                union_into(&mut grant.caps, caps);
                if let Some(kx) = kx_pub {
                    grant.peer_kx_pub = Some(kx.to_string());
                }
                grant.clone()
            }
            None => {
                let display_name = state
                    .peers
                    .iter()
                    .find(|p| p.sign_pub == sign_pub)
                    .and_then(|p| p.display_name.clone());
                let grant = AccessGrant {
                    id: Uuid::new_v4().to_string(),
                    peer_sign_pub: sign_pub.clone(),
                    peer_display_name: display_name,
                    peer_kx_pub: kx_pub.map(str::to_string),
                    sessions: sessions.to_vec(),
                    caps: caps.to_vec(),
                    created: Utc::now(),
                    revoked: false,
                    key_history: vec![],
                };
                state.grants.push(grant.clone());
                grant
            }
        };

        // Keep the denormalised peer view in step.
        upsert_peer_inline(&mut state.peers, &sign_pub, sessions, caps, kx_pub);
        self.persist(&state)?;
        info!(peer = %short_id_of_b64(&sign_pub), "access granted");
        Ok(grant)
    }

    /// Attach a display name to a known peer. Fails with `NotFound` for an
    /// unknown peer.
    pub fn name_peer(&self, id_or_key: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let sign_pub = resolve_sign_pub(&state, id_or_key)?;
        let peer = state
            .peers
            .iter_mut()
            .find(|p| p.sign_pub == sign_pub)
            .ok_or_else(|| StoreError::NotFound(format!("peer {id_or_key}")))?;
        peer.display_name = Some(name.to_string());
        for grant in state.grants.iter_mut().filter(|g| g.peer_sign_pub == sign_pub) {
            grant.peer_display_name = Some(name.to_string());
        }
        self.persist(&state)?;
        Ok(())
    }

    /// Revoke the active grant matching an id, name, or key. Fails with
    /// `NotFound` if no active grant matches.
    pub fn revoke_peer(&self, id_or_name: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let sign_pub = resolve_sign_pub(&state, id_or_name)?;
        let grant = state
            .grants
            .iter_mut()
            .find(|g| !g.revoked && g.peer_sign_pub == sign_pub)
            .ok_or_else(|| StoreError::NotFound(format!("active grant for {id_or_name}")))?;
        grant.revoked = true;
        self.persist(&state)?;
        info!(peer = %short_id_of_b64(&sign_pub), "grant revoked");
        Ok(())
    }

    /// The authorization decision. See the module header for the ordering.
    pub fn is_authorized(&self, sender_sign_pub: &str, session: &str) -> bool {
        self.grant_for(sender_sign_pub)
            .map(|g| g.covers_session(session) && g.grants_messaging())
            .unwrap_or(false)
    }

    /// The grant backing an `is_authorized` decision — current key first,
    /// then unexpired history entries.
    pub fn grant_for(&self, sender_sign_pub: &str) -> Option<AccessGrant> {
        let state = self.state.read();
        if let Some(grant) = state
            .grants
            .iter()
            .find(|g| !g.revoked && g.peer_sign_pub == sender_sign_pub)
        {
            return Some(grant.clone());
        }
        let now = Utc::now();
        state
            .grants
            .iter()
            .find(|g| {
                !g.revoked
                    && g.key_history
                        .iter()
                        .any(|h| h.sign_pub == sender_sign_pub && h.is_live(now))
            })
            .cloned()
    }

    /// Apply a verified peer rotation: append a history entry bounded by the
    /// grace window and swap the keys on every matching grant and peer.
    /// Returns true iff at least one record was updated.
    pub fn process_peer_rotation(&self, record: &KeyRotation) -> Result<bool, StoreError> {
        if !rotation::verify(record) {
            debug!("rejected key rotation with bad signature");
            return Ok(false);
        }
        let valid_until = DateTime::from_timestamp_millis(record.grace_deadline_ms())
            .unwrap_or_else(Utc::now);
        let reason = record.reason.as_str().to_string();

        let mut state = self.state.write();
        let mut updated = false;

        for grant in state
            .grants
            .iter_mut()
            .filter(|g| !g.revoked && g.peer_sign_pub == record.old_sign_pub)
        {
            grant.key_history.push(KeyHistoryEntry {
                sign_pub: grant.peer_sign_pub.clone(),
                kx_pub: grant.peer_kx_pub.clone(),
                valid_from: grant.created,
                valid_until: Some(valid_until),
                reason: Some(reason.clone()),
            });
            grant.peer_sign_pub = record.new_sign_pub.clone();
            grant.peer_kx_pub = Some(record.new_kx_pub.clone());
            updated = true;
        }

        for peer in state
            .peers
            .iter_mut()
            .filter(|p| p.sign_pub == record.old_sign_pub)
        {
            peer.key_history.push(KeyHistoryEntry {
                sign_pub: peer.sign_pub.clone(),
                kx_pub: peer.kx_pub.clone(),
                valid_from: peer.added,
                valid_until: Some(valid_until),
                reason: Some(reason.clone()),
            });
            peer.sign_pub = record.new_sign_pub.clone();
            peer.kx_pub = Some(record.new_kx_pub.clone());
            peer.id = short_id_of_b64(&record.new_sign_pub);
            updated = true;
        }

        if updated {
            self.persist(&state)?;
            info!(
                old = %short_id_of_b64(&record.old_sign_pub),
                new = %short_id_of_b64(&record.new_sign_pub),
                "peer rotation applied"
            );
        }
        Ok(updated)
    }

    /// Drop history entries whose grace window has closed.
    pub fn cleanup_expired_history(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        for grant in state.grants.iter_mut() {
            grant.key_history.retain(|h| h.is_live(now));
        }
        for peer in state.peers.iter_mut() {
            peer.key_history.retain(|h| h.is_live(now));
        }
        self.persist(&state)
    }

    /// The peer's current key followed by every historical one we know.
    pub fn all_keys_of(&self, sign_pub: &str) -> Vec<String> {
        let state = self.state.read();
        let mut keys = vec![sign_pub.to_string()];
        for grant in state.grants.iter().filter(|g| g.peer_sign_pub == sign_pub) {
            for entry in &grant.key_history {
                if !keys.contains(&entry.sign_pub) {
                    keys.push(entry.sign_pub.clone());
                }
            }
        }
        keys
    }

    /// Public face of the short-id / display-name / full-key resolver.
    pub fn resolve(&self, target: &str) -> Result<String, StoreError> {
        resolve_sign_pub(&self.state.read(), target)
    }

    /// Long-term kx key we hold for a peer, from its record or its grant.
    pub fn peer_kx(&self, sign_pub: &str) -> Option<String> {
        let state = self.state.read();
        state
            .peers
            .iter()
            .find(|p| p.sign_pub == sign_pub)
            .and_then(|p| p.kx_pub.clone())
            .or_else(|| {
                state
                    .grants
                    .iter()
                    .find(|g| g.peer_sign_pub == sign_pub)
                    .and_then(|g| g.peer_kx_pub.clone())
            })
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.state.read().peers.clone()
    }

    pub fn grants(&self) -> Vec<AccessGrant> {
        self.state.read().grants.clone()
    }
}

fn union_into(dst: &mut Vec<String>, src: &[String]) {
    for item in src {
        if !dst.contains(item) {
            dst.push(item.clone());
        }
    }
}

fn upsert_peer_inline(
    peers: &mut Vec<PeerRecord>,
    sign_pub: &str,
    sessions: &[String],
    caps: &[String],
    kx_pub: Option<&str>,
) {
    match peers.iter_mut().find(|p| p.sign_pub == sign_pub) {
        Some(peer) => {
            union_into(&mut peer.sessions, sessions);
            union_into(&mut peer.caps, caps);
            if let Some(kx) = kx_pub {
                peer.kx_pub = Some(kx.to_string());
            }
        }
        None => peers.push(PeerRecord {
            id: short_id_of_b64(sign_pub),
            sign_pub: sign_pub.to_string(),
            kx_pub: kx_pub.map(str::to_string),
            display_name: None,
            sessions: sessions.to_vec(),
            caps: caps.to_vec(),
            added: Utc::now(),
            key_history: vec![],
        }),
    }
}

fn short_id_of_b64(sign_pub_b64: &str) -> String {
    match URL_SAFE_NO_PAD.decode(sign_pub_b64) {
        Ok(bytes) => short_id(&bytes),
        // A malformed key still needs a stable handle for logging.
        Err(_) => short_id(sign_pub_b64.as_bytes()),
    }
}

/// Resolve a full key / short id / display name to a full signing key.
fn resolve_sign_pub(state: &TrustState, target: &str) -> Result<String, StoreError> {
    if let Some(peer) = state.peers.iter().find(|p| p.sign_pub == target) {
        return Ok(peer.sign_pub.clone());
    }
    if let Some(grant) = state.grants.iter().find(|g| g.peer_sign_pub == target) {
        return Ok(grant.peer_sign_pub.clone());
    }
    if let Some(peer) = state.peers.iter().find(|p| p.id == target) {
        return Ok(peer.sign_pub.clone());
    }
    if let Some(peer) = state
        .peers
        .iter()
        .find(|p| p.display_name.as_deref() == Some(target))
    {
        return Ok(peer.sign_pub.clone());
    }
    if let Some(grant) = state
        .grants
        .iter()
        .find(|g| g.peer_display_name.as_deref() == Some(target))
    {
        return Ok(grant.peer_sign_pub.clone());
    }
    // An unknown but well-formed key is acceptable for first contact.
    match URL_SAFE_NO_PAD.decode(target) {
        Ok(bytes) if bytes.len() == 32 => Ok(target.to_string()),
        _ => Err(StoreError::NotFound(format!("peer {target}"))),
    }
}
