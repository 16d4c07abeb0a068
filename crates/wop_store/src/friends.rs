//! Friend-handshake state.
//!
//! Incoming requests wait in a durable pending list until an out-of-process
//! agent (or an auto-accept pattern) answers them; outgoing requests are
//! remembered so the eventual `FRIEND_ACCEPT` can be paired up by its
//! `requestSig`.

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use wop_proto::friend::{FriendAccept, FriendRequest};

use crate::db::FileStore;
use crate::error::StoreError;
use crate::models::PendingFriend;

const PENDING_IN_DOC: &str = "friends_pending_in";
const PENDING_OUT_DOC: &str = "friends_pending_out";
const AUTO_ACCEPT_DOC: &str = "friends_auto_accept";

#[derive(Default)]
struct FriendState {
    pending_in: Vec<PendingFriend>,
    pending_out: Vec<PendingFriend>,
    auto_accept: Vec<String>,
}

pub struct FriendBook {
    db: FileStore,
    state: Mutex<FriendState>,
}

impl FriendBook {
    pub fn open(db: FileStore) -> Result<Self, StoreError> {
        let pending_in = db.load(PENDING_IN_DOC)?.unwrap_or_default();
        let pending_out = db.load(PENDING_OUT_DOC)?.unwrap_or_default();
        let auto_accept = db.load(AUTO_ACCEPT_DOC)?.unwrap_or_default();
        Ok(Self {
            db,
            state: Mutex::new(FriendState {
                pending_in,
                pending_out,
                auto_accept,
            }),
        })
    }

    /// Replace the auto-accept pattern set.
    pub fn set_auto_accept(&self, patterns: Vec<String>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.auto_accept = patterns;
        self.db.save(AUTO_ACCEPT_DOC, &state.auto_accept)
    }

    pub fn auto_accept_patterns(&self) -> Vec<String> {
        self.state.lock().auto_accept.clone()
    }

    /// Should a request from `name` be accepted without asking?
    pub fn should_auto_accept(&self, name: &str) -> bool {
        self.state
            .lock()
            .auto_accept
            .iter()
            .any(|p| pattern_matches(p, name))
    }

    /// Store an incoming request for later decision. Duplicate signatures
    /// are collapsed.
    pub fn record_incoming(&self, request: &FriendRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.pending_in.iter().any(|p| p.request.sig == request.sig) {
            debug!(from = %request.from, "duplicate friend request ignored");
            return Ok(());
        }
        state.pending_in.push(PendingFriend {
            request: request.clone(),
            recorded_at: Utc::now(),
        });
        self.db.save(PENDING_IN_DOC, &state.pending_in)
    }

    pub fn pending_incoming(&self) -> Vec<PendingFriend> {
        self.state.lock().pending_in.clone()
    }

    /// Remove and return an incoming request by its signature.
    pub fn take_incoming(&self, request_sig: &str) -> Result<Option<FriendRequest>, StoreError> {
        let mut state = self.state.lock();
        let pos = state
            .pending_in
            .iter()
            .position(|p| p.request.sig == request_sig);
        let taken = pos.map(|i| state.pending_in.remove(i).request);
        if taken.is_some() {
            self.db.save(PENDING_IN_DOC, &state.pending_in)?;
        }
        Ok(taken)
    }

    /// Remember a request we sent, keyed by its signature.
    pub fn record_outgoing(&self, request: &FriendRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.pending_out.iter().any(|p| p.request.sig == request.sig) {
            return Ok(());
        }
        state.pending_out.push(PendingFriend {
            request: request.clone(),
            recorded_at: Utc::now(),
        });
        self.db.save(PENDING_OUT_DOC, &state.pending_out)
    }

    /// Pair an accept with the outgoing request it answers; removes the
    /// pending entry on a match.
    pub fn match_accept(&self, accept: &FriendAccept) -> Result<Option<FriendRequest>, StoreError> {
        let mut state = self.state.lock();
        let pos = state
            .pending_out
            .iter()
            .position(|p| p.request.sig == accept.request_sig);
        let matched = pos.map(|i| state.pending_out.remove(i).request);
        if matched.is_some() {
            self.db.save(PENDING_OUT_DOC, &state.pending_out)?;
        }
        Ok(matched)
    }
}

/// Auto-accept patterns: exact username, `"*"`, or pipe-delimited
/// alternation `a|b|c`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('|') {
        return pattern.split('|').any(|alt| alt == name);
    }
    pattern == name
}

#[cfg(test)]
mod tests {
    use super::*;
    use wop_crypto::Identity;

    fn book() -> (tempfile::TempDir, FriendBook) {
        let dir = tempfile::tempdir().unwrap();
        let db = FileStore::open(dir.path()).unwrap();
        (dir, FriendBook::open(db).unwrap())
    }

    #[test]
    fn patterns() {
        assert!(pattern_matches("*", "anyone"));
        assert!(pattern_matches("alice", "alice"));
        assert!(!pattern_matches("alice", "bob"));
        assert!(pattern_matches("a|b|c", "b"));
        assert!(!pattern_matches("a|b|c", "d"));
        assert!(!pattern_matches("a|b", "a|b"));
    }

    #[test]
    fn auto_accept_uses_patterns() {
        let (_dir, book) = book();
        book.set_auto_accept(vec!["alice|bob".into()]).unwrap();
        assert!(book.should_auto_accept("alice"));
        assert!(!book.should_auto_accept("mallory"));
    }

    #[test]
    fn incoming_roundtrip_and_dedup() {
        let (_dir, book) = book();
        let id = Identity::generate();
        let req = FriendRequest::create(&id, "me", "them").unwrap();
        book.record_incoming(&req).unwrap();
        book.record_incoming(&req).unwrap();
        assert_eq!(book.pending_incoming().len(), 1);

        let taken = book.take_incoming(&req.sig).unwrap().unwrap();
        assert_eq!(taken.sig, req.sig);
        assert!(book.pending_incoming().is_empty());
        assert!(book.take_incoming(&req.sig).unwrap().is_none());
    }

    #[test]
    fn accept_matches_outgoing_by_request_sig() {
        let (_dir, book) = book();
        let us = Identity::generate();
        let them = Identity::generate();
        let req = FriendRequest::create(&us, "them", "us").unwrap();
        book.record_outgoing(&req).unwrap();

        let acc = FriendAccept::create(&them, "us", "them", &req.sig).unwrap();
        let matched = book.match_accept(&acc).unwrap().unwrap();
        assert_eq!(matched.sig, req.sig);
        // Second match finds nothing.
        assert!(book.match_accept(&acc).unwrap().is_none());
    }

    #[test]
    fn pending_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::generate();
        let req = FriendRequest::create(&id, "me", "them").unwrap();
        {
            let book = FriendBook::open(FileStore::open(dir.path()).unwrap()).unwrap();
            book.record_incoming(&req).unwrap();
            book.set_auto_accept(vec!["x".into()]).unwrap();
        }
        let book = FriendBook::open(FileStore::open(dir.path()).unwrap()).unwrap();
        assert_eq!(book.pending_incoming().len(), 1);
        assert_eq!(book.auto_accept_patterns(), vec!["x".to_string()]);
    }
}
