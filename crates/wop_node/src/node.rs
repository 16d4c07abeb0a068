//! Node orchestration and public API.
//!
//! A `Node` owns the identity, trust state and process-wide guards, listens
//! at the topic derived from its own signing key, and exposes the outbound
//! operations (`claim`, `send_log`, `send_inject`, `notify_rotation`) plus
//! the out-of-band friend handshake. Public send/claim calls never error:
//! they return an [`Outcome`] carrying an exit code and optional message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wop_crypto::rotation::{KeyRotation, RotationReason};
use wop_crypto::token;
use wop_crypto::{CryptoError, Identity, PublicKeyBytes};
use wop_proto::friend::{friend_session_name, FriendAccept, FriendRecordError, FriendRequest};
use wop_proto::ExitCode;
use wop_store::{
    FileStore, FriendBook, IdentityStore, InviteLedger, IssuedInvite, NodeConfig, PendingFriend,
    StoreError, TrustStore,
};

use crate::dialer::{self, Request};
use crate::engine::serve_connection;
use crate::handlers::{InjectHandler, LogHandler};
use crate::limiter::{RateLimiter, ReplayGuard};
use crate::reentry::InjectGuard;
use crate::rendezvous::{JoinMode, Rendezvous, RendezvousError};

/// Inject dials wait at least this long for the remote agent.
pub const INJECT_TIMEOUT_FLOOR: Duration = Duration::from_secs(30);

/// Message attached to an inject refused by the reentrancy guard.
pub const REENTRANCY_BLOCKED: &str = "reentrant inject blocked";

const CONFIG_DOC: &str = "config";

/// Cadence of the background sweep over expired key history and invites.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Friend(#[from] FriendRecordError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Result of a top-level send/claim call.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub code: ExitCode,
    pub message: Option<String>,
    /// Decrypted agent reply, present on a successful inject with a handler
    /// on the far side.
    pub reply: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self { code: ExitCode::Ok, message: None, reply: None }
    }

    pub fn ok_with_reply(reply: String) -> Self {
        Self { code: ExitCode::Ok, message: None, reply: Some(reply) }
    }

    pub fn fail(code: ExitCode, message: impl Into<String>) -> Self {
        Self { code, message: Some(message.into()), reply: None }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ExitCode::Ok
    }

    pub fn is_reentrancy_blocked(&self) -> bool {
        self.message.as_deref() == Some(REENTRANCY_BLOCKED)
    }
}

/// Process-wide state shared by the listener engine and the dialer.
pub(crate) struct NodeState {
    pub identity: RwLock<Identity>,
    pub identity_store: IdentityStore,
    pub trust: TrustStore,
    pub friends: FriendBook,
    pub invites: InviteLedger,
    pub config: NodeConfig,
    pub replay: ReplayGuard,
    pub limiter: RateLimiter,
    pub inject_guard: InjectGuard,
    pub rendezvous: Arc<dyn Rendezvous>,
    pub log_handler: RwLock<Option<Arc<dyn LogHandler>>>,
    pub inject_handler: RwLock<Option<Arc<dyn InjectHandler>>>,
}

pub struct Node {
    state: Arc<NodeState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open (or create) a node rooted at `data_dir`. The identity is created
    /// on first start and reloaded afterwards; `config` is persisted so the
    /// node comes back with the same display name and auto-accept rules.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        config: NodeConfig,
        rendezvous: Arc<dyn Rendezvous>,
    ) -> Result<Self, NodeError> {
        let root: PathBuf = data_dir.into();
        let identity_store = IdentityStore::new(FileStore::open(&root)?);
        let identity = match identity_store.load()? {
            Some(identity) => identity,
            None => identity_store.init(false)?,
        };
        let trust = TrustStore::open(FileStore::open(&root)?)?;
        let friends = FriendBook::open(FileStore::open(&root)?)?;
        let invites = InviteLedger::open(FileStore::open(&root)?)?;

        let config_db = FileStore::open(&root)?;
        let config = match config_db.load::<NodeConfig>(CONFIG_DOC)? {
            Some(stored) => stored,
            None => {
                config_db.save(CONFIG_DOC, &config)?;
                config
            }
        };

        info!(id = %identity.short_id(), name = %config.display_name, "node open");
        Ok(Self {
            state: Arc::new(NodeState {
                identity: RwLock::new(identity),
                identity_store,
                trust,
                friends,
                invites,
                config,
                replay: ReplayGuard::new(),
                limiter: RateLimiter::new(),
                inject_guard: InjectGuard::new(),
                rendezvous,
                log_handler: RwLock::new(None),
                inject_handler: RwLock::new(None),
            }),
            listener: Mutex::new(None),
            maintenance: Mutex::new(None),
        })
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn sign_pub(&self) -> String {
        self.state.identity.read().sign_pub.to_b64()
    }

    pub fn kx_pub(&self) -> String {
        self.state.identity.read().kx_pub.to_b64()
    }

    pub fn short_id(&self) -> String {
        self.state.identity.read().short_id()
    }

    /// Rotate the node identity. The returned record should be delivered to
    /// every peer via [`Node::notify_rotation`].
    pub fn rotate_identity(&self, reason: RotationReason) -> Result<KeyRotation, NodeError> {
        let mut identity = self.state.identity.write();
        let (rotated, record) = self.state.identity_store.rotate(&identity, reason)?;
        *identity = rotated;
        Ok(record)
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    pub fn set_log_handler(&self, handler: Arc<dyn LogHandler>) {
        *self.state.log_handler.write() = Some(handler);
    }

    pub fn set_inject_handler(&self, handler: Arc<dyn InjectHandler>) {
        *self.state.inject_handler.write() = Some(handler);
    }

    // ── Listener lifecycle ───────────────────────────────────────────────────

    /// Join our own topic in server mode and serve inbound connections until
    /// shutdown. The membership lives for the process lifetime.
    pub async fn start(&self) -> Result<(), NodeError> {
        let topic = self.state.identity.read().topic();
        let mut connections = self.state.rendezvous.join(topic, JoinMode::Server).await?;
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(conn) = connections.recv().await {
                tokio::spawn(serve_connection(Arc::clone(&state), conn.stream));
            }
        });
        *self.listener.lock() = Some(handle);

        let state = Arc::clone(&self.state);
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = state.trust.cleanup_expired_history() {
                    warn!("history sweep failed: {e}");
                }
                if let Err(e) = state.invites.sweep_expired() {
                    warn!("invite sweep failed: {e}");
                }
            }
        });
        *self.maintenance.lock() = Some(sweeper);

        info!(id = %self.short_id(), "listening at own-key topic");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let topic = self.state.identity.read().topic();
        let _ = self.state.rendezvous.leave(topic).await;
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }

    // ── Invites ──────────────────────────────────────────────────────────────

    /// Issue a `wop1://…` token granting `sub_sign_pub` the given sessions.
    /// The token is remembered locally so it can be listed and revoked.
    pub fn issue_invite(
        &self,
        sub_sign_pub: &str,
        sessions: Vec<String>,
        caps: Vec<String>,
        ttl_hours: i64,
    ) -> Result<String, NodeError> {
        let token = {
            let identity = self.state.identity.read();
            token::issue(&identity, sub_sign_pub, sessions, caps, ttl_hours)?
        };
        self.state.invites.record(&token)?;
        Ok(token.to_uri()?)
    }

    pub fn issued_invites(&self) -> Vec<IssuedInvite> {
        self.state.invites.list()
    }

    /// Revoke an outstanding invite before it is redeemed.
    pub fn revoke_invite(&self, nonce: &str) -> Result<(), NodeError> {
        self.state.invites.revoke(nonce)?;
        Ok(())
    }

    /// Redeem an invite against its issuer: dial the issuer's topic, present
    /// the token, record the issuer as a peer on success.
    pub async fn claim(&self, token_uri: &str, timeout: Duration) -> Outcome {
        let token = match token::parse(token_uri) {
            Ok(token) => token,
            Err(e) => return Outcome::fail(ExitCode::Invalid, e.to_string()),
        };
        if token.sub != self.sign_pub() {
            return Outcome::fail(ExitCode::Unauthorized, "token issued to a different subject");
        }
        let issuer = token.iss.clone();
        let request = Request::Claim { uri: token_uri.to_string(), token };
        dialer::dial(&self.state, &issuer, request, timeout).await
    }

    // ── Messaging ────────────────────────────────────────────────────────────

    /// Fire-and-forget record delivery. `peer` may be a full key, short id,
    /// or display name.
    pub async fn send_log(
        &self,
        peer: &str,
        session: &str,
        message: &str,
        timeout: Duration,
    ) -> Outcome {
        let peer_key = match self.state.trust.resolve(peer) {
            Ok(key) => key,
            Err(_) => return Outcome::fail(ExitCode::Invalid, format!("unknown peer {peer}")),
        };
        let request = Request::Log { session: session.to_string(), message: message.to_string() };
        dialer::dial(&self.state, &peer_key, request, timeout).await
    }

    /// Synchronous request/response against the peer's agent. Refused
    /// immediately when called from inside an inject for the same session;
    /// the effective timeout never drops below [`INJECT_TIMEOUT_FLOOR`].
    pub async fn send_inject(
        &self,
        peer: &str,
        session: &str,
        message: &str,
        timeout: Duration,
    ) -> Outcome {
        if self.state.inject_guard.is_active(session) {
            return Outcome::fail(ExitCode::Rejected, REENTRANCY_BLOCKED);
        }
        let peer_key = match self.state.trust.resolve(peer) {
            Ok(key) => key,
            Err(_) => return Outcome::fail(ExitCode::Invalid, format!("unknown peer {peer}")),
        };
        let request =
            Request::Inject { session: session.to_string(), message: message.to_string() };
        dialer::dial(&self.state, &peer_key, request, timeout.max(INJECT_TIMEOUT_FLOOR)).await
    }

    /// Deliver a key-rotation record to one peer.
    pub async fn notify_rotation(
        &self,
        peer: &str,
        record: &KeyRotation,
        timeout: Duration,
    ) -> Outcome {
        let peer_key = match self.state.trust.resolve(peer) {
            Ok(key) => key,
            Err(_) => return Outcome::fail(ExitCode::Invalid, format!("unknown peer {peer}")),
        };
        let request = Request::Rotation { record: record.clone() };
        dialer::dial(&self.state, &peer_key, request, timeout).await
    }

    // ── Friend handshake (out-of-band) ───────────────────────────────────────

    /// Produce a `FRIEND_REQUEST` record for an opaque text channel and
    /// remember it so the matching accept can be paired later.
    pub fn friend_request(&self, to_name: &str) -> Result<String, NodeError> {
        let identity = self.state.identity.read();
        let request =
            FriendRequest::create(&identity, to_name, &self.state.config.display_name)?;
        drop(identity);
        self.state.friends.record_outgoing(&request)?;
        Ok(request.to_wire())
    }

    /// Handle an incoming `FRIEND_REQUEST`. Auto-accept rules may answer on
    /// the spot, returning the `FRIEND_ACCEPT` wire record to post back;
    /// otherwise the request is parked for an explicit decision.
    pub fn handle_friend_request(&self, wire: &str) -> Result<Option<String>, NodeError> {
        let request = FriendRequest::parse(wire)?;
        if self.state.friends.should_auto_accept(&request.from) {
            info!(from = %request.from, "friend request auto-accepted");
            let accept = self.accept_parsed(&request)?;
            return Ok(Some(accept));
        }
        self.state.friends.record_incoming(&request)?;
        Ok(None)
    }

    /// Explicitly accept a pending incoming request by its signature.
    pub fn accept_friend(&self, request_sig: &str) -> Result<String, NodeError> {
        let request = self
            .state
            .friends
            .take_incoming(request_sig)?
            .ok_or_else(|| StoreError::NotFound(format!("pending request {request_sig}")))?;
        self.accept_parsed(&request)
    }

    fn accept_parsed(&self, request: &FriendRequest) -> Result<String, NodeError> {
        self.befriend(&request.pubkey, &request.encrypt_pub, &request.from)?;
        let identity = self.state.identity.read();
        let accept = FriendAccept::create(
            &identity,
            &request.from,
            &self.state.config.display_name,
            &request.sig,
        )?;
        Ok(accept.to_wire())
    }

    /// Handle a `FRIEND_ACCEPT` observed on the channel. Returns true iff it
    /// answered one of our outstanding requests.
    pub fn handle_friend_accept(&self, wire: &str) -> Result<bool, NodeError> {
        let accept = FriendAccept::parse(wire)?;
        let Some(_original) = self.state.friends.match_accept(&accept)? else {
            return Ok(false);
        };
        self.befriend(&accept.pubkey, &accept.encrypt_pub, &accept.from)?;
        info!(from = %accept.from, "friend accept recorded");
        Ok(true)
    }

    /// Record the counterpart as a peer with the deterministic friend
    /// session and the initial `message` capability. Friend capabilities
    /// are strictly message/inject; nothing stronger is ever granted here.
    fn befriend(&self, sign_pub: &str, kx_pub: &str, name: &str) -> Result<(), NodeError> {
        let key = PublicKeyBytes::from_b64(sign_pub)?;
        let session = friend_session_name(name, &key);
        let sessions = vec![session];
        let caps = vec!["message".to_string()];
        self.state.trust.add_peer(sign_pub, &sessions, &caps, Some(kx_pub))?;
        self.state.trust.grant_access(sign_pub, &sessions, &caps, Some(kx_pub))?;
        self.state.trust.name_peer(sign_pub, name)?;
        Ok(())
    }

    pub fn pending_friend_requests(&self) -> Vec<PendingFriend> {
        self.state.friends.pending_incoming()
    }

    pub fn set_auto_accept(&self, patterns: Vec<String>) -> Result<(), NodeError> {
        self.state.friends.set_auto_accept(patterns)?;
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn trust(&self) -> &TrustStore {
        &self.state.trust
    }

    pub fn config(&self) -> &NodeConfig {
        &self.state.config
    }
}
