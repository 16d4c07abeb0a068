//! WOP agent overlay — durable trust and identity state.
//!
//! JSON documents under a single owner-only directory: identity (with secret
//! halves), peers, access grants, pending friend handshakes, auto-accept
//! rules, node config. Writes are staged and renamed so restarts never see a
//! torn record.

pub mod db;
pub mod error;
pub mod friends;
pub mod identity_store;
pub mod invites;
pub mod models;
pub mod trust;

pub use db::FileStore;
pub use error::StoreError;
pub use friends::FriendBook;
pub use identity_store::IdentityStore;
pub use invites::InviteLedger;
pub use models::{
    AccessGrant, IssuedInvite, KeyHistoryEntry, NodeConfig, PeerRecord, PendingFriend,
};
pub use trust::TrustStore;
