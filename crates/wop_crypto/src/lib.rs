//! WOP agent overlay — identity and credential cryptography.
//!
//! Long-term Ed25519 signing + X25519 key-agreement identities, per-connection
//! ephemeral agreement for forward secrecy, AES-256-GCM payload encryption,
//! signed invite tokens (`wop1://…`) and signed key-rotation records with a
//! 24-hour grace window.

pub mod aead;
pub mod agreement;
pub mod error;
pub mod identity;
pub mod rotation;
pub mod token;

pub use error::CryptoError;
pub use identity::{short_id, topic_of, verify_b64, verify_bytes, Identity, PublicKeyBytes};
