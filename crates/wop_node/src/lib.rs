//! WOP agent overlay — node orchestration.
//!
//! Wires the crypto, protocol and store layers into a running node: a
//! listener serving the wire state machine at the node's own-key topic, a
//! dialer performing one request-response exchange per outbound call, and
//! the process-wide replay, rate-limit and inject-reentrancy guards.

pub mod dialer;
pub mod engine;
pub mod handlers;
pub mod limiter;
pub mod node;
pub mod reentry;
pub mod rendezvous;

pub use handlers::{InjectHandler, LogHandler};
pub use limiter::{RateLimiter, ReplayGuard};
pub use node::{Node, NodeError, Outcome, INJECT_TIMEOUT_FLOOR, REENTRANCY_BLOCKED};
pub use reentry::InjectGuard;
pub use rendezvous::{
    BoxedStream, Connection, JoinMode, MemoryHub, MemoryRendezvous, Rendezvous, RendezvousError,
    Topic,
};
pub use wop_proto::ExitCode;
