//! Swarm rendezvous abstraction.
//!
//! A rendezvous service connects peers that join the same 32-byte topic. A
//! node listens by joining the topic derived from its own signing key in
//! server mode; a dialer joins the peer's topic in client mode and uses the
//! first connection that emerges. The production binding (a DHT swarm) is an
//! external collaborator; `MemoryHub` provides the in-process implementation
//! the integration tests run on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

pub type Topic = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Accept connections from seekers at this topic.
    Server,
    /// Seek whoever is serving this topic.
    Client,
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Rendezvous has been destroyed")]
    Destroyed,

    #[error("Join failed: {0}")]
    Join(String),
}

pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// One successful dial or accept.
pub struct Connection {
    pub stream: BoxedStream,
    pub topic: Topic,
    pub inbound: bool,
}

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Join a topic. Connections arrive on the returned receiver until
    /// `leave`; a client receiver that closes without yielding means no
    /// peer was found.
    async fn join(
        &self,
        topic: Topic,
        mode: JoinMode,
    ) -> Result<mpsc::Receiver<Connection>, RendezvousError>;

    async fn leave(&self, topic: Topic) -> Result<(), RendezvousError>;

    /// Tear down all memberships.
    async fn destroy(&self) -> Result<(), RendezvousError>;
}

// ── In-process rendezvous ─────────────────────────────────────────────────────

const STREAM_BUFFER: usize = 64 * 1024;

/// Shared switchboard. Each node takes its own [`MemoryRendezvous`] endpoint
/// so that leaving a topic only drops that node's membership.
#[derive(Default)]
pub struct MemoryHub {
    servers: Mutex<HashMap<Topic, mpsc::Sender<Connection>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>) -> MemoryRendezvous {
        MemoryRendezvous {
            hub: Arc::clone(self),
            serving: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }
}

pub struct MemoryRendezvous {
    hub: Arc<MemoryHub>,
    serving: Mutex<Vec<Topic>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn join(
        &self,
        topic: Topic,
        mode: JoinMode,
    ) -> Result<mpsc::Receiver<Connection>, RendezvousError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RendezvousError::Destroyed);
        }
        match mode {
            JoinMode::Server => {
                let (tx, rx) = mpsc::channel(16);
                self.hub.servers.lock().insert(topic, tx);
                self.serving.lock().push(topic);
                Ok(rx)
            }
            JoinMode::Client => {
                let (tx, rx) = mpsc::channel(1);
                let server = self.hub.servers.lock().get(&topic).cloned();
                if let Some(server) = server {
                    let (near, far) = tokio::io::duplex(STREAM_BUFFER);
                    let delivered = server
                        .try_send(Connection {
                            stream: Box::new(far),
                            topic,
                            inbound: true,
                        })
                        .is_ok();
                    if delivered {
                        let _ = tx
                            .send(Connection {
                                stream: Box::new(near),
                                topic,
                                inbound: false,
                            })
                            .await;
                    }
                } else {
                    debug!("no server at topic, client join yields nothing");
                }
                // Dropping `tx` here closes the receiver once the (zero or
                // one) connection is consumed.
                Ok(rx)
            }
        }
    }

    async fn leave(&self, topic: Topic) -> Result<(), RendezvousError> {
        let mut serving = self.serving.lock();
        if let Some(pos) = serving.iter().position(|t| *t == topic) {
            serving.remove(pos);
            self.hub.servers.lock().remove(&topic);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RendezvousError> {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut serving = self.serving.lock();
        let mut servers = self.hub.servers.lock();
        for topic in serving.drain(..) {
            servers.remove(&topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn client_reaches_server() {
        let hub = MemoryHub::new();
        let server = hub.endpoint();
        let client = hub.endpoint();
        let topic = [7u8; 32];

        let mut inbound = server.join(topic, JoinMode::Server).await.unwrap();
        let mut outbound = client.join(topic, JoinMode::Client).await.unwrap();

        let mut conn_out = outbound.recv().await.unwrap();
        let mut conn_in = inbound.recv().await.unwrap();
        assert!(conn_in.inbound);
        assert!(!conn_out.inbound);

        conn_out.stream.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        conn_in.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
    }

    #[tokio::test]
    async fn client_without_server_yields_nothing() {
        let hub = MemoryHub::new();
        let client = hub.endpoint();
        let mut rx = client.join([1u8; 32], JoinMode::Client).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn leave_stops_serving() {
        let hub = MemoryHub::new();
        let server = hub.endpoint();
        let client = hub.endpoint();
        let topic = [2u8; 32];

        let _inbound = server.join(topic, JoinMode::Server).await.unwrap();
        server.leave(topic).await.unwrap();
        let mut rx = client.join(topic, JoinMode::Client).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_leave_does_not_unregister_server() {
        let hub = MemoryHub::new();
        let server = hub.endpoint();
        let client = hub.endpoint();
        let topic = [3u8; 32];

        let _inbound = server.join(topic, JoinMode::Server).await.unwrap();
        let _rx = client.join(topic, JoinMode::Client).await.unwrap();
        client.leave(topic).await.unwrap();

        let mut rx2 = client.join(topic, JoinMode::Client).await.unwrap();
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn destroyed_endpoint_refuses_joins() {
        let hub = MemoryHub::new();
        let endpoint = hub.endpoint();
        endpoint.destroy().await.unwrap();
        assert!(matches!(
            endpoint.join([0u8; 32], JoinMode::Server).await,
            Err(RendezvousError::Destroyed)
        ));
    }
}
