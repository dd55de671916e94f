//! Registry implementation.
//!
//! Each accepted connection gets its own task. The task reads exactly one
//! request frame, applies it under the set lock, writes a response for
//! `get_peers` only, and closes the connection. Retries are the caller's
//! business.

use std::{
    collections::BTreeSet,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Context;
use mesh_shared::{
    error::{SyncError, SyncResult},
    net::{bind_listener, PeerAddress, ReliableConn},
    protocol::Message,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// How long a client may take to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Set of known peer addresses.
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<BTreeSet<PeerAddress>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<PeerAddress>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent insert. Returns true if the address was new.
    pub fn register(&self, addr: PeerAddress) -> bool {
        self.lock().insert(addr)
    }

    /// Idempotent remove. Returns true if the address was present.
    pub fn deregister(&self, addr: &PeerAddress) -> bool {
        self.lock().remove(addr)
    }

    /// Every known address, sorted. The requester is not filtered out.
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Applies one request. Returns the reply to write, if any.
    pub fn handle(&self, request: Message) -> Option<Message> {
        match request {
            Message::Register { addr } => {
                if self.register(addr.clone()) {
                    info!(peer = %addr, total = self.len(), "Registered peer");
                } else {
                    debug!(peer = %addr, "Peer already registered");
                }
                None
            }
            Message::Deregister { addr } => {
                if self.deregister(&addr) {
                    info!(peer = %addr, total = self.len(), "Deregistered peer");
                }
                None
            }
            Message::GetPeers => Some(Message::GetPeersResponse {
                peers: self.peers(),
            }),
            other => {
                warn!(msg = ?other, "Unsupported registry request");
                None
            }
        }
    }
}

/// TCP front end for a [`Registry`].
pub struct RegistryServer {
    registry: Arc<Registry>,
    listener: TcpListener,
}

impl RegistryServer {
    /// Binds the listening socket.
    pub async fn bind(addr: &str) -> SyncResult<Self> {
        let listener = bind_listener(addr).await?;
        Ok(Self {
            registry: Arc::new(Registry::new()),
            listener,
        })
    }

    /// Binds to an ephemeral localhost port.
    pub async fn bind_ephemeral() -> SyncResult<Self> {
        Self::bind("127.0.0.1:0").await
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("registry local_addr")
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, from) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = serve_one(&registry, ReliableConn::new(stream)).await {
                    debug!(%from, error = %e, "Registry request failed");
                }
            });
        }
    }
}

async fn serve_one(registry: &Registry, mut conn: ReliableConn) -> SyncResult<()> {
    let request = match tokio::time::timeout(REQUEST_TIMEOUT, conn.recv::<Message>()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request timed out",
            )))
        }
    };
    let Some(request) = request else {
        return Ok(());
    };
    if let Some(reply) = registry.handle(request) {
        conn.send(&reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let registry = Registry::new();
        assert!(registry.register("10.0.0.1:9001".into()));
        assert!(!registry.register("10.0.0.1:9001".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_absent_is_a_no_op() {
        let registry = Registry::new();
        registry.register("10.0.0.1:9001".into());
        assert!(!registry.deregister(&"10.0.0.9:9001".into()));
        assert!(registry.deregister(&"10.0.0.1:9001".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn get_peers_returns_everyone_including_the_caller() {
        let registry = Registry::new();
        registry.handle(Message::Register {
            addr: "10.0.0.1:9001".into(),
        });
        registry.handle(Message::Register {
            addr: "10.0.0.2:9001".into(),
        });

        let reply = registry.handle(Message::GetPeers);
        assert_eq!(
            reply,
            Some(Message::GetPeersResponse {
                peers: vec!["10.0.0.1:9001".into(), "10.0.0.2:9001".into()],
            })
        );
    }

    #[test]
    fn peer_link_messages_get_no_reply() {
        let registry = Registry::new();
        let reply = registry.handle(Message::Eliminate { id: "p1".into() });
        assert!(reply.is_none());
        assert!(registry.is_empty());
    }
}
