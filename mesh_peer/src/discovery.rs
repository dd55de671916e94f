//! Peer discovery.
//!
//! A node learns whom to dial from the rendezvous registry, from UDP
//! broadcasts on the local network, or from a static list supplied at
//! startup. Registry contact is bounded: after the configured number of
//! attempts the node gives up and starts with no peers.

use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use mesh_shared::{
    config::NodeConfig,
    error::{SyncError, SyncResult},
    net::{PeerAddress, ReliableConn},
    protocol::{Message, PeersResponse},
};
use tokio::{net::UdpSocket, task::AbortHandle};
use tracing::{debug, info, warn};

/// Delay between LAN announcements.
const LAN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3);

/// Source of peer addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Makes `me` visible to other nodes.
    async fn announce(&self, me: &PeerAddress) -> SyncResult<()>;

    /// Current peer list. May contain `me`.
    async fn peers(&self) -> SyncResult<Vec<PeerAddress>>;

    /// Best-effort removal of `me`.
    async fn withdraw(&self, me: &PeerAddress) -> SyncResult<()>;
}

/// Drops the caller's own address from a peer list.
pub fn without_self(peers: Vec<PeerAddress>, me: &PeerAddress) -> Vec<PeerAddress> {
    peers.into_iter().filter(|p| p != me).collect()
}

/// Talks to the rendezvous registry, one TCP connection per request.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    addr: PeerAddress,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(addr: PeerAddress, attempts: u32, retry_delay: Duration, timeout: Duration) -> Self {
        Self {
            addr,
            attempts: attempts.max(1),
            retry_delay,
            timeout,
        }
    }

    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self::new(
            PeerAddress::new(cfg.registry_addr.clone()),
            cfg.registry_retries,
            cfg.retry_delay(),
            cfg.connect_timeout(),
        )
    }

    pub fn addr(&self) -> &PeerAddress {
        &self.addr
    }

    /// Single `register` request.
    pub async fn register(&self, me: &PeerAddress) -> SyncResult<()> {
        self.request(&Message::Register { addr: me.clone() }).await
    }

    /// Single `deregister` request.
    pub async fn deregister(&self, me: &PeerAddress) -> SyncResult<()> {
        self.request(&Message::Deregister { addr: me.clone() }).await
    }

    /// Single `get_peers` round trip. The list is unfiltered.
    pub async fn get_peers(&self) -> SyncResult<Vec<PeerAddress>> {
        let exchange = async {
            let mut conn = ReliableConn::connect(&self.addr).await?;
            conn.send(&Message::GetPeers).await?;
            match conn.recv::<PeersResponse>().await? {
                Some(resp) => Ok(resp.peers),
                None => Err(SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "registry closed without a peer list",
                ))),
            }
        };
        self.with_timeout(exchange).await
    }

    /// Sends a request that has no reply. The registry closes the
    /// connection once the request is applied; waiting for that close makes
    /// a following `get_peers` observe it.
    async fn request(&self, msg: &Message) -> SyncResult<()> {
        let exchange = async {
            let mut conn = ReliableConn::connect(&self.addr).await?;
            conn.send(msg).await?;
            while conn.recv_frame().await?.is_some() {}
            Ok(())
        };
        self.with_timeout(exchange).await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "registry request timed out",
            ))),
        }
    }

    fn unavailable(&self) -> SyncError {
        SyncError::RegistryUnavailable {
            addr: self.addr.clone(),
            attempts: self.attempts,
        }
    }
}

#[async_trait]
impl Discovery for RegistryClient {
    async fn announce(&self, me: &PeerAddress) -> SyncResult<()> {
        for attempt in 1..=self.attempts {
            match self.register(me).await {
                Ok(()) => {
                    info!(registry = %self.addr, me = %me, "Registered with registry");
                    return Ok(());
                }
                Err(e) => {
                    warn!(registry = %self.addr, attempt, error = %e, "Register failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(self.unavailable())
    }

    async fn peers(&self) -> SyncResult<Vec<PeerAddress>> {
        for attempt in 1..=self.attempts {
            match self.get_peers().await {
                Ok(peers) => {
                    debug!(registry = %self.addr, count = peers.len(), "Fetched peer list");
                    return Ok(peers);
                }
                Err(e) => {
                    warn!(registry = %self.addr, attempt, error = %e, "get_peers failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(self.unavailable())
    }

    async fn withdraw(&self, me: &PeerAddress) -> SyncResult<()> {
        self.deregister(me).await
    }
}

/// Fixed peer list that bypasses the registry.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<PeerAddress>,
}

impl StaticPeers {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticPeers {
    async fn announce(&self, _me: &PeerAddress) -> SyncResult<()> {
        Ok(())
    }

    async fn peers(&self) -> SyncResult<Vec<PeerAddress>> {
        Ok(self.peers.clone())
    }

    async fn withdraw(&self, _me: &PeerAddress) -> SyncResult<()> {
        Ok(())
    }
}

/// LAN discovery by UDP broadcast.
///
/// Announcements are `HELLO:<tcp port>:<nonce>` datagrams, repeated every
/// few seconds until `withdraw`. A peer's address is the datagram's source IP
/// with the announced port. The nonce lets a node skip its own broadcasts;
/// datagrams without one (`HELLO:<port>`) are accepted too.
pub struct LanDiscovery {
    target: SocketAddr,
    local_addr: SocketAddr,
    nonce: u64,
    window: Duration,
    found: Arc<Mutex<BTreeSet<PeerAddress>>>,
    listener: AbortHandle,
    announcer: Mutex<Option<AbortHandle>>,
}

impl LanDiscovery {
    /// Starts listening on `listen`. Announcements go to `target`.
    pub async fn bind(listen: &str, target: SocketAddr, window: Duration) -> SyncResult<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|source| SyncError::Bind {
                addr: listen.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        let nonce = rand::random::<u64>();
        let found = Arc::new(Mutex::new(BTreeSet::new()));
        let listener = tokio::spawn(lan_listen(socket, nonce, Arc::clone(&found))).abort_handle();
        info!(%local_addr, %target, "Listening for LAN announcements");
        Ok(Self {
            target,
            local_addr,
            nonce,
            window,
            found,
            listener,
            announcer: Mutex::new(None),
        })
    }

    /// Listens on `0.0.0.0:<lan_port>` and broadcasts to
    /// `255.255.255.255:<lan_port>`.
    pub async fn from_config(cfg: &NodeConfig) -> SyncResult<Self> {
        Self::bind(
            &format!("0.0.0.0:{}", cfg.lan_port),
            SocketAddr::from((Ipv4Addr::BROADCAST, cfg.lan_port)),
            cfg.lan_window(),
        )
        .await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Addresses heard so far.
    pub fn discovered(&self) -> Vec<PeerAddress> {
        self.found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn stop_announcing(&self) {
        if let Some(task) = self
            .announcer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        self.listener.abort();
        self.stop_announcing();
    }
}

/// Parses an announcement. Returns the TCP port unless the datagram is
/// malformed or carries `own_nonce`.
fn parse_hello(datagram: &str, own_nonce: u64) -> Option<u16> {
    let mut parts = datagram.trim().split(':');
    if parts.next()? != "HELLO" {
        return None;
    }
    let port = parts.next()?.parse().ok()?;
    match parts.next().map(str::parse::<u64>) {
        Some(Ok(nonce)) if nonce == own_nonce => None,
        _ => Some(port),
    }
}

async fn lan_listen(socket: UdpSocket, nonce: u64, found: Arc<Mutex<BTreeSet<PeerAddress>>>) {
    let mut buf = [0u8; 1024];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "LAN discovery read failed");
                continue;
            }
        };
        let Some(port) = std::str::from_utf8(&buf[..n])
            .ok()
            .and_then(|text| parse_hello(text, nonce))
        else {
            continue;
        };
        let peer = PeerAddress::from(SocketAddr::new(from.ip(), port));
        let new = found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone());
        if new {
            info!(%peer, "Discovered peer on LAN");
        }
    }
}

#[async_trait]
impl Discovery for LanDiscovery {
    /// Sends one announcement now and keeps repeating it in the background.
    async fn announce(&self, me: &PeerAddress) -> SyncResult<()> {
        let port = me
            .as_str()
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no port in {me}"),
                ))
            })?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        let hello = format!("HELLO:{port}:{}", self.nonce);
        socket.send_to(hello.as_bytes(), self.target).await?;
        debug!(target = %self.target, %hello, "Sent LAN announcement");

        let target = self.target;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LAN_ANNOUNCE_INTERVAL).await;
                if let Err(e) = socket.send_to(hello.as_bytes(), target).await {
                    warn!(%target, error = %e, "LAN announcement failed");
                }
            }
        });
        let previous = self
            .announcer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Listens for the configured window, then returns everything heard.
    async fn peers(&self) -> SyncResult<Vec<PeerAddress>> {
        tokio::time::sleep(self.window).await;
        Ok(self.discovered())
    }

    async fn withdraw(&self, _me: &PeerAddress) -> SyncResult<()> {
        self.stop_announcing();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_filtering_removes_only_the_caller() {
        let me = PeerAddress::from("10.0.0.2:9001");
        let peers = vec![
            PeerAddress::from("10.0.0.1:9001"),
            PeerAddress::from("10.0.0.2:9001"),
        ];
        assert_eq!(
            without_self(peers, &me),
            vec![PeerAddress::from("10.0.0.1:9001")]
        );
    }

    #[tokio::test]
    async fn unreachable_registry_gives_up_after_bounded_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddress::from(listener.local_addr().unwrap());
        drop(listener);

        let client = RegistryClient::new(
            addr,
            2,
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        let err = client.peers().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::RegistryUnavailable { attempts: 2, .. }
        ));
    }

    #[test]
    fn hello_parsing_skips_own_nonce() {
        assert_eq!(parse_hello("HELLO:9001", 7), Some(9001));
        assert_eq!(parse_hello("HELLO:9001:8\n", 7), Some(9001));
        assert_eq!(parse_hello("HELLO:9001:7", 7), None);
        assert_eq!(parse_hello("HELLO:port", 7), None);
        assert_eq!(parse_hello("BYE:9001", 7), None);
    }

    #[tokio::test]
    async fn lan_announcement_is_heard() {
        let unused = SocketAddr::from(([127, 0, 0, 1], 9));
        let listener = LanDiscovery::bind("127.0.0.1:0", unused, Duration::from_millis(50))
            .await
            .unwrap();
        let speaker = LanDiscovery::bind(
            "127.0.0.1:0",
            listener.local_addr(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        speaker.announce(&"127.0.0.1:9100".into()).await.unwrap();
        let mut heard = Vec::new();
        for _ in 0..20 {
            heard = listener.peers().await.unwrap();
            if !heard.is_empty() {
                break;
            }
        }
        assert_eq!(heard, vec![PeerAddress::from("127.0.0.1:9100")]);
        speaker.withdraw(&"127.0.0.1:9100".into()).await.unwrap();
    }

    #[tokio::test]
    async fn static_list_is_returned_verbatim() {
        let list = StaticPeers::new(vec!["10.0.0.1:9001".into()]);
        list.announce(&"10.0.0.2:9001".into()).await.unwrap();
        assert_eq!(list.peers().await.unwrap().len(), 1);
    }
}
