//! Connection manager.
//!
//! Maintains the link table (remote address → live connection) and one read
//! loop task per link. The table lock is a plain mutex that is never held
//! across network I/O: broadcast snapshots the writers, writes unlocked, and
//! re-locks only to tear down failed links.
//!
//! Every accepted link is first sent the greeting (if one is set), so the
//! dialer learns about this node without waiting for it to change.
//!
//! Duplicate links:
//! - `connect` is a no-op when the address is present or already being
//!   dialed by this node.
//! - When two nodes dial each other at the same time, the link dialed by the
//!   lexicographically smaller address wins on both sides; the other socket
//!   is closed.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use mesh_shared::{
    error::{SyncError, SyncResult},
    net::{bind_listener, encode_frame, write_frame, FrameReader, PeerAddress, ReliableConn},
    protocol::{decode_message, dispatch_peer_message, Message},
    state::StateStore,
};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore},
    task::AbortHandle,
};
use tracing::{debug, info, warn};

/// How long an acceptor waits for the dialer's `hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound for one frame write during broadcast.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Link limits and timeouts.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    pub max_connections: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            max_connections: 64,
        }
    }
}

/// Which side opened a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Result of [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    /// Another `connect` to the same address is in flight.
    InProgress,
    /// The dial succeeded but a preferred link to the address appeared
    /// meanwhile. The new socket was closed.
    Superseded,
    /// Refused to dial ourselves.
    SelfAddress,
    AtCapacity,
}

/// Produces the message sent on every newly accepted link.
pub type Greeting = Arc<dyn Fn() -> Option<Message> + Send + Sync>;

struct Link {
    id: u64,
    direction: Direction,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    reader: AbortHandle,
}

#[derive(Default)]
struct Table {
    links: HashMap<PeerAddress, Link>,
    dialing: HashSet<PeerAddress>,
}

struct Inner {
    self_addr: PeerAddress,
    store: StateStore,
    options: LinkOptions,
    table: Mutex<Table>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    acceptor: Mutex<Option<AbortHandle>>,
    greeting: Mutex<Option<Greeting>>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when a link in `direction` to `remote` is the one both ends keep.
    fn preferred(&self, remote: &PeerAddress, direction: Direction) -> bool {
        match direction {
            Direction::Outbound => self.self_addr < *remote,
            Direction::Inbound => *remote < self.self_addr,
        }
    }

    fn greeting(&self) -> Option<Message> {
        let greeting = self
            .greeting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        greeting.and_then(|f| f())
    }

    /// Writes one pre-encoded frame to the link at `addr`. A failed write
    /// tears the link down. Returns false when there is no such link.
    async fn send_frame(&self, addr: &PeerAddress, frame: &[u8]) -> SyncResult<bool> {
        let target = self
            .table()
            .links
            .get(addr)
            .map(|link| (link.id, Arc::clone(&link.writer)));
        let Some((id, writer)) = target else {
            return Ok(false);
        };
        match write_link(&writer, frame).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(peer = %addr, error = %e, "Write failed, dropping link");
                if self.remove_link(addr, id) {
                    self.store.on_peer_disconnected(addr);
                }
                Err(e)
            }
        }
    }

    /// Removes the link if it is still the one identified by `id`.
    /// Returns true when something was removed.
    fn remove_link(&self, addr: &PeerAddress, id: u64) -> bool {
        let removed = {
            let mut table = self.table();
            match table.links.get(addr) {
                Some(link) if link.id == id => table.links.remove(addr),
                _ => None,
            }
        };
        match removed {
            Some(link) => {
                link.reader.abort();
                true
            }
            None => false,
        }
    }
}

/// Clears the in-flight dial marker, also when the dial future is dropped.
struct DialGuard<'a> {
    inner: &'a Inner,
    addr: &'a PeerAddress,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.inner.table().dialing.remove(self.addr);
    }
}

/// Owns the link table. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager that announces itself as `self_addr` and applies
    /// inbound messages to `store`.
    pub fn new(self_addr: PeerAddress, store: StateStore, options: LinkOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_connections));
        Self {
            inner: Arc::new(Inner {
                self_addr,
                store,
                options,
                table: Mutex::new(Table::default()),
                permits,
                next_id: AtomicU64::new(1),
                acceptor: Mutex::new(None),
                greeting: Mutex::new(None),
            }),
        }
    }

    pub fn self_addr(&self) -> &PeerAddress {
        &self.inner.self_addr
    }

    /// Sets the message sent first on every accepted link.
    pub fn set_greeting(&self, greeting: impl Fn() -> Option<Message> + Send + Sync + 'static) {
        *self
            .inner
            .greeting
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(greeting));
    }

    /// Binds `bind_addr` and starts accepting. Bind failure is fatal to the
    /// node and is returned to the caller.
    pub async fn listen(&self, bind_addr: &str) -> SyncResult<SocketAddr> {
        let listener = bind_listener(bind_addr).await?;
        let local = listener.local_addr()?;
        self.serve(listener);
        info!(%local, "Listening for peers");
        Ok(local)
    }

    /// Starts the accept loop on an already bound listener.
    pub fn serve(&self, listener: TcpListener) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        tokio::spawn(accept_link(Arc::clone(&inner), stream, from));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        });
        let previous = self
            .inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Dials `addr` unless a link already exists. The presence check and the
    /// dial are not atomic with respect to the remote dialing us.
    pub async fn connect(&self, addr: &PeerAddress) -> SyncResult<ConnectOutcome> {
        let inner = &self.inner;
        if *addr == inner.self_addr {
            return Ok(ConnectOutcome::SelfAddress);
        }
        {
            let mut table = inner.table();
            if table.links.contains_key(addr) {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            if !table.dialing.insert(addr.clone()) {
                return Ok(ConnectOutcome::InProgress);
            }
        }

        let _dialing = DialGuard { inner, addr };
        self.dial(addr).await
    }

    async fn dial(&self, addr: &PeerAddress) -> SyncResult<ConnectOutcome> {
        let inner = &self.inner;
        let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
            warn!(peer = %addr, "Link limit reached, not dialing");
            return Ok(ConnectOutcome::AtCapacity);
        };

        let mut conn =
            match tokio::time::timeout(inner.options.connect_timeout, ReliableConn::connect(addr))
                .await
            {
                Ok(conn) => conn?,
                Err(_) => {
                    return Err(SyncError::Connect {
                        addr: addr.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "dial timed out",
                        ),
                    })
                }
            };
        conn.send(&Message::Hello {
            addr: inner.self_addr.clone(),
        })
        .await?;

        if install(inner, addr.clone(), conn, permit, Direction::Outbound, None) {
            info!(peer = %addr, "Connected to peer");
            Ok(ConnectOutcome::Connected)
        } else {
            Ok(ConnectOutcome::Superseded)
        }
    }

    /// Sends `msg` to every live link. A failed write tears that link down
    /// and delivery continues with the rest. Returns the number of links
    /// written to.
    pub async fn broadcast(&self, msg: &Message) -> SyncResult<usize> {
        let frame = encode_frame(msg)?;
        let targets: Vec<(PeerAddress, u64, Arc<AsyncMutex<OwnedWriteHalf>>)> = self
            .inner
            .table()
            .links
            .iter()
            .map(|(addr, link)| (addr.clone(), link.id, Arc::clone(&link.writer)))
            .collect();

        let mut delivered = 0;
        for (addr, id, writer) in targets {
            match write_link(&writer, &frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "Write failed, dropping link");
                    if self.inner.remove_link(&addr, id) {
                        self.inner.store.on_peer_disconnected(&addr);
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Sends `msg` on the link to `addr` only. Returns false when there is
    /// no such link.
    pub async fn send_to(&self, addr: &PeerAddress, msg: &Message) -> SyncResult<bool> {
        let frame = encode_frame(msg)?;
        self.inner.send_frame(addr, &frame).await
    }

    /// Closes the link to `addr`, if any. Entities it carried are kept.
    pub fn close(&self, addr: &PeerAddress) -> bool {
        let removed = self.inner.table().links.remove(addr);
        match removed {
            Some(link) => {
                link.reader.abort();
                info!(peer = %addr, "Closed link");
                true
            }
            None => false,
        }
    }

    /// Stops accepting and closes every link.
    pub fn shutdown(&self) {
        if let Some(acceptor) = self
            .inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            acceptor.abort();
        }
        let links: Vec<Link> = self.inner.table().links.drain().map(|(_, l)| l).collect();
        for link in &links {
            link.reader.abort();
        }
        info!(closed = links.len(), "Connection manager shut down");
    }

    /// Remote addresses with a live link, sorted.
    pub fn peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self.inner.table().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected(&self, addr: &PeerAddress) -> bool {
        self.inner.table().links.contains_key(addr)
    }

    pub fn direction(&self, addr: &PeerAddress) -> Option<Direction> {
        self.inner.table().links.get(addr).map(|l| l.direction)
    }

    pub fn len(&self) -> usize {
        self.inner.table().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles one accepted socket: identify the remote, then install the link.
async fn accept_link(inner: Arc<Inner>, stream: TcpStream, from: SocketAddr) {
    let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
        warn!(%from, "Link limit reached, refusing inbound connection");
        return;
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%from, error = %e, "set_nodelay failed");
    }
    let mut conn = ReliableConn::new(stream);

    let (remote, pending) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv_frame()).await
    {
        Ok(Ok(Some(frame))) => match decode_message(&frame) {
            Ok(Message::Hello { addr }) => (addr, None),
            _ => (PeerAddress::from(from), Some(frame)),
        },
        Ok(Ok(None)) => {
            debug!(%from, "Inbound connection closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            debug!(%from, error = %e, "Inbound handshake failed");
            return;
        }
        Err(_) => (PeerAddress::from(from), None),
    };

    if !install(&inner, remote.clone(), conn, permit, Direction::Inbound, pending) {
        return;
    }
    info!(peer = %remote, %from, "Accepted peer");

    if let Some(greeting) = inner.greeting() {
        let sent = match encode_frame(&greeting) {
            Ok(frame) => inner.send_frame(&remote, &frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(peer = %remote, error = %e, "Greeting not delivered");
        }
    }
}

async fn write_link(writer: &AsyncMutex<OwnedWriteHalf>, frame: &[u8]) -> SyncResult<()> {
    let mut writer = writer.lock().await;
    match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut *writer, frame)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

/// Inserts a link and spawns its read loop. Returns false when an existing
/// link to the same address is kept instead; the new socket is then closed
/// by dropping it.
fn install(
    inner: &Arc<Inner>,
    addr: PeerAddress,
    conn: ReliableConn,
    permit: OwnedSemaphorePermit,
    direction: Direction,
    pending: Option<Vec<u8>>,
) -> bool {
    let (reader, writer) = conn.into_split();
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);

    let mut table = inner.table();
    if let Some(existing) = table.links.get(&addr) {
        let replace = inner.preferred(&addr, direction) && !inner.preferred(&addr, existing.direction);
        if !replace {
            debug!(peer = %addr, ?direction, "Duplicate link closed");
            return false;
        }
        if let Some(old) = table.links.remove(&addr) {
            debug!(peer = %addr, ?direction, "Replacing link dialed by the larger address");
            old.reader.abort();
        }
    }

    let task = tokio::spawn(read_loop(
        Arc::clone(inner),
        addr.clone(),
        id,
        reader,
        permit,
        pending,
    ));
    table.links.insert(
        addr,
        Link {
            id,
            direction,
            writer: Arc::new(AsyncMutex::new(writer)),
            reader: task.abort_handle(),
        },
    );
    true
}

async fn read_loop(
    inner: Arc<Inner>,
    addr: PeerAddress,
    id: u64,
    mut reader: FrameReader<OwnedReadHalf>,
    _permit: OwnedSemaphorePermit,
    pending: Option<Vec<u8>>,
) {
    if let Some(frame) = pending {
        handle_frame(&inner.store, &addr, &frame);
    }

    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => handle_frame(&inner.store, &addr, &frame),
            Ok(None) => {
                info!(peer = %addr, "Peer disconnected");
                break;
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "Link read failed");
                break;
            }
        }
    }

    if inner.remove_link(&addr, id) {
        inner.store.on_peer_disconnected(&addr);
    }
}

fn handle_frame(store: &StateStore, origin: &PeerAddress, frame: &[u8]) {
    match decode_message(frame) {
        Ok(msg) => {
            dispatch_peer_message(store, origin, msg);
        }
        Err(e) => warn!(peer = %origin, error = %e, "Dropping malformed message"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    async fn raw_listener() -> (TcpListener, PeerAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddress::from(listener.local_addr().unwrap());
        (listener, addr)
    }

    fn manager(self_addr: &str) -> ConnectionManager {
        ConnectionManager::new(
            PeerAddress::from(self_addr),
            StateStore::new(Duration::from_secs(60)),
            LinkOptions::default(),
        )
    }

    #[tokio::test]
    async fn connect_sends_hello_and_records_the_link() {
        let (listener, addr) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");

        assert_eq!(mgr.connect(&addr).await.unwrap(), ConnectOutcome::Connected);
        assert!(mgr.is_connected(&addr));
        assert_eq!(mgr.direction(&addr), Some(Direction::Outbound));

        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = ReliableConn::new(stream);
        let hello: Message = remote.recv().await.unwrap().unwrap();
        assert_eq!(
            hello,
            Message::Hello {
                addr: "127.0.0.1:1".into()
            }
        );

        assert_eq!(
            mgr.connect(&addr).await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn concurrent_connects_leave_one_link() {
        let (_listener, addr) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");

        let (a, b) = tokio::join!(mgr.connect(&addr), mgr.connect(&addr));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&ConnectOutcome::Connected));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn dial_failure_is_reported_and_not_recorded() {
        let (listener, addr) = raw_listener().await;
        drop(listener);
        let mgr = manager("127.0.0.1:1");

        let err = mgr.connect(&addr).await.unwrap_err();
        assert!(matches!(err, SyncError::Connect { .. }));
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn never_dials_itself() {
        let mgr = manager("127.0.0.1:1");
        let me = mgr.self_addr().clone();
        assert_eq!(mgr.connect(&me).await.unwrap(), ConnectOutcome::SelfAddress);
    }

    #[tokio::test]
    async fn read_error_removes_link_and_reconnect_restores_it() {
        let (listener, addr) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");

        mgr.connect(&addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        assert!(wait_until(|| !mgr.is_connected(&addr)).await);

        assert_eq!(mgr.connect(&addr).await.unwrap(), ConnectOutcome::Connected);
        assert!(mgr.is_connected(&addr));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_link() {
        let (l1, a1) = raw_listener().await;
        let (l2, a2) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");
        mgr.connect(&a1).await.unwrap();
        mgr.connect(&a2).await.unwrap();

        let mv = Message::Move {
            id: "me".into(),
            x: 1.0,
            y: 2.0,
            angle: 0.0,
        };
        assert_eq!(mgr.broadcast(&mv).await.unwrap(), 2);

        for listener in [l1, l2] {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ReliableConn::new(stream);
            let _hello: Message = conn.recv().await.unwrap().unwrap();
            let got: Message = conn.recv().await.unwrap().unwrap();
            assert_eq!(got, mv);
        }
    }

    #[tokio::test]
    async fn inbound_without_hello_is_keyed_by_socket_address() {
        let mgr = manager("127.0.0.1:1");
        let local = mgr.listen("127.0.0.1:0").await.unwrap();

        let stream = TcpStream::connect(local).await.unwrap();
        let from = PeerAddress::from(stream.local_addr().unwrap());
        let mut conn = ReliableConn::new(stream);
        conn.send(&Message::Move {
            id: "legacy".into(),
            x: 5.0,
            y: 5.0,
            angle: 0.0,
        })
        .await
        .unwrap();

        assert!(wait_until(|| mgr.is_connected(&from)).await);
        assert!(wait_until(|| mgr.inner.store.entity("legacy").is_some()).await);

        drop(conn);
        assert!(wait_until(|| !mgr.is_connected(&from)).await);
        assert!(mgr.inner.store.entity("legacy").unwrap().eliminated);
    }

    #[tokio::test]
    async fn duplicate_inbound_is_closed() {
        let mgr = manager("127.0.0.1:1");
        let local = mgr.listen("127.0.0.1:0").await.unwrap();
        let announced = PeerAddress::from("127.0.0.1:2");

        let mut first = ReliableConn::new(TcpStream::connect(local).await.unwrap());
        first
            .send(&Message::Hello {
                addr: announced.clone(),
            })
            .await
            .unwrap();
        assert!(wait_until(|| mgr.is_connected(&announced)).await);

        let mut second = ReliableConn::new(TcpStream::connect(local).await.unwrap());
        second
            .send(&Message::Hello {
                addr: announced.clone(),
            })
            .await
            .unwrap();

        // The duplicate is dropped by the acceptor: its read sees EOF.
        let closed = tokio::time::timeout(Duration::from_secs(2), second.recv_frame())
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_link_open() {
        let mgr = manager("127.0.0.1:1");
        let local = mgr.listen("127.0.0.1:0").await.unwrap();
        let announced = PeerAddress::from("127.0.0.1:2");

        let stream = TcpStream::connect(local).await.unwrap();
        let (_read, mut write) = stream.into_split();
        let hello = encode_frame(&Message::Hello {
            addr: announced.clone(),
        })
        .unwrap();
        write_frame(&mut write, &hello).await.unwrap();

        let mut garbage = (9u32).to_be_bytes().to_vec();
        garbage.extend_from_slice(b"not json!");
        write_frame(&mut write, &garbage).await.unwrap();

        let mv = encode_frame(&Message::Move {
            id: "p2".into(),
            x: 1.0,
            y: 1.0,
            angle: 0.0,
        })
        .unwrap();
        write_frame(&mut write, &mv).await.unwrap();

        assert!(wait_until(|| mgr.inner.store.entity("p2").is_some()).await);
        assert!(mgr.is_connected(&announced));
    }

    #[tokio::test]
    async fn accepted_link_is_greeted_first() {
        let mgr = manager("127.0.0.1:1");
        mgr.set_greeting(|| {
            Some(Message::Move {
                id: "host".into(),
                x: 7.0,
                y: 8.0,
                angle: 0.0,
            })
        });
        let local = mgr.listen("127.0.0.1:0").await.unwrap();

        let mut conn = ReliableConn::new(TcpStream::connect(local).await.unwrap());
        conn.send(&Message::Hello {
            addr: "127.0.0.1:2".into(),
        })
        .await
        .unwrap();
        let greeting: Message = tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(greeting, Message::Move { ref id, .. } if id == "host"));
    }

    #[tokio::test]
    async fn failed_write_drops_only_that_link() {
        let (l1, broken) = raw_listener().await;
        let (l2, healthy) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");
        mgr.connect(&broken).await.unwrap();
        mgr.connect(&healthy).await.unwrap();
        let (_s1, _) = l1.accept().await.unwrap();
        let (s2, _) = l2.accept().await.unwrap();
        mgr.inner.store.upsert_remote(&broken, "gone", 0.0, 0.0, 0.0);

        // Shut our side for writing; the next write on it fails.
        let writer = Arc::clone(&mgr.inner.table().links[&broken].writer);
        writer.lock().await.shutdown().await.unwrap();

        let mv = Message::Eliminate { id: "x".into() };
        assert_eq!(mgr.broadcast(&mv).await.unwrap(), 1);
        assert!(!mgr.is_connected(&broken));
        assert!(mgr.is_connected(&healthy));
        assert!(mgr.inner.store.entity("gone").unwrap().eliminated);

        let mut conn = ReliableConn::new(s2);
        let _hello: Message = conn.recv().await.unwrap().unwrap();
        let got: Message = conn.recv().await.unwrap().unwrap();
        assert_eq!(got, mv);
    }

    #[tokio::test]
    async fn link_limit_applies_to_accepts_and_dials() {
        let mgr = ConnectionManager::new(
            "127.0.0.1:1".into(),
            StateStore::default(),
            LinkOptions {
                max_connections: 1,
                ..LinkOptions::default()
            },
        );
        let local = mgr.listen("127.0.0.1:0").await.unwrap();

        let mut first = ReliableConn::new(TcpStream::connect(local).await.unwrap());
        first
            .send(&Message::Hello {
                addr: "127.0.0.1:2".into(),
            })
            .await
            .unwrap();
        assert!(wait_until(|| mgr.len() == 1).await);

        let mut second = ReliableConn::new(TcpStream::connect(local).await.unwrap());
        let closed = tokio::time::timeout(Duration::from_secs(2), second.recv_frame())
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));

        let (_listener, other) = raw_listener().await;
        assert_eq!(mgr.connect(&other).await.unwrap(), ConnectOutcome::AtCapacity);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn listening_on_a_taken_port_is_a_bind_error() {
        let (_taken, addr) = raw_listener().await;
        let mgr = manager("127.0.0.1:1");
        let err = mgr.listen(addr.as_str()).await.unwrap_err();
        assert!(matches!(err, SyncError::Bind { .. }));
    }

    #[test]
    fn smaller_address_dial_is_preferred() {
        let store = StateStore::default();
        let small = ConnectionManager::new("10.0.0.1:9001".into(), store.clone(), LinkOptions::default());
        let large = ConnectionManager::new("10.0.0.2:9001".into(), store, LinkOptions::default());
        let small_addr = small.self_addr().clone();
        let large_addr = large.self_addr().clone();

        assert!(small.inner.preferred(&large_addr, Direction::Outbound));
        assert!(!small.inner.preferred(&large_addr, Direction::Inbound));
        assert!(large.inner.preferred(&small_addr, Direction::Inbound));
        assert!(!large.inner.preferred(&small_addr, Direction::Outbound));
    }
}
