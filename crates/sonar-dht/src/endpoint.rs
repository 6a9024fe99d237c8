//! Signed-datagram endpoint
//!
//! The endpoint owns the transport. It signs and sends outbound packets,
//! runs the single receive loop, and correlates replies with the requests
//! waiting for them. Replies are matched on the sender's recovered node
//! ID, the source address, and a per-request matcher (the ping hash for
//! pongs). Pings and find-node requests are handed to a [`PacketHandler`].
//!
//! Repeated requests are dropped by a replay cache of packet hashes. A
//! reply needs no such check: it is accepted only by a pending request,
//! and each request takes exactly one pong or one set of neighbors.

use crate::replay::ReplayCache;
use crate::{DhtConfig, DhtError, Result};
use sonar_core::wire::{
    self, Message, Neighbor, Packet, Pong, EXPIRATION_SECS, MAX_EXPIRATION_DRIFT_SECS,
    MAX_NEIGHBORS,
};
use sonar_core::{unix_time, Identity, NodeEndpoint, NodeId, Transport};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receive buffer size; anything above `MAX_PACKET_SIZE` is rejected by the codec
const RECV_BUFFER_SIZE: usize = 2048;

/// Replay cache entries per generation
const REPLAY_CAPACITY: usize = 65_536;

/// Handles inbound requests
pub trait PacketHandler: Send + Sync + 'static {
    /// Called for every verified, fresh ping or find-node packet
    fn handle_request(&self, packet: Packet, from: SocketAddr) -> impl Future<Output = ()> + Send;

    /// Called from the receive loop when a pong answers one of our pings
    ///
    /// Runs before any later packet from the same peer is handled.
    fn pong_received(&self, _sender: &NodeId) {}
}

/// A reply delivered to a waiting request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong(Pong),
    Neighbors(Vec<Neighbor>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Pong { ping_hash: [u8; 32] },
    Neighbors,
}

impl Expect {
    fn matches(&self, message: &Message) -> bool {
        match (self, message) {
            (Expect::Pong { ping_hash }, Message::Pong(pong)) => &pong.ping_hash == ping_hash,
            (Expect::Neighbors, Message::Neighbors(_)) => true,
            _ => false,
        }
    }
}

struct PendingQuery {
    node: NodeId,
    addr: SocketAddr,
    expect: Expect,
    deadline: Instant,
    /// Neighbor records received so far
    neighbors: Vec<Neighbor>,
    replied: bool,
    reply: oneshot::Sender<Reply>,
}

impl PendingQuery {
    /// A pong must come from the pinged socket; neighbors only from its host
    fn accepts_from(&self, from: SocketAddr) -> bool {
        match self.expect {
            Expect::Pong { .. } => from == self.addr,
            Expect::Neighbors => from.ip() == self.addr.ip(),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingQuery>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// An in-flight request
///
/// Dropping the handle withdraws the request.
pub struct RequestHandle {
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
    pending: PendingMap,
}

impl RequestHandle {
    /// Wait for the reply or the deadline
    ///
    /// A find-node request that timed out after receiving some neighbor
    /// packets yields what arrived.
    pub async fn wait(mut self) -> Result<Reply> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                let entry = lock(&self.pending).remove(&self.id);
                match entry {
                    Some(query) if query.replied => Ok(Reply::Neighbors(query.neighbors)),
                    Some(_) => Err(DhtError::Timeout),
                    // Resolved between the deadline and taking the lock
                    None => self.rx.try_recv().map_err(|_| DhtError::Timeout),
                }
            }
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// Discovery endpoint over a datagram transport
pub struct Endpoint<T> {
    transport: T,
    identity: Arc<Identity>,
    tcp_port: Option<u16>,
    pending: PendingMap,
    next_id: AtomicU64,
    replay: Mutex<ReplayCache>,
    /// Latest expiration stamped on a request to each address
    issued: Mutex<HashMap<SocketAddr, u64>>,
    k: usize,
    request_timeout: Duration,
    max_pending: usize,
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T, identity: Arc<Identity>, config: &DhtConfig) -> Self {
        Self {
            transport,
            identity,
            tcp_port: config.tcp_port,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            replay: Mutex::new(ReplayCache::new(
                Duration::from_secs(MAX_EXPIRATION_DRIFT_SECS),
                REPLAY_CAPACITY,
            )),
            issued: Mutex::new(HashMap::new()),
            k: config.k,
            request_timeout: config.request_timeout,
            max_pending: config.max_pending,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Our endpoint as advertised in pings
    pub fn local_endpoint(&self) -> NodeEndpoint {
        let addr = self.transport.local_addr();
        NodeEndpoint::from_udp(addr, self.tcp_port.unwrap_or(addr.port()))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Sign and send a message, returning the packet hash
    pub async fn send(&self, to: SocketAddr, message: &Message) -> Result<[u8; 32]> {
        let (bytes, hash) = wire::encode(message, &self.identity)?;
        self.transport.send_to(&bytes, to).await?;
        Ok(hash)
    }

    /// Send a ping or find-node and register for its reply
    ///
    /// The request is registered before the packet leaves, so a fast reply
    /// can never be missed.
    ///
    /// Signatures are deterministic, so two requests with equal fields
    /// would be the same packet and the second would be dropped as a
    /// replay. Requests to one address therefore never share an expiration.
    pub async fn request(&self, node: NodeId, to: SocketAddr, message: &Message) -> Result<RequestHandle> {
        let mut message = message.clone();
        message.set_expiration(self.unique_expiration(to, message.expiration()));

        let (bytes, hash) = wire::encode(&message, &self.identity)?;
        let expect = match message {
            Message::Ping(_) => Expect::Pong { ping_hash: hash },
            Message::FindNode(_) => Expect::Neighbors,
            _ => {
                return Err(DhtError::Core(sonar_core::Error::InvalidData(
                    "only pings and find-node requests expect a reply".to_string(),
                )))
            }
        };

        let handle = self.register(node, to, expect)?;
        self.transport.send_to(&bytes, to).await?;
        Ok(handle)
    }

    /// `requested`, or one second past the last expiration sent to `to`
    ///
    /// Never more than the accepted drift ahead of the clock.
    fn unique_expiration(&self, to: SocketAddr, requested: u64) -> u64 {
        let ceiling = unix_time() + MAX_EXPIRATION_DRIFT_SECS;
        let mut issued = lock(&self.issued);
        let expiration = match issued.get(&to) {
            Some(&last) if last >= requested => (last + 1).min(ceiling),
            _ => requested,
        };
        issued.insert(to, expiration);
        expiration
    }

    fn register(&self, node: NodeId, addr: SocketAddr, expect: Expect) -> Result<RequestHandle> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.request_timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut pending = lock(&self.pending);
        if pending.len() >= self.max_pending {
            return Err(DhtError::TooManyPending);
        }
        pending.insert(
            id,
            PendingQuery {
                node,
                addr,
                expect,
                deadline,
                neighbors: Vec::new(),
                replied: false,
                reply: tx,
            },
        );

        Ok(RequestHandle {
            id,
            deadline,
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Run the receive loop until `shutdown` is cancelled
    pub async fn run<H: PacketHandler>(self: Arc<Self>, handler: H, shutdown: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut sweep = tokio::time::interval(self.request_timeout.max(Duration::from_millis(100)));

        tracing::debug!(addr = %self.local_addr(), "receive loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                received = async {
                    let (len, from) = self.transport.recv_from(&mut buf).await?;
                    Ok::<_, sonar_core::Error>((buf[..len].to_vec(), from))
                } => match received {
                    Ok((data, from)) => self.handle_datagram(&data, from, &handler).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
        tracing::debug!("receive loop stopped");
    }

    async fn handle_datagram<H: PacketHandler>(&self, data: &[u8], from: SocketAddr, handler: &H) {
        let packet = match wire::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping invalid packet");
                return;
            }
        };

        if packet.sender_id == self.identity.node_id() {
            tracing::debug!(%from, "dropping packet from ourselves");
            return;
        }
        if let Err(e) = wire::check_expiration(packet.message.expiration(), unix_time()) {
            tracing::debug!(%from, node = %packet.sender_id.short(), error = %e, "dropping stale packet");
            return;
        }
        let is_request = matches!(packet.message, Message::Ping(_) | Message::FindNode(_));
        if is_request && !lock(&self.replay).check(&packet.hash) {
            tracing::debug!(%from, node = %packet.sender_id.short(), "dropping replayed packet");
            return;
        }

        tracing::trace!(%from, node = %packet.sender_id.short(), kind = ?packet.message.kind(), "received packet");
        match packet.message {
            Message::Pong(_) | Message::Neighbors(_) => {
                if !self.resolve(&packet, from) {
                    tracing::debug!(%from, node = %packet.sender_id.short(), kind = ?packet.message.kind(), "dropping unsolicited reply");
                } else if matches!(packet.message, Message::Pong(_)) {
                    handler.pong_received(&packet.sender_id);
                }
            }
            Message::Ping(_) | Message::FindNode(_) => handler.handle_request(packet, from).await,
        }
    }

    /// Hand a reply to its waiting request. Returns `false` if nothing matched.
    fn resolve(&self, packet: &Packet, from: SocketAddr) -> bool {
        let mut pending = lock(&self.pending);
        let found = pending
            .iter()
            .find(|(_, q)| {
                q.node == packet.sender_id && q.accepts_from(from) && q.expect.matches(&packet.message)
            })
            .map(|(id, _)| *id);
        let Some(id) = found else {
            return false;
        };

        match &packet.message {
            Message::Pong(pong) => {
                if let Some(query) = pending.remove(&id) {
                    let _ = query.reply.send(Reply::Pong(pong.clone()));
                }
            }
            Message::Neighbors(neighbors) => {
                // Replies are split into full packets; a short one is the last
                let complete = match pending.get_mut(&id) {
                    Some(query) => {
                        query.replied = true;
                        query.neighbors.extend(neighbors.nodes.iter().cloned());
                        query.neighbors.len() >= self.k || neighbors.nodes.len() < MAX_NEIGHBORS
                    }
                    None => false,
                };
                if complete {
                    if let Some(query) = pending.remove(&id) {
                        let _ = query.reply.send(Reply::Neighbors(query.neighbors));
                    }
                }
            }
            Message::Ping(_) | Message::FindNode(_) => {}
        }
        true
    }

    /// Drop requests whose handles never collected them, and age the replay cache
    fn sweep(&self) {
        let cutoff = Instant::now()
            .checked_sub(self.request_timeout)
            .unwrap_or_else(Instant::now);
        lock(&self.pending).retain(|_, q| q.deadline > cutoff);
        lock(&self.replay).rotate_if_due();

        // Older stamps are below anything a new request would ask for
        let floor = unix_time() + EXPIRATION_SECS;
        lock(&self.issued).retain(|_, &mut last| last >= floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_core::transport::mock::{MemoryNetwork, MemoryTransport};
    use sonar_core::wire::{expiration_from_now, FindNode, Neighbors, Ping};
    use sonar_core::PublicKey;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;

    /// Answers pings with pongs unless silenced, and counts requests
    #[derive(Clone)]
    struct Responder {
        endpoint: Arc<Endpoint<MemoryTransport>>,
        silent: bool,
        neighbor_chunks: Vec<Vec<Neighbor>>,
        requests: Arc<AtomicUsize>,
        last_hash: Arc<Mutex<Option<[u8; 32]>>>,
    }

    impl PacketHandler for Responder {
        async fn handle_request(&self, packet: Packet, from: SocketAddr) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last_hash) = Some(packet.hash);
            if self.silent {
                return;
            }
            match packet.message {
                Message::Ping(_) => {
                    let pong = Message::Pong(Pong {
                        to: NodeEndpoint::from_udp(from, from.port()),
                        ping_hash: packet.hash,
                        expiration: expiration_from_now(),
                        enr_seq: None,
                    });
                    self.endpoint.send(from, &pong).await.unwrap();
                }
                Message::FindNode(_) => {
                    for chunk in &self.neighbor_chunks {
                        let reply = Message::Neighbors(Neighbors {
                            nodes: chunk.clone(),
                            expiration: expiration_from_now(),
                        });
                        self.endpoint.send(from, &reply).await.unwrap();
                    }
                }
                _ => {}
            }
        }
    }

    struct Peer {
        endpoint: Arc<Endpoint<MemoryTransport>>,
        responder: Responder,
        shutdown: CancellationToken,
    }

    impl Peer {
        fn id(&self) -> NodeId {
            self.endpoint.identity().node_id()
        }
    }

    fn config(timeout_ms: u64) -> DhtConfig {
        DhtConfig {
            k: 4,
            request_timeout: Duration::from_millis(timeout_ms),
            ..DhtConfig::default()
        }
    }

    fn spawn_peer(
        network: &MemoryNetwork,
        config: &DhtConfig,
        silent: bool,
        neighbor_chunks: Vec<Vec<Neighbor>>,
    ) -> Peer {
        let identity = Arc::new(Identity::generate().unwrap());
        let endpoint = Arc::new(Endpoint::new(network.bind_next().unwrap(), identity, config));
        let responder = Responder {
            endpoint: Arc::clone(&endpoint),
            silent,
            neighbor_chunks,
            requests: Arc::new(AtomicUsize::new(0)),
            last_hash: Arc::new(Mutex::new(None)),
        };
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&endpoint).run(responder.clone(), shutdown.clone()));
        Peer {
            endpoint,
            responder,
            shutdown,
        }
    }

    fn ping(from: &Peer, to: &Peer) -> Message {
        Message::Ping(Ping {
            version: sonar_core::PROTOCOL_VERSION,
            from: from.endpoint.local_endpoint(),
            to: to.endpoint.local_endpoint(),
            expiration: expiration_from_now(),
            enr_seq: None,
        })
    }

    fn neighbor(n: u8) -> Neighbor {
        Neighbor {
            endpoint: NodeEndpoint::new(IpAddr::from([10, 0, 0, n]), 30303, 30303),
            public_key: PublicKey::new([n; 64]),
        }
    }

    #[tokio::test]
    async fn test_ping_resolved_by_pong() {
        let network = MemoryNetwork::new();
        let config = config(500);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, false, vec![]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        match handle.wait().await.unwrap() {
            Reply::Pong(pong) => assert_eq!(pong.to.udp_port, a.endpoint.local_addr().port()),
            other => panic!("expected pong, got {:?}", other),
        }
        assert_eq!(a.endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending() {
        let network = MemoryNetwork::new();
        let config = config(50);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        assert_eq!(a.endpoint.pending_count(), 1);
        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));
        assert_eq!(a.endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_ignored() {
        let network = MemoryNetwork::new();
        let config = config(50);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));

        // b answers only now
        let ping_hash = (*lock(&b.responder.last_hash)).unwrap();
        let late = Message::Pong(Pong {
            to: a.endpoint.local_endpoint(),
            ping_hash,
            expiration: expiration_from_now(),
            enr_seq: None,
        });
        b.endpoint.send(a.endpoint.local_addr(), &late).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.endpoint.pending_count(), 0);

        // A fresh request is unaffected by the stale pong
        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn test_reply_from_wrong_node_is_ignored() {
        let network = MemoryNetwork::new();
        let config = config(100);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);
        let c = spawn_peer(&network, &config, true, vec![]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // c forges a pong for the ping b received
        let ping_hash = (*lock(&b.responder.last_hash)).unwrap();
        let forged = Message::Pong(Pong {
            to: a.endpoint.local_endpoint(),
            ping_hash,
            expiration: expiration_from_now(),
            enr_seq: None,
        });
        c.endpoint.send(a.endpoint.local_addr(), &forged).await.unwrap();

        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn test_pong_from_other_port_is_ignored() {
        let network = MemoryNetwork::new();
        let config = config(100);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Signed by b, but sent from another socket on the same host
        let ping_hash = (*lock(&b.responder.last_hash)).unwrap();
        let pong = Message::Pong(Pong {
            to: a.endpoint.local_endpoint(),
            ping_hash,
            expiration: expiration_from_now(),
            enr_seq: None,
        });
        let (bytes, _) = wire::encode(&pong, b.endpoint.identity()).unwrap();
        let other = network.bind_next().unwrap();
        assert_eq!(other.local_addr().ip(), b.endpoint.local_addr().ip());
        other.send_to(&bytes, a.endpoint.local_addr()).await.unwrap();

        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn test_identical_requests_are_all_answered() {
        let network = MemoryNetwork::new();
        let config = config(500);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, false, vec![]);

        // Same fields within one second; each must still be a distinct packet
        let message = ping(&a, &b);
        for _ in 0..3 {
            let handle = a
                .endpoint
                .request(b.id(), b.endpoint.local_addr(), &message)
                .await
                .unwrap();
            assert!(matches!(handle.wait().await, Ok(Reply::Pong(_))));
        }
        assert_eq!(b.responder.requests.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_expirations_stay_within_drift() {
        let network = MemoryNetwork::new();
        let config = config(100);
        let endpoint = Endpoint::new(
            network.bind_next().unwrap(),
            Arc::new(Identity::generate().unwrap()),
            &config,
        );
        let to: SocketAddr = "127.0.0.1:30303".parse().unwrap();
        let requested = expiration_from_now();

        let first = endpoint.unique_expiration(to, requested);
        let second = endpoint.unique_expiration(to, requested);
        assert_eq!(first, requested);
        assert_eq!(second, requested + 1);

        let other: SocketAddr = "127.0.0.1:30304".parse().unwrap();
        assert_eq!(endpoint.unique_expiration(other, requested), requested);

        for _ in 0..200 {
            let expiration = endpoint.unique_expiration(to, requested);
            assert!(wire::check_expiration(expiration, unix_time()).is_ok());
        }
    }

    fn find_node() -> Message {
        Message::FindNode(FindNode {
            target: PublicKey::new([7u8; 64]),
            expiration: expiration_from_now(),
        })
    }

    #[tokio::test]
    async fn test_neighbors_accumulate_across_packets() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            k: 16,
            ..config(300)
        };
        let a = spawn_peer(&network, &config, false, vec![]);
        let chunks = vec![(0..12).map(neighbor).collect(), (12..16).map(neighbor).collect()];
        let b = spawn_peer(&network, &config, false, chunks);

        let started = Instant::now();
        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &find_node())
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            Reply::Neighbors(nodes) => assert_eq!(nodes.len(), 16),
            other => panic!("expected neighbors, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_empty_neighbors_completes_request() {
        let network = MemoryNetwork::new();
        let config = config(300);
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, false, vec![vec![]]);

        let started = Instant::now();
        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &find_node())
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), Reply::Neighbors(vec![]));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_partial_neighbors_returned_at_deadline() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            k: 16,
            ..config(100)
        };
        let a = spawn_peer(&network, &config, false, vec![]);
        // One full packet, then nothing
        let b = spawn_peer(&network, &config, false, vec![(0..12).map(neighbor).collect()]);

        let handle = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &find_node())
            .await
            .unwrap();

        match handle.wait().await.unwrap() {
            Reply::Neighbors(nodes) => assert_eq!(nodes.len(), 12),
            other => panic!("expected neighbors, got {:?}", other),
        }
        assert_eq!(a.endpoint.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            max_pending: 1,
            ..config(500)
        };
        let a = spawn_peer(&network, &config, false, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        let _first = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await
            .unwrap();
        let second = a
            .endpoint
            .request(b.id(), b.endpoint.local_addr(), &ping(&a, &b))
            .await;
        assert!(matches!(second, Err(DhtError::TooManyPending)));
    }

    #[tokio::test]
    async fn test_replayed_packet_dropped() {
        let network = MemoryNetwork::new();
        let config = config(500);
        let a = spawn_peer(&network, &config, true, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        let (bytes, _) = wire::encode(&ping(&b, &a), b.endpoint.identity()).unwrap();
        let raw = network.bind_next().unwrap();
        raw.send_to(&bytes, a.endpoint.local_addr()).await.unwrap();
        raw.send_to(&bytes, a.endpoint.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.responder.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_receive_loop() {
        let network = MemoryNetwork::new();
        let config = config(500);
        let a = spawn_peer(&network, &config, true, vec![]);
        let b = spawn_peer(&network, &config, true, vec![]);

        a.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.endpoint
            .send(a.endpoint.local_addr(), &ping(&b, &a))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(a.responder.requests.load(Ordering::SeqCst), 0);
    }
}
