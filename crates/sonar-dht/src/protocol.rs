//! Discovery protocol engine
//!
//! Interprets pings and find-node requests, tracks endpoint proofs (bonds),
//! and decides what enters and leaves the routing table. Every interaction
//! with a peer goes Idle → Pinged → Confirmed or TimedOut; only a
//! confirmed pong admits or refreshes a record.
//!
//! Bonding follows the usual discovery v4 rules. A peer that pinged us and
//! got our pong may send us find-node requests; we serve find-node only to
//! peers whose pong we have seen recently. Before asking an unbonded peer
//! for neighbors, we ping it and give it a moment to ping us back.

use crate::endpoint::{Endpoint, PacketHandler, Reply};
use crate::routing::{Observation, RoutingTable};
use crate::{DhtConfig, DhtError, DiscoveryEvent, Result};
use lru::LruCache;
use sonar_core::wire::{
    expiration_from_now, FindNode, Message, Neighbor, Neighbors, Packet, Ping, Pong, MAX_NEIGHBORS,
};
use sonar_core::{unix_time, NodeEndpoint, NodeId, NodeRecord, PublicKey, Transport, PROTOCOL_VERSION};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the discovery event channel
const EVENT_CAPACITY: usize = 256;

/// Endpoint-proof state for one peer
#[derive(Debug, Clone, Copy, Default)]
struct Bond {
    /// Last pong received from the peer: it is reachable at its address
    last_pong: Option<Instant>,
    /// Last ping received from the peer: it has our pong, so it will serve us
    last_ping_received: Option<Instant>,
    /// Consecutive failed find-node requests
    find_failures: u32,
}

impl Bond {
    fn is_proven(&self, now: Instant, expiration: Duration) -> bool {
        self.last_pong
            .is_some_and(|t| now.saturating_duration_since(t) < expiration)
    }

    fn has_pinged_us(&self, now: Instant, expiration: Duration) -> bool {
        self.last_ping_received
            .is_some_and(|t| now.saturating_duration_since(t) < expiration)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner<T> {
    config: DhtConfig,
    local: NodeRecord,
    endpoint: Arc<Endpoint<T>>,
    table: RwLock<RoutingTable>,
    bonds: Mutex<LruCache<NodeId, Bond>>,
    /// Bounds background verification pings
    verifier: Arc<Semaphore>,
    /// Peers with a background ping in flight
    pinging: Mutex<HashSet<NodeId>>,
    events: broadcast::Sender<DiscoveryEvent>,
    ping_received: Notify,
    closing: CancellationToken,
    tasks: TaskTracker,
}

/// The discovery protocol engine
///
/// Cheap to clone; all clones share the same state.
pub struct Engine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Engine<T> {
    pub fn new(endpoint: Arc<Endpoint<T>>, config: DhtConfig) -> Self {
        let local = endpoint
            .identity()
            .record(endpoint.local_endpoint());
        let table = RoutingTable::new(local.clone(), config.k);
        let bonds = NonZeroUsize::new(config.max_bonds).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                verifier: Arc::new(Semaphore::new(config.max_verifications)),
                config,
                local,
                endpoint,
                table: RwLock::new(table),
                bonds: Mutex::new(LruCache::new(bonds)),
                pinging: Mutex::new(HashSet::new()),
                events,
                ping_received: Notify::new(),
                closing: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn local_record(&self) -> &NodeRecord {
        &self.inner.local
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint<T>> {
        &self.inner.endpoint
    }

    /// Cancelled when shutdown begins
    pub fn closing(&self) -> &CancellationToken {
        &self.inner.closing
    }

    /// Background pings spawned by the engine
    pub fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Copy of every record in the table
    pub async fn table_snapshot(&self) -> Vec<NodeRecord> {
        self.inner.table.read().await.records().cloned().collect()
    }

    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeRecord> {
        self.inner.table.read().await.closest(target, count)
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.inner.table.read().await.contains(id)
    }

    /// Records in one bucket, least recently seen first
    pub async fn bucket_entries(&self, index: usize) -> Vec<NodeRecord> {
        self.inner.table.read().await.bucket_nodes(index).cloned().collect()
    }

    pub async fn table_len(&self) -> usize {
        self.inner.table.read().await.len()
    }

    pub(crate) async fn with_table<R>(&self, f: impl FnOnce(&mut RoutingTable) -> R) -> R {
        f(&mut *self.inner.table.write().await)
    }

    /// Ping a peer and wait for its pong
    ///
    /// A pong admits or refreshes the record. A timeout or network error
    /// counts against the peer and evicts it at `max_fail_count`.
    pub async fn ping(&self, record: &NodeRecord) -> Result<Pong> {
        let endpoint = &self.inner.endpoint;
        let message = Message::Ping(Ping {
            version: PROTOCOL_VERSION,
            from: endpoint.local_endpoint(),
            to: record.endpoint,
            expiration: expiration_from_now(),
            enr_seq: None,
        });
        self.inner
            .table
            .write()
            .await
            .mark_pinged(&record.id, unix_time());

        let result = match endpoint.request(record.id, record.udp_addr(), &message).await {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Reply::Pong(pong)) => {
                self.on_pong(record, &pong).await;
                Ok(pong)
            }
            Ok(Reply::Neighbors(_)) => Err(DhtError::Core(sonar_core::Error::InvalidData(
                "neighbors in reply to ping".to_string(),
            ))),
            Err(e) => {
                if e.is_peer_failure() {
                    self.on_ping_failure(record, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn on_pong(&self, record: &NodeRecord, pong: &Pong) {
        let mut confirmed = record.clone();
        confirmed.last_seen = unix_time();
        confirmed.fail_count = 0;
        if let Some(seq) = pong.enr_seq {
            confirmed.seq = seq;
        }
        self.admit(confirmed).await;
    }

    async fn on_ping_failure(&self, record: &NodeRecord, error: &DhtError) {
        let fails = self.inner.table.write().await.record_failure(&record.id);
        tracing::debug!(
            node = %record.id.short(),
            addr = %record.udp_addr(),
            error = %error,
            fails = fails.unwrap_or(0),
            "ping failed"
        );
        if fails.is_some_and(|n| n >= self.inner.config.max_fail_count) {
            self.evict(&record.id).await;
        }
    }

    /// Offer a record that has just answered a ping to the table
    async fn admit(&self, record: NodeRecord) {
        if record.id == self.local_id() {
            return;
        }

        let observation = self.inner.table.write().await.observe(record.clone());
        match observation {
            Observation::Inserted => {
                tracing::debug!(node = %record.id.short(), addr = %record.udp_addr(), "admitted peer");
                let _ = self.inner.events.send(DiscoveryEvent::PeerAdded(record));
            }
            Observation::Refreshed => {
                tracing::trace!(node = %record.id.short(), "refreshed peer");
            }
            Observation::BucketFull { least_recent } => {
                tracing::debug!(
                    node = %record.id.short(),
                    challenged = %least_recent.id.short(),
                    "bucket full, challenging least recently seen peer"
                );
                self.spawn_challenge(least_recent);
            }
            Observation::Ignored => {}
        }
    }

    /// Remove a peer from the table, reporting any promoted replacement
    pub async fn evict(&self, id: &NodeId) {
        let removal = self.inner.table.write().await.remove(id);
        let Some(removal) = removal else {
            return;
        };

        tracing::debug!(node = %id.short(), addr = %removal.removed.udp_addr(), "removed peer");
        let _ = self.inner.events.send(DiscoveryEvent::PeerRemoved(*id));
        if let Some(promoted) = removal.promoted {
            tracing::debug!(node = %promoted.id.short(), addr = %promoted.udp_addr(), "promoted replacement");
            let _ = self.inner.events.send(DiscoveryEvent::PeerAdded(promoted));
        }
    }

    /// Claim a background ping slot for a peer; `false` if one is running
    fn begin_background_ping(&self, id: NodeId) -> bool {
        !self.inner.closing.is_cancelled() && lock(&self.inner.pinging).insert(id)
    }

    fn end_background_ping(&self, id: &NodeId) {
        lock(&self.inner.pinging).remove(id);
    }

    /// Ping the least recently seen entry of a full bucket; evict it on failure
    fn spawn_challenge(&self, record: NodeRecord) {
        if !self.begin_background_ping(record.id) {
            return;
        }
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            match engine.ping(&record).await {
                Ok(_) => tracing::debug!(node = %record.id.short(), "challenged peer is alive"),
                Err(e) if e.is_peer_failure() => engine.evict(&record.id).await,
                Err(_) => {}
            }
            engine.end_background_ping(&record.id);
        });
    }

    /// Ping an unverified record in the background; a pong admits it
    ///
    /// Skipped when the verification pool is saturated.
    pub(crate) fn spawn_verify(&self, record: NodeRecord) {
        if !self.begin_background_ping(record.id) {
            return;
        }
        let permit = match Arc::clone(&self.inner.verifier).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::trace!(node = %record.id.short(), "verification pool saturated");
                self.end_background_ping(&record.id);
                return;
            }
        };

        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            let _permit = permit;
            let _ = engine.ping(&record).await;
            engine.end_background_ping(&record.id);
        });
    }

    /// Ask a peer for its closest records to `target`
    ///
    /// The returned records are unverified. They are queued for a ping and
    /// enter the table only once it succeeds.
    pub async fn find_node(&self, record: &NodeRecord, target: &PublicKey) -> Result<Vec<NodeRecord>> {
        self.ensure_bond(record).await?;

        let message = Message::FindNode(FindNode {
            target: *target,
            expiration: expiration_from_now(),
        });
        let result = match self
            .inner
            .endpoint
            .request(record.id, record.udp_addr(), &message)
            .await
        {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        };

        let nodes = match result {
            Ok(Reply::Neighbors(nodes)) => {
                if let Some(bond) = lock(&self.inner.bonds).get_mut(&record.id) {
                    bond.find_failures = 0;
                }
                nodes
            }
            Ok(Reply::Pong(_)) => {
                return Err(DhtError::Core(sonar_core::Error::InvalidData(
                    "pong in reply to find-node".to_string(),
                )))
            }
            Err(e) => {
                if e.is_peer_failure() {
                    self.on_find_failure(record, &e).await;
                }
                return Err(e);
            }
        };

        let records = self.unverified_records(record, nodes);
        for candidate in &records {
            if !self.contains(&candidate.id).await {
                self.spawn_verify(candidate.clone());
            }
        }
        Ok(records)
    }

    async fn on_find_failure(&self, record: &NodeRecord, error: &DhtError) {
        let failures = {
            let mut bonds = lock(&self.inner.bonds);
            match bonds.get_mut(&record.id) {
                Some(bond) => {
                    bond.find_failures = bond.find_failures.saturating_add(1);
                    bond.find_failures
                }
                None => 0,
            }
        };
        tracing::debug!(node = %record.id.short(), error = %error, failures, "find-node failed");
        if failures >= self.inner.config.max_fail_count {
            self.evict(&record.id).await;
        }
    }

    /// Turn neighbor entries into records, dropping unusable ones
    fn unverified_records(&self, source: &NodeRecord, nodes: Vec<Neighbor>) -> Vec<NodeRecord> {
        let local = self.local_id();
        let source_is_loopback = source.endpoint.ip.is_loopback();
        let mut seen = HashSet::new();

        nodes
            .into_iter()
            .filter(|n| n.endpoint.is_routable())
            // A remote peer cannot tell us about our own loopback neighbors
            .filter(|n| source_is_loopback || !n.endpoint.ip.is_loopback())
            .map(|n| NodeRecord::new(n.public_key, n.endpoint))
            .filter(|r| r.id != local && seen.insert(r.id))
            .take(self.inner.config.k)
            .collect()
    }

    /// Make sure the peer will answer our find-node requests
    async fn ensure_bond(&self, record: &NodeRecord) -> Result<()> {
        let now = Instant::now();
        let expiration = self.inner.config.bond_expiration;
        let bonded = lock(&self.inner.bonds)
            .peek(&record.id)
            .is_some_and(|b| b.has_pinged_us(now, expiration) && b.find_failures == 0);
        if bonded {
            return Ok(());
        }

        self.ping(record).await?;
        // The peer pings back before it trusts us; wait for that
        if !self.wait_for_ping(&record.id).await {
            tracing::trace!(node = %record.id.short(), "no ping-back before deadline");
        }
        Ok(())
    }

    /// Wait up to one request timeout for a ping from `id`
    async fn wait_for_ping(&self, id: &NodeId) -> bool {
        let deadline = Instant::now() + self.inner.config.request_timeout;
        let expiration = self.inner.config.bond_expiration;
        loop {
            let notified = self.inner.ping_received.notified();
            let pinged = lock(&self.inner.bonds)
                .peek(id)
                .is_some_and(|b| b.has_pinged_us(Instant::now(), expiration));
            if pinged {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn on_ping(&self, packet: &Packet, ping: &Ping, from: SocketAddr) {
        let endpoint = NodeEndpoint::from_udp(from, ping.from.tcp_port);
        let pong = Message::Pong(Pong {
            to: endpoint,
            ping_hash: packet.hash,
            expiration: expiration_from_now(),
            enr_seq: None,
        });
        if let Err(e) = self.inner.endpoint.send(from, &pong).await {
            tracing::debug!(%from, error = %e, "failed to send pong");
            return;
        }

        let now = Instant::now();
        let proven = {
            let mut bonds = lock(&self.inner.bonds);
            match bonds.get_mut(&packet.sender_id) {
                Some(bond) => bond.last_ping_received = Some(now),
                None => {
                    bonds.put(
                        packet.sender_id,
                        Bond {
                            last_ping_received: Some(now),
                            ..Bond::default()
                        },
                    );
                }
            }
            bonds
                .peek(&packet.sender_id)
                .is_some_and(|b| b.is_proven(now, self.inner.config.bond_expiration))
        };
        self.inner.ping_received.notify_waiters();

        let mut record = NodeRecord::new(packet.sender, endpoint);
        record.seq = ping.enr_seq.unwrap_or(0);

        // A known, proven peer at its known address is refreshed directly;
        // anything else has to answer a ping of its own first
        let known_addr = self
            .inner
            .table
            .read()
            .await
            .get(&packet.sender_id)
            .map(|r| r.udp_addr());
        if proven && known_addr == Some(from) {
            record.last_seen = unix_time();
            self.admit(record).await;
        } else {
            self.spawn_verify(record);
        }
    }

    async fn on_find_node(&self, packet: &Packet, find: &FindNode, from: SocketAddr) {
        let now = Instant::now();
        let proven = lock(&self.inner.bonds)
            .peek(&packet.sender_id)
            .is_some_and(|b| b.is_proven(now, self.inner.config.bond_expiration));
        if !proven {
            tracing::debug!(%from, node = %packet.sender_id.short(), "ignoring find-node from unbonded peer");
            return;
        }

        let target = find.target.id();
        let requester_is_loopback = from.ip().is_loopback();
        let nodes: Vec<Neighbor> = self
            .closest(&target, self.inner.config.k)
            .await
            .into_iter()
            .filter(|r| requester_is_loopback || !r.endpoint.ip.is_loopback())
            .map(|r| Neighbor {
                endpoint: r.endpoint,
                public_key: r.public_key,
            })
            .collect();

        let mut chunks: Vec<&[Neighbor]> = nodes.chunks(MAX_NEIGHBORS).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let reply = Message::Neighbors(Neighbors {
                nodes: chunk.to_vec(),
                expiration: expiration_from_now(),
            });
            if let Err(e) = self.inner.endpoint.send(from, &reply).await {
                tracing::debug!(%from, error = %e, "failed to send neighbors");
                return;
            }
        }
        tracing::trace!(%from, count = nodes.len(), "served find-node");
    }
}

impl<T: Transport> PacketHandler for Engine<T> {
    async fn handle_request(&self, packet: Packet, from: SocketAddr) {
        match &packet.message {
            Message::Ping(ping) => self.on_ping(&packet, ping, from).await,
            Message::FindNode(find) => self.on_find_node(&packet, find, from).await,
            Message::Pong(_) | Message::Neighbors(_) => {}
        }
    }

    fn pong_received(&self, sender: &NodeId) {
        let now = Instant::now();
        let mut bonds = lock(&self.inner.bonds);
        match bonds.get_mut(sender) {
            Some(bond) => bond.last_pong = Some(now),
            None => {
                bonds.put(
                    *sender,
                    Bond {
                        last_pong: Some(now),
                        ..Bond::default()
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::bucket_index;
    use sonar_core::transport::mock::{MemoryNetwork, MemoryTransport};
    use sonar_core::Identity;

    fn engine(network: &MemoryNetwork, config: DhtConfig) -> (Engine<MemoryTransport>, CancellationToken) {
        engine_with(network, config, Identity::generate().unwrap())
    }

    fn engine_with(
        network: &MemoryNetwork,
        config: DhtConfig,
        identity: Identity,
    ) -> (Engine<MemoryTransport>, CancellationToken) {
        let identity = Arc::new(identity);
        let endpoint = Arc::new(Endpoint::new(network.bind_next().unwrap(), identity, &config));
        let engine = Engine::new(Arc::clone(&endpoint), config);
        let shutdown = CancellationToken::new();
        tokio::spawn(endpoint.run(engine.clone(), shutdown.clone()));
        (engine, shutdown)
    }

    fn config() -> DhtConfig {
        DhtConfig {
            request_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        }
    }

    #[test]
    fn test_bond_expiry() {
        let now = Instant::now();
        let bond = Bond {
            last_pong: Some(now),
            ..Bond::default()
        };
        assert!(bond.is_proven(now, Duration::from_secs(1)));
        assert!(!bond.is_proven(now + Duration::from_secs(2), Duration::from_secs(1)));
        assert!(!bond.has_pinged_us(now, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_ping_admits_both_sides() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());

        a.ping(b.local_record()).await.unwrap();
        assert!(a.contains(&b.local_id()).await);

        // b verifies a with a ping-back in the background
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.contains(&a.local_id()).await);
    }

    #[tokio::test]
    async fn test_failed_ping_is_not_admitted() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());
        network.disconnect(&b.endpoint().local_addr());

        assert!(matches!(a.ping(b.local_record()).await, Err(DhtError::Timeout)));
        assert!(!a.contains(&b.local_id()).await);
    }

    #[tokio::test]
    async fn test_find_node_requires_bond() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());
        let (c, _c_stop) = engine(&network, config());

        // b learns about c
        b.ping(c.local_record()).await.unwrap();

        // a has never talked to b; find_node bonds first, then gets c back
        let target = *c.local_record().public_key.as_bytes();
        let found = a
            .find_node(b.local_record(), &PublicKey::new(target))
            .await
            .unwrap();
        assert!(found.iter().any(|r| r.id == c.local_id()));
    }

    #[tokio::test]
    async fn test_neighbors_are_not_admitted_directly() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());
        let (c, _c_stop) = engine(&network, config());
        b.ping(c.local_record()).await.unwrap();

        // c goes silent before a can verify it
        network.disconnect(&c.endpoint().local_addr());
        let found = a
            .find_node(b.local_record(), &c.local_record().public_key)
            .await
            .unwrap();
        assert!(found.iter().any(|r| r.id == c.local_id()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!a.contains(&c.local_id()).await);
        assert!(a.contains(&b.local_id()).await);
    }

    #[tokio::test]
    async fn test_evicted_after_max_failures() {
        let network = MemoryNetwork::new();
        let config = DhtConfig {
            max_fail_count: 2,
            ..config()
        };
        let (a, _a_stop) = engine(&network, config.clone());
        let (b, _b_stop) = engine(&network, config);
        let mut events = a.subscribe();

        a.ping(b.local_record()).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::PeerAdded(record) if record.id == b.local_id()
        ));
        // Let the ping-back exchange settle before b goes away
        tokio::time::sleep(Duration::from_millis(100)).await;

        network.disconnect(&b.endpoint().local_addr());
        assert!(a.ping(b.local_record()).await.is_err());
        assert!(a.contains(&b.local_id()).await);
        assert!(a.ping(b.local_record()).await.is_err());
        assert!(!a.contains(&b.local_id()).await);
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::PeerRemoved(b.local_id()));
    }

    #[tokio::test]
    async fn test_unbonded_find_node_gets_no_reply() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());

        // Skip the bonding step and ask directly
        let message = Message::FindNode(FindNode {
            target: b.local_record().public_key,
            expiration: expiration_from_now(),
        });
        let handle = a
            .endpoint()
            .request(b.local_id(), b.endpoint().local_addr(), &message)
            .await
            .unwrap();
        assert!(matches!(handle.wait().await, Err(DhtError::Timeout)));
    }

    #[tokio::test]
    async fn test_repeated_pings_keep_live_peer() {
        let network = MemoryNetwork::new();
        let (a, _a_stop) = engine(&network, config());
        let (b, _b_stop) = engine(&network, config());

        for _ in 0..5 {
            a.ping(b.local_record()).await.unwrap();
        }
        let concurrent = tokio::join!(
            a.ping(b.local_record()),
            a.ping(b.local_record()),
            a.ping(b.local_record()),
        );
        assert!(concurrent.0.is_ok() && concurrent.1.is_ok() && concurrent.2.is_ok());

        let entry = a
            .with_table(|table| table.get(&b.local_id()).cloned())
            .await
            .unwrap();
        assert_eq!(entry.fail_count, 0);
    }

    /// An identity whose node ID shares a bucket of `local` with `other`
    fn identity_in_bucket(local: &NodeId, other: &NodeId) -> Identity {
        let index = bucket_index(local, other);
        loop {
            let identity = Identity::generate().unwrap();
            if bucket_index(local, &identity.node_id()) == index {
                return identity;
            }
        }
    }

    /// a with k = 1, b in a's table, and c in the same bucket as b
    async fn full_bucket(
        network: &MemoryNetwork,
    ) -> [(Engine<MemoryTransport>, CancellationToken); 3] {
        let single = DhtConfig { k: 1, ..config() };
        let a = engine(network, single.clone());
        let b = engine(network, config());
        let c_identity = identity_in_bucket(&a.0.local_id(), &b.0.local_id());
        let c = engine_with(network, config(), c_identity);

        a.0.ping(b.0.local_record()).await.unwrap();
        // Let b's ping-back settle
        tokio::time::sleep(Duration::from_millis(100)).await;
        [a, b, c]
    }

    #[tokio::test]
    async fn test_full_bucket_keeps_live_peer() {
        let network = MemoryNetwork::new();
        let [(a, _a_stop), (b, _b_stop), (c, _c_stop)] = full_bucket(&network).await;

        a.ping(c.local_record()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(a.contains(&b.local_id()).await);
        assert!(!a.contains(&c.local_id()).await);
        assert_eq!(a.table_len().await, 1);
    }

    #[tokio::test]
    async fn test_full_bucket_replaces_dead_peer() {
        let network = MemoryNetwork::new();
        let [(a, _a_stop), (b, _b_stop), (c, _c_stop)] = full_bucket(&network).await;
        let mut events = a.subscribe();

        network.disconnect(&b.endpoint().local_addr());
        a.ping(c.local_record()).await.unwrap();

        let mut removed = false;
        let mut added = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while !(removed && added) {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(DiscoveryEvent::PeerRemoved(id))) => removed |= id == b.local_id(),
                Ok(Ok(DiscoveryEvent::PeerAdded(record))) => added |= record.id == c.local_id(),
                _ => break,
            }
        }
        assert!(removed && added);

        assert!(!a.contains(&b.local_id()).await);
        assert!(a.contains(&c.local_id()).await);
    }
}
