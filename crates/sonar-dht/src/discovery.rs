//! Discovery supervisor
//!
//! Owns the receive loop and the maintenance tasks, and exposes the small
//! API the rest of the node uses: a snapshot of discovered peers, lookups,
//! discovery events, and an orderly shutdown.

use crate::endpoint::Endpoint;
use crate::lookup::lookup;
use crate::maintenance::{bootstrap_loop, refresh_loop, revalidate_loop};
use crate::protocol::Engine;
use crate::{DhtConfig, DhtError, DiscoveryEvent, Result};
use sonar_core::{Identity, NodeRecord, PublicKey, Transport, UdpTransport};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A running discovery service
pub struct Discovery<T: Transport = UdpTransport> {
    engine: Engine<T>,
    receiver_stop: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery<UdpTransport> {
    /// Bind a UDP socket and start answering discovery packets
    ///
    /// Maintenance does not run until [`Discovery::start`].
    pub async fn bind(identity: Identity, listen: SocketAddr, config: DhtConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(listen).await?;
        Ok(Self::new(transport, identity, config))
    }
}

impl<T: Transport> Discovery<T> {
    /// Start the receive loop on an existing transport
    pub fn new(transport: T, identity: Identity, config: DhtConfig) -> Self {
        let endpoint = Arc::new(Endpoint::new(transport, Arc::new(identity), &config));
        let engine = Engine::new(Arc::clone(&endpoint), config);

        let receiver_stop = CancellationToken::new();
        let receiver = tokio::spawn(endpoint.run(engine.clone(), receiver_stop.clone()));
        tracing::info!(
            node = %engine.local_id(),
            addr = %engine.endpoint().local_addr(),
            "discovery listening"
        );

        Self {
            engine,
            receiver_stop,
            receiver: Mutex::new(Some(receiver)),
            maintenance: Mutex::new(Vec::new()),
        }
    }

    /// Start the maintenance loops. Calling it again does nothing.
    pub fn start(&self) {
        let mut maintenance = lock(&self.maintenance);
        if !maintenance.is_empty() || self.engine.closing().is_cancelled() {
            return;
        }
        if let Err(e) = self.engine.config().validate() {
            tracing::error!(error = %e, "not starting discovery maintenance");
            return;
        }
        maintenance.push(tokio::spawn(bootstrap_loop(self.engine.clone())));
        maintenance.push(tokio::spawn(refresh_loop(self.engine.clone())));
        maintenance.push(tokio::spawn(revalidate_loop(self.engine.clone())));
        tracing::debug!(
            seeds = self.engine.config().bootstrap_seeds.len(),
            "discovery maintenance started"
        );
    }

    pub fn local_record(&self) -> &NodeRecord {
        self.engine.local_record()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.engine.endpoint().local_addr()
    }

    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }

    /// A snapshot of the routing table
    ///
    /// Each call takes a fresh snapshot; the iterator never observes later
    /// changes.
    pub async fn discovered_peers(&self) -> std::vec::IntoIter<NodeRecord> {
        self.engine.table_snapshot().await.into_iter()
    }

    /// Find the nodes closest to `target`
    pub async fn lookup(&self, target: &PublicKey) -> Result<Vec<NodeRecord>> {
        if self.engine.closing().is_cancelled() {
            return Err(DhtError::ShuttingDown);
        }
        Ok(lookup(&self.engine, target, self.engine.config().k).await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.engine.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.engine.closing().is_cancelled()
    }

    /// Stop everything and wait for it to finish
    ///
    /// New lookups are rejected at once; in-flight requests get up to their
    /// timeout to complete before the receive loop stops.
    pub async fn shutdown(&self) {
        self.engine.closing().cancel();

        let maintenance = std::mem::take(&mut *lock(&self.maintenance));
        for task in maintenance {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "maintenance task failed");
            }
        }

        let tasks = self.engine.tasks();
        tasks.close();
        tasks.wait().await;

        self.receiver_stop.cancel();
        let receiver = lock(&self.receiver).take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                tracing::warn!(error = %e, "receive loop failed");
            }
        }
        tracing::info!(node = %self.engine.local_id().short(), "discovery stopped");
    }
}

impl<T: Transport> Drop for Discovery<T> {
    fn drop(&mut self) {
        self.engine.closing().cancel();
        self.receiver_stop.cancel();
    }
}
