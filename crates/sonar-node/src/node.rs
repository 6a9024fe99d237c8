//! The running agent
//!
//! Wires the persistent identity, the UDP discovery service and a reporter
//! task that logs peers as they come and go plus a periodic table summary.

use crate::config::Config;
use anyhow::Context;
use sonar_core::{Identity, KeyFile, NodeRecord, PublicKey, UdpTransport};
use sonar_dht::protocol::Engine;
use sonar_dht::{Discovery, DiscoveryEvent};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How often the table summary is logged
pub const TABLE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Load the node key at `path`, generating and saving one if needed
pub fn load_identity(path: &Path) -> anyhow::Result<Identity> {
    Identity::load_or_create(&KeyFile::new(path))
        .with_context(|| format!("failed to load node key {}", path.display()))
}

pub struct Node {
    discovery: Discovery,
    stop: CancellationToken,
    reporter: JoinHandle<()>,
}

impl Node {
    /// Bind the discovery socket and start bootstrapping
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let identity = load_identity(&config.key_file())?;
        let dht_config = config.to_dht_config()?;
        let listen = config.listen_addr();

        let discovery = Discovery::bind(identity, listen, dht_config)
            .await
            .with_context(|| format!("failed to bind {}", listen))?;
        let stop = CancellationToken::new();
        let reporter = tokio::spawn(report(
            discovery.engine().clone(),
            discovery.subscribe(),
            stop.clone(),
        ));
        discovery.start();

        tracing::info!(enode = %discovery.local_record().to_enode_url(), "node started");
        Ok(Self {
            discovery,
            stop,
            reporter,
        })
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn local_record(&self) -> &NodeRecord {
        self.discovery.local_record()
    }

    pub fn enode_url(&self) -> String {
        self.local_record().to_enode_url()
    }

    /// Wait until the table holds at least `count` peers
    ///
    /// Returns false if `limit` passes first.
    pub async fn wait_for_peers(&self, count: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.discovery.engine().table_len().await >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn lookup(&self, target: &PublicKey) -> anyhow::Result<Vec<NodeRecord>> {
        Ok(self.discovery.lookup(target).await?)
    }

    /// Stop the reporter and the discovery service
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.reporter.await {
            tracing::warn!(error = %e, "reporter task failed");
        }
        self.discovery.shutdown().await;
    }
}

async fn report(
    engine: Engine<UdpTransport>,
    mut events: tokio::sync::broadcast::Receiver<DiscoveryEvent>,
    stop: CancellationToken,
) {
    let mut ticks = interval_at(Instant::now() + TABLE_LOG_INTERVAL, TABLE_LOG_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                let peers = engine.table_len().await;
                tracing::info!(peers, "routing table");
            }
            event = events.recv() => match event {
                Ok(DiscoveryEvent::PeerAdded(record)) => {
                    tracing::info!(peer = %record.to_enode_url(), "discovered new peer");
                }
                Ok(DiscoveryEvent::PeerRemoved(id)) => {
                    tracing::debug!(node = %id.short(), "peer removed");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "discovery events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
