//! Sonar DHT - Kademlia node discovery over UDP
//!
//! This crate implements the Ethereum discovery v4 protocol: a routing
//! table of peers bucketed by XOR distance, a signed-datagram endpoint that
//! correlates requests with replies, the ping/find-node protocol engine,
//! iterative lookups, and the periodic maintenance that keeps the table
//! fresh. [`Discovery`] ties these together behind a small API.

pub mod discovery;
pub mod endpoint;
pub mod lookup;
mod maintenance;
pub mod protocol;
mod replay;
pub mod routing;

pub use discovery::Discovery;
pub use routing::{Observation, Removal, RoutingTable};

use sonar_core::{NodeId, NodeRecord, PublicKey};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Too many pending requests")]
    TooManyPending,

    #[error("Discovery is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Core(#[from] sonar_core::Error),
}

impl DhtError {
    /// Whether the error says something about the remote peer
    ///
    /// Only these count towards a peer's failure total; local conditions
    /// such as a full pending table or shutdown do not.
    pub fn is_peer_failure(&self) -> bool {
        match self {
            DhtError::Timeout | DhtError::Network(_) => true,
            DhtError::Core(sonar_core::Error::SendFailed(_))
            | DhtError::Core(sonar_core::Error::Io(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// Changes to the set of peers in the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerAdded(NodeRecord),
    PeerRemoved(NodeId),
}

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Number of nodes per k-bucket
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Deadline for a single request
    pub request_timeout: Duration,
    /// How long a pong keeps a peer bonded
    pub bond_expiration: Duration,
    /// Consecutive failures before a peer is evicted
    pub max_fail_count: u32,
    /// Interval between seed pings
    pub ping_interval: Duration,
    /// Interval between bucket refreshes
    pub refresh_interval: Duration,
    /// Interval between liveness checks of table entries
    pub revalidate_interval: Duration,
    /// Upper bound on lookup rounds
    pub max_lookup_rounds: usize,
    /// Upper bound on outstanding requests
    pub max_pending: usize,
    /// Concurrent pings used to verify peers learned from neighbors
    pub max_verifications: usize,
    /// Peers tracked for endpoint proofs
    pub max_bonds: usize,
    /// Well-known nodes pinged on every bootstrap tick
    pub bootstrap_seeds: Vec<NodeRecord>,
    /// TCP port advertised in our endpoint (defaults to the UDP port)
    pub tcp_port: Option<u16>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 16,
            alpha: 3,
            request_timeout: Duration::from_millis(500),
            bond_expiration: Duration::from_secs(24 * 60 * 60),
            max_fail_count: 3,
            ping_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            revalidate_interval: Duration::from_secs(10),
            max_lookup_rounds: 16,
            max_pending: 1024,
            max_verifications: 16,
            max_bonds: 4096,
            bootstrap_seeds: Vec::new(),
            tcp_port: None,
        }
    }
}

impl DhtConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("ping_interval", self.ping_interval),
            ("refresh_interval", self.refresh_interval),
            ("revalidate_interval", self.revalidate_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(DhtError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        let counts = [
            ("k", self.k),
            ("alpha", self.alpha),
            ("max_lookup_rounds", self.max_lookup_rounds),
            ("max_pending", self.max_pending),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(DhtError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}

/// A random lookup target
pub fn random_target() -> Result<PublicKey> {
    Ok(PublicKey::random()?)
}

/// A uniformly random index in `0..len`
pub(crate) fn random_index(len: usize) -> Result<usize> {
    if len == 0 {
        return Ok(0);
    }
    let bytes: [u8; 8] = sonar_core::random_bytes()?;
    Ok((u64::from_le_bytes(bytes) % len as u64) as usize)
}
