//! Core data types for sonar

use crate::{Error, Result};
use k256::ecdsa::VerifyingKey;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Length of a node identifier in bytes
pub const NODE_ID_LEN: usize = 32;

/// Number of bits in a node identifier, and so the number of routing buckets
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

/// Length of an uncompressed secp256k1 public key without the 0x04 prefix
pub const PUBLIC_KEY_LEN: usize = 64;

/// Keccak-256 digest of `data`
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Fill a buffer from the OS random source
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(buf)
}

/// Current Unix time in seconds
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A 32-byte node identifier: keccak256 of the node's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; NODE_ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Number of leading zero bits (256 for the all-zero ID)
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }

    /// Short hex prefix for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short())
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidData(format!("node id: {}", e)))?;
        let bytes: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidData("node id must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A secp256k1 public key in its 64-byte uncompressed wire form
///
/// Discovery v4 carries these wherever it needs a node identity (find-node
/// targets, neighbor entries); the [`NodeId`] is derived by hashing them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!("public key must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        // Skip the 0x04 uncompressed-point tag
        bytes.copy_from_slice(&point.as_bytes()[1..]);
        Self(bytes)
    }

    /// Parse into a curve point, failing if the bytes are not on secp256k1
    pub fn to_verifying_key(&self) -> Result<VerifyingKey> {
        let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&self.0);
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Random bytes in public-key form, used as lookup targets
    ///
    /// The result is not necessarily a valid curve point; remote peers only
    /// ever hash it.
    pub fn random() -> Result<Self> {
        Ok(Self(random_bytes()?))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// The node identifier for this key
    pub fn id(&self) -> NodeId {
        NodeId(keccak256(&self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidKey(format!("public key: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Network location of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl NodeEndpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    /// Endpoint for a datagram source address, keeping the advertised TCP port
    pub fn from_udp(addr: SocketAddr, tcp_port: u16) -> Self {
        Self::new(addr.ip(), addr.port(), tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// Whether a peer could plausibly be reached at this endpoint
    pub fn is_routable(&self) -> bool {
        !self.ip.is_unspecified() && !self.ip.is_multicast() && self.udp_port != 0
    }
}

/// A known peer in the discovery network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Identifier derived from `public_key`
    pub id: NodeId,
    pub public_key: PublicKey,
    pub endpoint: NodeEndpoint,
    /// ENR sequence number last advertised by the node
    pub seq: u64,
    /// Unix timestamp of the last verified interaction (0 = never)
    pub last_seen: u64,
    /// Unix timestamp of the last ping sent to the node (0 = never)
    pub last_ping: u64,
    /// Consecutive failed liveness checks
    pub fail_count: u32,
}

impl NodeRecord {
    pub fn new(public_key: PublicKey, endpoint: NodeEndpoint) -> Self {
        Self {
            id: public_key.id(),
            public_key,
            endpoint,
            seq: 0,
            last_seen: 0,
            last_ping: 0,
            fail_count: 0,
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.endpoint.udp_addr()
    }

    /// Parse an `enode://<pubkey>@<ip>:<tcp>[?discport=<udp>]` URL
    pub fn from_enode_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("enode://")
            .ok_or_else(|| Error::InvalidAddress(format!("missing enode:// scheme: {}", url)))?;
        let (key, host) = rest
            .split_once('@')
            .ok_or_else(|| Error::InvalidAddress(format!("missing '@' in {}", url)))?;
        let public_key: PublicKey = key.parse()?;

        let (addr, query) = match host.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (host, None),
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr, e)))?;

        let mut udp_port = addr.port();
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(port) = pair.strip_prefix("discport=") {
                    udp_port = port
                        .parse()
                        .map_err(|e| Error::InvalidAddress(format!("discport {}: {}", port, e)))?;
                }
            }
        }

        Ok(Self::new(
            public_key,
            NodeEndpoint::new(addr.ip(), udp_port, addr.port()),
        ))
    }

    /// Format as an enode URL
    pub fn to_enode_url(&self) -> String {
        let addr = SocketAddr::new(self.endpoint.ip, self.endpoint.tcp_port);
        if self.endpoint.udp_port == self.endpoint.tcp_port {
            format!("enode://{}@{}", self.public_key, addr)
        } else {
            format!(
                "enode://{}@{}?discport={}",
                self.public_key, addr, self.endpoint.udp_port
            )
        }
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_enode_url())
    }
}

impl FromStr for NodeRecord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_enode_url(s)
    }
}
