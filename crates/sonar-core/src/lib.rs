//! Sonar Core - Shared types, identity, and wire protocol
//!
//! This crate provides the building blocks for the sonar node-discovery
//! agent: node identifiers and records, the persisted node identity, the
//! discovery v4 packet codec, and the datagram transport abstraction.

pub mod error;
pub mod identity;
pub mod transport;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use identity::{Identity, KeyFile};
pub use transport::{Transport, UdpTransport};
pub use types::*;

/// Discovery protocol version carried in ping packets
pub const PROTOCOL_VERSION: u32 = 4;
