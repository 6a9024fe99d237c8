//! Discovery v4 packet codec
//!
//! Every packet is `hash || signature || packet-type || rlp(payload)` where
//! `hash = keccak256(signature || packet-type || payload)` and the signature
//! is a recoverable secp256k1 signature over `keccak256(packet-type ||
//! payload)`. The sender's identity is recovered from the signature, so a
//! decoded packet is always attributed to the key that actually signed it.

use crate::identity::{recover_signer, SIGNATURE_LEN};
use crate::{keccak256, unix_time, Error, Identity, NodeEndpoint, NodeId, PublicKey, Result};
use rlp::{DecoderError, Rlp, RlpStream};
use std::net::{IpAddr, Ipv4Addr};

/// Maximum size of a discovery packet
pub const MAX_PACKET_SIZE: usize = 1280;

/// Maximum neighbor entries per packet so that a reply fits `MAX_PACKET_SIZE`
pub const MAX_NEIGHBORS: usize = 12;

/// Seconds added to the current time when stamping outbound packets
pub const EXPIRATION_SECS: u64 = 20;

/// How far in the future an inbound expiration may lie before it is rejected
pub const MAX_EXPIRATION_DRIFT_SECS: u64 = 60;

const HASH_LEN: usize = 32;
const HEADER_LEN: usize = HASH_LEN + SIGNATURE_LEN;

/// Packet type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Ping = 0x01,
    Pong = 0x02,
    FindNode = 0x03,
    Neighbors = 0x04,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::FindNode),
            0x04 => Ok(Self::Neighbors),
            other => Err(Error::UnknownPacketType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: NodeEndpoint,
    pub to: NodeEndpoint,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Where the ping was received from, as seen by the responder
    pub to: NodeEndpoint,
    /// Hash of the ping packet being answered
    pub ping_hash: [u8; 32],
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: PublicKey,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub endpoint: NodeEndpoint,
    pub public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<Neighbor>,
    pub expiration: u64,
}

/// A discovery protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::Ping(_) => PacketKind::Ping,
            Message::Pong(_) => PacketKind::Pong,
            Message::FindNode(_) => PacketKind::FindNode,
            Message::Neighbors(_) => PacketKind::Neighbors,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Message::Ping(m) => m.expiration,
            Message::Pong(m) => m.expiration,
            Message::FindNode(m) => m.expiration,
            Message::Neighbors(m) => m.expiration,
        }
    }

    pub fn set_expiration(&mut self, expiration: u64) {
        match self {
            Message::Ping(m) => m.expiration = expiration,
            Message::Pong(m) => m.expiration = expiration,
            Message::FindNode(m) => m.expiration = expiration,
            Message::Neighbors(m) => m.expiration = expiration,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut s;
        match self {
            Message::Ping(ping) => {
                s = RlpStream::new_list(if ping.enr_seq.is_some() { 5 } else { 4 });
                s.append(&ping.version);
                append_endpoint(&mut s, &ping.from);
                append_endpoint(&mut s, &ping.to);
                s.append(&ping.expiration);
                if let Some(seq) = ping.enr_seq {
                    s.append(&seq);
                }
            }
            Message::Pong(pong) => {
                s = RlpStream::new_list(if pong.enr_seq.is_some() { 4 } else { 3 });
                append_endpoint(&mut s, &pong.to);
                s.append(&pong.ping_hash.to_vec());
                s.append(&pong.expiration);
                if let Some(seq) = pong.enr_seq {
                    s.append(&seq);
                }
            }
            Message::FindNode(find) => {
                s = RlpStream::new_list(2);
                s.append(&find.target.as_bytes().to_vec());
                s.append(&find.expiration);
            }
            Message::Neighbors(neighbors) => {
                s = RlpStream::new_list(2);
                s.begin_list(neighbors.nodes.len());
                for node in &neighbors.nodes {
                    s.begin_list(4);
                    s.append(&ip_bytes(&node.endpoint.ip));
                    s.append(&node.endpoint.udp_port);
                    s.append(&node.endpoint.tcp_port);
                    s.append(&node.public_key.as_bytes().to_vec());
                }
                s.append(&neighbors.expiration);
            }
        }
        s.out().to_vec()
    }

    fn decode_payload(kind: PacketKind, payload: &[u8]) -> std::result::Result<Self, DecoderError> {
        let rlp = Rlp::new(payload);
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        // Trailing list items are ignored for forward compatibility (EIP-8)
        let items = rlp.item_count()?;

        let message = match kind {
            PacketKind::Ping => Message::Ping(Ping {
                version: rlp.val_at(0)?,
                from: decode_endpoint(&rlp.at(1)?)?,
                to: decode_endpoint(&rlp.at(2)?)?,
                expiration: rlp.val_at(3)?,
                enr_seq: if items > 4 { rlp.val_at(4).ok() } else { None },
            }),
            PacketKind::Pong => {
                let hash: Vec<u8> = rlp.val_at(1)?;
                let ping_hash: [u8; 32] = hash
                    .try_into()
                    .map_err(|_| DecoderError::Custom("ping hash must be 32 bytes"))?;
                Message::Pong(Pong {
                    to: decode_endpoint(&rlp.at(0)?)?,
                    ping_hash,
                    expiration: rlp.val_at(2)?,
                    enr_seq: if items > 3 { rlp.val_at(3).ok() } else { None },
                })
            }
            PacketKind::FindNode => {
                let target: Vec<u8> = rlp.val_at(0)?;
                Message::FindNode(FindNode {
                    target: PublicKey::from_slice(&target)
                        .map_err(|_| DecoderError::Custom("target must be 64 bytes"))?,
                    expiration: rlp.val_at(1)?,
                })
            }
            PacketKind::Neighbors => {
                let list = rlp.at(0)?;
                if !list.is_list() {
                    return Err(DecoderError::RlpExpectedToBeList);
                }
                let mut nodes = Vec::with_capacity(list.item_count()?);
                for item in list.iter() {
                    let key: Vec<u8> = item.val_at(3)?;
                    nodes.push(Neighbor {
                        endpoint: decode_endpoint(&item)?,
                        public_key: PublicKey::from_slice(&key)
                            .map_err(|_| DecoderError::Custom("node key must be 64 bytes"))?,
                    });
                }
                Message::Neighbors(Neighbors {
                    nodes,
                    expiration: rlp.val_at(1)?,
                })
            }
        };
        Ok(message)
    }
}

/// A verified inbound packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    /// Public key recovered from the signature
    pub sender: PublicKey,
    pub sender_id: NodeId,
    /// Packet hash, echoed back in pongs
    pub hash: [u8; 32],
}

/// Expiration timestamp for a packet sent now
pub fn expiration_from_now() -> u64 {
    unix_time() + EXPIRATION_SECS
}

/// Reject expired packets and ones stamped implausibly far ahead
pub fn check_expiration(expiration: u64, now: u64) -> Result<()> {
    if expiration < now {
        return Err(Error::Expired { expiration, now });
    }
    if expiration > now + MAX_EXPIRATION_DRIFT_SECS {
        return Err(Error::FutureExpiration { expiration, now });
    }
    Ok(())
}

/// Serialize and sign a message, returning the packet and its hash
pub fn encode(message: &Message, identity: &Identity) -> Result<(Vec<u8>, [u8; 32])> {
    let payload = message.encode_payload();

    let mut signed = Vec::with_capacity(1 + payload.len());
    signed.push(message.kind() as u8);
    signed.extend_from_slice(&payload);
    let signature = identity.sign_prehash(&keccak256(&signed))?;

    let mut packet = Vec::with_capacity(HEADER_LEN + signed.len());
    packet.extend_from_slice(&[0u8; HASH_LEN]);
    packet.extend_from_slice(&signature);
    packet.extend_from_slice(&signed);

    if packet.len() > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(packet.len()));
    }

    let hash = keccak256(&packet[HASH_LEN..]);
    packet[..HASH_LEN].copy_from_slice(&hash);
    Ok((packet, hash))
}

/// Verify and parse a packet
///
/// Expiration is not checked here; see [`check_expiration`].
pub fn decode(buf: &[u8]) -> Result<Packet> {
    if buf.len() < HEADER_LEN + 1 {
        return Err(Error::PacketTooSmall(buf.len()));
    }
    if buf.len() > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(buf.len()));
    }

    let hash = keccak256(&buf[HASH_LEN..]);
    if hash[..] != buf[..HASH_LEN] {
        return Err(Error::HashMismatch);
    }

    let signed = &buf[HEADER_LEN..];
    let sender = recover_signer(&keccak256(signed), &buf[HASH_LEN..HEADER_LEN])?;
    let kind = PacketKind::try_from(signed[0])?;
    let message = Message::decode_payload(kind, &signed[1..])?;

    Ok(Packet {
        message,
        sender_id: sender.id(),
        sender,
        hash,
    })
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn append_endpoint(s: &mut RlpStream, endpoint: &NodeEndpoint) {
    s.begin_list(3);
    s.append(&ip_bytes(&endpoint.ip));
    s.append(&endpoint.udp_port);
    s.append(&endpoint.tcp_port);
}

fn decode_endpoint(rlp: &Rlp<'_>) -> std::result::Result<NodeEndpoint, DecoderError> {
    let raw: Vec<u8> = rlp.val_at(0)?;
    let ip = match raw.len() {
        // Some implementations leave the sender address empty
        0 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        4 => {
            let octets: [u8; 4] = raw
                .try_into()
                .map_err(|_| DecoderError::Custom("invalid IPv4 address"))?;
            IpAddr::from(octets)
        }
        16 => {
            let octets: [u8; 16] = raw
                .try_into()
                .map_err(|_| DecoderError::Custom("invalid IPv6 address"))?;
            IpAddr::from(octets)
        }
        _ => return Err(DecoderError::Custom("invalid IP address length")),
    };
    Ok(NodeEndpoint::new(ip, rlp.val_at(1)?, rlp.val_at(2)?))
}
