//! Error types for sonar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rlp::DecoderError),

    #[error("Packet too small: {0} bytes")]
    PacketTooSmall(usize),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Packet hash mismatch")]
    HashMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("Packet expired at {expiration}, now {now}")]
    Expired { expiration: u64, now: u64 },

    #[error("Packet expiration {expiration} too far ahead of {now}")]
    FutureExpiration { expiration: u64, now: u64 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
