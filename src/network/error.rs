//! Network error types

use thiserror::Error;

use crate::protocol::PacketError;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("{0}")]
    MalformedPacket(#[from] PacketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to resolve {0}")]
    Resolution(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Payload of {size} bytes exceeds the {max}-byte datagram limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Cannot pair {0} with itself")]
    SelfPairing(std::net::SocketAddr),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Transport is not running")]
    NotRunning,

    #[error("STUN failed: {0}")]
    StunFailed(String),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
