//! Packet definitions for the fusionlink wire protocol
//!
//! Packet format (9-byte header, one packet per datagram):
//! - type: 1 byte
//! - sequence: 4 bytes (big-endian)
//! - payload length: 4 bytes (big-endian)
//! - payload: `payload length` bytes

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header size in bytes
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size that fits a single Ethernet-MTU datagram
/// 1500 - 20 - 8 - 9 = 1463 bytes
pub const MAX_PAYLOAD_SIZE: usize = 1463;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    // Connection
    ConnectionRequest = 0,
    ConnectionAccept = 1,
    ConnectionReject = 2,
    Disconnect = 3,
    Heartbeat = 4,

    // Peer discovery
    PeerDiscovery = 10,
    PeerInfo = 11,
    HolePunch = 12,

    // Game state
    GameStateUpdate = 20,
    PlayerInput = 21,
    PlayerJoin = 22,
    PlayerLeave = 23,

    // Server browser
    ServerQuery = 30,
    ServerInfo = 31,
    ServerList = 32,

    // Invites
    InviteRequest = 40,
    InviteResponse = 41,

    /// Opaque payload forwarded by a relay
    RelayData = 50,

    ChatMessage = 60,
}

impl PacketType {
    /// Gameplay traffic that a host relays between peers
    pub fn is_relayed_by_host(self) -> bool {
        matches!(self, PacketType::PlayerInput | PacketType::ChatMessage)
    }

    /// Traffic a client hands to its owner verbatim
    pub fn is_application_data(self) -> bool {
        matches!(
            self,
            PacketType::GameStateUpdate | PacketType::PlayerInput | PacketType::ChatMessage
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::ConnectionRequest),
            1 => Ok(PacketType::ConnectionAccept),
            2 => Ok(PacketType::ConnectionReject),
            3 => Ok(PacketType::Disconnect),
            4 => Ok(PacketType::Heartbeat),
            10 => Ok(PacketType::PeerDiscovery),
            11 => Ok(PacketType::PeerInfo),
            12 => Ok(PacketType::HolePunch),
            20 => Ok(PacketType::GameStateUpdate),
            21 => Ok(PacketType::PlayerInput),
            22 => Ok(PacketType::PlayerJoin),
            23 => Ok(PacketType::PlayerLeave),
            30 => Ok(PacketType::ServerQuery),
            31 => Ok(PacketType::ServerInfo),
            32 => Ok(PacketType::ServerList),
            40 => Ok(PacketType::InviteRequest),
            41 => Ok(PacketType::InviteResponse),
            50 => Ok(PacketType::RelayData),
            60 => Ok(PacketType::ChatMessage),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Decode failures. Every variant is a malformed datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    TooShort { len: usize },

    #[error("Malformed packet: declared payload of {declared} bytes, only {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("Malformed packet: unknown packet type {0}")]
    UnknownType(u8),
}

/// A network packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Stamped by the sending transport; informational only
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet with a payload. The sequence is assigned on send.
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            sequence: 0,
            payload,
        }
    }

    /// Create a packet without payload
    pub fn empty(packet_type: PacketType) -> Self {
        Self::new(packet_type, Vec::new())
    }

    /// Create a packet carrying a UTF-8 string
    pub fn text(packet_type: PacketType, text: &str) -> Self {
        Self::new(packet_type, text.as_bytes().to_vec())
    }

    /// Payload interpreted as UTF-8 (invalid sequences are replaced)
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Size of the encoded packet in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_with_sequence(self.sequence)
    }

    /// Serialize the packet with `sequence` in place of its own sequence number
    pub fn to_bytes_with_sequence(&self, sequence: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());

        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserialize a packet from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort { len: data.len() });
        }

        let packet_type = PacketType::try_from(data[0])?;
        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let declared = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;

        let available = data.len() - HEADER_SIZE;
        if declared > available {
            return Err(PacketError::Truncated {
                declared,
                available,
            });
        }

        Ok(Self {
            packet_type,
            sequence,
            payload: data[HEADER_SIZE..HEADER_SIZE + declared].to_vec(),
        })
    }
}
