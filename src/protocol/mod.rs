//! Network protocol definitions
//!
//! Defines the packet format shared by hosts, clients and relays.

mod packet;

pub use packet::{Packet, PacketError, PacketType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
