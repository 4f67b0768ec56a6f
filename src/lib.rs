//! fusionlink - P2P session matchmaking and transport for multiplayer games
//!
//! Provides the UDP session protocol (host, client, NAT probing, relay) and
//! the master registry used to advertise and discover sessions.

pub mod network;
pub mod protocol;
pub mod registry;

pub use network::{SessionClient, SessionHost};
pub use protocol::Packet;
pub use registry::{MasterClient, MasterServer};
