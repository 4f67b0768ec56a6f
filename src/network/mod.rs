//! Network module for P2P game sessions
//!
//! Handles UDP transport, NAT probing, the session host and client, and relaying.

mod client;
mod error;
mod host;
mod nat;
mod relay;
mod transport;

pub use client::{ClientConfig, ClientState, SessionClient, HOST_DISCONNECT_REASON};
pub use error::NetworkError;
pub use host::{
    evict_expired, HostConfig, PeerRecord, SessionHost, REJECT_INVALID_PASSWORD,
    REJECT_SERVER_FULL, WELCOME_MESSAGE,
};
pub use nat::{
    hole_punch, outbound_local_ip, NatInfo, NatProber, NatProberConfig, NatType,
    DEFAULT_PUNCH_ATTEMPTS, DEFAULT_STUN_SERVERS,
};
pub use relay::{RelayConfig, RelayServer, RelaySession, DEFAULT_RELAY_PORT};
pub use transport::UdpTransport;
