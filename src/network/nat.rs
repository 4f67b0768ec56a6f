//! NAT detection and UDP hole punching
//!
//! Uses RFC 5389 STUN binding requests to discover the public address
//! and port mapping. Classification is deliberately coarse: only
//! [`NatType::OpenInternet`], [`NatType::FullCone`] and [`NatType::Blocked`]
//! are ever produced. Telling restricted, port-restricted and symmetric
//! NATs apart would need extra probes against a second server address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::protocol::{Packet, PacketType};

use super::error::NetworkError;
use super::transport::UdpTransport;

/// STUN message types
const BINDING_REQUEST: u16 = 0x0001;

/// STUN attribute types
const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header length
const STUN_HEADER_SIZE: usize = 20;

/// IPv4 address family in (XOR-)MAPPED-ADDRESS
const FAMILY_IPV4: u8 = 0x01;

/// Public STUN servers, tried in order
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.stunprotocol.org:3478",
];

/// Address used to find the outbound-route interface. Nothing is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:65530";

/// Default number of hole punch packets
pub const DEFAULT_PUNCH_ATTEMPTS: u32 = 10;

/// Delay between hole punch packets
pub const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// NAT classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Unknown,
    OpenInternet,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Blocked,
}

/// Result of NAT detection
#[derive(Debug, Clone, Default)]
pub struct NatInfo {
    /// Address and port as seen by the STUN server
    pub public_endpoint: Option<SocketAddr>,
    /// Local socket address used for probing
    pub local_endpoint: Option<SocketAddr>,
    pub nat_type: NatType,
    pub can_use_p2p: bool,
}

impl NatInfo {
    fn blocked(local_endpoint: Option<SocketAddr>) -> Self {
        Self {
            public_endpoint: None,
            local_endpoint,
            nat_type: NatType::Blocked,
            can_use_p2p: false,
        }
    }
}

/// NAT prober configuration
#[derive(Debug, Clone)]
pub struct NatProberConfig {
    /// STUN servers as `host:port`, tried in order
    pub servers: Vec<String>,
    /// How long to wait for each server's response
    pub response_timeout: Duration,
}

impl Default for NatProberConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            response_timeout: Duration::from_secs(3),
        }
    }
}

/// Detects the local NAT type through STUN
#[derive(Debug, Clone, Default)]
pub struct NatProber {
    config: NatProberConfig,
}

impl NatProber {
    pub fn new(config: NatProberConfig) -> Self {
        Self { config }
    }

    /// Probe the configured STUN servers from `local_port` (0 = ephemeral)
    ///
    /// The first server that answers wins; unreachable or silent servers are
    /// skipped. If none answers the NAT is reported as blocked.
    pub async fn detect(&self, local_port: u16) -> NatInfo {
        let socket = match UdpSocket::bind(("0.0.0.0", local_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("NAT detection could not bind port {}: {}", local_port, e);
                return NatInfo::blocked(None);
            }
        };
        let local_endpoint = socket.local_addr().ok();

        for server in &self.config.servers {
            let public = match self.binding_request(&socket, server).await {
                Ok(public) => public,
                Err(e) => {
                    warn!("STUN request to {} failed: {}", server, e);
                    continue;
                }
            };

            let local_ip = outbound_local_ip().await;
            let local_port = local_endpoint.map(|a| a.port()).unwrap_or(0);
            let nat_type = if public.ip() == local_ip && public.port() == local_port {
                NatType::OpenInternet
            } else {
                NatType::FullCone
            };

            info!(
                "NAT detected via {}: {:?}, public endpoint {}",
                server, nat_type, public
            );

            return NatInfo {
                public_endpoint: Some(public),
                local_endpoint,
                nat_type,
                can_use_p2p: true,
            };
        }

        warn!("No STUN server answered, NAT is treated as blocked");
        NatInfo::blocked(local_endpoint)
    }

    /// Send a binding request to one server and return the mapped address
    pub async fn binding_request(
        &self,
        socket: &UdpSocket,
        server: &str,
    ) -> Result<SocketAddr, NetworkError> {
        let server_addr = tokio::net::lookup_host(server)
            .await
            .map_err(|e| NetworkError::Resolution(format!("{}: {}", server, e)))?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| NetworkError::Resolution(server.to_string()))?;

        debug!("Sending STUN binding request to {}", server_addr);

        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);
        socket.send_to(&request, server_addr).await?;

        let deadline = Instant::now() + self.config.response_timeout;
        let mut buf = [0u8; 576];
        loop {
            let (len, from) = timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| NetworkError::Timeout(format!("STUN response from {}", server)))??;

            match parse_binding_response(&buf[..len], &transaction_id) {
                Ok(mapped) => return Ok(mapped),
                Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
            }
        }
    }
}

/// Local IP address of the interface holding the default route
pub async fn outbound_local_ip() -> IpAddr {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await {
        if socket.connect(ROUTE_PROBE_ADDR).await.is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip();
            }
        }
    }

    local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Fire `attempts` hole punch packets at `target`, one every 100ms
///
/// Best effort: nothing is acknowledged. Both peers are expected to run
/// this at the same time. Returns the number of packets handed to a
/// running transport.
pub async fn hole_punch(transport: &UdpTransport, target: SocketAddr, attempts: u32) -> u32 {
    let punch = Packet::empty(PacketType::HolePunch);
    let mut sent = 0;

    for _ in 0..attempts {
        if !transport.is_running() {
            break;
        }
        transport.send(&punch, target).await;
        sent += 1;
        sleep(PUNCH_INTERVAL).await;
    }

    debug!("Sent {} hole punch packets to {}", sent, target);
    sent
}

/// Build a STUN binding request message
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(STUN_HEADER_SIZE);

    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    // No attributes
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);

    msg
}

/// Parse a STUN binding response, returning the first IPv4 mapped address
fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> Result<SocketAddr, NetworkError> {
    if data.len() < STUN_HEADER_SIZE {
        return Err(NetworkError::StunFailed("Response too short".to_string()));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(NetworkError::StunFailed("Invalid magic cookie".to_string()));
    }

    if &data[8..20] != expected_txn_id {
        return Err(NetworkError::StunFailed(
            "Transaction ID mismatch".to_string(),
        ));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (STUN_HEADER_SIZE + msg_len).min(data.len());

    let mut offset = STUN_HEADER_SIZE;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;

        if value_start + attr_len > data.len() {
            break;
        }
        let attr_data = &data[value_start..value_start + attr_len];

        let mapped = match attr_type {
            XOR_MAPPED_ADDRESS => parse_ipv4_address(attr_data, true),
            MAPPED_ADDRESS => parse_ipv4_address(attr_data, false),
            _ => None,
        };
        if let Some(addr) = mapped {
            return Ok(addr);
        }

        // Attributes are padded to a 4-byte boundary
        offset = value_start + ((attr_len + 3) & !3);
    }

    Err(NetworkError::StunFailed(
        "No IPv4 mapped address in response".to_string(),
    ))
}

/// Parse an IPv4 (XOR-)MAPPED-ADDRESS value; other families yield `None`
fn parse_ipv4_address(data: &[u8], xored: bool) -> Option<SocketAddr> {
    if data.len() < 8 || data[1] != FAMILY_IPV4 {
        return None;
    }

    let mut port = u16::from_be_bytes([data[2], data[3]]);
    let mut addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        addr ^= MAGIC_COOKIE;
    }

    Some(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
}
