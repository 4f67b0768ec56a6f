//! Session host
//!
//! The authoritative peer of a game session: accepts or rejects join
//! requests, tracks connected peers, relays gameplay traffic between them
//! and evicts peers whose heartbeats stop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::protocol::{Packet, PacketType};
use crate::registry::{Privacy, SessionDescriptor};

use super::error::NetworkError;
use super::transport::{UdpTransport, STOP_JOIN_TIMEOUT};

/// Reject reason when every slot is taken
pub const REJECT_SERVER_FULL: &str = "server is full";

/// Reject reason for a wrong password
pub const REJECT_INVALID_PASSWORD: &str = "invalid password";

/// Payload of the accept reply
pub const WELCOME_MESSAGE: &str = "Welcome!";

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Local UDP port (0 for auto-assign)
    pub port: u16,
    pub server_name: String,
    /// Empty means no password
    pub password: String,
    /// Player slots, the host included
    pub max_players: usize,
    pub game_mode: String,
    pub map_name: String,
    pub privacy: Privacy,
    /// How often stale peers are swept
    pub sweep_interval: Duration,
    /// Peers silent for longer than this are evicted
    pub peer_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 0,
            server_name: "My Server".to_string(),
            password: String::new(),
            max_players: 16,
            game_mode: "Deathmatch".to_string(),
            map_name: "Default".to_string(),
            privacy: Privacy::Public,
            sweep_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
        }
    }
}

/// A peer connected to the host
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Derived from the peer's endpoint
    pub peer_id: String,
    pub endpoint: SocketAddr,
    pub last_heartbeat: Instant,
    pub display_name: String,
    pub ready: bool,
}

/// Callback for peers joining or leaving
pub type PeerCallback = Box<dyn Fn(&PeerRecord) + Send + Sync + 'static>;

/// Callback for gameplay data received from a peer
pub type PeerDataCallback = Box<dyn Fn(&PeerRecord, PacketType, &[u8]) + Send + Sync + 'static>;

#[derive(Default)]
struct HostCallbacks {
    peer_connected: Option<Arc<PeerCallback>>,
    peer_disconnected: Option<Arc<PeerCallback>>,
    data: Option<Arc<PeerDataCallback>>,
}

/// Outcome of a join request
enum JoinDecision {
    Accepted(PeerRecord),
    Refreshed,
    Rejected(&'static str),
}

/// State shared by the receive task and the sweep task
struct HostShared {
    transport: Arc<UdpTransport>,
    peers: Mutex<HashMap<SocketAddr, PeerRecord>>,
    password: String,
    max_players: usize,
    callbacks: Arc<RwLock<HostCallbacks>>,
}

impl HostShared {
    async fn handle_packet(&self, packet: Packet, addr: SocketAddr) {
        match packet.packet_type {
            PacketType::ConnectionRequest => self.handle_join(&packet, addr).await,

            PacketType::Heartbeat => {
                if !self.touch(addr) {
                    trace!("Ignoring heartbeat from unknown endpoint {}", addr);
                }
            }

            PacketType::Disconnect => self.remove_peer(addr, "disconnected"),

            PacketType::HolePunch => {
                self.transport
                    .send(&Packet::empty(PacketType::HolePunch), addr)
                    .await;
            }

            t if t.is_relayed_by_host() => self.relay_from(&packet, addr).await,

            other => trace!("Ignoring {:?} from {}", other, addr),
        }
    }

    async fn handle_join(&self, packet: &Packet, addr: SocketAddr) {
        let requested = packet.payload_str();

        let decision = {
            let mut peers = self.peers.lock();
            let known = peers.contains_key(&addr);

            if !known && peers.len() + 1 >= self.max_players {
                JoinDecision::Rejected(REJECT_SERVER_FULL)
            } else if !self.password.is_empty() && requested != self.password {
                JoinDecision::Rejected(REJECT_INVALID_PASSWORD)
            } else if let Some(peer) = peers.get_mut(&addr) {
                peer.last_heartbeat = Instant::now();
                JoinDecision::Refreshed
            } else {
                // The join payload is the password on protected hosts
                let display_name = if self.password.is_empty() {
                    requested
                } else {
                    addr.to_string()
                };
                let peer = PeerRecord {
                    peer_id: addr.to_string(),
                    endpoint: addr,
                    last_heartbeat: Instant::now(),
                    display_name,
                    ready: false,
                };
                peers.insert(addr, peer.clone());
                JoinDecision::Accepted(peer)
            }
        };

        match decision {
            JoinDecision::Rejected(reason) => {
                info!("Connection rejected ({}): {}", reason, addr);
                self.transport
                    .send(&Packet::text(PacketType::ConnectionReject, reason), addr)
                    .await;
            }
            JoinDecision::Refreshed => {
                debug!("Repeated join from connected peer {}", addr);
                self.send_welcome(addr).await;
            }
            JoinDecision::Accepted(peer) => {
                self.send_welcome(addr).await;
                info!("Peer connected: {} ({})", peer.peer_id, peer.display_name);
                let callback = self.callbacks.read().peer_connected.clone();
                if let Some(callback) = callback {
                    callback(&peer);
                }
            }
        }
    }

    async fn send_welcome(&self, addr: SocketAddr) {
        self.transport
            .send(
                &Packet::text(PacketType::ConnectionAccept, WELCOME_MESSAGE),
                addr,
            )
            .await;
    }

    /// Refresh a known peer's heartbeat. Returns false for unknown endpoints.
    fn touch(&self, addr: SocketAddr) -> bool {
        match self.peers.lock().get_mut(&addr) {
            Some(peer) => {
                peer.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    fn remove_peer(&self, addr: SocketAddr, why: &str) {
        let removed = self.peers.lock().remove(&addr);
        if let Some(peer) = removed {
            self.notify_left(&peer, why);
        }
    }

    fn notify_left(&self, peer: &PeerRecord, why: &str) {
        info!("Peer {}: {} ({})", why, peer.peer_id, peer.display_name);
        let callback = self.callbacks.read().peer_disconnected.clone();
        if let Some(callback) = callback {
            callback(peer);
        }
    }

    /// Forward a gameplay packet to every other peer and surface it to the owner
    async fn relay_from(&self, packet: &Packet, addr: SocketAddr) {
        let (sender, others) = {
            let mut peers = self.peers.lock();
            let Some(sender) = peers.get_mut(&addr) else {
                debug!("Dropping {:?} from unknown endpoint {}", packet.packet_type, addr);
                return;
            };
            sender.last_heartbeat = Instant::now();
            let sender = sender.clone();
            let others: Vec<SocketAddr> = peers.keys().copied().filter(|a| *a != addr).collect();
            (sender, others)
        };

        for target in others {
            self.transport.send(packet, target).await;
        }

        let callback = self.callbacks.read().data.clone();
        if let Some(callback) = callback {
            callback(&sender, packet.packet_type, &packet.payload);
        }
    }

    fn sweep(&self, timeout: Duration) {
        let expired = {
            let mut peers = self.peers.lock();
            evict_expired(&mut peers, Instant::now(), timeout)
        };
        for peer in expired {
            self.notify_left(&peer, "timed out");
        }
    }

    async fn broadcast(&self, packet: &Packet) {
        let targets: Vec<SocketAddr> = self.peers.lock().keys().copied().collect();
        for target in targets {
            self.transport.send(packet, target).await;
        }
    }
}

/// Remove every peer whose last heartbeat is more than `timeout` before `now`
pub fn evict_expired(
    peers: &mut HashMap<SocketAddr, PeerRecord>,
    now: Instant,
    timeout: Duration,
) -> Vec<PeerRecord> {
    let expired: Vec<SocketAddr> = peers
        .iter()
        .filter(|(_, peer)| now.saturating_duration_since(peer.last_heartbeat) > timeout)
        .map(|(addr, _)| *addr)
        .collect();

    expired
        .into_iter()
        .filter_map(|addr| peers.remove(&addr))
        .collect()
}

/// A P2P game session host
pub struct SessionHost {
    config: HostConfig,
    shared: Option<Arc<HostShared>>,
    running: Arc<AtomicBool>,
    callbacks: Arc<RwLock<HostCallbacks>>,
    receive_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl SessionHost {
    /// Create a host; nothing is bound until [`SessionHost::start`]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            shared: None,
            running: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(RwLock::new(HostCallbacks::default())),
            receive_handle: None,
            sweep_handle: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Set callback for accepted peers
    ///
    /// Callbacks may be replaced at any time; running tasks pick up the new one.
    pub fn set_peer_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&PeerRecord) + Send + Sync + 'static,
    {
        self.callbacks.write().peer_connected = Some(Arc::new(Box::new(callback)));
    }

    /// Set callback for peers that disconnected or timed out
    pub fn set_peer_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(&PeerRecord) + Send + Sync + 'static,
    {
        self.callbacks.write().peer_disconnected = Some(Arc::new(Box::new(callback)));
    }

    /// Set callback for gameplay and chat data from peers
    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(&PeerRecord, PacketType, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.write().data = Some(Arc::new(Box::new(callback)));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound port once started, the configured port before
    pub fn port(&self) -> u16 {
        self.shared
            .as_ref()
            .map(|s| s.transport.port())
            .unwrap_or(self.config.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.as_ref().map(|s| s.transport.local_addr())
    }

    /// The host's transport, e.g. for hole punching toward a joining peer
    pub fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.shared.as_ref().map(|s| s.transport.clone())
    }

    /// Connected peers plus the host itself
    pub fn current_players(&self) -> usize {
        self.peer_count() + 1
    }

    pub fn peer_count(&self) -> usize {
        self.shared
            .as_ref()
            .map(|s| s.peers.lock().len())
            .unwrap_or(0)
    }

    /// Snapshot of connected peers
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.shared
            .as_ref()
            .map(|s| s.peers.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Registry advertisement built from the configuration and live player count
    ///
    /// The external address is left empty for the registry to fill in.
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            server_name: self.config.server_name.clone(),
            port: self.port(),
            game_mode: self.config.game_mode.clone(),
            map_name: self.config.map_name.clone(),
            current_players: self.current_players() as u32,
            max_players: self.config.max_players as u32,
            privacy: self.config.privacy,
            has_password: !self.config.password.is_empty(),
            ..Default::default()
        }
    }

    /// Bind the transport and spawn the receive and sweep tasks
    ///
    /// Does nothing if already running.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let transport = Arc::new(UdpTransport::bind_port(self.config.port).await?);
        let mut rx = transport.start_receive_loop()?;

        let shared = Arc::new(HostShared {
            transport: transport.clone(),
            peers: Mutex::new(HashMap::new()),
            password: self.config.password.clone(),
            max_players: self.config.max_players,
            callbacks: self.callbacks.clone(),
        });

        self.running.store(true, Ordering::SeqCst);

        let handler = shared.clone();
        let running = self.running.clone();
        self.receive_handle = Some(tokio::spawn(async move {
            while let Some((packet, addr)) = rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                handler.handle_packet(packet, addr).await;
            }
        }));

        let sweeper = shared.clone();
        let running = self.running.clone();
        let sweep_interval = self.config.sweep_interval;
        let peer_timeout = self.config.peer_timeout;
        self.sweep_handle = Some(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                sweeper.sweep(peer_timeout);
            }
        }));

        info!(
            "Host '{}' started on port {}",
            self.config.server_name,
            transport.port()
        );
        self.shared = Some(shared);
        Ok(())
    }

    /// Disconnect every peer and stop the host. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(shared) = self.shared.as_ref() {
            let peers: Vec<SocketAddr> = shared.peers.lock().drain().map(|(a, _)| a).collect();
            let disconnect = Packet::empty(PacketType::Disconnect);
            for addr in peers {
                shared.transport.send(&disconnect, addr).await;
            }
        }

        for handle in [self.sweep_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Host task did not stop in time");
            }
        }

        if let Some(shared) = self.shared.take() {
            shared.transport.stop().await;
        }

        info!("Host '{}' stopped", self.config.server_name);
    }

    /// Send a packet to every connected peer
    pub async fn broadcast(&self, packet: &Packet) -> Result<(), NetworkError> {
        let shared = self.shared.as_ref().ok_or(NetworkError::NotRunning)?;
        shared.broadcast(packet).await;
        Ok(())
    }

    /// Send a packet to one connected peer
    pub async fn send_to_peer(&self, addr: SocketAddr, packet: &Packet) -> Result<(), NetworkError> {
        let shared = self.shared.as_ref().ok_or(NetworkError::NotRunning)?;
        if !shared.peers.lock().contains_key(&addr) {
            return Err(NetworkError::NotConnected);
        }
        shared.transport.send(packet, addr).await;
        Ok(())
    }
}

impl Drop for SessionHost {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in [self.sweep_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}
