//! Session client
//!
//! Joins a [`SessionHost`](super::host::SessionHost), keeps the membership
//! alive with heartbeats and hands gameplay traffic to its owner.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::lookup_host;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::protocol::{Packet, PacketType};

use super::error::NetworkError;
use super::transport::{UdpTransport, STOP_JOIN_TIMEOUT};

/// Reason reported when the host ends the session
pub const HOST_DISCONNECT_REASON: &str = "Disconnected by host";

/// Client connection state
///
/// ```text
/// [*] --> Disconnected
/// Disconnected --> Connecting: connect()
/// Connecting --> Connected: accept
/// Connecting --> Failed: reject / timeout / resolution failure
/// Connected --> Disconnected: disconnect() or host disconnect
/// Failed --> Disconnected: disconnect()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ClientState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ClientState {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            _ => Self::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent as the join payload when no password is set
    pub player_name: String,
    pub password: String,
    /// Upper bound on the wait for an accept or reject
    pub connect_timeout: Duration,
    /// How often the connect wait checks for a reply
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            player_name: "Player".to_string(),
            password: String::new(),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Payload of the join request
    pub fn join_payload(&self) -> &str {
        if self.password.is_empty() {
            &self.player_name
        } else {
            &self.password
        }
    }
}

/// Callback fired once the host accepts the join
pub type ConnectedCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Callback fired with the reason when the session ends or the join is rejected
pub type DisconnectedCallback = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// Callback for gameplay, chat and state packets from the host
pub type DataCallback = Box<dyn Fn(PacketType, &[u8]) + Send + Sync + 'static>;

/// Callback slot shared with the receive task, so it can be replaced while connected
type Slot<T> = Arc<RwLock<Option<Arc<T>>>>;

fn load<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().clone()
}

/// A client connection to a session host
pub struct SessionClient {
    config: ClientConfig,
    transport: Option<Arc<UdpTransport>>,
    host_addr: Option<SocketAddr>,
    state: Arc<AtomicU8>,
    /// Reason for the most recent failure
    last_error: Arc<Mutex<Option<String>>>,
    connected_callback: Slot<ConnectedCallback>,
    disconnected_callback: Slot<DisconnectedCallback>,
    data_callback: Slot<DataCallback>,
    receive_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            host_addr: None,
            state: Arc::new(AtomicU8::new(ClientState::Disconnected as u8)),
            last_error: Arc::new(Mutex::new(None)),
            connected_callback: Arc::new(RwLock::new(None)),
            disconnected_callback: Arc::new(RwLock::new(None)),
            data_callback: Arc::new(RwLock::new(None)),
            receive_handle: None,
            heartbeat_handle: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get current connection state
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Resolved host endpoint of the current or last attempt
    pub fn host_addr(&self) -> Option<SocketAddr> {
        self.host_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    /// Get the reason for the last failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_connected_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.connected_callback.write() = Some(Arc::new(Box::new(callback)));
    }

    pub fn set_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.disconnected_callback.write() = Some(Arc::new(Box::new(callback)));
    }

    /// Set callback for application data; takes effect immediately, even while connected
    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(PacketType, &[u8]) + Send + Sync + 'static,
    {
        *self.data_callback.write() = Some(Arc::new(Box::new(callback)));
    }

    fn set_state(&self, state: ClientState) {
        if state != ClientState::Failed {
            *self.last_error.lock() = None;
        }
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn set_failed(&self, error: &NetworkError) {
        *self.last_error.lock() = Some(error.to_string());
        self.state.store(ClientState::Failed as u8, Ordering::SeqCst);
    }

    /// Join the host at `host:port`
    ///
    /// Waits for the host's reply up to the configured connect timeout.
    /// On rejection, timeout or resolution failure the state is left at
    /// [`ClientState::Failed`] with the local transport torn down.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), NetworkError> {
        if self.state().is_active() {
            return Err(NetworkError::AlreadyConnected);
        }

        // Leftovers from a previous session or failed attempt
        self.teardown().await;
        self.set_state(ClientState::Connecting);

        let host_addr = match resolve(host, port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("{}", e);
                self.set_failed(&e);
                return Err(e);
            }
        };
        self.host_addr = Some(host_addr);

        let bind_addr = if host_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let transport = match UdpTransport::bind(bind_addr).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.set_failed(&e);
                return Err(e);
            }
        };
        transport.set_error_callback(|e| debug!("Client transport error: {}", e));

        let rx = match transport.start_receive_loop() {
            Ok(rx) => rx,
            Err(e) => {
                transport.stop().await;
                self.set_failed(&e);
                return Err(e);
            }
        };
        self.transport = Some(transport.clone());
        self.start_packet_handler(rx, transport.clone(), host_addr);

        info!("Connecting to {}...", host_addr);
        let request = Packet::text(PacketType::ConnectionRequest, self.config.join_payload());
        transport.send(&request, host_addr).await;

        let deadline = Instant::now() + self.config.connect_timeout;
        while self.state() == ClientState::Connecting && Instant::now() < deadline {
            sleep(self.config.poll_interval).await;
        }

        match self.state() {
            ClientState::Connected => {
                self.start_heartbeat_loop(transport, host_addr);
                Ok(())
            }
            ClientState::Failed => {
                let reason = self.last_error().unwrap_or_default();
                self.teardown().await;
                Err(NetworkError::Rejected(reason))
            }
            _ => {
                let e = NetworkError::Timeout(format!("no reply from {}", host_addr));
                warn!("Connection timeout: {}", host_addr);
                self.teardown().await;
                self.set_failed(&e);
                Err(e)
            }
        }
    }

    /// Leave the session. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.state().is_connected() {
            if let (Some(transport), Some(addr)) = (self.transport.as_ref(), self.host_addr) {
                transport.send(&Packet::empty(PacketType::Disconnect), addr).await;
            }
        }

        let was_disconnected = self.state() == ClientState::Disconnected;
        self.set_state(ClientState::Disconnected);
        self.teardown().await;

        if !was_disconnected {
            info!("Disconnected");
        }
    }

    /// Send a packet to the host
    pub async fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        match (self.transport.as_ref(), self.host_addr) {
            (Some(transport), Some(addr)) => {
                transport.send(packet, addr).await;
                Ok(())
            }
            _ => Err(NetworkError::NotConnected),
        }
    }

    /// Stop background tasks and close the transport
    async fn teardown(&mut self) {
        for handle in [self.heartbeat_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Client task did not stop in time");
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
    }

    fn start_packet_handler(
        &mut self,
        mut rx: tokio::sync::mpsc::Receiver<(Packet, SocketAddr)>,
        transport: Arc<UdpTransport>,
        host_addr: SocketAddr,
    ) {
        let state = self.state.clone();
        let last_error = self.last_error.clone();
        let connected_callback = self.connected_callback.clone();
        let disconnected_callback = self.disconnected_callback.clone();
        let data_callback = self.data_callback.clone();

        let handle = tokio::spawn(async move {
            while let Some((packet, addr)) = rx.recv().await {
                if addr != host_addr {
                    trace!("Ignoring {:?} from {}", packet.packet_type, addr);
                    continue;
                }

                let current = ClientState::from_u8(state.load(Ordering::SeqCst));

                match packet.packet_type {
                    PacketType::ConnectionAccept => {
                        if current != ClientState::Connecting {
                            continue;
                        }
                        state.store(ClientState::Connected as u8, Ordering::SeqCst);
                        info!("Connected: {}", packet.payload_str());
                        if let Some(callback) = load(&connected_callback) {
                            callback();
                        }
                    }

                    PacketType::ConnectionReject => {
                        if current != ClientState::Connecting {
                            continue;
                        }
                        let reason = packet.payload_str();
                        *last_error.lock() = Some(reason.clone());
                        state.store(ClientState::Failed as u8, Ordering::SeqCst);
                        info!("Connection rejected: {}", reason);
                        if let Some(callback) = load(&disconnected_callback) {
                            callback(&reason);
                        }
                    }

                    PacketType::Disconnect => {
                        if current != ClientState::Connected {
                            continue;
                        }
                        info!("{}", HOST_DISCONNECT_REASON);
                        state.store(ClientState::Disconnected as u8, Ordering::SeqCst);
                        transport.stop().await;
                        if let Some(callback) = load(&disconnected_callback) {
                            callback(HOST_DISCONNECT_REASON);
                        }
                        break;
                    }

                    PacketType::HolePunch => {
                        transport
                            .send(&Packet::empty(PacketType::HolePunch), addr)
                            .await;
                    }

                    t if t.is_application_data() => {
                        if let Some(callback) = load(&data_callback) {
                            callback(t, &packet.payload);
                        }
                    }

                    other => trace!("Ignoring {:?} from host", other),
                }
            }
        });

        self.receive_handle = Some(handle);
    }

    fn start_heartbeat_loop(&mut self, transport: Arc<UdpTransport>, host_addr: SocketAddr) {
        let state = self.state.clone();
        let period = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !ClientState::from_u8(state.load(Ordering::SeqCst)).is_connected() {
                    break;
                }

                transport
                    .send(&Packet::empty(PacketType::Heartbeat), host_addr)
                    .await;
                trace!("Sent heartbeat to {}", host_addr);
            }
        });

        self.heartbeat_handle = Some(handle);
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        for handle in [self.heartbeat_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Resolve `host:port`, preferring an IPv4 address
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::Resolution(format!("{}: {}", host, e)))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::Resolution(host.to_string()))
}
