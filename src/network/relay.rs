//! Relay service
//!
//! Forwards `RelayData` payloads between two paired endpoints that cannot
//! reach each other directly. Pairings are created through
//! [`RelayServer::create_session`]; nothing on the wire creates them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::protocol::{Packet, PacketType};

use super::error::NetworkError;
use super::transport::{UdpTransport, STOP_JOIN_TIMEOUT};

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 9000;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub sweep_interval: Duration,
    /// Sessions without traffic for longer than this are dropped
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// A pairing between two endpoints
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub session_id: Uuid,
    pub peer_a: SocketAddr,
    pub peer_b: SocketAddr,
    pub last_activity: Instant,
    /// Payload bytes forwarded in either direction
    pub bytes_relayed: u64,
}

impl RelaySession {
    fn counterpart(&self, endpoint: SocketAddr) -> SocketAddr {
        if endpoint == self.peer_a {
            self.peer_b
        } else {
            self.peer_a
        }
    }
}

/// Sessions plus an endpoint index, mutated under one lock
#[derive(Default)]
struct RelayTable {
    sessions: HashMap<Uuid, RelaySession>,
    by_endpoint: HashMap<SocketAddr, Uuid>,
}

impl RelayTable {
    fn insert(&mut self, peer_a: SocketAddr, peer_b: SocketAddr, now: Instant) -> Uuid {
        // An endpoint belongs to at most one pairing
        for endpoint in [peer_a, peer_b] {
            if let Some(old) = self.by_endpoint.get(&endpoint).copied() {
                debug!("Replacing relay session {} for {}", old, endpoint);
                self.remove(&old);
            }
        }

        let session_id = Uuid::new_v4();
        self.sessions.insert(
            session_id,
            RelaySession {
                session_id,
                peer_a,
                peer_b,
                last_activity: now,
                bytes_relayed: 0,
            },
        );
        self.by_endpoint.insert(peer_a, session_id);
        self.by_endpoint.insert(peer_b, session_id);
        session_id
    }

    fn remove(&mut self, session_id: &Uuid) -> Option<RelaySession> {
        let session = self.sessions.remove(session_id)?;
        for endpoint in [session.peer_a, session.peer_b] {
            if self.by_endpoint.get(&endpoint) == Some(session_id) {
                self.by_endpoint.remove(&endpoint);
            }
        }
        Some(session)
    }

    /// Record a forwarded payload and return where it goes
    fn route(&mut self, from: SocketAddr, len: usize, now: Instant) -> Option<SocketAddr> {
        let session_id = self.by_endpoint.get(&from)?;
        let session = self.sessions.get_mut(session_id)?;
        session.last_activity = now;
        session.bytes_relayed += len as u64;
        Some(session.counterpart(from))
    }

    fn sweep_idle(&mut self, now: Instant, timeout: Duration) -> Vec<RelaySession> {
        let idle: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|s| s.session_id)
            .collect();

        idle.iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// UDP relay server
pub struct RelayServer {
    config: RelayConfig,
    table: Arc<Mutex<RelayTable>>,
    transport: Option<Arc<UdpTransport>>,
    running: Arc<AtomicBool>,
    receive_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(RelayTable::default())),
            transport: None,
            running: Arc::new(AtomicBool::new(false)),
            receive_handle: None,
            sweep_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound port once started, the configured port before
    pub fn port(&self) -> u16 {
        self.transport
            .as_ref()
            .map(|t| t.port())
            .unwrap_or(self.config.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    /// Pair two distinct endpoints. Existing pairings of either endpoint are replaced.
    pub fn create_session(&self, peer_a: SocketAddr, peer_b: SocketAddr) -> Result<Uuid, NetworkError> {
        if peer_a == peer_b {
            return Err(NetworkError::SelfPairing(peer_a));
        }
        let session_id = self.table.lock().insert(peer_a, peer_b, Instant::now());
        info!("Relay session created: {} <-> {} ({})", peer_a, peer_b, session_id);
        Ok(session_id)
    }

    pub fn remove_session(&self, session_id: &Uuid) -> bool {
        self.table.lock().remove(session_id).is_some()
    }

    /// Snapshot of one session
    pub fn session(&self, session_id: &Uuid) -> Option<RelaySession> {
        self.table.lock().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.table.lock().sessions.len()
    }

    /// Drop sessions idle at `now`. Returns how many were removed.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let removed = self.table.lock().sweep_idle(now, self.config.idle_timeout);
        for session in &removed {
            info!("Relay session timed out: {}", session.session_id);
        }
        removed.len()
    }

    /// Bind the socket and spawn the forwarding and sweep tasks
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let transport = Arc::new(UdpTransport::bind_port(self.config.port).await?);
        transport.set_error_callback(|e| warn!("Relay transport error: {}", e));
        let mut rx = transport.start_receive_loop()?;
        self.running.store(true, Ordering::SeqCst);

        let table = self.table.clone();
        let forwarder = transport.clone();
        self.receive_handle = Some(tokio::spawn(async move {
            while let Some((packet, from)) = rx.recv().await {
                forward(&table, &forwarder, packet, from).await;
            }
        }));

        let table = self.table.clone();
        let running = self.running.clone();
        let (sweep_interval, idle_timeout) = (self.config.sweep_interval, self.config.idle_timeout);
        self.sweep_handle = Some(tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let removed = table.lock().sweep_idle(Instant::now(), idle_timeout);
                for session in removed {
                    info!("Relay session timed out: {}", session.session_id);
                }
            }
        }));

        info!("Relay server started on port {}", transport.port());
        self.transport = Some(transport);
        Ok(())
    }

    /// Stop forwarding. Sessions are kept. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for handle in [self.sweep_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Relay task did not stop in time");
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
        info!("Relay server stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        for handle in [self.sweep_handle.take(), self.receive_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

async fn forward(
    table: &Mutex<RelayTable>,
    transport: &UdpTransport,
    packet: Packet,
    from: SocketAddr,
) {
    if packet.packet_type != PacketType::RelayData {
        trace!("Relay ignoring {:?} from {}", packet.packet_type, from);
        return;
    }

    let target = table.lock().route(from, packet.payload.len(), Instant::now());
    match target {
        Some(target) => transport.send_raw(&packet.payload, target).await,
        None => trace!("Relay dropping datagram from unpaired {}", from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_route_to_counterpart() {
        let mut table = RelayTable::default();
        let now = Instant::now();
        let id = table.insert(addr("10.0.0.1:1000"), addr("10.0.0.2:2000"), now);

        assert_eq!(table.route(addr("10.0.0.1:1000"), 5, now), Some(addr("10.0.0.2:2000")));
        assert_eq!(table.route(addr("10.0.0.2:2000"), 7, now), Some(addr("10.0.0.1:1000")));
        assert_eq!(table.route(addr("10.0.0.3:3000"), 7, now), None);
        assert_eq!(table.sessions[&id].bytes_relayed, 12);
    }

    #[test]
    fn test_repairing_replaces_old_session() {
        let mut table = RelayTable::default();
        let now = Instant::now();
        let old = table.insert(addr("10.0.0.1:1000"), addr("10.0.0.2:2000"), now);
        let new = table.insert(addr("10.0.0.1:1000"), addr("10.0.0.3:3000"), now);

        assert!(!table.sessions.contains_key(&old));
        assert!(table.sessions.contains_key(&new));
        assert_eq!(table.route(addr("10.0.0.2:2000"), 1, now), None);
        assert_eq!(table.route(addr("10.0.0.1:1000"), 1, now), Some(addr("10.0.0.3:3000")));
    }

    #[test]
    fn test_sweep_idle() {
        let mut table = RelayTable::default();
        let start = Instant::now();
        table.insert(addr("10.0.0.1:1000"), addr("10.0.0.2:2000"), start);
        let busy = table.insert(addr("10.0.0.3:3000"), addr("10.0.0.4:4000"), start);
        table.route(addr("10.0.0.3:3000"), 1, start + Duration::from_secs(120));

        let timeout = Duration::from_secs(300);
        let removed = table.sweep_idle(start + Duration::from_secs(301), timeout);

        assert_eq!(removed.len(), 1);
        assert_eq!(table.sessions.len(), 1);
        assert!(table.sessions.contains_key(&busy));
        assert!(table.by_endpoint.get(&addr("10.0.0.1:1000")).is_none());
    }

    #[test]
    fn test_endpoint_cannot_pair_with_itself() {
        let relay = RelayServer::new(RelayConfig::default());
        let endpoint = addr("10.0.0.1:1000");

        assert!(matches!(
            relay.create_session(endpoint, endpoint),
            Err(NetworkError::SelfPairing(a)) if a == endpoint
        ));
        assert_eq!(relay.session_count(), 0);

        let same_ip = relay.create_session(endpoint, addr("10.0.0.1:1001"));
        assert!(same_ip.is_ok(), "Different ports on one host are distinct endpoints");
    }

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 9000);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }
}
