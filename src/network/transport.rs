//! UDP transport layer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::protocol::{Packet, MAX_PAYLOAD_SIZE};

use super::error::NetworkError;

/// Receive buffer size (largest UDP datagram)
const RECV_BUFFER_SIZE: usize = 65535;

/// Capacity of the channel between the receive loop and its consumer
const RECV_CHANNEL_CAPACITY: usize = 1024;

/// How long `stop` waits for the receive loop to finish
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback for errors swallowed by the transport
pub type ErrorCallback = Box<dyn Fn(&NetworkError) + Send + Sync + 'static>;

type SharedErrorCallback = Arc<RwLock<Option<Arc<ErrorCallback>>>>;

/// UDP transport for sending and receiving packets
///
/// A bound transport is running until [`UdpTransport::stop`] is called.
/// Sends on a stopped transport are silently dropped.
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    sequence: AtomicU32,
    running: Arc<AtomicBool>,
    error_callback: SharedErrorCallback,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr.parse()?;

        let domain = if parsed_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Allow a stopped host to rebind its port immediately
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&parsed_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
            sequence: AtomicU32::new(0),
            running: Arc::new(AtomicBool::new(true)),
            error_callback: Arc::new(RwLock::new(None)),
            recv_handle: Mutex::new(None),
        })
    }

    /// Bind an ephemeral (or fixed, if `port` is non-zero) port on all IPv4 interfaces
    pub async fn bind_port(port: u16) -> Result<Self, NetworkError> {
        Self::bind(&format!("0.0.0.0:{}", port)).await
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port (resolved when binding port 0)
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sequence number the next send will carry
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Set callback for errors that the transport reports instead of returning
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&NetworkError) + Send + Sync + 'static,
    {
        *self.error_callback.write() = Some(Arc::new(Box::new(callback)));
    }

    /// Send a packet to a remote address, stamping the next sequence number.
    ///
    /// Failures go to the error callback; a stopped transport drops the packet.
    /// Payloads over [`MAX_PAYLOAD_SIZE`] are reported and not sent.
    pub async fn send(&self, packet: &Packet, addr: SocketAddr) {
        let Some(socket) = self.live_socket() else {
            return;
        };

        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            report_error(
                &self.error_callback,
                NetworkError::PayloadTooLarge {
                    size: packet.payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                },
            );
            return;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let data = packet.to_bytes_with_sequence(sequence);

        match socket.send_to(&data, addr).await {
            Ok(len) => trace!(
                "Sent {:?} #{} ({} bytes) to {}",
                packet.packet_type,
                sequence,
                len,
                addr
            ),
            Err(e) => report_error(&self.error_callback, NetworkError::Io(e)),
        }
    }

    /// Send unframed bytes to a remote address
    pub async fn send_raw(&self, data: &[u8], addr: SocketAddr) {
        let Some(socket) = self.live_socket() else {
            return;
        };

        match socket.send_to(data, addr).await {
            Ok(len) => trace!("Sent {} raw bytes to {}", len, addr),
            Err(e) => report_error(&self.error_callback, NetworkError::Io(e)),
        }
    }

    /// Start a receive loop that sends decoded packets to a channel
    ///
    /// Malformed datagrams and receive errors are reported through the error
    /// callback and the loop keeps going until the transport is stopped.
    /// Starting a second loop replaces the first.
    pub fn start_receive_loop(
        &self,
    ) -> Result<mpsc::Receiver<(Packet, SocketAddr)>, NetworkError> {
        let socket = self.live_socket().ok_or(NetworkError::NotRunning)?;
        let running = self.running.clone();
        let error_callback = self.error_callback.clone();
        let (tx, rx) = mpsc::channel(RECV_CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((0, _)) => continue,
                    Ok((len, addr)) => match Packet::from_bytes(&buf[..len]) {
                        Ok(packet) => {
                            trace!(
                                "Received {:?} #{} ({} bytes) from {}",
                                packet.packet_type,
                                packet.sequence,
                                len,
                                addr
                            );
                            if tx.send((packet, addr)).await.is_err() {
                                debug!("Receive channel closed, stopping receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Dropping datagram from {}: {}", addr, e);
                            report_error(&error_callback, e.into());
                        }
                    },
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        report_error(&error_callback, NetworkError::Io(e));
                    }
                }
            }
        });

        if let Some(previous) = self.recv_handle.lock().replace(handle) {
            previous.abort();
        }

        Ok(rx)
    }

    /// Stop the transport: close the socket and join the receive loop
    ///
    /// Idempotent. Waits at most [`STOP_JOIN_TIMEOUT`] for the loop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.recv_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Receive loop on {} did not stop in time", self.local_addr);
            }
        }

        // Dropping the last reference closes the socket
        self.socket.write().take();

        info!("UDP transport on {} stopped", self.local_addr);
    }

    fn live_socket(&self) -> Option<Arc<UdpSocket>> {
        if !self.is_running() {
            return None;
        }
        self.socket.read().clone()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.recv_handle.lock().take() {
            handle.abort();
        }
    }
}

fn report_error(callback: &SharedErrorCallback, error: NetworkError) {
    warn!("Transport error: {}", error);
    let callback = callback.read().clone();
    if let Some(callback) = callback {
        callback(&error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    async fn recv_timeout(
        rx: &mut mpsc::Receiver<(Packet, SocketAddr)>,
    ) -> Option<(Packet, SocketAddr)> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(transport.local_addr().port() > 0);
        assert!(transport.is_running());
    }

    #[tokio::test]
    async fn test_transport_send_receive() {
        let transport1 = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let transport2 = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut rx = transport2.start_receive_loop().unwrap();

        let packet = Packet::new(PacketType::PlayerInput, vec![1, 2, 3, 4]);
        transport1.send(&packet, transport2.local_addr()).await;

        let (received, from_addr) = recv_timeout(&mut rx).await.expect("packet");
        assert_eq!(received.packet_type, PacketType::PlayerInput);
        assert_eq!(received.payload, vec![1, 2, 3, 4]);
        assert_eq!(from_addr, transport1.local_addr());
    }

    #[tokio::test]
    async fn test_sequence_is_per_transport_and_monotonic() {
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut rx_a = a.start_receive_loop().unwrap();
        let mut rx_b = b.start_receive_loop().unwrap();

        let packet = Packet::empty(PacketType::Heartbeat);
        sender.send(&packet, a.local_addr()).await;
        sender.send(&packet, b.local_addr()).await;
        sender.send(&packet, a.local_addr()).await;

        let first = recv_timeout(&mut rx_a).await.unwrap().0.sequence;
        let second = recv_timeout(&mut rx_b).await.unwrap().0.sequence;
        let third = recv_timeout(&mut rx_a).await.unwrap().0.sequence;
        assert_eq!((first, second, third), (0, 1, 2));
        assert_eq!(sender.sequence(), 3);
    }

    #[tokio::test]
    async fn test_malformed_datagram_reported_and_loop_continues() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        transport.set_error_callback(move |e| {
            let _ = err_tx.send(e.to_string());
        });
        let mut rx = transport.start_receive_loop().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[1, 2, 3], transport.local_addr()).await.unwrap();
        let good = Packet::text(PacketType::ChatMessage, "still alive").to_bytes();
        raw.send_to(&good, transport.local_addr()).await.unwrap();

        let error = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(error.contains("Malformed"), "unexpected error: {}", error);

        let (packet, _) = recv_timeout(&mut rx).await.expect("loop should continue");
        assert_eq!(packet.payload_str(), "still alive");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_reported_not_sent() {
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut rx = receiver.start_receive_loop().unwrap();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        sender.set_error_callback(move |e| {
            let _ = err_tx.send(matches!(
                e,
                NetworkError::PayloadTooLarge { size, max }
                    if *size == MAX_PAYLOAD_SIZE + 1 && *max == MAX_PAYLOAD_SIZE
            ));
        });

        let oversized = Packet::new(PacketType::GameStateUpdate, vec![0; MAX_PAYLOAD_SIZE + 1]);
        sender.send(&oversized, receiver.local_addr()).await;
        assert_eq!(err_rx.try_recv(), Ok(true));
        assert_eq!(sender.sequence(), 0);

        let largest = Packet::new(PacketType::GameStateUpdate, vec![7; MAX_PAYLOAD_SIZE]);
        sender.send(&largest, receiver.local_addr()).await;
        let (packet, _) = recv_timeout(&mut rx).await.expect("max-size packet");
        assert_eq!(packet.payload.len(), MAX_PAYLOAD_SIZE);
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_stop_is_noop() {
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut rx = receiver.start_receive_loop().unwrap();

        sender.stop().await;
        assert!(!sender.is_running());
        sender
            .send(&Packet::empty(PacketType::Heartbeat), receiver.local_addr())
            .await;

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "nothing should arrive from a stopped transport");
        assert_eq!(sender.sequence(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_new_loops() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let _rx = transport.start_receive_loop().unwrap();
        transport.stop().await;
        transport.stop().await;
        assert!(matches!(
            transport.start_receive_loop(),
            Err(NetworkError::NotRunning)
        ));
    }

    /// SO_REUSEADDR plus closing on stop allows rebinding the same port
    #[tokio::test]
    async fn test_transport_port_reuse_after_stop() {
        let transport1 = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let _rx = transport1.start_receive_loop().unwrap();
        let port = transport1.local_addr().port();
        transport1.stop().await;

        let transport2 = UdpTransport::bind(&format!("127.0.0.1:{}", port)).await;
        assert!(
            transport2.is_ok(),
            "Should be able to rebind to same port after stop"
        );
        assert_eq!(transport2.unwrap().local_addr().port(), port);
    }
}
