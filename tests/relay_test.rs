//! Relay tests: forwarding between paired endpoints over loopback UDP

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use fusionlink::network::{RelayConfig, RelayServer, UdpTransport};
use fusionlink::protocol::{Packet, PacketType};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay() -> (RelayServer, SocketAddr) {
    let mut relay = RelayServer::new(RelayConfig {
        port: 0,
        ..Default::default()
    });
    relay.start().await.expect("Failed to start relay");
    let addr = format!("127.0.0.1:{}", relay.port()).parse().unwrap();
    (relay, addr)
}

/// Test: Relayed payloads arrive verbatim
/// Given a relay session pairing X and Y
/// When X sends a relay packet
/// Then Y receives exactly the payload and the byte counter grows by its length
#[tokio::test]
async fn test_relay_forwards_payload_verbatim() {
    let (mut relay, relay_addr) = start_relay().await;

    let x = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let y = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let y_addr = y.local_addr().unwrap();

    let session_id = relay.create_session(x.local_addr(), y_addr).unwrap();
    assert_eq!(relay.session_count(), 1);

    let payload = b"opaque game bytes".to_vec();
    x.send(&Packet::new(PacketType::RelayData, payload.clone()), relay_addr)
        .await;

    let mut buf = [0u8; 1500];
    let (len, from) = timeout(RECV_TIMEOUT, y.recv_from(&mut buf))
        .await
        .expect("relayed datagram")
        .unwrap();
    assert_eq!(&buf[..len], payload.as_slice());
    assert_eq!(from, relay_addr);

    let session = relay.session(&session_id).unwrap();
    assert_eq!(session.bytes_relayed, payload.len() as u64);

    x.stop().await;
    relay.stop().await;
}

/// Test: Framed packets survive the relay in both directions
#[tokio::test]
async fn test_relay_is_bidirectional() {
    let (mut relay, relay_addr) = start_relay().await;

    let x = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let y = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let mut x_rx = x.start_receive_loop().unwrap();
    let mut y_rx = y.start_receive_loop().unwrap();
    let session_id = relay.create_session(x.local_addr(), y.local_addr()).unwrap();

    let to_y = Packet::text(PacketType::ChatMessage, "hello from x").to_bytes();
    x.send(&Packet::new(PacketType::RelayData, to_y.clone()), relay_addr)
        .await;
    let (packet, _) = timeout(RECV_TIMEOUT, y_rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet.packet_type, PacketType::ChatMessage);
    assert_eq!(packet.payload_str(), "hello from x");

    let to_x = Packet::text(PacketType::PlayerInput, "jump").to_bytes();
    y.send(&Packet::new(PacketType::RelayData, to_x.clone()), relay_addr)
        .await;
    let (packet, _) = timeout(RECV_TIMEOUT, x_rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet.packet_type, PacketType::PlayerInput);
    assert_eq!(packet.payload_str(), "jump");

    let relayed = relay.session(&session_id).unwrap().bytes_relayed;
    assert_eq!(relayed, (to_y.len() + to_x.len()) as u64);

    x.stop().await;
    y.stop().await;
    relay.stop().await;
}

/// Test: Unpaired endpoints and non-relay packets are dropped
#[tokio::test]
async fn test_relay_drops_unknown_traffic() {
    let (mut relay, relay_addr) = start_relay().await;

    let x = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let y = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let stranger = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let session_id = relay
        .create_session(x.local_addr(), y.local_addr().unwrap())
        .unwrap();

    stranger
        .send(&Packet::new(PacketType::RelayData, vec![1, 2, 3]), relay_addr)
        .await;
    x.send(&Packet::text(PacketType::ChatMessage, "not relay data"), relay_addr)
        .await;

    let mut buf = [0u8; 1500];
    let nothing = timeout(Duration::from_millis(300), y.recv_from(&mut buf)).await;
    assert!(nothing.is_err(), "Nothing should be forwarded");
    assert_eq!(relay.session(&session_id).unwrap().bytes_relayed, 0);

    x.stop().await;
    stranger.stop().await;
    relay.stop().await;
}

/// Test: Idle sessions are swept after five minutes
#[tokio::test]
async fn test_idle_session_is_swept() {
    let relay = RelayServer::new(RelayConfig::default());
    let session_id = relay
        .create_session(
            "10.0.0.1:4000".parse().unwrap(),
            "10.0.0.2:4000".parse().unwrap(),
        )
        .unwrap();

    let now = Instant::now();
    assert_eq!(relay.sweep_idle_at(now + Duration::from_secs(60)), 0);
    assert_eq!(relay.session_count(), 1);

    assert_eq!(relay.sweep_idle_at(now + Duration::from_secs(301)), 1);
    assert!(relay.session(&session_id).is_none());
}

/// Test: Removing a session stops forwarding
#[tokio::test]
async fn test_removed_session_no_longer_forwards() {
    let (mut relay, relay_addr) = start_relay().await;

    let x = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let y = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session_id = relay
        .create_session(x.local_addr(), y.local_addr().unwrap())
        .unwrap();

    assert!(relay.remove_session(&session_id));
    assert!(!relay.remove_session(&session_id));

    x.send(&Packet::new(PacketType::RelayData, vec![7; 8]), relay_addr)
        .await;
    let mut buf = [0u8; 1500];
    assert!(timeout(Duration::from_millis(300), y.recv_from(&mut buf))
        .await
        .is_err());

    x.stop().await;
    relay.stop().await;
}
