//! End-to-end tests for the local and remote relay endpoints.
//!
//! Everything runs over loopback with OS-assigned ports and short
//! retransmission timeouts.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_roundtrip -- --nocapture

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use udprelay::proxy::{DestinationTransport, LocalConfig, LocalRelay};
use udprelay::server::{Server, ServerConfig};
use udprelay::transport::{ForwardMessage, PoolConfig, PortRange, TransportConfig};

/// One-time tracing initialization
static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn transport(rto_ms: u64, max_attempts: u32) -> TransportConfig {
    TransportConfig {
        buffer_size: 1024,
        retransmission_timeout_ms: rto_ms,
        max_attempts,
    }
}

fn loopback_pool() -> PoolConfig {
    PoolConfig {
        capacity: 2,
        bind_ip: "127.0.0.1".parse().unwrap(),
        port_range: PortRange::EPHEMERAL,
    }
}

async fn start_remote(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(config).expect("remote config"));
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();

    let running = Arc::clone(&server);
    tokio::spawn(async move { running.serve(socket).await });
    (server, addr)
}

fn remote_config(rto_ms: u64) -> ServerConfig {
    let mut config = ServerConfig::new("127.0.0.1", 0);
    config.transport = transport(rto_ms, 5);
    config.pool = loopback_pool();
    config
}

async fn start_local(remote: SocketAddr, transport: TransportConfig) -> (Arc<LocalRelay>, SocketAddr) {
    let mut config = LocalConfig::new(remote.ip().to_string(), remote.port());
    config.transport = transport;
    config.pool = loopback_pool();

    let relay = Arc::new(LocalRelay::new(config).await.expect("local config"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let running = Arc::clone(&relay);
    tokio::spawn(async move { running.serve(listener).await });
    (relay, addr)
}

/// Complete the SOCKS5 handshake for `target` and return the stream.
async fn socks_connect(local: SocketAddr, target: SocketAddr) -> TcpStream {
    let target = match target {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("IPv4 targets only"),
    };
    let mut stream = TcpStream::connect(local).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    stream.write_all(&connect_request(target)).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01], "CONNECT must succeed");
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), local.port());

    stream
}

fn connect_request(target: SocketAddrV4) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&target.ip().octets());
    req.extend_from_slice(&target.port().to_be_bytes());
    req
}

/// UDP destination answering every "ping" with "pong".
async fn spawn_pong_destination() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if &buf[..n] == b"ping" {
                let _ = socket.send_to(b"pong", from).await;
            }
        }
    });
    addr
}

async fn wait_for_sessions_closed(relay: &LocalRelay) {
    timeout(TEST_TIMEOUT, async {
        while relay.sessions().count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions should close");
}

async fn recv_forward(socket: &UdpSocket) -> (ForwardMessage, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("forward message")
        .unwrap();
    let message = ForwardMessage::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
    (message, from)
}

// ============================================================================
// Round trips through both endpoints
// ============================================================================

#[tokio::test]
async fn ping_pong_roundtrip() {
    init_tracing();

    let destination = spawn_pong_destination().await;
    let (server, remote) = start_remote(remote_config(200)).await;
    let (relay, local) = start_local(remote, transport(200, 5)).await;

    let mut app = socks_connect(local, destination).await;
    app.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(TEST_TIMEOUT, app.read_exact(&mut reply))
        .await
        .expect("response")
        .unwrap();
    assert_eq!(&reply, b"pong");

    drop(app);
    wait_for_sessions_closed(&relay).await;
    timeout(TEST_TIMEOUT, async {
        while server.metrics().responses_delivered() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("response acknowledged");

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.requests_forwarded, 1);
    assert_eq!(snapshot.responses_delivered, 1);
    assert_eq!(snapshot.malformed_dropped, 0);
    assert_eq!(relay.pool().leased_count(), 0);
    assert_eq!(server.pool().leased_count(), 0);

    relay.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn tcp_destination_roundtrip() {
    init_tracing();

    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = destination.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        let mut reply = buf[..n].to_vec();
        reply.reverse();
        conn.write_all(&reply).await.unwrap();
    });

    let mut config = remote_config(500);
    config.destination_transport = DestinationTransport::Tcp;
    let (server, remote) = start_remote(config).await;
    let (relay, local) = start_local(remote, transport(500, 5)).await;

    let mut app = socks_connect(local, dest_addr).await;
    app.write_all(b"stressed").await.unwrap();

    let mut reply = [0u8; 8];
    timeout(TEST_TIMEOUT, app.read_exact(&mut reply))
        .await
        .expect("response")
        .unwrap();
    assert_eq!(&reply, b"desserts");

    relay.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn malformed_datagram_gets_no_ack_and_remote_survives() {
    init_tracing();

    let (server, remote) = start_remote(remote_config(200)).await;
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    probe.send_to(b"abcdmissing-delimiters", remote).await.unwrap();
    let mut buf = [0u8; 64];
    let answered = timeout(Duration::from_millis(400), probe.recv_from(&mut buf)).await;
    assert!(answered.is_err(), "malformed datagram must not be acknowledged");
    assert_eq!(server.metrics().malformed_dropped(), 1);

    // The same remote still relays a well-formed exchange.
    let destination = spawn_pong_destination().await;
    let (relay, local) = start_local(remote, transport(200, 5)).await;
    let mut app = socks_connect(local, destination).await;
    app.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(TEST_TIMEOUT, app.read_exact(&mut reply))
        .await
        .expect("response")
        .unwrap();
    assert_eq!(&reply, b"pong");

    relay.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn unsupported_command_is_rejected() {
    init_tracing();

    let (server, remote) = start_remote(remote_config(200)).await;
    let (relay, local) = start_local(remote, transport(200, 5)).await;

    let mut stream = TcpStream::connect(local).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    // UDP ASSOCIATE
    stream
        .write_all(&[0x05, 0x03, 0x00, 0x01, 127, 0, 0, 1, 0, 53])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);

    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await.unwrap(), 0, "connection closed");
    wait_for_sessions_closed(&relay).await;

    relay.shutdown();
    server.shutdown();
}

// ============================================================================
// Protocol behavior against a scripted remote
// ============================================================================

#[tokio::test]
async fn chunks_sent_one_at_a_time_with_delayed_acks() {
    init_tracing();

    let fake_remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = fake_remote.local_addr().unwrap();
    let (relay, local) = start_local(remote, transport(1_000, 5)).await;

    let scripted = tokio::spawn(async move {
        let mut payload = Vec::new();
        let mut chunks = 0;

        while payload.len() < b"onetwothree".len() {
            let (message, from) = recv_forward(&fake_remote).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            // Nothing new may arrive while this chunk is unacknowledged.
            let mut buf = [0u8; 2048];
            while let Ok((n, _)) = fake_remote.try_recv_from(&mut buf) {
                assert_eq!(&buf[..4], message.id.as_bytes(), "pipelined chunk ({} bytes)", n);
            }

            payload.extend_from_slice(&message.payload);
            chunks += 1;
            fake_remote.send_to(message.id.as_bytes(), from).await.unwrap();
        }
        (payload, chunks)
    });

    let destination: SocketAddr = "10.1.2.3:9".parse().unwrap();
    let mut app = socks_connect(local, destination).await;
    app.write_all(b"one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    app.write_all(b"two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    app.write_all(b"three").await.unwrap();

    let (payload, chunks) = timeout(TEST_TIMEOUT, scripted).await.unwrap().unwrap();
    assert_eq!(payload, b"onetwothree");
    assert!(chunks >= 2, "the first chunk is sent alone");

    relay.shutdown();
}

#[tokio::test]
async fn retransmission_recovers_lost_forward() {
    init_tracing();

    let fake_remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = fake_remote.local_addr().unwrap();
    let (relay, local) = start_local(remote, transport(100, 5)).await;

    let scripted = tokio::spawn(async move {
        // The first copy is "lost".
        let (first, _) = recv_forward(&fake_remote).await;
        let (second, from) = recv_forward(&fake_remote).await;
        assert_eq!(first, second, "retransmission repeats the message exactly");
        assert_eq!(second.destination.to_string(), "93.184.216.34:7");

        fake_remote.send_to(second.id.as_bytes(), from).await.unwrap();

        let mut response = second.id.as_bytes().to_vec();
        response.extend_from_slice(b"pong");
        fake_remote.send_to(&response, from).await.unwrap();

        // The local side acknowledges the response.
        let mut buf = [0u8; 64];
        let (n, _) = timeout(TEST_TIMEOUT, fake_remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], second.id.as_bytes());
    });

    let destination: SocketAddr = "93.184.216.34:7".parse().unwrap();
    let mut app = socks_connect(local, destination).await;
    app.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(TEST_TIMEOUT, app.read_exact(&mut reply))
        .await
        .expect("response")
        .unwrap();
    assert_eq!(&reply, b"pong");
    scripted.await.unwrap();

    let stats = relay.sessions().all_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].retransmissions, 1);

    relay.shutdown();
}

#[tokio::test]
async fn unreachable_remote_closes_application_connection() {
    init_tracing();

    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (relay, local) = start_local(silent.local_addr().unwrap(), transport(30, 3)).await;

    let destination: SocketAddr = "10.9.9.9:9".parse().unwrap();
    let mut app = socks_connect(local, destination).await;
    app.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, app.read(&mut buf))
        .await
        .expect("connection should close")
        .unwrap_or(0);
    assert_eq!(n, 0);

    wait_for_sessions_closed(&relay).await;
    assert_eq!(relay.pool().leased_count(), 0);

    relay.shutdown();
}
