//! Remote relay endpoint.
//!
//! One shared UDP socket serves every local endpoint:
//!
//! 1. **Demultiplexing**: a single receive loop owns the socket. Pure
//!    acknowledgments wake the matching response sender; forward messages
//!    are acknowledged at once and handed to a request task
//! 2. **Task per request**: each request is forwarded to its destination,
//!    and the reply is delivered back with stop-and-wait
//! 3. **Duplicate suppression**: a forward message already in flight is
//!    re-acknowledged but not forwarded again
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Remote Relay                          │
//! │  ┌──────────────────┐                                       │
//! │  │  Tunnel Socket   │──── ack ───▶ acks tracker ──┐         │
//! │  │  (receive loop)  │                             │ wake    │
//! │  └────────┬─────────┘                             ▼         │
//! │           │ forward                  ┌──────────────────┐   │
//! │           ▼                          │  Request Task    │   │
//! │  ┌──────────────────┐   spawn        │  forward → reply │   │
//! │  │ inflight tracker │──────────────▶ │  stop-and-wait   │   │
//! │  └──────────────────┘                └────────┬─────────┘   │
//! │                                               │             │
//! │                                               ▼             │
//! │                                    ┌──────────────────┐     │
//! │                                    │   Socket Pool    │     │
//! │                                    │  (destinations)  │     │
//! │                                    └──────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod metrics;

pub use config::{ServerConfig, DEFAULT_REMOTE_POOL_CAPACITY};
pub use metrics::{MetricsSnapshot, ServerMetrics};

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proxy::relay;
use crate::transport::{
    acknowledge, Datagram, ForwardMessage, PacketId, PendingEntry, PendingTracker, ResponseMessage,
    RetryPolicy, SocketPool, StopAndWait, MAX_DATAGRAM_SIZE,
};

/// Exchanges on the shared socket are keyed by client and identifier.
type PeerKey = (SocketAddr, PacketId);

/// Main remote relay instance.
pub struct Server {
    config: Arc<ServerConfig>,
    pool: Arc<SocketPool>,
    /// Responses awaiting acknowledgment
    acks: Arc<PendingTracker<PeerKey>>,
    /// Forward messages being served
    inflight: Arc<PendingTracker<PeerKey>>,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server, validating `config` and filling its socket pool.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let pool = SocketPool::new(config.pool.clone());
        let filled = pool.prefill()?;
        tracing::debug!("Socket pool filled with {} sockets", filled);

        Ok(Self::with_pool(config, pool))
    }

    /// Create a server around an existing socket pool.
    pub fn with_pool(config: ServerConfig, pool: Arc<SocketPool>) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            acks: Arc::new(PendingTracker::new()),
            inflight: Arc::new(PendingTracker::new()),
            metrics: Arc::new(ServerMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the configured socket and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.listen_endpoint()).await?;
        self.serve(Arc::new(socket)).await
    }

    /// Serve tunnel traffic on an already bound socket until shutdown.
    pub async fn serve(&self, socket: Arc<UdpSocket>) -> Result<()> {
        let local = socket.local_addr()?;
        tracing::info!(
            "Remote relay listening on {} (destinations over {:?})",
            local,
            self.config.destination_transport
        );

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                received = socket.recv_from(&mut buf) => Some(received),
            };

            let (n, from) = match received {
                None => {
                    tracing::info!("Remote relay on {} shutting down", local);
                    return Ok(());
                }
                Some(Ok(received)) => received,
                Some(Err(e)) => {
                    tracing::warn!("Receive error: {}", e);
                    continue;
                }
            };

            self.metrics.increment_datagrams();
            self.handle_datagram(&socket, Bytes::copy_from_slice(&buf[..n]), from)
                .await;
        }
    }

    async fn handle_datagram(&self, socket: &Arc<UdpSocket>, data: Bytes, from: SocketAddr) {
        let (id, body) = match Datagram::parse(data) {
            Ok(Datagram::Ack(id)) => {
                if !self.acks.resolve_ack(&(from, id)) {
                    tracing::trace!("Stale ack for {} from {}", id, from);
                }
                return;
            }
            Ok(Datagram::Data { id, body }) => (id, body),
            Err(e) => {
                self.metrics.increment_malformed();
                tracing::warn!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        // Unparsable messages are never acknowledged.
        let message = match ForwardMessage::decode_body(id, body) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.increment_malformed();
                tracing::warn!("Dropping forward {} from {}: {}", id, from, e);
                return;
            }
        };

        if let Err(e) = acknowledge(socket, from, id).await {
            tracing::warn!("Cannot acknowledge {} to {}: {}", id, from, e);
            return;
        }
        self.metrics.increment_acks();

        let key = (from, id);
        if self
            .inflight
            .register(key, PendingEntry::new(id, message.payload.clone()))
            .is_err()
        {
            self.metrics.increment_duplicates();
            tracing::debug!("Forward {} from {} already in flight", id, from);
            return;
        }

        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        let socket = Arc::clone(socket);
        let acks = Arc::clone(&self.acks);
        let inflight = Arc::clone(&self.inflight);
        let metrics = Arc::clone(&self.metrics);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let result = Self::handle_request(
                &config,
                &pool,
                &socket,
                &acks,
                &metrics,
                &shutdown,
                message,
                from,
            )
            .await;

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    tracing::debug!("Request {} from {} cancelled", id, from)
                }
                Err(e) => {
                    metrics.increment_abandoned();
                    tracing::warn!("Abandoned request {} from {}: {}", id, from, e);
                }
            }

            inflight.retire(&key);
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request(
        config: &ServerConfig,
        pool: &Arc<SocketPool>,
        socket: &UdpSocket,
        acks: &PendingTracker<PeerKey>,
        metrics: &ServerMetrics,
        shutdown: &CancellationToken,
        message: ForwardMessage,
        client: SocketAddr,
    ) -> Result<()> {
        let transport = &config.transport;
        let id = message.id;

        tracing::debug!(
            "Forwarding {} ({} bytes) to {}",
            id,
            message.payload.len(),
            message.destination
        );
        metrics.record_forwarded(message.payload.len() as u64);

        let reply = relay::forward(
            pool,
            config.destination_transport,
            &message.destination,
            &message.payload,
            transport.retransmission_timeout(),
            transport.buffer_size,
        )
        .await?;

        let reply_len = reply.len() as u64;
        let response = ResponseMessage::new(id, reply)?;

        let delivery = StopAndWait::new(socket, acks, RetryPolicy::from(transport), shutdown)
            .send(client, (client, id), id, response.encode())
            .await?;

        metrics.record_delivered(reply_len, delivery.retransmissions() as u64);
        Ok(())
    }

    /// Stop serving and cancel outstanding deliveries.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Forward messages currently being served.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Destination socket pool.
    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::transport::{Destination, PoolConfig, PortRange, TransportConfig};

    fn test_config(rto_ms: u64) -> ServerConfig {
        let mut config = ServerConfig::new("127.0.0.1", 0);
        config.transport = TransportConfig {
            buffer_size: 1024,
            retransmission_timeout_ms: rto_ms,
            max_attempts: 4,
        };
        config.pool = PoolConfig {
            capacity: 2,
            bind_ip: "127.0.0.1".parse().unwrap(),
            port_range: PortRange::EPHEMERAL,
        };
        config
    }

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new(config).unwrap());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(socket).await });
        (server, addr)
    }

    fn forward_to(id: PacketId, target: SocketAddr, payload: &'static [u8]) -> Bytes {
        let destination = Destination::new(target.ip().to_string(), target.port()).unwrap();
        ForwardMessage::new(id, destination, payload).encode()
    }

    async fn recv(socket: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_malformed_datagram_not_acknowledged() {
        let (server, addr) = start(test_config(200)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"abcdno delimiters here", addr).await.unwrap();
        client.send_to(b"ab", addr).await.unwrap();
        client.send_to(b"abcdhost|notaport:x", addr).await.unwrap();
        assert!(recv(&client, Duration::from_millis(300)).await.is_none());
        assert_eq!(server.metrics().malformed_dropped(), 3);

        // Still serving afterwards.
        let id = PacketId::new(*b"live");
        client
            .send_to(&forward_to(id, silent.local_addr().unwrap(), b"x"), addr)
            .await
            .unwrap();
        let ack = recv(&client, Duration::from_secs(2)).await.unwrap();
        assert_eq!(ack, b"live");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_reacked_and_forwarded_once() {
        let (server, addr) = start(test_config(500)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();

        let counting = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = destination.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
            tokio::time::sleep(Duration::from_millis(100)).await;
            destination.send_to(b"world", from).await.unwrap();

            // No second copy reaches the destination.
            let extra =
                tokio::time::timeout(Duration::from_millis(300), destination.recv_from(&mut buf))
                    .await;
            extra.is_err()
        });

        let id = PacketId::new(*b"dup1");
        let forward = forward_to(id, dest_addr, b"hello");
        client.send_to(&forward, addr).await.unwrap();
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"dup1");
        client.send_to(&forward, addr).await.unwrap();
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"dup1");

        let response = recv(&client, Duration::from_secs(2)).await.unwrap();
        assert_eq!(response, b"dup1world");
        client.send_to(id.as_bytes(), addr).await.unwrap();

        assert!(counting.await.unwrap(), "duplicate must not be forwarded");
        assert_eq!(server.metrics().duplicate_requests(), 1);
        assert_eq!(server.metrics().responses_delivered(), 1);
        assert_eq!(server.inflight_count(), 0);
        assert_eq!(server.pool().leased_count(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_destination_timeout_abandons_request() {
        let (server, addr) = start(test_config(50)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let id = PacketId::new(*b"tout");
        client
            .send_to(&forward_to(id, silent.local_addr().unwrap(), b"?"), addr)
            .await
            .unwrap();
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"tout");

        // No response follows an expired destination wait.
        assert!(recv(&client, Duration::from_millis(300)).await.is_none());
        assert_eq!(server.metrics().requests_abandoned(), 1);
        assert_eq!(server.inflight_count(), 0);
        assert_eq!(server.pool().leased_count(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_response_retransmitted_until_acked() {
        let (server, addr) = start(test_config(100)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = destination.recv_from(&mut buf).await.unwrap();
            destination.send_to(b"pong", from).await.unwrap();
        });

        let id = PacketId::new(*b"rtx1");
        client
            .send_to(&forward_to(id, dest_addr, b"ping"), addr)
            .await
            .unwrap();
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"rtx1");

        // Ignore the first copy, acknowledge the second.
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"rtx1pong");
        assert_eq!(recv(&client, Duration::from_secs(2)).await.unwrap(), b"rtx1pong");
        client.send_to(id.as_bytes(), addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.responses_delivered, 1);
        assert_eq!(snapshot.retransmissions, 1);

        server.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config(100);
        config.transport.max_attempts = 0;
        assert!(matches!(Server::new(config), Err(Error::Config(_))));
    }
}
