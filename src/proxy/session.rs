//! Per-connection session management.
//!
//! A session owns one leased UDP socket and the two trackers correlating its
//! traffic: `acks` for forward messages awaiting acknowledgment and
//! `requests` for forward messages awaiting a response. The socket has a
//! single reader, the session listener, which feeds both. Matched responses
//! go through a channel to a separate writer task, so a slow application
//! never stalls acknowledgments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::transport::{
    acknowledge, Datagram, Destination, ForwardMessage, PacketId, PendingEntry, PendingTracker,
    PooledSocket, RetryPolicy, StopAndWait, TransportConfig,
};

/// Unique session identifier.
pub type SessionId = u64;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the SOCKS5 method negotiation
    AwaitHandshake,
    /// Waiting for the CONNECT request
    AwaitRequest,
    /// Carrying application bytes through the tunnel
    Relaying,
    /// Torn down
    Closed,
}

/// A single application connection.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    created_at: Instant,
    state: Mutex<SessionState>,
    destination: Mutex<Option<Destination>>,
    /// Forward messages awaiting acknowledgment
    acks: PendingTracker<PacketId>,
    /// Forward messages awaiting a response
    requests: PendingTracker<PacketId>,
    cancel: CancellationToken,
    chunks_sent: AtomicU64,
    retransmissions: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Session {
    fn new(id: SessionId, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer_addr,
            created_at: Instant::now(),
            state: Mutex::new(SessionState::AwaitHandshake),
            destination: Mutex::new(None),
            acks: PendingTracker::new(),
            requests: PendingTracker::new(),
            cancel,
            chunks_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to a new state.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Application peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Destination requested by CONNECT, once known.
    pub fn destination(&self) -> Option<Destination> {
        self.destination.lock().clone()
    }

    /// Token cancelled when the session tears down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop retransmissions and the listener.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Relay application bytes through the tunnel until either side ends.
    ///
    /// Each chunk read from `client` becomes one forward message, delivered
    /// with stop-and-wait before the next chunk is read. Responses arrive on
    /// a listener task and reach `client` through a writer task. Both are
    /// joined and `socket` released before this returns.
    pub async fn relay<S>(
        self: &Arc<Self>,
        client: S,
        socket: PooledSocket,
        destination: Destination,
        remote: SocketAddr,
        config: &TransportConfig,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        *self.destination.lock() = Some(destination.clone());
        self.set_state(SessionState::Relaying);

        let socket = Arc::new(socket);
        let (mut reader, writer) = tokio::io::split(client);
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();

        let delivery = tokio::spawn(Arc::clone(self).deliver(responses_rx, writer));
        let listener = tokio::spawn(Arc::clone(self).listen(
            Arc::clone(&socket),
            responses_tx,
            remote,
            config.datagram_capacity(),
        ));

        let result = self
            .pump(&mut reader, &socket, &destination, remote, config)
            .await;

        self.cancel();
        for (task, handle) in [("listener", listener), ("writer", delivery)] {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Session {} {} error: {}", self.id, task, e),
                Err(e) => tracing::warn!("Session {} {} panicked: {}", self.id, task, e),
            }
        }
        self.set_state(SessionState::Closed);

        result
    }

    /// Read chunks from the application and deliver each one reliably.
    async fn pump<R>(
        &self,
        reader: &mut R,
        socket: &PooledSocket,
        destination: &Destination,
        remote: SocketAddr,
        config: &TransportConfig,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let sender = StopAndWait::new(socket, &self.acks, RetryPolicy::from(config), &self.cancel);
        let mut buf = vec![0u8; config.buffer_size];

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                tracing::debug!("Session {} reached end of stream", self.id);
                return Ok(());
            }

            let expired = self.requests.purge_older_than(config.response_ttl());
            if expired > 0 {
                tracing::debug!("Session {} forgot {} unanswered requests", self.id, expired);
            }

            let id = self.next_packet_id();
            let message =
                ForwardMessage::new(id, destination.clone(), Bytes::copy_from_slice(&buf[..n]))
                    .encode();
            self.requests.register(id, PendingEntry::new(id, message.clone()))?;

            match sender.send(remote, id, id, message).await {
                Ok(delivery) => {
                    self.chunks_sent.fetch_add(1, Ordering::Relaxed);
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    self.retransmissions
                        .fetch_add(delivery.retransmissions() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.requests.retire(&id);
                    return Err(e);
                }
            }
        }
    }

    /// Sole reader of the session socket.
    ///
    /// Acknowledgments wake the pump; responses are acknowledged, matched
    /// against outstanding requests and queued for the writer. Never waits
    /// on the application.
    async fn listen(
        self: Arc<Self>,
        socket: Arc<PooledSocket>,
        responses: mpsc::UnboundedSender<Bytes>,
        remote: SocketAddr,
        capacity: usize,
    ) -> Result<()> {
        let result = self.dispatch(&socket, &responses, remote, capacity).await;
        if result.is_err() {
            // Nobody can deliver responses any more.
            self.cancel();
        }
        result
    }

    async fn dispatch(
        &self,
        socket: &PooledSocket,
        responses: &mpsc::UnboundedSender<Bytes>,
        remote: SocketAddr,
        capacity: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; capacity];

        loop {
            let (n, from) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => received?,
            };

            if from != remote {
                tracing::trace!("Session {} ignoring datagram from {}", self.id, from);
                continue;
            }

            match Datagram::parse(Bytes::copy_from_slice(&buf[..n])) {
                Ok(Datagram::Ack(id)) => {
                    if !self.acks.resolve_ack(&id) {
                        tracing::trace!("Session {} stale ack for {}", self.id, id);
                    }
                }
                Ok(Datagram::Data { id, body }) => {
                    acknowledge(socket, from, id).await?;

                    if self.requests.take(&id).is_some() {
                        if responses.send(body).is_err() {
                            // Writer is gone, the session is ending.
                            return Ok(());
                        }
                    } else {
                        tracing::debug!("Session {} dropped duplicate response {}", self.id, id);
                    }
                }
                Err(e) => {
                    tracing::debug!("Session {} dropped datagram: {}", self.id, e);
                }
            }
        }
    }

    /// Write queued responses to the application, in arrival order.
    ///
    /// Every write races the session token, so teardown never waits on an
    /// application that stopped reading.
    async fn deliver<W>(
        self: Arc<Self>,
        mut responses: mpsc::UnboundedReceiver<Bytes>,
        mut writer: W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.drain(&mut responses, &mut writer).await;
        if result.is_err() {
            self.cancel();
        }
        let _ = writer.shutdown().await;
        result
    }

    async fn drain<W>(
        &self,
        responses: &mut mpsc::UnboundedReceiver<Bytes>,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let body = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                body = responses.recv() => match body {
                    Some(body) => body,
                    None => return Ok(()),
                },
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Session {} discarding response to stalled application", self.id);
                    return Ok(());
                }
                written = writer.write_all(&body) => written?,
            }
            self.bytes_received
                .fetch_add(body.len() as u64, Ordering::Relaxed);
        }
    }

    /// Fresh identifier with no live entry in either tracker.
    fn next_packet_id(&self) -> PacketId {
        loop {
            let id = PacketId::random();
            if !self.acks.contains(&id) && !self.requests.contains(&id) {
                return id;
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            state: self.state(),
            peer_addr: self.peer_addr,
            destination: self.destination(),
            created_at: self.created_at,
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Session statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session ID
    pub id: SessionId,
    /// Current state
    pub state: SessionState,
    /// Application peer address
    pub peer_addr: SocketAddr,
    /// CONNECT destination, once known
    pub destination: Option<Destination>,
    /// When the connection was accepted
    pub created_at: Instant,
    /// Chunks acknowledged by the remote relay
    pub chunks_sent: u64,
    /// Forward retransmissions
    pub retransmissions: u64,
    /// Application bytes delivered to the remote relay
    pub bytes_sent: u64,
    /// Response bytes written to the application
    pub bytes_received: u64,
}

/// Manages all live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create and register a session.
    ///
    /// Its token is a child of the manager's, so [`SessionManager::shutdown`]
    /// reaches it.
    pub fn create_session(&self, peer_addr: SocketAddr) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, peer_addr, self.shutdown.child_token()));
        self.sessions.write().insert(id, Arc::clone(&session));
        session
    }

    /// Get a session by ID.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Mark a session closed and drop it from the registry.
    pub fn remove(&self, id: SessionId) {
        if let Some(session) = self.sessions.write().remove(&id) {
            session.cancel();
            session.set_state(SessionState::Closed);
        }
    }

    /// Get session count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Cancel every session, present and future.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Root token, cancelled by [`SessionManager::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get statistics for all sessions.
    pub fn all_stats(&self) -> Vec<SessionStats> {
        self.sessions.read().values().map(|s| s.stats()).collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
