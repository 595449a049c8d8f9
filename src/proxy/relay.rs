//! Destination-side forwarding.
//!
//! Delivers a decoded payload to its real destination and collects exactly
//! one reply. The destination transport is explicit configuration: tunnel
//! chunks are request/response units, and neither transport pretends to give
//! stream semantics across chunks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::transport::{Destination, SocketPool, ID_LEN, MAX_DATAGRAM_SIZE};

/// How the remote endpoint talks to destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationTransport {
    /// One datagram out, one datagram back, from a pooled socket
    #[default]
    Udp,
    /// Fresh connection per chunk: write, read once, close
    Tcp,
}

/// Largest destination reply that still fits in one response datagram.
pub const MAX_REPLY_SIZE: usize = MAX_DATAGRAM_SIZE - ID_LEN;

/// Forward `payload` to `destination` and wait for one reply.
///
/// A UDP reply is read whole, up to [`MAX_REPLY_SIZE`]; `buffer_size` bounds
/// the single TCP read. Waiting is bounded by `timeout`; expiry abandons the request with
/// [`Error::Timeout`]. Any pooled socket is returned on every path.
pub async fn forward(
    pool: &Arc<SocketPool>,
    transport: DestinationTransport,
    destination: &Destination,
    payload: &[u8],
    timeout: Duration,
    buffer_size: usize,
) -> Result<Bytes> {
    let target = resolve(destination).await?;

    match transport {
        DestinationTransport::Udp => forward_udp(pool, target, payload, timeout).await,
        DestinationTransport::Tcp => forward_tcp(target, payload, timeout, buffer_size).await,
    }
}

/// Resolve a destination to its first socket address.
pub async fn resolve(destination: &Destination) -> Result<SocketAddr> {
    tokio::net::lookup_host((destination.host(), destination.port()))
        .await?
        .next()
        .ok_or_else(|| Error::invalid(format!("destination {} did not resolve", destination)))
}

async fn forward_udp(
    pool: &Arc<SocketPool>,
    target: SocketAddr,
    payload: &[u8],
    timeout: Duration,
) -> Result<Bytes> {
    let socket = pool.acquire()?;
    socket.send_to(payload, target).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_REPLY_SIZE];

    loop {
        let (n, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))??;

        // Leftovers from an earlier lease of this socket.
        if from != target {
            tracing::trace!("Ignoring datagram from {} while waiting on {}", from, target);
            continue;
        }

        return Ok(Bytes::copy_from_slice(&buf[..n]));
    }
}

async fn forward_tcp(
    target: SocketAddr,
    payload: &[u8],
    timeout: Duration,
    buffer_size: usize,
) -> Result<Bytes> {
    let deadline = Instant::now() + timeout;
    let expired = |_| Error::Timeout(timeout.as_millis() as u64);

    let mut stream = tokio::time::timeout_at(deadline, TcpStream::connect(target))
        .await
        .map_err(expired)??;
    stream.set_nodelay(true)?;
    stream.write_all(payload).await?;

    let mut buf = vec![0u8; buffer_size];
    let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
        .await
        .map_err(expired)??;

    Ok(Bytes::copy_from_slice(&buf[..n]))
}
