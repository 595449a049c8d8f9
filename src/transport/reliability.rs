//! Stop-and-wait reliability.
//!
//! Provides reliable delivery of single messages over UDP:
//!
//! - Positive acknowledgment echoing the 4-byte identifier
//! - Fixed-interval retransmission until acknowledged
//! - A bounded number of attempts, after which the message is abandoned
//! - Cancellation through the owning session's token
//!
//! The sender never reads its socket. Whoever owns the socket's receive
//! loop feeds acknowledgments into the shared [`PendingTracker`], which wakes
//! the matching sender. Two loops therefore never compete for one socket.

use std::hash::Hash;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::tracker::{PendingEntry, PendingTracker};
use crate::transport::{PacketId, TransportConfig};

/// Retransmission schedule for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait for an acknowledgment before retransmitting
    pub timeout: Duration,
    /// Total transmissions before giving up
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts,
        }
    }

    /// Longest a message can stay unacknowledged under this policy.
    pub fn deadline(&self) -> Duration {
        self.timeout * self.max_attempts
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self::new(config.retransmission_timeout(), config.max_attempts)
    }
}

/// Outcome of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Transmissions needed, including the first
    pub attempts: u32,
}

impl Delivery {
    /// Transmissions beyond the first.
    pub fn retransmissions(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Sender half of the stop-and-wait exchange.
pub struct StopAndWait<'a, K> {
    socket: &'a UdpSocket,
    acks: &'a PendingTracker<K>,
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<'a, K> StopAndWait<'a, K>
where
    K: Eq + Hash + Copy,
{
    /// Create a sender over `socket`, matching acknowledgments in `acks`.
    pub fn new(
        socket: &'a UdpSocket,
        acks: &'a PendingTracker<K>,
        policy: RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            socket,
            acks,
            policy,
            cancel,
        }
    }

    /// Transmit `message` to `peer` until acknowledged.
    ///
    /// Registers the message under `key` for the duration of the exchange.
    /// The entry is retired by the acknowledgment on success and by this
    /// call on every failure.
    pub async fn send(
        &self,
        peer: SocketAddr,
        key: K,
        id: PacketId,
        message: Bytes,
    ) -> Result<Delivery> {
        let (entry, mut acked) = PendingEntry::awaiting(id, message.clone());
        self.acks.register(key, entry)?;

        let result = self.transmit(peer, id, &message, &mut acked).await;
        if result.is_err() {
            self.acks.retire(&key);
        }
        result
    }

    async fn transmit(
        &self,
        peer: SocketAddr,
        id: PacketId,
        message: &[u8],
        acked: &mut tokio::sync::oneshot::Receiver<()>,
    ) -> Result<Delivery> {
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tracing::debug!("Retransmitting {} to {} (attempt {})", id, peer, attempt);
            }
            self.socket.send_to(message, peer).await?;

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                waited = tokio::time::timeout(self.policy.timeout, &mut *acked) => match waited {
                    Ok(Ok(())) => {
                        tracing::debug!("Received ack for {}", id);
                        return Ok(Delivery { attempts: attempt });
                    }
                    // Entry dropped without an ack.
                    Ok(Err(_)) => return Err(Error::Cancelled),
                    // Timed out: retransmit.
                    Err(_) => {}
                },
            }
        }

        tracing::debug!("Giving up on {} after {} attempts", id, self.policy.max_attempts);
        Err(Error::RetriesExhausted {
            id,
            attempts: self.policy.max_attempts,
        })
    }
}

/// Echo the identifier alone back to `peer`.
pub async fn acknowledge(socket: &UdpSocket, peer: SocketAddr, id: PacketId) -> Result<()> {
    socket.send_to(id.as_bytes(), peer).await?;
    tracing::debug!("Sent ack for {} to {}", id, peer);
    Ok(())
}
