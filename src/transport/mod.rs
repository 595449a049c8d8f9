//! Reliable message transport over UDP.
//!
//! This module provides the tunnel protocol shared by both relay endpoints:
//!
//! 1. **Framing**: 4-byte identifiers, forward/response/ack encodings
//!
//! 2. **Stop-and-wait ARQ**: one outstanding message per exchange,
//!    retransmitted at a fixed interval until acknowledged or abandoned
//!
//! 3. **Pending bookkeeping**: identifier → entry maps correlating
//!    acknowledgments and responses with their requests
//!
//! 4. **Socket pooling**: leased UDP sockets reused across flows
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │        Session / Remote request task           │
//! ├────────────────────────────────────────────────┤
//! │  Reliability (StopAndWait, acknowledge)        │
//! ├────────────────────────────────────────────────┤
//! │  Tracker (PendingTracker: acks, requests)      │
//! ├────────────────────────────────────────────────┤
//! │  Packet (PacketId, Forward/Response, Datagram) │
//! ├────────────────────────────────────────────────┤
//! │  Pool (SocketPool → PooledSocket)              │
//! └────────────────────────────────────────────────┘
//! ```

mod packet;
mod pool;
mod reliability;
mod tracker;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use packet::{
    Datagram, Destination, ForwardMessage, PacketId, ResponseMessage, HOST_DELIMITER, ID_LEN,
    PORT_DELIMITER,
};
pub use pool::{PoolConfig, PooledSocket, PortRange, SocketPool, BIND_ATTEMPTS, DEFAULT_POOL_CAPACITY};
pub use reliability::{acknowledge, Delivery, RetryPolicy, StopAndWait};
pub use tracker::{PendingEntry, PendingTracker};

/// Default application read / destination receive size
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default retransmission timeout (milliseconds)
pub const DEFAULT_RTO_MS: u64 = 5_000;

/// Default transmissions per message before abandoning it
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Worst-case forward header: id + 255-byte host + '|' + "65535" + ':'
pub const MAX_FORWARD_OVERHEAD: usize = ID_LEN + 255 + 1 + 5 + 1;

/// Largest chunk that still fits one forward datagram
pub const MAX_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE - MAX_FORWARD_OVERHEAD;

/// Transport configuration shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes read from the application or destination at a time
    pub buffer_size: usize,
    /// Wait for an acknowledgment (and for a destination reply)
    pub retransmission_timeout_ms: u64,
    /// Transmissions per message before it is abandoned
    pub max_attempts: u32,
}

impl TransportConfig {
    /// Retransmission timeout as a duration.
    pub fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmission_timeout_ms)
    }

    /// Receive buffer large enough for any tunnel datagram carrying a chunk.
    pub fn datagram_capacity(&self) -> usize {
        self.buffer_size + MAX_FORWARD_OVERHEAD
    }

    /// How long a request may wait for its response before it is forgotten.
    ///
    /// Covers the remote side's destination wait plus its full retry budget.
    pub fn response_ttl(&self) -> Duration {
        self.retransmission_timeout() * (self.max_attempts + 2)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be positive".into());
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(format!("buffer_size cannot exceed {}", MAX_BUFFER_SIZE));
        }
        if self.retransmission_timeout_ms == 0 {
            return Err("retransmission_timeout_ms must be positive".into());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            retransmission_timeout_ms: DEFAULT_RTO_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
