//! Error types for the relay.

use thiserror::Error;

use crate::transport::PacketId;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or absent SOCKS5 negotiation/request
    #[error("handshake error: {0}")]
    Handshake(String),

    /// SOCKS5 command or address type outside CONNECT/IPv4
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// Tunnel datagram that does not parse into the expected shape
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Datagram shorter than the fixed header
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Destination did not answer in time
    #[error("destination timeout after {0}ms")]
    Timeout(u64),

    /// No acknowledgment after the retry bound
    #[error("packet {id} unacknowledged after {attempts} attempts")]
    RetriesExhausted { id: PacketId, attempts: u32 },

    /// Identifier already has a live Pending Entry
    #[error("packet {0} is already outstanding")]
    DuplicateId(PacketId),

    /// No free port in the configured source range
    #[error("no bindable port in range {start}-{end}")]
    Bind { start: u16, end: u16 },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Session torn down while an operation was pending
    #[error("session cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new framing error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is a transport timeout
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::RetriesExhausted { .. })
    }

    /// Check if this error came from tunnel framing
    pub fn is_framing(&self) -> bool {
        matches!(self, Error::InvalidMessage(_) | Error::Buffer { .. })
    }
}
