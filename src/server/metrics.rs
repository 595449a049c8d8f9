//! Remote endpoint metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Remote endpoint metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Datagrams read from the tunnel socket
    datagrams_received: AtomicU64,
    /// Datagrams dropped without an acknowledgment
    malformed_dropped: AtomicU64,
    /// Forward messages received again while still in flight
    duplicate_requests: AtomicU64,
    /// Acknowledgments sent for forward messages
    acks_sent: AtomicU64,
    /// Payloads handed to destinations
    requests_forwarded: AtomicU64,
    /// Responses acknowledged by the local endpoint
    responses_delivered: AtomicU64,
    /// Requests given up on (destination timeout, empty reply, no ack)
    requests_abandoned: AtomicU64,
    /// Response retransmissions
    retransmissions: AtomicU64,
    /// Payload bytes sent to destinations
    bytes_forwarded: AtomicU64,
    /// Response bytes delivered to the local endpoint
    bytes_returned: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams_received: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            duplicate_requests: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            requests_forwarded: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            requests_abandoned: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            bytes_returned: AtomicU64::new(0),
        }
    }

    /// Count a datagram read from the tunnel socket.
    pub fn increment_datagrams(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a datagram dropped without an acknowledgment.
    pub fn increment_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a duplicate forward message.
    pub fn increment_duplicates(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an acknowledgment sent.
    pub fn increment_acks(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a payload handed to its destination.
    pub fn record_forwarded(&self, bytes: u64) {
        self.requests_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a response the local endpoint acknowledged.
    pub fn record_delivered(&self, bytes: u64, retransmissions: u64) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_returned.fetch_add(bytes, Ordering::Relaxed);
        self.retransmissions
            .fetch_add(retransmissions, Ordering::Relaxed);
    }

    /// Count an abandoned request.
    pub fn increment_abandoned(&self) {
        self.requests_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get datagrams received.
    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received.load(Ordering::Relaxed)
    }

    /// Get malformed datagrams dropped.
    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped.load(Ordering::Relaxed)
    }

    /// Get duplicate forward messages.
    pub fn duplicate_requests(&self) -> u64 {
        self.duplicate_requests.load(Ordering::Relaxed)
    }

    /// Get requests forwarded.
    pub fn requests_forwarded(&self) -> u64 {
        self.requests_forwarded.load(Ordering::Relaxed)
    }

    /// Get responses delivered.
    pub fn responses_delivered(&self) -> u64 {
        self.responses_delivered.load(Ordering::Relaxed)
    }

    /// Get requests abandoned.
    pub fn requests_abandoned(&self) -> u64 {
        self.requests_abandoned.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            datagrams_received: self.datagrams_received(),
            malformed_dropped: self.malformed_dropped(),
            duplicate_requests: self.duplicate_requests(),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            requests_forwarded: self.requests_forwarded(),
            responses_delivered: self.responses_delivered(),
            requests_abandoned: self.requests_abandoned(),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            bytes_returned: self.bytes_returned.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Remote Relay Metrics
====================
Uptime: {} seconds

Datagrams:
  Received:   {}
  Malformed:  {}
  Duplicates: {}
  Acks Sent:  {}

Requests:
  Forwarded:  {}
  Delivered:  {}
  Abandoned:  {}
  Retransmissions: {}

Traffic:
  Forwarded: {} bytes
  Returned:  {} bytes
"#,
            snapshot.uptime_secs,
            snapshot.datagrams_received,
            snapshot.malformed_dropped,
            snapshot.duplicate_requests,
            snapshot.acks_sent,
            snapshot.requests_forwarded,
            snapshot.responses_delivered,
            snapshot.requests_abandoned,
            snapshot.retransmissions,
            snapshot.bytes_forwarded,
            snapshot.bytes_returned,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Datagrams read from the relay socket
    pub datagrams_received: u64,
    /// Datagrams dropped as malformed, never acknowledged
    pub malformed_dropped: u64,
    /// Forwards suppressed while already in flight
    pub duplicate_requests: u64,
    /// Acknowledgments sent
    pub acks_sent: u64,
    /// Requests handed to a destination
    pub requests_forwarded: u64,
    /// Responses acknowledged by the local relay
    pub responses_delivered: u64,
    /// Requests that timed out, failed or ran out of retries
    pub requests_abandoned: u64,
    /// Response retransmissions
    pub retransmissions: u64,
    /// Payload bytes sent to destinations
    pub bytes_forwarded: u64,
    /// Response bytes delivered back
    pub bytes_returned: u64,
}

impl MetricsSnapshot {
    /// Fraction of forwarded requests whose response was delivered.
    pub fn delivery_rate(&self) -> f64 {
        if self.requests_forwarded == 0 {
            0.0
        } else {
            self.responses_delivered as f64 / self.requests_forwarded as f64
        }
    }

    /// Average retransmissions per delivered response.
    pub fn retransmission_ratio(&self) -> f64 {
        if self.responses_delivered == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.responses_delivered as f64
        }
    }
}
