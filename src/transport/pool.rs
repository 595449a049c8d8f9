//! Reusable pool of bound UDP sockets.
//!
//! Acquiring a socket for a new flow pops an idle one when available and
//! binds a fresh one otherwise, so the pool never blocks on capacity. A
//! leased socket belongs to exactly one holder until it is returned.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Random ports tried before giving up on the range.
pub const BIND_ATTEMPTS: usize = 16;

/// Default number of idle sockets kept by the local endpoint.
pub const DEFAULT_POOL_CAPACITY: usize = 50;

/// Inclusive source-port range for pool sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port (inclusive)
    pub start: u16,
    /// Last port (inclusive)
    pub end: u16,
}

impl PortRange {
    /// Let the OS assign an ephemeral port.
    pub const EPHEMERAL: PortRange = PortRange { start: 0, end: 0 };

    /// Create a range.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Whether ports are OS-assigned.
    pub fn is_ephemeral(&self) -> bool {
        *self == Self::EPHEMERAL
    }

    fn pick(&self) -> u16 {
        if self.is_ephemeral() {
            0
        } else {
            rand::thread_rng().gen_range(self.start..=self.end)
        }
    }

    /// Validate the range.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.is_ephemeral() {
            return Ok(());
        }
        if self.start == 0 {
            return Err("port_range cannot include port 0 (use 0-0 for ephemeral)".into());
        }
        if self.start > self.end {
            return Err(format!(
                "port_range start {} is after end {}",
                self.start, self.end
            ));
        }
        Ok(())
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(20000, 30000)
    }
}

/// Socket pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle sockets kept for reuse
    pub capacity: usize,
    /// Local address pool sockets bind to
    pub bind_ip: IpAddr,
    /// Source ports pool sockets bind to
    pub port_range: PortRange,
}

impl PoolConfig {
    /// Default configuration with a different capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.port_range.validate()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::default(),
        }
    }
}

/// Pool of idle UDP sockets.
///
/// The configured capacity is a cache target rather than a hard cap: an
/// empty pool binds new sockets on demand, and returned sockets beyond
/// capacity are closed.
#[derive(Debug)]
pub struct SocketPool {
    config: PoolConfig,
    idle: Mutex<Vec<UdpSocket>>,
    leased: AtomicUsize,
}

impl SocketPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(config.capacity)),
            config,
            leased: AtomicUsize::new(0),
        })
    }

    /// Bind sockets until the idle list reaches capacity.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn prefill(&self) -> Result<usize> {
        let missing = self.config.capacity.saturating_sub(self.idle_count());
        let mut fresh = Vec::with_capacity(missing);
        for _ in 0..missing {
            fresh.push(self.create_socket()?);
        }

        let mut idle = self.idle.lock();
        idle.extend(fresh);
        Ok(idle.len())
    }

    /// Lease a socket, binding a new one if none is idle.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledSocket> {
        let reused = self.idle.lock().pop();
        let socket = match reused {
            Some(socket) => socket,
            None => self.create_socket()?,
        };

        self.leased.fetch_add(1, Ordering::Relaxed);
        Ok(PooledSocket {
            socket: Some(socket),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, socket: UdpSocket) {
        self.leased.fetch_sub(1, Ordering::Relaxed);

        let mut idle = self.idle.lock();
        if idle.len() < self.config.capacity {
            idle.push(socket);
        }
    }

    fn create_socket(&self) -> Result<UdpSocket> {
        let range = self.config.port_range;

        for _ in 0..BIND_ATTEMPTS {
            let addr = SocketAddr::new(self.config.bind_ip, range.pick());
            match std::net::UdpSocket::bind(addr) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    return Ok(UdpSocket::from_std(socket)?);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && !range.is_ephemeral() => {
                    continue;
                }
                Err(e) => return Err(Error::Network(e)),
            }
        }

        Err(Error::Bind {
            start: range.start,
            end: range.end,
        })
    }

    /// Number of idle sockets.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of sockets currently leased.
    pub fn leased_count(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// A socket leased from a [`SocketPool`].
///
/// Returned to the pool when released or dropped, so every exit path of the
/// holder gives it back.
#[derive(Debug)]
pub struct PooledSocket {
    socket: Option<UdpSocket>,
    pool: Arc<SocketPool>,
}

impl PooledSocket {
    /// Return the socket to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledSocket {
    type Target = UdpSocket;

    fn deref(&self) -> &UdpSocket {
        self.socket.as_ref().expect("socket is present until drop")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.pool.release(socket);
        }
    }
}
