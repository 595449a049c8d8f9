//! Remote endpoint configuration.

use serde::{Deserialize, Serialize};

use crate::proxy::relay::DestinationTransport;
use crate::transport::{PoolConfig, TransportConfig};

/// Default socket pool capacity on the remote endpoint.
pub const DEFAULT_REMOTE_POOL_CAPACITY: usize = 10;

/// Remote relay configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// How destinations are reached
    #[serde(default)]
    pub destination_transport: DestinationTransport,
    /// Retransmission and buffer settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Destination socket pool
    #[serde(default = "default_pool")]
    pub pool: PoolConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    crate::DEFAULT_REMOTE_PORT
}

fn default_pool() -> PoolConfig {
    PoolConfig::with_capacity(DEFAULT_REMOTE_POOL_CAPACITY)
}

impl ServerConfig {
    /// Create a configuration listening on the given address.
    pub fn new(listen_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            destination_transport: DestinationTransport::default(),
            transport: TransportConfig::default(),
            pool: default_pool(),
        }
    }

    /// `host:port` of the tunnel socket.
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Invalid configuration: {}", e))
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Cannot serialize configuration: {}", e))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        self.transport.validate()?;
        self.pool.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(default_listen_addr(), default_listen_port())
    }
}
