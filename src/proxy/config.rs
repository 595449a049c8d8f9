//! Local endpoint configuration.

use serde::{Deserialize, Serialize};

use crate::transport::{PoolConfig, TransportConfig};

/// Configuration for the local (SOCKS5-facing) relay endpoint.
///
/// Read from a JSON file by `udprelay-local`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Address the SOCKS5 listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the SOCKS5 listener binds to
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Remote relay host
    pub remote_addr: String,

    /// Remote relay port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Retransmission and buffer settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session socket pool
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    crate::DEFAULT_LOCAL_PORT
}

fn default_remote_port() -> u16 {
    crate::DEFAULT_REMOTE_PORT
}

impl LocalConfig {
    /// Create a configuration pointing at a remote relay.
    pub fn new(remote_addr: impl Into<String>, remote_port: u16) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            remote_addr: remote_addr.into(),
            remote_port,
            transport: TransportConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// `host:port` of the SOCKS5 listener.
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// `host:port` of the remote relay.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        if self.remote_addr.is_empty() {
            return Err("remote_addr cannot be empty".into());
        }
        if self.remote_port == 0 {
            return Err("remote_port cannot be 0".into());
        }
        self.transport.validate()?;
        self.pool.validate()
    }
}
