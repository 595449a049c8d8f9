//! SOCKS5 front end and local relay endpoint.
//!
//! Listens on a local port, accepts SOCKS5 CONNECT requests, and carries
//! each connection's bytes to the remote relay over the reliable UDP
//! transport. Only the no-auth method, the CONNECT command and IPv4
//! addresses are understood.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::proxy::config::LocalConfig;
use crate::proxy::session::{Session, SessionManager, SessionState};
use crate::transport::{Destination, PoolConfig, SocketPool, TransportConfig};

/// Protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;
/// "No authentication required"
pub const METHOD_NO_AUTH: u8 = 0x00;
/// "No acceptable methods"
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;
/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;

/// Reply: succeeded
pub const REP_SUCCEEDED: u8 = 0x00;
/// Reply: general SOCKS server failure
pub const REP_GENERAL_FAILURE: u8 = 0x01;
/// Reply: command not supported
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
/// Reply: address type not supported
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Read the method negotiation and select "no authentication".
///
/// Replies `05 FF` and fails when the client does not offer no-auth.
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!("unsupported version {:#04x}", header[0])));
    }
    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(Error::handshake("no authentication methods offered"));
    }

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(Error::Unsupported("client requires authentication".into()));
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read a CONNECT request and return its IPv4 destination.
///
/// Other commands and address types get their error reply before failing.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<SocketAddrV4>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;

    if req[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!("unsupported version {:#04x}", req[0])));
    }

    if req[1] != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_NOT_SUPPORTED, unspecified()).await?;
        return Err(Error::Unsupported(format!("command {:#04x}", req[1])));
    }

    if req[3] != ATYP_IPV4 {
        write_reply(stream, REP_ADDRESS_NOT_SUPPORTED, unspecified()).await?;
        return Err(Error::Unsupported(format!("address type {:#04x}", req[3])));
    }

    let mut ip_port = [0u8; 6];
    stream.read_exact(&mut ip_port).await?;

    let ip = Ipv4Addr::new(ip_port[0], ip_port[1], ip_port[2], ip_port[3]);
    let port = u16::from_be_bytes([ip_port[4], ip_port[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Write a reply carrying `bound` as BND.ADDR/BND.PORT.
pub async fn write_reply<S>(stream: &mut S, rep: u8, bound: SocketAddrV4) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = [0u8; 10];
    reply[..4].copy_from_slice(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4]);
    reply[4..8].copy_from_slice(&bound.ip().octets());
    reply[8..].copy_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await?;
    Ok(())
}

fn unspecified() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

/// The local relay endpoint.
pub struct LocalRelay {
    config: Arc<LocalConfig>,
    pool: Arc<SocketPool>,
    sessions: Arc<SessionManager>,
    remote: SocketAddr,
}

impl LocalRelay {
    /// Validate `config`, resolve the remote relay and fill the socket pool.
    pub async fn new(config: LocalConfig) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let endpoint = config.remote_endpoint();
        let remote = tokio::net::lookup_host(&endpoint)
            .await?
            .next()
            .ok_or_else(|| Error::config(format!("remote {} did not resolve", endpoint)))?;

        let pool = SocketPool::new(config.pool.clone());
        let filled = pool.prefill()?;
        tracing::debug!("Socket pool filled with {} sockets", filled);

        Ok(Self {
            config: Arc::new(config),
            pool,
            sessions: Arc::new(SessionManager::new()),
            remote,
        })
    }

    /// Bind the configured listener and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_endpoint()).await?;
        self.serve(listener).await
    }

    /// Serve SOCKS5 clients from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        let bound = match local {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()),
        };
        let shutdown = self.sessions.shutdown_token();

        tracing::info!("SOCKS5 relay listening on {}, remote relay {}", local, self.remote);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };

            let (stream, peer) = match accepted {
                None => {
                    tracing::info!("SOCKS5 relay on {} shutting down", local);
                    return Ok(());
                }
                Some(Ok(conn)) => conn,
                Some(Err(e)) => {
                    tracing::warn!("Accept error: {}", e);
                    continue;
                }
            };

            let session = self.sessions.create_session(peer);
            let sessions = Arc::clone(&self.sessions);
            let pool = Arc::clone(&self.pool);
            let config = Arc::clone(&self.config);
            let remote = self.remote;

            tokio::spawn(async move {
                tracing::info!("Session {} opened for {}", session.id(), peer);

                match handle_client(&session, stream, bound, &pool, remote, &config.transport).await {
                    Ok(()) => tracing::info!("Session {} closed", session.id()),
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!("Session {} ended: {}", session.id(), e)
                    }
                    Err(e) => tracing::debug!("Session {} error: {}", session.id(), e),
                }

                sessions.remove(session.id());
            });
        }
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Session socket pool.
    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    /// Pool settings in use.
    pub fn pool_config(&self) -> &PoolConfig {
        self.pool.config()
    }

    /// Resolved remote relay address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Stop accepting and cancel every session.
    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }
}

/// Handle a single SOCKS5 client connection.
async fn handle_client(
    session: &Arc<Session>,
    mut stream: TcpStream,
    bound: SocketAddrV4,
    pool: &Arc<SocketPool>,
    remote: SocketAddr,
    transport: &TransportConfig,
) -> Result<()> {
    stream.set_nodelay(true)?;

    negotiate(&mut stream).await?;
    session.set_state(SessionState::AwaitRequest);

    let target = read_connect_request(&mut stream).await?;

    let socket = match pool.acquire() {
        Ok(socket) => socket,
        Err(e) => {
            write_reply(&mut stream, REP_GENERAL_FAILURE, unspecified()).await?;
            return Err(e);
        }
    };
    write_reply(&mut stream, REP_SUCCEEDED, bound).await?;

    let destination = Destination::from(target);
    tracing::debug!(
        "Session {} relaying to {} from port {}",
        session.id(),
        destination,
        socket.local_addr()?.port()
    );

    session
        .relay(stream, socket, destination, remote, transport)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_selects_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();

        negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_auth_only_client() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_wrong_version() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_negotiate_truncated_greeting() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05]).await.unwrap();
        drop(client);

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_connect_request_ipv4() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x07])
            .await
            .unwrap();

        let target = read_connect_request(&mut server).await.unwrap();
        assert_eq!(target, "93.184.216.34:7".parse().unwrap());
    }

    #[tokio::test]
    async fn test_bind_command_unsupported() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, REP_COMMAND_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_domain_address_unsupported() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 11])
            .await
            .unwrap();
        client.write_all(b"example.com\x00\x50").await.unwrap();

        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, REP_ADDRESS_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_success_reply_layout() {
        let (mut client, mut server) = duplex(64);
        write_reply(&mut server, REP_SUCCEEDED, "127.0.0.1:1080".parse().unwrap())
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);
    }

    #[tokio::test]
    async fn test_relay_rejects_invalid_config() {
        let mut config = LocalConfig::new("127.0.0.1", 10000);
        config.transport.buffer_size = 0;

        let err = LocalRelay::new(config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let mut config = LocalConfig::new("127.0.0.1", 10000);
        config.pool = PoolConfig {
            capacity: 1,
            bind_ip: "127.0.0.1".parse().unwrap(),
            port_range: crate::transport::PortRange::EPHEMERAL,
        };
        let relay = Arc::new(LocalRelay::new(config).await.unwrap());
        assert_eq!(relay.pool().idle_count(), 1);
        assert_eq!(relay.remote_addr(), "127.0.0.1:10000".parse().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.serve(listener).await })
        };

        relay.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
