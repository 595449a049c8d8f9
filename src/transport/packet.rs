//! Packet framing and serialization.
//!
//! Defines the wire format for tunnel datagrams. Every datagram starts with a
//! 4-byte identifier; what follows decides its kind:
//!
//! ```text
//! Forward  (local → remote): │ id (4) │ host │ '|' │ port │ ':' │ payload │
//! Response (remote → local): │ id (4) │ payload (non-empty)             │
//! Ack      (either way):     │ id (4) │
//! ```
//!
//! Host and port travel as text once per message, so the remote side keeps
//! no per-identifier destination state.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Identifier length in bytes
pub const ID_LEN: usize = 4;

/// Separates host from port in a forward message
pub const HOST_DELIMITER: u8 = b'|';

/// Separates port from payload in a forward message
pub const PORT_DELIMITER: u8 = b':';

/// Opaque 4-byte token correlating a message with its acknowledgment.
///
/// Uniqueness only matters while the identifier is outstanding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId([u8; ID_LEN]);

impl PacketId {
    /// Wrap raw identifier bytes.
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Read the identifier from the front of a datagram.
    pub fn from_prefix(data: &[u8]) -> Result<Self> {
        if data.len() < ID_LEN {
            return Err(Error::Buffer {
                expected: ID_LEN,
                actual: data.len(),
            });
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&data[..ID_LEN]);
        Ok(Self(id))
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Encode the acknowledgment for this identifier.
    pub fn ack(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", self)
    }
}

/// Destination carried inside a forward message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Create a destination. The host must be non-empty and free of `|`.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::invalid("empty destination host"));
        }
        if host.as_bytes().contains(&HOST_DELIMITER) {
            return Err(Error::invalid(format!("destination host contains '|': {}", host)));
        }
        Ok(Self { host, port })
    }

    /// Destination host as text.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<std::net::SocketAddrV4> for Destination {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A local → remote message: identifier, destination and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardMessage {
    /// Identifier assigned by the local side
    pub id: PacketId,
    /// Where the remote side should deliver the payload
    pub destination: Destination,
    /// Opaque application bytes
    pub payload: Bytes,
}

impl ForwardMessage {
    /// Create a new forward message.
    pub fn new(id: PacketId, destination: Destination, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            destination,
            payload: payload.into(),
        }
    }

    /// Serialize the message to bytes.
    pub fn encode(&self) -> Bytes {
        let port = self.destination.port.to_string();
        let mut buf = BytesMut::with_capacity(
            ID_LEN + self.destination.host.len() + port.len() + 2 + self.payload.len(),
        );

        buf.put_slice(&self.id.0);
        buf.put_slice(self.destination.host.as_bytes());
        buf.put_u8(HOST_DELIMITER);
        buf.put_slice(port.as_bytes());
        buf.put_u8(PORT_DELIMITER);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Deserialize a full forward datagram.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let id = PacketId::from_prefix(&data)?;
        let body = data.split_off(ID_LEN);
        Self::decode_body(id, body)
    }

    /// Deserialize the part of a forward datagram after its identifier.
    pub fn decode_body(id: PacketId, mut body: Bytes) -> Result<Self> {
        let host_end = body
            .iter()
            .position(|&b| b == HOST_DELIMITER)
            .ok_or_else(|| Error::invalid("missing host delimiter"))?;
        let host = body.split_to(host_end);
        body = body.split_off(1);

        let port_end = body
            .iter()
            .position(|&b| b == PORT_DELIMITER)
            .ok_or_else(|| Error::invalid("missing port delimiter"))?;
        let port = body.split_to(port_end);
        let payload = body.split_off(1);

        let host = std::str::from_utf8(&host)
            .map_err(|_| Error::invalid("destination host is not UTF-8"))?;
        let port = std::str::from_utf8(&port)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                Error::invalid(format!("unparseable port: {:?}", String::from_utf8_lossy(&port)))
            })?;

        Ok(Self {
            id,
            destination: Destination::new(host, port)?,
            payload,
        })
    }
}

/// A remote → local message carrying the destination's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    /// Identifier of the forward message this answers
    pub id: PacketId,
    /// Destination reply bytes
    pub payload: Bytes,
}

impl ResponseMessage {
    /// Create a response. An empty payload would be read back as an
    /// acknowledgment, so it is rejected.
    pub fn new(id: PacketId, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.is_empty() {
            return Err(Error::invalid(format!(
                "empty response for {} is indistinguishable from an ack",
                id
            )));
        }
        Ok(Self { id, payload })
    }

    /// Serialize the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ID_LEN + self.payload.len());
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A received tunnel datagram, classified by its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Exactly the 4-byte identifier
    Ack(PacketId),
    /// Identifier followed by a non-empty remainder
    Data {
        /// Identifier to acknowledge
        id: PacketId,
        /// Everything after the identifier
        body: Bytes,
    },
}

impl Datagram {
    /// Split a datagram into identifier and remainder.
    pub fn parse(mut data: Bytes) -> Result<Self> {
        let id = PacketId::from_prefix(&data)?;
        let body = data.split_off(ID_LEN);

        if body.is_empty() {
            Ok(Datagram::Ack(id))
        } else {
            Ok(Datagram::Data { id, body })
        }
    }

    /// Identifier of the datagram.
    pub fn id(&self) -> PacketId {
        match self {
            Datagram::Ack(id) | Datagram::Data { id, .. } => *id,
        }
    }
}
