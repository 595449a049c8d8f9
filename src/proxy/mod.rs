//! Application-facing relay pieces.
//!
//! Local side: a SOCKS5 listener whose sessions carry each connection's
//! bytes to the remote relay. Remote side: forwarding of decoded payloads
//! to their real destinations.

pub mod config;
pub mod relay;
pub mod session;
pub mod socks5;

pub use config::LocalConfig;
pub use relay::DestinationTransport;
pub use session::{Session, SessionId, SessionManager, SessionState, SessionStats};
pub use socks5::LocalRelay;
