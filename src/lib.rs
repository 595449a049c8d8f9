//! # udprelay
//!
//! A SOCKS5 relay whose two halves talk over UDP made reliable by a small
//! stop-and-wait protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//!  Application
//!      │ TCP (SOCKS5 CONNECT)
//!      ▼
//! ┌──────────────────────────┐      forward: id | host '|' port ':' payload
//! │   Local Relay Endpoint   │ ───────────────────────────────────────────▶ ┐
//! │  session per connection  │ ◀─────────────────────────────────────────── │
//! └──────────────────────────┘      ack: id        response: id | payload   │
//!                                                                            │
//!                                            ┌──────────────────────────┐    │
//!                                            │  Remote Relay Endpoint   │ ◀──┘
//!                                            │  task per request        │
//!                                            └────────────┬─────────────┘
//!                                                         │ UDP (or TCP)
//!                                                         ▼
//!                                                    Destination
//! ```
//!
//! ## Layers
//!
//! 1. [`transport`]: framing, stop-and-wait delivery, pending-message
//!    tracking and the UDP socket pool shared by both endpoints
//! 2. [`proxy`]: the SOCKS5 front end, per-connection sessions and
//!    destination forwarding
//! 3. `server`: the remote endpoint (behind the `server` feature)

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod proxy;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Default SOCKS5 listen port of the local endpoint
pub const DEFAULT_LOCAL_PORT: u16 = 1080;

/// Default tunnel port of the remote endpoint
pub const DEFAULT_REMOTE_PORT: u16 = 10000;
