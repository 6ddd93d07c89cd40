//! # relay-transport
//!
//! WebSocket inbound transport for the relay.
//!
//! - [`WsInboundTransport`]: accepts connections, mints a [`WsSession`] per
//!   connection, forwards inbound envelopes to a [`MessageReceiver`] and
//!   deregisters sessions from the [`SessionRegistry`] on disconnect
//! - [`WsSession`]: reliable send; every payload is preceded by a Ping/Pong
//!   liveness round trip bounded by the configured timeout, so a silently
//!   dropped connection fails fast with `SendTimeout` instead of losing data
//! - [`InMemoryTransportService`]: registry of sessions usable as reply routes

#![deny(unsafe_code)]

pub mod config;
mod connection;
pub mod listener;
pub mod receiver;
pub mod registry;
pub mod session;

pub use config::{ListenerBinding, ListenerConfig};
pub use listener::WsInboundTransport;
pub use receiver::{BoxError, MessageReceiver, SessionRegistry};
pub use registry::InMemoryTransportService;
pub use session::{SessionState, TransportSession, WsSession};
