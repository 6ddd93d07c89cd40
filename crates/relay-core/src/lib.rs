//! # relay-core
//!
//! Foundation types, errors, session IDs, and logging setup for the relay
//! transport.
//!
//! This crate provides the shared vocabulary the transport and the agent
//! binary depend on:
//!
//! - **Session IDs**: [`SessionId`] newtype minted per accepted connection
//! - **Envelopes**: [`EncryptedMessage`], the opaque JSON payload relayed between peers
//! - **Errors**: [`TransportError`] hierarchy via `thiserror`
//! - **Logging**: [`logging::init_subscriber`] for the global `tracing` subscriber

#![deny(unsafe_code)]

pub mod constants;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use envelope::EncryptedMessage;
pub use errors::{Result, TransportError};
pub use ids::SessionId;
