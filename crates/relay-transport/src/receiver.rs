//! Collaborators the listener talks to.
//!
//! Both are injected into [`WsInboundTransport`](crate::WsInboundTransport)
//! at construction.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::EncryptedMessage;

use crate::session::TransportSession;

/// Boxed error returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Consumes inbound envelopes.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Handle one parsed envelope. `session` is the reply channel back to
    /// the sender. Errors are logged by the listener; the connection stays
    /// open.
    async fn receive_message(
        &self,
        message: EncryptedMessage,
        session: Arc<dyn TransportSession>,
    ) -> Result<(), BoxError>;
}

/// Tracks which sessions are valid reply destinations.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Forget a session whose connection has closed.
    async fn remove_session(&self, session: &Arc<dyn TransportSession>);
}
