//! Error hierarchy for the relay transport.
//!
//! [`TransportError`] covers the send path (`TransportClosed`,
//! `SendTimeout`, `SendFailed`), the listener lifecycle (`Bind`,
//! `ListenerCloseFailed`, ...) and inbound framing. Send-path errors are
//! always returned to the caller; only malformed inbound frames are logged
//! and skipped by the listener.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by sessions and the connection listener.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send attempted on a connection that is no longer open.
    #[error("WebSocket transport session {session_id} has been closed")]
    TransportClosed {
        /// Session the send was addressed to.
        session_id: String,
    },

    /// The peer did not acknowledge the liveness probe in time.
    #[error("no liveness acknowledgment from session {session_id} within {timeout:?}")]
    SendTimeout {
        /// Session the send was addressed to.
        session_id: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The payload write itself failed after a successful probe.
    #[error("failed to write to session {session_id}: {reason}")]
    SendFailed {
        /// Session the send was addressed to.
        session_id: String,
        /// Underlying transport error.
        reason: String,
    },

    /// The listening socket did not close cleanly.
    #[error("listener failed to close: {reason}")]
    ListenerCloseFailed {
        /// Underlying failure.
        reason: String,
    },

    /// An inbound frame was not a JSON envelope.
    #[error("malformed inbound frame: {reason}")]
    MalformedFrame {
        /// Parse failure detail.
        reason: String,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// The acceptor configuration named neither or both of listener and port.
    #[error("invalid acceptor binding: {0}")]
    InvalidBinding(String),

    /// `start` was called on a listener that is already accepting.
    #[error("listener already started")]
    AlreadyStarted,

    /// `stop` was called on a listener that was never started.
    #[error("listener not started")]
    NotStarted,

    /// Outbound payload could not be encoded.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TransportError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransportClosed { .. } => "TRANSPORT_CLOSED",
            Self::SendTimeout { .. } => "SEND_TIMEOUT",
            Self::SendFailed { .. } => "SEND_FAILED",
            Self::ListenerCloseFailed { .. } => "LISTENER_CLOSE_FAILED",
            Self::MalformedFrame { .. } => "MALFORMED_FRAME",
            Self::Bind { .. } => "BIND_FAILED",
            Self::InvalidBinding(_) => "INVALID_BINDING",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::NotStarted => "NOT_STARTED",
            Self::Serialize(_) => "SERIALIZE_FAILED",
        }
    }

    /// Whether an outer retry/backoff policy may try the send again.
    ///
    /// A timed-out probe or a failed write may succeed on a fresh attempt
    /// (or a new connection); a closed session never will.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendTimeout { .. } | Self::SendFailed { .. })
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
