//! Listener configuration.

use std::time::Duration;

use relay_core::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_INBOUND_QUEUE_DEPTH, DEFAULT_LIVENESS_TIMEOUT,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_OUTBOUND_QUEUE_DEPTH,
};
use relay_core::{Result, TransportError};
use relay_settings::TransportSettings;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Where the listener accepts connections.
///
/// Either an already-bound socket handed in by the application, or a port
/// the listener binds itself on `start`.
#[derive(Debug)]
pub enum ListenerBinding {
    /// Accept on an existing listening socket.
    Listener(TcpListener),
    /// Bind `host:port` on start.
    Port {
        /// Bind address.
        host: String,
        /// Port (`0` lets the OS pick).
        port: u16,
    },
}

impl ListenerBinding {
    /// Build a binding from the two mutually exclusive inputs.
    ///
    /// Exactly one of `listener` and `port` must be supplied.
    pub fn from_parts(
        listener: Option<TcpListener>,
        port: Option<u16>,
        host: impl Into<String>,
    ) -> Result<Self> {
        match (listener, port) {
            (Some(listener), None) => Ok(Self::Listener(listener)),
            (None, Some(port)) => Ok(Self::Port {
                host: host.into(),
                port,
            }),
            (Some(_), Some(_)) => Err(TransportError::InvalidBinding(
                "supply either a listening socket or a port, not both".into(),
            )),
            (None, None) => Err(TransportError::InvalidBinding(
                "a listening socket or a port is required".into(),
            )),
        }
    }

    /// Port binding taken from settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self::Port {
            host: settings.host.clone(),
            port: settings.port,
        }
    }

    /// Resolve to a listening socket, binding if needed.
    pub(crate) async fn into_listener(self) -> Result<TcpListener> {
        match self {
            Self::Listener(listener) => Ok(listener),
            Self::Port { host, port } => {
                let addr = format!("{host}:{port}");
                TcpListener::bind(&addr)
                    .await
                    .map_err(|source| TransportError::Bind { addr, source })
            }
        }
    }
}

/// Per-connection tuning.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Bound on the liveness round trip preceding every send.
    pub liveness_timeout: Duration,
    /// Deadline for an accepted socket to finish the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Largest inbound WebSocket message in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per session.
    pub outbound_queue_depth: usize,
    /// Inbound frames buffered while the receiver is busy; frames beyond
    /// this are dropped.
    pub inbound_queue_depth: usize,
}

impl ListenerConfig {
    /// Take the tuning values from settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            liveness_timeout: settings.liveness_timeout(),
            handshake_timeout: settings.handshake_timeout(),
            max_message_size: settings.max_message_size,
            outbound_queue_depth: settings.outbound_queue_depth,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
        }
    }

    /// Same config with a different liveness bound.
    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn listener_only_is_valid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let binding = ListenerBinding::from_parts(Some(listener), None, "ignored").unwrap();
        assert_matches!(binding, ListenerBinding::Listener(_));
    }

    #[test]
    fn port_only_is_valid() {
        let binding = ListenerBinding::from_parts(None, Some(3001), "127.0.0.1").unwrap();
        assert_matches!(binding, ListenerBinding::Port { ref host, port: 3001 } if host == "127.0.0.1");
    }

    #[tokio::test]
    async fn both_inputs_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = ListenerBinding::from_parts(Some(listener), Some(3001), "0.0.0.0").unwrap_err();
        assert_matches!(err, TransportError::InvalidBinding(_));
    }

    #[test]
    fn neither_input_rejected() {
        let err = ListenerBinding::from_parts(None, None, "0.0.0.0").unwrap_err();
        assert_matches!(err, TransportError::InvalidBinding(_));
    }

    #[tokio::test]
    async fn port_binding_binds_on_resolve() {
        let binding = ListenerBinding::Port {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let listener = binding.into_listener().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn occupied_port_is_bind_error() {
        let occupier = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let binding = ListenerBinding::Port {
            host: "127.0.0.1".into(),
            port: occupier.local_addr().unwrap().port(),
        };
        let err = binding.into_listener().await.unwrap_err();
        assert_matches!(err, TransportError::Bind { .. });
    }

    #[test]
    fn config_from_settings() {
        let settings = TransportSettings {
            liveness_timeout_ms: 1500,
            handshake_timeout_ms: 250,
            max_message_size: 4096,
            ..TransportSettings::default()
        };
        let config = ListenerConfig::from_settings(&settings);
        assert_eq!(config.liveness_timeout, Duration::from_millis(1500));
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.websocket_config().max_message_size, Some(4096));
    }

    #[test]
    fn default_config_uses_ten_second_bound() {
        assert_eq!(
            ListenerConfig::default().liveness_timeout,
            Duration::from_secs(10)
        );
    }
}
