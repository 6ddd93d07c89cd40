//! Settings types.

use std::time::Duration;

use relay_core::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_LIVENESS_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_OUTBOUND_QUEUE_DEPTH,
};
use relay_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// WebSocket inbound transport.
    pub transport: TransportSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transport.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("transport.host is empty".into()));
        }
        if self.transport.liveness_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.livenessTimeoutMs must be positive".into(),
            ));
        }
        if self.transport.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.handshakeTimeoutMs must be positive".into(),
            ));
        }
        if self.transport.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.maxMessageSize must be positive".into(),
            ));
        }
        if self.transport.outbound_queue_depth == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.outboundQueueDepth must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket port (`0` lets the OS pick).
    pub port: u16,
    /// How long a send waits for the liveness acknowledgment, in milliseconds.
    pub liveness_timeout_ms: u64,
    /// How long an accepted socket may take to complete the WebSocket
    /// handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Largest inbound WebSocket message in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per session before `send` waits.
    pub outbound_queue_depth: usize,
}

impl TransportSettings {
    /// Liveness bound as a [`Duration`].
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            liveness_timeout_ms: u64::try_from(DEFAULT_LIVENESS_TIMEOUT.as_millis())
                .unwrap_or(10_000),
            handshake_timeout_ms: u64::try_from(DEFAULT_HANDSHAKE_TIMEOUT.as_millis())
                .unwrap_or(10_000),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Compact text or JSON lines.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
