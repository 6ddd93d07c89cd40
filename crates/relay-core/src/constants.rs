//! Protocol constants shared across crates.

use std::time::Duration;

/// Transport kind tag carried by every WebSocket session.
pub const WEBSOCKET_TRANSPORT_TYPE: &str = "WebSocket";

/// How long a send waits for the peer to acknowledge the liveness probe.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted socket may take to finish the WebSocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound WebSocket message accepted (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the per-session outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Inbound frames buffered per connection while the receiver is busy.
pub const DEFAULT_INBOUND_QUEUE_DEPTH: usize = 1024;
