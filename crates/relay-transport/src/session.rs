//! WebSocket transport session with liveness-checked reliable send.
//!
//! A connection can be half-open: the local socket still reports "open"
//! while an intermediary has silently dropped it. Every [`WsSession::send_json`]
//! therefore runs one Ping/Pong round trip before writing the payload:
//!
//! 1. state is `Closed` → fail with `TransportClosed`, no probe
//! 2. emit a Ping carrying a fresh probe nonce, wait for the matching Pong
//! 3. no Pong within the bound → fail with `SendTimeout`, payload never written
//! 4. write the payload → `SendFailed` if the write errors
//!
//! Sends on one session are serialised through a FIFO gate, so at most one
//! probe is outstanding per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use relay_core::constants::WEBSOCKET_TRANSPORT_TYPE;
use relay_core::{EncryptedMessage, Result, SessionId, TransportError};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Readiness of the underlying connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Frames can be written.
    Open,
    /// Closed by either peer, or closing.
    Closed,
}

/// A reply channel back to a connected peer.
///
/// Receivers and registries hold sessions through this trait so they stay
/// independent of the concrete transport.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Session identifier.
    fn id(&self) -> &SessionId;

    /// Transport kind tag.
    fn transport_type(&self) -> &'static str;

    /// Live connection state.
    fn state(&self) -> SessionState;

    /// Deliver an envelope to the peer.
    async fn send(&self, message: &EncryptedMessage) -> Result<()>;

    /// Request the connection to close. Idempotent.
    fn close(&self);
}

/// Frames queued from a session to its connection's writer task.
#[derive(Debug)]
pub(crate) enum OutboundFrame {
    /// Emit a Ping whose payload is the big-endian probe nonce.
    Probe { nonce: u64 },
    /// Write a text frame and report the outcome.
    Payload {
        text: String,
        written: oneshot::Sender<std::result::Result<(), String>>,
    },
}

struct PendingProbe {
    nonce: u64,
    ack: oneshot::Sender<()>,
}

/// One accepted WebSocket connection.
pub struct WsSession {
    id: SessionId,
    outbound: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
    pending_probe: Mutex<Option<PendingProbe>>,
    next_nonce: AtomicU64,
    send_gate: tokio::sync::Mutex<()>,
    liveness_timeout: Duration,
    connected_at: Instant,
}

impl WsSession {
    /// Create a session and the receiving end of its outbound queue.
    pub(crate) fn new(
        id: SessionId,
        liveness_timeout: Duration,
        queue_depth: usize,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(queue_depth.max(1));
        let session = Self {
            id,
            outbound,
            closed: CancellationToken::new(),
            pending_probe: Mutex::new(None),
            next_nonce: AtomicU64::new(1),
            send_gate: tokio::sync::Mutex::new(()),
            liveness_timeout,
            connected_at: Instant::now(),
        };
        (session, rx)
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Live connection state, derived from the close token and the writer.
    pub fn state(&self) -> SessionState {
        if self.closed.is_cancelled() || self.outbound.is_closed() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Token cancelled once the session stops being open.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Serialize `payload` as JSON and deliver it after a liveness round trip.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn send_json<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let started = Instant::now();

        // a closed session fails at once instead of queueing behind the gate
        let result = if self.is_open() {
            let _gate = self.send_gate.lock().await;
            self.send_locked(payload).await
        } else {
            Err(self.closed_error())
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(TransportError::TransportClosed { .. }) => "closed",
            Err(TransportError::SendTimeout { .. }) => "timeout",
            Err(_) => "failed",
        };
        counter!("relay_sends_total", "outcome" => outcome).increment(1);
        histogram!("relay_send_latency_seconds").record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            warn!(error = %e, code = e.code(), "send failed");
        }
        result
    }

    async fn send_locked<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let text = serde_json::to_string(payload)?;

        self.await_liveness().await?;

        // close() may have landed while we waited for the ack
        if !self.is_open() {
            return Err(self.closed_error());
        }

        let (written_tx, written_rx) = oneshot::channel();
        self.outbound
            .send(OutboundFrame::Payload {
                text,
                written: written_tx,
            })
            .await
            .map_err(|_| self.closed_error())?;

        match written_rx.await {
            Ok(Ok(())) => {
                debug!("payload written");
                Ok(())
            }
            Ok(Err(reason)) => Err(TransportError::SendFailed {
                session_id: self.id.to_string(),
                reason,
            }),
            Err(_) => Err(TransportError::SendFailed {
                session_id: self.id.to_string(),
                reason: "connection writer stopped before the payload was written".into(),
            }),
        }
    }

    /// Emit one probe and wait for its acknowledgment within the bound.
    ///
    /// The pending slot is cleared on every exit path, so an ack arriving
    /// after the bound is ignored.
    async fn await_liveness(&self) -> Result<()> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.pending_probe.lock() = Some(PendingProbe { nonce, ack: ack_tx });
        let _slot = ProbeSlot {
            session: self,
            nonce,
        };
        if !self.is_open() {
            return Err(self.closed_error());
        }
        debug!(nonce, "liveness probe emitted");

        let outcome = tokio::time::timeout(self.liveness_timeout, async {
            if self
                .outbound
                .send(OutboundFrame::Probe { nonce })
                .await
                .is_err()
            {
                return false;
            }
            ack_rx.await.is_ok()
        })
        .await;

        match outcome {
            Ok(true) => {
                debug!(nonce, "liveness acknowledged");
                Ok(())
            }
            Ok(false) => Err(self.closed_error()),
            Err(_) => Err(TransportError::SendTimeout {
                session_id: self.id.to_string(),
                timeout: self.liveness_timeout,
            }),
        }
    }

    fn clear_probe(&self, nonce: u64) {
        let mut slot = self.pending_probe.lock();
        if slot.as_ref().is_some_and(|p| p.nonce == nonce) {
            *slot = None;
        }
    }

    /// Whether a probe is waiting for its acknowledgment.
    pub fn has_pending_probe(&self) -> bool {
        self.pending_probe.lock().is_some()
    }

    /// Handle a Pong from the peer.
    ///
    /// Resolves the outstanding probe when the echoed nonce matches it;
    /// unsolicited or stale Pongs are ignored.
    pub(crate) fn on_pong(&self, payload: &[u8]) {
        let Some(nonce) = decode_nonce(payload) else {
            debug!(session_id = %self.id, len = payload.len(), "ignoring pong without probe nonce");
            return;
        };
        let pending = {
            let mut slot = self.pending_probe.lock();
            if slot.as_ref().is_some_and(|p| p.nonce == nonce) {
                slot.take()
            } else {
                None
            }
        };
        match pending {
            Some(probe) => {
                let _ = probe.ack.send(());
            }
            None => debug!(session_id = %self.id, nonce, "ignoring stale pong"),
        }
    }

    /// Mark the connection closed after the peer went away.
    ///
    /// Drops any outstanding probe so a send waiting on it fails with
    /// `TransportClosed` right away.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
        drop(self.pending_probe.lock().take());
    }

    /// Request the connection to close.
    ///
    /// No-op when already closed. Does not abort a send that is waiting for
    /// its liveness ack; that send fails once it reaches the write.
    pub fn close(&self) {
        if self.is_open() {
            debug!(session_id = %self.id, "closing session");
            self.closed.cancel();
        }
    }

    fn closed_error(&self) -> TransportError {
        TransportError::TransportClosed {
            session_id: self.id.to_string(),
        }
    }
}

/// Clears the pending-probe slot when the probing send finishes or is
/// dropped mid-flight.
struct ProbeSlot<'a> {
    session: &'a WsSession,
    nonce: u64,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.session.clear_probe(self.nonce);
    }
}

#[async_trait]
impl TransportSession for WsSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn transport_type(&self) -> &'static str {
        WEBSOCKET_TRANSPORT_TYPE
    }

    fn state(&self) -> SessionState {
        WsSession::state(self)
    }

    async fn send(&self, message: &EncryptedMessage) -> Result<()> {
        self.send_json(message).await
    }

    fn close(&self) {
        WsSession::close(self);
    }
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("liveness_timeout", &self.liveness_timeout)
            .finish_non_exhaustive()
    }
}

/// Encode a probe nonce as a Ping payload.
pub(crate) fn encode_nonce(nonce: u64) -> Vec<u8> {
    nonce.to_be_bytes().to_vec()
}

fn decode_nonce(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
