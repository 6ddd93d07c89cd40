//! `WsInboundTransport`: accepts WebSocket connections and manages their
//! sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{Result, SessionId, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;
use tracing::field::{Empty, display};
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::config::{ListenerBinding, ListenerConfig};
use crate::connection::serve;
use crate::receiver::{MessageReceiver, SessionRegistry};
use crate::session::{TransportSession, WsSession};

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// State shared between the transport handle and its connection tasks.
struct Shared {
    config: ListenerConfig,
    receiver: Arc<dyn MessageReceiver>,
    registry: Arc<dyn SessionRegistry>,
    sessions: RwLock<HashMap<SessionId, Arc<WsSession>>>,
}

struct Running {
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Inbound WebSocket transport.
///
/// Construct with a binding and the two collaborators, then [`start`] it.
/// Each accepted connection gets a fresh [`WsSession`]; inbound envelopes go
/// to the [`MessageReceiver`] with that session as reply channel, and the
/// [`SessionRegistry`] is told exactly once when the connection closes.
///
/// [`start`]: WsInboundTransport::start
pub struct WsInboundTransport {
    binding: Mutex<Option<ListenerBinding>>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl WsInboundTransport {
    /// Create a transport; nothing is bound until [`start`](Self::start).
    pub fn new(
        binding: ListenerBinding,
        config: ListenerConfig,
        receiver: Arc<dyn MessageReceiver>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        Self {
            binding: Mutex::new(Some(binding)),
            shared: Arc::new(Shared {
                config,
                receiver,
                registry,
                sessions: RwLock::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Begin accepting connections. Returns the bound address.
    ///
    /// A transport starts once; a second call fails with `AlreadyStarted`.
    pub async fn start(&self) -> Result<SocketAddr> {
        let Some(binding) = self.binding.lock().take() else {
            return Err(TransportError::AlreadyStarted);
        };
        let retry = match &binding {
            ListenerBinding::Port { host, port } => Some(ListenerBinding::Port {
                host: host.clone(),
                port: *port,
            }),
            ListenerBinding::Listener(_) => None,
        };

        let listener = match binding.into_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.binding.lock() = retry;
                return Err(e);
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: "listener".into(),
                source,
            })?;

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(
            accept_loop(listener, self.shared.clone(), shutdown.clone())
                .instrument(info_span!("relay_listener", %local_addr)),
        );
        *self.running.lock() = Some(Running {
            shutdown,
            accept,
            local_addr,
        });

        info!(%local_addr, "relay listener started");
        Ok(local_addr)
    }

    /// Stop accepting connections and close the listening socket.
    ///
    /// Returns once the accept loop has exited. Sessions already open keep
    /// running until their peers disconnect.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(TransportError::NotStarted);
        };
        running.shutdown.cancel();
        running
            .accept
            .await
            .map_err(|e| TransportError::ListenerCloseFailed {
                reason: e.to_string(),
            })?;
        info!(local_addr = %running.local_addr, "relay listener stopped");
        Ok(())
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of connections currently open.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Look up an open session by ID.
    pub async fn session(&self, id: &SessionId) -> Option<Arc<WsSession>> {
        self.shared.sessions.read().await.get(id).cloned()
    }
}

impl Drop for WsInboundTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for WsInboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsInboundTransport")
            .field("local_addr", &self.local_addr())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = handle_connection(stream, shared.clone())
                        .instrument(info_span!("relay_connection", %peer, session_id = Empty));
                    let _ = tokio::spawn(conn);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!("accept loop exited");
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let handshake = accept_async_with_config(stream, Some(shared.config.websocket_config()));
    let ws = match tokio::time::timeout(shared.config.handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(
                timeout_ms = u64::try_from(shared.config.handshake_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                "websocket handshake timed out"
            );
            return;
        }
    };

    let id = SessionId::new();
    let _ = Span::current().record("session_id", display(&id));
    let (session, outbound_rx) = WsSession::new(
        id.clone(),
        shared.config.liveness_timeout,
        shared.config.outbound_queue_depth,
    );
    let session = Arc::new(session);

    {
        let mut sessions = shared.sessions.write().await;
        if sessions.contains_key(&id) {
            warn!("duplicate session id, dropping connection");
            return;
        }
        let _ = sessions.insert(id.clone(), session.clone());
    }

    info!("session opened");
    counter!("relay_connections_total").increment(1);
    gauge!("relay_connections_active").increment(1.0);

    serve(
        ws,
        session.clone(),
        outbound_rx,
        shared.receiver.clone(),
        shared.config.inbound_queue_depth,
    )
    .await;

    let _ = shared.sessions.write().await.remove(&id);
    let closed: Arc<dyn TransportSession> = session.clone();
    shared.registry.remove_session(&closed).await;

    info!(
        duration_ms = u64::try_from(session.age().as_millis()).unwrap_or(u64::MAX),
        "session closed"
    );
    counter!("relay_disconnections_total").increment(1);
    gauge!("relay_connections_active").decrement(1.0);
}
