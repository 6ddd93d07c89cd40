//! In-memory session registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::SessionId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::receiver::SessionRegistry;
use crate::session::{SessionState, TransportSession};

/// Sessions currently usable as reply destinations, keyed by session ID.
pub struct InMemoryTransportService {
    sessions: RwLock<HashMap<SessionId, Arc<dyn TransportSession>>>,
}

impl InMemoryTransportService {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Record a session as a reply destination.
    ///
    /// Sessions that are already closed are not recorded, so a late save
    /// cannot resurrect a session the listener has already removed.
    pub async fn save_session(&self, session: Arc<dyn TransportSession>) -> bool {
        if session.state() == SessionState::Closed {
            debug!(session_id = %session.id(), "not saving closed session");
            return false;
        }
        let mut sessions = self.sessions.write().await;
        let _ = sessions.insert(session.id().clone(), session);
        true
    }

    /// Look up a session by ID.
    pub async fn find_session(&self, id: &SessionId) -> Option<Arc<dyn TransportSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Whether a session is registered.
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// IDs of all registered sessions.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

impl Default for InMemoryTransportService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRegistry for InMemoryTransportService {
    async fn remove_session(&self, session: &Arc<dyn TransportSession>) {
        let removed = self.sessions.write().await.remove(session.id()).is_some();
        debug!(session_id = %session.id(), removed, "session removed from registry");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::session::{OutboundFrame, WsSession};

    fn make_session(id: &str) -> (Arc<WsSession>, mpsc::Receiver<OutboundFrame>) {
        let (session, rx) = WsSession::new(SessionId::from(id), Duration::from_secs(1), 4);
        (Arc::new(session), rx)
    }

    #[tokio::test]
    async fn save_and_find() {
        let registry = InMemoryTransportService::new();
        let (session, _rx) = make_session("s1");
        assert!(registry.save_session(session).await);
        assert_eq!(registry.session_count().await, 1);

        let found = registry.find_session(&SessionId::from("s1")).await.unwrap();
        assert_eq!(found.id().as_str(), "s1");
        assert_eq!(found.transport_type(), "WebSocket");
    }

    #[tokio::test]
    async fn remove_only_affects_target() {
        let registry = InMemoryTransportService::new();
        let (a, _rx_a) = make_session("a");
        let (b, _rx_b) = make_session("b");
        let _ = registry.save_session(a.clone()).await;
        let _ = registry.save_session(b).await;

        let a: Arc<dyn TransportSession> = a;
        registry.remove_session(&a).await;
        assert!(!registry.contains(&SessionId::from("a")).await);
        assert!(registry.contains(&SessionId::from("b")).await);
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let registry = InMemoryTransportService::new();
        let (a, _rx) = make_session("a");
        let a: Arc<dyn TransportSession> = a;
        registry.remove_session(&a).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn closed_session_is_not_saved() {
        let registry = InMemoryTransportService::new();
        let (session, _rx) = make_session("closed");
        session.close();
        assert!(!registry.save_session(session).await);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn resave_replaces_entry() {
        let registry = InMemoryTransportService::new();
        let (session, _rx) = make_session("s1");
        let _ = registry.save_session(session.clone()).await;
        let _ = registry.save_session(session).await;
        assert_eq!(registry.session_ids().await, vec![SessionId::from("s1")]);
    }
}
