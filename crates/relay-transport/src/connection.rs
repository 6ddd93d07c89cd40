//! Per-connection driver.
//!
//! Splits an accepted WebSocket into three tasks sharing one [`WsSession`]:
//! a writer draining the session's outbound queue, a dispatcher feeding
//! parsed envelopes to the receiver in arrival order, and the read loop
//! (run inline) that routes Pongs back to the session. The read loop never
//! waits on the receiver, so a receiver replying on the same session can
//! still get its liveness ack. Data frames arriving while the dispatch queue
//! is full are dropped with a warning.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use relay_core::EncryptedMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::receiver::MessageReceiver;
use crate::session::{OutboundFrame, TransportSession, WsSession, encode_nonce};

/// How long a locally closed connection waits for the peer's Close reply.
const CLOSE_HANDSHAKE_GRACE: Duration = Duration::from_secs(2);

/// How long the writer gets to flush its Close frame once reading stops.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Drive one connection until the peer goes away or the session is closed.
///
/// Returns once the connection is finished; the session is `Closed` by
/// then. Envelopes already queued are still delivered to the receiver.
pub(crate) async fn serve<S>(
    ws: WebSocketStream<S>,
    session: Arc<WsSession>,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    receiver: Arc<dyn MessageReceiver>,
    inbound_depth: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let closed = session.closed_token();

    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, closed.clone()));

    let (inbound_tx, inbound_rx) = mpsc::channel(inbound_depth.max(1));
    let _dispatcher = tokio::spawn(dispatch_loop(inbound_rx, session.clone(), receiver));

    read_loop(stream, &session, &inbound_tx, &closed).await;

    session.mark_closed();
    drop(inbound_tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!(session_id = %session.id(), "writer did not finish, aborting");
        writer.abort();
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    session: &WsSession,
    inbound: &mpsc::Sender<String>,
    closed: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = if closed.is_cancelled() {
            match tokio::time::timeout(CLOSE_HANDSHAKE_GRACE, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!(session_id = %session.id(), "peer did not complete close handshake");
                    break;
                }
            }
        } else {
            tokio::select! {
                next = stream.next() => next,
                () = closed.cancelled() => continue,
            }
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                info!(session_id = %session.id(), error = %e, "connection read failed");
                break;
            }
            None => break,
        };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    warn!(session_id = %session.id(), len = data.len(), "dropping non-UTF8 binary frame");
                    counter!("relay_inbound_rejected_total").increment(1);
                    continue;
                }
            },
            Message::Pong(payload) => {
                session.on_pong(&payload);
                continue;
            }
            // tungstenite queues the Pong reply itself
            Message::Ping(_) | Message::Frame(_) => continue,
            Message::Close(frame) => {
                debug!(session_id = %session.id(), ?frame, "peer sent close frame");
                break;
            }
        };

        match inbound.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(text)) => {
                warn!(session_id = %session.id(), len = text.len(), "receiver backlog full, dropping frame");
                counter!("relay_inbound_rejected_total").increment(1);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    OutboundFrame::Probe { nonce } => {
                        if let Err(e) = sink.send(Message::Ping(encode_nonce(nonce).into())).await {
                            debug!(nonce, error = %e, "failed to write liveness probe");
                            closed.cancel();
                            break;
                        }
                    }
                    OutboundFrame::Payload { text, written } => {
                        let result = sink
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| e.to_string());
                        let failed = result.is_err();
                        let _ = written.send(result);
                        if failed {
                            closed.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn dispatch_loop(
    mut inbound_rx: mpsc::Receiver<String>,
    session: Arc<WsSession>,
    receiver: Arc<dyn MessageReceiver>,
) {
    while let Some(text) = inbound_rx.recv().await {
        let message = match EncryptedMessage::from_json_str(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "skipping malformed frame");
                counter!("relay_inbound_rejected_total").increment(1);
                continue;
            }
        };
        counter!("relay_inbound_frames_total").increment(1);

        let reply: Arc<dyn TransportSession> = session.clone();
        if let Err(e) = receiver.receive_message(message, reply).await {
            error!(session_id = %session.id(), error = %e, "message receiver failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use relay_core::{SessionId, TransportError};
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;
    use crate::receiver::BoxError;
    use crate::session::SessionState;
    use assert_matches::assert_matches;

    struct Forward(mpsc::UnboundedSender<EncryptedMessage>);

    #[async_trait]
    impl MessageReceiver for Forward {
        async fn receive_message(
            &self,
            message: EncryptedMessage,
            _session: Arc<dyn TransportSession>,
        ) -> Result<(), BoxError> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    /// Replies to every envelope on the session it arrived on.
    struct Echo;

    #[async_trait]
    impl MessageReceiver for Echo {
        async fn receive_message(
            &self,
            message: EncryptedMessage,
            session: Arc<dyn TransportSession>,
        ) -> Result<(), BoxError> {
            session.send(&message).await?;
            Ok(())
        }
    }

    struct Harness {
        session: Arc<WsSession>,
        client: WebSocketStream<DuplexStream>,
        served: tokio::task::JoinHandle<()>,
    }

    async fn start(receiver: Arc<dyn MessageReceiver>, bound: Duration) -> Harness {
        start_with_depth(receiver, bound, 16).await
    }

    async fn start_with_depth(
        receiver: Arc<dyn MessageReceiver>,
        bound: Duration,
        inbound_depth: usize,
    ) -> Harness {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let (session, rx) = WsSession::new(SessionId::from("conn_test"), bound, 8);
        let session = Arc::new(session);
        let served = tokio::spawn(serve(server, session.clone(), rx, receiver, inbound_depth));
        Harness {
            session,
            client,
            served,
        }
    }

    #[tokio::test]
    async fn inbound_frames_reach_receiver_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(1)).await;

        for n in 0..3 {
            h.client
                .send(Message::Text(json!({"seq": n}).to_string().into()))
                .await
                .unwrap();
        }
        for n in 0..3 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.get("seq"), Some(&json!(n)));
        }
        drop(h.client);
        h.served.await.unwrap();
    }

    #[tokio::test]
    async fn utf8_binary_frame_is_accepted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(1)).await;

        h.client
            .send(Message::Binary(br#"{"kind":"bin"}"#.to_vec().into()))
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.get("kind"), Some(&json!("bin")));
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(1)).await;

        h.client.send(Message::Text("not json".into())).await.unwrap();
        h.client.send(Message::Text("[1,2]".into())).await.unwrap();
        h.client
            .send(Message::Text(r#"{"ok":true}"#.into()))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.get("ok"), Some(&json!(true)));
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn receiver_can_reply_on_same_session() {
        let mut h = start(Arc::new(Echo), Duration::from_secs(2)).await;

        h.client
            .send(Message::Text(r#"{"type":"echo"}"#.into()))
            .await
            .unwrap();

        // reading drives the client's automatic Pong
        loop {
            match h.client.next().await.unwrap().unwrap() {
                Message::Text(t) => {
                    assert_eq!(t.as_str(), r#"{"type":"echo"}"#);
                    break;
                }
                Message::Ping(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Takes the first envelope and never returns.
    struct Stuck(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl MessageReceiver for Stuck {
        async fn receive_message(
            &self,
            _message: EncryptedMessage,
            _session: Arc<dyn TransportSession>,
        ) -> Result<(), BoxError> {
            let _ = self.0.send(());
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn busy_receiver_does_not_block_liveness() {
        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let mut h = start_with_depth(Arc::new(Stuck(entered_tx)), Duration::from_secs(2), 2).await;

        // one frame occupies the receiver, two fill the queue, the rest overflow
        for n in 0..8 {
            h.client
                .send(Message::Text(json!({"seq": n}).to_string().into()))
                .await
                .unwrap();
        }
        entered.recv().await.unwrap();

        let session = h.session.clone();
        let send = tokio::spawn(async move { session.send_json(&json!({"reply": true})).await });
        loop {
            match h.client.next().await.unwrap().unwrap() {
                Message::Text(t) => {
                    assert_eq!(t.as_str(), r#"{"reply":true}"#);
                    break;
                }
                Message::Ping(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        send.await.unwrap().unwrap();
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn liveness_ping_carries_nonce() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(2)).await;

        let session = h.session.clone();
        let send = tokio::spawn(async move { session.send_json(&json!({"n": 1})).await });

        let ping = h.client.next().await.unwrap().unwrap();
        assert_matches!(ping, Message::Ping(ref p) if p.len() == 8);
        let text = h.client.next().await.unwrap().unwrap();
        assert_matches!(text, Message::Text(ref t) if t.as_str() == r#"{"n":1}"#);
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_marks_session_closed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(1)).await;

        h.client.close(None).await.unwrap();
        h.served.await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);

        let err = h.session.send_json(&json!({})).await.unwrap_err();
        assert_matches!(err, TransportError::TransportClosed { .. });
    }

    #[tokio::test]
    async fn local_close_sends_close_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut h = start(Arc::new(Forward(tx)), Duration::from_secs(1)).await;

        h.session.close();
        let frame = h.client.next().await.unwrap().unwrap();
        assert_matches!(frame, Message::Close(_));
        // finishing the handshake lets serve return without the grace wait
        while h.client.next().await.is_some() {}
        h.served.await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
    }
}
