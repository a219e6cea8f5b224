//! Per-connection lifecycle.
//!
//! ```text
//! Connecting ──handshake ok──► Active ──close / error / evicted──► Closing ──► Terminated
//!      │
//!      └──handshake error──► Failed
//! ```
//!
//! The document id comes from the upgrade path `/ws/{doc_id}`. While
//! `Active`, the session relays inbound binary frames to its room and drains
//! frames relayed to it into the socket. Room membership is held by a drop
//! guard, so leaving happens exactly once on every exit path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::{ConnectionId, Frame, RoomHandle, RoomRegistry};

/// Path prefix under which documents are served.
pub const ROUTE_PREFIX: &str = "/ws/";

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Terminated,
    Failed,
}

/// Why an `Active` session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended
    ClientClosed,
    /// The registry dropped this connection after a failed delivery
    Evicted,
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub doc_id: String,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub close_reason: CloseReason,
}

/// Extract the document id from an upgrade path.
///
/// Accepts exactly one non-empty segment after `/ws/`, used verbatim.
pub fn doc_id_from_path(path: &str) -> Option<&str> {
    let doc_id = path.strip_prefix(ROUTE_PREFIX)?;
    (!doc_id.is_empty() && !doc_id.contains('/')).then_some(doc_id)
}

/// Room membership that is released when dropped.
struct Membership {
    registry: Arc<RoomRegistry>,
    handle: RoomHandle,
}

impl Membership {
    fn join(registry: Arc<RoomRegistry>, doc_id: &str, connection_id: ConnectionId) -> Self {
        let handle = registry.join(doc_id, connection_id);
        Self { registry, handle }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry.release(&self.handle);
    }
}

/// One client session, tracked from handshake to termination.
struct Session {
    connection_id: ConnectionId,
    addr: SocketAddr,
    state: SessionState,
}

impl Session {
    fn new(addr: SocketAddr) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            addr,
            state: SessionState::Connecting,
        }
    }

    fn enter(&mut self, next: SessionState) {
        log::trace!(
            "Session {} ({}) {:?} -> {:?}",
            self.connection_id,
            self.addr,
            self.state,
            next
        );
        self.state = next;
    }
}

/// Run one connection from handshake to termination.
///
/// Errors are returned for logging by the caller; by the time this returns
/// the connection has already left its room.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    config: Arc<RelayConfig>,
) -> Result<SessionSummary, RelayError> {
    let mut session = Session::new(addr);

    let (ws_stream, doc_id) = match accept(stream, &config).await {
        Ok(accepted) => accepted,
        Err(e) => {
            session.enter(SessionState::Failed);
            return Err(e);
        }
    };

    session.enter(SessionState::Active);
    log::info!("Client {addr} connected to document '{doc_id}'");

    let mut membership = Membership::join(registry.clone(), &doc_id, session.connection_id);
    let mut summary = SessionSummary {
        connection_id: session.connection_id,
        doc_id,
        frames_received: 0,
        bytes_received: 0,
        frames_sent: 0,
        close_reason: CloseReason::ClientClosed,
    };

    let result = relay(
        ws_stream,
        &mut membership.handle,
        &registry,
        config.heartbeat_interval(),
        &mut summary,
    )
    .await;

    session.enter(SessionState::Closing);
    drop(membership);
    session.enter(SessionState::Terminated);

    match result {
        Ok(reason) => {
            summary.close_reason = reason;
            log::info!("Client {addr} disconnected from document '{}'", summary.doc_id);
            Ok(summary)
        }
        Err(e) => {
            log::error!("WebSocket error for document '{}': {e}", summary.doc_id);
            Err(e)
        }
    }
}

/// Perform the upgrade, capturing the document id from the request path.
async fn accept(
    stream: TcpStream,
    config: &RelayConfig,
) -> Result<(WebSocketStream<TcpStream>, String), RelayError> {
    let mut doc_id = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match doc_id_from_path(request.uri().path()) {
            Some(id) => {
                doc_id = Some(id.to_owned());
                Ok(response)
            }
            None => {
                log::debug!("Rejecting upgrade for unknown path {}", request.uri().path());
                let mut rejection = ErrorResponse::new(Some("Not Found".to_owned()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(config.websocket_config()),
    )
    .await
    .map_err(RelayError::Handshake)?;

    match doc_id {
        Some(doc_id) => Ok((ws_stream, doc_id)),
        // The callback rejects every request it does not bind.
        None => Err(RelayError::Handshake(
            tokio_tungstenite::tungstenite::Error::ConnectionClosed,
        )),
    }
}

/// The `Active` loop: returns once the connection should close.
///
/// Inbound relaying and outbound draining run side by side, so a broadcast
/// waiting on a slow peer never stops this connection's own queue from
/// draining.
async fn relay(
    ws_stream: WebSocketStream<TcpStream>,
    handle: &mut RoomHandle,
    registry: &RoomRegistry,
    heartbeat: Option<Duration>,
    summary: &mut SessionSummary,
) -> Result<CloseReason, RelayError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut heartbeat = heartbeat.map(|period| interval_at(Instant::now() + period, period));
    let connection_id = handle.connection_id();
    let SessionSummary {
        doc_id,
        frames_received,
        bytes_received,
        frames_sent,
        ..
    } = summary;

    let outcome = tokio::select! {
        result = read_inbound(
            &mut ws_receiver,
            registry,
            doc_id,
            connection_id,
            frames_received,
            bytes_received,
        ) => result,
        result = write_outbound(&mut ws_sender, handle, &mut heartbeat, frames_sent) => result,
    };

    match outcome {
        Ok(reason) => {
            // Best effort: the peer may already be gone.
            let _ = ws_sender.close().await;
            Ok(reason)
        }
        Err(RelayError::UnsupportedFrame) => {
            let close = CloseFrame {
                code: CloseCode::Unsupported,
                reason: Utf8Bytes::from_static("binary frames only"),
            };
            let _ = ws_sender.send(Message::Close(Some(close))).await;
            Err(RelayError::UnsupportedFrame)
        }
        Err(e) => Err(e),
    }
}

/// Relay this client's binary frames to the rest of its room.
async fn read_inbound(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    registry: &RoomRegistry,
    doc_id: &str,
    connection_id: ConnectionId,
    frames_received: &mut u64,
    bytes_received: &mut u64,
) -> Result<CloseReason, RelayError> {
    while let Some(msg) = ws_receiver.next().await {
        match msg? {
            Message::Binary(data) => {
                *frames_received += 1;
                *bytes_received += data.len() as u64;
                registry.broadcast(doc_id, connection_id, data).await;
            }
            Message::Text(_) => return Err(RelayError::UnsupportedFrame),
            Message::Close(_) => return Ok(CloseReason::ClientClosed),
            // Pings are answered by the transport.
            _ => {}
        }
    }
    Ok(CloseReason::ClientClosed)
}

/// Drain frames relayed by peers into the socket, pinging on the heartbeat.
async fn write_outbound(
    ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    handle: &mut RoomHandle,
    heartbeat: &mut Option<Interval>,
    frames_sent: &mut u64,
) -> Result<CloseReason, RelayError> {
    loop {
        tokio::select! {
            frame = handle.recv() => {
                match frame {
                    Some(data) => {
                        ws_sender.send(Message::Binary(data)).await?;
                        *frames_sent += 1;
                    }
                    None => {
                        log::warn!(
                            "Client {} evicted from '{}'",
                            handle.connection_id(),
                            handle.doc_id()
                        );
                        return Ok(CloseReason::Evicted);
                    }
                }
            }

            _ = tick(heartbeat) => {
                ws_sender.send(Message::Ping(Frame::new())).await?;
            }
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn test_doc_id_from_path() {
        assert_eq!(doc_id_from_path("/ws/doc1"), Some("doc1"));
        assert_eq!(doc_id_from_path("/ws/Doc-1"), Some("Doc-1"));
        assert_eq!(doc_id_from_path("/ws/"), None);
        assert_eq!(doc_id_from_path("/ws"), None);
        assert_eq!(doc_id_from_path("/"), None);
        assert_eq!(doc_id_from_path("/health"), None);
        assert_eq!(doc_id_from_path("/ws/a/b"), None);
        assert_eq!(doc_id_from_path("/other/doc1"), None);
    }

    #[test]
    fn test_doc_id_is_case_sensitive() {
        assert_ne!(doc_id_from_path("/ws/Doc"), doc_id_from_path("/ws/doc"));
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            heartbeat_interval_secs: 0,
            ..RelayConfig::default()
        }
    }

    /// Accept exactly one connection and hand it to `handle_connection`.
    async fn serve_one(
        registry: Arc<RoomRegistry>,
        config: RelayConfig,
    ) -> (SocketAddr, tokio::task::JoinHandle<Result<SessionSummary, RelayError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(config);
        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_connection(stream, peer, registry, config).await
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_session_summary_after_client_close() {
        let registry = Arc::new(RoomRegistry::new(16));
        let (addr, task) = serve_one(registry.clone(), test_config()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/doc1"))
            .await
            .unwrap();
        ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        ws.close(None).await.unwrap();

        let summary = timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.doc_id, "doc1");
        assert_eq!(summary.frames_received, 1);
        assert_eq!(summary.bytes_received, 3);
        assert_eq!(summary.close_reason, CloseReason::ClientClosed);
        assert!(!registry.contains_room("doc1"));
    }

    #[tokio::test]
    async fn test_bad_path_fails_handshake_without_joining() {
        let registry = Arc::new(RoomRegistry::new(16));
        let (addr, task) = serve_one(registry.clone(), test_config()).await;

        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/nope")).await;
        assert!(result.is_err());

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(outcome.unwrap_err().is_handshake());
        assert_eq!(registry.stats().connections_joined, 0);
    }

    #[tokio::test]
    async fn test_text_frame_ends_session_and_leaves_room() {
        let registry = Arc::new(RoomRegistry::new(16));
        let (addr, task) = serve_one(registry.clone(), test_config()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/doc1"))
            .await
            .unwrap();
        ws.send(Message::text("not binary")).await.unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RelayError::UnsupportedFrame)));
        assert!(!registry.contains_room("doc1"));

        // Client sees the close frame with the unsupported-data code.
        let close = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        match close {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("Expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evicted_session_closes() {
        let registry = Arc::new(RoomRegistry::new(16));
        let (addr, task) = serve_one(registry.clone(), test_config()).await;

        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/doc1"))
            .await
            .unwrap();

        // Wait for the session to join.
        timeout(Duration::from_secs(2), async {
            while !registry.contains_room("doc1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Dropping the registry's side of the queue is what eviction does.
        for id in registry.members("doc1") {
            registry.leave("doc1", id);
        }

        let summary = timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.close_reason, CloseReason::Evicted);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_transport_error() {
        let registry = Arc::new(RoomRegistry::new(16));
        let peer = ConnectionId::new();
        let mut peer_handle = registry.join("doc1", peer);
        let config = RelayConfig {
            max_frame_size: 1024,
            ..test_config()
        };
        let (addr, task) = serve_one(registry.clone(), config).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/doc1"))
            .await
            .unwrap();
        ws.send(Message::Binary(vec![0u8; 4096].into())).await.unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(RelayError::Transport(_))));
        assert_eq!(registry.members("doc1"), vec![peer]);
        assert!(peer_handle.try_recv().is_none());
        assert_eq!(registry.stats().frames_relayed, 0);
    }

    #[tokio::test]
    async fn test_membership_released_when_task_panics() {
        let registry = Arc::new(RoomRegistry::new(16));
        let connection_id = ConnectionId::new();

        let task: tokio::task::JoinHandle<()> = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _membership = Membership::join(registry, "doc1", connection_id);
                panic!("connection task failed mid-session");
            })
        };

        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        assert!(!registry.contains_room("doc1"));
        assert!(!registry.leave("doc1", connection_id));
    }
}
