//! Transport channel abstraction.
//!
//! The session assumes a reliable publish/subscribe channel and builds
//! its protocol on top; this module supplies that channel. A
//! [`Connector`] opens one connection per room join and hands back a
//! [`Transport`] for outbound frames plus an mpsc receiver of inbound
//! frames. Two implementations:
//!
//! - [`WsConnector`] — WebSocket via tokio-tungstenite, authenticating
//!   with the room's `joinToken` as a bearer credential plus a
//!   user-identity header.
//! - [`ChannelConnector`] — an in-memory pair for tests and embedding;
//!   the peer end sees everything the session sends and can inject
//!   frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::directory::RoomInfo;

/// Transport-level failures. Surfaced as the session `error` state and
/// never auto-retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection or handshake rejected.
    Handshake(String),
    /// The channel is gone; the caller must reconnect to resume.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "transport handshake failed: {e}"),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Inbound frames, as delivered by the connection's reader task. The
/// stream ending means the connection is gone.
pub type InboundRx = mpsc::Receiver<String>;

/// Outbound half of an open connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one frame on the room topic.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent; sends after this fail
    /// with [`TransportError::Closed`].
    async fn close(&self);
}

/// Opens connections. One call per join or rejoin.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        room: &RoomInfo,
        user_id: &str,
    ) -> Result<(Box<dyn Transport>, InboundRx), TransportError>;
}

/// Outbound half backed by an mpsc sender; shared by both connectors.
/// `close` drops the sender, which ends the consumer loop.
struct QueueTransport {
    out: Mutex<Option<mpsc::Sender<String>>>,
}

impl QueueTransport {
    fn new(out: mpsc::Sender<String>) -> Self {
        Self {
            out: Mutex::new(Some(out)),
        }
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let guard = self.out.lock().await;
        let sender = guard.as_ref().ok_or(TransportError::Closed)?;
        sender
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.out.lock().await.take();
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket connector
// ───────────────────────────────────────────────────────────────────

/// WebSocket connector for the room's broadcast endpoint.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        room: &RoomInfo,
        user_id: &str,
    ) -> Result<(Box<dyn Transport>, InboundRx), TransportError> {
        let mut request = room
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", room.join_token))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let identity = HeaderValue::from_str(user_id)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);
        request.headers_mut().insert("x-user-id", identity);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        // Writer task: forward the outbound queue to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: decode text frames into the inbound queue.
        let (in_tx, in_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok((Box::new(QueueTransport::new(out_tx)), in_rx))
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory connector
// ───────────────────────────────────────────────────────────────────

/// The peer's end of one in-memory connection.
pub struct ChannelEndpoint {
    /// Frames the session published.
    pub outbound: mpsc::Receiver<String>,
    /// Inject frames for the session to receive. Dropping this ends
    /// the session's inbound stream, like a socket close.
    pub inbound: mpsc::Sender<String>,
}

/// In-memory connector. Every `connect` call produces a fresh frame
/// pipe and hands the peer end to whoever holds the endpoint receiver
/// — a rejoin shows up there as a second [`ChannelEndpoint`].
pub struct ChannelConnector {
    endpoints: mpsc::Sender<ChannelEndpoint>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::Receiver<ChannelEndpoint>) {
        let (endpoints, endpoint_rx) = mpsc::channel(8);
        (Self { endpoints }, endpoint_rx)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(
        &self,
        _room: &RoomInfo,
        _user_id: &str,
    ) -> Result<(Box<dyn Transport>, InboundRx), TransportError> {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);
        self.endpoints
            .send(ChannelEndpoint {
                outbound: out_rx,
                inbound: in_tx,
            })
            .await
            .map_err(|_| TransportError::Handshake("no endpoint consumer".into()))?;
        Ok((Box::new(QueueTransport::new(out_tx)), in_rx))
    }
}
