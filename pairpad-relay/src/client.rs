//! WebSocket session client for a relay room.
//!
//! Provides:
//! - Connection lifecycle (connect, leave)
//! - Join, buffer snapshots and chat in either wire encoding
//! - Remote events delivered on an mpsc channel as [`SessionEvent`]s
//!
//! Failures never panic: they come back as [`ClientError`] and, for the
//! connection itself, as a [`SessionEvent::Notice`] the UI can show.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::presence::RoomId;
use crate::protocol::{ChatMessage, ClientEvent, Encoding, ProtocolError, ServerEvent, WireFrame};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the session client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// An event relayed by the server
    Remote(ServerEvent),
    /// Something the user should be told about
    Notice(String),
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The session client.
pub struct SessionClient {
    server_url: String,
    room: RoomId,
    encoding: Encoding,

    state: Arc<RwLock<ConnectionState>>,

    /// Frames for the writer task
    outgoing_tx: Option<mpsc::Sender<WireFrame>>,
    writer: Option<JoinHandle<()>>,

    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionClient {
    /// Create a client for `room` on the server at `server_url`
    /// (e.g. `ws://127.0.0.1:5000`).
    pub fn new(server_url: impl Into<String>, room: RoomId) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            server_url: server_url.into(),
            room,
            encoding: Encoding::Json,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            writer: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Speak `encoding` on the wire. The server answers in kind.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Full URL of the room endpoint.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            self.room.as_str()
        )
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.url();
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connecting to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                let _ = self
                    .event_tx
                    .try_send(SessionEvent::Notice(format!("Could not reach {url}: {e}")));
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward frames until the channel closes, then close
        // the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(CHANNEL_CAPACITY);
        self.outgoing_tx = Some(out_tx);
        self.writer = Some(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    WireFrame::Text(text) => Message::Text(text.into()),
                    WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if ws_writer.send(msg).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        }));

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;
        log::debug!("Connected to {url}");

        // Reader task: decode relayed events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => WireFrame::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => WireFrame::Binary(data.to_vec()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx
                            .send(SessionEvent::Notice(format!("Connection error: {e}")))
                            .await;
                        break;
                    }
                };
                let event = match ServerEvent::decode(&frame) {
                    Ok(event) => SessionEvent::Remote(event),
                    Err(e) => {
                        log::warn!("Ignoring malformed frame from server: {e}");
                        continue;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Encode and queue one event for the writer task.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let frame = event.encode(self.encoding)?;
        tx.send(frame).await.map_err(|_| ClientError::NotConnected)
    }

    pub async fn join(&self, display_name: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::JoinRoom(display_name.to_string())).await
    }

    /// Publish a full buffer snapshot.
    pub async fn send_code(&self, content: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::CodeChange(content.to_string())).await
    }

    pub async fn send_chat(&self, author: &str, text: &str) -> Result<(), ClientError> {
        self.send(&ClientEvent::SendMessage(ChatMessage::new(author, text)))
            .await
    }

    /// Send `leave-room`, then close the connection once it is written.
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        let sent = self.send(&ClientEvent::LeaveRoom).await;
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        sent
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
