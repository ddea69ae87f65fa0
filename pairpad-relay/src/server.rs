//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! axum Router (CORS: any origin)
//!   ├── GET  /        ── upgrade? ──► room `lobby`
//!   │                 └─ plain ─────► 200 liveness text
//!   ├── POST /        ──────────────► 200 liveness text
//!   └── GET  /{room}  ── upgrade ───► room from path
//!                                        │
//!                        ┌───────────────┴────────────────┐
//!                        ▼                                ▼
//!               inbound frames ──► RelayHandle     Outbox ──► outbound frames
//!                                   (hub task)
//! ```
//!
//! Each connection runs one select loop over its socket, its outbox, a
//! heartbeat ticker and the shutdown signal. Socket writes are bounded by the
//! idle timeout and abandoned on shutdown or when the outbox closes, so a
//! peer that stops reading is dropped like one that stops talking. However
//! the loop ends, the connection is reported to the hub as disconnected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;

use crate::broadcast::Outbox;
use crate::hub::{RelayHandle, RelayHub};
use crate::presence::{ConnectionId, RoomId};
use crate::protocol::{ClientEvent, Encoding, WireFrame};
use crate::relay::{Relay, RelayError};

/// Body returned to plain HTTP requests.
pub const LIVENESS_BODY: &str = "Pairpad relay is running...";

type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per connection before buffer snapshots get superseded
    pub queue_capacity: usize,
    /// Heartbeat ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Silence, or a stalled write, after which a connection is dropped
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            queue_capacity: 256,
            heartbeat_interval_secs: 25,
            idle_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Read overrides from the process environment.
    ///
    /// `PORT`, `RELAY_HOST`, `RELAY_QUEUE_CAPACITY`, `RELAY_HEARTBEAT_SECS`,
    /// `RELAY_IDLE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable values keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let host = lookup("RELAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_or("PORT", lookup("PORT"), 5000);
        Self {
            bind_addr: format!("{host}:{port}"),
            queue_capacity: parse_or(
                "RELAY_QUEUE_CAPACITY",
                lookup("RELAY_QUEUE_CAPACITY"),
                defaults.queue_capacity,
            )
            .max(1),
            heartbeat_interval_secs: parse_or(
                "RELAY_HEARTBEAT_SECS",
                lookup("RELAY_HEARTBEAT_SECS"),
                defaults.heartbeat_interval_secs,
            )
            .max(1),
            idle_timeout_secs: parse_or(
                "RELAY_IDLE_TIMEOUT_SECS",
                lookup("RELAY_IDLE_TIMEOUT_SECS"),
                defaults.idle_timeout_secs,
            )
            .max(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={raw:?}, using default");
            default
        }),
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a socket write was abandoned.
#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("peer stopped reading for {0:?}")]
    Stalled(Duration),
    #[error("outbound queue closed")]
    QueueClosed,
    #[error("server shutting down")]
    Shutdown,
}

/// Asks a running server to stop accepting and close its connections.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Resolve once `stop` reads `true` or its sender is gone.
async fn wait_for_shutdown(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Router state shared by every handler.
#[derive(Clone)]
struct AppState {
    relay: RelayHandle,
    heartbeat: Duration,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    /// Held by every live connection; `run` waits for all clones to drop.
    _live: mpsc::Sender<()>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root).post(liveness))
        .route("/{*room}", get(room_socket))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn liveness() -> &'static str {
    LIVENESS_BODY
}

/// `/` serves both the liveness check and the default room.
async fn root(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => upgrade(ws, RoomId::default(), state),
        Err(_) => liveness().await.into_response(),
    }
}

async fn room_socket(
    State(state): State<AppState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, RoomId::from_path(&room), state)
}

fn upgrade(ws: WebSocketUpgrade, room: RoomId, state: AppState) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_connection(socket, room, state).await {
            log::error!("Connection error: {e}");
        }
    })
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    hub: RelayHub,
    relay: RelayHandle,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RelayServer {
    /// Bind the listener. Nothing is served until [`RelayServer::run`].
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (hub, relay) = RelayHub::new(Relay::new(config.queue_capacity));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            hub,
            relay,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle to the relay hub, for stats and roster queries.
    pub fn relay(&self) -> RelayHandle {
        self.relay.clone()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown.clone())
    }

    /// Serve until the shutdown trigger fires, then wait for every open
    /// WebSocket connection to finish.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            config,
            listener,
            hub,
            relay,
            shutdown,
        } = self;

        tokio::spawn(hub.run());
        let (live, mut all_closed) = mpsc::channel::<()>(1);
        let app = router(AppState {
            relay,
            heartbeat: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            shutdown: shutdown.subscribe(),
            _live: live,
        });

        log::info!("Relay server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown.subscribe()))
            .await?;

        // Nothing is ever sent; recv returns None once the last connection
        // drops its sender.
        log::info!("Shutdown requested, waiting for open connections");
        while all_closed.recv().await.is_some() {}
        log::info!("Relay server stopped");
        Ok(())
    }
}

/// Register with the hub, pump frames, and always report the disconnect.
async fn handle_connection(socket: WebSocket, room: RoomId, state: AppState) -> ConnResult {
    let relay = state.relay.clone();
    let (id, outbox) = relay.connect(room.clone()).await?;
    log::info!("WebSocket connection {id} in room {room}");

    let result = pump(socket, id, &outbox, &state).await;

    // Disconnect after a close can race with an explicit leave; the hub
    // treats the second one as a no-op.
    let _ = relay.disconnect(id).await;
    log::info!("Connection {id} closed");
    result
}

async fn pump(socket: WebSocket, id: ConnectionId, outbox: &Outbox, state: &AppState) -> ConnResult {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut writer = Writer {
        sink: &mut ws_sender,
        outbox,
        limit: state.idle_timeout,
        shutdown: state.shutdown.clone(),
    };
    let mut encoding = Encoding::default();
    let mut last_seen = Instant::now();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + state.heartbeat, state.heartbeat);

    let outcome: Result<(), WriteError> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        encoding = Encoding::Json;
                        forward(WireFrame::Text(text.as_str().to_owned()), id, &state.relay).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        encoding = Encoding::Binary;
                        forward(WireFrame::Binary(data.to_vec()), id, &state.relay).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if let Err(e) = writer.send(Message::Pong(data)).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {id} closed by peer");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {id}: {e}");
                        break Ok(());
                    }
                }
            }

            event = outbox.recv() => {
                let Some(event) = event else {
                    break Err(WriteError::QueueClosed);
                };
                match event.encode(encoding) {
                    Ok(frame) => {
                        if let Err(e) = writer.send(into_message(frame)).await {
                            break Err(e);
                        }
                    }
                    Err(e) => log::error!("Failed to encode {} for {id}: {e}", event.name()),
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > state.idle_timeout {
                    log::info!("Connection {id} silent for {:?}, timing out", state.idle_timeout);
                    break Ok(());
                }
                if let Err(e) = writer.send(Message::Ping(Vec::new().into())).await {
                    break Err(e);
                }
            }

            _ = wait_for_shutdown(state.shutdown.clone()) => {
                break Err(WriteError::Shutdown);
            }
        }
    };

    match outcome {
        Ok(()) => {}
        Err(WriteError::Shutdown) => {
            let _ = tokio::time::timeout(Duration::from_secs(1), ws_sender.send(Message::Close(None))).await;
        }
        Err(WriteError::Socket(e)) => log::warn!("Write to {id} failed: {e}"),
        Err(e) => log::warn!("Dropping connection {id}: {e}"),
    }
    Ok(())
}

/// Bounded socket writes for one connection.
struct Writer<'a> {
    sink: &'a mut SplitSink<WebSocket, Message>,
    outbox: &'a Outbox,
    limit: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Writer<'_> {
    /// Send one frame. Gives up when the peer has not taken it within
    /// `limit`, when the outbox closes meanwhile, or on shutdown.
    async fn send(&mut self, msg: Message) -> Result<(), WriteError> {
        tokio::select! {
            sent = tokio::time::timeout(self.limit, self.sink.send(msg)) => match sent {
                Ok(result) => Ok(result?),
                Err(_) => Err(WriteError::Stalled(self.limit)),
            },
            _ = self.outbox.closed() => Err(WriteError::QueueClosed),
            _ = wait_for_shutdown(self.shutdown.clone()) => Err(WriteError::Shutdown),
        }
    }
}

/// Decode one inbound frame and hand it to the hub. Malformed frames are
/// logged and skipped.
async fn forward(frame: WireFrame, id: ConnectionId, relay: &RelayHandle) -> Result<(), RelayError> {
    match ClientEvent::decode(&frame) {
        Ok(event) => {
            log::trace!("{} from {id} ({} bytes)", event.name(), frame.len());
            relay.dispatch(id, event).await
        }
        Err(e) => {
            log::warn!("Malformed frame from {id}: {e}");
            Ok(())
        }
    }
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}
