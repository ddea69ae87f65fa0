//! # pairpad-relay — Presence and event relay for a shared code buffer
//!
//! Participants join a room under a display name, publish full snapshots of
//! a shared text buffer and chat. The relay tracks who is present and fans
//! every event out to the right members of the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ RelayServer   │
//! │ + Mirror      │   JSON / bincode   │ (per conn)    │
//! └───────────────┘                    └───────┬───────┘
//!                                              │ Command
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │ RelayHub      │
//!                                      │ owns Relay    │
//!                                      └───────┬───────┘
//!                                              │ Route
//!                                      ┌───────┴───────┐
//!                                      │ Outbox (per   │
//!                                      │ connection)   │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Event vocabulary and wire codecs
//! - [`presence`] — Per-room directory of joined participants
//! - [`routing`] — Which members receive which event
//! - [`broadcast`] — Bounded per-connection queues
//! - [`relay`] — Connection lifecycle and fan-out
//! - [`hub`] — Task that owns the relay
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket session client
//! - [`mirror`] — Client-side view of a room

pub mod protocol;
pub mod presence;
pub mod routing;
pub mod broadcast;
pub mod relay;
pub mod hub;
pub mod server;
pub mod client;
pub mod mirror;

// Re-exports for convenience
pub use protocol::{ChatMessage, ClientEvent, Encoding, ProtocolError, ServerEvent, WireFrame};
pub use presence::{ConnectionId, Participant, PresenceDirectory, RoomId, DEFAULT_ROOM};
pub use routing::{Audience, Route};
pub use broadcast::{Delivery, Fanout, Outbox};
pub use relay::{Relay, RelayError, RelayStats};
pub use hub::{RelayHandle, RelayHub};
pub use server::{RelayServer, ServerConfig, ServerError, ShutdownTrigger, LIVENESS_BODY};
pub use client::{ClientError, ConnectionState, SessionClient, SessionEvent};
pub use mirror::SessionMirror;
