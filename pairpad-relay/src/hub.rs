//! Coordination task that owns the [`Relay`].
//!
//! Connection tasks never touch presence state. They send [`Command`]s over
//! one mpsc channel and the hub applies them one at a time:
//!
//! ```text
//! conn task A ──┐
//! conn task B ──┼── mpsc<Command> ──► RelayHub (owns Relay) ──► Outboxes
//! conn task C ──┘
//! ```
//!
//! A single channel keeps each connection's commands in send order, which is
//! what gives per-sender FIFO delivery to every recipient.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{Fanout, Outbox};
use crate::presence::{ConnectionId, RoomId};
use crate::protocol::ClientEvent;
use crate::relay::{Relay, RelayError, RelayStats};

/// Default command channel depth.
pub const COMMAND_CAPACITY: usize = 1024;

/// Requests handled by the hub.
pub enum Command {
    Connect {
        room: RoomId,
        reply: oneshot::Sender<(ConnectionId, Arc<Outbox>)>,
    },
    Event {
        id: ConnectionId,
        event: ClientEvent,
        reply: Option<oneshot::Sender<Result<Fanout, RelayError>>>,
    },
    Disconnect {
        id: ConnectionId,
    },
    Roster {
        room: RoomId,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// The hub task: owns the relay and drains commands.
pub struct RelayHub {
    relay: Relay,
    commands: mpsc::Receiver<Command>,
}

impl RelayHub {
    /// Create a hub and the handle used to reach it.
    pub fn new(relay: Relay) -> (Self, RelayHandle) {
        Self::with_capacity(relay, COMMAND_CAPACITY)
    }

    pub fn with_capacity(relay: Relay, capacity: usize) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                relay,
                commands: rx,
            },
            RelayHandle { commands: tx },
        )
    }

    /// Process commands until every handle is dropped. Returns the relay so
    /// callers can inspect final state.
    pub async fn run(mut self) -> Relay {
        log::debug!("Relay hub started");
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        log::debug!("Relay hub stopped");
        self.relay
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Connect { room, reply } => {
                let (id, outbox) = self.relay.connect(room);
                if reply.send((id, outbox)).is_err() {
                    // Requester vanished before we answered.
                    self.relay.disconnect(id);
                }
            }
            Command::Event { id, event, reply } => {
                let name = event.name();
                let result = self.relay.handle(id, event);
                if let Err(err) = &result {
                    log::warn!("Rejected {name} from {id}: {err}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Disconnect { id } => {
                self.relay.disconnect(id);
            }
            Command::Roster { room, reply } => {
                let _ = reply.send(self.relay.names_in_order(&room));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.relay.stats());
            }
        }
    }
}

/// Cloneable handle to the hub.
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
}

impl RelayHandle {
    async fn send(&self, command: Command) -> Result<(), RelayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RelayError::HubClosed)
    }

    /// Register a transport connection.
    pub async fn connect(&self, room: RoomId) -> Result<(ConnectionId, Arc<Outbox>), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { room, reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Forward an inbound event without waiting for its outcome.
    pub async fn dispatch(&self, id: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        self.send(Command::Event {
            id,
            event,
            reply: None,
        })
        .await
    }

    /// Forward an inbound event and wait for its per-recipient results.
    pub async fn submit(&self, id: ConnectionId, event: ClientEvent) -> Result<Fanout, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Event {
            id,
            event,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| RelayError::HubClosed)?
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), RelayError> {
        self.send(Command::Disconnect { id }).await
    }

    /// Names joined to `room`, in join order.
    pub async fn roster(&self, room: RoomId) -> Result<Vec<String>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Roster { room, reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }
}
