//! Audience policy: which joined connections receive which event.
//!
//! | Inbound            | Outbound          | Audience                    |
//! |--------------------|-------------------|-----------------------------|
//! | join (accepted)    | `user-joined`     | everyone except the joiner  |
//! | join (accepted)    | `update-users`    | the joiner only             |
//! | leave / disconnect | `user-left`       | everyone still present      |
//! | `code-change`      | `code-change`     | everyone except the sender  |
//! | `send-message`     | `receive-message` | everyone, sender included   |
//!
//! Buffer snapshots skip the sender so an editor never re-applies its own
//! edit and re-emits it. Chat includes the sender so every transcript is
//! built from the same relay-ordered stream.

use crate::presence::ConnectionId;
use crate::protocol::{ChatMessage, ClientEvent, ServerEvent};

/// Who receives an outbound event, among the joined members of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    EveryoneExcept(ConnectionId),
    Only(ConnectionId),
}

impl Audience {
    pub fn includes(&self, id: &ConnectionId) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::EveryoneExcept(excluded) => excluded != id,
            Audience::Only(target) => target == id,
        }
    }
}

/// An outbound event paired with its audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Route {
    pub fn new(audience: Audience, event: ServerEvent) -> Self {
        Self { audience, event }
    }
}

/// Announcement to existing members when `joiner` joins as `name`.
pub fn presence_joined(joiner: ConnectionId, name: &str) -> Route {
    Route::new(
        Audience::EveryoneExcept(joiner),
        ServerEvent::UserJoined(name.to_string()),
    )
}

/// Roster snapshot for the joiner: members present before it, in join order.
pub fn roster_snapshot(joiner: ConnectionId, names_before: Vec<String>) -> Route {
    Route::new(Audience::Only(joiner), ServerEvent::UpdateUsers(names_before))
}

/// Departure notice for everyone still present.
pub fn presence_left(name: &str) -> Route {
    Route::new(Audience::Everyone, ServerEvent::UserLeft(name.to_string()))
}

pub fn buffer_delta(sender: ConnectionId, content: String) -> Route {
    Route::new(
        Audience::EveryoneExcept(sender),
        ServerEvent::CodeChange(content),
    )
}

pub fn chat_message(message: ChatMessage) -> Route {
    Route::new(Audience::Everyone, ServerEvent::ReceiveMessage(message))
}

/// Route a content event. Membership events (join/leave) change presence
/// state first and are routed by the lifecycle manager, so they yield `None`.
pub fn route(sender: ConnectionId, event: ClientEvent) -> Option<Route> {
    match event {
        ClientEvent::CodeChange(content) => Some(buffer_delta(sender, content)),
        ClientEvent::SendMessage(message) => Some(chat_message(message)),
        ClientEvent::JoinRoom(_) | ClientEvent::LeaveRoom => None,
    }
}
