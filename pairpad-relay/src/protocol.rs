//! Event vocabulary and wire codec.
//!
//! Two frame encodings carry the same events:
//!
//! ```text
//! Text frame   {"event": "code-change", "data": "x = 1"}     (JSON envelope)
//! Binary frame bincode(ClientEvent | ServerEvent)            (native clients)
//! ```
//!
//! The JSON envelope mirrors socket.io-style event frames so browser clients
//! can speak the protocol without a codec of their own.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → relay: join the room under a display name.
pub const JOIN_ROOM: &str = "join-room";
/// Client → relay: explicit leave.
pub const LEAVE_ROOM: &str = "leave-room";
/// Bidirectional: full buffer content after an edit.
pub const CODE_CHANGE: &str = "code-change";
/// Client → relay: chat message.
pub const SEND_MESSAGE: &str = "send-message";
/// Relay → clients: chat message fan-out.
pub const RECEIVE_MESSAGE: &str = "receive-message";
/// Relay → other clients: someone joined.
pub const USER_JOINED: &str = "user-joined";
/// Relay → remaining clients: someone left.
pub const USER_LEFT: &str = "user-left";
/// Relay → joining client: who was already here.
pub const UPDATE_USERS: &str = "update-users";

/// A chat message. Immutable once sent, never stored by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            text: text.into(),
        }
    }
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    JoinRoom(String),
    CodeChange(String),
    SendMessage(ChatMessage),
    LeaveRoom,
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    UserJoined(String),
    UpdateUsers(Vec<String>),
    CodeChange(String),
    ReceiveMessage(ChatMessage),
    UserLeft(String),
}

/// Frame encoding negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Binary,
}

/// An encoded frame, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn encoding(&self) -> Encoding {
        match self {
            WireFrame::Text(_) => Encoding::Json,
            WireFrame::Binary(_) => Encoding::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct OutEnvelope<'a, T: Serialize> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
}

#[derive(Deserialize)]
struct InEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

fn to_envelope<T: Serialize>(event: &str, data: Option<&T>) -> Result<String, ProtocolError> {
    serde_json::to_string(&OutEnvelope { event, data })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_envelope(text: &str) -> Result<InEnvelope, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    if data.is_null() {
        return Err(ProtocolError::MissingPayload(event.to_string()));
    }
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_bincode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => JOIN_ROOM,
            ClientEvent::CodeChange(_) => CODE_CHANGE,
            ClientEvent::SendMessage(_) => SEND_MESSAGE,
            ClientEvent::LeaveRoom => LEAVE_ROOM,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        match self {
            ClientEvent::JoinRoom(name) => to_envelope(self.name(), Some(name)),
            ClientEvent::CodeChange(content) => to_envelope(self.name(), Some(content)),
            ClientEvent::SendMessage(message) => to_envelope(self.name(), Some(message)),
            ClientEvent::LeaveRoom => to_envelope::<()>(self.name(), None),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope = from_envelope(text)?;
        let event = envelope.event.as_str();
        match event {
            JOIN_ROOM => payload(event, envelope.data).map(ClientEvent::JoinRoom),
            CODE_CHANGE => payload(event, envelope.data).map(ClientEvent::CodeChange),
            SEND_MESSAGE => payload(event, envelope.data).map(ClientEvent::SendMessage),
            LEAVE_ROOM => Ok(ClientEvent::LeaveRoom),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        to_bincode(self)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_bincode(bytes)
    }

    pub fn encode(&self, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
        match encoding {
            Encoding::Json => self.to_json().map(WireFrame::Text),
            Encoding::Binary => self.to_binary().map(WireFrame::Binary),
        }
    }

    pub fn decode(frame: &WireFrame) -> Result<Self, ProtocolError> {
        match frame {
            WireFrame::Text(text) => Self::from_json(text),
            WireFrame::Binary(bytes) => Self::from_binary(bytes),
        }
    }
}

impl ServerEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoined(_) => USER_JOINED,
            ServerEvent::UpdateUsers(_) => UPDATE_USERS,
            ServerEvent::CodeChange(_) => CODE_CHANGE,
            ServerEvent::ReceiveMessage(_) => RECEIVE_MESSAGE,
            ServerEvent::UserLeft(_) => USER_LEFT,
        }
    }

    /// Whether a newer event of the same kind makes this one obsolete.
    ///
    /// Only buffer snapshots qualify: each one carries the whole document.
    /// Presence and chat events are append-only facts.
    pub fn is_superseded_by_newer(&self) -> bool {
        matches!(self, ServerEvent::CodeChange(_))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        match self {
            ServerEvent::UserJoined(name) | ServerEvent::UserLeft(name) => {
                to_envelope(self.name(), Some(name))
            }
            ServerEvent::UpdateUsers(names) => to_envelope(self.name(), Some(names)),
            ServerEvent::CodeChange(content) => to_envelope(self.name(), Some(content)),
            ServerEvent::ReceiveMessage(message) => to_envelope(self.name(), Some(message)),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope = from_envelope(text)?;
        let event = envelope.event.as_str();
        match event {
            USER_JOINED => payload(event, envelope.data).map(ServerEvent::UserJoined),
            UPDATE_USERS => payload(event, envelope.data).map(ServerEvent::UpdateUsers),
            CODE_CHANGE => payload(event, envelope.data).map(ServerEvent::CodeChange),
            RECEIVE_MESSAGE => payload(event, envelope.data).map(ServerEvent::ReceiveMessage),
            USER_LEFT => payload(event, envelope.data).map(ServerEvent::UserLeft),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        to_bincode(self)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_bincode(bytes)
    }

    pub fn encode(&self, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
        match encoding {
            Encoding::Json => self.to_json().map(WireFrame::Text),
            Encoding::Binary => self.to_binary().map(WireFrame::Binary),
        }
    }

    pub fn decode(frame: &WireFrame) -> Result<Self, ProtocolError> {
        match frame {
            WireFrame::Text(text) => Self::from_json(text),
            WireFrame::Binary(bytes) => Self::from_binary(bytes),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("event `{0}` is missing its payload")]
    MissingPayload(String),
    #[error("invalid payload for `{event}`: {reason}")]
    InvalidPayload { event: String, reason: String },
}
