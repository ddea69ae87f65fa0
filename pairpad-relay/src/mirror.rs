//! Client-side view of a room: roster, chat transcript and buffer.
//!
//! The mirror is transport-free. Remote events go in through
//! [`SessionMirror::apply`]; user actions come out as [`ClientEvent`]s for
//! whatever connection the caller owns.
//!
//! The buffer is replaced wholesale by every remote `code-change`. An editor
//! change callback that fires because of that overwrite reports the same
//! content back through [`SessionMirror::local_edit`], which yields nothing,
//! so a remote snapshot is never re-emitted.

use crate::protocol::{ChatMessage, ClientEvent, ServerEvent};

/// Local state of one participant's session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMirror {
    display_name: Option<String>,
    roster: Vec<String>,
    transcript: Vec<ChatMessage>,
    buffer: String,
    notices: Vec<String>,
}

impl SessionMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session as `name`. Blank names produce no event.
    pub fn join_event(&mut self, name: &str) -> Option<ClientEvent> {
        let name = name.trim();
        if name.is_empty() {
            self.notice("Display name is required");
            return None;
        }
        self.display_name = Some(name.to_string());
        Some(ClientEvent::JoinRoom(name.to_string()))
    }

    /// End the session. The returned `leave-room` must be sent before the
    /// connection is torn down. Local state is cleared.
    pub fn leave_event(&mut self) -> Option<ClientEvent> {
        self.display_name.take()?;
        self.roster.clear();
        self.transcript.clear();
        self.buffer.clear();
        Some(ClientEvent::LeaveRoom)
    }

    /// Record a local edit. Returns the event to send, or `None` when the
    /// content already matches the buffer.
    pub fn local_edit(&mut self, content: &str) -> Option<ClientEvent> {
        if content == self.buffer {
            return None;
        }
        self.buffer = content.to_string();
        Some(ClientEvent::CodeChange(self.buffer.clone()))
    }

    /// Build a chat event. The message is not added to the transcript here;
    /// it shows up once, when the relay sends it back.
    pub fn compose_chat(&self, text: &str) -> Option<ClientEvent> {
        let author = self.display_name.as_deref()?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(ClientEvent::SendMessage(ChatMessage::new(author, text)))
    }

    /// Apply one event from the relay.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::UpdateUsers(names) => {
                self.roster = names.clone();
                if let Some(me) = &self.display_name {
                    self.roster.push(me.clone());
                }
            }
            ServerEvent::UserJoined(name) => {
                self.roster.push(name.clone());
                self.notice(format!("{name} joined"));
            }
            ServerEvent::UserLeft(name) => {
                if let Some(pos) = self.roster.iter().position(|n| n == name) {
                    self.roster.remove(pos);
                }
                self.notice(format!("{name} left"));
            }
            ServerEvent::CodeChange(content) => {
                self.buffer.clone_from(content);
            }
            ServerEvent::ReceiveMessage(message) => {
                self.transcript.push(message.clone());
            }
        }
    }

    /// Surface a transport failure to the user. Session state is kept.
    pub fn connection_lost(&mut self, reason: &str) {
        self.notice(format!("Connection lost: {reason}"));
    }

    fn notice(&mut self, text: impl Into<String>) {
        self.notices.push(text.into());
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.display_name.is_some()
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Take pending notices, e.g. to show them as toasts.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }
}
