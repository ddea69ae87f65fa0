//! Connection lifecycle and fan-out: the single-writer relay state.
//!
//! ```text
//! connect ──► ConnectionId + Outbox         (no presence change)
//! join    ──► PresenceDirectory::add ──► user-joined → others
//!                                   └──► update-users → joiner
//! code    ──► code-change → others
//! chat    ──► receive-message → everyone
//! leave / disconnect ──► PresenceDirectory::remove ──► user-left → rest
//! ```
//!
//! `Relay` is plain synchronous state. It is owned by exactly one task (see
//! [`crate::hub`]), so every mutation runs to completion before the next
//! starts and roster snapshots never include a departed participant.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broadcast::{Delivery, Fanout, Outbox};
use crate::presence::{AddOutcome, ConnectionId, PresenceDirectory, RoomId};
use crate::protocol::{ChatMessage, ClientEvent};
use crate::routing::{self, Route};

/// Boundary rejections. None of these mutate presence state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("chat author must not be empty")]
    EmptyAuthor,
    #[error("chat text must not be empty")]
    EmptyMessage,
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),
    #[error("connection {0} has not joined")]
    NotJoined(ConnectionId),
    #[error("relay hub is not running")]
    HubClosed,
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub participants: usize,
    pub rooms: usize,
    /// Outbound events that reached at least one recipient.
    pub events_relayed: u64,
    /// Per-recipient pushes, whatever their outcome.
    pub deliveries: u64,
    pub superseded: u64,
    pub dropped: u64,
    pub rejected: u64,
}

struct Connection {
    room: RoomId,
    outbox: Arc<Outbox>,
}

pub struct Relay {
    connections: HashMap<ConnectionId, Connection>,
    directory: PresenceDirectory,
    queue_capacity: usize,
    queue_hard_limit: usize,
    stats: RelayStats,
}

impl Relay {
    pub fn new(queue_capacity: usize) -> Self {
        Self::with_limits(queue_capacity, queue_capacity.saturating_mul(4))
    }

    pub fn with_limits(queue_capacity: usize, queue_hard_limit: usize) -> Self {
        Self {
            connections: HashMap::new(),
            directory: PresenceDirectory::new(),
            queue_capacity,
            queue_hard_limit,
            stats: RelayStats::default(),
        }
    }

    /// Register a new transport connection in `room`.
    pub fn connect(&mut self, room: RoomId) -> (ConnectionId, Arc<Outbox>) {
        let id = ConnectionId::new();
        let outbox = Arc::new(Outbox::with_limits(self.queue_capacity, self.queue_hard_limit));
        log::debug!("Connection {id} opened in room {room}");
        self.connections.insert(
            id,
            Connection {
                room,
                outbox: outbox.clone(),
            },
        );
        self.stats.total_connections += 1;
        (id, outbox)
    }

    /// Add the connection to its room's presence set.
    ///
    /// A repeated join is ignored: the participant keeps the name every
    /// other member was told about, and nothing is announced.
    pub fn join(&mut self, id: ConnectionId, display_name: &str) -> Result<Fanout, RelayError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(self.reject(RelayError::EmptyDisplayName));
        }
        let room = match self.connections.get(&id) {
            Some(conn) => conn.room.clone(),
            None => return Err(self.reject(RelayError::NotConnected(id))),
        };

        let names_before = self.directory.names_in_order(&room);
        match self.directory.add(&room, id, name) {
            AddOutcome::AlreadyPresent { name: current } => {
                log::debug!("Ignoring repeated join as {name}; {id} stays {current} in room {room}");
                Ok(Fanout::empty())
            }
            AddOutcome::Added => {
                log::info!("{name} joined room {room} ({id})");
                let mut fanout = self.deliver(&room, routing::presence_joined(id, name));
                fanout.extend(self.deliver(&room, routing::roster_snapshot(id, names_before)));
                Ok(fanout)
            }
        }
    }

    /// Remove the connection from its room's presence set. The connection
    /// itself stays open. Unknown or never-joined connections are a no-op.
    pub fn leave(&mut self, id: ConnectionId) -> Fanout {
        let Some(room) = self.connections.get(&id).map(|conn| conn.room.clone()) else {
            return Fanout::empty();
        };
        match self.directory.remove(&room, &id) {
            Some(name) => {
                log::info!("{name} left room {room} ({id})");
                self.deliver(&room, routing::presence_left(&name))
            }
            None => Fanout::empty(),
        }
    }

    /// Tear down a transport connection, leaving first if it had joined.
    /// Idempotent.
    pub fn disconnect(&mut self, id: ConnectionId) -> Fanout {
        let fanout = self.leave(id);
        if let Some(conn) = self.connections.remove(&id) {
            conn.outbox.close();
            log::debug!("Connection {id} closed");
        }
        fanout
    }

    /// Relay a full buffer snapshot to every other member of the room.
    pub fn code_change(&mut self, id: ConnectionId, content: String) -> Result<Fanout, RelayError> {
        let room = self.joined_room(id)?;
        log::trace!("Buffer update from {id}: {} bytes", content.len());
        Ok(self.deliver(&room, routing::buffer_delta(id, content)))
    }

    /// Relay a chat message to every member of the room, sender included.
    pub fn send_message(&mut self, id: ConnectionId, message: ChatMessage) -> Result<Fanout, RelayError> {
        if message.author.trim().is_empty() {
            return Err(self.reject(RelayError::EmptyAuthor));
        }
        if message.text.trim().is_empty() {
            return Err(self.reject(RelayError::EmptyMessage));
        }
        let room = self.joined_room(id)?;
        log::debug!("Chat from {} in room {room}", message.author);
        Ok(self.deliver(&room, routing::chat_message(message)))
    }

    /// Dispatch an inbound client event.
    pub fn handle(&mut self, id: ConnectionId, event: ClientEvent) -> Result<Fanout, RelayError> {
        match event {
            ClientEvent::JoinRoom(name) => self.join(id, &name),
            ClientEvent::LeaveRoom => Ok(self.leave(id)),
            ClientEvent::CodeChange(content) => self.code_change(id, content),
            ClientEvent::SendMessage(message) => self.send_message(id, message),
        }
    }

    /// Names joined to `room`, in join order.
    pub fn names_in_order(&self, room: &RoomId) -> Vec<String> {
        self.directory.names_in_order(room)
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<&RoomId> {
        self.connections.get(id).map(|conn| &conn.room)
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn is_joined(&self, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|conn| self.directory.contains(&conn.room, id))
    }

    pub fn directory(&self) -> &PresenceDirectory {
        &self.directory
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_connections: self.connections.len(),
            participants: self.directory.len(),
            rooms: self.directory.room_count(),
            ..self.stats.clone()
        }
    }

    fn joined_room(&mut self, id: ConnectionId) -> Result<RoomId, RelayError> {
        let room = match self.connections.get(&id) {
            Some(conn) => conn.room.clone(),
            None => return Err(self.reject(RelayError::NotConnected(id))),
        };
        if !self.directory.contains(&room, &id) {
            return Err(self.reject(RelayError::NotJoined(id)));
        }
        Ok(room)
    }

    fn reject(&mut self, err: RelayError) -> RelayError {
        self.stats.rejected += 1;
        err
    }

    /// Push one event to every joined member of `room` the route addresses.
    fn deliver(&mut self, room: &RoomId, route: Route) -> Fanout {
        let recipients: Vec<ConnectionId> = self
            .directory
            .participants(room)
            .map(|p| p.connection_id)
            .filter(|id| route.audience.includes(id))
            .collect();

        let event = Arc::new(route.event);
        let mut fanout = Fanout::empty();
        for id in recipients {
            let delivery = match self.connections.get(&id) {
                Some(conn) => conn.outbox.push(event.clone()),
                None => Delivery::Dropped,
            };
            match delivery {
                Delivery::Queued => {}
                Delivery::Superseded => self.stats.superseded += 1,
                Delivery::Dropped => {
                    self.stats.dropped += 1;
                    log::warn!("Dropped {} for {id}: outbound queue closed", event.name());
                }
            }
            fanout.record(id, delivery);
        }

        if !fanout.is_empty() {
            self.stats.events_relayed += 1;
            self.stats.deliveries += fanout.len() as u64;
        }
        fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;

    fn received(outbox: &Outbox) -> Vec<ServerEvent> {
        outbox.drain().iter().map(|e| (**e).clone()).collect()
    }

    fn lobby() -> RoomId {
        RoomId::default()
    }

    #[test]
    fn test_alice_and_bob_scenario() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(lobby());

        relay.join(a, "Alice").unwrap();
        assert_eq!(received(&a_out), vec![ServerEvent::UpdateUsers(vec![])]);

        relay.join(b, "Bob").unwrap();
        assert_eq!(received(&b_out), vec![ServerEvent::UpdateUsers(vec!["Alice".into()])]);
        assert_eq!(received(&a_out), vec![ServerEvent::UserJoined("Bob".into())]);

        relay.code_change(a, "x=1".into()).unwrap();
        assert_eq!(received(&b_out), vec![ServerEvent::CodeChange("x=1".into())]);
        assert!(a_out.is_empty());

        let hi = ChatMessage::new("Bob", "hi");
        relay.send_message(b, hi.clone()).unwrap();
        assert_eq!(received(&a_out), vec![ServerEvent::ReceiveMessage(hi.clone())]);
        assert_eq!(received(&b_out), vec![ServerEvent::ReceiveMessage(hi)]);

        relay.disconnect(a);
        assert_eq!(received(&b_out), vec![ServerEvent::UserLeft("Alice".into())]);
        assert!(a_out.is_closed());
        assert_eq!(relay.names_in_order(&lobby()), vec!["Bob"]);
    }

    #[test]
    fn test_update_users_excludes_joiner() {
        let mut relay = Relay::new(64);
        let mut outboxes = Vec::new();
        for name in ["Ann", "Ben", "Cat"] {
            let (id, outbox) = relay.connect(lobby());
            relay.join(id, name).unwrap();
            outboxes.push(outbox);
        }

        let events = received(&outboxes[2]);
        assert_eq!(events, vec![ServerEvent::UpdateUsers(vec!["Ann".into(), "Ben".into()])]);
    }

    #[test]
    fn test_join_fanout_reports_each_recipient() {
        let mut relay = Relay::new(64);
        let (a, _a_out) = relay.connect(lobby());
        let (b, _b_out) = relay.connect(lobby());
        let (c, _c_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();

        let fanout = relay.join(c, "Carol").unwrap();

        // user-joined to a and b, then update-users to c.
        assert_eq!(fanout.recipients(), vec![a, b, c]);
        assert_eq!(fanout.count(Delivery::Queued), 3);
    }

    #[test]
    fn test_code_change_reaches_every_other_member() {
        let mut relay = Relay::new(64);
        let ids: Vec<_> = (0..5)
            .map(|i| {
                let (id, outbox) = relay.connect(lobby());
                relay.join(id, &format!("user{i}")).unwrap();
                (id, outbox)
            })
            .collect();
        for (_, outbox) in &ids {
            outbox.drain();
        }

        let sender = ids[2].0;
        let fanout = relay.code_change(sender, "let x = 2;".into()).unwrap();

        assert_eq!(fanout.len(), 4);
        assert!(!fanout.reached(&sender));
        for (id, outbox) in &ids {
            let events = received(outbox);
            if *id == sender {
                assert!(events.is_empty());
            } else {
                assert_eq!(events, vec![ServerEvent::CodeChange("let x = 2;".into())]);
            }
        }
    }

    #[test]
    fn test_chat_reaches_everyone_exactly_once() {
        let mut relay = Relay::new(64);
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let (id, outbox) = relay.connect(lobby());
                relay.join(id, &format!("user{i}")).unwrap();
                outbox.drain();
                (id, outbox)
            })
            .collect();
        for (_, outbox) in &ids {
            outbox.drain();
        }

        let message = ChatMessage::new("user0", "standup in 5");
        relay.send_message(ids[0].0, message.clone()).unwrap();

        for (_, outbox) in &ids {
            assert_eq!(received(outbox), vec![ServerEvent::ReceiveMessage(message.clone())]);
        }
    }

    #[test]
    fn test_unjoined_connections_are_never_addressed() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        let (b, _b_out) = relay.connect(lobby());
        let (_lurker, lurker_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();

        relay.code_change(b, "draft".into()).unwrap();
        relay.send_message(a, ChatMessage::new("Alice", "hello")).unwrap();
        relay.disconnect(b);

        assert!(lurker_out.is_empty());
        assert!(!a_out.is_empty());
    }

    #[test]
    fn test_disconnect_without_join_is_silent() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        a_out.drain();
        let (lurker, _) = relay.connect(lobby());

        let fanout = relay.disconnect(lurker);

        assert!(fanout.is_empty());
        assert!(a_out.is_empty());
        assert!(!relay.is_connected(&lurker));
    }

    #[test]
    fn test_leave_then_disconnect_announces_once() {
        let mut relay = Relay::new(64);
        let (a, _a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        b_out.drain();

        assert_eq!(relay.leave(a).len(), 1);
        assert!(relay.leave(a).is_empty());
        assert!(relay.disconnect(a).is_empty());
        assert!(relay.disconnect(a).is_empty());

        assert_eq!(received(&b_out), vec![ServerEvent::UserLeft("Alice".into())]);
    }

    #[test]
    fn test_unknown_connection_is_noop() {
        let mut relay = Relay::new(64);
        let ghost = ConnectionId::new();
        assert!(relay.leave(ghost).is_empty());
        assert!(relay.disconnect(ghost).is_empty());
        assert_eq!(relay.stats().rejected, 0);
    }

    #[test]
    fn test_rejoin_after_leave_is_a_fresh_join() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        relay.leave(a);
        a_out.drain();
        b_out.drain();

        relay.join(a, "Alice").unwrap();

        assert_eq!(relay.names_in_order(&lobby()), vec!["Bob", "Alice"]);
        assert_eq!(received(&a_out), vec![ServerEvent::UpdateUsers(vec!["Bob".into()])]);
        assert_eq!(received(&b_out), vec![ServerEvent::UserJoined("Alice".into())]);
    }

    #[test]
    fn test_duplicate_join_keeps_announced_name() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        a_out.drain();
        b_out.drain();

        let fanout = relay.join(a, "Alicia").unwrap();

        assert!(fanout.is_empty());
        assert!(a_out.is_empty());
        assert!(b_out.is_empty());
        assert_eq!(relay.names_in_order(&lobby()), vec!["Alice", "Bob"]);

        // Departure uses the name Bob saw on join, so his roster stays exact.
        relay.disconnect(a);
        assert_eq!(received(&b_out), vec![ServerEvent::UserLeft("Alice".into())]);
    }

    #[test]
    fn test_empty_display_name_rejected() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());

        assert_eq!(relay.join(a, ""), Err(RelayError::EmptyDisplayName));
        assert_eq!(relay.join(a, "   "), Err(RelayError::EmptyDisplayName));
        assert!(!relay.is_joined(&a));
        assert!(a_out.is_empty());
        assert_eq!(relay.stats().rejected, 2);
    }

    #[test]
    fn test_display_name_is_trimmed() {
        let mut relay = Relay::new(64);
        let (a, _) = relay.connect(lobby());
        relay.join(a, "  Alice \n").unwrap();
        assert_eq!(relay.names_in_order(&lobby()), vec!["Alice"]);
    }

    #[test]
    fn test_join_requires_connection() {
        let mut relay = Relay::new(64);
        let ghost = ConnectionId::new();
        assert_eq!(relay.join(ghost, "Ghost"), Err(RelayError::NotConnected(ghost)));
        assert!(relay.directory().is_empty());
    }

    #[test]
    fn test_empty_chat_rejected() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        a_out.drain();

        assert_eq!(
            relay.send_message(a, ChatMessage::new("Alice", "  ")),
            Err(RelayError::EmptyMessage)
        );
        assert_eq!(
            relay.send_message(a, ChatMessage::new("", "hi")),
            Err(RelayError::EmptyAuthor)
        );
        assert!(a_out.is_empty());
    }

    #[test]
    fn test_content_from_unjoined_sender_rejected() {
        let mut relay = Relay::new(64);
        let (a, a_out) = relay.connect(lobby());
        let (lurker, _) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        a_out.drain();

        assert_eq!(
            relay.code_change(lurker, "spam".into()),
            Err(RelayError::NotJoined(lurker))
        );
        assert_eq!(
            relay.send_message(lurker, ChatMessage::new("Eve", "spam")),
            Err(RelayError::NotJoined(lurker))
        );
        assert!(a_out.is_empty());
    }

    #[test]
    fn test_rooms_do_not_leak() {
        let mut relay = Relay::new(64);
        let review = RoomId::new("review");
        let (a, a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(review.clone());
        let (c, c_out) = relay.connect(review.clone());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        relay.join(c, "Carol").unwrap();
        a_out.drain();
        b_out.drain();

        assert_eq!(received(&c_out), vec![ServerEvent::UpdateUsers(vec!["Bob".into()])]);

        relay.code_change(b, "review notes".into()).unwrap();
        relay.send_message(a, ChatMessage::new("Alice", "lobby only")).unwrap();

        assert_eq!(received(&c_out), vec![ServerEvent::CodeChange("review notes".into())]);
        assert_eq!(
            received(&a_out),
            vec![ServerEvent::ReceiveMessage(ChatMessage::new("Alice", "lobby only"))]
        );
        assert!(b_out.is_empty());
        assert_eq!(relay.stats().rooms, 2);
    }

    #[test]
    fn test_slow_recipient_gets_latest_buffer() {
        let mut relay = Relay::with_limits(2, 8);
        let (a, a_out) = relay.connect(lobby());
        let (b, b_out) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        a_out.drain();
        b_out.drain();

        for version in 1..=5 {
            relay.code_change(a, format!("v{version}")).unwrap();
        }

        let events = received(&b_out);
        assert_eq!(
            events,
            vec![
                ServerEvent::CodeChange("v4".into()),
                ServerEvent::CodeChange("v5".into()),
            ]
        );
        assert_eq!(relay.stats().superseded, 3);
    }

    #[test]
    fn test_names_in_order_property() {
        // Deterministic pseudo-random join/leave sequence.
        let mut relay = Relay::new(64);
        let mut expected: Vec<(ConnectionId, String)> = Vec::new();
        let mut pool: Vec<ConnectionId> = Vec::new();
        let mut seed: u32 = 0x2545_F491;

        for step in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if pool.is_empty() || seed % 3 != 0 {
                let (id, _) = relay.connect(lobby());
                let name = format!("p{step}");
                relay.join(id, &name).unwrap();
                expected.push((id, name));
                pool.push(id);
            } else {
                let id = pool.remove(seed as usize % pool.len());
                if seed % 2 == 0 {
                    relay.leave(id);
                } else {
                    relay.disconnect(id);
                }
                expected.retain(|(e, _)| *e != id);
            }
            let names: Vec<String> = expected.iter().map(|(_, n)| n.clone()).collect();
            assert_eq!(relay.names_in_order(&lobby()), names);
        }
    }

    #[test]
    fn test_stats_track_activity() {
        let mut relay = Relay::new(64);
        let (a, _) = relay.connect(lobby());
        let (b, _) = relay.connect(lobby());
        relay.join(a, "Alice").unwrap();
        relay.join(b, "Bob").unwrap();
        relay.code_change(a, "x".into()).unwrap();
        relay.disconnect(a);

        let stats = relay.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.participants, 1);
        assert_eq!(stats.rooms, 1);
        // update-users(a), user-joined + update-users (b), code-change, user-left
        assert_eq!(stats.events_relayed, 5);
    }
}
