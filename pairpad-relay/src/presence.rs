//! Presence directory: who is currently joined, per room.
//!
//! ```text
//! PresenceDirectory
//!   ├── "lobby"         IndexMap { conn-a → Alice, conn-b → Bob }
//!   └── "design-review" IndexMap { conn-c → Carol }
//! ```
//!
//! Each room keeps its participants in join order so the roster snapshot a
//! newcomer receives lists the existing population oldest first. Removal
//! uses `shift_remove` to keep that order intact.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Room used when a connection does not name one.
pub const DEFAULT_ROOM: &str = "lobby";

/// Opaque identity of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a shared session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            return Self::default();
        }
        Self(name)
    }

    /// Derive a room from a WebSocket request path.
    ///
    /// `/` and the empty path map to the default room; `/design-review?x=1`
    /// maps to `design-review`.
    pub fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        Self::new(path.trim_matches('/'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self(DEFAULT_ROOM.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A joined connection and the name it joined under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

/// Result of [`PresenceDirectory::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new participant was appended to the room.
    Added,
    /// The connection was already present; it keeps the name it joined with.
    AlreadyPresent { name: String },
}

/// Authoritative record of who is joined, keyed by room then connection.
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    rooms: HashMap<RoomId, IndexMap<ConnectionId, Participant>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. A second add for the same connection leaves
    /// the entry untouched, name and position included.
    pub fn add(&mut self, room: &RoomId, id: ConnectionId, name: impl Into<String>) -> AddOutcome {
        let name = name.into();
        let members = self.rooms.entry(room.clone()).or_default();
        match members.get(&id) {
            Some(existing) => AddOutcome::AlreadyPresent {
                name: existing.display_name.clone(),
            },
            None => {
                members.insert(
                    id,
                    Participant {
                        connection_id: id,
                        display_name: name,
                    },
                );
                AddOutcome::Added
            }
        }
    }

    /// Remove a participant, returning its display name. Empty rooms are
    /// dropped.
    pub fn remove(&mut self, room: &RoomId, id: &ConnectionId) -> Option<String> {
        let members = self.rooms.get_mut(room)?;
        let removed = members.shift_remove(id)?;
        if members.is_empty() {
            self.rooms.remove(room);
        }
        Some(removed.display_name)
    }

    /// Display names in join order.
    pub fn names_in_order(&self, room: &RoomId) -> Vec<String> {
        self.participants(room)
            .map(|p| p.display_name.clone())
            .collect()
    }

    /// Participants in join order.
    pub fn participants(&self, room: &RoomId) -> impl Iterator<Item = &Participant> {
        self.rooms.get(room).into_iter().flat_map(|members| members.values())
    }

    pub fn contains(&self, room: &RoomId, id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains_key(id))
    }

    pub fn display_name(&self, room: &RoomId, id: &ConnectionId) -> Option<&str> {
        self.rooms
            .get(room)?
            .get(id)
            .map(|p| p.display_name.as_str())
    }

    /// Number of participants in one room.
    pub fn room_len(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, |members| members.len())
    }

    /// Number of participants across all rooms.
    pub fn len(&self) -> usize {
        self.rooms.values().map(|members| members.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> RoomId {
        RoomId::default()
    }

    #[test]
    fn test_names_follow_join_order() {
        let mut dir = PresenceDirectory::new();
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());

        dir.add(&lobby(), a, "Alice");
        dir.add(&lobby(), b, "Bob");
        dir.add(&lobby(), c, "Carol");

        assert_eq!(dir.names_in_order(&lobby()), vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn test_remove_keeps_remaining_order() {
        let mut dir = PresenceDirectory::new();
        let ids: Vec<_> = (0..4).map(|_| ConnectionId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            dir.add(&lobby(), *id, format!("user{i}"));
        }

        assert_eq!(dir.remove(&lobby(), &ids[1]).as_deref(), Some("user1"));
        assert_eq!(dir.names_in_order(&lobby()), vec!["user0", "user2", "user3"]);
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let mut dir = PresenceDirectory::new();
        assert!(dir.remove(&lobby(), &ConnectionId::new()).is_none());

        dir.add(&lobby(), ConnectionId::new(), "Alice");
        assert!(dir.remove(&lobby(), &ConnectionId::new()).is_none());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_duplicate_add_keeps_first_name() {
        let mut dir = PresenceDirectory::new();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        dir.add(&lobby(), a, "Alice");
        dir.add(&lobby(), b, "Bob");

        let outcome = dir.add(&lobby(), a, "Alicia");

        assert_eq!(outcome, AddOutcome::AlreadyPresent { name: "Alice".into() });
        assert_eq!(dir.names_in_order(&lobby()), vec!["Alice", "Bob"]);
        assert_eq!(dir.room_len(&lobby()), 2);
    }

    #[test]
    fn test_display_names_need_not_be_unique() {
        let mut dir = PresenceDirectory::new();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        dir.add(&lobby(), a, "Sam");
        dir.add(&lobby(), b, "Sam");

        assert_eq!(dir.names_in_order(&lobby()), vec!["Sam", "Sam"]);
        dir.remove(&lobby(), &a);
        assert!(dir.contains(&lobby(), &b));
        assert!(!dir.contains(&lobby(), &a));
    }

    #[test]
    fn test_rooms_are_isolated_and_pruned() {
        let mut dir = PresenceDirectory::new();
        let review = RoomId::new("review");
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        dir.add(&lobby(), a, "Alice");
        dir.add(&review, b, "Bob");
        assert_eq!(dir.room_count(), 2);
        assert_eq!(dir.names_in_order(&review), vec!["Bob"]);
        assert!(!dir.contains(&lobby(), &b));

        dir.remove(&review, &b);
        assert_eq!(dir.room_count(), 1);
        assert!(dir.names_in_order(&review).is_empty());
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(RoomId::from_path("/"), RoomId::default());
        assert_eq!(RoomId::from_path(""), RoomId::default());
        assert_eq!(RoomId::from_path("/design-review").as_str(), "design-review");
        assert_eq!(RoomId::from_path("/design-review/?v=2").as_str(), "design-review");
        assert_eq!(RoomId::from_path("/?token=abc"), RoomId::default());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
