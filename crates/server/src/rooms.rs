//! Runtime mapping of project rooms to live connections.
//!
//! One registry per server instance, shared by `Arc`. Nothing here is
//! persisted: a restart starts empty and clients re-join explicitly.
//!
//! Lock order is always `connections` before `rooms`; no method holds a map
//! guard across an `.await` (none of them are async).

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::dispatch::Outbound;

pub type ConnectionId = u64;

struct ConnectionEntry {
    user_id: String,
    outbound: mpsc::Sender<Outbound>,
    rooms: HashSet<String>,
}

/// What a connection occupied when it was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: String,
    /// Rooms the connection was in, sorted.
    pub rooms: Vec<String>,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's identity and outbound queue.
    pub fn register(&self, id: ConnectionId, user_id: String, outbound: mpsc::Sender<Outbound>) {
        self.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                outbound,
                rooms: HashSet::new(),
            },
        );
    }

    /// Remove a connection and all of its room memberships.
    ///
    /// Returns `Some` exactly once per registration, so teardown side effects
    /// keyed on it cannot run twice.
    pub fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let (_, entry) = self.connections.remove(&id)?;
        for room in &entry.rooms {
            self.remove_from_room(room, id);
        }

        let mut rooms: Vec<String> = entry.rooms.into_iter().collect();
        rooms.sort();
        Some(Departure {
            user_id: entry.user_id,
            rooms,
        })
    }

    /// Add a registered connection to a room. Returns false if it was
    /// already there or the connection is unknown.
    pub fn join(&self, room: &str, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if !entry.rooms.insert(room.to_string()) {
            return false;
        }
        // Still holding the connection entry: a concurrent unregister waits
        // for us, then sees this room and cleans it up.
        self.rooms.entry(room.to_string()).or_default().insert(id);
        true
    }

    /// Remove a connection from a room. Returns false if it wasn't there.
    pub fn leave(&self, room: &str, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if !entry.rooms.remove(room) {
            return false;
        }
        self.remove_from_room(room, id);
        true
    }

    fn remove_from_room(&self, room: &str, id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Rooms a connection currently occupies, sorted.
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .connections
            .get(&id)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    #[cfg(test)]
    pub fn user_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).map(|entry| entry.user_id.clone())
    }

    #[cfg(test)]
    pub fn is_member(&self, room: &str, id: ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&id))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Snapshot of a room's members. Only the dispatcher reads this.
    pub(crate) fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn outbound(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.connections.get(&id).map(|entry| entry.outbound.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[(ConnectionId, &str)]) -> RoomRegistry {
        let registry = RoomRegistry::new();
        for (id, user) in ids {
            let (tx, _rx) = mpsc::channel(4);
            registry.register(*id, user.to_string(), tx);
        }
        registry
    }

    #[test]
    fn join_is_idempotent() {
        let registry = registry_with(&[(1, "alice")]);

        assert!(registry.join("project:p1", 1));
        assert!(!registry.join("project:p1", 1));
        assert_eq!(registry.members_of("project:p1"), vec![1]);
    }

    #[test]
    fn unknown_connection_cannot_join() {
        let registry = RoomRegistry::new();
        assert!(!registry.join("project:p1", 42));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leave_is_idempotent_and_evicts_empty_rooms() {
        let registry = registry_with(&[(1, "alice"), (2, "bob")]);
        registry.join("project:p1", 1);
        registry.join("project:p1", 2);

        assert!(registry.leave("project:p1", 1));
        assert!(!registry.leave("project:p1", 1));
        assert_eq!(registry.members_of("project:p1"), vec![2]);

        assert!(registry.leave("project:p1", 2));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.members_of("project:p1").is_empty());
    }

    #[test]
    fn leaving_a_room_never_joined_is_a_no_op() {
        let registry = registry_with(&[(1, "alice"), (2, "bob")]);
        registry.join("project:p1", 2);

        assert!(!registry.leave("project:p1", 1));
        assert!(!registry.leave("project:p9", 1));
        assert_eq!(registry.members_of("project:p1"), vec![2]);
    }

    #[test]
    fn unregister_clears_every_room_once() {
        let registry = registry_with(&[(1, "alice"), (2, "bob")]);
        registry.join("project:p2", 1);
        registry.join("project:p1", 1);
        registry.join("project:p1", 2);

        let departure = registry.unregister(1).expect("first unregister");
        assert_eq!(departure.user_id, "alice");
        assert_eq!(departure.rooms, vec!["project:p1", "project:p2"]);

        assert!(registry.unregister(1).is_none());
        assert_eq!(registry.members_of("project:p1"), vec![2]);
        assert!(!registry.is_member("project:p2", 1));
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn rooms_and_identity_are_tracked_per_connection() {
        let registry = registry_with(&[(7, "carol")]);
        registry.join("project:b", 7);
        registry.join("project:a", 7);

        assert_eq!(registry.rooms_of(7), vec!["project:a", "project:b"]);
        assert_eq!(registry.user_of(7).as_deref(), Some("carol"));
        assert!(registry.outbound(7).is_some());
        assert!(registry.rooms_of(8).is_empty());
    }
}
