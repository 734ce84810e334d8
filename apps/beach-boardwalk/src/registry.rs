use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Local room membership for this instance: room -> connections joined to it.
///
/// Mutations for one room are serialized by the map's shard lock. A room whose
/// last member leaves is removed, so only occupied rooms take up memory.
#[derive(Clone, Default)]
pub struct Registry {
    rooms: Arc<DashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

pub struct RoomSnapshot {
    pub room: String,
    pub members: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `room`, returning the member count afterwards.
    pub fn add(&self, room: &str, conn: ConnectionHandle) -> usize {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        members.insert(conn.id(), conn);
        members.len()
    }

    /// Removes `id` from `room`, returning how many members remain.
    pub fn remove(&self, room: &str, id: ConnectionId) -> usize {
        let remaining = match self.rooms.get_mut(room) {
            Some(mut members) => {
                members.remove(&id);
                members.len()
            }
            None => return 0,
        };

        if remaining == 0 {
            // Re-checked under the shard lock in case someone joined meanwhile.
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        remaining
    }

    pub fn members_of(&self, room: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains(&self, room: &str, id: ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains_key(&id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .iter()
            .map(|entry| RoomSnapshot {
                room: entry.key().clone(),
                members: entry.value().len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }
}
