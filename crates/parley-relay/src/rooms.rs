use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_protocol::{ConnectionId, GroupId, Identity, ServerEvent, Target};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::presence::ConnHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomId {
    /// Every connection of one identity.
    Personal(Identity),
    Group(GroupId),
}

impl RoomId {
    pub fn for_target(target: &Target) -> Self {
        match target {
            Target::Peer(id) => RoomId::Personal(id.clone()),
            Target::Group(id) => RoomId::Group(id.clone()),
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Personal(id) => write!(f, "user:{id}"),
            RoomId::Group(id) => write!(f, "group:{id}"),
        }
    }
}

/// Named fan-out groups over live connections.
///
/// Rooms only address connections; group membership itself lives in the
/// store. A room with no members is removed. The two maps are never locked
/// at the same time.
#[derive(Default)]
pub struct RoomRouter {
    rooms: DashMap<RoomId, BTreeMap<ConnectionId, ConnHandle>>,
    memberships: DashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: RoomId, handle: &ConnHandle) {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(handle.id, handle.clone());
        self.memberships.entry(handle.id).or_default().insert(room);
    }

    pub fn join_personal_room(&self, handle: &ConnHandle) {
        self.join(RoomId::Personal(handle.identity.clone()), handle);
    }

    pub fn join_group_rooms(&self, handle: &ConnHandle, group_ids: &[GroupId]) {
        for group_id in group_ids {
            self.join(RoomId::Group(group_id.clone()), handle);
        }
    }

    fn detach(&self, room: &RoomId, conn: ConnectionId) -> Option<ConnHandle> {
        match self.rooms.entry(room.clone()) {
            Entry::Occupied(mut o) => {
                let removed = o.get_mut().remove(&conn);
                if o.get().is_empty() {
                    o.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        }
    }

    pub fn leave_room(&self, room: &RoomId, conn: ConnectionId) -> bool {
        let removed = self.detach(room, conn).is_some();
        if let Some(mut rooms) = self.memberships.get_mut(&conn) {
            rooms.remove(room);
        }
        removed
    }

    /// Remove every connection of `identity` from a group room.
    pub fn leave_group_room(&self, identity: &str, group_id: &str) -> Vec<ConnHandle> {
        let room = RoomId::Group(group_id.to_string());
        let targets: Vec<ConnectionId> = self
            .members(&room)
            .into_iter()
            .filter(|h| h.identity == identity)
            .map(|h| h.id)
            .collect();
        let mut removed = Vec::with_capacity(targets.len());
        for conn in targets {
            if let Some(handle) = self.detach(&room, conn) {
                removed.push(handle);
            }
            if let Some(mut rooms) = self.memberships.get_mut(&conn) {
                rooms.remove(&room);
            }
        }
        removed
    }

    /// Delete a room outright, returning its former members.
    pub fn drop_room(&self, room: &RoomId) -> Vec<ConnHandle> {
        let Some((_, members)) = self.rooms.remove(room) else {
            return Vec::new();
        };
        for conn in members.keys() {
            if let Some(mut rooms) = self.memberships.get_mut(conn) {
                rooms.remove(room);
            }
        }
        members.into_values().collect()
    }

    /// Remove a connection from every room it is in.
    pub fn leave_all(&self, conn: ConnectionId) -> Vec<RoomId> {
        let Some((_, rooms)) = self.memberships.remove(&conn) else {
            return Vec::new();
        };
        let mut left: Vec<RoomId> = rooms.into_iter().collect();
        left.sort();
        for room in &left {
            self.detach(room, conn);
        }
        left
    }

    /// Queue `event` on every member. Returns how many accepted it.
    pub fn broadcast(&self, room: &RoomId, event: &ServerEvent) -> usize {
        self.members(room)
            .iter()
            .filter(|h| h.deliver(event.clone()))
            .count()
    }

    pub fn broadcast_except(&self, room: &RoomId, event: &ServerEvent, identity: &str) -> usize {
        self.members(room)
            .iter()
            .filter(|h| h.identity != identity)
            .filter(|h| h.deliver(event.clone()))
            .count()
    }

    /// Snapshot of a room's members, ordered by connection id.
    pub fn members(&self, room: &RoomId) -> Vec<ConnHandle> {
        self.rooms
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_identities(&self, room: &RoomId) -> BTreeSet<Identity> {
        self.rooms
            .get(room)
            .map(|m| m.values().map(|h| h.identity.clone()).collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, conn: ConnectionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .memberships
            .get(&conn)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn has_identity(&self, room: &RoomId, identity: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|m| m.values().any(|h| h.identity == identity))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
