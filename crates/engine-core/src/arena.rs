use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    client::RoomDirectory,
    error::{EngineError, EngineErrorCategory},
    types::{Membership, Room, TimelineOp},
};

/// Flat room store keyed by room id.
///
/// Space edges are plain id lists on each room, so cyclic hierarchies never
/// turn into cyclic ownership. Rooms are shared as `Arc` snapshots and copied
/// on write.
#[derive(Debug, Clone, Default)]
pub struct RoomArena {
    local_user_id: String,
    rooms: HashMap<String, Arc<Room>>,
    direct_room_ids: HashSet<String>,
}

impl RoomArena {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            rooms: HashMap::new(),
            direct_room_ids: HashSet::new(),
        }
    }

    /// Insert or replace a room.
    pub fn insert_room(&mut self, room: Room) {
        self.rooms.insert(room.room_id.clone(), Arc::new(room));
    }

    /// Apply window operations to one room, in order.
    pub fn apply_ops(&mut self, room_id: &str, ops: &[TimelineOp]) -> Result<(), EngineError> {
        let room = self.room_mut(room_id)?;
        for op in ops {
            match op {
                TimelineOp::Append(event) => room.timeline.push(event.clone()),
                TimelineOp::Prepend(event) => room.timeline.insert(0, event.clone()),
                TimelineOp::Redact { event_id } => {
                    let event = room
                        .timeline
                        .iter_mut()
                        .find(|event| event.event_id == *event_id)
                        .ok_or_else(|| {
                            EngineError::new(
                                EngineErrorCategory::Config,
                                "event_not_found",
                                format!("event {event_id} not found in room {room_id}"),
                            )
                        })?;
                    event.redacted = true;
                    event.body = None;
                }
            }
        }
        Ok(())
    }

    pub fn set_pagination_token(
        &mut self,
        room_id: &str,
        token: Option<String>,
    ) -> Result<(), EngineError> {
        self.room_mut(room_id)?.pagination_token = token;
        Ok(())
    }

    pub fn set_read_marker(
        &mut self,
        room_id: &str,
        event_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.room_mut(room_id)?.read_marker_event_id = Some(event_id.into());
        Ok(())
    }

    pub fn set_membership(
        &mut self,
        room_id: &str,
        membership: Membership,
    ) -> Result<(), EngineError> {
        self.room_mut(room_id)?.membership = membership;
        Ok(())
    }

    pub fn set_counts(
        &mut self,
        room_id: &str,
        notification_count: u64,
        highlight_count: u64,
    ) -> Result<(), EngineError> {
        let room = self.room_mut(room_id)?;
        room.notification_count = notification_count;
        room.highlight_count = highlight_count;
        Ok(())
    }

    pub fn rename_room(&mut self, room_id: &str, name: impl Into<String>) -> Result<(), EngineError> {
        self.room_mut(room_id)?.name = Some(name.into());
        Ok(())
    }

    /// Replace the direct-message registry.
    pub fn set_direct_rooms<I, S>(&mut self, room_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.direct_room_ids = room_ids.into_iter().map(Into::into).collect();
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut Room, EngineError> {
        self.rooms
            .get_mut(room_id)
            .map(Arc::make_mut)
            .ok_or_else(|| EngineError::room_not_found(room_id))
    }
}

impl RoomDirectory for RoomArena {
    fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).cloned()
    }

    fn joined_rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> = self
            .rooms
            .values()
            .filter(|room| room.is_joined())
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    fn direct_room_ids(&self) -> HashSet<String> {
        self.direct_room_ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimelineEvent;

    const ROOM: &str = "!r:example.org";

    fn message(event_id: &str, body: &str) -> TimelineEvent {
        TimelineEvent::message(ROOM, event_id, "@bob:example.org", body, 1_731_000_000)
    }

    #[test]
    fn applies_append_prepend_redact_sequence() {
        let mut arena = RoomArena::new("@alice:example.org");
        arena.insert_room(Room::joined(ROOM));
        arena
            .apply_ops(
                ROOM,
                &[
                    TimelineOp::Append(message("$2", "two")),
                    TimelineOp::Prepend(message("$1", "one")),
                    TimelineOp::Redact {
                        event_id: "$2".into(),
                    },
                ],
            )
            .expect("ops should be valid");

        let room = arena.room(ROOM).expect("room exists");
        let ids: Vec<&str> = room.timeline.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$1", "$2"]);
        assert!(room.timeline[1].redacted);
        assert_eq!(room.timeline[1].body, None);
    }

    #[test]
    fn fails_when_event_for_redaction_is_missing() {
        let mut arena = RoomArena::new("@alice:example.org");
        arena.insert_room(Room::joined(ROOM));
        let err = arena
            .apply_ops(
                ROOM,
                &[TimelineOp::Redact {
                    event_id: "$404".into(),
                }],
            )
            .expect_err("should reject redaction of unknown events");
        assert_eq!(err.code, "event_not_found");
    }

    #[test]
    fn mutating_unknown_room_is_room_not_found() {
        let mut arena = RoomArena::new("@alice:example.org");
        let err = arena
            .set_read_marker("!nope:example.org", "$1")
            .expect_err("unknown room");
        assert_eq!(err.code, "room_not_found");
    }

    #[test]
    fn snapshots_are_copied_on_write() {
        let mut arena = RoomArena::new("@alice:example.org");
        arena.insert_room(Room::joined(ROOM));
        let before = arena.room(ROOM).expect("room");
        arena
            .apply_ops(ROOM, &[TimelineOp::Append(message("$1", "hi"))])
            .expect("append");

        assert!(before.timeline.is_empty());
        assert_eq!(arena.room(ROOM).expect("room").timeline.len(), 1);
    }

    #[test]
    fn joined_rooms_are_sorted_and_exclude_other_memberships() {
        let mut arena = RoomArena::new("@alice:example.org");
        arena.insert_room(Room::joined("!b:example.org"));
        arena.insert_room(Room::joined("!a:example.org"));
        arena.insert_room(Room::joined("!c:example.org").with_membership(Membership::Invite));

        let ids: Vec<String> = arena
            .joined_rooms()
            .iter()
            .map(|room| room.room_id.clone())
            .collect();
        assert_eq!(ids, ["!a:example.org", "!b:example.org"]);
    }
}
