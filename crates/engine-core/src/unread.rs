//! Per-room unread state and its bottom-up aggregation over groups.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::{
    client::RoomDirectory,
    hierarchy::HierarchyResolver,
    types::{GroupKey, Room, UnreadSnapshot, UnreadSummary},
    visibility::{VisibilityConfig, is_visible},
};

/// Whether the local user has read everything visible in the room's window.
///
/// Scans newest to oldest and stops at the read marker. A window whose newest
/// event is the local user's own is read. When the marker is outside the
/// loaded window every loaded event counts as after it.
pub fn room_is_read(room: &Room, local_user_id: &str, config: &VisibilityConfig) -> bool {
    let Some(latest) = room.timeline.last() else {
        return true;
    };
    if latest.sender == local_user_id {
        return true;
    }

    let read_marker = room.read_marker_event_id.as_deref();
    for event in room.timeline.iter().rev() {
        if read_marker == Some(event.event_id.as_str()) {
            return true;
        }
        if event.sender != local_user_id && is_visible(event, config) {
            return false;
        }
    }
    true
}

/// Computes unread summaries for rooms, spaces and top-level groups.
pub struct UnreadAggregator<'a, D: RoomDirectory + ?Sized> {
    directory: &'a D,
    config: VisibilityConfig,
    read_overrides: HashMap<String, bool>,
}

impl<'a, D: RoomDirectory + ?Sized> UnreadAggregator<'a, D> {
    pub fn new(directory: &'a D, config: VisibilityConfig) -> Self {
        Self {
            directory,
            config,
            read_overrides: HashMap::new(),
        }
    }

    /// Use `read` for `room_id` instead of the marker scan (open timelines).
    pub fn with_read_override(mut self, room_id: impl Into<String>, read: bool) -> Self {
        self.read_overrides.insert(room_id.into(), read);
        self
    }

    /// Summary of one room; unknown rooms contribute an empty summary.
    pub fn room_summary(&self, room_id: &str) -> UnreadSummary {
        match self.directory.room(room_id) {
            Some(room) => self.summarize(&room),
            None => UnreadSummary::default(),
        }
    }

    /// Merged summary over a group's member rooms.
    pub fn group_summary(&self, group: &GroupKey) -> UnreadSummary {
        let members = HierarchyResolver::new(self.directory).group_members(group);
        UnreadSummary::merge(members.iter().map(|room_id| self.room_summary(room_id)))
    }

    /// Full recompute over every joined room, every joined space, `home` and `directs`.
    pub fn snapshot(&self) -> UnreadSnapshot {
        let resolver = HierarchyResolver::new(self.directory);
        let joined = self.directory.joined_rooms();

        let rooms: BTreeMap<String, UnreadSummary> = joined
            .iter()
            .filter(|room| !room.is_space)
            .map(|room| (room.room_id.clone(), self.summarize(room)))
            .collect();

        let merge_members = |members: Vec<String>| {
            UnreadSummary::merge(
                members
                    .iter()
                    .map(|room_id| rooms.get(room_id).copied().unwrap_or_default()),
            )
        };

        let mut groups = BTreeMap::new();
        for group in [GroupKey::Home, GroupKey::Directs] {
            let summary = merge_members(resolver.group_members(&group));
            groups.insert(group.as_key().to_owned(), summary);
        }
        for space in joined.iter().filter(|room| room.is_space) {
            let members = resolver.resolve(&space.room_id, false).into_iter().collect();
            groups.insert(space.room_id.clone(), merge_members(members));
        }

        trace!(
            room_count = rooms.len(),
            group_count = groups.len(),
            "unread snapshot computed"
        );

        UnreadSnapshot {
            rooms,
            groups,
            root_spaces: resolver.root_spaces(),
        }
    }

    fn summarize(&self, room: &Room) -> UnreadSummary {
        let read = match self.read_overrides.get(&room.room_id) {
            Some(read) => *read,
            None => room_is_read(room, self.directory.local_user_id(), &self.config),
        };
        UnreadSummary {
            read,
            notification_count: room.notification_count,
            highlight_count: room.highlight_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arena::RoomArena,
        types::{Membership, TimelineEvent},
    };

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";

    fn msg(room_id: &str, event_id: &str, sender: &str) -> TimelineEvent {
        TimelineEvent::message(room_id, event_id, sender, "hello", 1)
    }

    fn unread_room(room_id: &str, notifications: u64) -> Room {
        Room::joined(room_id)
            .with_timeline(vec![msg(room_id, &format!("${room_id}-1"), BOB)])
            .with_counts(notifications, 0)
    }

    fn read_room(room_id: &str) -> Room {
        let event_id = format!("${room_id}-1");
        Room::joined(room_id)
            .with_timeline(vec![msg(room_id, &event_id, BOB)])
            .with_read_marker(event_id)
    }

    fn arena(rooms: Vec<Room>) -> RoomArena {
        let mut arena = RoomArena::new(ALICE);
        for room in rooms {
            arena.insert_room(room);
        }
        arena
    }

    #[test]
    fn empty_window_is_read() {
        assert!(room_is_read(
            &Room::joined("!r"),
            ALICE,
            &VisibilityConfig::default()
        ));
    }

    #[test]
    fn visible_foreign_event_after_marker_is_unread() {
        let room = Room::joined("!r")
            .with_timeline(vec![msg("!r", "$1", BOB), msg("!r", "$2", BOB)])
            .with_read_marker("$1");
        assert!(!room_is_read(&room, ALICE, &VisibilityConfig::default()));
    }

    #[test]
    fn marker_on_newest_event_is_read() {
        let room = Room::joined("!r")
            .with_timeline(vec![msg("!r", "$1", BOB), msg("!r", "$2", BOB)])
            .with_read_marker("$2");
        assert!(room_is_read(&room, ALICE, &VisibilityConfig::default()));
    }

    #[test]
    fn own_newest_event_means_read() {
        let room = Room::joined("!r").with_timeline(vec![msg("!r", "$1", BOB), msg("!r", "$2", ALICE)]);
        assert!(room_is_read(&room, ALICE, &VisibilityConfig::default()));
    }

    #[test]
    fn marker_outside_window_counts_every_loaded_event() {
        let room = Room::joined("!r")
            .with_timeline(vec![msg("!r", "$5", BOB)])
            .with_read_marker("$1");
        assert!(!room_is_read(&room, ALICE, &VisibilityConfig::default()));
    }

    #[test]
    fn hidden_events_after_marker_do_not_make_room_unread() {
        let join = TimelineEvent::membership("!r", "$2", BOB, Membership::Join, None, 2);
        let room = Room::joined("!r")
            .with_timeline(vec![msg("!r", "$1", BOB), join])
            .with_read_marker("$1");
        let hide_joins = VisibilityConfig {
            show_join_events: false,
            ..VisibilityConfig::default()
        };

        assert!(!room_is_read(&room, ALICE, &VisibilityConfig::default()));
        assert!(room_is_read(&room, ALICE, &hide_joins));
    }

    #[test]
    fn space_summary_merges_descendants_through_cycles() {
        let arena = arena(vec![
            Room::space("!a", ["!b", "!r1"]),
            Room::space("!b", ["!a", "!r2", "!r1"]),
            unread_room("!r1", 2),
            read_room("!r2"),
        ]);
        let aggregator = UnreadAggregator::new(&arena, VisibilityConfig::default());

        let summary = aggregator.group_summary(&GroupKey::Space("!a".to_owned()));
        assert!(!summary.read);
        // !r1 is counted once even though both spaces declare it.
        assert_eq!(summary.notification_count, 2);
    }

    #[test]
    fn empty_space_is_read_with_zero_notifications() {
        let arena = arena(vec![Room::space("!empty", Vec::<String>::new())]);
        let snapshot = UnreadAggregator::new(&arena, VisibilityConfig::default()).snapshot();
        assert_eq!(snapshot.summary("!empty"), UnreadSummary::default());
    }

    #[test]
    fn missing_room_contributes_nothing() {
        let arena = arena(vec![]);
        let aggregator = UnreadAggregator::new(&arena, VisibilityConfig::default());
        assert_eq!(aggregator.room_summary("!gone"), UnreadSummary::default());
    }

    #[test]
    fn snapshot_upholds_group_invariant() {
        let mut arena = arena(vec![
            Room::space("!s", ["!r1", "!r2"]),
            unread_room("!r1", 3),
            read_room("!r2"),
            unread_room("!dm", 1),
            read_room("!home"),
        ]);
        arena.set_direct_rooms(["!dm"]);
        let snapshot = UnreadAggregator::new(&arena, VisibilityConfig::default()).snapshot();
        let resolver = HierarchyResolver::new(&arena);

        for group in [
            GroupKey::Home,
            GroupKey::Directs,
            GroupKey::Space("!s".to_owned()),
        ] {
            let members = resolver.group_members(&group);
            let summary = snapshot.group(&group);
            let expected_read = members.iter().all(|id| snapshot.summary(id).read);
            let expected_count: u64 = members
                .iter()
                .map(|id| snapshot.summary(id).notification_count)
                .sum();
            assert_eq!(summary.read, expected_read, "read mismatch for {group}");
            assert_eq!(summary.notification_count, expected_count);
        }

        assert!(snapshot.group(&GroupKey::Home).read);
        assert!(!snapshot.group(&GroupKey::Directs).read);
        assert_eq!(snapshot.group(&GroupKey::Space("!s".to_owned())).notification_count, 3);
        assert_eq!(snapshot.root_spaces, ["!s"]);
    }

    #[test]
    fn read_override_wins_over_marker_scan() {
        let arena = arena(vec![unread_room("!r1", 0)]);
        let aggregator =
            UnreadAggregator::new(&arena, VisibilityConfig::default()).with_read_override("!r1", true);
        assert!(aggregator.room_summary("!r1").read);
    }
}
