use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::EngineError, visibility::VisibilityConfig};

const DEFAULT_RECEIPT_DEBOUNCE_MS: u64 = 300;
const DEFAULT_RECOMPUTE_DEBOUNCE_MS: u64 = 250;
const DEFAULT_PAGINATE_LIMIT: u16 = 30;

/// Membership of the local user (or of a member event's target) in a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
}

/// Kind of relation an event declares towards another event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelationType {
    /// Replacement of the target's content (`m.replace`).
    Edit,
    /// Annotation such as a reaction (`m.annotation`).
    Annotation,
}

/// Relation from one event to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relation {
    pub rel_type: RelationType,
    pub target_event_id: String,
}

/// Room metadata field changed by a state event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomMetadataKind {
    Name,
    Avatar,
    Topic,
    ServerAcl,
    Tombstone,
}

/// Event type with the payload fields the engine reasons about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// Room message (`m.room.message`), including edits.
    Message,
    /// Membership change of a room member.
    Membership {
        membership: Membership,
        prev_membership: Option<Membership>,
    },
    /// Room name/avatar/topic/ACL/tombstone change.
    RoomMetadata(RoomMetadataKind),
    /// Pinned-events list change.
    PinnedEvents,
    /// Sticker message.
    Sticker,
    /// Reaction annotation.
    Reaction,
    /// Redaction of another event.
    Redaction { redacts: String },
}

/// One event of a room timeline as delivered by the protocol client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    /// Origin server timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub kind: EventKind,
    /// Text body; for edits this is the replacement body.
    pub body: Option<String>,
    pub relates_to: Option<Relation>,
    pub redacted: bool,
}

impl TimelineEvent {
    /// Plain text message.
    pub fn message(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            timestamp_ms,
            kind: EventKind::Message,
            body: Some(body.into()),
            relates_to: None,
            redacted: false,
        }
    }

    /// Edit replacing the body of `target_event_id`.
    pub fn edit(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        sender: impl Into<String>,
        target_event_id: impl Into<String>,
        new_body: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        let mut event = Self::message(room_id, event_id, sender, new_body, timestamp_ms);
        event.relates_to = Some(Relation {
            rel_type: RelationType::Edit,
            target_event_id: target_event_id.into(),
        });
        event
    }

    /// Membership transition of `sender`.
    pub fn membership(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        sender: impl Into<String>,
        membership: Membership,
        prev_membership: Option<Membership>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            timestamp_ms,
            kind: EventKind::Membership {
                membership,
                prev_membership,
            },
            body: None,
            relates_to: None,
            redacted: false,
        }
    }

    /// Any other event kind without a body.
    pub fn state(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        sender: impl Into<String>,
        kind: EventKind,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            timestamp_ms,
            kind,
            body: None,
            relates_to: None,
            redacted: false,
        }
    }

    /// Target of an edit relation, when this event is an edit.
    pub fn edit_target(&self) -> Option<&str> {
        self.relates_to
            .as_ref()
            .filter(|relation| relation.rel_type == RelationType::Edit)
            .map(|relation| relation.target_event_id.as_str())
    }

    pub fn is_edit(&self) -> bool {
        self.edit_target().is_some()
    }
}

/// Room (or space) state as held by the protocol client.
///
/// Children are id edges into the same flat room map; nothing here owns
/// another room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub room_id: String,
    pub name: Option<String>,
    pub is_space: bool,
    pub membership: Membership,
    /// Loaded window, oldest first.
    pub timeline: Vec<TimelineEvent>,
    /// Backward pagination token; `None` once history is exhausted.
    pub pagination_token: Option<String>,
    /// Last event the local user's read receipt points at.
    pub read_marker_event_id: Option<String>,
    /// Notification count reported by sync.
    pub notification_count: u64,
    /// Highlight/mention count reported by sync.
    pub highlight_count: u64,
    /// Declared space children (`m.space.child`), in declaration order.
    pub child_ids: Vec<String>,
}

impl Room {
    /// Joined, empty, non-space room.
    pub fn joined(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            name: None,
            is_space: false,
            membership: Membership::Join,
            timeline: Vec::new(),
            pagination_token: None,
            read_marker_event_id: None,
            notification_count: 0,
            highlight_count: 0,
            child_ids: Vec::new(),
        }
    }

    /// Joined space declaring `children`.
    pub fn space<I, S>(room_id: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            is_space: true,
            child_ids: children.into_iter().map(Into::into).collect(),
            ..Self::joined(room_id)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timeline(mut self, events: Vec<TimelineEvent>) -> Self {
        self.timeline = events;
        self
    }

    pub fn with_pagination_token(mut self, token: impl Into<String>) -> Self {
        self.pagination_token = Some(token.into());
        self
    }

    pub fn with_read_marker(mut self, event_id: impl Into<String>) -> Self {
        self.read_marker_event_id = Some(event_id.into());
        self
    }

    pub fn with_counts(mut self, notification_count: u64, highlight_count: u64) -> Self {
        self.notification_count = notification_count;
        self.highlight_count = highlight_count;
        self
    }

    pub fn with_membership(mut self, membership: Membership) -> Self {
        self.membership = membership;
        self
    }

    pub fn is_joined(&self) -> bool {
        self.membership == Membership::Join
    }
}

/// Read/notification state of one room or one aggregated group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadSummary {
    pub read: bool,
    pub notification_count: u64,
    pub highlight_count: u64,
}

impl Default for UnreadSummary {
    /// Contribution of an empty group or an unresolvable room.
    fn default() -> Self {
        Self {
            read: true,
            notification_count: 0,
            highlight_count: 0,
        }
    }
}

impl UnreadSummary {
    /// Merge member summaries: read only if every member is read, counts summed.
    pub fn merge<I>(members: I) -> Self
    where
        I: IntoIterator<Item = UnreadSummary>,
    {
        members
            .into_iter()
            .fold(Self::default(), |acc, member| Self {
                read: acc.read && member.read,
                notification_count: acc.notification_count.saturating_add(member.notification_count),
                highlight_count: acc.highlight_count.saturating_add(member.highlight_count),
            })
    }
}

/// Top-level navigation bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", from = "String")]
pub enum GroupKey {
    /// Joined rooms that are neither direct messages nor space members.
    Home,
    /// Rooms listed in the direct-message registry.
    Directs,
    /// A space, identified by its room id.
    Space(String),
}

impl GroupKey {
    /// Stable string key (`home`, `directs` or the space room id).
    pub fn as_key(&self) -> &str {
        match self {
            Self::Home => "home",
            Self::Directs => "directs",
            Self::Space(room_id) => room_id,
        }
    }
}

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        match key {
            "home" => Self::Home,
            "directs" => Self::Directs,
            other => Self::Space(other.to_owned()),
        }
    }
}

impl From<String> for GroupKey {
    fn from(key: String) -> Self {
        match key.as_str() {
            "home" => Self::Home,
            "directs" => Self::Directs,
            _ => Self::Space(key),
        }
    }
}

impl From<GroupKey> for String {
    fn from(key: GroupKey) -> Self {
        match key {
            GroupKey::Space(room_id) => room_id,
            other => other.as_key().to_owned(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Display-ready timeline row produced by `RoomTimeline::events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineItem {
    pub event_id: String,
    pub sender: String,
    /// Body after edit substitution.
    pub body: Option<String>,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub redacted: bool,
    /// `true` when `body` comes from an edit.
    pub edited: bool,
}

/// Mutation applied to a room window held in the room arena.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineOp {
    /// Append a live event at the end of the window.
    Append(TimelineEvent),
    /// Prepend a backfilled event at the beginning of the window.
    Prepend(TimelineEvent),
    /// Mark an event as redacted, stripping its body.
    Redact { event_id: String },
}

/// Discrete protocol notifications fed into the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A timeline event was added to a room window.
    Timeline {
        event: TimelineEvent,
        /// `true` when the event was backfilled rather than received live.
        to_start_of_timeline: bool,
    },
    /// An event of a room was redacted.
    Redaction {
        room_id: String,
        redacted_event_id: String,
    },
    /// The local user's membership in a room changed.
    MembershipChanged {
        room_id: String,
        membership: Membership,
    },
    /// The direct-message registry (account data) changed.
    DirectRegistryChanged,
    /// A room's display name changed.
    RoomRenamed { room_id: String },
    /// A read receipt arrived.
    ReadReceipt {
        room_id: String,
        user_id: String,
        event_id: String,
    },
    /// The visibility configuration changed.
    SettingsChanged(VisibilityConfig),
}

/// Unread state for every joined room and every group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadSnapshot {
    /// Per joined non-space room.
    pub rooms: BTreeMap<String, UnreadSummary>,
    /// Per group key (`home`, `directs`, space ids).
    pub groups: BTreeMap<String, UnreadSummary>,
    /// Spaces with no parent outside their own cycle, sorted by id.
    pub root_spaces: Vec<String>,
}

impl UnreadSnapshot {
    /// Summary for a room id or group key; unknown ids read as empty.
    pub fn summary(&self, id: &str) -> UnreadSummary {
        self.groups
            .get(id)
            .or_else(|| self.rooms.get(id))
            .copied()
            .unwrap_or_default()
    }

    pub fn group(&self, group: &GroupKey) -> UnreadSummary {
        self.groups
            .get(group.as_key())
            .copied()
            .unwrap_or_default()
    }
}

/// Runtime tuning for debouncing and pagination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineTuning {
    /// Window coalescing `mark_as_read` calls into one receipt.
    pub receipt_debounce_ms: u64,
    /// Window coalescing timeline-event invalidations into one recompute.
    pub recompute_debounce_ms: u64,
    /// Page size requested per backward pagination.
    pub paginate_limit: u16,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            receipt_debounce_ms: DEFAULT_RECEIPT_DEBOUNCE_MS,
            recompute_debounce_ms: DEFAULT_RECOMPUTE_DEBOUNCE_MS,
            paginate_limit: DEFAULT_PAGINATE_LIMIT,
        }
    }
}

impl EngineTuning {
    pub fn receipt_debounce(&self) -> Duration {
        Duration::from_millis(self.receipt_debounce_ms)
    }

    pub fn recompute_debounce(&self) -> Duration {
        Duration::from_millis(self.recompute_debounce_ms)
    }
}

/// Command channel input accepted by the engine runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineCommand {
    /// Route one protocol notification.
    Protocol(ProtocolEvent),
    /// Select a room (or clear the selection) inside the active group.
    SelectRoom { room_id: Option<String> },
    /// Switch the active group, restoring its last selection.
    SelectGroup { group: GroupKey },
    /// Mark the selected room as read.
    MarkActiveRoomRead,
    /// Paginate the selected room backward by one page.
    PaginateBack,
    /// Force a summary recompute.
    Refresh,
}

/// Update channel output emitted by the engine runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineUpdate {
    /// Unread summaries were recomputed.
    SummariesUpdated(UnreadSnapshot),
    /// The selected room's visible events changed.
    TimelineChanged { room_id: String },
    /// A room was renamed; cosmetic refresh only.
    RoomRenamed { room_id: String },
    /// Selection changed, either directly or through group restoration.
    SelectionChanged {
        group: GroupKey,
        room_id: Option<String>,
    },
    /// A backward pagination request completed.
    PaginationFinished { room_id: String, can_load: bool },
    /// A command failed.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl EngineUpdate {
    /// Convert an engine error into an `Error` update.
    pub fn from_error(error: EngineError) -> Self {
        let recoverable = error.is_recoverable();
        Self::Error {
            code: error.code,
            message: error.message,
            recoverable,
        }
    }
}
