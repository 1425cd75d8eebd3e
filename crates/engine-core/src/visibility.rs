//! Event visibility shared by timeline rendering and unread computation.

use serde::{Deserialize, Serialize};

use crate::types::{EventKind, Membership, TimelineEvent};

/// User-facing toggles controlling which event kinds appear in timelines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VisibilityConfig {
    pub show_join_events: bool,
    pub show_leave_events: bool,
    /// Name/avatar/topic/ACL/tombstone changes.
    pub show_room_edits: bool,
    pub show_redacted_events: bool,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            show_join_events: true,
            show_leave_events: true,
            show_room_edits: true,
            show_redacted_events: true,
        }
    }
}

/// Whether `event` is shown to the user under `config`.
///
/// Edits never render on their own; they replace the body of their target.
pub fn is_visible(event: &TimelineEvent, config: &VisibilityConfig) -> bool {
    match &event.kind {
        EventKind::Message => !event.is_edit() && (!event.redacted || config.show_redacted_events),
        EventKind::Membership {
            membership,
            prev_membership,
        } => match membership_transition(*membership, *prev_membership) {
            Some(MembershipTransition::Join) => config.show_join_events,
            Some(MembershipTransition::Leave) => config.show_leave_events,
            None => false,
        },
        EventKind::RoomMetadata(_) => config.show_room_edits,
        EventKind::PinnedEvents | EventKind::Sticker => true,
        EventKind::Reaction | EventKind::Redaction { .. } => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MembershipTransition {
    Join,
    Leave,
}

// Profile-only updates keep membership at join and must not count as joins.
fn membership_transition(
    membership: Membership,
    prev_membership: Option<Membership>,
) -> Option<MembershipTransition> {
    let was_joined = prev_membership == Some(Membership::Join);
    match membership {
        Membership::Join if !was_joined => Some(MembershipTransition::Join),
        Membership::Leave | Membership::Ban if was_joined => Some(MembershipTransition::Leave),
        _ => None,
    }
}
