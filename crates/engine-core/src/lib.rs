//! Core of the chat state engine.
//!
//! This crate holds the protocol-facing types, the event visibility policy,
//! room timelines with pagination and debounced read receipts, cycle-safe
//! space hierarchy resolution and unread aggregation. The protocol client is
//! injected through the `ProtocolClient` trait; `InMemoryClient` implements it
//! over an in-process room arena.

/// Flat room store with copy-on-write room snapshots.
pub mod arena;
/// Protocol client contract consumed by the engine.
pub mod client;
/// Stable engine error types.
pub mod error;
/// Space traversal and top-level group membership.
pub mod hierarchy;
/// In-memory protocol client.
pub mod memory;
/// Backward pagination state machine.
pub mod pagination;
/// Debounced read receipt submission.
pub mod receipts;
/// Per-room timeline view.
pub mod timeline;
/// Protocol and UI-facing types (events, rooms, commands, updates).
pub mod types;
/// Unread state per room and per group.
pub mod unread;
/// Event visibility policy.
pub mod visibility;

pub use arena::RoomArena;
pub use client::{ProtocolClient, RoomDirectory};
pub use error::{EngineError, EngineErrorCategory};
pub use hierarchy::{Descendants, HierarchyResolver};
pub use memory::{HistoryPage, InMemoryClient};
pub use pagination::{PaginationState, PaginationStateMachine, bounded_paginate_limit};
pub use receipts::ReceiptDebouncer;
pub use timeline::{Backfill, RoomTimeline};
pub use types::{
    EngineCommand, EngineTuning, EngineUpdate, EventKind, GroupKey, Membership, ProtocolEvent,
    Relation, RelationType, Room, RoomMetadataKind, TimelineEvent, TimelineItem, TimelineOp,
    UnreadSnapshot, UnreadSummary,
};
pub use unread::{UnreadAggregator, room_is_read};
pub use visibility::{VisibilityConfig, is_visible};
