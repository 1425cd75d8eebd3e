use std::{collections::HashSet, future::Future, sync::Arc};

use crate::{error::EngineError, types::Room};

/// Synchronous lookups into the protocol client's room state.
pub trait RoomDirectory {
    /// Matrix user id of the logged-in account.
    fn local_user_id(&self) -> &str;

    /// Current state of a room, if the client knows it.
    fn room(&self, room_id: &str) -> Option<Arc<Room>>;

    /// Every room the local user has joined, sorted by room id.
    fn joined_rooms(&self) -> Vec<Arc<Room>>;

    /// Room ids listed in the direct-message registry.
    fn direct_room_ids(&self) -> HashSet<String>;
}

/// External protocol client collaborator injected into engine components.
///
/// Network sync, crypto and raw event storage live behind this trait.
pub trait ProtocolClient: RoomDirectory + Send + Sync + 'static {
    /// Backfill up to `limit` older events into the room window.
    ///
    /// On success the room's pagination token has been updated in place;
    /// `None` afterwards means history is exhausted.
    fn scrollback(
        &self,
        room_id: &str,
        limit: u16,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Submit a read receipt for `event_id`.
    fn send_read_receipt(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}
