//! In-process `ProtocolClient` backed by a `RoomArena`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tracing::trace;

use crate::{
    arena::RoomArena,
    client::{ProtocolClient, RoomDirectory},
    error::{EngineError, EngineErrorCategory},
    types::{Membership, ProtocolEvent, Room, TimelineEvent, TimelineOp},
};

/// One page of older history served by `scrollback`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Events oldest first.
    pub events: Vec<TimelineEvent>,
    /// Token for the page after this one; `None` ends history.
    pub next_token: Option<String>,
}

/// Protocol client holding all state in memory.
///
/// Mutators update room state first and return the `ProtocolEvent` a real
/// sync loop would emit for the change.
#[derive(Debug)]
pub struct InMemoryClient {
    local_user_id: String,
    arena: RwLock<RoomArena>,
    history: Mutex<HashMap<String, VecDeque<HistoryPage>>>,
    scrollback_latency: Duration,
    fail_scrollback: AtomicBool,
    fail_receipts: AtomicBool,
    scrollback_calls: AtomicUsize,
    sent_receipts: Mutex<Vec<(String, String)>>,
}

impl InMemoryClient {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        let local_user_id = local_user_id.into();
        Self {
            arena: RwLock::new(RoomArena::new(local_user_id.clone())),
            local_user_id,
            history: Mutex::new(HashMap::new()),
            scrollback_latency: Duration::ZERO,
            fail_scrollback: AtomicBool::new(false),
            fail_receipts: AtomicBool::new(false),
            scrollback_calls: AtomicUsize::new(0),
            sent_receipts: Mutex::new(Vec::new()),
        }
    }

    /// Delay every `scrollback` by `latency` (simulated round-trip).
    pub fn with_scrollback_latency(mut self, latency: Duration) -> Self {
        self.scrollback_latency = latency;
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn insert_room(&self, room: Room) {
        self.write_arena().insert_room(room);
    }

    /// Queue a history page returned by the next `scrollback` of `room_id`.
    pub fn queue_history(&self, room_id: impl Into<String>, page: HistoryPage) {
        lock(&self.history)
            .entry(room_id.into())
            .or_default()
            .push_back(page);
    }

    /// Append a live event to its room.
    pub fn deliver_live(&self, event: TimelineEvent) -> Result<ProtocolEvent, EngineError> {
        self.write_arena()
            .apply_ops(&event.room_id, &[TimelineOp::Append(event.clone())])?;
        Ok(ProtocolEvent::Timeline {
            event,
            to_start_of_timeline: false,
        })
    }

    /// Record a read receipt; the local user's receipts move the read marker.
    pub fn deliver_receipt(
        &self,
        room_id: &str,
        user_id: &str,
        event_id: &str,
    ) -> Result<ProtocolEvent, EngineError> {
        if user_id == self.local_user_id {
            self.write_arena().set_read_marker(room_id, event_id)?;
        }
        Ok(ProtocolEvent::ReadReceipt {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
            event_id: event_id.to_owned(),
        })
    }

    pub fn redact(&self, room_id: &str, event_id: &str) -> Result<ProtocolEvent, EngineError> {
        self.write_arena().apply_ops(
            room_id,
            &[TimelineOp::Redact {
                event_id: event_id.to_owned(),
            }],
        )?;
        Ok(ProtocolEvent::Redaction {
            room_id: room_id.to_owned(),
            redacted_event_id: event_id.to_owned(),
        })
    }

    pub fn set_membership(
        &self,
        room_id: &str,
        membership: Membership,
    ) -> Result<ProtocolEvent, EngineError> {
        self.write_arena().set_membership(room_id, membership)?;
        Ok(ProtocolEvent::MembershipChanged {
            room_id: room_id.to_owned(),
            membership,
        })
    }

    pub fn rename_room(&self, room_id: &str, name: &str) -> Result<ProtocolEvent, EngineError> {
        self.write_arena().rename_room(room_id, name)?;
        Ok(ProtocolEvent::RoomRenamed {
            room_id: room_id.to_owned(),
        })
    }

    pub fn set_direct_rooms<I, S>(&self, room_ids: I) -> ProtocolEvent
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_arena().set_direct_rooms(room_ids);
        ProtocolEvent::DirectRegistryChanged
    }

    pub fn set_counts(
        &self,
        room_id: &str,
        notification_count: u64,
        highlight_count: u64,
    ) -> Result<(), EngineError> {
        self.write_arena()
            .set_counts(room_id, notification_count, highlight_count)
    }

    /// Make subsequent `scrollback` calls fail with a network error.
    pub fn fail_scrollback(&self, fail: bool) {
        self.fail_scrollback.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent receipt submissions fail with a network error.
    pub fn fail_receipts(&self, fail: bool) {
        self.fail_receipts.store(fail, Ordering::SeqCst);
    }

    /// Number of `scrollback` requests issued so far.
    pub fn scrollback_calls(&self) -> usize {
        self.scrollback_calls.load(Ordering::SeqCst)
    }

    /// Successfully submitted receipts as `(room_id, event_id)`, in order.
    pub fn sent_receipts(&self) -> Vec<(String, String)> {
        lock(&self.sent_receipts).clone()
    }

    fn read_arena(&self) -> RwLockReadGuard<'_, RoomArena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_arena(&self) -> RwLockWriteGuard<'_, RoomArena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RoomDirectory for InMemoryClient {
    fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.read_arena().room(room_id)
    }

    fn joined_rooms(&self) -> Vec<Arc<Room>> {
        self.read_arena().joined_rooms()
    }

    fn direct_room_ids(&self) -> HashSet<String> {
        self.read_arena().direct_room_ids()
    }
}

impl ProtocolClient for InMemoryClient {
    async fn scrollback(&self, room_id: &str, limit: u16) -> Result<(), EngineError> {
        self.scrollback_calls.fetch_add(1, Ordering::SeqCst);
        if !self.scrollback_latency.is_zero() {
            tokio::time::sleep(self.scrollback_latency).await;
        }
        if self.fail_scrollback.load(Ordering::SeqCst) {
            return Err(EngineError::new(
                EngineErrorCategory::Network,
                "scrollback_failed",
                format!("backfill for {room_id} failed: homeserver unreachable"),
            ));
        }

        let page = lock(&self.history)
            .get_mut(room_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(HistoryPage {
                events: Vec::new(),
                next_token: None,
            });

        // Keep the newest `limit` events of the page; prepend newest first.
        let skip = page.events.len().saturating_sub(usize::from(limit));
        let ops: Vec<TimelineOp> = page
            .events
            .into_iter()
            .skip(skip)
            .rev()
            .map(TimelineOp::Prepend)
            .collect();
        trace!(%room_id, event_count = ops.len(), "serving history page");

        let mut arena = self.write_arena();
        arena.apply_ops(room_id, &ops)?;
        arena.set_pagination_token(room_id, page.next_token)
    }

    async fn send_read_receipt(&self, room_id: &str, event_id: &str) -> Result<(), EngineError> {
        if self.fail_receipts.load(Ordering::SeqCst) {
            return Err(EngineError::new(
                EngineErrorCategory::Network,
                "receipt_failed",
                format!("receipt for {event_id} in {room_id} was not delivered"),
            ));
        }
        self.write_arena().set_read_marker(room_id, event_id)?;
        lock(&self.sent_receipts).push((room_id.to_owned(), event_id.to_owned()));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
