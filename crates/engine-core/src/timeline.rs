use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::{
    client::ProtocolClient,
    error::EngineError,
    pagination::{PaginationState, PaginationStateMachine, bounded_paginate_limit},
    receipts::ReceiptDebouncer,
    types::{EngineTuning, TimelineEvent, TimelineItem},
    unread::room_is_read,
    visibility::{VisibilityConfig, is_visible},
};

/// Outcome of one `RoomTimeline::get_more` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backfill {
    /// No page was loaded: a request was already in flight, history is
    /// exhausted or the timeline was closed.
    Skipped,
    /// One page was loaded and its edits indexed.
    Loaded,
}

#[derive(Debug)]
struct TimelineState {
    pagination: PaginationStateMachine,
    read: bool,
    /// Target event id -> most recent edit seen for it.
    edit_overrides: HashMap<String, TimelineEvent>,
}

/// Live view of one room: backward pagination, edit resolution and read state.
///
/// Events themselves stay in the protocol client's room window; this type
/// only keeps the state needed to project that window for display. After
/// `destroy` every operation is a no-op, including pagination requests that
/// were already in flight.
#[derive(Debug)]
pub struct RoomTimeline<C: ProtocolClient> {
    room_id: String,
    client: Arc<C>,
    settings: watch::Receiver<VisibilityConfig>,
    state: Mutex<TimelineState>,
    alive: AtomicBool,
    receipts: ReceiptDebouncer,
    paginate_limit: u16,
}

impl<C: ProtocolClient> RoomTimeline<C> {
    /// Open the timeline of a known room.
    ///
    /// Must be called from within a tokio runtime; the receipt debouncer is
    /// spawned onto it.
    pub fn new(
        client: Arc<C>,
        room_id: impl Into<String>,
        settings: watch::Receiver<VisibilityConfig>,
        tuning: &EngineTuning,
    ) -> Result<Self, EngineError> {
        let room_id = room_id.into();
        let room = client
            .room(&room_id)
            .ok_or_else(|| EngineError::room_not_found(&room_id))?;

        let config = *settings.borrow();
        let mut edit_overrides = HashMap::new();
        index_edits(&mut edit_overrides, &room.timeline);
        let state = TimelineState {
            pagination: PaginationStateMachine::new(room.pagination_token.clone()),
            read: room_is_read(&room, client.local_user_id(), &config),
            edit_overrides,
        };
        debug!(
            room_id = %room_id,
            window_len = room.timeline.len(),
            read = state.read,
            "room timeline opened"
        );

        let receipts =
            ReceiptDebouncer::spawn(client.clone(), room_id.clone(), tuning.receipt_debounce());
        Ok(Self {
            room_id,
            client,
            settings,
            state: Mutex::new(state),
            alive: AtomicBool::new(true),
            receipts,
            paginate_limit: tuning.paginate_limit,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// `true` while older history may exist.
    pub fn can_load(&self) -> bool {
        self.lock_state().pagination.can_load()
    }

    pub fn pagination_state(&self) -> PaginationState {
        self.lock_state().pagination.state().clone()
    }

    pub fn is_read(&self) -> bool {
        self.lock_state().read
    }

    /// Ingest one timeline event delivered for any room.
    ///
    /// Returns `true` when the event belongs to this room and changes what
    /// `events` renders.
    pub fn on_live_event(&self, event: &TimelineEvent, to_start_of_timeline: bool) -> bool {
        if event.room_id != self.room_id || !self.is_alive() {
            return false;
        }

        let config = self.config();
        let local_user_id = self.client.local_user_id();
        let mut state = self.lock_state();
        // Sending implies having read everything before it.
        if !to_start_of_timeline && event.sender == local_user_id {
            state.read = true;
        }

        if let Some(target) = event.edit_target() {
            if to_start_of_timeline {
                state
                    .edit_overrides
                    .entry(target.to_owned())
                    .or_insert_with(|| event.clone());
            } else {
                state
                    .edit_overrides
                    .insert(target.to_owned(), event.clone());
            }
            return true;
        }

        let visible = is_visible(event, &config);
        if !to_start_of_timeline && visible && event.sender != local_user_id {
            if state.read {
                trace!(room_id = %self.room_id, event_id = %event.event_id, "room became unread");
            }
            state.read = false;
        }
        visible
    }

    /// Backfill one page of older history.
    ///
    /// A call while a request is in flight, after exhaustion or after teardown
    /// is a no-op reported as `Backfill::Skipped`. Transport errors propagate;
    /// the timeline stays ready so the caller may retry.
    pub async fn get_more(&self) -> Result<Backfill, EngineError> {
        if !self.is_alive() {
            return Ok(Backfill::Skipped);
        }
        let from = {
            let mut state = self.lock_state();
            if !state.pagination.can_load() || state.pagination.is_loading() {
                trace!(room_id = %self.room_id, state = ?state.pagination.state(), "pagination skipped");
                return Ok(Backfill::Skipped);
            }
            state.pagination.begin()?
        };

        let limit = bounded_paginate_limit(self.paginate_limit, u16::MAX);
        debug!(room_id = %self.room_id, from = %from, limit, "paginating backwards");
        let result = self.client.scrollback(&self.room_id, limit).await;

        if !self.is_alive() {
            debug!(room_id = %self.room_id, "dropping pagination result for closed timeline");
            return Ok(Backfill::Skipped);
        }

        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                let room = self.client.room(&self.room_id);
                let next_token = room.as_ref().and_then(|room| room.pagination_token.clone());
                if let Some(room) = &room {
                    index_edits(&mut state.edit_overrides, &room.timeline);
                }
                let settled = state.pagination.finish(next_token)?;
                debug!(room_id = %self.room_id, state = ?settled, "pagination finished");
                Ok(Backfill::Loaded)
            }
            Err(err) => {
                state.pagination.fail()?;
                warn!(room_id = %self.room_id, error = %err, "pagination failed");
                Err(err)
            }
        }
    }

    /// Visible events of the loaded window, oldest first, with edits applied.
    pub fn events(&self) -> Vec<TimelineItem> {
        let Some(room) = self.client.room(&self.room_id) else {
            return Vec::new();
        };
        let config = self.config();
        let redacted_in_window: HashMap<&str, bool> = room
            .timeline
            .iter()
            .map(|event| (event.event_id.as_str(), event.redacted))
            .collect();

        let state = self.lock_state();
        room.timeline
            .iter()
            .filter(|event| is_visible(event, &config))
            .map(|event| {
                let edit = state
                    .edit_overrides
                    .get(&event.event_id)
                    .filter(|edit| !event.redacted && edit.sender == event.sender)
                    .filter(|edit| {
                        !redacted_in_window
                            .get(edit.event_id.as_str())
                            .copied()
                            .unwrap_or(edit.redacted)
                    });
                TimelineItem {
                    event_id: event.event_id.clone(),
                    sender: event.sender.clone(),
                    body: edit.map_or_else(|| event.body.clone(), |edit| edit.body.clone()),
                    kind: event.kind.clone(),
                    timestamp_ms: event.timestamp_ms,
                    redacted: event.redacted,
                    edited: edit.is_some(),
                }
            })
            .collect()
    }

    /// Optimistically mark the room read and schedule a debounced receipt.
    ///
    /// The receipt targets the newest rendered event not sent by the local
    /// user; none is sent when there is no such event.
    pub fn mark_as_read(&self) {
        if !self.is_alive() {
            return;
        }
        {
            let mut state = self.lock_state();
            if state.read {
                return;
            }
            state.read = true;
        }

        let local_user_id = self.client.local_user_id();
        match self
            .events()
            .into_iter()
            .rev()
            .find(|item| item.sender != local_user_id)
        {
            Some(item) => {
                trace!(room_id = %self.room_id, event_id = %item.event_id, "scheduling read receipt");
                self.receipts.schedule(item.event_id);
            }
            None => trace!(room_id = %self.room_id, "no foreign event to acknowledge"),
        }
    }

    /// A receipt of the local user was confirmed by the server.
    pub fn confirm_read_receipt(&self) {
        if self.is_alive() && self.scan_read() {
            self.lock_state().read = true;
        }
    }

    /// Recompute the read flag from the read marker, e.g. after a visibility change.
    pub fn refresh_read_state(&self) {
        if self.is_alive() {
            let read = self.scan_read();
            self.lock_state().read = read;
        }
    }

    /// Tear the timeline down. A pending receipt is still flushed once.
    pub fn destroy(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(room_id = %self.room_id, "room timeline closed");
            self.receipts.shutdown();
        }
    }

    fn scan_read(&self) -> bool {
        match self.client.room(&self.room_id) {
            Some(room) => room_is_read(&room, self.client.local_user_id(), &self.config()),
            None => true,
        }
    }

    fn config(&self) -> VisibilityConfig {
        *self.settings.borrow()
    }

    fn lock_state(&self) -> MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Index edits newest to oldest without replacing edits already known.
fn index_edits(overrides: &mut HashMap<String, TimelineEvent>, window: &[TimelineEvent]) {
    for event in window.iter().rev() {
        if let Some(target) = event.edit_target() {
            overrides
                .entry(target.to_owned())
                .or_insert_with(|| event.clone());
        }
    }
}
