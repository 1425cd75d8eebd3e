use std::sync::Arc;

use engine_core::{
    EngineError, EngineErrorCategory, EngineTuning, EngineUpdate, GroupKey, HierarchyResolver,
    Membership, ProtocolClient, ProtocolEvent, RoomTimeline, UnreadAggregator, UnreadSnapshot,
    VisibilityConfig, is_visible,
};
use engine_platform::BreadcrumbStore;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::{breadcrumbs::BreadcrumbTracker, channel::UpdateBus};

/// How urgently unread summaries must be recomputed after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recompute {
    /// Summaries are unaffected.
    None,
    /// Coalesce with other invalidations inside the debounce window.
    Debounced,
    /// Recompute right away.
    Immediate,
}

/// Routes protocol events and owns selection, the open timeline and summaries.
///
/// Every method runs on the single runtime task; only pagination and receipt
/// submission run concurrently, inside `RoomTimeline`.
pub struct Engine<C: ProtocolClient, S: BreadcrumbStore> {
    client: Arc<C>,
    settings: watch::Sender<VisibilityConfig>,
    tuning: EngineTuning,
    breadcrumbs: BreadcrumbTracker<S>,
    active_group: GroupKey,
    active_timeline: Option<Arc<RoomTimeline<C>>>,
    summaries: UnreadSnapshot,
    updates: UpdateBus,
}

impl<C: ProtocolClient, S: BreadcrumbStore> Engine<C, S> {
    pub fn new(
        client: Arc<C>,
        store: S,
        config: VisibilityConfig,
        tuning: EngineTuning,
        updates: UpdateBus,
    ) -> Self {
        let (settings, _) = watch::channel(config);
        Self {
            client,
            settings,
            tuning,
            breadcrumbs: BreadcrumbTracker::new(store),
            active_group: GroupKey::Home,
            active_timeline: None,
            summaries: UnreadSnapshot::default(),
            updates,
        }
    }

    pub fn active_group(&self) -> &GroupKey {
        &self.active_group
    }

    pub fn active_timeline(&self) -> Option<&Arc<RoomTimeline<C>>> {
        self.active_timeline.as_ref()
    }

    pub fn active_room_id(&self) -> Option<&str> {
        self.active_timeline.as_deref().map(RoomTimeline::room_id)
    }

    /// Last computed summaries.
    pub fn summaries(&self) -> &UnreadSnapshot {
        &self.summaries
    }

    pub fn settings(&self) -> VisibilityConfig {
        *self.settings.borrow()
    }

    pub fn tuning(&self) -> &EngineTuning {
        &self.tuning
    }

    pub fn root_spaces(&self) -> Vec<String> {
        HierarchyResolver::new(self.client.as_ref()).root_spaces()
    }

    /// Member rooms of `group` in stable order.
    pub fn group_members(&self, group: &GroupKey) -> Vec<String> {
        HierarchyResolver::new(self.client.as_ref()).group_members(group)
    }

    /// Route one protocol notification and report the recompute it requires.
    pub fn handle_protocol_event(&mut self, event: ProtocolEvent) -> Recompute {
        match event {
            ProtocolEvent::Timeline {
                event,
                to_start_of_timeline,
            } => {
                if let Some(timeline) = &self.active_timeline
                    && timeline.on_live_event(&event, to_start_of_timeline)
                {
                    self.emit_timeline_changed(&event.room_id);
                }
                if to_start_of_timeline {
                    return Recompute::None;
                }
                // An own event reads the room; a foreign one unreads it if shown.
                let own = event.sender == self.client.local_user_id();
                if !own && !is_visible(&event, &self.settings()) {
                    return Recompute::None;
                }
                trace!(room_id = %event.room_id, event_id = %event.event_id, own, "timeline event invalidates summaries");
                Recompute::Debounced
            }
            ProtocolEvent::Redaction { room_id, .. } => {
                if self.active_room_id() == Some(room_id.as_str()) {
                    self.emit_timeline_changed(&room_id);
                }
                Recompute::None
            }
            ProtocolEvent::MembershipChanged {
                room_id,
                membership,
            } => {
                debug!(room_id = %room_id, ?membership, "membership changed");
                if membership != Membership::Join
                    && self.active_room_id() == Some(room_id.as_str())
                {
                    self.close_active_timeline();
                    self.emit_selection();
                }
                Recompute::Immediate
            }
            ProtocolEvent::DirectRegistryChanged => Recompute::Immediate,
            ProtocolEvent::RoomRenamed { room_id } => {
                self.updates.emit(EngineUpdate::RoomRenamed { room_id });
                Recompute::None
            }
            ProtocolEvent::ReadReceipt {
                room_id, user_id, ..
            } => {
                if user_id != self.client.local_user_id() {
                    return Recompute::None;
                }
                if let Some(timeline) = &self.active_timeline
                    && timeline.room_id() == room_id
                {
                    timeline.confirm_read_receipt();
                }
                Recompute::Immediate
            }
            ProtocolEvent::SettingsChanged(config) => {
                info!(?config, "visibility settings changed");
                self.settings.send_replace(config);
                if let Some(timeline) = &self.active_timeline {
                    timeline.refresh_read_state();
                    let room_id = timeline.room_id().to_owned();
                    self.emit_timeline_changed(&room_id);
                }
                Recompute::Immediate
            }
        }
    }

    /// Recompute every summary and publish the snapshot.
    pub fn recompute(&mut self) -> &UnreadSnapshot {
        let mut aggregator = UnreadAggregator::new(self.client.as_ref(), self.settings());
        if let Some(timeline) = &self.active_timeline {
            aggregator = aggregator.with_read_override(timeline.room_id(), timeline.is_read());
        }
        self.summaries = aggregator.snapshot();
        debug!(
            room_count = self.summaries.rooms.len(),
            group_count = self.summaries.groups.len(),
            "summaries recomputed"
        );
        self.updates
            .emit(EngineUpdate::SummariesUpdated(self.summaries.clone()));
        &self.summaries
    }

    /// Open `room_id` (or clear the selection) and remember it for the active group.
    pub fn select_room(&mut self, room_id: Option<String>) -> Result<(), EngineError> {
        self.open_room(room_id)?;
        let members = self.group_members(&self.active_group);
        self.remember_active_room(&members);
        self.emit_selection();
        Ok(())
    }

    /// Switch groups, reopening the group's remembered room when still a member.
    pub fn select_group(&mut self, group: GroupKey) -> Result<(), EngineError> {
        let members = self.group_members(&group);
        let restored = self.breadcrumbs.restore(&group, &members);
        debug!(group = %group, member_count = members.len(), restored = ?restored, "group selected");
        self.active_group = group;
        self.open_room(restored)?;
        self.remember_active_room(&members);
        self.emit_selection();
        Ok(())
    }

    /// Optimistically mark the open room read.
    pub fn mark_active_room_read(&mut self) -> Result<Recompute, EngineError> {
        let timeline = self.active_timeline.as_ref().ok_or_else(no_active_room)?;
        timeline.mark_as_read();
        Ok(Recompute::Immediate)
    }

    /// Timeline to paginate for `PaginateBack`.
    pub fn pagination_target(&self) -> Result<Arc<RoomTimeline<C>>, EngineError> {
        self.active_timeline.clone().ok_or_else(no_active_room)
    }

    /// Close the open timeline, flushing its pending receipt.
    pub fn shutdown(&mut self) {
        self.close_active_timeline();
    }

    fn open_room(&mut self, room_id: Option<String>) -> Result<(), EngineError> {
        if self.active_room_id() == room_id.as_deref() {
            return Ok(());
        }
        let Some(room_id) = room_id else {
            self.close_active_timeline();
            return Ok(());
        };

        let timeline = RoomTimeline::new(
            self.client.clone(),
            room_id,
            self.settings.subscribe(),
            &self.tuning,
        )?;
        self.close_active_timeline();
        self.active_timeline = Some(Arc::new(timeline));
        Ok(())
    }

    /// A store failure is reported but never undoes the selection.
    fn remember_active_room(&mut self, members: &[String]) {
        let Some(timeline) = &self.active_timeline else {
            return;
        };
        if let Err(err) = self
            .breadcrumbs
            .record(&self.active_group, timeline.room_id(), members)
        {
            self.updates.emit(EngineUpdate::from_error(err));
        }
    }

    fn close_active_timeline(&mut self) {
        if let Some(timeline) = self.active_timeline.take() {
            timeline.destroy();
        }
    }

    fn emit_selection(&self) {
        self.updates.emit(EngineUpdate::SelectionChanged {
            group: self.active_group.clone(),
            room_id: self.active_room_id().map(str::to_owned),
        });
    }

    fn emit_timeline_changed(&self, room_id: &str) {
        self.updates.emit(EngineUpdate::TimelineChanged {
            room_id: room_id.to_owned(),
        });
    }
}

fn no_active_room() -> EngineError {
    EngineError::new(
        EngineErrorCategory::Config,
        "no_active_room",
        "no room is selected",
    )
}

#[cfg(test)]
mod tests {
    use engine_core::{InMemoryClient, Room, TimelineEvent};
    use engine_platform::{
        BreadcrumbStore, BreadcrumbStoreError, Breadcrumbs, InMemoryBreadcrumbStore,
    };

    use super::*;
    use crate::channel::UpdateStream;

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";
    const SPACE: &str = "!space:example.org";
    const DEV: &str = "!dev:example.org";
    const OPS: &str = "!ops:example.org";
    const LOBBY: &str = "!lobby:example.org";

    struct Fixture {
        client: Arc<InMemoryClient>,
        store: InMemoryBreadcrumbStore,
        engine: Engine<InMemoryClient, InMemoryBreadcrumbStore>,
        updates: UpdateStream,
    }

    fn seeded_client() -> Arc<InMemoryClient> {
        let client = InMemoryClient::new(ALICE);
        client.insert_room(Room::space(SPACE, [DEV, OPS]));
        client.insert_room(
            Room::joined(DEV)
                .with_timeline(vec![TimelineEvent::message(DEV, "$d1", BOB, "build is red", 1)])
                .with_counts(1, 0),
        );
        client.insert_room(
            Room::joined(OPS)
                .with_timeline(vec![TimelineEvent::message(OPS, "$o1", BOB, "deploy", 1)])
                .with_read_marker("$o1"),
        );
        client.insert_room(Room::joined(LOBBY));
        client.into_shared()
    }

    fn fixture() -> Fixture {
        let client = seeded_client();
        let store = InMemoryBreadcrumbStore::default();
        let bus = UpdateBus::new(64);
        let updates = bus.subscribe();
        let engine = Engine::new(
            client.clone(),
            store.clone(),
            VisibilityConfig::default(),
            EngineTuning::default(),
            bus,
        );
        Fixture {
            client,
            store,
            engine,
            updates,
        }
    }

    fn drain(updates: &mut UpdateStream) -> Vec<EngineUpdate> {
        std::iter::from_fn(|| updates.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn select_group_restores_first_member_then_breadcrumb() {
        let mut f = fixture();
        let space = GroupKey::Space(SPACE.to_owned());

        f.engine.select_group(space.clone()).expect("select space");
        assert_eq!(f.engine.active_room_id(), Some(DEV));

        f.engine.select_room(Some(OPS.to_owned())).expect("select ops");
        f.engine.select_group(GroupKey::Home).expect("select home");
        assert_eq!(f.engine.active_room_id(), Some(LOBBY));

        f.engine.select_group(space.clone()).expect("back to space");
        assert_eq!(f.engine.active_room_id(), Some(OPS));
        assert_eq!(
            f.store.load().expect("load").get(SPACE).map(String::as_str),
            Some(OPS)
        );

        let last = drain(&mut f.updates).pop().expect("selection update");
        assert_eq!(
            last,
            EngineUpdate::SelectionChanged {
                group: space,
                room_id: Some(OPS.to_owned()),
            }
        );
    }

    #[tokio::test]
    async fn selecting_room_outside_active_group_is_not_remembered() {
        let mut f = fixture();
        f.engine
            .select_group(GroupKey::Space(SPACE.to_owned()))
            .expect("select space");
        f.engine
            .select_room(Some(LOBBY.to_owned()))
            .expect("select lobby");
        assert_eq!(f.engine.active_room_id(), Some(LOBBY));
        assert_eq!(
            f.store.load().expect("load").get(SPACE).map(String::as_str),
            Some(DEV)
        );
    }

    #[tokio::test]
    async fn selecting_unknown_room_fails_and_keeps_selection() {
        let mut f = fixture();
        f.engine.select_room(Some(DEV.to_owned())).expect("select dev");
        let err = f
            .engine
            .select_room(Some("!missing:example.org".to_owned()))
            .expect_err("unknown room");
        assert_eq!(err.code, "room_not_found");
        assert_eq!(f.engine.active_room_id(), Some(DEV));
    }

    #[tokio::test]
    async fn classifies_timeline_events() {
        let mut f = fixture();
        let theirs = f
            .client
            .deliver_live(TimelineEvent::message(LOBBY, "$1", BOB, "hi", 2))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(theirs), Recompute::Debounced);

        let own = f
            .client
            .deliver_live(TimelineEvent::message(LOBBY, "$2", ALICE, "hey", 3))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(own), Recompute::Debounced);

        let edit = f
            .client
            .deliver_live(TimelineEvent::edit(LOBBY, "$3", BOB, "$1", "hi!", 4))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(edit), Recompute::None);
    }

    #[tokio::test]
    async fn live_event_in_active_room_emits_timeline_change() {
        let mut f = fixture();
        f.engine.select_room(Some(OPS.to_owned())).expect("select");
        drain(&mut f.updates);

        let event = f
            .client
            .deliver_live(TimelineEvent::message(OPS, "$o2", BOB, "rollback", 2))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(event), Recompute::Debounced);
        assert_eq!(
            drain(&mut f.updates),
            [EngineUpdate::TimelineChanged {
                room_id: OPS.to_owned()
            }]
        );
        assert!(!f.engine.recompute().summary(OPS).read);
    }

    #[tokio::test]
    async fn reply_in_open_room_reads_it_before_and_after_navigation() {
        let mut f = fixture();
        f.engine.select_room(Some(OPS.to_owned())).expect("select");

        let theirs = f
            .client
            .deliver_live(TimelineEvent::message(OPS, "$o2", BOB, "rollback?", 2))
            .expect("deliver");
        f.engine.handle_protocol_event(theirs);
        assert!(!f.engine.recompute().summary(OPS).read);

        let reply = f
            .client
            .deliver_live(TimelineEvent::message(OPS, "$o3", ALICE, "rolling back", 3))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(reply), Recompute::Debounced);
        let open = f.engine.recompute().summary(OPS);

        f.engine.select_room(Some(LOBBY.to_owned())).expect("navigate away");
        let away = f.engine.recompute().summary(OPS);
        assert!(open.read);
        assert_eq!(open, away);
    }

    struct FailingStore;

    impl BreadcrumbStore for FailingStore {
        fn load(&self) -> Result<Breadcrumbs, BreadcrumbStoreError> {
            Ok(Breadcrumbs::new())
        }

        fn save(&self, _breadcrumbs: &Breadcrumbs) -> Result<(), BreadcrumbStoreError> {
            Err(BreadcrumbStoreError::Backend("read-only volume".to_owned()))
        }
    }

    #[tokio::test]
    async fn breadcrumb_write_failure_is_reported_without_undoing_selection() {
        let bus = UpdateBus::new(16);
        let mut updates = bus.subscribe();
        let mut engine = Engine::new(
            seeded_client(),
            FailingStore,
            VisibilityConfig::default(),
            EngineTuning::default(),
            bus,
        );

        engine.select_room(Some(LOBBY.to_owned())).expect("selection succeeds");
        assert_eq!(engine.active_room_id(), Some(LOBBY));
        assert_eq!(
            drain(&mut updates),
            [
                EngineUpdate::Error {
                    code: "breadcrumb_store_error".to_owned(),
                    message: "breadcrumb store backend failure: read-only volume".to_owned(),
                    recoverable: true,
                },
                EngineUpdate::SelectionChanged {
                    group: GroupKey::Home,
                    room_id: Some(LOBBY.to_owned()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn leaving_active_room_clears_selection() {
        let mut f = fixture();
        f.engine.select_room(Some(DEV.to_owned())).expect("select");
        let timeline = f.engine.active_timeline().cloned().expect("timeline");

        let left = f
            .client
            .set_membership(DEV, Membership::Leave)
            .expect("leave");
        assert_eq!(f.engine.handle_protocol_event(left), Recompute::Immediate);
        assert_eq!(f.engine.active_room_id(), None);
        assert!(!timeline.is_alive());

        let snapshot = f.engine.recompute();
        assert!(!snapshot.rooms.contains_key(DEV));
        assert!(snapshot.group(&GroupKey::Space(SPACE.to_owned())).read);
    }

    #[tokio::test]
    async fn marking_active_room_read_clears_badge_before_receipt() {
        let mut f = fixture();
        assert!(!f.engine.recompute().summary(DEV).read);

        f.engine.select_room(Some(DEV.to_owned())).expect("select");
        assert_eq!(
            f.engine.mark_active_room_read().expect("mark read"),
            Recompute::Immediate
        );
        let snapshot = f.engine.recompute();
        assert!(snapshot.summary(DEV).read);
        assert!(snapshot.group(&GroupKey::Space(SPACE.to_owned())).read);
        assert!(f.client.sent_receipts().is_empty(), "receipt is debounced");
    }

    #[tokio::test]
    async fn mark_read_without_selection_is_an_error() {
        let mut f = fixture();
        let err = f.engine.mark_active_room_read().expect_err("nothing selected");
        assert_eq!(err.code, "no_active_room");
    }

    #[tokio::test]
    async fn own_read_receipt_confirms_active_timeline() {
        let mut f = fixture();
        f.engine.select_room(Some(DEV.to_owned())).expect("select");
        let timeline = f.engine.active_timeline().cloned().expect("timeline");
        assert!(!timeline.is_read());

        let foreign = f.client.deliver_receipt(DEV, BOB, "$d1").expect("receipt");
        assert_eq!(f.engine.handle_protocol_event(foreign), Recompute::None);

        let own = f.client.deliver_receipt(DEV, ALICE, "$d1").expect("receipt");
        assert_eq!(f.engine.handle_protocol_event(own), Recompute::Immediate);
        assert!(timeline.is_read());
    }

    #[tokio::test]
    async fn rename_only_refreshes_ui() {
        let mut f = fixture();
        let renamed = f.client.rename_room(OPS, "Operations").expect("rename");
        assert_eq!(f.engine.handle_protocol_event(renamed), Recompute::None);
        assert_eq!(
            drain(&mut f.updates),
            [EngineUpdate::RoomRenamed {
                room_id: OPS.to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn settings_change_reaches_open_timeline() {
        let mut f = fixture();
        f.engine.select_room(Some(OPS.to_owned())).expect("select");
        let timeline = f.engine.active_timeline().cloned().expect("timeline");

        let join = f
            .client
            .deliver_live(TimelineEvent::membership(OPS, "$o2", BOB, Membership::Join, Some(Membership::Leave), 2))
            .expect("deliver");
        assert_eq!(f.engine.handle_protocol_event(join), Recompute::Debounced);
        assert!(!timeline.is_read());

        let hide_joins = VisibilityConfig {
            show_join_events: false,
            ..VisibilityConfig::default()
        };
        assert_eq!(
            f.engine
                .handle_protocol_event(ProtocolEvent::SettingsChanged(hide_joins)),
            Recompute::Immediate
        );
        assert!(timeline.is_read());
        assert_eq!(timeline.events().len(), 1);
        assert!(f.engine.recompute().summary(OPS).read);
    }
}
