//! Async runtime around the chat state engine.
//!
//! One task owns the [`Engine`] and processes commands in arrival order.
//! Timeline-event invalidations are coalesced into one summary recompute per
//! debounce window; structural changes recompute immediately. Backward
//! pagination runs in its own task so live events keep flowing meanwhile.

/// Last-selected room per group.
pub mod breadcrumbs;
/// Update fan-out to subscribers.
pub mod channel;
/// Event routing, selection and summary ownership.
pub mod engine;

use std::{sync::Arc, time::Duration};

use engine_core::{
    Backfill, EngineCommand, EngineTuning, EngineUpdate, ProtocolClient, VisibilityConfig,
};
use engine_platform::BreadcrumbStore;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

pub use breadcrumbs::BreadcrumbTracker;
pub use channel::{RuntimeError, UpdateBus, UpdateStream};
pub use engine::{Engine, Recompute};

const COMMAND_BUFFER: usize = 128;
const UPDATE_BUFFER: usize = 512;

#[derive(Clone, Debug)]
pub struct EngineRuntimeHandle {
    commands: mpsc::Sender<EngineCommand>,
    updates: UpdateBus,
}

impl EngineRuntimeHandle {
    /// Queue one command, waiting while the command buffer is full.
    pub async fn send(&self, command: EngineCommand) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::Stopped)
    }

    pub fn subscribe(&self) -> UpdateStream {
        self.updates.subscribe()
    }
}

/// Spawn the engine runtime onto the current tokio runtime.
///
/// The runtime publishes an initial `SummariesUpdated` and stops once every
/// handle has been dropped.
pub fn spawn_runtime<C, S>(
    client: Arc<C>,
    store: S,
    config: VisibilityConfig,
    tuning: EngineTuning,
) -> EngineRuntimeHandle
where
    C: ProtocolClient,
    S: BreadcrumbStore + 'static,
{
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let updates = UpdateBus::new(UPDATE_BUFFER);
    let engine = Engine::new(client, store, config, tuning, updates.clone());
    let runtime = EngineRuntime::new(engine, updates.clone(), command_rx);
    tokio::spawn(async move {
        runtime.run().await;
    });

    EngineRuntimeHandle { commands, updates }
}

struct EngineRuntime<C: ProtocolClient, S: BreadcrumbStore> {
    engine: Engine<C, S>,
    updates: UpdateBus,
    command_rx: mpsc::Receiver<EngineCommand>,
    recompute_debounce: Duration,
    recompute_deadline: Option<Instant>,
}

impl<C: ProtocolClient, S: BreadcrumbStore> EngineRuntime<C, S> {
    fn new(
        engine: Engine<C, S>,
        updates: UpdateBus,
        command_rx: mpsc::Receiver<EngineCommand>,
    ) -> Self {
        let recompute_debounce = engine.tuning().recompute_debounce();
        Self {
            engine,
            updates,
            command_rx,
            recompute_debounce,
            recompute_deadline: None,
        }
    }

    async fn run(mut self) {
        info!("engine runtime started");
        self.engine.recompute();

        loop {
            let deadline = self.recompute_deadline;
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = wait_for(deadline) => {
                    self.recompute_deadline = None;
                    self.engine.recompute();
                }
            }
        }

        self.engine.shutdown();
        info!("engine runtime stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        let result = match command {
            EngineCommand::Protocol(event) => {
                let recompute = self.engine.handle_protocol_event(event);
                self.apply(recompute);
                Ok(())
            }
            EngineCommand::SelectRoom { room_id } => self.engine.select_room(room_id),
            EngineCommand::SelectGroup { group } => self.engine.select_group(group),
            EngineCommand::MarkActiveRoomRead => self
                .engine
                .mark_active_room_read()
                .map(|recompute| self.apply(recompute)),
            EngineCommand::PaginateBack => self.engine.pagination_target().map(|timeline| {
                let updates = self.updates.clone();
                tokio::spawn(async move {
                    let room_id = timeline.room_id().to_owned();
                    match timeline.get_more().await {
                        Ok(Backfill::Loaded) => {
                            updates.emit(EngineUpdate::PaginationFinished {
                                room_id: room_id.clone(),
                                can_load: timeline.can_load(),
                            });
                            updates.emit(EngineUpdate::TimelineChanged { room_id });
                        }
                        Ok(Backfill::Skipped) => {
                            debug!(room_id = %room_id, "pagination request skipped")
                        }
                        Err(err) => {
                            updates.emit(EngineUpdate::from_error(err));
                        }
                    }
                });
            }),
            EngineCommand::Refresh => {
                self.apply(Recompute::Immediate);
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(code = %err.code, error = %err, "engine command failed");
            self.updates.emit(EngineUpdate::from_error(err));
        }
    }

    fn apply(&mut self, recompute: Recompute) {
        match recompute {
            Recompute::None => {}
            Recompute::Debounced => {
                if self.recompute_deadline.is_none() {
                    self.recompute_deadline = Some(Instant::now() + self.recompute_debounce);
                }
            }
            Recompute::Immediate => {
                self.recompute_deadline = None;
                self.engine.recompute();
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
