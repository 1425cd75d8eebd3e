use engine_core::EngineUpdate;
use thiserror::Error;
use tokio::sync::broadcast;

/// Receiving end of the update bus handed to UI subscribers.
pub type UpdateStream = broadcast::Receiver<EngineUpdate>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime task has exited and no longer accepts commands.
    #[error("engine runtime has stopped")]
    Stopped,
}

/// Fan-out of engine updates, shared by the engine and background pagination.
#[derive(Clone, Debug)]
pub struct UpdateBus {
    tx: broadcast::Sender<EngineUpdate>,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Updates published after this call.
    pub fn subscribe(&self) -> UpdateStream {
        self.tx.subscribe()
    }

    /// Publish to the current subscribers and return how many there were.
    ///
    /// Nobody listening is not an error; slow subscribers observe `Lagged`.
    pub fn emit(&self, update: EngineUpdate) -> usize {
        self.tx.send(update).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use engine_core::GroupKey;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_update() {
        let bus = UpdateBus::new(16);
        let mut ui = bus.subscribe();
        let mut tray = bus.subscribe();
        let update = EngineUpdate::SelectionChanged {
            group: GroupKey::Directs,
            room_id: None,
        };

        assert_eq!(bus.emit(update.clone()), 2);
        assert_eq!(ui.recv().await.expect("ui update"), update);
        assert_eq!(tray.recv().await.expect("tray update"), update);
    }

    #[test]
    fn emitting_without_subscribers_is_dropped() {
        let bus = UpdateBus::new(4);
        assert_eq!(
            bus.emit(EngineUpdate::RoomRenamed {
                room_id: "!r:example.org".to_owned(),
            }),
            0
        );
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_updates() {
        let bus = UpdateBus::new(4);
        bus.emit(EngineUpdate::RoomRenamed {
            room_id: "!old:example.org".to_owned(),
        });
        let mut late = bus.subscribe();
        bus.emit(EngineUpdate::RoomRenamed {
            room_id: "!new:example.org".to_owned(),
        });

        assert_eq!(
            late.recv().await.expect("update"),
            EngineUpdate::RoomRenamed {
                room_id: "!new:example.org".to_owned()
            }
        );
    }
}
