use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::ProtocolClient;

/// Trailing-edge debouncer for one room's read receipts.
///
/// Every `schedule` restarts the window; when it elapses a single receipt
/// carrying the most recently scheduled event is submitted. A receipt still
/// pending at shutdown is flushed once before the task exits.
#[derive(Debug)]
pub struct ReceiptDebouncer {
    tx: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
}

impl ReceiptDebouncer {
    /// Spawn the debounce task on the current tokio runtime.
    pub fn spawn<C: ProtocolClient>(client: Arc<C>, room_id: String, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        tokio::spawn(run(client, room_id, window, rx, stop.child_token()));
        Self { tx, stop }
    }

    /// Request a receipt for `event_id`, replacing any pending one.
    pub fn schedule(&self, event_id: impl Into<String>) {
        let _ = self.tx.send(event_id.into());
    }

    /// Stop the task, flushing a pending receipt first.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl Drop for ReceiptDebouncer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run<C: ProtocolClient>(
    client: Arc<C>,
    room_id: String,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
) {
    loop {
        let mut pending = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            next = rx.recv() => match next {
                Some(event_id) => event_id,
                None => return,
            },
        };

        loop {
            let deadline = tokio::time::sleep(window);
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    submit(client.as_ref(), &room_id, &pending).await;
                    return;
                }
                next = rx.recv() => match next {
                    Some(event_id) => {
                        trace!(room_id = %room_id, event_id = %event_id, "coalescing read receipt");
                        pending = event_id;
                    }
                    None => {
                        submit(client.as_ref(), &room_id, &pending).await;
                        return;
                    }
                },
                _ = deadline => {
                    submit(client.as_ref(), &room_id, &pending).await;
                    break;
                }
            }
        }
    }
}

async fn submit<C: ProtocolClient>(client: &C, room_id: &str, event_id: &str) {
    match client.send_read_receipt(room_id, event_id).await {
        Ok(()) => debug!(room_id = %room_id, event_id = %event_id, "read receipt sent"),
        Err(err) => {
            debug!(room_id = %room_id, event_id = %event_id, error = %err, "read receipt failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::RoomDirectory,
        memory::InMemoryClient,
        types::{Room, TimelineEvent},
    };

    const ROOM: &str = "!r:example.org";
    const WINDOW: Duration = Duration::from_millis(300);

    fn client() -> Arc<InMemoryClient> {
        let client = InMemoryClient::new("@alice:example.org");
        client.insert_room(Room::joined(ROOM).with_timeline(vec![
            TimelineEvent::message(ROOM, "$1", "@bob:example.org", "one", 1),
            TimelineEvent::message(ROOM, "$2", "@bob:example.org", "two", 2),
        ]));
        client.into_shared()
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_burst_into_latest_event() {
        let client = client();
        let debouncer = ReceiptDebouncer::spawn(client.clone(), ROOM.to_owned(), WINDOW);

        debouncer.schedule("$1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.schedule("$2");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(client.sent_receipts().is_empty(), "window restarted on second request");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.sent_receipts(), [(ROOM.to_owned(), "$2".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_pending_receipt_on_shutdown() {
        let client = client();
        let debouncer = ReceiptDebouncer::spawn(client.clone(), ROOM.to_owned(), WINDOW);

        debouncer.schedule("$2");
        tokio::time::sleep(Duration::from_millis(10)).await;
        debouncer.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.sent_receipts(), [(ROOM.to_owned(), "$2".to_owned())]);
        assert_eq!(
            client.room(ROOM).expect("room").read_marker_event_id.as_deref(),
            Some("$2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn swallows_submission_failures() {
        let client = client();
        client.fail_receipts(true);
        let debouncer = ReceiptDebouncer::spawn(client.clone(), ROOM.to_owned(), WINDOW);

        debouncer.schedule("$1");
        tokio::time::sleep(WINDOW * 2).await;
        assert!(client.sent_receipts().is_empty());

        client.fail_receipts(false);
        debouncer.schedule("$2");
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(client.sent_receipts(), [(ROOM.to_owned(), "$2".to_owned())]);
    }
}
