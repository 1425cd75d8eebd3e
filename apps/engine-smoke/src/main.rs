//! Scripted end-to-end session against the in-memory protocol client.
//!
//! Builds a small account with nested (and cyclic) spaces, drives the engine
//! runtime through selection, live traffic, pagination and read marking, and
//! prints the final unread snapshot as JSON.

mod config;
mod logging;

use std::{process, sync::Arc, time::Duration};

use engine_core::{
    EngineCommand, EngineUpdate, GroupKey, HistoryPage, InMemoryClient, Membership, ProtocolEvent,
    Room, TimelineEvent, UnreadSnapshot,
};
use engine_platform::{BreadcrumbStore, InMemoryBreadcrumbStore, JsonFileBreadcrumbStore};
use engine_runtime::{EngineRuntimeHandle, UpdateStream, spawn_runtime};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SmokeConfig;

const ENGINEERING: &str = "!engineering:example.org";
const DESIGN: &str = "!design:example.org";
const BACKEND: &str = "!backend:example.org";
const FRONTEND: &str = "!frontend:example.org";
const FIGMA: &str = "!figma:example.org";
const LOBBY: &str = "!lobby:example.org";
const DM_BOB: &str = "!dm-bob:example.org";
const BOB: &str = "@bob:example.org";
const CAROL: &str = "@carol:example.org";
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };
    info!(user_id = %config.user_id, tuning = ?config.tuning, "starting engine smoke session");

    let result = match config.breadcrumbs_path.clone() {
        Some(path) => run_session(&config, JsonFileBreadcrumbStore::new(path)).await,
        None => run_session(&config, InMemoryBreadcrumbStore::default()).await,
    };

    match result {
        Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to encode snapshot: {err}");
                process::exit(1);
            }
        },
        Err(message) => {
            error!(%message, "smoke session failed");
            eprintln!("Smoke session failed: {message}");
            process::exit(1);
        }
    }
}

async fn run_session<S>(config: &SmokeConfig, store: S) -> Result<UnreadSnapshot, String>
where
    S: BreadcrumbStore + 'static,
{
    let client = seed_account(&config.user_id);
    let handle = spawn_runtime(client.clone(), store, config.visibility, config.tuning);
    let mut updates = handle.subscribe();
    // The startup snapshot may be published before this subscription exists.
    send(&handle, EngineCommand::Refresh).await?;
    let initial = wait_for_snapshot(&mut updates).await?;
    info!(root_spaces = ?initial.root_spaces, "initial summaries ready");

    send(&handle, EngineCommand::SelectGroup {
        group: GroupKey::Space(ENGINEERING.to_owned()),
    })
    .await?;
    let selected = wait_for(&mut updates, |update| {
        matches!(update, EngineUpdate::SelectionChanged { .. })
    })
    .await?;
    info!(?selected, "engineering space selected");

    for (room_id, event_id, body) in [
        (FRONTEND, "$fe-2", "storybook is up"),
        (FRONTEND, "$fe-3", "please review"),
        (DM_BOB, "$dm-2", "lunch?"),
    ] {
        let event = client
            .deliver_live(TimelineEvent::message(room_id, event_id, BOB, body, now_ms()))
            .map_err(|err| err.to_string())?;
        send(&handle, EngineCommand::Protocol(event)).await?;
    }
    let busy = wait_for_snapshot(&mut updates).await?;
    info!(
        frontend_read = busy.summary(FRONTEND).read,
        engineering = ?busy.summary(ENGINEERING),
        "live traffic coalesced"
    );

    send(&handle, EngineCommand::PaginateBack).await?;
    let paginated = wait_for(&mut updates, |update| {
        matches!(
            update,
            EngineUpdate::PaginationFinished { .. } | EngineUpdate::Error { .. }
        )
    })
    .await?;
    info!(?paginated, "backfill finished");

    send(&handle, EngineCommand::MarkActiveRoomRead).await?;
    wait_for_snapshot(&mut updates).await?;

    send(&handle, EngineCommand::SelectRoom {
        room_id: Some(FRONTEND.to_owned()),
    })
    .await?;
    send(&handle, EngineCommand::MarkActiveRoomRead).await?;
    wait_for_snapshot(&mut updates).await?;

    let joined = client
        .deliver_live(TimelineEvent::membership(
            LOBBY,
            "$lobby-join",
            CAROL,
            Membership::Join,
            Some(Membership::Leave),
            now_ms(),
        ))
        .map_err(|err| err.to_string())?;
    send(&handle, EngineCommand::Protocol(joined)).await?;
    wait_for_snapshot(&mut updates).await?;

    let mut hide_joins = config.visibility;
    hide_joins.show_join_events = false;
    send(
        &handle,
        EngineCommand::Protocol(ProtocolEvent::SettingsChanged(hide_joins)),
    )
    .await?;
    let snapshot = wait_for_snapshot(&mut updates).await?;
    info!(
        home = ?snapshot.group(&GroupKey::Home),
        directs = ?snapshot.group(&GroupKey::Directs),
        "session finished"
    );
    Ok(snapshot)
}

/// Two spaces that list each other, a DM and a room outside every space.
fn seed_account(user_id: &str) -> Arc<InMemoryClient> {
    let client = InMemoryClient::new(user_id).with_scrollback_latency(Duration::from_millis(40));
    let ts = now_ms();

    client.insert_room(
        Room::space(ENGINEERING, [BACKEND, FRONTEND, DESIGN]).with_name("Engineering"),
    );
    client.insert_room(Room::space(DESIGN, [ENGINEERING, FIGMA]).with_name("Design"));
    client.insert_room(
        Room::joined(BACKEND)
            .with_name("backend")
            .with_timeline(vec![
                TimelineEvent::message(BACKEND, "$be-1", BOB, "migration landed", ts),
                TimelineEvent::edit(BACKEND, "$be-2", BOB, "$be-1", "migration landed on staging", ts + 1),
            ])
            .with_pagination_token("be-tok-1")
            .with_counts(2, 1),
    );
    client.insert_room(
        Room::joined(FRONTEND)
            .with_name("frontend")
            .with_timeline(vec![TimelineEvent::message(FRONTEND, "$fe-1", CAROL, "hello", ts)])
            .with_read_marker("$fe-1"),
    );
    client.insert_room(Room::joined(FIGMA).with_name("figma"));
    client.insert_room(
        Room::joined(LOBBY)
            .with_name("lobby")
            .with_timeline(vec![TimelineEvent::message(LOBBY, "$lobby-1", CAROL, "welcome", ts)])
            .with_read_marker("$lobby-1"),
    );
    client.insert_room(
        Room::joined(DM_BOB).with_timeline(vec![TimelineEvent::message(DM_BOB, "$dm-1", BOB, "hey", ts)]),
    );
    client.set_direct_rooms([DM_BOB]);
    client.queue_history(
        BACKEND,
        HistoryPage {
            events: vec![
                TimelineEvent::message(BACKEND, "$be-0", CAROL, "starting the migration", ts - 60_000),
            ],
            next_token: None,
        },
    );

    client.into_shared()
}

async fn send(handle: &EngineRuntimeHandle, command: EngineCommand) -> Result<(), String> {
    debug!(?command, "sending command");
    handle.send(command).await.map_err(|err| err.to_string())
}

async fn wait_for_snapshot(updates: &mut UpdateStream) -> Result<UnreadSnapshot, String> {
    match wait_for(updates, |update| {
        matches!(update, EngineUpdate::SummariesUpdated(_))
    })
    .await?
    {
        EngineUpdate::SummariesUpdated(snapshot) => Ok(snapshot),
        other => Err(format!("unexpected update: {other:?}")),
    }
}

/// Wait for the first update accepted by `wanted`, logging the rest.
async fn wait_for<F>(updates: &mut UpdateStream, wanted: F) -> Result<EngineUpdate, String>
where
    F: Fn(&EngineUpdate) -> bool,
{
    loop {
        let update = timeout(UPDATE_TIMEOUT, updates.recv())
            .await
            .map_err(|_| "timed out waiting for engine update".to_owned())?
            .map_err(|err| format!("update stream failed: {err}"))?;
        if wanted(&update) {
            return Ok(update);
        }
        match &update {
            EngineUpdate::Error { code, message, .. } => {
                warn!(%code, %message, "engine reported an error")
            }
            other => debug!(update = ?other, "skipping update"),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
