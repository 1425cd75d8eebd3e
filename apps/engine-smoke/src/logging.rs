//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

/// `debug` for the script and the runtime actor, which shows command routing
/// and recompute scheduling. The core stays at `info`, hiding its per-event
/// `trace` output.
const DEFAULT_FILTER: &str = "info,engine_smoke=debug,engine_runtime=debug,engine_core=info";

/// Variables consulted after `RUST_LOG`, most specific first.
const FILTER_VARS: [&str; 2] = ["CHAT_ENGINE_SMOKE_LOG", "CHAT_ENGINE_LOG"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins, then `CHAT_ENGINE_SMOKE_LOG`, then the engine-wide
/// `CHAT_ENGINE_LOG`; blank or unparsable values fall through to the next one
/// and finally to [`DEFAULT_FILTER`].
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    FILTER_VARS
        .iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
