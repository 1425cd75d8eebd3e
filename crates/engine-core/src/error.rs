use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pagination::PaginationState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineErrorCategory {
    /// Invalid input, unknown room, or other configuration issue.
    Config,
    /// Transient network or transport failure reported by the protocol client.
    Network,
    /// Local persistence failure; the next write may succeed.
    Storage,
    /// Persisted data could not be decoded.
    Serialization,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable engine error payload emitted across the command/update boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: EngineErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(
        category: EngineErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error for the pagination machine.
    pub fn invalid_state(current: &PaginationState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            EngineErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while pagination is in state {current:?}"),
        )
    }

    /// Build a `room_not_found` error for an id the protocol client does not know.
    pub fn room_not_found(room_id: &str) -> Self {
        Self::new(
            EngineErrorCategory::Config,
            "room_not_found",
            format!("room not found: {room_id}"),
        )
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            EngineErrorCategory::Network | EngineErrorCategory::Storage
        )
    }
}
