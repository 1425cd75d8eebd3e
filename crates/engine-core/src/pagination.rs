use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const MAX_PAGINATE_LIMIT: u16 = 100;

/// Backward pagination state of one room timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaginationState {
    /// Older history is available from the stored token.
    Ready { token: String },
    /// A backfill request from `token` is in flight.
    Loading { token: String },
    /// The server reported no further history.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct PaginationStateMachine {
    state: PaginationState,
}

impl PaginationStateMachine {
    /// Start from the room's current pagination token.
    pub fn new(token: Option<String>) -> Self {
        Self {
            state: settled(token),
        }
    }

    pub fn state(&self) -> &PaginationState {
        &self.state
    }

    /// Mirrors "pagination token is present", including while loading.
    pub fn can_load(&self) -> bool {
        !matches!(self.state, PaginationState::Exhausted)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, PaginationState::Loading { .. })
    }

    /// Enter `Loading`, returning the token the request starts from.
    pub fn begin(&mut self) -> Result<String, EngineError> {
        let PaginationState::Ready { token } = &self.state else {
            return Err(EngineError::invalid_state(&self.state, "begin_pagination"));
        };
        let token = token.clone();
        self.state = PaginationState::Loading {
            token: token.clone(),
        };
        Ok(token)
    }

    /// Settle a completed request with the token the server returned.
    pub fn finish(&mut self, next_token: Option<String>) -> Result<&PaginationState, EngineError> {
        if !self.is_loading() {
            return Err(EngineError::invalid_state(&self.state, "finish_pagination"));
        }
        self.state = settled(next_token);
        Ok(&self.state)
    }

    /// Return to `Ready` after a failed request so the caller may retry.
    pub fn fail(&mut self) -> Result<(), EngineError> {
        let PaginationState::Loading { token } = &self.state else {
            return Err(EngineError::invalid_state(&self.state, "fail_pagination"));
        };
        self.state = PaginationState::Ready {
            token: token.clone(),
        };
        Ok(())
    }
}

/// Clamp a requested pagination limit against safety and configured caps.
///
/// The result is always in `1..=100`.
pub fn bounded_paginate_limit(requested: u16, cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = cap.max(1);
    safe_requested.min(safe_cap).min(MAX_PAGINATE_LIMIT)
}

fn settled(token: Option<String>) -> PaginationState {
    match token {
        Some(token) => PaginationState::Ready { token },
        None => PaginationState::Exhausted,
    }
}
