//! Helper State Machine
//!
//! The helper moves through a fixed sequence of states; any of them can end
//! in `Abort`. The outcome records the path taken and maps the first fatal
//! condition to the process exit code.

use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

use super::artifact::ArtifactError;
use super::authenticity::AuthError;
use super::handoff::HandoffError;
use super::swap::SwapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperState {
    Discover,
    AwaitParentExit,
    Stage,
    Swap,
    Relaunch,
    Terminate,
    Abort,
}

impl HelperState {
    /// The state after a successful step. Terminal states have none.
    pub fn next(self) -> Option<Self> {
        match self {
            HelperState::Discover => Some(HelperState::AwaitParentExit),
            HelperState::AwaitParentExit => Some(HelperState::Stage),
            HelperState::Stage => Some(HelperState::Swap),
            HelperState::Swap => Some(HelperState::Relaunch),
            HelperState::Relaunch => Some(HelperState::Terminate),
            HelperState::Terminate | HelperState::Abort => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for HelperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HelperState::Discover => "discover",
            HelperState::AwaitParentExit => "await_parent_exit",
            HelperState::Stage => "stage",
            HelperState::Swap => "swap",
            HelperState::Relaunch => "relaunch",
            HelperState::Terminate => "terminate",
            HelperState::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Fatal helper conditions.
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("Handoff descriptor: {0}")]
    Descriptor(#[from] HandoffError),
    #[error("Staging failed: {0}")]
    Staging(#[from] ArtifactError),
    #[error("Verification failed: {0}")]
    Verification(#[from] AuthError),
    #[error("Package artifacts are refused by policy")]
    PackageRejected,
    #[error("Swap failed: {0}")]
    Swap(#[from] SwapError),
    #[error("Relaunch failed: {0}")]
    Relaunch(#[source] io::Error),
}

impl HelperError {
    pub fn exit_code(&self) -> u8 {
        match self {
            HelperError::Descriptor(_) => 2,
            HelperError::Staging(_) => 3,
            HelperError::Verification(_) | HelperError::PackageRejected => 4,
            HelperError::Swap(_) => 5,
            HelperError::Relaunch(_) => 1,
        }
    }
}

/// How a helper run ended.
#[derive(Debug)]
pub struct HelperOutcome {
    pub visited: Vec<HelperState>,
    pub error: Option<HelperError>,
}

impl HelperOutcome {
    pub fn final_state(&self) -> HelperState {
        self.visited.last().copied().unwrap_or(HelperState::Discover)
    }

    pub fn exit_code(&self) -> u8 {
        self.error.as_ref().map(HelperError::exit_code).unwrap_or(0)
    }

    pub fn reached(&self, state: HelperState) -> bool {
        self.visited.contains(&state)
    }
}

/// Walks the states and records each transition.
#[derive(Debug)]
pub struct StateTracker {
    current: HelperState,
    visited: Vec<HelperState>,
}

impl StateTracker {
    pub fn new() -> Self {
        tracing::info!(state = %HelperState::Discover, "helper state");
        Self {
            current: HelperState::Discover,
            visited: vec![HelperState::Discover],
        }
    }

    pub fn current(&self) -> HelperState {
        self.current
    }

    /// Move to the successor state.
    pub fn advance(&mut self) -> HelperState {
        if let Some(next) = self.current.next() {
            self.enter(next);
        }
        self.current
    }

    /// Jump forward past states that do not apply to this run.
    pub fn skip_to(&mut self, state: HelperState) {
        tracing::debug!(from = %self.current, to = %state, "skipping states");
        self.enter(state);
    }

    pub fn finish(mut self, error: Option<HelperError>) -> HelperOutcome {
        match &error {
            Some(e) => {
                tracing::error!(state = %self.current, error = %e, exit_code = e.exit_code(), "helper aborting");
                self.enter(HelperState::Abort);
            }
            None if self.current != HelperState::Terminate => self.enter(HelperState::Terminate),
            None => {}
        }
        HelperOutcome {
            visited: self.visited,
            error,
        }
    }

    fn enter(&mut self, state: HelperState) {
        tracing::info!(from = %self.current, to = %state, "helper state");
        self.current = state;
        self.visited.push(state);
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
