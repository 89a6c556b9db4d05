//! Pure transition engine.
//!
//! A command is applied in two halves so the intermediate state can be
//! observed and broadcast:
//!
//! ```text
//! begin(current, cmd) -> Step ── hook runs ──> finish(step, outcome) -> state
//! ```
//!
//! No I/O happens here; [`crate::node::NodeController`] drives the hooks.

use crate::command::{is_available, Availability, RcCommand};
use crate::error::{AppResult, DaqError};
use crate::state::RcState;

/// An accepted command waiting for its hook outcome.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Step {
    /// The accepted command.
    pub command: RcCommand,
    /// State the node was in when the command was accepted.
    pub origin: RcState,
    /// Intermediate state held while the hook runs, if any.
    pub transitional: Option<RcState>,
    /// Stable state reached on success.
    pub target: RcState,
    /// How the state table rated the command in `origin`.
    pub availability: Availability,
}

impl Step {
    /// State to publish while the hook is in flight.
    pub fn in_flight(&self) -> RcState {
        self.transitional.unwrap_or(self.origin)
    }
}

/// How a lifecycle hook ended.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The hook finished the work.
    Success,
    /// The hook was cancelled before taking effect; the node keeps its origin state.
    Cancelled,
    /// The hook failed with the given text.
    Failed(String),
}

/// Authorise `command` in `current` and compute the states it passes through.
///
/// STATECHECK is authorised everywhere but changes nothing, so its step
/// targets the current state.
pub fn begin(current: RcState, command: RcCommand) -> AppResult<Step> {
    let availability = is_available(command, current);
    if !availability.permits() {
        return Err(DaqError::StateRejection {
            command,
            state: current,
        });
    }

    Ok(Step {
        command,
        origin: current,
        transitional: command.transitional_target(),
        target: command.stable_target().unwrap_or(current),
        availability,
    })
}

/// Settle a step according to the hook outcome.
pub fn finish(step: &Step, outcome: &Outcome) -> RcState {
    match outcome {
        Outcome::Success => step.target,
        Outcome::Cancelled => step.origin,
        Outcome::Failed(_) => RcState::Error,
    }
}
