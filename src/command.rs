//! Run-control commands and their authorisation table.
//!
//! Command ids 102..=111 are wire-compatible. The bus's own generic
//! notifications (OK, ERROR, DBGET, DBSET) live below 102, see
//! [`crate::message::Notification`].

use crate::state::RcState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An application command.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RcCommand {
    /// Attach a named run configuration (102).
    Load,
    /// Begin a run (103).
    Start,
    /// End the current run (104).
    Stop,
    /// Continue a paused run as a new sub-run (105).
    Resume,
    /// Suspend data taking (106).
    Pause,
    /// Abort and reload the attached configuration (107).
    Recover,
    /// Drop back to NOTREADY from anywhere (108).
    Abort,
    /// Reload the trigger/front-end configuration (109).
    TrigFt,
    /// Ask for the current state; changes nothing (110).
    StateCheck,
    /// Detach the configuration and reinitialise (111).
    Boot,
}

/// Result of [`is_available`].
///
/// `Suggested` and `Enabled` carry the same authorisation; `Suggested` only
/// tells an operator display that this is the expected next step.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Availability {
    /// Allowed and the expected next step.
    Suggested,
    /// Allowed.
    Enabled,
    /// Rejected in this state.
    Disabled,
}

impl Availability {
    /// `Suggested` or `Enabled`.
    pub const fn permits(self) -> bool {
        !matches!(self, Availability::Disabled)
    }
}

/// Every command, in id order.
pub const ALL_COMMANDS: [RcCommand; 10] = [
    RcCommand::Load,
    RcCommand::Start,
    RcCommand::Stop,
    RcCommand::Resume,
    RcCommand::Pause,
    RcCommand::Recover,
    RcCommand::Abort,
    RcCommand::TrigFt,
    RcCommand::StateCheck,
    RcCommand::Boot,
];

impl RcCommand {
    /// Wire id, 102..=111.
    pub const fn id(self) -> u16 {
        match self {
            RcCommand::Load => 102,
            RcCommand::Start => 103,
            RcCommand::Stop => 104,
            RcCommand::Resume => 105,
            RcCommand::Pause => 106,
            RcCommand::Recover => 107,
            RcCommand::Abort => 108,
            RcCommand::TrigFt => 109,
            RcCommand::StateCheck => 110,
            RcCommand::Boot => 111,
        }
    }

    /// Upper-case wire label.
    pub const fn label(self) -> &'static str {
        match self {
            RcCommand::Load => "LOAD",
            RcCommand::Start => "START",
            RcCommand::Stop => "STOP",
            RcCommand::Resume => "RESUME",
            RcCommand::Pause => "PAUSE",
            RcCommand::Recover => "RECOVER",
            RcCommand::Abort => "ABORT",
            RcCommand::TrigFt => "TRIGFT",
            RcCommand::StateCheck => "STATECHECK",
            RcCommand::Boot => "BOOT",
        }
    }

    /// Look up a command by wire id.
    pub fn from_id(id: u16) -> Option<RcCommand> {
        ALL_COMMANDS.iter().copied().find(|c| c.id() == id)
    }

    /// Exact label lookup after trimming. Console input is upper-cased by the caller.
    pub fn from_label(label: &str) -> Option<RcCommand> {
        let label = label.trim();
        ALL_COMMANDS.iter().copied().find(|c| c.label() == label)
    }

    /// Intermediate state entered when a long-running command is accepted.
    ///
    /// `None` for the synchronous commands (RESUME, PAUSE) and for STATECHECK.
    pub const fn transitional_target(self) -> Option<RcState> {
        match self {
            RcCommand::Boot => Some(RcState::Booting),
            RcCommand::Load | RcCommand::TrigFt => Some(RcState::Loading),
            RcCommand::Start => Some(RcState::Starting),
            RcCommand::Stop => Some(RcState::Stopping),
            RcCommand::Recover => Some(RcState::Recovering),
            RcCommand::Abort => Some(RcState::Aborting),
            RcCommand::Resume | RcCommand::Pause | RcCommand::StateCheck => None,
        }
    }

    /// Stable state reached when the command's hook succeeds.
    ///
    /// STATECHECK is a query and has no target.
    pub const fn stable_target(self) -> Option<RcState> {
        match self {
            RcCommand::Boot => Some(RcState::NotReady),
            RcCommand::Load | RcCommand::TrigFt => Some(RcState::Ready),
            RcCommand::Start => Some(RcState::Running),
            RcCommand::Stop => Some(RcState::Ready),
            RcCommand::Resume => Some(RcState::Running),
            RcCommand::Pause => Some(RcState::Paused),
            RcCommand::Recover => Some(RcState::Ready),
            RcCommand::Abort => Some(RcState::NotReady),
            RcCommand::StateCheck => None,
        }
    }

    /// True for commands that pass through a transitional state.
    pub const fn is_long_running(self) -> bool {
        self.transitional_target().is_some()
    }

    /// Commands authorised in every state, the protocol's escape hatches included.
    pub const fn is_unconditional(self) -> bool {
        matches!(
            self,
            RcCommand::Recover | RcCommand::Abort | RcCommand::StateCheck
        )
    }
}

impl fmt::Display for RcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Authorisation for `command` in `state`. Pure function of the two ids.
pub const fn is_available(command: RcCommand, state: RcState) -> Availability {
    use Availability::*;
    use RcCommand::*;

    if command.is_unconditional() {
        return Enabled;
    }
    if matches!(state, RcState::Error) {
        return Enabled;
    }
    match (command, state) {
        (Boot | Load, RcState::NotReady) => Suggested,
        (Boot | Load | TrigFt, RcState::Ready) => Enabled,
        (Start, RcState::Ready) => Suggested,
        (Stop, RcState::Running | RcState::Paused) => Suggested,
        (Pause, RcState::Running) => Enabled,
        (Resume, RcState::Paused) => Enabled,
        _ => Disabled,
    }
}
