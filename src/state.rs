//! Run-control lifecycle states.
//!
//! The fourteen states and their ids are part of the wire protocol and must
//! never be renumbered. `Unknown` (id 0) marks input that could not be
//! recognised; it is a value, not an error.
//!
//! Classification:
//! - Stable: NOTREADY, READY, RUNNING, PAUSED
//! - Transitional: LOADING, STARTING, STOPPING, CONFIGURING
//! - Error: ERROR, FATAL
//! - Recovering: BOOTING, RECOVERING, ABORTING
//!
//! OFF and UNKNOWN belong to no class.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire id reserved for the "unrecognised" sentinel.
pub const UNKNOWN_ID: i32 = 0;

/// A run-control state.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RcState {
    /// Process not running (1).
    #[default]
    Off,
    /// Initialised, no run configuration attached (2).
    NotReady,
    /// Configuration loaded, ready to start (3).
    Ready,
    /// Taking data (4).
    Running,
    /// Run paused, data taking suspended (5).
    Paused,
    /// LOAD in progress (6).
    Loading,
    /// START in progress (7).
    Starting,
    /// STOP in progress (8).
    Stopping,
    /// Initialisation in progress (9).
    Configuring,
    /// A hook failed; recovery required (10).
    Error,
    /// Unrecoverable failure (11).
    Fatal,
    /// BOOT in progress (12).
    Booting,
    /// RECOVER in progress (13).
    Recovering,
    /// ABORT in progress (14).
    Aborting,
    /// Unrecognised id or label (0).
    Unknown,
}

/// State classes. A state belongs to at most one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StateClass {
    /// Resting states a node can stay in indefinitely.
    Stable,
    /// Held while a LOAD, START, STOP or initialisation runs.
    Transitional,
    /// ERROR and FATAL.
    Error,
    /// Held while BOOT, RECOVER or ABORT runs.
    Recovering,
}

/// Every defined state, in id order. `Unknown` is not part of the table.
pub const ALL_STATES: [RcState; 14] = [
    RcState::Off,
    RcState::NotReady,
    RcState::Ready,
    RcState::Running,
    RcState::Paused,
    RcState::Loading,
    RcState::Starting,
    RcState::Stopping,
    RcState::Configuring,
    RcState::Error,
    RcState::Fatal,
    RcState::Booting,
    RcState::Recovering,
    RcState::Aborting,
];

impl RcState {
    /// Wire id; `Unknown` maps to [`UNKNOWN_ID`].
    pub const fn id(self) -> i32 {
        match self {
            RcState::Off => 1,
            RcState::NotReady => 2,
            RcState::Ready => 3,
            RcState::Running => 4,
            RcState::Paused => 5,
            RcState::Loading => 6,
            RcState::Starting => 7,
            RcState::Stopping => 8,
            RcState::Configuring => 9,
            RcState::Error => 10,
            RcState::Fatal => 11,
            RcState::Booting => 12,
            RcState::Recovering => 13,
            RcState::Aborting => 14,
            RcState::Unknown => UNKNOWN_ID,
        }
    }

    /// Upper-case wire label.
    pub const fn label(self) -> &'static str {
        match self {
            RcState::Off => "OFF",
            RcState::NotReady => "NOTREADY",
            RcState::Ready => "READY",
            RcState::Running => "RUNNING",
            RcState::Paused => "PAUSED",
            RcState::Loading => "LOADING",
            RcState::Starting => "STARTING",
            RcState::Stopping => "STOPPING",
            RcState::Configuring => "CONFIGURING",
            RcState::Error => "ERROR",
            RcState::Fatal => "FATAL",
            RcState::Booting => "BOOTING",
            RcState::Recovering => "RECOVERING",
            RcState::Aborting => "ABORTING",
            RcState::Unknown => "UNKNOWN",
        }
    }

    /// Class of the state, `None` for OFF and UNKNOWN.
    pub const fn class(self) -> Option<StateClass> {
        match self {
            RcState::NotReady | RcState::Ready | RcState::Running | RcState::Paused => {
                Some(StateClass::Stable)
            }
            RcState::Loading | RcState::Starting | RcState::Stopping | RcState::Configuring => {
                Some(StateClass::Transitional)
            }
            RcState::Error | RcState::Fatal => Some(StateClass::Error),
            RcState::Booting | RcState::Recovering | RcState::Aborting => {
                Some(StateClass::Recovering)
            }
            RcState::Off | RcState::Unknown => None,
        }
    }

    /// NOTREADY, READY, RUNNING or PAUSED.
    pub const fn is_stable(self) -> bool {
        matches!(self.class(), Some(StateClass::Stable))
    }

    /// LOADING, STARTING, STOPPING or CONFIGURING.
    pub const fn is_transitional(self) -> bool {
        matches!(self.class(), Some(StateClass::Transitional))
    }

    /// ERROR or FATAL.
    pub const fn is_error(self) -> bool {
        matches!(self.class(), Some(StateClass::Error))
    }

    /// BOOTING, RECOVERING or ABORTING.
    pub const fn is_recovering(self) -> bool {
        matches!(self.class(), Some(StateClass::Recovering))
    }

    /// State a transitional or recovering state settles into on success.
    pub const fn next(self) -> RcState {
        match self {
            RcState::Loading => RcState::Ready,
            RcState::Starting => RcState::Running,
            RcState::Stopping => RcState::Ready,
            RcState::Configuring => RcState::NotReady,
            RcState::Booting => RcState::NotReady,
            RcState::Recovering => RcState::Ready,
            RcState::Aborting => RcState::NotReady,
            _ => RcState::Unknown,
        }
    }

    /// Look up a defined state by wire id.
    pub fn from_id(id: i32) -> Option<RcState> {
        ALL_STATES.iter().copied().find(|s| s.id() == id)
    }

    /// Look up a defined state by label. Matching is exact after trimming.
    pub fn from_label(label: &str) -> Option<RcState> {
        let label = label.trim();
        ALL_STATES.iter().copied().find(|s| s.label() == label)
    }

    /// Like [`RcState::from_id`] but unrecognised ids become `Unknown`.
    pub fn parse_id(id: i32) -> RcState {
        Self::from_id(id).unwrap_or(RcState::Unknown)
    }

    /// Like [`RcState::from_label`] but unrecognised labels become `Unknown`.
    pub fn parse_label(label: &str) -> RcState {
        Self::from_label(label).unwrap_or(RcState::Unknown)
    }
}

impl fmt::Display for RcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Wire label for an id; `"UNKNOWN"` for anything outside the table.
pub fn id_to_label(id: i32) -> &'static str {
    RcState::parse_id(id).label()
}

/// Wire id for a label; [`UNKNOWN_ID`] for anything outside the table.
pub fn label_to_id(label: &str) -> i32 {
    RcState::parse_label(label).id()
}
