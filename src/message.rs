//! Wire messages exchanged on the bus and their decoding.
//!
//! A message carries a numeric command id, a small integer parameter array and
//! a free-text field. Ids below 102 are the bus's generic notifications; ids
//! 102..=111 are run-control commands.

use crate::command::RcCommand;
use crate::run::OperatorAnnotation;
use crate::state::RcState;
use serde::{Deserialize, Serialize};

/// Generic bus notifications.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Notification {
    /// State report (1).
    Ok,
    /// Rejection or failure text (2).
    Error,
    /// Request for the attached configuration (3).
    DbGet,
    /// Configuration pushed to or returned by a node (4).
    DbSet,
}

impl Notification {
    /// Wire id.
    pub const fn id(self) -> u16 {
        match self {
            Notification::Ok => 1,
            Notification::Error => 2,
            Notification::DbGet => 3,
            Notification::DbSet => 4,
        }
    }

    /// Upper-case wire label.
    pub const fn label(self) -> &'static str {
        match self {
            Notification::Ok => "OK",
            Notification::Error => "ERROR",
            Notification::DbGet => "DBGET",
            Notification::DbSet => "DBSET",
        }
    }

    /// Look up a notification by wire id.
    pub fn from_id(id: u16) -> Option<Notification> {
        [
            Notification::Ok,
            Notification::Error,
            Notification::DbGet,
            Notification::DbSet,
        ]
        .into_iter()
        .find(|n| n.id() == id)
    }
}

/// A message as carried by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsmMessage {
    /// Sending node.
    pub from: String,
    /// Destination node.
    pub to: String,
    /// Command or notification id.
    pub id: u16,
    /// Integer parameters.
    #[serde(default)]
    pub pars: Vec<i32>,
    /// Free text: state label, configuration name, error text or JSON.
    #[serde(default)]
    pub data: String,
}

impl NsmMessage {
    /// Message with an id and no parameters.
    pub fn new(from: impl Into<String>, to: impl Into<String>, id: u16) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            id,
            pars: Vec::new(),
            data: String::new(),
        }
    }

    /// Run-control command without parameters.
    pub fn command(from: impl Into<String>, to: impl Into<String>, command: RcCommand) -> Self {
        Self::new(from, to, command.id())
    }

    /// State notification: `data` holds the state label, `pars[0]` its id.
    pub fn ok(from: impl Into<String>, to: impl Into<String>, state: RcState) -> Self {
        Self::new(from, to, Notification::Ok.id())
            .with_pars(vec![state.id()])
            .with_data(state.label())
    }

    /// Rejection text. Carries no state: the sender's state did not change.
    pub fn error(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(from, to, Notification::Error.id()).with_data(text)
    }

    /// Failure text from a node that moved to `state`; `pars[0]` holds the state id.
    pub fn failure(
        from: impl Into<String>,
        to: impl Into<String>,
        state: RcState,
        text: impl Into<String>,
    ) -> Self {
        Self::error(from, to, text).with_pars(vec![state.id()])
    }

    /// Replace the parameters.
    pub fn with_pars(mut self, pars: Vec<i32>) -> Self {
        self.pars = pars;
        self
    }

    /// Replace the text field.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// Parameters and text as a command payload.
    pub fn payload(&self) -> Payload {
        Payload {
            pars: self.pars.clone(),
            data: self.data.clone(),
        }
    }

    /// Classify the message. Never fails: unrecognised ids decode to [`Inbound::Unknown`].
    pub fn decode(&self) -> Inbound {
        if let Some(command) = RcCommand::from_id(self.id) {
            return Inbound::Command {
                command,
                payload: self.payload(),
            };
        }
        match Notification::from_id(self.id) {
            Some(Notification::Ok) => Inbound::Ok {
                state: RcState::parse_label(&self.data),
            },
            Some(Notification::Error) => Inbound::Error {
                text: self.data.clone(),
                state: self.pars.first().map(|id| RcState::parse_id(*id)),
            },
            Some(Notification::DbGet) => Inbound::DbGet {
                name: non_empty(&self.data),
            },
            Some(Notification::DbSet) => Inbound::DbSet {
                body: self.data.clone(),
            },
            None => Inbound::Unknown { id: self.id },
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Parameters attached to a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Integer parameters.
    pub pars: Vec<i32>,
    /// Text argument.
    pub data: String,
}

impl Payload {
    /// Payload holding only a text argument.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            pars: Vec::new(),
            data: text.into(),
        }
    }

    /// Parameter at `index`, if present.
    pub fn par(&self, index: usize) -> Option<i32> {
        self.pars.get(index).copied()
    }

    /// Free-text argument, `None` when blank.
    pub fn text_arg(&self) -> Option<String> {
        non_empty(&self.data)
    }

    /// Requested `(exp, run)` for START.
    pub fn run_request(&self) -> Option<(i32, i32)> {
        Some((self.par(0)?, self.par(1)?))
    }

    /// Operator annotation carried by START, if any.
    pub fn annotation(&self) -> Option<OperatorAnnotation> {
        serde_json::from_str(&self.data).ok()
    }

    /// Build the START payload.
    pub fn start(run: Option<(i32, i32)>, annotation: &OperatorAnnotation) -> Self {
        let pars = run.map(|(exp, run)| vec![exp, run]).unwrap_or_default();
        Self {
            pars,
            data: serde_json::to_string(annotation).unwrap_or_default(),
        }
    }
}

/// Decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A run-control command to execute.
    Command {
        /// The command.
        command: RcCommand,
        /// Its parameters.
        payload: Payload,
    },
    /// A peer reports its state.
    Ok {
        /// Reported state, `Unknown` if the label was not recognised.
        state: RcState,
    },
    /// A peer rejected a command or failed.
    Error {
        /// Error text.
        text: String,
        /// State the peer moved to; `None` for plain rejections.
        state: Option<RcState>,
    },
    /// Request for the attached configuration, optionally by name.
    DbGet {
        /// Configuration name, if given.
        name: Option<String>,
    },
    /// Configuration body.
    DbSet {
        /// JSON text.
        body: String,
    },
    /// Any other id.
    Unknown {
        /// The unrecognised id.
        id: u16,
    },
}
