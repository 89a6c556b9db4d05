//! Core library for the daq_runcontrol application.
//!
//! This library contains the run-control state machine shared by every node
//! of the data-acquisition system: the state and command tables, the
//! per-node controller and dispatcher, the aggregated status record and the
//! operator console client. It is used by the `daq_runcontrol` binary and by
//! detector-subsystem nodes that implement [`node::RcCallback`].

pub mod bus;
pub mod command;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod message;
pub mod node;
pub mod run;
pub mod session;
pub mod state;
pub mod status;
pub mod store;
pub mod transition;

pub use command::{is_available, Availability, RcCommand};
pub use error::{AppResult, DaqError};
pub use state::{RcState, StateClass};
