//! Error types for the run-control protocol.
//!
//! `DaqError` is the single error type that crosses module boundaries. It is
//! built with `thiserror` and groups failures the way the protocol handles them:
//!
//! - **`StateRejection`** and **`MissingAnnotation`**: local checks that fail
//!   before anything is sent or any hook runs. No state changes.
//! - **`HookFailure`**: a lifecycle hook returned an error. The node is forced
//!   into ERROR and the text is broadcast; the error never travels further.
//! - **`Transport`**: the bus could not deliver a message. Callers treat the
//!   message as not delivered and may retry; local state is untouched.
//! - **`RunNumbersExhausted`**: START or RESUME would overflow the run or
//!   sub-run counter. Rejected before the hook runs.
//! - **`ConfigNotFound`**: a named run configuration is absent from the store.
//!
//! The remaining variants cover console usage, decoding and the ambient
//! configuration/I/O layers.

use crate::command::RcCommand;
use crate::config::ConfigError;
use crate::state::RcState;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by run-control nodes, the bus, the store and the console.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The command is disabled in the node's current state.
    #[error("{command} is not available in state {state}")]
    StateRejection {
        /// Command that was refused.
        command: RcCommand,
        /// State the node was in.
        state: RcState,
    },

    /// START without operator names and a comment.
    #[error("operator names and comment must be set before START")]
    MissingAnnotation,

    /// A lifecycle hook returned an error.
    #[error("hook failed: {0}")]
    HookFailure(String),

    /// Run or sub-run numbering cannot advance any further.
    #[error("run numbers exhausted: {0}")]
    RunNumbersExhausted(String),

    /// A message could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),

    /// No run configuration with this name exists for the node.
    #[error("run configuration '{name}' not found for node '{node}'")]
    ConfigNotFound {
        /// Configuration name.
        name: String,
        /// Node the configuration belongs to.
        node: String,
    },

    /// Saving without overwrite hit an existing configuration.
    #[error("run configuration '{name}' already exists for node '{node}'")]
    ConfigExists {
        /// Configuration name.
        name: String,
        /// Node the configuration belongs to.
        node: String,
    },

    /// The status record has no free node slot.
    #[error("status record is full ({max} nodes)")]
    TooManyNodes {
        /// Slot count of the record.
        max: usize,
    },

    /// The node has no slot in the status record.
    #[error("node '{0}' is not attached")]
    UnknownNode(String),

    /// Console input that names no command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Malformed console input or an invalid name.
    #[error("usage: {0}")]
    Usage(String),

    /// Bytes or payloads that could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Application configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaqError {
    /// True for failures detected locally, before any message leaves the node.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            DaqError::StateRejection { .. }
                | DaqError::MissingAnnotation
                | DaqError::Usage(_)
                | DaqError::ConfigNotFound { .. }
                | DaqError::RunNumbersExhausted(_)
        )
    }
}
