//! Run-control configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/runcontrol.toml` by default)
//! 2. environment variables prefixed with `RUNCONTROL_`
//!
//! Nested keys are separated by a double underscore so that field names keep
//! their own underscores:
//!
//! ```text
//! RUNCONTROL_APPLICATION__LOG_LEVEL=debug
//! RUNCONTROL_NODE__NAME=cpr001
//! RUNCONTROL_DISPATCHER__POLL_TIMEOUT_MS=50
//! ```

use crate::status::MAX_NODES;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/runcontrol.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The values parsed but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RcConfig {
    /// Name and logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// The node this process runs.
    #[serde(default)]
    pub node: NodeConfig,
    /// Receive loop timing and mailbox size.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Run configuration storage.
    #[serde(default)]
    pub store: StoreConfig,
    /// Operator console.
    #[serde(default)]
    pub console: ConsoleConfig,
}

/// Application name and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in logs.
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "runcontrol".into(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Node role in the run-control hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Supervises the configured subordinates.
    #[default]
    Master,
    /// Standalone simulated detector node.
    Simulated,
}

/// The node run by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bus name.
    pub name: String,
    /// Master or simulated node.
    #[serde(default)]
    pub role: NodeRole,
    /// Nodes a master forwards commands to.
    #[serde(default)]
    pub subordinates: Vec<String>,
    /// Nodes that receive every state notification.
    #[serde(default)]
    pub observers: Vec<String>,
    /// Configuration loaded when LOAD names none.
    #[serde(default)]
    pub default_config: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "master".into(),
            role: NodeRole::Master,
            subordinates: Vec::new(),
            observers: Vec::new(),
            default_config: None,
        }
    }
}

/// Receive loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Bounded wait for the next message.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Minimum time between monitor checks.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Messages each node's mailbox holds before sends fail.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            monitor_interval_ms: default_monitor_interval(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl DispatcherConfig {
    /// `poll_timeout_ms` as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// `monitor_interval_ms` as a duration.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Where run configurations live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Lost when the process exits.
    #[default]
    Memory,
    /// JSON files under `store.root`.
    File,
}

/// Run configuration storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which store to open.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Root directory of the file backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Operator console settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Bus name of the operator console.
    #[serde(default = "default_console_name")]
    pub name: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            name: default_console_name(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_poll_timeout() -> u64 {
    200
}

fn default_monitor_interval() -> u64 {
    1000
}

fn default_mailbox_capacity() -> usize {
    100
}

fn default_console_name() -> String {
    "console".into()
}

impl RcConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(RcConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUNCONTROL_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.node.name.trim().is_empty() {
            return Err(ConfigError::ValidationError("node.name must not be empty".into()));
        }

        if self.node.subordinates.len() > MAX_NODES {
            return Err(ConfigError::ValidationError(format!(
                "{} subordinates configured, at most {MAX_NODES} fit the status record",
                self.node.subordinates.len()
            )));
        }

        let mut names = HashSet::new();
        names.insert(self.node.name.as_str());
        for sub in &self.node.subordinates {
            if !names.insert(sub.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate node name: '{sub}'"
                )));
            }
        }

        if self.node.role == NodeRole::Simulated && !self.node.subordinates.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Simulated node '{}' cannot have subordinates",
                self.node.name
            )));
        }

        if self.dispatcher.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.poll_timeout_ms must be positive".into(),
            ));
        }
        if self.dispatcher.mailbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.mailbox_capacity must be positive".into(),
            ));
        }

        if self.store.backend == StoreBackend::File && self.store.root.is_none() {
            return Err(ConfigError::ValidationError(
                "store.root is required for the file backend".into(),
            ));
        }

        Ok(())
    }
}
