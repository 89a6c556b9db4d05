//! Run configuration persistence.
//!
//! Run configurations are named JSON trees owned by one node. The relational
//! database behind the real system is a collaborator; nodes only see the
//! [`ConfigStore`] trait. Two implementations are provided: an in-memory store
//! for tests and the demo session, and a directory of JSON files laid out as
//! `<root>/<node>/<name>.json`.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A named, persisted configuration tree applied at LOAD time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Configuration name, unique per node.
    pub name: String,
    /// Owning node.
    pub node: String,
    /// Incremented every time the configuration is overwritten.
    #[serde(default)]
    pub revision: i32,
    /// Configuration tree; subordinate sections are keyed by node name.
    #[serde(default)]
    pub tree: serde_json::Value,
}

impl RunConfig {
    /// First revision of a configuration.
    pub fn new(name: impl Into<String>, node: impl Into<String>, tree: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            revision: 1,
            tree,
        }
    }

    /// Sub-configuration for a subordinate node, if the tree names it.
    pub fn sub(&self, node: &str) -> Option<&serde_json::Value> {
        self.tree.get(node)
    }

    /// Identifier published in the status record.
    pub fn config_id(&self) -> i32 {
        self.revision
    }
}

/// Persistence interface for run configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch `name` for `node`. Absent configurations yield [`DaqError::ConfigNotFound`].
    async fn load_config(&self, name: &str, node: &str) -> AppResult<RunConfig>;

    /// Persist `config` and return the stored copy.
    ///
    /// Without `overwrite` an existing configuration is an error
    /// ([`DaqError::ConfigExists`]). With it the revision is bumped.
    async fn save_config(&self, config: &RunConfig, overwrite: bool) -> AppResult<RunConfig>;

    /// Names stored for `node`, sorted.
    async fn list_configs(&self, node: &str) -> AppResult<Vec<String>>;
}

fn not_found(name: &str, node: &str) -> DaqError {
    DaqError::ConfigNotFound {
        name: name.to_string(),
        node: node.to_string(),
    }
}

fn stored_revision(previous: Option<&RunConfig>, config: &RunConfig, overwrite: bool) -> AppResult<i32> {
    match previous {
        Some(_) if !overwrite => Err(DaqError::ConfigExists {
            name: config.name.clone(),
            node: config.node.clone(),
        }),
        Some(previous) => Ok(previous.revision.max(config.revision) + 1),
        None => Ok(config.revision.max(1)),
    }
}

/// Configurations held in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<HashMap<(String, String), RunConfig>>,
}

impl MemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding, used when wiring up nodes.
    pub fn with(self, config: RunConfig) -> Self {
        self.configs
            .write()
            .insert((config.node.clone(), config.name.clone()), config);
        self
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_config(&self, name: &str, node: &str) -> AppResult<RunConfig> {
        self.configs
            .read()
            .get(&(node.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(name, node))
    }

    async fn save_config(&self, config: &RunConfig, overwrite: bool) -> AppResult<RunConfig> {
        let mut configs = self.configs.write();
        let key = (config.node.clone(), config.name.clone());
        let revision = stored_revision(configs.get(&key), config, overwrite)?;
        let stored = RunConfig {
            revision,
            ..config.clone()
        };
        configs.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list_configs(&self, node: &str) -> AppResult<Vec<String>> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .keys()
            .filter(|(owner, _)| owner == node)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Names become path components, so anything that could leave the store root is refused.
fn checked_part(part: &str) -> AppResult<&str> {
    if part.is_empty() || part.contains(['/', '\\']) || part.starts_with('.') {
        return Err(DaqError::Usage(format!(
            "'{part}' is not a valid configuration or node name"
        )));
    }
    Ok(part)
}

/// Configurations stored as pretty-printed JSON files.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    /// Store rooted at `root`; directories are created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one sub-directory per node.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_dir(&self, node: &str) -> AppResult<PathBuf> {
        Ok(self.root.join(checked_part(node)?))
    }

    fn path_for(&self, name: &str, node: &str) -> AppResult<PathBuf> {
        let name = checked_part(name)?;
        Ok(self.node_dir(node)?.join(format!("{name}.json")))
    }

    async fn read(&self, path: &Path) -> AppResult<Option<RunConfig>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_config(&self, name: &str, node: &str) -> AppResult<RunConfig> {
        let path = self
            .path_for(name, node)
            .map_err(|_| not_found(name, node))?;
        self.read(&path).await?.ok_or_else(|| not_found(name, node))
    }

    async fn save_config(&self, config: &RunConfig, overwrite: bool) -> AppResult<RunConfig> {
        let path = self.path_for(&config.name, &config.node)?;
        let previous = self.read(&path).await?;
        let revision = stored_revision(previous.as_ref(), config, overwrite)?;
        let stored = RunConfig {
            revision,
            ..config.clone()
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(&stored)?).await?;
        tracing::info!(
            config = %stored.name,
            node = %stored.node,
            revision = stored.revision,
            path = %path.display(),
            "Run configuration saved"
        );
        Ok(stored)
    }

    async fn list_configs(&self, node: &str) -> AppResult<Vec<String>> {
        let dir = self.node_dir(node)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
