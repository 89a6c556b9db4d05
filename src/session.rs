//! In-process run-control session.
//!
//! Wires a master and its simulated subordinates onto one [`LocalBus`] from an
//! [`RcConfig`], each node on its own task. Used by the binary and by the
//! integration tests.

use crate::bus::LocalBus;
use crate::config::{NodeRole, RcConfig, StoreBackend};
use crate::dispatcher::{Dispatcher, NodeHandle};
use crate::error::{AppResult, DaqError};
use crate::node::{MasterCallback, NodeController, RcCallback, SimulatedNode};
use crate::store::{ConfigStore, FileConfigStore, MemoryConfigStore, RunConfig};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// A running master and its subordinates.
pub struct Session {
    bus: LocalBus,
    master: NodeHandle,
    subordinates: Vec<NodeHandle>,
}

/// Open the configured store.
pub fn open_store(config: &RcConfig) -> AppResult<Arc<dyn ConfigStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryConfigStore::new())),
        StoreBackend::File => {
            let root = config.store.root.clone().ok_or_else(|| {
                DaqError::Usage("store.root is required for the file backend".into())
            })?;
            let store = FileConfigStore::new(root);
            info!(root = %store.root().display(), "Using file configuration store");
            Ok(Arc::new(store))
        }
    }
}

/// Make sure `name` exists for `node`, creating it with `tree` if absent.
pub async fn seed_config(
    store: &dyn ConfigStore,
    name: &str,
    node: &str,
    tree: Value,
) -> AppResult<RunConfig> {
    match store.save_config(&RunConfig::new(name, node, tree), false).await {
        Ok(config) => Ok(config),
        Err(DaqError::ConfigExists { .. }) => store.load_config(name, node).await,
        Err(e) => Err(e),
    }
}

impl Session {
    /// Spawn every configured node on `bus`.
    pub async fn launch(config: &RcConfig, bus: LocalBus) -> AppResult<Session> {
        let store = open_store(config)?;
        let node = &config.node;

        if let Some(name) = &node.default_config {
            let mut tree = Map::new();
            for sub in &node.subordinates {
                seed_config(store.as_ref(), name, sub, json!({})).await?;
                tree.insert(sub.clone(), json!({}));
            }
            seed_config(store.as_ref(), name, &node.name, Value::Object(tree)).await?;
        }

        let spawn = |name: &str, callback: Box<dyn RcCallback>, observers: Vec<String>| {
            let mut controller =
                NodeController::new(name, callback, Arc::new(bus.clone()), Arc::clone(&store))
                    .with_observers(observers);
            if let Some(default) = &node.default_config {
                controller = controller.with_default_config(default.as_str());
            }
            Dispatcher::new(controller, bus.attach(name))
                .with_timing(
                    config.dispatcher.poll_timeout(),
                    config.dispatcher.monitor_interval(),
                )
                .spawn()
        };

        let subordinates: Vec<NodeHandle> = node
            .subordinates
            .iter()
            .map(|sub| spawn(sub.as_str(), Box::new(SimulatedNode::new()), Vec::new()))
            .collect();

        let callback: Box<dyn RcCallback> = match node.role {
            NodeRole::Master => Box::new(MasterCallback::new(node.subordinates.clone())),
            NodeRole::Simulated => Box::new(SimulatedNode::new()),
        };
        let master = spawn(node.name.as_str(), callback, node.observers.clone());

        info!(
            master = %node.name,
            subordinates = node.subordinates.len(),
            "Run-control session launched"
        );
        Ok(Session {
            bus,
            master,
            subordinates,
        })
    }

    /// Bus the nodes are attached to.
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Handle of the master node.
    pub fn master(&mut self) -> &mut NodeHandle {
        &mut self.master
    }

    /// Handle of the subordinate called `name`.
    pub fn subordinate(&mut self, name: &str) -> Option<&mut NodeHandle> {
        self.subordinates.iter_mut().find(|h| h.name() == name)
    }

    /// Stop every node, master first, and take them off the bus.
    pub async fn shutdown(self) -> AppResult<Vec<NodeController>> {
        let mut controllers = Vec::with_capacity(self.subordinates.len() + 1);
        for handle in std::iter::once(self.master).chain(self.subordinates) {
            let name = handle.name().to_string();
            controllers.push(handle.shutdown().await?);
            self.bus.detach(&name);
        }
        Ok(controllers)
    }
}
