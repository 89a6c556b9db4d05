//! Receive loop for one node.
//!
//! The dispatcher is the only consumer of a node's inbox. It waits for a
//! message with a bounded timeout, classifies it and routes it to the
//! [`NodeController`]. Between waits it runs the periodic monitor check.
//! Malformed or unknown messages are answered with an ERROR notification and
//! never stop the loop.

use crate::bus::Inbox;
use crate::error::{AppResult, DaqError};
use crate::message::{Inbound, NsmMessage};
use crate::node::NodeController;
use crate::state::RcState;
use crate::status::StatusReader;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receive loop owning a [`NodeController`] and its inbox.
pub struct Dispatcher<I> {
    controller: NodeController,
    inbox: I,
    poll_timeout: Duration,
    monitor_interval: Duration,
}

impl<I: Inbox + 'static> Dispatcher<I> {
    /// Dispatcher with a 200 ms receive timeout and a 1 s monitor interval.
    pub fn new(controller: NodeController, inbox: I) -> Self {
        Self {
            controller,
            inbox,
            poll_timeout: Duration::from_millis(200),
            monitor_interval: Duration::from_secs(1),
        }
    }

    /// Override the receive timeout and the monitor interval.
    pub fn with_timing(mut self, poll_timeout: Duration, monitor_interval: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self.monitor_interval = monitor_interval;
        self
    }

    /// Route one message. Handling errors are reported to the sender, not returned.
    pub async fn dispatch(&mut self, msg: NsmMessage) {
        let from = msg.from.as_str();
        match msg.decode() {
            Inbound::Command { command, payload } => {
                debug!(node = %self.controller.name(), from = %from, %command, "Command received");
                if let Err(e) = self
                    .controller
                    .handle_command(command, &payload, Some(from))
                    .await
                {
                    if e.is_local_rejection() {
                        debug!(node = %self.controller.name(), from = %from, error = %e, "Command not executed");
                    } else {
                        warn!(node = %self.controller.name(), from = %from, error = %e, "Command not executed");
                    }
                }
            }
            Inbound::Ok { state } => {
                let status = self.controller.status();
                match status.set_node_state(from, state) {
                    Ok(()) => self.controller.on_node_state(from, state).await,
                    Err(_) => {
                        debug!(node = %self.controller.name(), from = %from, %state, "State report from unattached node")
                    }
                }
            }
            Inbound::Error { text, state } => {
                if let Some(state) = state {
                    if let Err(e) = self.controller.status().set_node_state(from, state) {
                        debug!(node = %self.controller.name(), from = %from, error = %e, "Error report from unattached node");
                    }
                }
                self.controller.on_node_error(from, &text).await;
            }
            Inbound::DbGet { name } => {
                if let Err(e) = self.controller.handle_dbget(from, name.as_deref()).await {
                    debug!(node = %self.controller.name(), from = %from, error = %e, "DBGET not served");
                }
            }
            Inbound::DbSet { body } => {
                if let Err(e) = self.controller.handle_dbset(from, &body).await {
                    debug!(node = %self.controller.name(), from = %from, error = %e, "DBSET not stored");
                }
            }
            Inbound::Unknown { id } => {
                let err = DaqError::UnknownCommand(id.to_string());
                warn!(node = %self.controller.name(), from = %from, id, "Unknown message id");
                self.controller.reply_error(Some(from), &err.to_string()).await;
            }
        }
    }

    /// Run until `shutdown` fires or the inbox closes, then hand the controller back.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> NodeController {
        info!(node = %self.controller.name(), "Dispatcher started");
        let mut last_monitor = Instant::now();

        loop {
            tokio::select! {
                received = self.inbox.wait(self.poll_timeout) => {
                    match received {
                        Ok(Some(msg)) => self.dispatch(msg).await,
                        Ok(None) => {}
                        Err(e) => {
                            error!(node = %self.controller.name(), error = %e, "Inbox failed, stopping dispatcher");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!(node = %self.controller.name(), "Dispatcher received shutdown signal");
                    break;
                }
            }

            if last_monitor.elapsed() >= self.monitor_interval {
                self.controller.monitor().await;
                last_monitor = Instant::now();
            }
        }

        self.controller
    }

    /// Initialise the node and run its dispatcher on a new task.
    pub fn spawn(mut self) -> NodeHandle {
        let name = self.controller.name().to_string();
        let status = self.controller.status().subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.controller.initialize().await;
            self.run(shutdown_rx).await
        });
        NodeHandle {
            name,
            status,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a node running on its own task.
pub struct NodeHandle {
    name: String,
    status: StatusReader,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<NodeController>,
}

impl NodeHandle {
    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last published state.
    pub fn state(&self) -> RcState {
        self.status.snapshot().own_state()
    }

    /// Reader of the node's status record.
    pub fn status(&self) -> StatusReader {
        self.status.clone()
    }

    /// Wait until the node publishes `state`.
    pub async fn wait_for(&mut self, state: RcState, timeout: Duration) -> AppResult<()> {
        let status = &mut self.status;
        let reached = tokio::time::timeout(timeout, async {
            let mut current = status.snapshot().own_state();
            while current != state {
                current = status.changed().await?.own_state();
            }
            Ok::<(), DaqError>(())
        })
        .await;
        match reached {
            Ok(result) => result,
            Err(_) => Err(DaqError::Transport(format!(
                "node '{}' did not reach {state} within {timeout:?}, still {}",
                self.name,
                self.status.snapshot().own_state()
            ))),
        }
    }

    /// Stop the dispatcher and return the controller for inspection.
    pub async fn shutdown(mut self) -> AppResult<NodeController> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| DaqError::Transport(format!("node '{}' task failed: {e}", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, LocalBus};
    use crate::command::RcCommand;
    use crate::message::Notification;
    use crate::node::SimulatedNode;
    use crate::store::{MemoryConfigStore, RunConfig};
    use std::sync::Arc;

    fn spawn_node(bus: &LocalBus, name: &str) -> NodeHandle {
        let store = MemoryConfigStore::new().with(RunConfig::new(
            "physics",
            name,
            serde_json::json!({}),
        ));
        let controller = NodeController::new(
            name,
            Box::new(SimulatedNode::new()),
            Arc::new(bus.clone()),
            Arc::new(store),
        );
        Dispatcher::new(controller, bus.attach(name))
            .with_timing(Duration::from_millis(10), Duration::from_millis(50))
            .spawn()
    }

    #[tokio::test]
    async fn commands_over_the_bus_drive_the_node() {
        let bus = LocalBus::default();
        let _console = bus.attach("console");
        let mut node = spawn_node(&bus, "cpr001");
        node.wait_for(RcState::NotReady, Duration::from_secs(1))
            .await
            .unwrap();

        bus.send(NsmMessage::command("console", "cpr001", RcCommand::Load).with_data("physics"))
            .await
            .unwrap();
        node.wait_for(RcState::Ready, Duration::from_secs(1))
            .await
            .unwrap();

        let controller = node.shutdown().await.unwrap();
        assert_eq!(controller.config().map(|c| c.name.as_str()), Some("physics"));
    }

    #[tokio::test]
    async fn unknown_id_gets_error_reply() {
        let bus = LocalBus::default();
        let mut console = bus.attach("console");
        let mut node = spawn_node(&bus, "cpr001");
        node.wait_for(RcState::NotReady, Duration::from_secs(1))
            .await
            .unwrap();

        bus.send(NsmMessage::new("console", "cpr001", 77)).await.unwrap();
        let reply = console
            .wait(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, Notification::Error.id());
        assert!(reply.data.contains("77"));
        assert_eq!(node.state(), RcState::NotReady);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failure_report_updates_the_mirror() {
        let bus = LocalBus::default();
        let store = MemoryConfigStore::new();
        let controller = NodeController::new(
            "master",
            Box::new(SimulatedNode::new()),
            Arc::new(bus.clone()),
            Arc::new(store),
        );
        let status = controller.status();
        status.attach("ttd").unwrap();
        status.set_node_state("ttd", RcState::Starting).unwrap();
        let mut node = Dispatcher::new(controller, bus.attach("master"))
            .with_timing(Duration::from_millis(10), Duration::from_secs(60))
            .spawn();
        node.wait_for(RcState::NotReady, Duration::from_secs(1))
            .await
            .unwrap();

        bus.send(NsmMessage::error("ttd", "master", "START is not available"))
            .await
            .unwrap();
        bus.send(NsmMessage::failure("ttd", "master", RcState::Error, "FEE timeout"))
            .await
            .unwrap();
        let mut reader = node.status();
        let mirrored = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let record = reader.snapshot();
                if record.node_state[0] != RcState::Starting.id() {
                    return record.node_state[0];
                }
                reader.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(mirrored, RcState::Error.id());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let bus = LocalBus::default();
        let mut node = spawn_node(&bus, "cpr001");
        let err = node
            .wait_for(RcState::Running, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RUNNING"));
        node.shutdown().await.unwrap();
    }
}
