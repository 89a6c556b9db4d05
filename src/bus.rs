//! Message bus seam.
//!
//! The physical transport is a collaborator: nodes only see [`Bus`] for
//! sending and [`Inbox`] for bounded-wait receiving. [`LocalBus`] is an
//! in-process implementation used by the demo binary and the tests. It
//! delivers in send order per destination, never blocks the sender and can
//! inject a transport failure on the next send. Tests that inspect traffic
//! turn on delivery recording with [`LocalBus::record_deliveries`]; it is off
//! by default so a long-running session does not accumulate messages.

use crate::error::{AppResult, DaqError};
use crate::message::NsmMessage;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Sending half of the bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Hand a message to the transport. An error means it was not delivered.
    async fn send(&self, msg: NsmMessage) -> AppResult<()>;

    /// Whether `node` is currently reachable.
    fn is_connected(&self, node: &str) -> bool;
}

/// Receiving half of the bus for one node.
#[async_trait]
pub trait Inbox: Send {
    /// Wait up to `timeout` for a message. `Ok(None)` means the wait timed out.
    async fn wait(&mut self, timeout: Duration) -> AppResult<Option<NsmMessage>>;
}

/// In-process bus connecting nodes by name.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

struct LocalBusInner {
    capacity: usize,
    endpoints: RwLock<HashMap<String, mpsc::Sender<NsmMessage>>>,
    fail_next: AtomicBool,
    recording: AtomicBool,
    delivered: Mutex<Vec<NsmMessage>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LocalBus {
    /// Create a bus whose per-node mailboxes hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalBusInner {
                capacity: capacity.max(1),
                endpoints: RwLock::new(HashMap::new()),
                fail_next: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                delivered: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `node` and return its inbox. Re-attaching replaces the old mailbox.
    pub fn attach(&self, node: impl Into<String>) -> LocalInbox {
        let node = node.into();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        if self.inner.endpoints.write().insert(node.clone(), tx).is_some() {
            tracing::warn!(node = %node, "Node re-attached to bus; previous mailbox dropped");
        }
        tracing::debug!(node = %node, "Node attached to bus");
        LocalInbox { node, rx }
    }

    /// Remove `node`; later sends to it fail with a transport error.
    pub fn detach(&self, node: &str) {
        if self.inner.endpoints.write().remove(node).is_some() {
            tracing::debug!(node = %node, "Node detached from bus");
        }
    }

    /// Make the next send fail with a transport error.
    pub fn inject_next_failure(&self) {
        self.inner.fail_next.store(true, Ordering::SeqCst);
    }

    /// Start keeping a copy of every delivered message.
    pub fn record_deliveries(&self) {
        self.inner.recording.store(true, Ordering::SeqCst);
    }

    /// Messages delivered since recording was turned on, in delivery order.
    pub fn delivered(&self) -> Vec<NsmMessage> {
        self.inner.delivered.lock().clone()
    }

    /// Forget the recorded messages.
    pub fn clear_delivered(&self) {
        self.inner.delivered.lock().clear();
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn send(&self, msg: NsmMessage) -> AppResult<()> {
        if self.inner.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Transport(format!(
                "injected failure sending to '{}'",
                msg.to
            )));
        }

        let sender = self
            .inner
            .endpoints
            .read()
            .get(&msg.to)
            .cloned()
            .ok_or_else(|| DaqError::Transport(format!("node '{}' is not connected", msg.to)))?;

        let record = self
            .inner
            .recording
            .load(Ordering::SeqCst)
            .then(|| msg.clone());
        match sender.try_send(msg) {
            Ok(()) => {
                if let Some(record) = record {
                    self.inner.delivered.lock().push(record);
                }
                Ok(())
            }
            Err(TrySendError::Full(msg)) => Err(DaqError::Transport(format!(
                "mailbox of '{}' is full",
                msg.to
            ))),
            Err(TrySendError::Closed(msg)) => {
                self.inner.endpoints.write().remove(&msg.to);
                Err(DaqError::Transport(format!("node '{}' went away", msg.to)))
            }
        }
    }

    fn is_connected(&self, node: &str) -> bool {
        self.inner
            .endpoints
            .read()
            .get(node)
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Mailbox of one node on a [`LocalBus`].
pub struct LocalInbox {
    node: String,
    rx: mpsc::Receiver<NsmMessage>,
}

impl LocalInbox {
    /// Name the inbox was attached under.
    pub fn node(&self) -> &str {
        &self.node
    }
}

#[async_trait]
impl Inbox for LocalInbox {
    async fn wait(&mut self, timeout: Duration) -> AppResult<Option<NsmMessage>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(DaqError::Transport(format!(
                "mailbox of '{}' closed",
                self.node
            ))),
            Err(_) => Ok(None),
        }
    }
}
