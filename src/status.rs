//! Shared status record and its aggregator.
//!
//! The record has a fixed layout so that it can be published as-is to
//! external monitors:
//!
//! ```text
//! offset  size  field
//!      0     4  state
//!      4     4  exp_number
//!      8     4  run_number
//!     12     4  sub_run_number
//!     16     8  start_time (unix seconds)
//!     24     4  config_id
//!     28     4  node_count
//!     32   4*N  node_state[MAX_NODES]
//! ```
//!
//! All integers are little-endian. The node table is sized once and never
//! resized. One task writes; any number of readers hold a [`StatusReader`] and
//! are woken on every write. Reads are copy-out snapshots.
//!
//! Auxiliary telemetry (buffer fill levels, hook counters and the like) does
//! not fit the fixed layout; `monitor()` hooks publish it as named values
//! beside the record with [`StatusAggregator::set_telemetry`].

use crate::error::{AppResult, DaqError};
use crate::run::RunIdentity;
use crate::state::RcState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Capacity of the node table.
pub const MAX_NODES: usize = 32;

/// Encoded size of a [`StatusRecord`] in bytes.
pub const RECORD_SIZE: usize = 32 + 4 * MAX_NODES;

/// Snapshot of one node's view of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Own state id.
    pub state: i32,
    /// Experiment number of the current run.
    pub exp_number: i32,
    /// Current run number.
    pub run_number: i32,
    /// Current sub-run number.
    pub sub_run_number: i32,
    /// Run start, Unix seconds; 0 before the first START.
    pub start_time: i64,
    /// Revision of the attached configuration, 0 when none.
    pub config_id: i32,
    /// Number of used slots in `node_state`.
    pub node_count: i32,
    /// Mirrored state ids of attached nodes, in attach order.
    pub node_state: [i32; MAX_NODES],
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            state: RcState::Off.id(),
            exp_number: 0,
            run_number: 0,
            sub_run_number: 0,
            start_time: 0,
            config_id: 0,
            node_count: 0,
            node_state: [RcState::Unknown.id(); MAX_NODES],
        }
    }
}

impl StatusRecord {
    /// Own state, `Unknown` for an unrecognised id.
    pub fn own_state(&self) -> RcState {
        RcState::parse_id(self.state)
    }

    /// Run identity without the start time.
    pub fn run(&self) -> RunIdentity {
        RunIdentity {
            sub_run_number: self.sub_run_number,
            ..RunIdentity::new(self.exp_number, self.run_number)
        }
    }

    /// States of the attached nodes, in attach order.
    pub fn node_states(&self) -> impl Iterator<Item = RcState> + '_ {
        let count = usize::try_from(self.node_count).unwrap_or(0).min(MAX_NODES);
        self.node_state[..count].iter().map(|id| RcState::parse_id(*id))
    }

    /// Fixed little-endian layout, [`RECORD_SIZE`] bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_SIZE);
        buf.put_i32_le(self.state);
        buf.put_i32_le(self.exp_number);
        buf.put_i32_le(self.run_number);
        buf.put_i32_le(self.sub_run_number);
        buf.put_i64_le(self.start_time);
        buf.put_i32_le(self.config_id);
        buf.put_i32_le(self.node_count);
        for state in self.node_state {
            buf.put_i32_le(state);
        }
        buf.freeze()
    }

    /// Parse a record produced by [`StatusRecord::encode`].
    pub fn decode(mut raw: &[u8]) -> AppResult<Self> {
        if raw.len() != RECORD_SIZE {
            return Err(DaqError::Decode(format!(
                "status record is {} bytes, expected {RECORD_SIZE}",
                raw.len()
            )));
        }
        let mut record = StatusRecord {
            state: raw.get_i32_le(),
            exp_number: raw.get_i32_le(),
            run_number: raw.get_i32_le(),
            sub_run_number: raw.get_i32_le(),
            start_time: raw.get_i64_le(),
            config_id: raw.get_i32_le(),
            node_count: raw.get_i32_le(),
            node_state: [0; MAX_NODES],
        };
        for slot in record.node_state.iter_mut() {
            *slot = raw.get_i32_le();
        }
        Ok(record)
    }
}

/// Single writer of a node's status record.
///
/// Node slots are created by [`StatusAggregator::attach`] and updated only
/// from OK notifications routed by the dispatcher.
pub struct StatusAggregator {
    tx: watch::Sender<StatusRecord>,
    names: RwLock<Vec<String>>,
    telemetry: RwLock<BTreeMap<String, f64>>,
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusAggregator {
    /// Record in OFF with no nodes attached.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusRecord::default());
        Self {
            tx,
            names: RwLock::new(Vec::new()),
            telemetry: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reserve a slot for `name` and return its index. Attaching twice is a no-op.
    pub fn attach(&self, name: impl Into<String>) -> AppResult<usize> {
        let name = name.into();
        let mut names = self.names.write();
        if let Some(index) = names.iter().position(|n| *n == name) {
            return Ok(index);
        }
        if names.len() >= MAX_NODES {
            return Err(DaqError::TooManyNodes { max: MAX_NODES });
        }
        names.push(name);
        let count = names.len();
        self.tx.send_modify(|record| {
            record.node_count = count as i32;
        });
        Ok(count - 1)
    }

    /// Attached node names in slot order.
    pub fn node_names(&self) -> Vec<String> {
        self.names.read().clone()
    }

    fn index_of(&self, name: &str) -> AppResult<usize> {
        self.names
            .read()
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| DaqError::UnknownNode(name.to_string()))
    }

    /// Publish the owning node's state.
    pub fn set_own_state(&self, state: RcState) {
        self.tx.send_modify(|record| record.state = state.id());
    }

    /// Mirror a reported state into the node's slot.
    pub fn set_node_state(&self, name: &str, state: RcState) -> AppResult<()> {
        let index = self.index_of(name)?;
        self.tx
            .send_modify(|record| record.node_state[index] = state.id());
        Ok(())
    }

    /// Publish the current run identity.
    pub fn set_run(&self, run: &RunIdentity) {
        self.tx.send_modify(|record| {
            record.exp_number = run.exp_number;
            record.run_number = run.run_number;
            record.sub_run_number = run.sub_run_number;
            record.start_time = run.start_time_secs();
        });
    }

    /// Publish the attached configuration's id.
    pub fn set_config_id(&self, config_id: i32) {
        self.tx.send_modify(|record| record.config_id = config_id);
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> StatusRecord {
        *self.tx.borrow()
    }

    /// Mirrored state of an attached node.
    pub fn node_state(&self, name: &str) -> AppResult<RcState> {
        let index = self.index_of(name)?;
        Ok(RcState::parse_id(self.tx.borrow().node_state[index]))
    }

    /// `(name, state)` for every attached node.
    pub fn nodes(&self) -> Vec<(String, RcState)> {
        let record = self.snapshot();
        self.names
            .read()
            .iter()
            .zip(record.node_state)
            .map(|(name, id)| (name.clone(), RcState::parse_id(id)))
            .collect()
    }

    /// Set a named telemetry value, replacing any previous one.
    pub fn set_telemetry(&self, key: impl Into<String>, value: f64) {
        self.telemetry.write().insert(key.into(), value);
    }

    /// Last value published under `key`.
    pub fn telemetry_value(&self, key: &str) -> Option<f64> {
        self.telemetry.read().get(key).copied()
    }

    /// All telemetry values, sorted by key.
    pub fn telemetry(&self) -> BTreeMap<String, f64> {
        self.telemetry.read().clone()
    }

    /// New reader woken on every subsequent write.
    pub fn subscribe(&self) -> StatusReader {
        StatusReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of a [`StatusAggregator`].
#[derive(Clone)]
pub struct StatusReader {
    rx: watch::Receiver<StatusRecord>,
}

impl StatusReader {
    /// Copy of the latest record.
    pub fn snapshot(&self) -> StatusRecord {
        *self.rx.borrow()
    }

    /// Wait for the next write and return the new record.
    pub async fn changed(&mut self) -> AppResult<StatusRecord> {
        self.rx
            .changed()
            .await
            .map_err(|_| DaqError::Transport("status writer dropped".into()))?;
        Ok(*self.rx.borrow_and_update())
    }
}
