//! Run-control nodes.
//!
//! A node is one process representing either a detector subsystem or the
//! supervising controller. Every node is a [`NodeController`] driving a
//! [`RcCallback`] implementation that supplies the subsystem-specific work:
//!
//! - [`SimulatedNode`]: a detector subsystem with configurable latency and
//!   failure injection.
//! - [`MasterCallback`]: the supervising controller, which forwards every
//!   command to its subordinates and completes once they all report back.
//!
//! The controller owns the state; callbacks never change it directly. They
//! report how a hook ended through [`HookOutcome`] and, for deferred work, how
//! a subordinate notification settles it through [`Settlement`].

pub mod controller;
pub mod master;
pub mod simulated;

pub use controller::NodeController;
pub use master::MasterCallback;
pub use simulated::{SimulatedNode, SimulatedControl};

use crate::bus::Bus;
use crate::message::Payload;
use crate::run::{OperatorAnnotation, RunIdentity};
use crate::state::RcState;
use crate::status::StatusAggregator;
use crate::store::RunConfig;
use crate::transition::Step;
use async_trait::async_trait;
use std::sync::Arc;

/// How a lifecycle hook ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The work is finished; the node moves to the command's stable target.
    Done,
    /// The work continues elsewhere. The node stays in the transitional state
    /// until [`RcCallback::node_state_changed`] or [`RcCallback::node_error`]
    /// settles it. Short commands cannot be deferred and are treated as `Done`.
    Deferred,
    /// The hook declined the command; the node keeps its previous state.
    Cancelled,
}

/// Verdict after a subordinate notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Nothing to do yet.
    Pending,
    /// The deferred transition reached its target.
    Complete,
    /// The node must go to ERROR with this text, whether or not a
    /// transition is pending.
    Failed(String),
}

/// What a hook can see of its node.
#[derive(Clone)]
pub struct HookContext {
    /// Name of the node running the hook.
    pub node: String,
    /// Current state; the transitional state while a command runs.
    pub state: RcState,
    /// Bus for talking to other nodes.
    pub bus: Arc<dyn Bus>,
    /// The node's status record, including its telemetry values.
    pub status: Arc<StatusAggregator>,
    /// Current run identity.
    pub run: RunIdentity,
    /// Attached run configuration.
    pub config: Option<Arc<RunConfig>>,
    /// Operator annotation of the current run.
    pub annotation: OperatorAnnotation,
    /// Deferred transition still waiting for subordinates, if any.
    pub pending: Option<Step>,
}

/// Subsystem-specific lifecycle hooks.
///
/// Hooks return `anyhow::Result` so implementations can attach context
/// freely; the controller turns an error into the ERROR state and broadcasts
/// its text.
#[async_trait]
pub trait RcCallback: Send + Sync {
    /// One-off setup run while the node passes through CONFIGURING at startup.
    async fn configure(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// BOOT: reinitialise with an optional boot option. The configuration is
    /// detached once this succeeds.
    async fn boot(&mut self, ctx: &HookContext, option: Option<&str>)
        -> anyhow::Result<HookOutcome>;

    /// LOAD: apply `config`, which becomes attached on success.
    async fn load(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome>;

    /// START: begin data taking as `run`.
    async fn start(&mut self, ctx: &HookContext, run: &RunIdentity) -> anyhow::Result<HookOutcome>;

    /// STOP: end the current run.
    async fn stop(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome>;

    /// RESUME: continue as sub-run `sub_run`.
    async fn resume(&mut self, ctx: &HookContext, sub_run: i32) -> anyhow::Result<HookOutcome>;

    /// PAUSE: suspend data taking.
    async fn pause(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome>;

    /// ABORT: drop whatever is in progress.
    async fn abort(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome>;

    /// Abort followed by a reload of the attached configuration.
    async fn recover(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        match self.abort(ctx).await? {
            HookOutcome::Done => {}
            other => return Ok(other),
        }
        match ctx.config.as_deref() {
            Some(config) => self.load(ctx, config).await,
            None => Ok(HookOutcome::Done),
        }
    }

    /// Trigger-only reload. Behaves like LOAD unless overridden.
    async fn trigft(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome> {
        self.load(ctx, config).await
    }

    /// Periodic check between dispatch cycles. Auxiliary readings go to
    /// `ctx.status` telemetry. Errors are logged only.
    async fn monitor(&mut self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// A subordinate reported a new state.
    async fn node_state_changed(
        &mut self,
        _ctx: &HookContext,
        _node: &str,
        _state: RcState,
    ) -> anyhow::Result<Settlement> {
        Ok(Settlement::Pending)
    }

    /// A subordinate rejected a command or failed. `Settlement::Failed`
    /// moves this node to ERROR even when no transition is pending.
    async fn node_error(
        &mut self,
        _ctx: &HookContext,
        _node: &str,
        _text: &str,
    ) -> anyhow::Result<Settlement> {
        Ok(Settlement::Pending)
    }
}

/// Build the payload a master forwards for a command, from its own context.
pub(crate) fn forwarded_payload(
    command: crate::command::RcCommand,
    ctx: &HookContext,
    option: Option<&str>,
) -> Payload {
    use crate::command::RcCommand;
    match command {
        RcCommand::Start => Payload::start(
            Some((ctx.run.exp_number, ctx.run.run_number)),
            &ctx.annotation,
        ),
        RcCommand::Resume => Payload {
            pars: vec![ctx.run.sub_run_number],
            data: String::new(),
        },
        RcCommand::Load | RcCommand::TrigFt | RcCommand::Boot => {
            Payload::text(option.unwrap_or_default())
        }
        _ => Payload::default(),
    }
}
