//! Supervising controller.
//!
//! The master forwards every accepted command to all of its subordinates at
//! once. Long commands are deferred: the master stays in the transitional
//! state until each subordinate has reported the command's transitional state
//! and then its stable target, and fails the transition as soon as one
//! reports an error, settles elsewhere or cannot be reached.
//!
//! A target report only counts after the matching transitional report. A
//! command that overrides a pending one (RECOVER during LOAD) therefore does
//! not complete on notifications the overridden command produced.
//!
//! Subordinate errors outside a transition (a failed PAUSE or RESUME) move the
//! master to ERROR as well.

use super::{forwarded_payload, HookContext, HookOutcome, RcCallback, Settlement};
use crate::command::RcCommand;
use crate::message::NsmMessage;
use crate::run::RunIdentity;
use crate::state::RcState;
use crate::store::RunConfig;
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Awaiting {
    command: RcCommand,
    transitional: RcState,
    target: RcState,
    /// Subordinates still outstanding, flagged once their transitional report arrived.
    nodes: HashMap<String, bool>,
}

/// [`RcCallback`] of the supervising node: forwards commands, mirrors and
/// waits for its subordinates.
pub struct MasterCallback {
    subordinates: Vec<String>,
    awaiting: Option<Awaiting>,
}

impl MasterCallback {
    /// Master over `subordinates`, in status-slot order.
    pub fn new(subordinates: Vec<String>) -> Self {
        Self {
            subordinates,
            awaiting: None,
        }
    }

    async fn fan_out(
        &mut self,
        ctx: &HookContext,
        command: RcCommand,
        option: Option<&str>,
    ) -> anyhow::Result<HookOutcome> {
        self.awaiting = None;
        if self.subordinates.is_empty() {
            return Ok(HookOutcome::Done);
        }

        let payload = forwarded_payload(command, ctx, option);
        let sends = self.subordinates.iter().map(|node| {
            let msg = NsmMessage::command(ctx.node.as_str(), node.as_str(), command)
                .with_pars(payload.pars.clone())
                .with_data(payload.data.clone());
            let bus = Arc::clone(&ctx.bus);
            async move { bus.send(msg).await }
        });
        let results = join_all(sends).await;

        let mut unreachable = Vec::new();
        for (node, result) in self.subordinates.iter().zip(results) {
            if let Err(e) = result {
                warn!(master = %ctx.node, node = %node, %command, error = %e, "Command not delivered");
                if let Err(e) = ctx.status.set_node_state(node, RcState::Unknown) {
                    debug!(node = %node, error = %e, "No status slot for subordinate");
                }
                unreachable.push(node.as_str());
            }
        }
        if !unreachable.is_empty() {
            bail!("{command} not delivered to {}", unreachable.join(", "));
        }

        match (command.transitional_target(), command.stable_target()) {
            (Some(transitional), Some(target)) => {
                debug!(master = %ctx.node, %command, %target, "Waiting for subordinates");
                self.awaiting = Some(Awaiting {
                    command,
                    transitional,
                    target,
                    nodes: self
                        .subordinates
                        .iter()
                        .map(|node| (node.clone(), false))
                        .collect(),
                });
                Ok(HookOutcome::Deferred)
            }
            _ => Ok(HookOutcome::Done),
        }
    }
}

#[async_trait]
impl RcCallback for MasterCallback {
    async fn configure(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        for node in &self.subordinates {
            ctx.status
                .attach(node.as_str())
                .with_context(|| format!("attaching subordinate '{node}'"))?;
        }
        info!(master = %ctx.node, subordinates = self.subordinates.len(), "Master configured");
        Ok(())
    }

    async fn boot(&mut self, ctx: &HookContext, option: Option<&str>) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Boot, option).await
    }

    async fn load(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Load, Some(config.name.as_str())).await
    }

    async fn start(&mut self, ctx: &HookContext, run: &RunIdentity) -> anyhow::Result<HookOutcome> {
        info!(master = %ctx.node, exp = run.exp_number, run = run.run_number, "Starting run");
        self.fan_out(ctx, RcCommand::Start, None).await
    }

    async fn stop(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Stop, None).await
    }

    async fn resume(&mut self, ctx: &HookContext, _sub_run: i32) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Resume, None).await
    }

    async fn pause(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Pause, None).await
    }

    async fn abort(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Abort, None).await
    }

    async fn recover(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::Recover, None).await
    }

    async fn trigft(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome> {
        self.fan_out(ctx, RcCommand::TrigFt, Some(config.name.as_str())).await
    }

    /// Ask connected subordinates whose state is unknown to report in.
    async fn monitor(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        for node in &self.subordinates {
            if ctx.status.node_state(node)? != RcState::Unknown {
                continue;
            }
            if !ctx.bus.is_connected(node) {
                debug!(master = %ctx.node, node = %node, "Subordinate still unreachable");
                continue;
            }
            let query = NsmMessage::command(ctx.node.as_str(), node.as_str(), RcCommand::StateCheck);
            if let Err(e) = ctx.bus.send(query).await {
                debug!(master = %ctx.node, node = %node, error = %e, "State check not delivered");
            }
        }
        Ok(())
    }

    async fn node_state_changed(
        &mut self,
        ctx: &HookContext,
        node: &str,
        state: RcState,
    ) -> anyhow::Result<Settlement> {
        if ctx.pending.is_none() {
            self.awaiting = None;
            return Ok(Settlement::Pending);
        }
        let Some(awaiting) = self.awaiting.as_mut() else {
            return Ok(Settlement::Pending);
        };

        if state.is_error() {
            let text = format!("{node} went to {state} during {}", awaiting.command);
            self.awaiting = None;
            return Ok(Settlement::Failed(text));
        }
        let Some(started) = awaiting.nodes.get_mut(node) else {
            return Ok(Settlement::Pending);
        };
        if state == awaiting.transitional {
            *started = true;
            return Ok(Settlement::Pending);
        }
        if !*started {
            debug!(master = %ctx.node, node = %node, %state, command = %awaiting.command, "Report predates the command; ignored");
            return Ok(Settlement::Pending);
        }
        if state == awaiting.target {
            awaiting.nodes.remove(node);
            debug!(master = %ctx.node, node = %node, remaining = awaiting.nodes.len(), "Subordinate reached target");
            if awaiting.nodes.is_empty() {
                self.awaiting = None;
                return Ok(Settlement::Complete);
            }
        } else if state.is_stable() {
            let text = format!(
                "{node} settled in {state} instead of {} during {}",
                awaiting.target, awaiting.command
            );
            self.awaiting = None;
            return Ok(Settlement::Failed(text));
        }
        Ok(Settlement::Pending)
    }

    async fn node_error(
        &mut self,
        ctx: &HookContext,
        node: &str,
        text: &str,
    ) -> anyhow::Result<Settlement> {
        let during = self
            .awaiting
            .take()
            .filter(|_| ctx.pending.is_some())
            .map(|awaiting| awaiting.command);
        Ok(Settlement::Failed(match during {
            Some(command) => format!("{node} failed during {command}: {text}"),
            None => format!("{node} failed: {text}"),
        }))
    }
}
