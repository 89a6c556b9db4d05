//! Simulated detector subsystem.
//!
//! Stands in for a readout or trigger node without hardware. It provides:
//! - Simulated hook latency
//! - One-shot failure and cancellation injection
//! - A call log for test verification
//! - Monitor telemetry: `<node>.hook_calls` and `<node>.latency_ms`
//!
//! The node itself moves into its [`NodeController`](super::NodeController);
//! tests keep a [`SimulatedControl`] to steer and inspect it afterwards.

use super::{HookContext, HookOutcome, RcCallback};
use crate::run::RunIdentity;
use crate::store::RunConfig;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Shared {
    latency_ms: AtomicU64,
    fail_next: Mutex<Option<String>>,
    cancel_next: AtomicBool,
    call_log: Mutex<Vec<String>>,
}

/// Handle for steering a [`SimulatedNode`] after it has been moved into a controller.
#[derive(Clone)]
pub struct SimulatedControl {
    shared: Arc<Shared>,
}

impl SimulatedControl {
    /// Make the next hook fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        *self.shared.fail_next.lock() = Some(reason.into());
    }

    /// Make the next hook decline its command.
    pub fn cancel_next(&self) {
        self.shared.cancel_next.store(true, Ordering::SeqCst);
    }

    /// Delay every hook by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hook calls so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.shared.call_log.lock().clone()
    }

    /// Forget the recorded calls.
    pub fn clear_log(&self) {
        self.shared.call_log.lock().clear();
    }
}

/// Detector subsystem node with no hardware behind it.
#[derive(Default)]
pub struct SimulatedNode {
    shared: Arc<Shared>,
}

impl SimulatedNode {
    /// Node whose hooks succeed immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node whose hooks each take `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.control().set_latency(latency);
        self
    }

    /// Handle sharing this node's knobs and call log.
    pub fn control(&self) -> SimulatedControl {
        SimulatedControl {
            shared: Arc::clone(&self.shared),
        }
    }

    async fn hook(&self, node: &str, call: String) -> anyhow::Result<HookOutcome> {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        tracing::debug!(node = %node, call = %call, "Simulated hook");
        self.shared.call_log.lock().push(call);

        let failure = self.shared.fail_next.lock().take();
        if let Some(reason) = failure {
            bail!("{node}: {reason}");
        }
        if self.shared.cancel_next.swap(false, Ordering::SeqCst) {
            return Ok(HookOutcome::Cancelled);
        }
        Ok(HookOutcome::Done)
    }
}

#[async_trait]
impl RcCallback for SimulatedNode {
    async fn configure(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        self.hook(&ctx.node, "configure".into()).await.map(|_| ())
    }

    async fn boot(&mut self, ctx: &HookContext, option: Option<&str>) -> anyhow::Result<HookOutcome> {
        let call = match option {
            Some(option) => format!("boot {option}"),
            None => "boot".into(),
        };
        self.hook(&ctx.node, call).await
    }

    async fn load(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, format!("load {}", config.name)).await
    }

    async fn start(&mut self, ctx: &HookContext, run: &RunIdentity) -> anyhow::Result<HookOutcome> {
        self.hook(
            &ctx.node,
            format!("start {:04}.{:06}", run.exp_number, run.run_number),
        )
        .await
    }

    async fn stop(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, "stop".into()).await
    }

    async fn resume(&mut self, ctx: &HookContext, sub_run: i32) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, format!("resume {sub_run}")).await
    }

    async fn pause(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, "pause".into()).await
    }

    async fn abort(&mut self, ctx: &HookContext) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, "abort".into()).await
    }

    async fn trigft(&mut self, ctx: &HookContext, config: &RunConfig) -> anyhow::Result<HookOutcome> {
        self.hook(&ctx.node, format!("trigft {}", config.name)).await
    }

    async fn monitor(&mut self, ctx: &HookContext) -> anyhow::Result<()> {
        let calls = self.shared.call_log.lock().len();
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        ctx.status
            .set_telemetry(format!("{}.hook_calls", ctx.node), calls as f64);
        ctx.status
            .set_telemetry(format!("{}.latency_ms", ctx.node), latency as f64);
        Ok(())
    }
}
