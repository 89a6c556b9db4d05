//! Per-node command handling.
//!
//! [`NodeController`] owns a node's run-control state and is the only place
//! that changes it. Each command is handled as one unit on `&mut self`:
//! authorise, check preconditions, enter the transitional state, run the
//! hook, settle. Deferred hooks leave a pending transition behind that later
//! subordinate notifications complete.

use super::{HookContext, HookOutcome, RcCallback, Settlement};
use crate::bus::Bus;
use crate::command::RcCommand;
use crate::error::{AppResult, DaqError};
use crate::message::{NsmMessage, Payload};
use crate::run::{OperatorAnnotation, RunIdentity, RunNumberAllocator};
use crate::state::RcState;
use crate::status::StatusAggregator;
use crate::store::{ConfigStore, RunConfig};
use crate::transition::{self, Outcome, Step};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Side effects of a command, applied only once it succeeds.
#[derive(Debug, Clone, Default)]
struct Effects {
    config: ConfigChange,
    allocator: Option<RunNumberAllocator>,
}

#[derive(Debug, Clone, Default)]
enum ConfigChange {
    #[default]
    Keep,
    Attach(Arc<RunConfig>),
    Detach,
}

#[derive(Debug)]
struct Pending {
    step: Step,
    requester: Option<String>,
    effects: Effects,
}

/// One node's run-control state machine.
///
/// Built with [`NodeController::new`] and the `with_*` builders, then either
/// driven directly (tests) or handed to a [`crate::dispatcher::Dispatcher`].
pub struct NodeController {
    name: String,
    state: RcState,
    callback: Box<dyn RcCallback>,
    bus: Arc<dyn Bus>,
    store: Arc<dyn ConfigStore>,
    status: Arc<StatusAggregator>,
    config: Option<Arc<RunConfig>>,
    default_config: Option<String>,
    allocator: RunNumberAllocator,
    annotation: OperatorAnnotation,
    observers: Vec<String>,
    pending: Option<Pending>,
}

impl NodeController {
    /// Node in OFF with no configuration, a private status record and no observers.
    pub fn new(
        name: impl Into<String>,
        callback: Box<dyn RcCallback>,
        bus: Arc<dyn Bus>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            name: name.into(),
            state: RcState::Off,
            callback,
            bus,
            store,
            status: Arc::new(StatusAggregator::new()),
            config: None,
            default_config: None,
            allocator: RunNumberAllocator::default(),
            annotation: OperatorAnnotation::default(),
            observers: Vec::new(),
            pending: None,
        }
    }

    /// Share an existing status record instead of a private one.
    pub fn with_status(mut self, status: Arc<StatusAggregator>) -> Self {
        self.status = status;
        self
    }

    /// Configuration loaded when LOAD or TRIGFT names none.
    pub fn with_default_config(mut self, name: impl Into<String>) -> Self {
        self.default_config = Some(name.into());
        self
    }

    /// Nodes that receive every state notification in addition to the requester.
    pub fn with_observers(mut self, observers: Vec<String>) -> Self {
        self.observers = observers;
        self
    }

    /// Node name on the bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> RcState {
        self.state
    }

    /// The node's status record.
    pub fn status(&self) -> Arc<StatusAggregator> {
        Arc::clone(&self.status)
    }

    /// Identity of the last started run.
    pub fn run(&self) -> RunIdentity {
        self.allocator.current()
    }

    /// Attached run configuration.
    pub fn config(&self) -> Option<&RunConfig> {
        self.config.as_deref()
    }

    /// Operator annotation used for the next START.
    pub fn annotation(&self) -> &OperatorAnnotation {
        &self.annotation
    }

    /// Replace the operator annotation.
    pub fn set_annotation(&mut self, annotation: OperatorAnnotation) {
        self.annotation = annotation;
    }

    /// Command whose deferred transition is still open.
    pub fn pending(&self) -> Option<RcCommand> {
        self.pending.as_ref().map(|p| p.step.command)
    }

    fn context(&self) -> HookContext {
        HookContext {
            node: self.name.clone(),
            state: self.state,
            bus: Arc::clone(&self.bus),
            status: Arc::clone(&self.status),
            run: self.allocator.current(),
            config: self.config.clone(),
            annotation: self.annotation.clone(),
            pending: self.pending.as_ref().map(|p| p.step),
        }
    }

    fn set_state(&mut self, state: RcState) {
        if state != self.state {
            debug!(node = %self.name, from = %self.state, to = %state, "State change");
        }
        self.state = state;
        self.status.set_own_state(state);
    }

    /// Run the one-off configure hook: OFF → CONFIGURING → NOTREADY.
    pub async fn initialize(&mut self) -> RcState {
        if self.state != RcState::Off {
            warn!(node = %self.name, state = %self.state, "Node already initialised");
            return self.state;
        }
        self.set_state(RcState::Configuring);
        self.notify_state(None).await;

        let ctx = self.context();
        match self.callback.configure(&ctx).await {
            Ok(()) => {
                self.set_state(RcState::Configuring.next());
                info!(node = %self.name, "Node configured");
                self.notify_state(None).await;
            }
            Err(e) => {
                let failure = DaqError::HookFailure(format!("{e:#}"));
                error!(node = %self.name, error = %failure, "Configure hook failed");
                self.fail(None, failure.to_string()).await;
            }
        }
        self.state
    }

    /// Handle one run-control command.
    ///
    /// Local rejections (availability, preconditions) are returned as errors
    /// after an ERROR reply to the requester; the state is untouched. A failing
    /// hook is not an error here: the node moves to ERROR and that state is
    /// returned.
    pub async fn handle_command(
        &mut self,
        command: RcCommand,
        payload: &Payload,
        requester: Option<&str>,
    ) -> AppResult<RcState> {
        let step = match transition::begin(self.state, command) {
            Ok(step) => step,
            Err(e) => {
                warn!(node = %self.name, %command, state = %self.state, "Command rejected");
                self.reply_error(requester, &e.to_string()).await;
                return Err(e);
            }
        };

        if command == RcCommand::StateCheck {
            if let Some(to) = requester {
                self.send(NsmMessage::ok(&self.name, to, self.state)).await;
            }
            return Ok(self.state);
        }

        let (effects, hook_config) = match self.preconditions(command, payload).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(node = %self.name, %command, error = %e, "Command precondition failed");
                self.reply_error(requester, &e.to_string()).await;
                return Err(e);
            }
        };

        if let Some(pending) = self.pending.take() {
            info!(
                node = %self.name,
                pending = %pending.step.command,
                %command,
                "Pending transition overridden"
            );
        }

        info!(node = %self.name, %command, from = %self.state, "Command accepted");
        if let Some(mid) = step.transitional {
            self.set_state(mid);
            self.notify_state(requester).await;
        }

        let mut ctx = self.context();
        if let Some(allocator) = &effects.allocator {
            ctx.run = allocator.current();
        }

        let result = match command {
            RcCommand::Boot => {
                let option = payload.text_arg();
                self.callback.boot(&ctx, option.as_deref()).await
            }
            RcCommand::Load => match &hook_config {
                Some(config) => self.callback.load(&ctx, config).await,
                None => Ok(HookOutcome::Done),
            },
            RcCommand::TrigFt => match &hook_config {
                Some(config) => self.callback.trigft(&ctx, config).await,
                None => Ok(HookOutcome::Done),
            },
            RcCommand::Start => self.callback.start(&ctx, &ctx.run).await,
            RcCommand::Stop => self.callback.stop(&ctx).await,
            RcCommand::Resume => self.callback.resume(&ctx, ctx.run.sub_run_number).await,
            RcCommand::Pause => self.callback.pause(&ctx).await,
            RcCommand::Recover => self.callback.recover(&ctx).await,
            RcCommand::Abort => self.callback.abort(&ctx).await,
            RcCommand::StateCheck => Ok(HookOutcome::Done),
        };

        match result {
            Ok(HookOutcome::Deferred) if step.transitional.is_some() => {
                debug!(node = %self.name, %command, "Transition deferred");
                self.pending = Some(Pending {
                    step,
                    requester: requester.map(str::to_string),
                    effects,
                });
            }
            Ok(HookOutcome::Done | HookOutcome::Deferred) => {
                self.settle(step, Outcome::Success, effects, requester).await;
            }
            Ok(HookOutcome::Cancelled) => {
                info!(node = %self.name, %command, "Command cancelled by hook");
                self.settle(step, Outcome::Cancelled, effects, requester).await;
            }
            Err(e) => {
                let failure = DaqError::HookFailure(format!("{e:#}"));
                self.settle(step, Outcome::Failed(failure.to_string()), effects, requester)
                    .await;
            }
        }
        Ok(self.state)
    }

    /// Checks that must pass before any state change, and the effects to apply on success.
    async fn preconditions(
        &mut self,
        command: RcCommand,
        payload: &Payload,
    ) -> AppResult<(Effects, Option<Arc<RunConfig>>)> {
        let mut effects = Effects::default();
        let mut hook_config = None;
        match command {
            RcCommand::Start => {
                let annotation = payload
                    .annotation()
                    .unwrap_or_else(|| self.annotation.clone());
                if !annotation.is_complete() {
                    return Err(DaqError::MissingAnnotation);
                }
                if self.config.is_none() {
                    return Err(DaqError::ConfigNotFound {
                        name: self.default_config.clone().unwrap_or_default(),
                        node: self.name.clone(),
                    });
                }
                let mut allocator = self.allocator.clone();
                allocator.start_run(payload.run_request())?;
                effects.allocator = Some(allocator);
                self.annotation = annotation;
            }
            RcCommand::Resume => {
                let mut allocator = self.allocator.clone();
                allocator.next_sub_run(payload.par(0))?;
                effects.allocator = Some(allocator);
            }
            RcCommand::Load | RcCommand::TrigFt => {
                let name = payload
                    .text_arg()
                    .or_else(|| self.default_config.clone())
                    .ok_or_else(|| DaqError::ConfigNotFound {
                        name: String::new(),
                        node: self.name.clone(),
                    })?;
                let config = Arc::new(self.store.load_config(&name, &self.name).await?);
                effects.config = ConfigChange::Attach(Arc::clone(&config));
                hook_config = Some(config);
            }
            RcCommand::Boot => effects.config = ConfigChange::Detach,
            _ => {}
        }
        Ok((effects, hook_config))
    }

    async fn settle(
        &mut self,
        step: Step,
        outcome: Outcome,
        effects: Effects,
        requester: Option<&str>,
    ) {
        let state = transition::finish(&step, &outcome);
        match outcome {
            Outcome::Success => {
                self.apply(effects);
                self.set_state(state);
                info!(node = %self.name, command = %step.command, state = %state, "Command completed");
                self.notify_state(requester).await;
            }
            Outcome::Cancelled => {
                self.set_state(state);
                self.notify_state(requester).await;
            }
            Outcome::Failed(text) => {
                error!(node = %self.name, command = %step.command, error = %text, "Hook failed");
                self.fail(requester, text).await;
            }
        }
    }

    fn apply(&mut self, effects: Effects) {
        match effects.config {
            ConfigChange::Keep => {}
            ConfigChange::Attach(config) => {
                self.status.set_config_id(config.config_id());
                self.config = Some(config);
            }
            ConfigChange::Detach => {
                self.status.set_config_id(0);
                self.config = None;
            }
        }
        if let Some(allocator) = effects.allocator {
            self.allocator = allocator;
            self.status.set_run(&self.allocator.current());
        }
    }

    /// Enter ERROR and tell the requester and observers, with the new state
    /// attached so their status records follow.
    async fn fail(&mut self, requester: Option<&str>, text: String) {
        self.pending = None;
        self.set_state(RcState::Error);
        for to in self.recipients(requester) {
            self.send(NsmMessage::failure(&self.name, &to, self.state, text.as_str()))
                .await;
        }
    }

    async fn settle_pending(&mut self, outcome: Outcome) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let requester = pending.requester.clone();
        self.settle(pending.step, outcome, pending.effects, requester.as_deref())
            .await;
    }

    /// A subordinate reported `state`. The status mirror has already been updated.
    pub async fn on_node_state(&mut self, node: &str, state: RcState) {
        let ctx = self.context();
        let verdict = self.callback.node_state_changed(&ctx, node, state).await;
        self.apply_settlement(node, verdict).await;
    }

    /// A subordinate reported an error. The status mirror has already been
    /// updated if the error carried a state.
    pub async fn on_node_error(&mut self, node: &str, text: &str) {
        warn!(node = %self.name, from = %node, error = %text, "Subordinate reported an error");
        let ctx = self.context();
        let verdict = self.callback.node_error(&ctx, node, text).await;
        self.apply_settlement(node, verdict).await;
    }

    async fn apply_settlement(&mut self, node: &str, verdict: anyhow::Result<Settlement>) {
        let outcome = match verdict {
            Ok(Settlement::Pending) => return,
            Ok(Settlement::Complete) => Outcome::Success,
            Ok(Settlement::Failed(text)) => Outcome::Failed(text),
            Err(e) => Outcome::Failed(format!("{e:#}")),
        };
        if self.pending.is_some() {
            self.settle_pending(outcome).await;
        } else if let Outcome::Failed(text) = outcome {
            error!(node = %self.name, from = %node, error = %text, "Subordinate failure outside a transition");
            self.fail(None, text).await;
        } else {
            debug!(node = %self.name, from = %node, "Completion ignored, no pending transition");
        }
    }

    /// Periodic callback check. Never changes the state.
    pub async fn monitor(&mut self) {
        let ctx = self.context();
        if let Err(e) = self.callback.monitor(&ctx).await {
            warn!(node = %self.name, error = %format!("{e:#}"), "Monitor check failed");
        }
    }

    /// Answer a DBGET with a DBSET carrying the named (or attached) configuration.
    pub async fn handle_dbget(&mut self, requester: &str, name: Option<&str>) -> AppResult<()> {
        let config = match name {
            Some(name) => self.store.load_config(name, &self.name).await,
            None => self.config.as_deref().cloned().ok_or_else(|| DaqError::ConfigNotFound {
                name: self.default_config.clone().unwrap_or_default(),
                node: self.name.clone(),
            }),
        };
        match config.and_then(|config| Ok(serde_json::to_string(&config)?)) {
            Ok(body) => {
                let reply = NsmMessage::new(&self.name, requester, crate::message::Notification::DbSet.id())
                    .with_data(body);
                self.bus.send(reply).await
            }
            Err(e) => {
                self.reply_error(Some(requester), &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Store a configuration pushed with DBSET, replacing any previous revision.
    pub async fn handle_dbset(&mut self, requester: &str, body: &str) -> AppResult<RunConfig> {
        let stored = match serde_json::from_str::<RunConfig>(body) {
            Ok(mut config) => {
                config.node = self.name.clone();
                self.store.save_config(&config, true).await
            }
            Err(e) => Err(DaqError::Decode(format!("DBSET body: {e}"))),
        };
        match stored {
            Ok(config) => {
                info!(node = %self.name, config = %config.name, revision = config.revision, "Configuration stored");
                self.send(NsmMessage::ok(&self.name, requester, self.state)).await;
                Ok(config)
            }
            Err(e) => {
                self.reply_error(Some(requester), &e.to_string()).await;
                Err(e)
            }
        }
    }

    fn recipients(&self, requester: Option<&str>) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for to in requester.into_iter().chain(self.observers.iter().map(String::as_str)) {
            if to != self.name && !targets.iter().any(|t| t == to) {
                targets.push(to.to_string());
            }
        }
        targets
    }

    async fn notify_state(&self, requester: Option<&str>) {
        for to in self.recipients(requester) {
            self.send(NsmMessage::ok(&self.name, &to, self.state)).await;
        }
    }

    /// Synchronous ERROR reply to whoever asked.
    pub async fn reply_error(&self, requester: Option<&str>, text: &str) {
        if let Some(to) = requester {
            if to != self.name {
                self.send(NsmMessage::error(&self.name, to, text)).await;
            }
        }
    }

    /// Send a notification. Transport failures are logged and never affect the state.
    async fn send(&self, msg: NsmMessage) {
        let to = msg.to.clone();
        if let Err(e) = self.bus.send(msg).await {
            warn!(node = %self.name, to = %to, error = %e, "Notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Inbox, LocalBus};
    use crate::message::Inbound;
    use crate::node::{SimulatedNode, SimulatedControl};
    use crate::store::MemoryConfigStore;
    use serde_json::json;
    use std::time::Duration;

    fn node(bus: &LocalBus) -> (NodeController, SimulatedControl) {
        let sim = SimulatedNode::new();
        let control = sim.control();
        let store = MemoryConfigStore::new().with(RunConfig::new(
            "physics",
            "cpr001",
            json!({ "threshold": 12 }),
        ));
        let controller = NodeController::new(
            "cpr001",
            Box::new(sim),
            Arc::new(bus.clone()),
            Arc::new(store),
        )
        .with_default_config("physics");
        (controller, control)
    }

    async fn ready(controller: &mut NodeController) {
        controller.initialize().await;
        controller
            .handle_command(RcCommand::Load, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(controller.state(), RcState::Ready);
    }

    #[tokio::test]
    async fn initialize_passes_through_configuring() {
        let bus = LocalBus::default();
        let (mut controller, control) = node(&bus);
        assert_eq!(controller.state(), RcState::Off);
        assert_eq!(controller.initialize().await, RcState::NotReady);
        assert_eq!(control.calls(), vec!["configure"]);
    }

    #[tokio::test]
    async fn load_from_ready_reports_loading_then_ready() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("master");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;

        let state = controller
            .handle_command(RcCommand::Load, &Payload::text("physics"), Some("master"))
            .await
            .unwrap();
        assert_eq!(state, RcState::Ready);
        assert_eq!(control.calls().last().map(String::as_str), Some("load physics"));

        let mut seen = Vec::new();
        while let Some(msg) = inbox.wait(Duration::from_millis(10)).await.unwrap() {
            if let Inbound::Ok { state } = msg.decode() {
                seen.push(state);
            }
        }
        assert_eq!(seen, vec![RcState::Loading, RcState::Ready]);
        assert_eq!(controller.status().snapshot().config_id, 1);
    }

    #[tokio::test]
    async fn rejected_command_invokes_no_hook() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("master");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;
        controller
            .handle_command(
                RcCommand::Start,
                &Payload::start(None, &OperatorAnnotation::new("shifter", "cosmics")),
                None,
            )
            .await
            .unwrap();
        let calls = control.calls().len();

        let err = controller
            .handle_command(RcCommand::Start, &Payload::default(), Some("master"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::StateRejection { .. }));
        assert_eq!(controller.state(), RcState::Running);
        assert_eq!(control.calls().len(), calls);

        let reply = inbox.wait(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(matches!(reply.decode(), Inbound::Error { state: None, .. }));
    }

    #[tokio::test]
    async fn start_requires_annotation() {
        let bus = LocalBus::default();
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;
        let calls = control.calls().len();

        let err = controller
            .handle_command(RcCommand::Start, &Payload::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::MissingAnnotation));
        assert_eq!(controller.state(), RcState::Ready);
        assert_eq!(control.calls().len(), calls);
    }

    #[tokio::test]
    async fn start_allocates_run_and_resume_bumps_sub_run() {
        let bus = LocalBus::default();
        let (mut controller, _control) = node(&bus);
        ready(&mut controller).await;
        controller.set_annotation(OperatorAnnotation::new("shifter", "cosmics"));

        let payload = Payload {
            pars: vec![7, 42],
            data: String::new(),
        };
        controller
            .handle_command(RcCommand::Start, &payload, None)
            .await
            .unwrap();
        assert_eq!(controller.run(), RunIdentity::new(7, 42));

        controller
            .handle_command(RcCommand::Pause, &Payload::default(), None)
            .await
            .unwrap();
        controller
            .handle_command(RcCommand::Resume, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(controller.state(), RcState::Running);
        assert_eq!(controller.run().sub_run_number, 1);
        assert_eq!(controller.status().snapshot().sub_run_number, 1);
    }

    #[tokio::test]
    async fn missing_config_is_rejected_without_state_change() {
        let bus = LocalBus::default();
        let (mut controller, _control) = node(&bus);
        controller.initialize().await;
        let err = controller
            .handle_command(RcCommand::Load, &Payload::text("nonexistent"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ConfigNotFound { .. }));
        assert_eq!(controller.state(), RcState::NotReady);
    }

    #[tokio::test]
    async fn hook_failure_moves_to_error_and_abort_recovers() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("master");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;

        control.fail_next("trigger link down");
        controller.set_annotation(OperatorAnnotation::new("shifter", "cosmics"));
        let state = controller
            .handle_command(RcCommand::Start, &Payload::default(), Some("master"))
            .await
            .unwrap();
        assert_eq!(state, RcState::Error);

        let mut texts = Vec::new();
        while let Some(msg) = inbox.wait(Duration::from_millis(10)).await.unwrap() {
            if let Inbound::Error { text, state } = msg.decode() {
                assert_eq!(state, Some(RcState::Error));
                texts.push(text);
            }
        }
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("hook failed"), "{}", texts[0]);
        assert!(texts[0].contains("trigger link down"));

        let state = controller
            .handle_command(RcCommand::Abort, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(state, RcState::NotReady);
    }

    #[tokio::test]
    async fn cancelled_pause_keeps_running() {
        let bus = LocalBus::default();
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;
        controller.set_annotation(OperatorAnnotation::new("shifter", "cosmics"));
        controller
            .handle_command(RcCommand::Start, &Payload::default(), None)
            .await
            .unwrap();

        control.cancel_next();
        let state = controller
            .handle_command(RcCommand::Pause, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(state, RcState::Running);
    }

    #[tokio::test]
    async fn boot_detaches_config() {
        let bus = LocalBus::default();
        let (mut controller, _control) = node(&bus);
        ready(&mut controller).await;
        assert!(controller.config().is_some());
        controller
            .handle_command(RcCommand::Boot, &Payload::text("fw-v2"), None)
            .await
            .unwrap();
        assert_eq!(controller.state(), RcState::NotReady);
        assert!(controller.config().is_none());
    }

    #[tokio::test]
    async fn statecheck_replies_with_current_state() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("console");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;
        let calls = control.calls().len();

        controller
            .handle_command(RcCommand::StateCheck, &Payload::default(), Some("console"))
            .await
            .unwrap();
        let reply = inbox.wait(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(reply.decode(), Inbound::Ok { state: RcState::Ready });
        assert_eq!(control.calls().len(), calls);
    }

    #[tokio::test]
    async fn dbget_and_dbset_round_trip_through_store() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("console");
        let (mut controller, _control) = node(&bus);
        controller.initialize().await;

        controller.handle_dbget("console", Some("physics")).await.unwrap();
        let reply = inbox.wait(Duration::from_millis(10)).await.unwrap().unwrap();
        let Inbound::DbSet { body } = reply.decode() else {
            panic!("expected DBSET reply");
        };

        let stored = controller.handle_dbset("console", &body).await.unwrap();
        assert_eq!(stored.revision, 2);
        assert!(controller.handle_dbget("console", Some("beam")).await.is_err());
    }

    #[tokio::test]
    async fn trigft_reloads_through_loading() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("master");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;

        let state = controller
            .handle_command(RcCommand::TrigFt, &Payload::default(), Some("master"))
            .await
            .unwrap();
        assert_eq!(state, RcState::Ready);
        assert_eq!(control.calls().last().map(String::as_str), Some("trigft physics"));

        let mut seen = Vec::new();
        while let Some(msg) = inbox.wait(Duration::from_millis(10)).await.unwrap() {
            if let Inbound::Ok { state } = msg.decode() {
                seen.push(state);
            }
        }
        assert_eq!(seen, vec![RcState::Loading, RcState::Ready]);
    }

    #[tokio::test]
    async fn start_without_config_is_rejected_and_keeps_annotation() {
        let bus = LocalBus::default();
        let (mut controller, control) = node(&bus);
        controller.initialize().await;
        controller
            .handle_command(RcCommand::Recover, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(controller.state(), RcState::Ready);
        assert!(controller.config().is_none());
        let calls = control.calls().len();

        let payload = Payload::start(Some((4, 2)), &OperatorAnnotation::new("night", "beam test"));
        let err = controller
            .handle_command(RcCommand::Start, &payload, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ConfigNotFound { .. }), "{err}");
        assert_eq!(controller.state(), RcState::Ready);
        assert_eq!(controller.annotation(), &OperatorAnnotation::default());
        assert_eq!(controller.run(), RunIdentity::default());
        assert_eq!(control.calls().len(), calls);
    }

    #[tokio::test]
    async fn exhausted_run_numbers_reject_start() {
        let bus = LocalBus::default();
        let mut inbox = bus.attach("console");
        let (mut controller, control) = node(&bus);
        ready(&mut controller).await;
        controller.set_annotation(OperatorAnnotation::new("shifter", "cosmics"));

        let last = Payload {
            pars: vec![1, i32::MAX],
            data: String::new(),
        };
        controller
            .handle_command(RcCommand::Start, &last, None)
            .await
            .unwrap();
        controller
            .handle_command(RcCommand::Stop, &Payload::default(), None)
            .await
            .unwrap();
        let calls = control.calls().len();

        let err = controller
            .handle_command(RcCommand::Start, &Payload::default(), Some("console"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::RunNumbersExhausted(_)), "{err}");
        assert_eq!(controller.state(), RcState::Ready);
        assert_eq!(controller.run().run_number, i32::MAX);
        assert_eq!(control.calls().len(), calls);
        let reply = inbox.wait(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(reply.data.contains("run numbers exhausted"), "{}", reply.data);

        // The node keeps serving commands.
        let state = controller
            .handle_command(RcCommand::Load, &Payload::default(), None)
            .await
            .unwrap();
        assert_eq!(state, RcState::Ready);
    }

    #[tokio::test]
    async fn exhausted_sub_runs_reject_resume() {
        let bus = LocalBus::default();
        let (mut controller, _control) = node(&bus);
        ready(&mut controller).await;
        controller.set_annotation(OperatorAnnotation::new("shifter", "cosmics"));
        controller
            .handle_command(RcCommand::Start, &Payload::default(), None)
            .await
            .unwrap();
        let last_sub = Payload {
            pars: vec![i32::MAX],
            data: String::new(),
        };
        for (command, payload) in [
            (RcCommand::Pause, Payload::default()),
            (RcCommand::Resume, last_sub),
            (RcCommand::Pause, Payload::default()),
        ] {
            controller.handle_command(command, &payload, None).await.unwrap();
        }

        let err = controller
            .handle_command(RcCommand::Resume, &Payload::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::RunNumbersExhausted(_)));
        assert_eq!(controller.state(), RcState::Paused);
        assert_eq!(controller.run().sub_run_number, i32::MAX);
    }

    #[tokio::test]
    async fn subordinate_failure_outside_a_transition_forces_error() {
        let bus = LocalBus::default();
        let mut console = bus.attach("console");
        let store = MemoryConfigStore::new();
        let mut controller = NodeController::new(
            "master",
            Box::new(crate::node::MasterCallback::new(vec!["ttd".into()])),
            Arc::new(bus.clone()),
            Arc::new(store),
        )
        .with_observers(vec!["console".into()]);
        controller.initialize().await;
        while console.wait(Duration::from_millis(10)).await.unwrap().is_some() {}

        controller.on_node_error("ttd", "hook failed: ttd: busy").await;
        assert_eq!(controller.state(), RcState::Error);
        let msg = console.wait(Duration::from_millis(10)).await.unwrap().unwrap();
        match msg.decode() {
            Inbound::Error { text, state } => {
                assert_eq!(state, Some(RcState::Error));
                assert!(text.contains("ttd failed"), "{text}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_failure_leaves_state_alone() {
        let bus = LocalBus::default();
        let (controller, _control) = node(&bus);
        let mut controller = controller.with_observers(vec!["gone".into()]);
        bus.record_deliveries();
        ready(&mut controller).await;
        assert_eq!(controller.state(), RcState::Ready);
        assert!(bus.delivered().is_empty());
    }
}
