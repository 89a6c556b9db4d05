//! Operator console.
//!
//! [`ConsoleCommand`] is the parsed command surface. [`RcClient`] sends
//! commands on behalf of the operator after checking them against its own
//! mirror of node states, so an obviously invalid request never leaves the
//! console. The mirror is fed by notifications and may be stale; the node
//! repeats the check authoritatively.
//!
//! [`run_console`] merges operator input (read on a dedicated thread) and bus
//! notifications (read on a task) into one channel consumed by a single loop,
//! so the mirror has exactly one writer.

use crate::bus::{Bus, Inbox};
use crate::command::{is_available, RcCommand};
use crate::error::{AppResult, DaqError};
use crate::message::{Inbound, Notification, NsmMessage, Payload};
use crate::run::OperatorAnnotation;
use crate::state::RcState;
use crate::status::StatusAggregator;
use crate::store::RunConfig;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// QUIT or EXIT.
    Quit,
    /// Show mirrored states, or one node's.
    Print {
        /// Node to show; all nodes and the annotation when `None`.
        node: Option<String>,
    },
    /// Set the operator names sent with START.
    EditOperators(String),
    /// Set the run comment sent with START.
    EditComment(String),
    /// Ask every mirrored node for its state.
    NsmGet,
    /// Fetch a configuration from the target.
    DbGet {
        /// Configuration name; the attached one when `None`.
        config: Option<String>,
    },
    /// Push the fetched configuration back, optionally renamed.
    DbSet {
        /// New name for the configuration.
        config: Option<String>,
    },
    /// A run-control command with its optional argument: the configuration
    /// name for LOAD and TRIGFT, the boot option for BOOT, otherwise the
    /// daughter node to address instead of the master.
    Rc {
        /// Command to send.
        command: RcCommand,
        /// Its argument.
        arg: Option<String>,
    },
}

impl ConsoleCommand {
    /// Parse a console line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> AppResult<Option<ConsoleCommand>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then(|| rest.to_string());
        let head = head.to_ascii_uppercase();

        let command = match head.as_str() {
            "QUIT" | "EXIT" => ConsoleCommand::Quit,
            "PRINT" => ConsoleCommand::Print { node: arg },
            "NSMGET" => ConsoleCommand::NsmGet,
            "DBGET" => ConsoleCommand::DbGet { config: arg },
            "DBSET" => ConsoleCommand::DbSet { config: arg },
            "EDIT" => {
                let (field, value) = match rest.split_once(char::is_whitespace) {
                    Some((field, value)) => (field.to_ascii_uppercase(), value.trim()),
                    None => (rest.to_ascii_uppercase(), ""),
                };
                if value.is_empty() {
                    return Err(DaqError::Usage(
                        "EDIT OPERATORS <name> | EDIT COMMENT <text>".into(),
                    ));
                }
                match field.as_str() {
                    "OPERATORS" => ConsoleCommand::EditOperators(value.to_string()),
                    "COMMENT" => ConsoleCommand::EditComment(value.to_string()),
                    _ => {
                        return Err(DaqError::Usage(
                            "EDIT OPERATORS <name> | EDIT COMMENT <text>".into(),
                        ))
                    }
                }
            }
            label => match RcCommand::from_label(label) {
                Some(command) => ConsoleCommand::Rc { command, arg },
                None => return Err(DaqError::UnknownCommand(head.clone())),
            },
        };
        Ok(Some(command))
    }
}

/// What the console loop should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleReply {
    /// Leave the loop.
    Quit,
    /// Print this and continue.
    Text(String),
}

/// Client side of the run-control protocol.
pub struct RcClient {
    name: String,
    target: String,
    bus: Arc<dyn Bus>,
    mirror: StatusAggregator,
    annotation: OperatorAnnotation,
    fetched: Option<RunConfig>,
}

impl RcClient {
    /// Client named `name` on the bus, addressing `target` by default.
    pub fn new(name: impl Into<String>, target: impl Into<String>, bus: Arc<dyn Bus>) -> AppResult<Self> {
        let target = target.into();
        let mirror = StatusAggregator::new();
        mirror.attach(target.as_str())?;
        Ok(Self {
            name: name.into(),
            target,
            bus,
            mirror,
            annotation: OperatorAnnotation::default(),
            fetched: None,
        })
    }

    /// Client name on the bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Annotation sent with the next START.
    pub fn annotation(&self) -> &OperatorAnnotation {
        &self.annotation
    }

    /// Last state reported by `node`, `UNKNOWN` if it never reported.
    pub fn mirrored_state(&self, node: &str) -> RcState {
        self.mirror.node_state(node).unwrap_or(RcState::Unknown)
    }

    /// Configuration received with the last DBSET reply.
    pub fn fetched_config(&self) -> Option<&RunConfig> {
        self.fetched.as_ref()
    }

    /// Check a command locally and send it. Nothing is sent when a check fails.
    ///
    /// A daughter node named in `arg` is mirrored from then on, but only once
    /// a command has actually been sent to it.
    pub async fn send_command(&mut self, command: RcCommand, arg: Option<&str>) -> AppResult<()> {
        let (to, payload) = match command {
            RcCommand::Load | RcCommand::TrigFt | RcCommand::Boot => {
                (self.target.clone(), Payload::text(arg.unwrap_or_default()))
            }
            RcCommand::Start => (
                self.destination(arg),
                Payload::start(None, &self.annotation),
            ),
            _ => (self.destination(arg), Payload::default()),
        };

        let state = self.mirrored_state(&to);
        if !is_available(command, state).permits() {
            return Err(DaqError::StateRejection { command, state });
        }
        if command == RcCommand::Start && !self.annotation.is_complete() {
            return Err(DaqError::MissingAnnotation);
        }

        let msg = NsmMessage::command(self.name.as_str(), to.as_str(), command)
            .with_pars(payload.pars)
            .with_data(payload.data);
        self.bus.send(msg).await?;

        if to != self.target {
            if let Err(e) = self.mirror.attach(to.as_str()) {
                warn!(node = %to, error = %e, "Daughter node not mirrored");
            }
        }
        Ok(())
    }

    fn destination(&self, arg: Option<&str>) -> String {
        arg.map_or_else(|| self.target.clone(), str::to_string)
    }

    /// Fold a notification into the mirror. Returns a line for the operator, if any.
    pub fn observe(&mut self, msg: &NsmMessage) -> Option<String> {
        match msg.decode() {
            Inbound::Ok { state } => {
                if let Err(e) = self.mirror.set_node_state(&msg.from, state) {
                    debug!(from = %msg.from, error = %e, "State report from unknown node");
                    return None;
                }
                Some(format!("{} : {}", msg.from, state))
            }
            Inbound::Error { text, state } => {
                if let Some(state) = state {
                    if let Err(e) = self.mirror.set_node_state(&msg.from, state) {
                        debug!(from = %msg.from, error = %e, "Error report from unknown node");
                    }
                }
                Some(format!("{} : ERROR {}", msg.from, text))
            }
            Inbound::DbSet { body } => match serde_json::from_str::<RunConfig>(&body) {
                Ok(config) => {
                    let line = format!(
                        "{} : configuration '{}' revision {}",
                        msg.from, config.name, config.revision
                    );
                    self.fetched = Some(config);
                    Some(line)
                }
                Err(e) => Some(format!("{} : unreadable configuration ({e})", msg.from)),
            },
            Inbound::Command { .. } | Inbound::DbGet { .. } | Inbound::Unknown { .. } => {
                warn!(from = %msg.from, id = msg.id, "Console ignores message");
                None
            }
        }
    }

    /// Execute a parsed console command.
    pub async fn execute(&mut self, command: ConsoleCommand) -> AppResult<ConsoleReply> {
        let text = match command {
            ConsoleCommand::Quit => return Ok(ConsoleReply::Quit),
            ConsoleCommand::Print { node } => self.render(node.as_deref()),
            ConsoleCommand::EditOperators(operators) => {
                self.annotation.operators = operators;
                format!("operators : {}", self.annotation.operators)
            }
            ConsoleCommand::EditComment(comment) => {
                self.annotation.comment = comment;
                format!("comment : {}", self.annotation.comment)
            }
            ConsoleCommand::NsmGet => {
                for node in self.mirror.node_names() {
                    let query = NsmMessage::command(self.name.as_str(), node, RcCommand::StateCheck);
                    self.bus.send(query).await?;
                }
                "state requested".to_string()
            }
            ConsoleCommand::DbGet { config } => {
                let msg = NsmMessage::new(self.name.as_str(), self.target.as_str(), Notification::DbGet.id())
                    .with_data(config.unwrap_or_default());
                self.bus.send(msg).await?;
                "configuration requested".to_string()
            }
            ConsoleCommand::DbSet { config } => {
                let mut body = self
                    .fetched
                    .clone()
                    .ok_or_else(|| DaqError::Usage("DBGET a configuration before DBSET".into()))?;
                if let Some(name) = config {
                    body.name = name;
                }
                let msg = NsmMessage::new(self.name.as_str(), self.target.as_str(), Notification::DbSet.id())
                    .with_data(serde_json::to_string(&body)?);
                self.bus.send(msg).await?;
                format!("configuration '{}' sent", body.name)
            }
            ConsoleCommand::Rc { command, arg } => {
                self.send_command(command, arg.as_deref()).await?;
                format!("{command} sent")
            }
        };
        Ok(ConsoleReply::Text(text))
    }

    fn render(&self, node: Option<&str>) -> String {
        match node {
            Some(node) => format!("{node} : {}", self.mirrored_state(node)),
            None => {
                let mut lines: Vec<String> = self
                    .mirror
                    .nodes()
                    .into_iter()
                    .map(|(name, state)| format!("{name} : {state}"))
                    .collect();
                lines.push(format!(
                    "operators : {}\ncomment : {}",
                    self.annotation.operators, self.annotation.comment
                ));
                lines.join("\n")
            }
        }
    }
}

/// Input merged from the operator and the bus.
#[derive(Debug)]
pub enum ConsoleEvent {
    /// A line typed by the operator.
    Line(String),
    /// A notification from the bus.
    Message(NsmMessage),
    /// Operator input reached its end.
    InputClosed,
}

/// Run an interactive session until QUIT or end of input.
pub async fn run_console<I, R, W>(mut client: RcClient, mut inbox: I, input: R, out: &mut W) -> AppResult<()>
where
    I: Inbox + 'static,
    R: BufRead + Send + 'static,
    W: Write,
{
    let (tx, mut rx) = mpsc::channel::<ConsoleEvent>(64);

    let line_tx = tx.clone();
    std::thread::spawn(move || {
        for line in input.lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(ConsoleEvent::Line(line)).is_err() {
                return;
            }
        }
        let _ = line_tx.blocking_send(ConsoleEvent::InputClosed);
    });

    let bus_task = tokio::spawn(async move {
        loop {
            match inbox.wait(Duration::from_millis(200)).await {
                Ok(Some(msg)) => {
                    if tx.send(ConsoleEvent::Message(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Console inbox closed");
                    break;
                }
            }
        }
    });

    while let Some(event) = rx.recv().await {
        match event {
            ConsoleEvent::Line(line) => {
                let reply = match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => client.execute(command).await,
                    Ok(None) => continue,
                    Err(e) => Err(e),
                };
                match reply {
                    Ok(ConsoleReply::Quit) => break,
                    Ok(ConsoleReply::Text(text)) => writeln!(out, "{text}")?,
                    Err(e) => writeln!(out, "{e}")?,
                }
            }
            ConsoleEvent::Message(msg) => {
                if let Some(text) = client.observe(&msg) {
                    writeln!(out, "{text}")?;
                }
            }
            ConsoleEvent::InputClosed => break,
        }
    }

    rx.close();
    bus_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    #[test]
    fn parse_surface() {
        assert_eq!(ConsoleCommand::parse("  ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("quit").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(
            ConsoleCommand::parse("PRINT ttd").unwrap(),
            Some(ConsoleCommand::Print {
                node: Some("ttd".into())
            })
        );
        assert_eq!(
            ConsoleCommand::parse("edit comment cosmic ray run").unwrap(),
            Some(ConsoleCommand::EditComment("cosmic ray run".into()))
        );
        assert_eq!(
            ConsoleCommand::parse("load physics").unwrap(),
            Some(ConsoleCommand::Rc {
                command: RcCommand::Load,
                arg: Some("physics".into())
            })
        );
        assert_eq!(
            ConsoleCommand::parse("DBGET").unwrap(),
            Some(ConsoleCommand::DbGet { config: None })
        );
    }

    #[test]
    fn missing_positional_is_usage_error() {
        for line in ["EDIT", "EDIT OPERATORS", "EDIT COMMENT   ", "EDIT COLOUR blue"] {
            assert!(
                matches!(ConsoleCommand::parse(line), Err(DaqError::Usage(_))),
                "{line}"
            );
        }
        assert!(matches!(
            ConsoleCommand::parse("LAUNCH"),
            Err(DaqError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn start_without_annotation_sends_nothing() {
        let bus = LocalBus::default();
        bus.record_deliveries();
        let _master = bus.attach("master");
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();
        client.observe(&NsmMessage::ok("master", "console", RcState::Ready));

        let err = client.send_command(RcCommand::Start, None).await.unwrap_err();
        assert!(matches!(err, DaqError::MissingAnnotation));
        assert!(bus.delivered().is_empty());
        assert_eq!(client.mirrored_state("master"), RcState::Ready);
    }

    #[tokio::test]
    async fn stale_mirror_rejects_locally() {
        let bus = LocalBus::default();
        bus.record_deliveries();
        let _master = bus.attach("master");
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();
        client.observe(&NsmMessage::ok("master", "console", RcState::Running));

        let err = client.send_command(RcCommand::Load, Some("physics")).await.unwrap_err();
        assert!(matches!(err, DaqError::StateRejection { .. }));
        client.send_command(RcCommand::Abort, None).await.unwrap();
        assert_eq!(bus.delivered().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_keeps_local_state() {
        let bus = LocalBus::default();
        let _master = bus.attach("master");
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();
        client.observe(&NsmMessage::ok("master", "console", RcState::Ready));
        client
            .execute(ConsoleCommand::EditOperators("shifter".into()))
            .await
            .unwrap();
        client
            .execute(ConsoleCommand::EditComment("cosmics".into()))
            .await
            .unwrap();

        bus.inject_next_failure();
        let err = client.send_command(RcCommand::Start, None).await.unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
        assert_eq!(client.mirrored_state("master"), RcState::Ready);
        assert!(client.annotation().is_complete());
    }

    #[tokio::test]
    async fn failure_report_updates_the_mirror() {
        let bus = LocalBus::default();
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();
        client.observe(&NsmMessage::ok("master", "console", RcState::Paused));

        let line = client.observe(&NsmMessage::error("master", "console", "PAUSE is not available"));
        assert!(line.is_some());
        assert_eq!(client.mirrored_state("master"), RcState::Paused);

        let line = client
            .observe(&NsmMessage::failure(
                "master",
                "console",
                RcState::Error,
                "cpr001 failed: FEE timeout",
            ))
            .unwrap();
        assert!(line.contains("FEE timeout"), "{line}");
        assert_eq!(client.mirrored_state("master"), RcState::Error);
    }

    #[tokio::test]
    async fn daughter_is_mirrored_only_after_a_send() {
        let bus = LocalBus::default();
        let _master = bus.attach("master");
        let _ttd = bus.attach("ttd");
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();

        // Unknown daughters only accept RECOVER, ABORT and STATECHECK.
        for typo in ["tdd", "ttdd"] {
            let err = client.send_command(RcCommand::Stop, Some(typo)).await.unwrap_err();
            assert!(matches!(err, DaqError::StateRejection { .. }));
        }
        let err = client
            .send_command(RcCommand::Abort, Some("cpr099"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Transport(_)));
        client
            .send_command(RcCommand::StateCheck, Some("ttd"))
            .await
            .unwrap();

        let ConsoleReply::Text(listing) = client
            .execute(ConsoleCommand::Print { node: None })
            .await
            .unwrap()
        else {
            panic!("expected text");
        };
        assert!(listing.contains("master : UNKNOWN"), "{listing}");
        assert!(listing.contains("ttd : UNKNOWN"), "{listing}");
        for absent in ["tdd", "ttdd", "cpr099"] {
            assert!(!listing.contains(absent), "{listing}");
        }

        client.observe(&NsmMessage::ok("ttd", "console", RcState::Ready));
        assert_eq!(client.mirrored_state("ttd"), RcState::Ready);
    }

    #[tokio::test]
    async fn dbset_requires_fetched_config() {
        let bus = LocalBus::default();
        let mut client = RcClient::new("console", "master", Arc::new(bus.clone())).unwrap();
        assert!(matches!(
            client.execute(ConsoleCommand::DbSet { config: None }).await,
            Err(DaqError::Usage(_))
        ));
    }
}
