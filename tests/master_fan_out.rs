//! Master node coordinating simulated subordinates.

use daq_runcontrol::bus::{Bus, Inbox, LocalBus, LocalInbox};
use daq_runcontrol::command::RcCommand;
use daq_runcontrol::config::{DispatcherConfig, NodeConfig, NodeRole, RcConfig};
use daq_runcontrol::dispatcher::{Dispatcher, NodeHandle};
use daq_runcontrol::message::{Inbound, NsmMessage, Payload};
use daq_runcontrol::node::{MasterCallback, NodeController, SimulatedNode, SimulatedControl};
use daq_runcontrol::run::{OperatorAnnotation, RunIdentity};
use daq_runcontrol::session::Session;
use daq_runcontrol::state::RcState;
use daq_runcontrol::store::{MemoryConfigStore, RunConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn session_config(subordinates: &[&str]) -> RcConfig {
    RcConfig {
        node: NodeConfig {
            name: "master".into(),
            role: NodeRole::Master,
            subordinates: subordinates.iter().map(|s| s.to_string()).collect(),
            observers: vec!["console".into()],
            default_config: Some("physics".into()),
        },
        dispatcher: DispatcherConfig {
            poll_timeout_ms: 5,
            monitor_interval_ms: 20,
            mailbox_capacity: 100,
        },
        ..RcConfig::default()
    }
}

async fn command(bus: &LocalBus, to: &str, command: RcCommand, payload: Payload) {
    let msg = NsmMessage::command("console", to, command)
        .with_pars(payload.pars)
        .with_data(payload.data);
    bus.send(msg).await.unwrap();
}

fn annotated_start() -> Payload {
    Payload::start(None, &OperatorAnnotation::new("shifter", "cosmics"))
}

#[tokio::test]
async fn full_lifecycle_reaches_every_subordinate() {
    let bus = LocalBus::default();
    let _console = bus.attach("console");
    let mut session = Session::launch(&session_config(&["ttd", "cpr001"]), bus.clone())
        .await
        .unwrap();
    session
        .master()
        .wait_for(RcState::NotReady, WAIT)
        .await
        .unwrap();

    let steps = [
        (RcCommand::Load, Payload::text("physics"), RcState::Ready),
        (RcCommand::Start, annotated_start(), RcState::Running),
        (RcCommand::Pause, Payload::default(), RcState::Paused),
        (RcCommand::Resume, Payload::default(), RcState::Running),
        (RcCommand::Stop, Payload::default(), RcState::Ready),
    ];
    for (cmd, payload, expected) in steps {
        command(&bus, "master", cmd, payload).await;
        session.master().wait_for(expected, WAIT).await.unwrap();
        for sub in ["ttd", "cpr001"] {
            session
                .subordinate(sub)
                .unwrap()
                .wait_for(expected, WAIT)
                .await
                .unwrap();
        }
    }

    let controllers = session.shutdown().await.unwrap();
    for name in ["master", "ttd", "cpr001"] {
        assert!(!bus.is_connected(name), "{name} still attached");
    }
    let expected = RunIdentity {
        sub_run_number: 1,
        ..RunIdentity::new(0, 1)
    };
    for controller in &controllers {
        assert_eq!(controller.run(), expected, "{}", controller.name());
        assert_eq!(controller.config().map(|c| c.name.as_str()), Some("physics"));
    }
}

#[tokio::test]
async fn master_mirror_tracks_subordinates() {
    let bus = LocalBus::default();
    let mut console = bus.attach("console");
    let mut session = Session::launch(&session_config(&["ttd", "cpr001"]), bus.clone())
        .await
        .unwrap();
    session
        .master()
        .wait_for(RcState::NotReady, WAIT)
        .await
        .unwrap();
    command(&bus, "master", RcCommand::Load, Payload::text("physics")).await;
    session.master().wait_for(RcState::Ready, WAIT).await.unwrap();

    let record = session.master().status().snapshot();
    assert_eq!(record.node_count, 2);
    assert!(record.node_states().all(|s| s == RcState::Ready));
    assert_eq!(record.config_id, 1);

    let mut seen = Vec::new();
    while let Some(msg) = console.wait(Duration::from_millis(50)).await.unwrap() {
        if let Inbound::Ok { state } = msg.decode() {
            seen.push(state);
        }
    }
    assert_eq!(
        seen,
        vec![
            RcState::Configuring,
            RcState::NotReady,
            RcState::Loading,
            RcState::Ready
        ]
    );
    session.shutdown().await.unwrap();
}

struct Rig {
    bus: LocalBus,
    console: LocalInbox,
    master: NodeHandle,
    subordinates: Vec<(NodeHandle, SimulatedControl)>,
}

/// Master with simulated subordinates; `ghosts` are subordinates nobody runs.
async fn rig(names: &[&str], ghosts: &[&str]) -> Rig {
    let bus = LocalBus::default();
    let console = bus.attach("console");
    let timing = (Duration::from_millis(5), Duration::from_secs(60));

    let mut subordinates = Vec::new();
    for name in names {
        let sim = SimulatedNode::new();
        let control = sim.control();
        let store = MemoryConfigStore::new().with(RunConfig::new("physics", *name, json!({})));
        let controller =
            NodeController::new(*name, Box::new(sim), Arc::new(bus.clone()), Arc::new(store));
        let mut handle = Dispatcher::new(controller, bus.attach(*name))
            .with_timing(timing.0, timing.1)
            .spawn();
        handle.wait_for(RcState::NotReady, WAIT).await.unwrap();
        subordinates.push((handle, control));
    }

    let all: Vec<String> = names.iter().chain(ghosts).map(|s| s.to_string()).collect();
    let store = MemoryConfigStore::new().with(RunConfig::new("physics", "master", json!({})));
    let controller = NodeController::new(
        "master",
        Box::new(MasterCallback::new(all)),
        Arc::new(bus.clone()),
        Arc::new(store),
    )
    .with_observers(vec!["console".into()]);
    let mut master = Dispatcher::new(controller, bus.attach("master"))
        .with_timing(timing.0, timing.1)
        .spawn();
    master.wait_for(RcState::NotReady, WAIT).await.unwrap();

    Rig {
        bus,
        console,
        master,
        subordinates,
    }
}

/// Drain the console; every ERROR seen must carry the master's new state.
async fn console_errors(console: &mut LocalInbox) -> Vec<String> {
    let mut texts = Vec::new();
    while let Some(msg) = console.wait(Duration::from_millis(50)).await.unwrap() {
        if let Inbound::Error { text, state } = msg.decode() {
            assert_eq!(state, Some(RcState::Error), "{text}");
            texts.push(text);
        }
    }
    texts
}

/// Collect OK states from the console until `last` arrives.
async fn console_states_until(console: &mut LocalInbox, last: RcState) -> Vec<RcState> {
    let mut seen = Vec::new();
    loop {
        let msg = console.wait(WAIT).await.unwrap().expect("console timed out");
        if let Inbound::Ok { state } = msg.decode() {
            seen.push(state);
            if state == last {
                return seen;
            }
        }
    }
}

#[tokio::test]
async fn subordinate_failure_puts_master_in_error_and_recover_clears_it() {
    let mut rig = rig(&["ttd", "cpr001"], &[]).await;
    command(&rig.bus, "master", RcCommand::Load, Payload::text("physics")).await;
    rig.master.wait_for(RcState::Ready, WAIT).await.unwrap();

    rig.subordinates[1].1.fail_next("FEE timeout");
    command(&rig.bus, "master", RcCommand::Start, annotated_start()).await;
    rig.master.wait_for(RcState::Error, WAIT).await.unwrap();
    rig.subordinates[1]
        .0
        .wait_for(RcState::Error, WAIT)
        .await
        .unwrap();

    let texts = console_errors(&mut rig.console).await;
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("cpr001"), "{}", texts[0]);
    assert!(texts[0].contains("FEE timeout"), "{}", texts[0]);

    let states: Vec<RcState> = rig.master.status().snapshot().node_states().collect();
    assert_eq!(states[1], RcState::Error);

    command(&rig.bus, "master", RcCommand::Recover, Payload::default()).await;
    rig.master.wait_for(RcState::Ready, WAIT).await.unwrap();
    for (handle, _) in &mut rig.subordinates {
        handle.wait_for(RcState::Ready, WAIT).await.unwrap();
    }
}

#[tokio::test]
async fn unreachable_subordinate_fails_the_command() {
    let mut rig = rig(&["ttd"], &["cpr009"]).await;
    command(&rig.bus, "master", RcCommand::Load, Payload::text("physics")).await;
    rig.master.wait_for(RcState::Error, WAIT).await.unwrap();

    let record = rig.master.status().snapshot();
    let states: Vec<RcState> = record.node_states().collect();
    assert_eq!(states[1], RcState::Unknown);

    let master = rig.master.shutdown().await.unwrap();
    assert_eq!(master.state(), RcState::Error);
    assert!(master.config().is_none());
}

#[tokio::test]
async fn recover_overrides_a_pending_transition() {
    let mut rig = rig(&["ttd"], &[]).await;
    rig.subordinates[0]
        .1
        .set_latency(Duration::from_millis(200));

    command(&rig.bus, "master", RcCommand::Load, Payload::text("physics")).await;
    command(&rig.bus, "master", RcCommand::Recover, Payload::default()).await;
    rig.master.wait_for(RcState::Ready, WAIT).await.unwrap();

    let mut seen = Vec::new();
    while let Some(msg) = rig.console.wait(Duration::from_millis(50)).await.unwrap() {
        if let Inbound::Ok { state } = msg.decode() {
            seen.push(state);
        }
    }
    assert_eq!(
        seen,
        vec![
            RcState::Configuring,
            RcState::NotReady,
            RcState::Loading,
            RcState::Recovering,
            RcState::Ready
        ]
    );
    assert_eq!(rig.subordinates[0].0.state(), RcState::Ready);
    assert_eq!(
        rig.subordinates[0].1.calls().last().map(String::as_str),
        Some("load physics")
    );
    let master = rig.master.shutdown().await.unwrap();
    assert_eq!(master.pending(), None);
}

#[tokio::test]
async fn subordinate_failing_to_pause_puts_master_in_error() {
    let mut rig = rig(&["ttd", "cpr001"], &[]).await;
    command(&rig.bus, "master", RcCommand::Load, Payload::text("physics")).await;
    rig.master.wait_for(RcState::Ready, WAIT).await.unwrap();
    command(&rig.bus, "master", RcCommand::Start, annotated_start()).await;
    rig.master.wait_for(RcState::Running, WAIT).await.unwrap();
    for (handle, _) in &mut rig.subordinates {
        handle.wait_for(RcState::Running, WAIT).await.unwrap();
    }

    rig.subordinates[1].1.fail_next("FEE timeout");
    command(&rig.bus, "master", RcCommand::Pause, Payload::default()).await;
    rig.master.wait_for(RcState::Error, WAIT).await.unwrap();
    rig.subordinates[0]
        .0
        .wait_for(RcState::Paused, WAIT)
        .await
        .unwrap();

    let texts = console_errors(&mut rig.console).await;
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("cpr001 failed"), "{}", texts[0]);
    assert!(texts[0].contains("FEE timeout"), "{}", texts[0]);
    let states: Vec<RcState> = rig.master.status().snapshot().node_states().collect();
    assert_eq!(states[1], RcState::Error);

    let master = rig.master.shutdown().await.unwrap();
    assert_eq!(master.state(), RcState::Error);
}

#[tokio::test]
async fn trigft_reaches_every_subordinate() {
    let mut rig = rig(&["ttd", "cpr001"], &[]).await;
    command(&rig.bus, "master", RcCommand::Load, Payload::text("physics")).await;
    console_states_until(&mut rig.console, RcState::Ready).await;

    command(&rig.bus, "master", RcCommand::TrigFt, Payload::text("physics")).await;
    let seen = console_states_until(&mut rig.console, RcState::Ready).await;
    assert_eq!(seen, vec![RcState::Loading, RcState::Ready]);

    for (handle, control) in &mut rig.subordinates {
        handle.wait_for(RcState::Ready, WAIT).await.unwrap();
        assert_eq!(
            control.calls().last().map(String::as_str),
            Some("trigft physics")
        );
    }
}
