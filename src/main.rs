//! daq_runcontrol - run-control for a distributed data-acquisition system
//!
//! # Configuration
//!
//! Settings are read from `config/runcontrol.toml` (or `--config`) and
//! `RUNCONTROL_*` environment variables; see [`daq_runcontrol::config`].
//!
//! # Subcommands
//!
//! - `session` (default): launch the configured master and simulated
//!   subordinates in-process and attach an interactive console on stdin.
//! - `table`: print the command availability table.
//! - `check-config`: load, validate and print the effective configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_runcontrol::bus::LocalBus;
use daq_runcontrol::command::{is_available, Availability, ALL_COMMANDS};
use daq_runcontrol::config::{RcConfig, DEFAULT_CONFIG_PATH};
use daq_runcontrol::console::{run_console, RcClient};
use daq_runcontrol::logging;
use daq_runcontrol::session::Session;
use daq_runcontrol::state::ALL_STATES;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Run-control for a distributed data-acquisition system
#[derive(Parser, Debug)]
#[command(name = "daq_runcontrol")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch nodes in-process and attach an interactive console
    Session,
    /// Print the command availability table
    Table,
    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RcConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init_from_config(&config.application);

    match args.command.unwrap_or(Command::Session) {
        Command::Session => session(&config).await,
        Command::Table => print_table(&mut std::io::stdout()),
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn session(config: &RcConfig) -> Result<()> {
    let bus = LocalBus::new(config.dispatcher.mailbox_capacity);
    let inbox = bus.attach(config.console.name.as_str());
    let client = RcClient::new(
        config.console.name.as_str(),
        config.node.name.as_str(),
        Arc::new(bus.clone()),
    )?;

    let session = Session::launch(config, bus).await?;
    info!(console = %config.console.name, "Console ready, type QUIT to leave");

    let input = BufReader::new(std::io::stdin());
    run_console(client, inbox, input, &mut std::io::stdout()).await?;

    session.shutdown().await?;
    Ok(())
}

fn print_table(out: &mut impl Write) -> Result<()> {
    write!(out, "{:<12}", "")?;
    for command in ALL_COMMANDS {
        write!(out, "{:<11}", command.label())?;
    }
    writeln!(out)?;
    for state in ALL_STATES {
        write!(out, "{:<12}", state.label())?;
        for command in ALL_COMMANDS {
            let mark = match is_available(command, state) {
                Availability::Suggested => "suggested",
                Availability::Enabled => "enabled",
                Availability::Disabled => "-",
            };
            write!(out, "{mark:<11}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
