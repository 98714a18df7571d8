//! Bridge diagnostics CLI.
//!
//! Small operational surface for bringing a rig up: enumerate MIDI ports,
//! prove the host script answers, poke the discovery/resolution path and
//! tail render detection. The MCP-facing adapter lives elsewhere; this
//! binary exists so a human can debug the cabling without it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flbridge::{
    list_input_ports, list_output_ports, AwaitOutcome, BridgeSession, PluginAddress,
};
use flproto::{command_schema, CommandContract, TimeoutClass};

#[derive(Parser, Debug)]
#[command(version, about = "FL Studio MIDI bridge diagnostics", long_about = None)]
struct Cli {
    /// Config file (overrides discovery).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available MIDI endpoints
    Ports,

    /// Print the published command table
    Contracts {
        /// Emit the JSON schema of the command surface instead
        #[arg(long)]
        schema: bool,
    },

    /// Handshake with the host and report round-trip time
    Ping,

    /// Query transport state
    State,

    /// Enumerate a plugin's parameters
    Discover {
        /// Channel index
        index: u32,
        /// Effect slot, or -1 for the generator
        #[arg(default_value_t = -1, allow_hyphen_values = true)]
        slot: i32,
    },

    /// Resolve a symbolic parameter name
    Resolve {
        index: u32,
        #[arg(allow_hyphen_values = true)]
        slot: i32,
        name: String,
    },

    /// Write a parameter by symbolic name (absolute value in [0,1])
    SetParam {
        index: u32,
        #[arg(allow_hyphen_values = true)]
        slot: i32,
        name: String,
        value: f64,
    },

    /// Wait for the next render to land and stabilise
    Watch {
        /// Give up after this many seconds
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("FLBRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // These two need no host connection.
    match cli.command {
        Commands::Ports => return list_ports(),
        Commands::Contracts { schema } => return print_contracts(schema),
        _ => {}
    }

    let (config, sources) = flconf::load(cli.config.as_deref()).context("loading config")?;
    for file in &sources.files {
        tracing::debug!("config file: {}", file.display());
    }

    let session = BridgeSession::connect(config)
        .await
        .context("connecting to host")?;

    let result = run_command(&session, cli.command).await;
    session.shutdown().await;
    result
}

fn list_ports() -> Result<()> {
    println!("MIDI outputs (request candidates):");
    for port in list_output_ports()? {
        println!("  [{}] {}", port.index, port.name);
    }
    println!("MIDI inputs (response candidates):");
    for port in list_input_ports()? {
        println!("  [{}] {}", port.index, port.name);
    }
    Ok(())
}

fn print_contracts(schema: bool) -> Result<()> {
    if schema {
        println!("{}", serde_json::to_string_pretty(&command_schema())?);
        return Ok(());
    }
    for contract in CommandContract::all() {
        let class = match contract.timeout_class {
            TimeoutClass::Interactive => "interactive",
            TimeoutClass::Discovery => "discovery",
        };
        let guard = if contract.mutating { "guarded" } else { "read-only" };
        println!(
            "{:<26} {:<11} {:<9} {}",
            contract.name, class, guard, contract.description
        );
    }
    Ok(())
}

async fn run_command(session: &BridgeSession, command: Commands) -> Result<()> {
    match command {
        Commands::Ports | Commands::Contracts { .. } => {
            unreachable!("handled before connecting")
        }

        Commands::Ping => {
            let started = std::time::Instant::now();
            let state = session.transport_state().await?;
            println!(
                "host answered in {:?} (client id {:#04x}, playing={}, recording={})",
                started.elapsed(),
                session.client_id(),
                state.playing,
                state.recording,
            );
            println!(
                "health: {} (last success {}s ago)",
                session.health().state().as_str(),
                session.health().seconds_since_success().await.unwrap_or(0),
            );
        }

        Commands::State => {
            let state = session.transport_state().await?;
            println!(
                "playing={} recording={} position_ticks={}",
                state.playing, state.recording, state.position_ticks
            );
        }

        Commands::Discover { index, slot } => {
            let address = PluginAddress::new(index, slot);
            let inventory = session.discover_plugin(address).await?;
            println!(
                "{} at {} ({} named parameters)",
                inventory.plugin_name,
                address,
                inventory.parameters.len()
            );
            for param in &inventory.parameters {
                println!("  [{:>5}] {} = {:.4}", param.index, param.name, param.value);
            }
        }

        Commands::Resolve { index, slot, name } => {
            let address = PluginAddress::new(index, slot);
            let param = session.resolve_param(address, &name).await?;
            println!(
                "{:?} -> [{}] {} = {:.4}",
                name, param.index, param.name, param.value
            );
        }

        Commands::SetParam { index, slot, name, value } => {
            let address = PluginAddress::new(index, slot);
            let ack = session.set_param(address, &name, value).await?;
            match ack.read_back {
                Some(read_back) => println!("written {value:.4}, host reads back {read_back:.4}"),
                None => println!("written {value:.4}"),
            }
            if let Some(text) = ack.value_string {
                println!("host displays: {text}");
            }
        }

        Commands::Watch { timeout } => {
            println!("waiting for a render (up to {timeout}s)...");
            match session
                .await_render(Some(Duration::from_secs(timeout)))
                .await?
            {
                AwaitOutcome::Detected(artifact) => {
                    println!("detected {} at {}", artifact.file_name, artifact.path.display());
                }
                AwaitOutcome::Abandoned => {
                    println!("no render within {timeout}s (detection continues passively)");
                }
            }
            let registered = session.renders().await;
            println!("session registry holds {} artifact(s)", registered.len());
            for artifact in registered {
                println!("  {} ({})", artifact.file_name, artifact.detected_at);
            }
        }
    }
    Ok(())
}
