//! CLI entry point for labcomm
//!
//! Runs a single transaction against the configured instrument, which is
//! handy for poking at hardware while writing a driver.
//!
//! # Usage
//!
//! ```bash
//! labcomm --config bench.toml query "PFBK X"
//! labcomm send "ENABLE X"
//! labcomm --mock query "*IDN?"
//! labcomm --config bench.toml check
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labcomm::config::{CommConfig, TargetConfig, DEFAULT_CONFIG_PATH};
use labcomm::{logging, Reply, ResilientTransport};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "labcomm")]
#[command(about = "Send commands to a lab instrument over a resilient link", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Talk to an in-memory echo link instead of the configured target
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a command and print the reply
    Query {
        /// Command text, without terminator
        command: String,
    },

    /// Send a command without waiting for a reply
    Send {
        /// Command text, without terminator
        command: String,
    },

    /// Load and validate the configuration, then print it
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CommConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if cli.mock {
        config.target = TargetConfig::Mock;
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Query { command } => query(&config, &command).await,
        Commands::Send { command } => send(&config, &command).await,
        Commands::Check => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn query(config: &CommConfig, command: &str) -> Result<()> {
    let transport = ResilientTransport::from_config(config)?;
    info!(endpoint = ?config.target, command, "Querying instrument");

    let reply = transport
        .execute(command.as_bytes())
        .await
        .with_context(|| format!("query {:?} failed", command))?;
    transport.close();

    match reply {
        Reply::Body(body) => println!("{}", String::from_utf8_lossy(&body)),
        Reply::NoBody => println!("(no reply)"),
    }
    Ok(())
}

async fn send(config: &CommConfig, command: &str) -> Result<()> {
    let transport = ResilientTransport::from_config(config)?;
    info!(endpoint = ?config.target, command, "Sending to instrument");

    transport
        .send_only(command.as_bytes())
        .await
        .with_context(|| format!("send {:?} failed", command))?;
    transport.close();
    Ok(())
}
