// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # meshbus CLI
//!
//! The `meshbus` binary runs a mesh node for one broker domain and manages
//! its configuration.
//!
//! ## Commands
//!
//! - `meshbus node run [--domain NAME]` - Run a node in the foreground
//! - `meshbus broker run [--listen ADDR]` - Run the TCP pub/sub broker
//! - `meshbus config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use meshbus_cli::commands::{self, BrokerCommand, ConfigCommand, NodeCommand};
use meshbus_cli::logging;

/// meshbus - collaboration bus for independent agents
#[derive(Parser)]
#[command(name = "meshbus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MESHBUS_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MESHBUS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format (text, json)
    #[arg(long, global = true, env = "MESHBUS_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mesh node operations
    #[command(name = "node")]
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Pub/sub broker shared by nodes and agent processes
    #[command(name = "broker")]
    Broker {
        #[command(subcommand)]
        command: BrokerCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = logging::resolve(cli.log_level.clone(), cli.log_format.clone(), cli.config.clone())?;
    logging::init(&settings)?;

    match cli.command {
        Some(Commands::Node { command }) => commands::node::handle_command(command, cli.config).await,
        Some(Commands::Broker { command }) => commands::broker::handle_command(command, cli.config).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
