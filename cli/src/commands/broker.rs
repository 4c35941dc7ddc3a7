// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground pub/sub broker
//!
//! `meshbus broker run` serves the `tcp` transport backend: mesh nodes and
//! joined agent processes on other hosts share channels through it.

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meshbus_core::domain::mesh_config::MeshConfigManifest;
use meshbus_core::infrastructure::transport::TcpBroker;

use super::node::shutdown_signal;

const DEFAULT_LISTEN: &str = "127.0.0.1:7450";

#[derive(Subcommand)]
pub enum BrokerCommand {
    /// Run the broker in the foreground
    Run {
        /// Address to listen on (defaults to `spec.transport.broker`, then 127.0.0.1:7450)
        #[arg(long, env = "MESHBUS_BROKER_LISTEN")]
        listen: Option<String>,
    },
}

pub async fn handle_command(command: BrokerCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        BrokerCommand::Run { listen } => run(config_override, listen).await,
    }
}

async fn run(config_override: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let config = MeshConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    let listen = listen
        .or(config.spec.transport.broker)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let broker = TcpBroker::bind(&listen, config.spec.transport.channel_capacity)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(broker.run(shutdown.clone()));

    info!(listen = %listen, "Broker running, press Ctrl+C to stop");
    shutdown_signal().await;

    shutdown.cancel();
    server.await.context("Broker task failed")?;
    Ok(())
}
