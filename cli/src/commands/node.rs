// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground mesh node
//!
//! `meshbus node run` loads the configuration, starts every node service and
//! runs until Ctrl+C or SIGTERM, then shuts the node down gracefully.

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use meshbus_core::application::node::MeshNode;
use meshbus_core::domain::mesh_config::MeshConfigManifest;
use meshbus_core::infrastructure::event_bus::{BusEvent, EventBus, EventBusError};
use meshbus_core::infrastructure::transport::build_backend;

#[derive(Subcommand)]
pub enum NodeCommand {
    /// Run a mesh node in the foreground
    Run {
        /// Broker domain served by this node (overrides the config file)
        #[arg(long, env = "MESHBUS_DOMAIN")]
        domain: Option<String>,
    },
}

pub async fn handle_command(command: NodeCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        NodeCommand::Run { domain } => run(config_override, domain).await,
    }
}

async fn run(config_override: Option<PathBuf>, domain: Option<String>) -> Result<()> {
    let mut config = MeshConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    if let Some(domain) = domain {
        config.spec.node.domain = domain;
    }

    describe_metrics();
    let backend = build_backend(&config.spec.transport).context("Failed to build transport backend")?;
    let node = MeshNode::build(config, backend).context("Failed to build mesh node")?;
    let events = log_events(node.event_bus());
    node.start().await.context("Failed to start mesh node")?;

    info!(domain = %node.domain(), "Mesh node running, press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Mesh node shutting down");
    node.shutdown().await;
    events.abort();
    Ok(())
}

fn log_events(event_bus: &EventBus) -> JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(BusEvent::Delivery(event)) => info!(event = ?event, "Delivery event"),
                Ok(BusEvent::Circuit(event)) => warn!(event = ?event, "Circuit event"),
                Ok(event) => debug!(event = ?event, "Bus event"),
                Err(EventBusError::Lagged(_)) | Err(EventBusError::Empty) => continue,
                Err(EventBusError::Closed) => break,
            }
        }
    })
}

fn describe_metrics() {
    metrics::describe_counter!("meshbus_messages_routed_total", "Messages routed, by route kind");
    metrics::describe_counter!(
        "meshbus_store_forward_attempts_total",
        "Cross-domain delivery attempts, by target domain"
    );
    metrics::describe_counter!("meshbus_dead_letters_total", "Messages moved to the dead letter store, by reason");
    metrics::describe_counter!("meshbus_help_requests_total", "Help requests opened");
    metrics::describe_counter!("meshbus_circuit_open_total", "Circuit breaker trips, by target domain");
    metrics::describe_counter!(
        "meshbus_transport_dropped_total",
        "Payloads lost by subscribers that fell behind, by channel"
    );
}

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
