// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Maintenance Sweeper - periodic housekeeping for a mesh node
//!
//! One task, one interval. Each cycle:
//!
//! 1. times out overdue help requests and drops long-finished ones,
//! 2. marks agents silent past the liveness window offline,
//! 3. drops dead letters replayed longer ago than the retention window and
//!    retries dead letter hand-offs that failed,
//! 4. pings the transport and reconnects when it is unhealthy,
//! 5. runs one dead letter recovery batch through the router.
//!
//! A failing step is logged and never stops the remaining steps or later cycles.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::dead_letter::{BatchReport, DeadLetterManager};
use crate::application::help::{HelpRequestManager, FINISHED_RETENTION};
use crate::application::registry::AgentRegistry;
use crate::application::router::MessageRouter;
use crate::application::store_forward::StoreForwardEngine;
use crate::infrastructure::transport::ConnectionManager;

/// How long a replayed dead letter is kept for inspection.
pub const REPLAYED_RETENTION: Duration = Duration::from_secs(3600);

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub purged: usize,
    pub pruned: usize,
    pub purged_dead_letters: usize,
    pub handed_off: usize,
    pub transport_healthy: bool,
    pub dead_letters: Option<BatchReport>,
}

pub struct MaintenanceSweeper {
    help: Arc<HelpRequestManager>,
    registry: Arc<AgentRegistry>,
    connection: Arc<ConnectionManager>,
    dead_letters: Arc<DeadLetterManager>,
    store_forward: Arc<StoreForwardEngine>,
    router: Arc<MessageRouter>,
    interval: Duration,
    batch_size: usize,
    shutdown_token: CancellationToken,
}

impl MaintenanceSweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        help: Arc<HelpRequestManager>,
        registry: Arc<AgentRegistry>,
        connection: Arc<ConnectionManager>,
        dead_letters: Arc<DeadLetterManager>,
        store_forward: Arc<StoreForwardEngine>,
        router: Arc<MessageRouter>,
        interval: Duration,
        batch_size: usize,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            help,
            registry,
            connection,
            dead_letters,
            store_forward,
            router,
            interval,
            batch_size,
            shutdown_token,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Starting maintenance sweeper"
        );

        let mut tick = interval(self.interval.max(Duration::from_millis(10)));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("Running maintenance sweep");
                    match self.sweep_cycle().await {
                        Ok(report) => {
                            if report.timed_out + report.purged + report.pruned + report.purged_dead_letters > 0 {
                                info!(
                                    timed_out = report.timed_out,
                                    purged = report.purged,
                                    pruned = report.pruned,
                                    purged_dead_letters = report.purged_dead_letters,
                                    "Maintenance sweep completed"
                                );
                            }
                        }
                        Err(e) => warn!("Maintenance sweep failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping maintenance sweeper");
                    break;
                }
            }
        }

        info!("Maintenance sweeper stopped");
    }

    /// Runs every step once.
    pub async fn sweep_cycle(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport {
            timed_out: self.help.check_timeouts(now).len(),
            purged: self.help.purge_finished(now, FINISHED_RETENTION),
            pruned: self.registry.prune_stale_at(now),
            ..Default::default()
        };

        report.purged_dead_letters = match self.dead_letters.purge_replayed(now, REPLAYED_RETENTION).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!("Failed to purge replayed dead letters: {}", e);
                0
            }
        };
        report.handed_off = match self.store_forward.retry_failed_handoffs().await {
            Ok(handed_off) => handed_off,
            Err(e) => {
                warn!("Failed to retry dead letter hand-offs: {}", e);
                0
            }
        };

        report.transport_healthy = match self.connection.ensure_connected().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Transport still unavailable after reconnect attempt: {}", e);
                false
            }
        };

        if self.batch_size > 0 && report.transport_healthy {
            report.dead_letters = Some(
                self.dead_letters
                    .process_batch(self.batch_size, self.router.as_ref())
                    .await?,
            );
        }

        Ok(report)
    }
}
