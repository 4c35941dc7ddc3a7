// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dead Letter Manager - terminal home for undeliverable messages
//!
//! The manager classifies failures and applies recovery actions, but it never
//! sends anything itself: replays go through a [`RecoveryExecutor`] supplied by
//! the caller (the message router in a running node).
//!
//! | Reason | Action |
//! |--------|--------|
//! | `target_unavailable` | `Retry` when the target is live again, `Redirect` to a live agent with the target's capabilities, else `ManualReview` |
//! | any, replay count at the limit | `ManualReview` (`validation` still discards) |
//! | `network` | `Retry` while the replay count is under the limit, else `ManualReview` |
//! | `validation` | `Discard` |
//! | `unknown` | `ManualReview` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::registry::AgentRegistry;
use crate::domain::agent::AgentId;
use crate::domain::backoff::to_chrono;
use crate::domain::delivery::{DeadMessage, FailureReason, RecoveryAction, ReviewStatus};
use crate::domain::events::DeliveryEvent;
use crate::domain::message::{Message, MessageId};
use crate::domain::repository::{DeadLetterQuery, DeadLetterRepository, RepositoryError};
use crate::infrastructure::event_bus::EventBus;

/// Re-sends a message on behalf of the dead letter manager.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn replay(&self, message: Message) -> Result<(), String>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead letter {0} not found")]
    NotFound(MessageId),

    #[error("Replay of {message_id} failed: {reason}")]
    Replay { message_id: MessageId, reason: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Outcome counts of one [`DeadLetterManager::process_batch`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub retried: usize,
    pub redirected: usize,
    pub discarded: usize,
    pub manual_review: usize,
    pub errors: Vec<(MessageId, String)>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.retried + self.redirected + self.discarded + self.manual_review + self.errors.len()
    }
}

pub struct DeadLetterManager {
    repository: Arc<dyn DeadLetterRepository>,
    registry: Arc<AgentRegistry>,
    event_bus: EventBus,
    replay_limit: u32,
    write_lock: tokio::sync::Mutex<()>,
}

impl DeadLetterManager {
    pub fn new(
        repository: Arc<dyn DeadLetterRepository>,
        registry: Arc<AgentRegistry>,
        event_bus: EventBus,
        replay_limit: u32,
    ) -> Self {
        Self {
            repository,
            registry,
            event_bus,
            replay_limit,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Stores a dead message. Returns `false` when the message is already held.
    ///
    /// A message that comes back after a replay re-opens its record and keeps
    /// its replay count.
    pub async fn add(&self, mut dead: DeadMessage) -> Result<bool, DeadLetterError> {
        let _guard = self.write_lock.lock().await;
        let message_id = dead.message_id();

        if let Some(existing) = self.repository.find_by_id(message_id).await? {
            if existing.is_held() {
                debug!(message_id = %message_id, "Message already dead-lettered");
                return Ok(false);
            }
            dead.replay_count = existing.replay_count;
        }

        self.repository.save(&dead).await?;

        warn!(
            message_id = %message_id,
            reason = %dead.reason,
            retry_count = dead.retry_count,
            replay_count = dead.replay_count,
            "Message dead-lettered: {}",
            dead.detail
        );
        metrics::counter!("meshbus_dead_letters_total", "reason" => dead.reason.as_str()).increment(1);
        self.event_bus.publish_delivery_event(DeliveryEvent::MessageDeadLettered {
            message_id,
            reason: dead.reason,
            detail: dead.detail.clone(),
            dead_lettered_at: dead.failed_at,
        });
        Ok(true)
    }

    pub async fn get(&self, message_id: MessageId) -> Result<Option<DeadMessage>, DeadLetterError> {
        Ok(self.repository.find_by_id(message_id).await?)
    }

    pub async fn query(&self, query: &DeadLetterQuery) -> Result<Vec<DeadMessage>, DeadLetterError> {
        Ok(self.repository.query(query).await?)
    }

    pub fn analyze_failure(&self, dead: &DeadMessage) -> RecoveryAction {
        match dead.reason {
            FailureReason::TargetUnavailable => self.recover_unavailable(dead),
            FailureReason::Network if dead.replay_count < self.replay_limit => RecoveryAction::Retry,
            FailureReason::Network => RecoveryAction::ManualReview,
            FailureReason::Validation => RecoveryAction::Discard,
            FailureReason::Unknown => RecoveryAction::ManualReview,
        }
    }

    fn recover_unavailable(&self, dead: &DeadMessage) -> RecoveryAction {
        if dead.replay_count >= self.replay_limit {
            return RecoveryAction::ManualReview;
        }
        let Some(target) = dead.original_target() else {
            return RecoveryAction::ManualReview;
        };
        if self.registry.is_live(target) {
            return RecoveryAction::Retry;
        }
        let Some(record) = self.registry.get(target) else {
            return RecoveryAction::ManualReview;
        };
        if record.capabilities.is_empty() {
            return RecoveryAction::ManualReview;
        }

        let required: Vec<String> = record.capabilities.iter().cloned().collect();
        self.registry
            .find_by_capabilities(&required)
            .into_iter()
            .map(|m| m.agent.agent_id)
            .find(|candidate| candidate != target && candidate != dead.message.source())
            .map(RecoveryAction::Redirect)
            .unwrap_or(RecoveryAction::ManualReview)
    }

    /// Classifies and acts on up to `limit` of the oldest open dead letters.
    /// One entry's failure is recorded in the report and never stops the batch.
    pub async fn process_batch(
        &self,
        limit: usize,
        executor: &dyn RecoveryExecutor,
    ) -> Result<BatchReport, DeadLetterError> {
        let query = DeadLetterQuery {
            open_only: true,
            limit: Some(limit),
            ..Default::default()
        };
        let open = self.repository.query(&query).await?;

        let mut report = BatchReport::default();
        for dead in open {
            let message_id = dead.message_id();
            let action = self.analyze_failure(&dead);
            let outcome = match &action {
                RecoveryAction::Retry => self.replay(message_id, executor).await,
                RecoveryAction::Redirect(to) => self.redirect(message_id, to.clone(), executor).await.map(|_| ()),
                RecoveryAction::Discard => self.discard(message_id).await,
                RecoveryAction::ManualReview => self.mark_for_review(message_id).await,
            };
            match outcome {
                Ok(()) => match action {
                    RecoveryAction::Retry => report.retried += 1,
                    RecoveryAction::Redirect(_) => report.redirected += 1,
                    RecoveryAction::Discard => report.discarded += 1,
                    RecoveryAction::ManualReview => report.manual_review += 1,
                },
                Err(err) => {
                    warn!(message_id = %message_id, action = %action, "Dead letter recovery failed: {}", err);
                    report.errors.push((message_id, err.to_string()));
                }
            }
        }

        if report.processed() > 0 {
            info!(
                retried = report.retried,
                redirected = report.redirected,
                discarded = report.discarded,
                manual_review = report.manual_review,
                errors = report.errors.len(),
                "Dead letter batch processed"
            );
        }
        Ok(report)
    }

    /// Re-sends the original message (same id, so consumers can deduplicate).
    pub async fn replay(&self, message_id: MessageId, executor: &dyn RecoveryExecutor) -> Result<(), DeadLetterError> {
        let mut dead = self.held(message_id).await?;
        let previous = dead.review;
        dead.review = ReviewStatus::Replayed;
        dead.replay_count = dead.replay_count.saturating_add(1);
        dead.resolved_at = Some(Utc::now());
        self.repository.save(&dead).await?;

        if let Err(reason) = executor.replay(dead.message.clone()).await {
            dead.review = previous;
            dead.resolved_at = None;
            self.repository.save(&dead).await?;
            return Err(DeadLetterError::Replay { message_id, reason });
        }

        info!(message_id = %message_id, replay_count = dead.replay_count, "Dead letter replayed");
        self.event_bus
            .publish_delivery_event(DeliveryEvent::resolved(message_id, &RecoveryAction::Retry));
        Ok(())
    }

    /// Sends a copy of the message to `new_target` and drops the record.
    /// Returns the id of the new message.
    pub async fn redirect(
        &self,
        message_id: MessageId,
        new_target: AgentId,
        executor: &dyn RecoveryExecutor,
    ) -> Result<MessageId, DeadLetterError> {
        let mut dead = self.held(message_id).await?;
        let redirected = dead.message.redirected(new_target.clone());
        let new_id = redirected.id();

        if let Err(reason) = executor.replay(redirected).await {
            // A failed redirect spends a replay so it cannot loop forever.
            dead.replay_count = dead.replay_count.saturating_add(1);
            self.repository.save(&dead).await?;
            return Err(DeadLetterError::Replay { message_id, reason });
        }
        self.repository.delete(message_id).await?;

        info!(message_id = %message_id, new_message_id = %new_id, new_target = %new_target, "Dead letter redirected");
        self.event_bus
            .publish_delivery_event(DeliveryEvent::resolved(message_id, &RecoveryAction::Redirect(new_target)));
        Ok(new_id)
    }

    pub async fn discard(&self, message_id: MessageId) -> Result<(), DeadLetterError> {
        self.held(message_id).await?;
        self.repository.delete(message_id).await?;
        info!(message_id = %message_id, "Dead letter discarded");
        self.event_bus
            .publish_delivery_event(DeliveryEvent::resolved(message_id, &RecoveryAction::Discard));
        Ok(())
    }

    pub async fn mark_for_review(&self, message_id: MessageId) -> Result<(), DeadLetterError> {
        let mut dead = self.held(message_id).await?;
        dead.review = ReviewStatus::ManualReview;
        self.repository.save(&dead).await?;
        info!(message_id = %message_id, reason = %dead.reason, "Dead letter needs manual review");
        Ok(())
    }

    /// Drops replayed records resolved more than `retention` before `now`.
    /// Returns how many were removed.
    pub async fn purge_replayed(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, DeadLetterError> {
        let _guard = self.write_lock.lock().await;
        let cutoff = now - to_chrono(retention);
        let purged = self.repository.purge_replayed(cutoff).await?;
        if purged > 0 {
            debug!(purged, "Purged replayed dead letters");
        }
        Ok(purged)
    }

    async fn held(&self, message_id: MessageId) -> Result<DeadMessage, DeadLetterError> {
        self.repository
            .find_by_id(message_id)
            .await?
            .filter(DeadMessage::is_held)
            .ok_or(DeadLetterError::NotFound(message_id))
    }
}
