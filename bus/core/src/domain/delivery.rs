// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cross-Domain Delivery Records
//!
//! - [`StoreForwardEntry`]: an outbound message owned by the store-and-forward engine.
//! - [`DeliveryReceipt`]: proof of a positive acknowledgment from the remote domain.
//! - [`DeadMessage`]: terminal record for a message that could not be delivered.
//! - [`RecoveryAction`]: what the dead letter manager decided to do with one.
//!
//! A `Delivered` entry always carries a receipt: [`StoreForwardEntry::mark_delivered`]
//! is the only way to reach that status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::agent::{AgentId, DomainId};
use crate::domain::message::{Message, MessageId};

/// Classification of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Network,
    TargetUnavailable,
    Validation,
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::TargetUnavailable => "target_unavailable",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "network" => Some(Self::Network),
            "target_unavailable" => Some(Self::TargetUnavailable),
            "validation" => Some(Self::Validation),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed delivery attempt with detail text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DeliveryFailure {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Delivery failed: {0}")]
    Unknown(String),
}

impl DeliveryFailure {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Network(_) => FailureReason::Network,
            Self::TargetUnavailable(_) => FailureReason::TargetUnavailable,
            Self::Validation(_) => FailureReason::Validation,
            Self::Unknown(_) => FailureReason::Unknown,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Network(d) | Self::TargetUnavailable(d) | Self::Validation(d) | Self::Unknown(d) => d,
        }
    }

    /// Whether the failure says anything about the health of the remote domain itself.
    /// Only these count against its circuit breaker.
    pub fn trips_circuit(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unknown(_))
    }

    /// Whether retrying the same message can ever succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub acknowledged_by: DomainId,
    pub acked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreForwardEntry {
    pub message: Message,
    pub target_domain: DomainId,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub max_retries: u32,
    status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DeliveryFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receipt: Option<DeliveryReceipt>,
    pub created_at: DateTime<Utc>,
}

impl StoreForwardEntry {
    pub fn new(message: Message, target_domain: DomainId, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            message,
            target_domain,
            attempts: 0,
            next_retry_at: now,
            max_retries,
            status: DeliveryStatus::Pending,
            last_failure: None,
            receipt: None,
            created_at: now,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn receipt(&self) -> Option<&DeliveryReceipt> {
        self.receipt.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at <= now
    }

    pub fn record_failure(&mut self, failure: DeliveryFailure, next_retry_at: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_failure = Some(failure);
        self.next_retry_at = next_retry_at;
    }

    /// Pushes the next attempt back without counting one (circuit open).
    pub fn defer(&mut self, next_retry_at: DateTime<Utc>) {
        self.next_retry_at = next_retry_at;
    }

    pub fn mark_delivered(&mut self, receipt: DeliveryReceipt) {
        self.attempts = self.attempts.saturating_add(1);
        self.receipt = Some(receipt);
        self.status = DeliveryStatus::Delivered;
    }

    pub fn mark_failed(&mut self) {
        self.status = DeliveryStatus::Failed;
    }
}

/// Review state of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Unreviewed,
    ManualReview,
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadMessage {
    pub message: Message,
    pub reason: FailureReason,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_domain: Option<DomainId>,
    #[serde(default)]
    pub replay_count: u32,
    pub review: ReviewStatus,
    /// When the record was last handed back for replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadMessage {
    pub fn new(message: Message, failure: &DeliveryFailure, retry_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            message,
            reason: failure.reason(),
            detail: failure.detail().to_string(),
            failed_at: now,
            retry_count,
            target_domain: None,
            replay_count: 0,
            review: ReviewStatus::Unreviewed,
            resolved_at: None,
        }
    }

    pub fn from_entry(entry: &StoreForwardEntry, failure: &DeliveryFailure, now: DateTime<Utc>) -> Self {
        let mut dead = Self::new(entry.message.clone(), failure, entry.attempts, now);
        dead.target_domain = Some(entry.target_domain.clone());
        dead
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }

    pub fn original_target(&self) -> Option<&AgentId> {
        self.message.target()
    }

    /// Whether the record is awaiting a decision.
    pub fn is_open(&self) -> bool {
        self.review == ReviewStatus::Unreviewed
    }

    /// Whether the record is still held (not yet handed back for replay).
    pub fn is_held(&self) -> bool {
        self.review != ReviewStatus::Replayed
    }

    /// Whether a replayed record was resolved before `cutoff`.
    pub fn replayed_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.review == ReviewStatus::Replayed && self.resolved_at.unwrap_or(self.failed_at) < cutoff
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    Redirect(AgentId),
    Discard,
    ManualReview,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => f.write_str("retry"),
            Self::Redirect(to) => write!(f, "redirect({to})"),
            Self::Discard => f.write_str("discard"),
            Self::ManualReview => f.write_str("manual_review"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageType;

    fn entry() -> StoreForwardEntry {
        let message = Message::new(MessageType::Simple, "a").to("b@remote");
        StoreForwardEntry::new(message, DomainId::new("remote"), 3, Utc::now())
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(DeliveryFailure::Network("x".into()).reason(), FailureReason::Network);
        assert!(DeliveryFailure::Network("x".into()).trips_circuit());
        assert!(!DeliveryFailure::TargetUnavailable("x".into()).trips_circuit());
        assert!(!DeliveryFailure::Validation("x".into()).is_retryable());
        assert_eq!(FailureReason::parse("target_unavailable"), Some(FailureReason::TargetUnavailable));
    }

    #[test]
    fn test_failure_serializes_with_reason_tag() {
        let json = serde_json::to_value(DeliveryFailure::Validation("ttl".into())).unwrap();
        assert_eq!(json["reason"], "validation");
        assert_eq!(json["detail"], "ttl");
    }

    #[test]
    fn test_exhaustion_after_max_retries() {
        let mut e = entry();
        let now = Utc::now();
        for _ in 0..2 {
            e.record_failure(DeliveryFailure::Network("down".into()), now);
            assert!(!e.is_exhausted());
        }
        e.record_failure(DeliveryFailure::Network("down".into()), now);
        assert!(e.is_exhausted());
        assert_eq!(e.status(), DeliveryStatus::Pending);
    }

    #[test]
    fn test_defer_does_not_count_an_attempt() {
        let mut e = entry();
        e.defer(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(e.attempts, 0);
        assert!(!e.is_due(Utc::now()));
    }

    #[test]
    fn test_delivered_carries_receipt() {
        let mut e = entry();
        let receipt = DeliveryReceipt {
            message_id: e.message_id(),
            acknowledged_by: DomainId::new("remote"),
            acked_at: Utc::now(),
        };
        e.mark_delivered(receipt.clone());
        assert_eq!(e.status(), DeliveryStatus::Delivered);
        assert_eq!(e.receipt(), Some(&receipt));
    }

    #[test]
    fn test_dead_message_from_entry() {
        let mut e = entry();
        let failure = DeliveryFailure::Network("timeout".into());
        e.record_failure(failure.clone(), Utc::now());
        let dead = DeadMessage::from_entry(&e, &failure, Utc::now());
        assert_eq!(dead.reason, FailureReason::Network);
        assert_eq!(dead.retry_count, 1);
        assert_eq!(dead.target_domain, Some(DomainId::new("remote")));
        assert!(dead.is_open());
    }
}
