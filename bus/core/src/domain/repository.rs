// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the delivery aggregates. Interfaces live in the
//! domain layer and are implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `StoreForwardRepository` | `StoreForwardEntry` | `InMemoryStoreForwardRepository`, `SledStoreForwardRepository` |
//! | `DeadLetterRepository` | `DeadMessage` | `InMemoryDeadLetterRepository`, `SledDeadLetterRepository` |
//!
//! The backend is chosen at node startup from `spec.storeForward.statePath`:
//! absent means in-memory, present means a sled database at that path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::domain::agent::AgentId;
use crate::domain::delivery::{DeadMessage, FailureReason, StoreForwardEntry};
use crate::domain::message::MessageId;

/// Storage backend for delivery state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Sled { path: PathBuf },
}

/// Outbound cross-domain entries that must survive a restart
#[async_trait]
pub trait StoreForwardRepository: Send + Sync {
    /// Save entry (create or update)
    async fn save(&self, entry: &StoreForwardEntry) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<StoreForwardEntry>, RepositoryError>;

    /// All entries still awaiting delivery, oldest first
    async fn find_pending(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError>;

    /// Failed entries whose dead letter hand-off never completed, oldest first
    async fn find_failed(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError>;

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError>;
}

/// Filter for dead letter lookups. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadLetterQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub reason: Option<FailureReason>,
    pub target: Option<AgentId>,
    /// Include records already handed back for replay
    pub include_replayed: bool,
    /// Only records still awaiting a decision
    pub open_only: bool,
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn matches(&self, dead: &DeadMessage) -> bool {
        if !self.include_replayed && !dead.is_held() {
            return false;
        }
        if self.open_only && !dead.is_open() {
            return false;
        }
        if self.since.is_some_and(|since| dead.failed_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| dead.failed_at > until) {
            return false;
        }
        if self.reason.is_some_and(|reason| dead.reason != reason) {
            return false;
        }
        if let Some(target) = &self.target {
            if dead.original_target() != Some(target) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn save(&self, dead: &DeadMessage) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<DeadMessage>, RepositoryError>;

    /// Matching records, oldest first
    async fn query(&self, query: &DeadLetterQuery) -> Result<Vec<DeadMessage>, RepositoryError>;

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError>;

    /// Removes replayed records resolved before `cutoff`. Returns how many went.
    async fn purge_replayed(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for RepositoryError {
    fn from(err: sled::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
