// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the delivery repositories defined in
//! `crate::domain::repository`.
//!
//! ## sled Repositories
//!
//! Durable implementations so pending cross-domain deliveries and dead
//! letters survive a restart:
//! - **SledStoreForwardRepository** - outbound store-and-forward entries
//! - **SledDeadLetterRepository** - dead letter records
//!
//! ## In-Memory Repositories
//!
//! Lightweight implementations for testing and single-process meshes:
//! - **InMemoryStoreForwardRepository**
//! - **InMemoryDeadLetterRepository**

pub mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::delivery::{DeadMessage, DeliveryStatus, StoreForwardEntry};
use crate::domain::message::MessageId;
use crate::domain::repository::{
    DeadLetterQuery, DeadLetterRepository, RepositoryError, StorageBackend, StoreForwardRepository,
};

pub use sled_store::{open_database, SledDeadLetterRepository, SledStoreForwardRepository};

#[derive(Clone, Default)]
pub struct InMemoryStoreForwardRepository {
    entries: Arc<RwLock<HashMap<MessageId, StoreForwardEntry>>>,
}

impl InMemoryStoreForwardRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_status(&self, status: DeliveryStatus) -> Vec<StoreForwardEntry> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| e.status() == status)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }
}

#[async_trait]
impl StoreForwardRepository for InMemoryStoreForwardRepository {
    async fn save(&self, entry: &StoreForwardEntry) -> Result<(), RepositoryError> {
        self.entries.write().insert(entry.message_id(), entry.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<StoreForwardEntry>, RepositoryError> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn find_pending(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError> {
        Ok(self.with_status(DeliveryStatus::Pending))
    }

    async fn find_failed(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError> {
        Ok(self.with_status(DeliveryStatus::Failed))
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        self.entries.write().remove(&id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterRepository {
    dead: Arc<RwLock<HashMap<MessageId, DeadMessage>>>,
}

impl InMemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn save(&self, dead: &DeadMessage) -> Result<(), RepositoryError> {
        self.dead.write().insert(dead.message_id(), dead.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<DeadMessage>, RepositoryError> {
        Ok(self.dead.read().get(&id).cloned())
    }

    async fn query(&self, query: &DeadLetterQuery) -> Result<Vec<DeadMessage>, RepositoryError> {
        let matching = self.dead.read().values().filter(|d| query.matches(d)).cloned().collect();
        Ok(oldest_first(matching, query.limit))
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        self.dead.write().remove(&id);
        Ok(())
    }

    async fn purge_replayed(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut dead = self.dead.write();
        let before = dead.len();
        dead.retain(|_, d| !d.replayed_before(cutoff));
        Ok(before - dead.len())
    }
}

pub(crate) fn oldest_first(mut dead: Vec<DeadMessage>, limit: Option<usize>) -> Vec<DeadMessage> {
    dead.sort_by(|a, b| {
        a.failed_at
            .cmp(&b.failed_at)
            .then_with(|| a.message_id().cmp(&b.message_id()))
    });
    if let Some(limit) = limit {
        dead.truncate(limit);
    }
    dead
}

/// Repository pair for the configured backend.
pub fn build_repositories(
    backend: &StorageBackend,
) -> Result<(Arc<dyn StoreForwardRepository>, Arc<dyn DeadLetterRepository>), RepositoryError> {
    match backend {
        StorageBackend::InMemory => Ok((
            Arc::new(InMemoryStoreForwardRepository::new()),
            Arc::new(InMemoryDeadLetterRepository::new()),
        )),
        StorageBackend::Sled { path } => {
            let db = open_database(path)?;
            Ok((
                Arc::new(SledStoreForwardRepository::new(&db)?),
                Arc::new(SledDeadLetterRepository::new(&db)?),
            ))
        }
    }
}
