// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// sled-backed delivery repositories. One database per node, one tree per
// aggregate, keyed by the 16 raw bytes of the message id, values are JSON.
// Every write is flushed before returning so an acknowledged enqueue survives
// a crash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::warn;

use crate::domain::delivery::{DeadMessage, DeliveryStatus, StoreForwardEntry};
use crate::domain::message::MessageId;
use crate::domain::repository::{DeadLetterQuery, DeadLetterRepository, RepositoryError, StoreForwardRepository};

use super::oldest_first;

const STORE_FORWARD_TREE: &str = "store_forward";
const DEAD_LETTER_TREE: &str = "dead_letters";

pub fn open_database(path: &Path) -> Result<sled::Db, RepositoryError> {
    std::fs::create_dir_all(path).map_err(|e| RepositoryError::Storage(e.to_string()))?;
    Ok(sled::open(path)?)
}

#[derive(Clone)]
pub struct SledStoreForwardRepository {
    tree: sled::Tree,
}

impl SledStoreForwardRepository {
    pub fn new(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree(STORE_FORWARD_TREE)?,
        })
    }

    fn with_status(&self, status: DeliveryStatus) -> Result<Vec<StoreForwardEntry>, RepositoryError> {
        let mut entries = scan_matching(&self.tree, |e: &StoreForwardEntry| e.status() == status)?;
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }
}

#[async_trait]
impl StoreForwardRepository for SledStoreForwardRepository {
    async fn save(&self, entry: &StoreForwardEntry) -> Result<(), RepositoryError> {
        put(&self.tree, entry.message_id(), entry).await
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<StoreForwardEntry>, RepositoryError> {
        get(&self.tree, id)
    }

    async fn find_pending(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError> {
        self.with_status(DeliveryStatus::Pending)
    }

    async fn find_failed(&self) -> Result<Vec<StoreForwardEntry>, RepositoryError> {
        self.with_status(DeliveryStatus::Failed)
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        remove(&self.tree, id).await
    }
}

#[derive(Clone)]
pub struct SledDeadLetterRepository {
    tree: sled::Tree,
}

impl SledDeadLetterRepository {
    pub fn new(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree(DEAD_LETTER_TREE)?,
        })
    }
}

#[async_trait]
impl DeadLetterRepository for SledDeadLetterRepository {
    async fn save(&self, dead: &DeadMessage) -> Result<(), RepositoryError> {
        put(&self.tree, dead.message_id(), dead).await
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<DeadMessage>, RepositoryError> {
        get(&self.tree, id)
    }

    async fn query(&self, query: &DeadLetterQuery) -> Result<Vec<DeadMessage>, RepositoryError> {
        let matching = scan_matching(&self.tree, |d: &DeadMessage| query.matches(d))?;
        Ok(oldest_first(matching, query.limit))
    }

    async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
        remove(&self.tree, id).await
    }

    async fn purge_replayed(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let stale = scan_matching(&self.tree, |d: &DeadMessage| d.replayed_before(cutoff))?;
        for dead in &stale {
            self.tree.remove(dead.message_id().0.as_bytes())?;
        }
        if !stale.is_empty() {
            self.tree.flush_async().await?;
        }
        Ok(stale.len())
    }
}

async fn put<T: Serialize>(tree: &sled::Tree, id: MessageId, value: &T) -> Result<(), RepositoryError> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(id.0.as_bytes(), bytes)?;
    tree.flush_async().await?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, id: MessageId) -> Result<Option<T>, RepositoryError> {
    match tree.get(id.0.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

async fn remove(tree: &sled::Tree, id: MessageId) -> Result<(), RepositoryError> {
    tree.remove(id.0.as_bytes())?;
    tree.flush_async().await?;
    Ok(())
}

/// Loads the records accepted by `keep`, skipping (and logging) ones that no
/// longer decode. Rejected records are dropped as the scan goes.
fn scan_matching<T, F>(tree: &sled::Tree, mut keep: F) -> Result<Vec<T>, RepositoryError>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let mut records = Vec::new();
    for item in tree.iter() {
        let (key, value) = item?;
        match serde_json::from_slice(&value) {
            Ok(record) if keep(&record) => records.push(record),
            Ok(_) => {}
            Err(err) => warn!(tree = ?tree.name(), key = ?key, "Skipping undecodable record: {}", err),
        }
    }
    Ok(records)
}
