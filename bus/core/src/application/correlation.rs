// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reply Correlation - pending waiters keyed by correlation id
//!
//! A waiter registers before its request is sent, then awaits the reply with an
//! explicit deadline. Resolving hands the value to exactly one waiter. Dropping
//! or cancelling a [`Pending`] removes its entry; it never retracts anything
//! that was already sent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("A waiter is already registered for correlation id {0}")]
    Duplicate(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Wait was cancelled")]
    Cancelled,
}

struct Slot<V> {
    token: u64,
    sender: oneshot::Sender<V>,
}

/// Table of pending waiters.
pub struct Correlator<K, V> {
    pending: Arc<Mutex<HashMap<K, Slot<V>>>>,
    next_token: Arc<AtomicU64>,
}

impl<K, V> Clone for Correlator<K, V> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
            next_token: self.next_token.clone(),
        }
    }
}

impl<K, V> Default for Correlator<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Correlator<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn register(&self, key: K) -> Result<Pending<K, V>, CorrelationError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(CorrelationError::Duplicate(key.to_string()));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        pending.insert(key.clone(), Slot { token, sender });
        Ok(Pending {
            key,
            token,
            receiver: Some(receiver),
            table: self.pending.clone(),
        })
    }

    /// Completes the waiter for `key`. Returns `false` when nobody was waiting.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let slot = self.pending.lock().remove(key);
        match slot {
            Some(slot) => slot.sender.send(value).is_ok(),
            None => {
                debug!(key = %key, "No pending waiter for reply");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A registered waiter.
pub struct Pending<K: Eq + Hash, V> {
    key: K,
    token: u64,
    receiver: Option<oneshot::Receiver<V>>,
    table: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K: Eq + Hash, V> Pending<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<V, CorrelationError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(CorrelationError::Cancelled);
        };
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CorrelationError::Cancelled),
            Err(_) => Err(CorrelationError::Timeout(timeout)),
        }
    }

    pub fn cancel(self) {}
}

impl<K: Eq + Hash, V> Drop for Pending<K, V> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if table.get(&self.key).is_some_and(|slot| slot.token == self.token) {
            table.remove(&self.key);
        }
    }
}

/// Correlates inbound messages with outstanding requests by `correlationId`.
#[derive(Clone, Default)]
pub struct ReplyCorrelator {
    inner: Correlator<String, Message>,
}

pub type PendingReply = Pending<String, Message>;

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: impl Into<String>) -> Result<PendingReply, CorrelationError> {
        self.inner.register(correlation_id.into())
    }

    /// Hands `message` to the waiter matching its correlation id, if any.
    pub fn resolve(&self, message: &Message) -> bool {
        match message.correlation_id() {
            Some(id) => self.inner.resolve(&id.to_string(), message.clone()),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageType;

    #[tokio::test]
    async fn test_resolve_wakes_matching_waiter() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.register("req-1").unwrap();

        let reply = Message::new(MessageType::Simple, "helper").correlated_with("req-1");
        assert!(correlator.resolve(&reply));

        let received = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.id(), reply.id());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_cleans_up() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.register("req-2").unwrap();
        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, CorrelationError::Timeout(Duration::from_millis(10)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_entry_and_late_reply_is_ignored() {
        let correlator = ReplyCorrelator::new();
        let pending = correlator.register("req-3").unwrap();
        assert!(correlator.register("req-3").is_err());

        pending.cancel();
        assert_eq!(correlator.pending_count(), 0);

        let late = Message::new(MessageType::Simple, "helper").correlated_with("req-3");
        assert!(!correlator.resolve(&late));
        assert!(correlator.register("req-3").is_ok());
    }

    #[tokio::test]
    async fn test_stale_waiter_drop_keeps_newer_registration() {
        let correlator: Correlator<String, u32> = Correlator::new();
        let first = correlator.register("k".to_string()).unwrap();
        assert!(correlator.resolve(&"k".to_string(), 1));

        let second = correlator.register("k".to_string()).unwrap();
        drop(first);
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.resolve(&"k".to_string(), 2));
        assert_eq!(second.wait(Duration::from_secs(1)).await.unwrap(), 2);
    }
}
