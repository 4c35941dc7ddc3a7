// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Store-and-Forward Engine - acknowledged cross-domain delivery
//!
//! Every outbound cross-domain message is persisted before the first attempt
//! and driven by its own task until it is either positively acknowledged or
//! handed to the [`DeadLetterManager`]. Attempts are gated twice: by the
//! target domain's circuit breaker and by a semaphore bounding concurrent
//! remote deliveries.
//!
//! An attempt skipped because the circuit is open is rescheduled without being
//! counted. A validation failure (remote nack or expired ttl) is terminal on
//! the spot.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::circuit_breakers::{CircuitBreakerRegistry, CircuitError};
use crate::application::dead_letter::DeadLetterManager;
use crate::domain::agent::DomainId;
use crate::domain::backoff::to_chrono;
use crate::domain::delivery::{DeadMessage, DeliveryFailure, DeliveryReceipt, DeliveryStatus, StoreForwardEntry};
use crate::domain::events::DeliveryEvent;
use crate::domain::link::RemoteDomainLink;
use crate::domain::mesh_config::StoreForwardConfig;
use crate::domain::message::{Message, MessageId};
use crate::domain::repository::{RepositoryError, StoreForwardRepository};
use crate::infrastructure::event_bus::EventBus;

const RECENT_OUTCOMES: usize = 1024;

/// Tracks one enqueued message until it reaches a terminal status.
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    message_id: MessageId,
    target_domain: DomainId,
    status: watch::Receiver<DeliveryStatus>,
}

impl DeliveryHandle {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn target_domain(&self) -> &DomainId {
        &self.target_domain
    }

    pub fn status(&self) -> DeliveryStatus {
        *self.status.borrow()
    }

    /// Resolves once the message is delivered or dead-lettered.
    pub async fn wait(mut self) -> DeliveryStatus {
        let result = self.status.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| *self.status.borrow())
    }

    /// Like [`wait`](Self::wait) with a deadline. `None` when it passes first.
    pub async fn wait_timeout(self, timeout: Duration) -> Option<DeliveryStatus> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

pub struct StoreForwardEngine {
    repository: Arc<dyn StoreForwardRepository>,
    link: Arc<dyn RemoteDomainLink>,
    breakers: Arc<CircuitBreakerRegistry>,
    dead_letters: Arc<DeadLetterManager>,
    event_bus: EventBus,
    config: StoreForwardConfig,
    in_flight: Semaphore,
    watchers: DashMap<MessageId, watch::Sender<DeliveryStatus>>,
    recent: Mutex<VecDeque<(MessageId, DeliveryStatus)>>,
    shutdown: CancellationToken,
}

impl StoreForwardEngine {
    pub fn new(
        repository: Arc<dyn StoreForwardRepository>,
        link: Arc<dyn RemoteDomainLink>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: Arc<DeadLetterManager>,
        event_bus: EventBus,
        config: StoreForwardConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = config.max_in_flight.max(1);
        Self {
            repository,
            link,
            breakers,
            dead_letters,
            event_bus,
            config,
            in_flight: Semaphore::new(permits),
            watchers: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_OUTCOMES)),
            shutdown,
        }
    }

    /// Persists `message` for delivery to `target_domain` and starts driving it.
    ///
    /// Enqueueing a message that is already in flight returns a handle to the
    /// existing delivery.
    pub async fn enqueue(
        self: &Arc<Self>,
        message: Message,
        target_domain: DomainId,
    ) -> Result<DeliveryHandle, RepositoryError> {
        let now = Utc::now();
        let mut entry = StoreForwardEntry::new(message, target_domain, self.config.max_retries, now);
        let (handle, fresh) = self.watch(&entry);
        if !fresh {
            debug!(message_id = %entry.message_id(), "Message already queued for delivery");
            return Ok(handle);
        }

        if entry.message.is_expired_at(now) {
            self.dead_letter(&mut entry, DeliveryFailure::Validation("message ttl expired before delivery".into()))
                .await;
            return Ok(handle);
        }

        if let Err(err) = self.repository.save(&entry).await {
            self.watchers.remove(&entry.message_id());
            return Err(err);
        }
        debug!(
            message_id = %entry.message_id(),
            domain = %entry.target_domain,
            "Message queued for cross-domain delivery"
        );
        self.spawn(entry);
        Ok(handle)
    }

    /// Restarts delivery of every persisted pending entry. Returns how many were resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, RepositoryError> {
        let pending = self.repository.find_pending().await?;
        let mut resumed = 0;
        for entry in pending {
            let (_, fresh) = self.watch(&entry);
            if fresh {
                self.spawn(entry);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed pending cross-domain deliveries");
        }
        self.retry_failed_handoffs().await?;
        Ok(resumed)
    }

    /// Hands entries left `Failed` by a dead letter store error to the dead
    /// letter manager again. Returns how many made it.
    pub async fn retry_failed_handoffs(&self) -> Result<usize, RepositoryError> {
        let failed = self.repository.find_failed().await?;
        let mut handed_off = 0;
        for entry in failed {
            let message_id = entry.message_id();
            let failure = entry
                .last_failure
                .clone()
                .unwrap_or_else(|| DeliveryFailure::Unknown("dead letter hand-off interrupted".into()));
            match self.dead_letters.add(DeadMessage::from_entry(&entry, &failure, Utc::now())).await {
                Ok(_) => {
                    self.repository.delete(message_id).await?;
                    handed_off += 1;
                }
                Err(err) => warn!(message_id = %message_id, "Dead letter hand-off still failing: {}", err),
            }
        }
        if handed_off > 0 {
            info!(handed_off, "Handed failed deliveries to the dead letter store");
        }
        Ok(handed_off)
    }

    /// Current status of a message this engine has seen. `None` when unknown.
    pub async fn status(&self, message_id: MessageId) -> Result<Option<DeliveryStatus>, RepositoryError> {
        if let Some(sender) = self.watchers.get(&message_id) {
            return Ok(Some(*sender.value().borrow()));
        }
        let remembered = self
            .recent
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == message_id)
            .map(|(_, status)| *status);
        if remembered.is_some() {
            return Ok(remembered);
        }
        Ok(self.repository.find_by_id(message_id).await?.map(|e| e.status()))
    }

    /// Messages currently being driven.
    pub fn in_flight(&self) -> usize {
        self.watchers.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn watch(&self, entry: &StoreForwardEntry) -> (DeliveryHandle, bool) {
        let (status, fresh) = match self.watchers.entry(entry.message_id()) {
            Entry::Occupied(existing) => (existing.get().subscribe(), false),
            Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(entry.status());
                slot.insert(sender);
                (receiver, true)
            }
        };
        let handle = DeliveryHandle {
            message_id: entry.message_id(),
            target_domain: entry.target_domain.clone(),
            status,
        };
        (handle, fresh)
    }

    fn spawn(self: &Arc<Self>, entry: StoreForwardEntry) {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(entry).await });
    }

    async fn drive(self: Arc<Self>, mut entry: StoreForwardEntry) {
        loop {
            let wait = (entry.next_retry_at - Utc::now()).to_std().unwrap_or_default();
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
            if self.shutdown.is_cancelled() {
                debug!(message_id = %entry.message_id(), "Delivery suspended by shutdown");
                self.watchers.remove(&entry.message_id());
                return;
            }
            if !self.attempt(&mut entry).await {
                return;
            }
        }
    }

    /// One pass over the entry. Returns `true` while it needs another pass.
    async fn attempt(&self, entry: &mut StoreForwardEntry) -> bool {
        let message_id = entry.message_id();
        if entry.message.is_expired_at(Utc::now()) {
            self.dead_letter(entry, DeliveryFailure::Validation("message ttl expired before delivery".into()))
                .await;
            return false;
        }

        let Ok(_slot) = self.in_flight.acquire().await else {
            return false;
        };

        let permit = match self.breakers.acquire(&entry.target_domain) {
            Ok(permit) => permit,
            Err(rejection) => {
                let delay = match rejection {
                    CircuitError::Open { retry_after, .. } => retry_after.max(self.config.backoff.base),
                    CircuitError::TrialInFlight { .. } => self.config.backoff.jittered_delay(entry.attempts.max(1)),
                };
                debug!(
                    message_id = %message_id,
                    domain = %entry.target_domain,
                    delay_ms = delay.as_millis() as u64,
                    "Circuit rejected delivery, rescheduling: {}",
                    rejection
                );
                entry.defer(Utc::now() + to_chrono(delay));
                self.persist(entry).await;
                return true;
            }
        };

        metrics::counter!(
            "meshbus_store_forward_attempts_total",
            "domain" => entry.target_domain.to_string()
        )
        .increment(1);

        match self.link.deliver(&entry.target_domain, &entry.message).await {
            Ok(receipt) => {
                permit.success();
                self.delivered(entry, receipt).await;
                false
            }
            Err(failure) => {
                if failure.trips_circuit() {
                    permit.failure();
                } else {
                    permit.success();
                }

                let delay = self.config.backoff.jittered_delay(entry.attempts.saturating_add(1));
                entry.record_failure(failure.clone(), Utc::now() + to_chrono(delay));

                if !failure.is_retryable() || entry.is_exhausted() {
                    self.dead_letter(entry, failure).await;
                    return false;
                }

                warn!(
                    message_id = %message_id,
                    domain = %entry.target_domain,
                    attempt = entry.attempts,
                    max_retries = entry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Cross-domain delivery failed, will retry: {}",
                    failure
                );
                self.persist(entry).await;
                true
            }
        }
    }

    async fn delivered(&self, entry: &mut StoreForwardEntry, receipt: DeliveryReceipt) {
        let message_id = entry.message_id();
        let acked_at = receipt.acked_at;
        entry.mark_delivered(receipt);

        if let Err(err) = self.repository.delete(message_id).await {
            error!(message_id = %message_id, "Failed to purge delivered entry: {}", err);
        }
        info!(
            message_id = %message_id,
            domain = %entry.target_domain,
            attempts = entry.attempts,
            "Cross-domain message delivered"
        );
        self.event_bus.publish_delivery_event(DeliveryEvent::MessageDelivered {
            message_id,
            domain: entry.target_domain.clone(),
            delivered_at: acked_at,
        });
        self.finish(message_id, DeliveryStatus::Delivered);
    }

    async fn dead_letter(&self, entry: &mut StoreForwardEntry, failure: DeliveryFailure) {
        let message_id = entry.message_id();
        entry.mark_failed();
        entry.last_failure = Some(failure.clone());
        let dead = DeadMessage::from_entry(entry, &failure, Utc::now());

        match self.dead_letters.add(dead).await {
            Ok(_) => {
                if let Err(err) = self.repository.delete(message_id).await {
                    error!(message_id = %message_id, "Failed to purge dead-lettered entry: {}", err);
                }
            }
            Err(err) => {
                // The sweeper retries the hand-off from the stored failed entry.
                error!(message_id = %message_id, "Failed to dead-letter message: {}", err);
                self.persist(entry).await;
            }
        }
        self.finish(message_id, DeliveryStatus::Failed);
    }

    async fn persist(&self, entry: &StoreForwardEntry) {
        if let Err(err) = self.repository.save(entry).await {
            error!(message_id = %entry.message_id(), "Failed to persist delivery state: {}", err);
        }
    }

    fn finish(&self, message_id: MessageId, status: DeliveryStatus) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_OUTCOMES {
                recent.pop_front();
            }
            recent.push_back((message_id, status));
        }
        if let Some((_, sender)) = self.watchers.remove(&message_id) {
            sender.send_replace(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::AgentRegistry;
    use crate::domain::agent::TrustPolicy;
    use crate::domain::backoff::BackoffPolicy;
    use crate::domain::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::delivery::FailureReason;
    use crate::domain::message::MessageType;
    use crate::domain::repository::{DeadLetterQuery, DeadLetterRepository};
    use crate::infrastructure::event_bus::BusEvent;
    use crate::infrastructure::repositories::{InMemoryDeadLetterRepository, InMemoryStoreForwardRepository};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Acks every delivery, or fails every one with `failure`.
    struct ScriptedLink {
        calls: AtomicU32,
        failure: Option<DeliveryFailure>,
    }

    impl ScriptedLink {
        fn new(failure: Option<DeliveryFailure>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failure,
            })
        }
    }

    #[async_trait]
    impl RemoteDomainLink for ScriptedLink {
        async fn deliver(&self, domain: &DomainId, message: &Message) -> Result<DeliveryReceipt, DeliveryFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.failure {
                Some(failure) => Err(failure.clone()),
                None => Ok(DeliveryReceipt {
                    message_id: message.id(),
                    acknowledged_by: domain.clone(),
                    acked_at: Utc::now(),
                }),
            }
        }
    }

    /// Dead letter store whose writes fail while `failing` is set.
    struct FlakyDeadLetters {
        inner: InMemoryDeadLetterRepository,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DeadLetterRepository for FlakyDeadLetters {
        async fn save(&self, dead: &DeadMessage) -> Result<(), RepositoryError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RepositoryError::Storage("disk full".to_string()));
            }
            self.inner.save(dead).await
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<DeadMessage>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn query(&self, query: &DeadLetterQuery) -> Result<Vec<DeadMessage>, RepositoryError> {
            self.inner.query(query).await
        }

        async fn delete(&self, id: MessageId) -> Result<(), RepositoryError> {
            self.inner.delete(id).await
        }

        async fn purge_replayed(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize, RepositoryError> {
            self.inner.purge_replayed(cutoff).await
        }
    }

    struct Harness {
        engine: Arc<StoreForwardEngine>,
        repository: Arc<InMemoryStoreForwardRepository>,
        dead_letters: Arc<DeadLetterManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        event_bus: EventBus,
    }

    fn harness(link: Arc<ScriptedLink>, max_retries: u32) -> Harness {
        harness_with(link, max_retries, Arc::new(InMemoryDeadLetterRepository::new()))
    }

    fn harness_with(
        link: Arc<ScriptedLink>,
        max_retries: u32,
        dead_letter_repo: Arc<dyn DeadLetterRepository>,
    ) -> Harness {
        let event_bus = EventBus::new(128);
        let registry = Arc::new(AgentRegistry::new(
            DomainId::new("us"),
            TrustPolicy::default(),
            Duration::from_secs(300),
            event_bus.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterManager::new(
            dead_letter_repo,
            registry,
            event_bus.clone(),
            3,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 100,
                recovery_timeout: Duration::from_secs(60),
            },
            event_bus.clone(),
        ));
        let repository = Arc::new(InMemoryStoreForwardRepository::new());
        let config = StoreForwardConfig {
            max_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                factor: 2.0,
                cap: Duration::from_millis(5),
                max_attempts: None,
                jitter: 0.0,
            },
            max_in_flight: 4,
            ack_timeout: Duration::from_secs(1),
            state_path: None,
        };
        let engine = Arc::new(StoreForwardEngine::new(
            repository.clone(),
            link,
            breakers.clone(),
            dead_letters.clone(),
            event_bus.clone(),
            config,
            CancellationToken::new(),
        ));
        Harness {
            engine,
            repository,
            dead_letters,
            breakers,
            event_bus,
        }
    }

    fn remote_message() -> Message {
        Message::new(MessageType::Simple, "a").to("b@eu")
    }

    #[tokio::test]
    async fn test_delivered_entry_is_purged() {
        let h = harness(ScriptedLink::new(None), 3);
        let mut events = h.event_bus.subscribe();
        let message = remote_message();

        let handle = h.engine.enqueue(message.clone(), DomainId::new("eu")).await.unwrap();
        assert_eq!(handle.clone().wait().await, DeliveryStatus::Delivered);
        assert!(h.repository.find_by_id(message.id()).await.unwrap().is_none());
        assert_eq!(h.engine.status(message.id()).await.unwrap(), Some(DeliveryStatus::Delivered));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            BusEvent::Delivery(DeliveryEvent::MessageDelivered { message_id, .. }) if message_id == message.id()
        ));
    }

    #[tokio::test]
    async fn test_exhausted_entry_becomes_one_dead_letter() {
        let link = ScriptedLink::new(Some(DeliveryFailure::Network("connection refused".into())));
        let h = harness(link.clone(), 3);
        let message = remote_message();

        let handle = h.engine.enqueue(message.clone(), DomainId::new("eu")).await.unwrap();
        assert_eq!(handle.wait().await, DeliveryStatus::Failed);
        assert_eq!(link.calls.load(Ordering::SeqCst), 3);

        let dead = h.dead_letters.query(&DeadLetterQuery::default()).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, FailureReason::Network);
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(dead[0].target_domain, Some(DomainId::new("eu")));
        assert!(h.repository.find_by_id(message.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_nack_is_terminal_immediately() {
        let link = ScriptedLink::new(Some(DeliveryFailure::Validation("bad payload".into())));
        let h = harness(link.clone(), 5);

        let handle = h.engine.enqueue(remote_message(), DomainId::new("eu")).await.unwrap();
        assert_eq!(handle.wait().await, DeliveryStatus::Failed);
        assert_eq!(link.calls.load(Ordering::SeqCst), 1);

        let dead = h.dead_letters.query(&DeadLetterQuery::default()).await.unwrap();
        assert_eq!(dead[0].reason, FailureReason::Validation);
    }

    #[tokio::test]
    async fn test_expired_message_is_dead_lettered_without_attempt() {
        let link = ScriptedLink::new(None);
        let h = harness(link.clone(), 3);
        let mut message = remote_message().with_ttl(1);
        message.timestamp = Utc::now() - chrono::Duration::seconds(10);

        let handle = h.engine.enqueue(message, DomainId::new("eu")).await.unwrap();
        assert_eq!(handle.status(), DeliveryStatus::Failed);
        assert_eq!(link.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_without_counting() {
        let link = ScriptedLink::new(None);
        let h = harness(link.clone(), 3);
        let eu = DomainId::new("eu");
        for _ in 0..100 {
            h.breakers.acquire(&eu).unwrap().failure();
        }

        let message = remote_message();
        let handle = h.engine.enqueue(message.clone(), eu).await.unwrap();
        assert_eq!(handle.clone().wait_timeout(Duration::from_millis(50)).await, None);

        let stored = h.repository.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.next_retry_at > Utc::now());
        assert_eq!(link.calls.load(Ordering::SeqCst), 0);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_recover_resumes_persisted_entries() {
        let h = harness(ScriptedLink::new(None), 3);
        let entry = StoreForwardEntry::new(remote_message(), DomainId::new("eu"), 3, Utc::now());
        let id = entry.message_id();
        h.repository.save(&entry).await.unwrap();

        assert_eq!(h.engine.recover().await.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.engine.status(id).await.unwrap() != Some(DeliveryStatus::Delivered) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_shares_delivery() {
        let link = ScriptedLink::new(Some(DeliveryFailure::Network("down".into())));
        let h = harness(link, 1000);
        let message = remote_message();

        let first = h.engine.enqueue(message.clone(), DomainId::new("eu")).await.unwrap();
        let second = h.engine.enqueue(message, DomainId::new("eu")).await.unwrap();
        assert_eq!(first.message_id(), second.message_id());
        assert_eq!(h.engine.in_flight(), 1);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_failed_dead_letter_handoff_is_retried() {
        let dead_letter_repo = Arc::new(FlakyDeadLetters {
            inner: InMemoryDeadLetterRepository::new(),
            failing: AtomicBool::new(true),
        });
        let link = ScriptedLink::new(Some(DeliveryFailure::Validation("bad payload".into())));
        let h = harness_with(link, 3, dead_letter_repo.clone());
        let message = remote_message();

        let handle = h.engine.enqueue(message.clone(), DomainId::new("eu")).await.unwrap();
        assert_eq!(handle.wait().await, DeliveryStatus::Failed);

        let stored = h.repository.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), DeliveryStatus::Failed);
        assert!(h.dead_letters.get(message.id()).await.unwrap().is_none());
        assert_eq!(h.engine.retry_failed_handoffs().await.unwrap(), 0);
        assert!(h.repository.find_by_id(message.id()).await.unwrap().is_some());

        dead_letter_repo.failing.store(false, Ordering::SeqCst);
        assert_eq!(h.engine.recover().await.unwrap(), 0);

        let dead = h.dead_letters.get(message.id()).await.unwrap().unwrap();
        assert_eq!(dead.reason, FailureReason::Validation);
        assert_eq!(dead.target_domain, Some(DomainId::new("eu")));
        assert!(h.repository.find_by_id(message.id()).await.unwrap().is_none());
    }
}
