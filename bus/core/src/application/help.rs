// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Help Request Manager
//!
//! Owns every [`HelpRequest`] and drives it through
//! `Pending -> Responded -> InProgress -> Completed | Failed`, with `Timeout`
//! reachable from any non-terminal state. Each request sits behind its own
//! mutex; transitions never wait on another request and messages are sent
//! only after the lock is released.
//!
//! Wire messages (correlation id = request id in all of them):
//!
//! | Type | Direction | Payload |
//! |------|-----------|---------|
//! | `help-wanted` | broadcast | `requestId`, `requiredCapabilities`, `description`, `timeoutMinutes` |
//! | `help-response` | helper -> requester | `requestId` |
//! | `help-selected` | requester -> chosen helper | `requestId`, `description` |
//! | `help-completed` | requester -> chosen helper | `requestId`, `success` |

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::registry::AgentRegistry;
use crate::application::router::{MessageRouter, RouteError};
use crate::domain::agent::AgentId;
use crate::domain::backoff::to_chrono;
use crate::domain::events::HelpEvent;
use crate::domain::help::{HelpError, HelpRequest, HelpRequestId, HelpStatus};
use crate::domain::message::{Message, MessageType};
use crate::infrastructure::event_bus::EventBus;

/// How long finished requests stay queryable before the sweeper drops them.
pub const FINISHED_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum HelpManagerError {
    #[error(transparent)]
    State(#[from] HelpError),

    #[error("Failed to send {message_type} for help request {request_id}: {source}")]
    Send {
        request_id: HelpRequestId,
        message_type: &'static str,
        source: RouteError,
    },
}

pub struct HelpRequestManager {
    requests: DashMap<HelpRequestId, Arc<Mutex<HelpRequest>>>,
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    event_bus: EventBus,
    default_timeout_minutes: u32,
}

impl HelpRequestManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<MessageRouter>,
        event_bus: EventBus,
        default_timeout_minutes: u32,
    ) -> Self {
        Self {
            requests: DashMap::new(),
            registry,
            router,
            event_bus,
            default_timeout_minutes,
        }
    }

    /// Opens a request and broadcasts `help-wanted`. The request is dropped
    /// again when the broadcast cannot be sent.
    pub async fn request_help(
        &self,
        requester: AgentId,
        required_capabilities: impl IntoIterator<Item = String>,
        description: impl Into<String>,
        timeout_minutes: Option<u32>,
    ) -> Result<HelpRequestId, HelpManagerError> {
        let now = Utc::now();
        let capabilities: BTreeSet<String> = required_capabilities
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let timeout_minutes = timeout_minutes.unwrap_or(self.default_timeout_minutes);
        let mut request = HelpRequest::new(requester.clone(), capabilities, description, timeout_minutes, now);

        let required: Vec<String> = request.required_capabilities.iter().cloned().collect();
        request.candidates = self
            .registry
            .find_by_capabilities_at(&required, now)
            .into_iter()
            .map(|m| m.agent.agent_id)
            .filter(|id| *id != requester)
            .collect();

        let request_id = request.request_id;
        let candidate_count = request.candidates.len();
        let wanted = Message::new(MessageType::HelpWanted, requester.clone())
            .correlated_with(request_id.to_string())
            .with_field("requestId", request_id.to_string())
            .with_field("requiredCapabilities", json!(required))
            .with_field("description", request.description.clone())
            .with_field("timeoutMinutes", timeout_minutes);

        self.requests.insert(request_id, Arc::new(Mutex::new(request)));

        if let Err(source) = self.router.route(wanted).await {
            self.requests.remove(&request_id);
            return Err(HelpManagerError::Send {
                request_id,
                message_type: "help-wanted",
                source,
            });
        }

        info!(
            request_id = %request_id,
            requester_id = %requester,
            candidates = candidate_count,
            timeout_minutes,
            "Help requested"
        );
        metrics::counter!("meshbus_help_requests_total").increment(1);
        self.event_bus.publish_help_event(HelpEvent::HelpRequested {
            request_id,
            requester_id: requester,
            candidate_count,
            requested_at: now,
        });
        Ok(request_id)
    }

    /// Records a `help-response`. Returns `false` when the message was ignored
    /// (unknown or finished request, or a repeat response).
    pub fn handle_help_response(&self, message: &Message) -> bool {
        let Some(request_id) = request_id_of(message) else {
            debug!(message_id = %message.id(), "Help response without a request id");
            return false;
        };
        let Some(slot) = self.slot(request_id) else {
            debug!(request_id = %request_id, responder = %message.source(), "Response for unknown help request");
            return false;
        };

        let now = Utc::now();
        let recorded = slot.lock().record_response(message.source().clone(), now);
        match recorded {
            Ok(true) => {
                info!(request_id = %request_id, responder = %message.source(), "Help response received");
                self.event_bus.publish_help_event(HelpEvent::ResponseReceived {
                    request_id,
                    responder_id: message.source().clone(),
                    received_at: now,
                });
                true
            }
            Ok(false) => {
                debug!(request_id = %request_id, responder = %message.source(), "Duplicate help response");
                false
            }
            Err(err) => {
                debug!(request_id = %request_id, responder = %message.source(), "Ignoring help response: {}", err);
                false
            }
        }
    }

    /// Picks one responder and tells them with a targeted `help-selected`.
    ///
    /// The request stays `InProgress` when the notification cannot be sent.
    pub async fn select_helper(&self, request_id: HelpRequestId, responder: AgentId) -> Result<(), HelpManagerError> {
        let slot = self.slot(request_id).ok_or(HelpError::NotFound(request_id))?;
        let now = Utc::now();
        let (requester, description) = {
            let mut request = slot.lock();
            request.select(responder.clone(), now)?;
            (request.requester_id.clone(), request.description.clone())
        };

        info!(request_id = %request_id, responder = %responder, "Helper selected");
        self.event_bus.publish_help_event(HelpEvent::HelperSelected {
            request_id,
            responder_id: responder.clone(),
            selected_at: now,
        });

        let selected = Message::new(MessageType::HelpSelected, requester)
            .to(responder)
            .correlated_with(request_id.to_string())
            .with_field("requestId", request_id.to_string())
            .with_field("description", description);
        self.router
            .route(selected)
            .await
            .map(|_| ())
            .map_err(|source| HelpManagerError::Send {
                request_id,
                message_type: "help-selected",
                source,
            })
    }

    /// Closes an in-progress request and feeds the outcome into the helper's trust.
    pub async fn complete_help(&self, request_id: HelpRequestId, success: bool) -> Result<(), HelpManagerError> {
        let slot = self.slot(request_id).ok_or(HelpError::NotFound(request_id))?;
        let now = Utc::now();
        let (requester, helper, status) = {
            let mut request = slot.lock();
            request.complete(success, now)?;
            (
                request.requester_id.clone(),
                request.selected_responder().cloned(),
                request.status(),
            )
        };

        if let Some(helper) = &helper {
            if let Err(err) = self.registry.update_trust(helper, success) {
                warn!(request_id = %request_id, helper = %helper, "Trust not updated: {}", err);
            }
        }

        info!(request_id = %request_id, status = %status, "Help request finished");
        self.event_bus.publish_help_event(HelpEvent::HelpFinished {
            request_id,
            status,
            finished_at: now,
        });

        if let Some(helper) = helper {
            let completed = Message::new(MessageType::HelpCompleted, requester)
                .to(helper.clone())
                .correlated_with(request_id.to_string())
                .with_field("requestId", request_id.to_string())
                .with_field("success", success);
            if let Err(err) = self.router.route(completed).await {
                warn!(request_id = %request_id, helper = %helper, "Failed to notify helper of completion: {}", err);
            }
        }
        Ok(())
    }

    /// Abandons a request without touching anyone's trust.
    pub fn cancel(&self, request_id: HelpRequestId) -> Result<(), HelpManagerError> {
        let slot = self.slot(request_id).ok_or(HelpError::NotFound(request_id))?;
        let now = Utc::now();
        slot.lock().cancel(now)?;
        info!(request_id = %request_id, "Help request cancelled");
        self.event_bus.publish_help_event(HelpEvent::HelpFinished {
            request_id,
            status: HelpStatus::Failed,
            finished_at: now,
        });
        Ok(())
    }

    /// Times out every non-terminal request whose deadline has passed.
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<HelpRequestId> {
        let slots: Vec<_> = self.requests.iter().map(|e| (*e.key(), e.value().clone())).collect();
        let mut expired = Vec::new();
        for (request_id, slot) in slots {
            if slot.lock().expire_if_due(now) {
                info!(request_id = %request_id, "Help request timed out");
                self.event_bus.publish_help_event(HelpEvent::HelpFinished {
                    request_id,
                    status: HelpStatus::Timeout,
                    finished_at: now,
                });
                expired.push(request_id);
            }
        }
        expired
    }

    /// Drops terminal requests last updated more than `retention` ago.
    pub fn purge_finished(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - to_chrono(retention);
        let before = self.requests.len();
        self.requests.retain(|_, slot| {
            let request = slot.lock();
            !(request.status().is_terminal() && request.updated_at() < cutoff)
        });
        before.saturating_sub(self.requests.len())
    }

    pub fn get(&self, request_id: HelpRequestId) -> Option<HelpRequest> {
        self.slot(request_id).map(|slot| slot.lock().clone())
    }

    /// Non-terminal requests, oldest first.
    pub fn list_active(&self) -> Vec<HelpRequest> {
        let mut active: Vec<HelpRequest> = self
            .requests
            .iter()
            .map(|e| e.value().lock().clone())
            .filter(|r| !r.status().is_terminal())
            .collect();
        active.sort_by_key(|r| r.created_at);
        active
    }

    fn slot(&self, request_id: HelpRequestId) -> Option<Arc<Mutex<HelpRequest>>> {
        self.requests.get(&request_id).map(|e| e.value().clone())
    }
}

/// Request id carried by a help message: the correlation id, else `payload.requestId`.
pub fn request_id_of(message: &Message) -> Option<HelpRequestId> {
    message
        .correlation_id()
        .and_then(|id| HelpRequestId::parse_str(id).ok())
        .or_else(|| {
            message
                .payload_str("requestId")
                .and_then(|id| HelpRequestId::parse_str(id).ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breakers::CircuitBreakerRegistry;
    use crate::application::dead_letter::DeadLetterManager;
    use crate::application::store_forward::StoreForwardEngine;
    use crate::domain::agent::{DomainId, TrustPolicy};
    use crate::domain::backoff::BackoffPolicy;
    use crate::domain::delivery::{DeliveryFailure, DeliveryReceipt};
    use crate::domain::link::RemoteDomainLink;
    use crate::domain::mesh_config::StoreForwardConfig;
    use crate::domain::transport::{Channels, PubSubBackend};
    use crate::infrastructure::codec::JsonCodec;
    use crate::infrastructure::repositories::{InMemoryDeadLetterRepository, InMemoryStoreForwardRepository};
    use crate::infrastructure::transport::{ConnectionManager, InMemoryPubSub};
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    struct NoRemote;

    #[async_trait]
    impl RemoteDomainLink for NoRemote {
        async fn deliver(&self, _: &DomainId, _: &Message) -> Result<DeliveryReceipt, DeliveryFailure> {
            Err(DeliveryFailure::Network("no remote domains in this test".into()))
        }
    }

    async fn manager(pubsub: &InMemoryPubSub) -> (HelpRequestManager, Arc<AgentRegistry>) {
        let event_bus = EventBus::new(64);
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(pubsub.clone()),
            BackoffPolicy::default().with_max_attempts(1),
            Duration::from_millis(100),
        ));
        connection.connect().await.unwrap();
        let registry = Arc::new(AgentRegistry::new(
            DomainId::new("local"),
            TrustPolicy::default(),
            Duration::from_secs(300),
            event_bus.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterManager::new(
            Arc::new(InMemoryDeadLetterRepository::new()),
            registry.clone(),
            event_bus.clone(),
            3,
        ));
        let store_forward = Arc::new(StoreForwardEngine::new(
            Arc::new(InMemoryStoreForwardRepository::new()),
            Arc::new(NoRemote),
            Arc::new(CircuitBreakerRegistry::new(Default::default(), event_bus.clone())),
            dead_letters,
            event_bus.clone(),
            StoreForwardConfig::default(),
            CancellationToken::new(),
        ));
        let router = Arc::new(MessageRouter::new(
            connection,
            Channels::new("t"),
            DomainId::new("local"),
            registry.clone(),
            store_forward,
        ));
        (HelpRequestManager::new(registry.clone(), router, event_bus, 10), registry)
    }

    fn response(request_id: HelpRequestId, from: &str) -> Message {
        Message::new(MessageType::HelpResponse, from)
            .to("asker")
            .correlated_with(request_id.to_string())
    }

    fn sql() -> Vec<String> {
        vec!["sql".to_string()]
    }

    #[tokio::test]
    async fn test_request_help_broadcasts_and_records_candidates() {
        let pubsub = InMemoryPubSub::new();
        let (manager, registry) = manager(&pubsub).await;
        registry.register_or_update(AgentId::new("asker"), sql(), vec![]);
        registry.register_or_update(AgentId::new("dba"), sql(), vec![]);
        let mut broadcast = pubsub.subscribe(&Channels::new("t").broadcast()).await.unwrap();

        let id = manager
            .request_help(AgentId::new("asker"), sql(), "slow query", None)
            .await
            .unwrap();

        let wanted = JsonCodec::decode(&broadcast.next().await.unwrap()).unwrap();
        assert_eq!(wanted.message_type(), &MessageType::HelpWanted);
        assert_eq!(wanted.correlation_id(), Some(id.to_string().as_str()));
        assert_eq!(wanted.payload()["requiredCapabilities"], json!(["sql"]));
        assert_eq!(wanted.payload()["timeoutMinutes"], json!(10));

        let request = manager.get(id).unwrap();
        assert_eq!(request.status(), HelpStatus::Pending);
        assert_eq!(request.candidates, vec![AgentId::new("dba")]);
    }

    #[tokio::test]
    async fn test_full_lifecycle_updates_trust() {
        let pubsub = InMemoryPubSub::new();
        let (manager, registry) = manager(&pubsub).await;
        registry.register_or_update(AgentId::new("dba"), sql(), vec![]);
        let mut helper_inbox = pubsub.subscribe(&Channels::new("t").agent(&AgentId::new("dba"))).await.unwrap();

        let id = manager.request_help(AgentId::new("asker"), sql(), "help", None).await.unwrap();
        assert!(manager.handle_help_response(&response(id, "dba")));
        assert!(!manager.handle_help_response(&response(id, "dba")));
        assert_eq!(manager.get(id).unwrap().responses().len(), 1);

        let wrong = manager.select_helper(id, AgentId::new("stranger")).await;
        assert!(matches!(wrong, Err(HelpManagerError::State(HelpError::NotAResponder { .. }))));
        assert_eq!(manager.get(id).unwrap().status(), HelpStatus::Responded);

        manager.select_helper(id, AgentId::new("dba")).await.unwrap();
        let selected = JsonCodec::decode(&helper_inbox.next().await.unwrap()).unwrap();
        assert_eq!(selected.message_type(), &MessageType::HelpSelected);

        manager.complete_help(id, true).await.unwrap();
        assert_eq!(manager.get(id).unwrap().status(), HelpStatus::Completed);
        assert!(registry.get(&AgentId::new("dba")).unwrap().raw_trust() > 0.5);

        let completed = JsonCodec::decode(&helper_inbox.next().await.unwrap()).unwrap();
        assert_eq!(completed.payload()["success"], json!(true));
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transitions_leave_state_unchanged() {
        let pubsub = InMemoryPubSub::new();
        let (manager, _) = manager(&pubsub).await;
        let id = manager.request_help(AgentId::new("asker"), sql(), "help", None).await.unwrap();

        assert!(manager.complete_help(id, true).await.is_err());
        assert!(manager.select_helper(id, AgentId::new("x")).await.is_err());
        assert_eq!(manager.get(id).unwrap().status(), HelpStatus::Pending);

        manager.cancel(id).unwrap();
        assert_eq!(manager.get(id).unwrap().status(), HelpStatus::Failed);
        assert!(!manager.handle_help_response(&response(id, "late")));
        assert!(manager.cancel(id).is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let pubsub = InMemoryPubSub::new();
        let (manager, _) = manager(&pubsub).await;
        let id = manager
            .request_help(AgentId::new("asker"), sql(), "help", Some(0))
            .await
            .unwrap();
        assert!(manager.handle_help_response(&response(id, "dba")));

        assert_eq!(manager.check_timeouts(Utc::now()), vec![id]);
        assert_eq!(manager.get(id).unwrap().status(), HelpStatus::Timeout);
        assert!(manager.check_timeouts(Utc::now()).is_empty());
        assert!(!manager.handle_help_response(&response(id, "late")));
        assert!(manager.select_helper(id, AgentId::new("dba")).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_request_and_failed_broadcast() {
        let pubsub = InMemoryPubSub::new();
        let (manager, _) = manager(&pubsub).await;
        assert!(!manager.handle_help_response(&response(HelpRequestId::new(), "dba")));

        pubsub.set_available(false);
        let result = manager.request_help(AgentId::new("asker"), sql(), "help", None).await;
        assert!(matches!(result, Err(HelpManagerError::Send { .. })));
        assert!(manager.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_purge_finished_keeps_active() {
        let pubsub = InMemoryPubSub::new();
        let (manager, _) = manager(&pubsub).await;
        let done = manager.request_help(AgentId::new("a"), sql(), "x", None).await.unwrap();
        let open = manager.request_help(AgentId::new("b"), sql(), "y", None).await.unwrap();
        manager.cancel(done).unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(manager.purge_finished(later, FINISHED_RETENTION), 1);
        assert!(manager.get(done).is_none());
        assert!(manager.get(open).is_some());
    }
}
