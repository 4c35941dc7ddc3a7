// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Message Router
//!
//! Broadcasts and messages for agents in this domain are a single publish on
//! the substrate and fail synchronously. Messages for agents in other domains
//! are handed to the [`StoreForwardEngine`] and reported as queued.
//!
//! A target's domain comes from its registry record, then from its
//! `agent@domain` suffix, and defaults to the local domain.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::application::dead_letter::RecoveryExecutor;
use crate::application::registry::AgentRegistry;
use crate::application::store_forward::{DeliveryHandle, StoreForwardEngine};
use crate::domain::agent::{AgentId, DomainId};
use crate::domain::message::{Message, MessageError, MessageId};
use crate::domain::repository::RepositoryError;
use crate::domain::transport::{Channels, TransportError};
use crate::infrastructure::codec::JsonCodec;
use crate::infrastructure::transport::ConnectionManager;

#[derive(Debug)]
pub enum RoutingDecision {
    /// Published on the target agent's channel in this domain
    Delivered { message_id: MessageId, target: AgentId },
    /// Published on the broadcast channel
    Broadcast { message_id: MessageId },
    /// Handed to store-and-forward for a remote domain
    Queued(DeliveryHandle),
}

impl RoutingDecision {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Delivered { message_id, .. } | Self::Broadcast { message_id } => *message_id,
            Self::Queued(handle) => handle.message_id(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Message {0} expired before delivery")]
    Expired(MessageId),

    #[error("Agent {0} is not available in this domain")]
    TargetUnavailable(AgentId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Encoding(#[from] MessageError),

    #[error("Failed to queue message for domain {domain}: {source}")]
    Enqueue { domain: DomainId, source: RepositoryError },
}

pub struct MessageRouter {
    connection: Arc<ConnectionManager>,
    channels: Channels,
    local_domain: DomainId,
    registry: Arc<AgentRegistry>,
    store_forward: Arc<StoreForwardEngine>,
}

impl MessageRouter {
    pub fn new(
        connection: Arc<ConnectionManager>,
        channels: Channels,
        local_domain: DomainId,
        registry: Arc<AgentRegistry>,
        store_forward: Arc<StoreForwardEngine>,
    ) -> Self {
        Self {
            connection,
            channels,
            local_domain,
            registry,
            store_forward,
        }
    }

    pub fn local_domain(&self) -> &DomainId {
        &self.local_domain
    }

    pub fn resolve_domain(&self, agent_id: &AgentId) -> DomainId {
        self.registry
            .domain_of(agent_id)
            .or_else(|| agent_id.domain_hint())
            .unwrap_or_else(|| self.local_domain.clone())
    }

    pub async fn route(&self, message: Message) -> Result<RoutingDecision, RouteError> {
        let message_id = message.id();
        if message.is_expired_at(Utc::now()) {
            debug!(message_id = %message_id, "Rejecting expired message");
            return Err(RouteError::Expired(message_id));
        }

        let Some(target) = message.target().cloned() else {
            self.publish(&self.channels.broadcast(), &message).await?;
            routed("broadcast");
            debug!(message_id = %message_id, message_type = %message.message_type(), "Message broadcast");
            return Ok(RoutingDecision::Broadcast { message_id });
        };

        let domain = self.resolve_domain(&target);
        if domain == self.local_domain {
            self.publish(&self.channels.agent(&target), &message).await?;
            routed("local");
            debug!(message_id = %message_id, target = %target, "Message delivered locally");
            return Ok(RoutingDecision::Delivered { message_id, target });
        }

        let handle = self
            .store_forward
            .enqueue(message, domain.clone())
            .await
            .map_err(|source| RouteError::Enqueue { domain, source })?;
        routed("remote");
        Ok(RoutingDecision::Queued(handle))
    }

    /// Final hop for a message forwarded from another domain. The target must
    /// be a live agent of this domain.
    pub async fn deliver_inbound(&self, message: &Message) -> Result<(), RouteError> {
        let message_id = message.id();
        if message.is_expired_at(Utc::now()) {
            return Err(RouteError::Expired(message_id));
        }
        let Some(target) = message.target() else {
            self.publish(&self.channels.broadcast(), message).await?;
            routed("inbound");
            return Ok(());
        };
        if self.resolve_domain(target) != self.local_domain || !self.registry.is_live(target) {
            return Err(RouteError::TargetUnavailable(target.clone()));
        }
        self.publish(&self.channels.agent(target), message).await?;
        routed("inbound");
        debug!(message_id = %message_id, target = %target, "Forwarded message delivered");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<(), RouteError> {
        let payload = JsonCodec::encode(message)?;
        self.connection.publish(channel, payload).await?;
        Ok(())
    }
}

fn routed(route: &'static str) {
    metrics::counter!("meshbus_messages_routed_total", "route" => route).increment(1);
}

#[async_trait]
impl RecoveryExecutor for MessageRouter {
    async fn replay(&self, message: Message) -> Result<(), String> {
        self.route(message).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::circuit_breakers::CircuitBreakerRegistry;
    use crate::application::dead_letter::DeadLetterManager;
    use crate::domain::agent::TrustPolicy;
    use crate::domain::backoff::BackoffPolicy;
    use crate::domain::delivery::{DeliveryFailure, DeliveryReceipt};
    use crate::domain::link::RemoteDomainLink;
    use crate::domain::mesh_config::StoreForwardConfig;
    use crate::domain::message::MessageType;
    use crate::domain::transport::PubSubBackend;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::{InMemoryDeadLetterRepository, InMemoryStoreForwardRepository};
    use crate::infrastructure::transport::InMemoryPubSub;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct AckingLink;

    #[async_trait]
    impl RemoteDomainLink for AckingLink {
        async fn deliver(&self, domain: &DomainId, message: &Message) -> Result<DeliveryReceipt, DeliveryFailure> {
            Ok(DeliveryReceipt {
                message_id: message.id(),
                acknowledged_by: domain.clone(),
                acked_at: Utc::now(),
            })
        }
    }

    async fn router(pubsub: &InMemoryPubSub) -> (MessageRouter, Arc<AgentRegistry>, Arc<ConnectionManager>) {
        let event_bus = EventBus::new(64);
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(pubsub.clone()),
            BackoffPolicy::default().with_max_attempts(1),
            Duration::from_millis(100),
        ));
        connection.connect().await.unwrap();
        let registry = Arc::new(AgentRegistry::new(
            DomainId::new("us"),
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
            Arc::new(AckingLink),
            Arc::new(CircuitBreakerRegistry::new(Default::default(), event_bus.clone())),
            dead_letters,
            event_bus,
            StoreForwardConfig::default(),
            CancellationToken::new(),
        ));
        let router = MessageRouter::new(
            connection.clone(),
            Channels::new("t"),
            DomainId::new("us"),
            registry.clone(),
            store_forward,
        );
        (router, registry, connection)
    }

    #[tokio::test]
    async fn test_local_target_is_one_publish() {
        let pubsub = InMemoryPubSub::new();
        let (router, _, _) = router(&pubsub).await;
        let mut inbox = pubsub.subscribe(&Channels::new("t").agent(&AgentId::new("b"))).await.unwrap();

        let message = Message::new(MessageType::Simple, "a").to("b").with_field("text", "hi");
        let decision = router.route(message.clone()).await.unwrap();
        assert!(matches!(decision, RoutingDecision::Delivered { .. }));

        let received = JsonCodec::decode(&inbox.next().await.unwrap()).unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_null_target_is_broadcast() {
        let pubsub = InMemoryPubSub::new();
        let (router, _, _) = router(&pubsub).await;
        let mut broadcast = pubsub.subscribe(&Channels::new("t").broadcast()).await.unwrap();

        let decision = router.route(Message::new(MessageType::Discovery, "a")).await.unwrap();
        assert!(matches!(decision, RoutingDecision::Broadcast { .. }));
        assert!(broadcast.next().await.is_some());
    }

    #[tokio::test]
    async fn test_remote_target_is_queued() {
        let pubsub = InMemoryPubSub::new();
        let (router, registry, _) = router(&pubsub).await;
        registry.register_in_domain(AgentId::new("c"), DomainId::new("eu"), vec![], vec![]);

        for target in ["b@eu", "c"] {
            let decision = router.route(Message::new(MessageType::Simple, "a").to(target)).await.unwrap();
            let RoutingDecision::Queued(handle) = decision else {
                panic!("expected {target} to be queued");
            };
            assert_eq!(handle.target_domain(), &DomainId::new("eu"));
        }
    }

    #[tokio::test]
    async fn test_failures_are_synchronous() {
        let pubsub = InMemoryPubSub::new();
        let (router, _, _) = router(&pubsub).await;

        let mut expired = Message::new(MessageType::Simple, "a").to("b").with_ttl(1);
        expired.timestamp = Utc::now() - chrono::Duration::seconds(5);
        assert!(matches!(router.route(expired).await, Err(RouteError::Expired(_))));

        pubsub.set_available(false);
        let result = router.route(Message::new(MessageType::Simple, "a").to("b")).await;
        assert!(matches!(result, Err(RouteError::Transport(_))));
    }

    #[tokio::test]
    async fn test_inbound_requires_live_local_target() {
        let pubsub = InMemoryPubSub::new();
        let (router, registry, _) = router(&pubsub).await;
        let message = Message::new(MessageType::Simple, "a@eu").to("b");

        assert!(matches!(
            router.deliver_inbound(&message).await,
            Err(RouteError::TargetUnavailable(_))
        ));

        registry.register_or_update(AgentId::new("b"), vec![], vec![]);
        router.deliver_inbound(&message).await.unwrap();
    }
}
