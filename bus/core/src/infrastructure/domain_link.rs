// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Pub/Sub Domain Link
//
// Sending half of cross-domain delivery. A `ForwardEnvelope` is published on
// the target domain's inbound channel; the receiving gateway answers with a
// `DomainAck` on this domain's ack channel, matched back to the waiting
// attempt by message id. No ack within `ack_timeout` is a network failure.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::correlation::{CorrelationError, Correlator};
use crate::domain::agent::DomainId;
use crate::domain::delivery::{DeliveryFailure, DeliveryReceipt};
use crate::domain::link::{DomainAck, ForwardEnvelope, RemoteDomainLink};
use crate::domain::message::{Message, MessageError, MessageId};
use crate::domain::transport::{Channels, TransportError};
use crate::infrastructure::codec::JsonCodec;
use crate::infrastructure::transport::ConnectionManager;

pub struct PubSubDomainLink {
    connection: Arc<ConnectionManager>,
    channels: Channels,
    local_domain: DomainId,
    ack_timeout: Duration,
    acks: Correlator<MessageId, DomainAck>,
}

impl PubSubDomainLink {
    pub fn new(
        connection: Arc<ConnectionManager>,
        channels: Channels,
        local_domain: DomainId,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            channels,
            local_domain,
            ack_timeout,
            acks: Correlator::new(),
        }
    }

    /// Subscribes to this domain's ack channel and starts matching acks to waiters.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>, TransportError> {
        let channel = self.channels.domain_acks(&self.local_domain);
        let mut stream = self.connection.subscribe(&channel).await?;
        let acks = self.acks.clone();
        info!(channel = %channel, "Domain link listening for acks");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = stream.next() => {
                        let Some(bytes) = item else {
                            warn!(channel = %channel, "Ack subscription ended");
                            break;
                        };
                        match serde_json::from_slice::<DomainAck>(&bytes) {
                            Ok(ack) => {
                                let message_id = ack.message_id;
                                if !acks.resolve(&message_id, ack) {
                                    debug!(message_id = %message_id, "Ack for an attempt nobody is waiting on");
                                }
                            }
                            Err(err) => warn!(channel = %channel, "Dropping undecodable ack: {}", err),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }))
    }
}

#[async_trait]
impl RemoteDomainLink for PubSubDomainLink {
    async fn deliver(&self, domain: &DomainId, message: &Message) -> Result<DeliveryReceipt, DeliveryFailure> {
        let pending = self.acks.register(message.id()).map_err(|e| DeliveryFailure::Unknown(e.to_string()))?;

        let envelope = ForwardEnvelope {
            origin: self.local_domain.clone(),
            message: message.clone(),
        };
        let payload = serde_json::to_vec(&envelope).map_err(|e| DeliveryFailure::Validation(e.to_string()))?;

        self.connection
            .publish(&self.channels.domain_inbound(domain), Bytes::from(payload))
            .await
            .map_err(|e| DeliveryFailure::Network(e.to_string()))?;

        match pending.wait(self.ack_timeout).await {
            Ok(ack) => ack.into_result(),
            Err(CorrelationError::Timeout(after)) => Err(DeliveryFailure::Network(format!(
                "no ack from domain {domain} within {after:?}"
            ))),
            Err(err) => Err(DeliveryFailure::Network(err.to_string())),
        }
    }
}

/// Splits an inbound forward envelope into its origin and message.
///
/// The origin is needed to answer even when the message itself is malformed,
/// so it is read before the message is decoded.
pub fn decode_forward(bytes: &[u8]) -> Result<(DomainId, Result<Message, MessageError>), MessageError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(format!("invalid envelope: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(MessageError::Malformed("envelope is not a JSON object".to_string()));
    };
    let origin = match object.get("origin") {
        Some(Value::String(origin)) if !origin.is_empty() => DomainId::new(origin.clone()),
        _ => return Err(MessageError::Malformed("envelope has no origin".to_string())),
    };
    let message = match object.remove("message") {
        Some(message) => JsonCodec::decode_value(message),
        None => Err(MessageError::Malformed("envelope has no message".to_string())),
    };
    Ok((origin, message))
}

/// Best-effort id of a message that failed to decode, so it can still be nacked.
pub fn peek_message_id(bytes: &[u8]) -> Option<MessageId> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("message")?
        .get("id")?
        .as_str()
        .and_then(|id| MessageId::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backoff::BackoffPolicy;
    use crate::domain::message::MessageType;
    use crate::domain::transport::PubSubBackend;
    use crate::infrastructure::transport::InMemoryPubSub;

    async fn connection(pubsub: &InMemoryPubSub) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(pubsub.clone()),
            BackoffPolicy::default().with_max_attempts(1),
            Duration::from_millis(100),
        ));
        manager.connect().await.unwrap();
        manager
    }

    /// Answers every forward on `domain`'s inbound channel with `reply`.
    async fn fake_remote(pubsub: InMemoryPubSub, channels: Channels, domain: DomainId, nack: Option<DeliveryFailure>) {
        let mut inbound = pubsub.subscribe(&channels.domain_inbound(&domain)).await.unwrap();
        tokio::spawn(async move {
            while let Some(bytes) = inbound.next().await {
                let (origin, message) = decode_forward(&bytes).unwrap();
                let message = message.unwrap();
                let ack = match &nack {
                    None => DomainAck::ack(message.id(), domain.clone()),
                    Some(failure) => DomainAck::nack(message.id(), domain.clone(), failure.clone()),
                };
                let payload = serde_json::to_vec(&ack).unwrap();
                pubsub
                    .publish(&channels.domain_acks(&origin), Bytes::from(payload))
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_deliver_returns_receipt_on_ack() {
        let pubsub = InMemoryPubSub::new();
        let channels = Channels::new("t");
        fake_remote(pubsub.clone(), channels.clone(), DomainId::new("eu"), None).await;

        let link = PubSubDomainLink::new(connection(&pubsub).await, channels, DomainId::new("us"), Duration::from_secs(1));
        let shutdown = CancellationToken::new();
        link.start(shutdown.clone()).await.unwrap();

        let message = Message::new(MessageType::Simple, "a").to("b@eu");
        let receipt = link.deliver(&DomainId::new("eu"), &message).await.unwrap();
        assert_eq!(receipt.message_id, message.id());
        assert_eq!(receipt.acknowledged_by, DomainId::new("eu"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_nack_maps_to_failure() {
        let pubsub = InMemoryPubSub::new();
        let channels = Channels::new("t");
        let failure = DeliveryFailure::TargetUnavailable("b is offline".into());
        fake_remote(pubsub.clone(), channels.clone(), DomainId::new("eu"), Some(failure.clone())).await;

        let link = PubSubDomainLink::new(connection(&pubsub).await, channels, DomainId::new("us"), Duration::from_secs(1));
        link.start(CancellationToken::new()).await.unwrap();

        let message = Message::new(MessageType::Simple, "a").to("b@eu");
        assert_eq!(link.deliver(&DomainId::new("eu"), &message).await, Err(failure));
    }

    #[tokio::test]
    async fn test_missing_ack_is_network_failure() {
        let pubsub = InMemoryPubSub::new();
        let link = PubSubDomainLink::new(
            connection(&pubsub).await,
            Channels::new("t"),
            DomainId::new("us"),
            Duration::from_millis(20),
        );
        link.start(CancellationToken::new()).await.unwrap();

        let message = Message::new(MessageType::Simple, "a").to("b@nowhere");
        let result = link.deliver(&DomainId::new("nowhere"), &message).await;
        assert!(matches!(result, Err(DeliveryFailure::Network(_))));
    }

    #[test]
    fn test_decode_forward_keeps_origin_for_bad_message() {
        let raw = serde_json::json!({ "origin": "us", "message": { "id": "x" } });
        let (origin, message) = decode_forward(raw.to_string().as_bytes()).unwrap();
        assert_eq!(origin, DomainId::new("us"));
        assert!(message.is_err());
        assert!(decode_forward(b"{}").is_err());
    }
}
