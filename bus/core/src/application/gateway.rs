// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Domain Gateway
//
// Receiving half of cross-domain delivery. Every forward envelope that lands
// on this domain's inbound channel is answered exactly once on the origin's
// ack channel: `ack` after the local publish succeeded, otherwise a `nack`
// whose reason drives the sender's retry and dead-letter decisions.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::router::{MessageRouter, RouteError};
use crate::domain::agent::DomainId;
use crate::domain::delivery::DeliveryFailure;
use crate::domain::link::DomainAck;
use crate::domain::transport::{Channels, TransportError};
use crate::infrastructure::domain_link::{decode_forward, peek_message_id};
use crate::infrastructure::transport::ConnectionManager;

pub struct DomainGateway {
    connection: Arc<ConnectionManager>,
    channels: Channels,
    local_domain: DomainId,
    router: Arc<MessageRouter>,
}

impl DomainGateway {
    pub fn new(
        connection: Arc<ConnectionManager>,
        channels: Channels,
        local_domain: DomainId,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            connection,
            channels,
            local_domain,
            router,
        }
    }

    /// Subscribes to the inbound channel and answers forwards until `shutdown`.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>, TransportError> {
        let channel = self.channels.domain_inbound(&self.local_domain);
        let mut inbound = self.connection.subscribe(&channel).await?;
        info!(channel = %channel, "Domain gateway accepting forwarded messages");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = inbound.next() => {
                        let Some(bytes) = item else {
                            warn!(channel = %channel, "Inbound subscription ended");
                            break;
                        };
                        self.handle_forward(&bytes).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Domain gateway stopped");
        }))
    }

    /// Delivers one forward envelope locally and answers the origin domain.
    pub async fn handle_forward(&self, bytes: &[u8]) {
        let (origin, decoded) = match decode_forward(bytes) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("Dropping undecodable forward envelope: {}", err);
                return;
            }
        };

        let ack = match decoded {
            Ok(message) => {
                let message_id = message.id();
                match self.router.deliver_inbound(&message).await {
                    Ok(()) => DomainAck::ack(message_id, self.local_domain.clone()),
                    Err(err) => {
                        debug!(message_id = %message_id, origin = %origin, "Rejecting forwarded message: {}", err);
                        DomainAck::nack(message_id, self.local_domain.clone(), classify(&err))
                    }
                }
            }
            Err(err) => match peek_message_id(bytes) {
                Some(message_id) => DomainAck::nack(
                    message_id,
                    self.local_domain.clone(),
                    DeliveryFailure::Validation(err.to_string()),
                ),
                None => {
                    warn!(origin = %origin, "Dropping malformed forwarded message without an id: {}", err);
                    return;
                }
            },
        };

        let payload = match serde_json::to_vec(&ack) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(message_id = %ack.message_id, "Failed to encode ack: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .connection
            .publish(&self.channels.domain_acks(&origin), Bytes::from(payload))
            .await
        {
            warn!(message_id = %ack.message_id, origin = %origin, "Failed to answer forwarded message: {}", err);
        }
    }
}

fn classify(err: &RouteError) -> DeliveryFailure {
    match err {
        RouteError::TargetUnavailable(_) => DeliveryFailure::TargetUnavailable(err.to_string()),
        RouteError::Expired(_) | RouteError::Encoding(_) => DeliveryFailure::Validation(err.to_string()),
        RouteError::Transport(_) => DeliveryFailure::Network(err.to_string()),
        RouteError::Enqueue { .. } => DeliveryFailure::Unknown(err.to_string()),
    }
}
