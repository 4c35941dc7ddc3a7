// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Cross-Domain Link Contract
//
// `RemoteDomainLink` is the seam between the store-and-forward engine and
// whatever carries a message into another broker domain. Only a positive
// acknowledgment from the receiving domain produces a `DeliveryReceipt`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::DomainId;
use crate::domain::delivery::{DeliveryFailure, DeliveryReceipt};
use crate::domain::message::{Message, MessageId};

#[async_trait]
pub trait RemoteDomainLink: Send + Sync {
    async fn deliver(&self, domain: &DomainId, message: &Message) -> Result<DeliveryReceipt, DeliveryFailure>;
}

/// Wire wrapper for a message crossing into another domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEnvelope {
    pub origin: DomainId,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AckOutcome {
    Ack,
    Nack { failure: DeliveryFailure },
}

/// Reply published by the receiving domain on the origin's ack channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainAck {
    pub message_id: MessageId,
    pub domain: DomainId,
    #[serde(flatten)]
    pub outcome: AckOutcome,
    pub at: DateTime<Utc>,
}

impl DomainAck {
    pub fn ack(message_id: MessageId, domain: DomainId) -> Self {
        Self {
            message_id,
            domain,
            outcome: AckOutcome::Ack,
            at: Utc::now(),
        }
    }

    pub fn nack(message_id: MessageId, domain: DomainId, failure: DeliveryFailure) -> Self {
        Self {
            message_id,
            domain,
            outcome: AckOutcome::Nack { failure },
            at: Utc::now(),
        }
    }

    pub fn into_result(self) -> Result<DeliveryReceipt, DeliveryFailure> {
        match self.outcome {
            AckOutcome::Ack => Ok(DeliveryReceipt {
                message_id: self.message_id,
                acknowledged_by: self.domain,
                acked_at: self.at,
            }),
            AckOutcome::Nack { failure } => Err(failure),
        }
    }
}
