// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, DomainId};
use crate::domain::circuit_breaker::CircuitState;
use crate::domain::delivery::{FailureReason, RecoveryAction};
use crate::domain::help::{HelpRequestId, HelpStatus};
use crate::domain::message::MessageId;

/// Agent directory changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    AgentDiscovered {
        agent_id: AgentId,
        domain: DomainId,
        capabilities: Vec<String>,
        discovered_at: DateTime<Utc>,
    },
    TrustUpdated {
        agent_id: AgentId,
        success: bool,
        trust_score: f64,
        updated_at: DateTime<Utc>,
    },
    AgentsPruned {
        count: usize,
        pruned_at: DateTime<Utc>,
    },
}

/// Help request lifecycle transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HelpEvent {
    HelpRequested {
        request_id: HelpRequestId,
        requester_id: AgentId,
        candidate_count: usize,
        requested_at: DateTime<Utc>,
    },
    ResponseReceived {
        request_id: HelpRequestId,
        responder_id: AgentId,
        received_at: DateTime<Utc>,
    },
    HelperSelected {
        request_id: HelpRequestId,
        responder_id: AgentId,
        selected_at: DateTime<Utc>,
    },
    HelpFinished {
        request_id: HelpRequestId,
        status: HelpStatus,
        finished_at: DateTime<Utc>,
    },
}

impl HelpEvent {
    pub fn request_id(&self) -> HelpRequestId {
        match self {
            Self::HelpRequested { request_id, .. }
            | Self::ResponseReceived { request_id, .. }
            | Self::HelperSelected { request_id, .. }
            | Self::HelpFinished { request_id, .. } => *request_id,
        }
    }
}

/// Message delivery outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    MessageDelivered {
        message_id: MessageId,
        domain: DomainId,
        delivered_at: DateTime<Utc>,
    },
    MessageDeadLettered {
        message_id: MessageId,
        reason: FailureReason,
        detail: String,
        dead_lettered_at: DateTime<Utc>,
    },
    DeadLetterResolved {
        message_id: MessageId,
        action: String,
        resolved_at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn resolved(message_id: MessageId, action: &RecoveryAction) -> Self {
        Self::DeadLetterResolved {
            message_id,
            action: action.to_string(),
            resolved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CircuitEvent {
    StateChanged {
        domain: DomainId,
        from: CircuitState,
        to: CircuitState,
        changed_at: DateTime<Utc>,
    },
}
