// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Help Request Aggregate
//!
//! ## Lifecycle
//! | From | Event | To |
//! |------|-------|----|
//! | `Pending` | first response | `Responded` |
//! | `Responded` | helper selected | `InProgress` |
//! | `InProgress` | completed | `Completed` / `Failed` |
//! | any non-terminal | deadline elapsed | `Timeout` |
//! | any non-terminal | cancelled | `Failed` |
//!
//! `Timeout`, `Completed` and `Failed` are terminal. Every rejected transition
//! returns [`HelpError::InvalidStateTransition`] and leaves the aggregate as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::agent::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HelpRequestId(pub Uuid);

impl HelpRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for HelpRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HelpRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpStatus {
    Pending,
    Responded,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl HelpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for HelpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HelpError {
    #[error("Invalid transition for help request {request_id}: cannot {action} while {from}")]
    InvalidStateTransition {
        request_id: HelpRequestId,
        from: HelpStatus,
        action: &'static str,
    },

    #[error("Agent {responder} has not responded to help request {request_id}")]
    NotAResponder {
        request_id: HelpRequestId,
        responder: AgentId,
    },

    #[error("Help request {0} not found")]
    NotFound(HelpRequestId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelpRequest {
    pub request_id: HelpRequestId,
    pub requester_id: AgentId,
    pub required_capabilities: BTreeSet<String>,
    pub description: String,
    status: HelpStatus,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    responses: Vec<AgentId>,
    selected_responder: Option<AgentId>,
    pub timeout_minutes: u32,
    pub candidates: Vec<AgentId>,
}

impl HelpRequest {
    pub fn new(
        requester_id: AgentId,
        required_capabilities: BTreeSet<String>,
        description: impl Into<String>,
        timeout_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: HelpRequestId::new(),
            requester_id,
            required_capabilities,
            description: description.into(),
            status: HelpStatus::Pending,
            created_at: now,
            updated_at: now,
            responses: Vec::new(),
            selected_responder: None,
            timeout_minutes,
            candidates: Vec::new(),
        }
    }

    pub fn status(&self) -> HelpStatus {
        self.status
    }

    pub fn responses(&self) -> &[AgentId] {
        &self.responses
    }

    pub fn selected_responder(&self) -> Option<&AgentId> {
        self.selected_responder.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::minutes(i64::from(self.timeout_minutes))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline()
    }

    /// Records a response. Returns `false` when the responder was already recorded.
    pub fn record_response(&mut self, responder: AgentId, now: DateTime<Utc>) -> Result<bool, HelpError> {
        self.ensure_live("record a response")?;
        if self.responses.contains(&responder) {
            return Ok(false);
        }
        self.responses.push(responder);
        if self.status == HelpStatus::Pending {
            self.status = HelpStatus::Responded;
        }
        self.updated_at = now;
        Ok(true)
    }

    pub fn select(&mut self, responder: AgentId, now: DateTime<Utc>) -> Result<(), HelpError> {
        if self.status != HelpStatus::Responded {
            return Err(self.invalid("select a helper"));
        }
        if !self.responses.contains(&responder) {
            return Err(HelpError::NotAResponder {
                request_id: self.request_id,
                responder,
            });
        }
        self.selected_responder = Some(responder);
        self.status = HelpStatus::InProgress;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, success: bool, now: DateTime<Utc>) -> Result<(), HelpError> {
        if self.status != HelpStatus::InProgress {
            return Err(self.invalid("complete"));
        }
        self.status = if success { HelpStatus::Completed } else { HelpStatus::Failed };
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), HelpError> {
        self.ensure_live("cancel")?;
        self.status = HelpStatus::Failed;
        self.updated_at = now;
        Ok(())
    }

    /// Moves a non-terminal request past its deadline to `Timeout`.
    /// Returns `true` when the transition happened.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !self.is_expired_at(now) {
            return false;
        }
        self.status = HelpStatus::Timeout;
        self.updated_at = now;
        true
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), HelpError> {
        if self.status.is_terminal() {
            Err(self.invalid(action))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, action: &'static str) -> HelpError {
        HelpError::InvalidStateTransition {
            request_id: self.request_id,
            from: self.status,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(timeout_minutes: u32) -> HelpRequest {
        HelpRequest::new(
            AgentId::new("requester"),
            BTreeSet::from(["sql".to_string()]),
            "optimise query",
            timeout_minutes,
            Utc::now(),
        )
    }

    #[test]
    fn test_happy_path() {
        let now = Utc::now();
        let mut req = request(10);
        assert!(req.record_response(AgentId::new("a"), now).unwrap());
        assert_eq!(req.status(), HelpStatus::Responded);
        assert!(req.record_response(AgentId::new("b"), now).unwrap());
        assert_eq!(req.responses().len(), 2);

        req.select(AgentId::new("b"), now).unwrap();
        assert_eq!(req.status(), HelpStatus::InProgress);
        assert_eq!(req.selected_responder(), Some(&AgentId::new("b")));

        req.complete(true, now).unwrap();
        assert_eq!(req.status(), HelpStatus::Completed);
    }

    #[test]
    fn test_duplicate_response_is_idempotent() {
        let now = Utc::now();
        let mut req = request(10);
        assert!(req.record_response(AgentId::new("a"), now).unwrap());
        assert!(!req.record_response(AgentId::new("a"), now).unwrap());
        assert_eq!(req.responses(), &[AgentId::new("a")]);
    }

    #[test]
    fn test_select_on_pending_is_rejected_and_state_unchanged() {
        let mut req = request(10);
        let before = req.clone();
        let err = req.select(AgentId::new("a"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            HelpError::InvalidStateTransition { from: HelpStatus::Pending, .. }
        ));
        assert_eq!(req, before);
    }

    #[test]
    fn test_select_requires_a_responder() {
        let now = Utc::now();
        let mut req = request(10);
        req.record_response(AgentId::new("a"), now).unwrap();
        let err = req.select(AgentId::new("stranger"), now).unwrap_err();
        assert!(matches!(err, HelpError::NotAResponder { .. }));
        assert_eq!(req.status(), HelpStatus::Responded);
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let mut req = request(10);
        assert!(req.complete(true, Utc::now()).is_err());
        assert_eq!(req.status(), HelpStatus::Pending);
    }

    #[test]
    fn test_timeout_from_every_non_terminal_state() {
        let created = Utc::now();
        let late = created + Duration::minutes(6);

        let mut pending = request(5);
        assert!(pending.expire_if_due(late));
        assert_eq!(pending.status(), HelpStatus::Timeout);

        let mut responded = request(5);
        responded.record_response(AgentId::new("a"), created).unwrap();
        assert!(responded.expire_if_due(late));

        let mut in_progress = request(5);
        in_progress.record_response(AgentId::new("a"), created).unwrap();
        in_progress.select(AgentId::new("a"), created).unwrap();
        assert!(in_progress.expire_if_due(late));
        assert_eq!(in_progress.status(), HelpStatus::Timeout);
    }

    #[test]
    fn test_terminal_states_never_move() {
        let now = Utc::now();
        let mut req = request(0);
        assert!(req.expire_if_due(now + Duration::seconds(1)));

        assert!(req.record_response(AgentId::new("a"), now).is_err());
        assert!(req.cancel(now).is_err());
        assert!(!req.expire_if_due(now + Duration::hours(1)));
        assert_eq!(req.status(), HelpStatus::Timeout);
        assert!(req.responses().is_empty());
    }

    #[test]
    fn test_zero_timeout_is_due_immediately() {
        let req = request(0);
        assert!(req.is_expired_at(req.created_at));
    }
}
