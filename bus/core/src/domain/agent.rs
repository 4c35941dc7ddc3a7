// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Directory Aggregate
//!
//! - [`AgentId`] / [`DomainId`]: string newtypes naming agents and broker domains.
//! - [`DiscoveredAgent`]: mutable per-agent record held by the registry.
//! - [`TrustPolicy`]: learning-rate and decay parameters for trust updates.
//! - [`Presence`]: the self-description carried by `discovery` messages.
//!
//! Trust scores live in `[0.0, 1.0]`, start at the neutral `0.5` and drift back
//! toward neutral while an agent is silent. Decay is evaluated lazily from the
//! decay anchor, never by a background sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Neutral trust score assigned to newly discovered agents.
pub const NEUTRAL_TRUST: f64 = 0.5;

/// Identifier of an agent on the bus.
///
/// Ids may carry a broker domain suffix (`reviewer@eu-west`); the suffix is only
/// a routing hint and is used when the registry has no record for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Domain named after the last `@`, if any.
    pub fn domain_hint(&self) -> Option<DomainId> {
        self.0
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .map(DomainId::new)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a broker domain (a local transactional boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

impl DomainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DomainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Busy,
    Offline,
}

impl Availability {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Trust learning parameters.
///
/// `learning_rate` is the `k` of the asymmetric update: success moves the score
/// by `(1 - t) * k`, failure by `-t * k`. `decay_per_hour` is the exponential
/// rate at which a silent agent's score returns to neutral.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustPolicy {
    pub learning_rate: f64,
    pub decay_per_hour: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            decay_per_hour: 0.01,
        }
    }
}

/// Registry record for a known agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredAgent {
    pub agent_id: AgentId,
    pub domain: DomainId,
    pub capabilities: BTreeSet<String>,
    pub specializations: BTreeSet<String>,
    pub availability: Availability,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    trust_score: f64,
    trust_updated_at: DateTime<Utc>,
    pub response_count: u64,
    pub success_count: u64,
}

impl DiscoveredAgent {
    pub fn new(
        agent_id: AgentId,
        domain: DomainId,
        capabilities: BTreeSet<String>,
        specializations: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            domain,
            capabilities,
            specializations,
            availability: Availability::Online,
            first_seen: now,
            last_seen: now,
            trust_score: NEUTRAL_TRUST,
            trust_updated_at: now,
            response_count: 0,
            success_count: 0,
        }
    }

    /// Stored score without decay applied.
    pub fn raw_trust(&self) -> f64 {
        self.trust_score
    }

    /// Trust score with decay toward neutral applied as of `now`.
    pub fn trust_at(&self, now: DateTime<Utc>, policy: &TrustPolicy) -> f64 {
        let anchor = self.last_seen.max(self.trust_updated_at);
        let elapsed_hours = (now - anchor).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let retained = (-policy.decay_per_hour.max(0.0) * elapsed_hours).exp();
        clamp_trust(NEUTRAL_TRUST + (self.trust_score - NEUTRAL_TRUST) * retained)
    }

    /// Folds accrued decay into the stored score and moves the decay anchor to `now`.
    pub fn settle_trust(&mut self, now: DateTime<Utc>, policy: &TrustPolicy) {
        self.trust_score = self.trust_at(now, policy);
        self.trust_updated_at = now;
    }

    /// Applies one collaboration outcome to the trust score.
    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>, policy: &TrustPolicy) {
        self.settle_trust(now, policy);
        let k = policy.learning_rate.clamp(0.0, 1.0);
        let t = self.trust_score;
        self.trust_score = clamp_trust(if success { t + (1.0 - t) * k } else { t - t * k });
        self.response_count += 1;
        if success {
            self.success_count += 1;
        }
    }

    /// Records an inbound signal from this agent.
    pub fn touch(&mut self, now: DateTime<Utc>, policy: &TrustPolicy) {
        self.settle_trust(now, policy);
        self.last_seen = now;
        if self.availability == Availability::Offline {
            self.availability = Availability::Online;
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>, liveness_window: chrono::Duration) -> bool {
        self.availability != Availability::Offline && now - self.last_seen <= liveness_window
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.response_count > 0).then(|| self.success_count as f64 / self.response_count as f64)
    }
}

/// What an agent announces about itself in a `discovery` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
}

fn clamp_trust(value: f64) -> f64 {
    if value.is_nan() {
        NEUTRAL_TRUST
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent(now: DateTime<Utc>) -> DiscoveredAgent {
        DiscoveredAgent::new(
            AgentId::new("sql-expert"),
            DomainId::new("local"),
            BTreeSet::from(["sql".to_string()]),
            BTreeSet::new(),
            now,
        )
    }

    #[test]
    fn test_domain_hint_from_suffix() {
        assert_eq!(AgentId::new("reviewer@eu-west").domain_hint(), Some(DomainId::new("eu-west")));
        assert_eq!(AgentId::new("reviewer").domain_hint(), None);
        assert_eq!(AgentId::new("reviewer@").domain_hint(), None);
    }

    #[test]
    fn test_asymmetric_trust_updates() {
        let now = Utc::now();
        let policy = TrustPolicy { learning_rate: 0.1, decay_per_hour: 0.0 };
        let mut a = agent(now);

        a.record_outcome(true, now, &policy);
        assert!((a.raw_trust() - 0.55).abs() < 1e-9);

        a.record_outcome(false, now, &policy);
        assert!((a.raw_trust() - 0.495).abs() < 1e-9);
        assert_eq!(a.response_count, 2);
        assert_eq!(a.success_count, 1);
    }

    #[test]
    fn test_trust_stays_in_bounds() {
        let now = Utc::now();
        let policy = TrustPolicy { learning_rate: 1.0, decay_per_hour: 0.0 };
        let mut a = agent(now);
        for i in 0..50 {
            a.record_outcome(i % 3 != 0, now, &policy);
            assert!((0.0..=1.0).contains(&a.raw_trust()));
        }

        let wild = TrustPolicy { learning_rate: 7.5, decay_per_hour: -3.0 };
        for i in 0..50 {
            a.record_outcome(i % 2 == 0, now, &wild);
            assert!((0.0..=1.0).contains(&a.trust_at(now + Duration::hours(i), &wild)));
        }
    }

    #[test]
    fn test_decay_drifts_toward_neutral() {
        let now = Utc::now();
        let policy = TrustPolicy { learning_rate: 0.5, decay_per_hour: 0.1 };
        let mut a = agent(now);
        a.record_outcome(true, now, &policy);
        let fresh = a.trust_at(now, &policy);
        let later = a.trust_at(now + Duration::hours(10), &policy);
        let much_later = a.trust_at(now + Duration::hours(500), &policy);

        assert!(fresh > later);
        assert!(later > NEUTRAL_TRUST);
        assert!((much_later - NEUTRAL_TRUST).abs() < 1e-6);
    }

    #[test]
    fn test_settle_does_not_double_count_decay() {
        let now = Utc::now();
        let policy = TrustPolicy { learning_rate: 0.5, decay_per_hour: 0.1 };
        let mut a = agent(now);
        a.record_outcome(true, now, &policy);

        let at_five = now + Duration::hours(5);
        let expected = a.trust_at(at_five, &policy);
        a.settle_trust(at_five, &policy);
        assert!((a.trust_at(at_five, &policy) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_liveness_window() {
        let now = Utc::now();
        let mut a = agent(now);
        let window = Duration::minutes(5);
        assert!(a.is_live(now + Duration::minutes(4), window));
        assert!(!a.is_live(now + Duration::minutes(6), window));

        a.availability = Availability::Offline;
        assert!(!a.is_live(now, window));
    }
}
