// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent Registry - capability-indexed directory with trust and liveness
//!
//! Each agent record sits behind its own mutex inside a `DashMap`, so updates
//! to one agent never wait on another and readers see per-agent snapshots.
//! Stale agents are marked offline by [`AgentRegistry::prune_stale`]; nothing
//! is ever deleted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::agent::{AgentId, Availability, DiscoveredAgent, DomainId, TrustPolicy};
use crate::domain::backoff::to_chrono;
use crate::domain::events::RegistryEvent;
use crate::infrastructure::event_bus::EventBus;

const EXACT_MATCH: f64 = 1.0;
const NORMALIZED_MATCH: f64 = 0.9;
const SPECIALIZATION_BONUS: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
}

/// One search hit with the scores it was ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMatch {
    pub agent: DiscoveredAgent,
    pub match_score: f64,
    pub trust_score: f64,
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<Mutex<DiscoveredAgent>>>,
    local_domain: DomainId,
    policy: TrustPolicy,
    liveness_window: chrono::Duration,
    event_bus: EventBus,
}

impl AgentRegistry {
    pub fn new(local_domain: DomainId, policy: TrustPolicy, liveness_window: Duration, event_bus: EventBus) -> Self {
        Self {
            agents: DashMap::new(),
            local_domain,
            policy,
            liveness_window: to_chrono(liveness_window),
            event_bus,
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Upserts an agent announced in its home domain (the `@domain` suffix, else local).
    pub fn register_or_update(
        &self,
        agent_id: AgentId,
        capabilities: impl IntoIterator<Item = String>,
        specializations: impl IntoIterator<Item = String>,
    ) -> DiscoveredAgent {
        let domain = agent_id.domain_hint().unwrap_or_else(|| self.local_domain.clone());
        self.register_in_domain(agent_id, domain, capabilities, specializations)
    }

    /// Upserts an agent known to live in `domain`. Trust is kept; accrued decay is folded in first.
    pub fn register_in_domain(
        &self,
        agent_id: AgentId,
        domain: DomainId,
        capabilities: impl IntoIterator<Item = String>,
        specializations: impl IntoIterator<Item = String>,
    ) -> DiscoveredAgent {
        let now = Utc::now();
        let capabilities = clean(capabilities);
        let specializations = clean(specializations);

        let mut created = false;
        let slot = self
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(DiscoveredAgent::new(
                    agent_id.clone(),
                    domain.clone(),
                    capabilities.clone(),
                    specializations.clone(),
                    now,
                )))
            })
            .clone();

        let snapshot = {
            let mut agent = slot.lock();
            if !created {
                agent.touch(now, &self.policy);
                agent.domain = domain;
                agent.capabilities = capabilities;
                agent.specializations = specializations;
                agent.availability = Availability::Online;
            }
            agent.clone()
        };

        if created {
            info!(agent_id = %snapshot.agent_id, domain = %snapshot.domain, "Agent discovered");
            self.event_bus.publish_registry_event(RegistryEvent::AgentDiscovered {
                agent_id: snapshot.agent_id.clone(),
                domain: snapshot.domain.clone(),
                capabilities: snapshot.capabilities.iter().cloned().collect(),
                discovered_at: now,
            });
        } else {
            debug!(agent_id = %snapshot.agent_id, "Agent announcement refreshed");
        }
        snapshot
    }

    /// Live agents covering every required capability, best first.
    pub fn find_by_capabilities(&self, required: &[String]) -> Vec<AgentMatch> {
        self.find_by_capabilities_at(required, Utc::now())
    }

    pub fn find_by_capabilities_at(&self, required: &[String], now: DateTime<Utc>) -> Vec<AgentMatch> {
        let required: Vec<&str> = required.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();

        let mut matches: Vec<AgentMatch> = self
            .agents
            .iter()
            .filter_map(|entry| {
                let agent = entry.value().lock().clone();
                if !agent.is_live(now, self.liveness_window) {
                    return None;
                }
                let match_score = match_score(&required, &agent.capabilities, &agent.specializations)?;
                let trust_score = agent.trust_at(now, &self.policy);
                Some(AgentMatch {
                    agent,
                    match_score,
                    trust_score,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.trust_score.partial_cmp(&a.trust_score).unwrap_or(Ordering::Equal))
                .then_with(|| a.agent.agent_id.cmp(&b.agent.agent_id))
        });
        matches
    }

    /// Applies one collaboration outcome. Returns the new trust score.
    pub fn update_trust(&self, agent_id: &AgentId, success: bool) -> Result<f64, RegistryError> {
        let now = Utc::now();
        let slot = self.slot(agent_id)?;
        let trust_score = {
            let mut agent = slot.lock();
            agent.record_outcome(success, now, &self.policy);
            agent.raw_trust()
        };

        info!(agent_id = %agent_id, success, trust_score, "Trust updated");
        self.event_bus.publish_registry_event(RegistryEvent::TrustUpdated {
            agent_id: agent_id.clone(),
            success,
            trust_score,
            updated_at: now,
        });
        Ok(trust_score)
    }

    /// Records an inbound signal from a known agent. Returns `false` for unknown agents.
    pub fn touch(&self, agent_id: &AgentId) -> bool {
        match self.slot(agent_id) {
            Ok(slot) => {
                slot.lock().touch(Utc::now(), &self.policy);
                true
            }
            Err(_) => false,
        }
    }

    pub fn set_availability(&self, agent_id: &AgentId, availability: Availability) -> Result<(), RegistryError> {
        let slot = self.slot(agent_id)?;
        let mut agent = slot.lock();
        if availability != Availability::Offline {
            agent.touch(Utc::now(), &self.policy);
        }
        agent.availability = availability;
        Ok(())
    }

    /// Marks agents silent past the liveness window offline. Returns how many changed.
    pub fn prune_stale(&self) -> usize {
        self.prune_stale_at(Utc::now())
    }

    pub fn prune_stale_at(&self, now: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for entry in self.agents.iter() {
            let mut agent = entry.value().lock();
            if agent.availability != Availability::Offline && now - agent.last_seen > self.liveness_window {
                agent.availability = Availability::Offline;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "Marked stale agents offline");
            self.event_bus.publish_registry_event(RegistryEvent::AgentsPruned {
                count: pruned,
                pruned_at: now,
            });
        }
        pruned
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<DiscoveredAgent> {
        self.slot(agent_id).ok().map(|slot| slot.lock().clone())
    }

    pub fn list(&self) -> Vec<DiscoveredAgent> {
        let mut agents: Vec<_> = self.agents.iter().map(|entry| entry.value().lock().clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn domain_of(&self, agent_id: &AgentId) -> Option<DomainId> {
        self.slot(agent_id).ok().map(|slot| slot.lock().domain.clone())
    }

    pub fn is_live(&self, agent_id: &AgentId) -> bool {
        self.slot(agent_id)
            .map(|slot| slot.lock().is_live(Utc::now(), self.liveness_window))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn slot(&self, agent_id: &AgentId) -> Result<Arc<Mutex<DiscoveredAgent>>, RegistryError> {
        self.agents
            .get(agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.clone()))
    }
}

fn clean(values: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// `None` when the agent does not cover every required capability.
fn match_score(required: &[&str], capabilities: &BTreeSet<String>, specializations: &BTreeSet<String>) -> Option<f64> {
    if required.is_empty() {
        return Some(EXACT_MATCH);
    }

    let mut total = 0.0;
    for cap in required {
        if capabilities.contains(*cap) {
            total += EXACT_MATCH;
        } else if capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap)) {
            total += NORMALIZED_MATCH;
        } else {
            return None;
        }
    }

    let specialized = required
        .iter()
        .filter(|cap| specializations.iter().any(|s| s.eq_ignore_ascii_case(cap)))
        .count();
    let count = required.len() as f64;
    Some(total / count + SPECIALIZATION_BONUS * specialized as f64 / count)
}
