// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! One circuit breaker per remote domain.
//!
//! Callers either wrap an operation with [`CircuitBreakerRegistry::call`] (every
//! `Err` counts as a failure) or take a [`CircuitPermit`] and report the verdict
//! themselves, which lets store-and-forward ignore failures that say nothing
//! about the remote domain's health.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::agent::DomainId;
use crate::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Rejection};
use crate::domain::events::CircuitEvent;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit for domain {domain} is open; retry in {retry_after:?}")]
    Open { domain: DomainId, retry_after: Duration },

    #[error("Circuit for domain {domain} is half-open and its trial call is in flight")]
    TrialInFlight { domain: DomainId },
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitCallError<E> {
    #[error(transparent)]
    Rejected(CircuitError),

    #[error("{0}")]
    Failed(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub domain: DomainId,
    pub state: CircuitState,
    pub failure_count: u32,
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<DomainId, Arc<Mutex<CircuitBreaker>>>,
    event_bus: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, event_bus: EventBus) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            event_bus,
        }
    }

    /// Asks the domain's breaker to admit one call.
    pub fn acquire(&self, domain: &DomainId) -> Result<CircuitPermit, CircuitError> {
        let breaker = self.breaker(domain);
        let (before, result) = {
            let mut guard = breaker.lock();
            let before = guard.state();
            (
                before,
                guard
                    .try_acquire_at(Utc::now())
                    .map(|()| (guard.state(), guard.generation())),
            )
        };

        match result {
            Ok((after, generation)) => {
                if before != after {
                    self.announce(domain, before, after);
                }
                Ok(CircuitPermit {
                    domain: domain.clone(),
                    breaker,
                    event_bus: self.event_bus.clone(),
                    generation,
                    settled: false,
                })
            }
            Err(Rejection::Open { retry_after }) => Err(CircuitError::Open {
                domain: domain.clone(),
                retry_after: retry_after.to_std().unwrap_or_default(),
            }),
            Err(Rejection::TrialInFlight) => Err(CircuitError::TrialInFlight { domain: domain.clone() }),
        }
    }

    /// Runs `op` through the domain's breaker. Every `Err` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, domain: &DomainId, op: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire(domain).map_err(CircuitCallError::Rejected)?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitCallError::Failed(err))
            }
        }
    }

    pub fn state(&self, domain: &DomainId) -> CircuitState {
        self.breakers
            .get(domain)
            .map(|b| b.lock().state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value().lock();
                CircuitSnapshot {
                    domain: entry.key().clone(),
                    state: breaker.state(),
                    failure_count: breaker.failure_count(),
                }
            })
            .collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    fn breaker(&self, domain: &DomainId) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.config.clone()))))
            .clone()
    }

    fn announce(&self, domain: &DomainId, from: CircuitState, to: CircuitState) {
        announce(&self.event_bus, domain, from, to);
    }
}

fn announce(event_bus: &EventBus, domain: &DomainId, from: CircuitState, to: CircuitState) {
    match to {
        CircuitState::Open => {
            warn!(domain = %domain, from = %from, "Circuit opened");
            metrics::counter!("meshbus_circuit_open_total", "domain" => domain.to_string()).increment(1);
        }
        _ => info!(domain = %domain, from = %from, to = %to, "Circuit state changed"),
    }
    event_bus.publish_circuit_event(CircuitEvent::StateChanged {
        domain: domain.clone(),
        from,
        to,
        changed_at: Utc::now(),
    });
}

/// An admitted call. Report its verdict with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unreported frees a half-open trial slot.
/// A verdict that arrives after the breaker tripped again is ignored.
pub struct CircuitPermit {
    domain: DomainId,
    breaker: Arc<Mutex<CircuitBreaker>>,
    event_bus: EventBus,
    generation: u64,
    settled: bool,
}

impl CircuitPermit {
    pub fn domain(&self) -> &DomainId {
        &self.domain
    }

    pub fn success(mut self) {
        self.settle(|breaker| breaker.record_success());
    }

    pub fn failure(mut self) {
        self.settle(|breaker| breaker.record_failure(Utc::now()));
    }

    fn settle(&mut self, apply: impl FnOnce(&mut CircuitBreaker)) {
        self.settled = true;
        let (before, after) = {
            let mut breaker = self.breaker.lock();
            if !breaker.is_current(self.generation) {
                debug!(domain = %self.domain, "Ignoring verdict from before the circuit tripped");
                return;
            }
            let before = breaker.state();
            apply(&mut breaker);
            (before, breaker.state())
        };
        if before != after {
            announce(&self.event_bus, &self.domain, before, after);
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            let mut breaker = self.breaker.lock();
            if breaker.is_current(self.generation) {
                breaker.release();
            }
        }
    }
}
