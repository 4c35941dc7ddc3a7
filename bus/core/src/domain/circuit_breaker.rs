// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Circuit Breaker
//!
//! Per-domain failure isolation for the store-and-forward path.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(recovery timeout)--> HALF_OPEN
//!    ^                                  ^                              |
//!    |                                  +-------(trial fails)----------+
//!    +----------------------------(trial succeeds)---------------------+
//! ```
//!
//! HALF_OPEN admits exactly one trial at a time. The breaker is a plain state
//! machine; callers pass `now` so timing is deterministic under test.
//!
//! Every trip to OPEN starts a new generation. A verdict carries the
//! generation its call was admitted in, and verdicts from an older generation
//! are ignored, so a slow call admitted while CLOSED cannot close a breaker
//! that tripped in the meantime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::domain::backoff::to_chrono;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde", default = "default_recovery_timeout")]
    pub recovery_timeout: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Still inside the recovery window; admit again after `retry_after`.
    Open { retry_after: chrono::Duration },
    /// A half-open trial is already running.
    TrialInFlight,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    generation: u64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            trial_in_flight: false,
            generation: 0,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.last_failure_time
    }

    /// Bumped on every trip to OPEN.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a call admitted in `generation` may still report a verdict.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Asks to run one call. Moves OPEN to HALF_OPEN once the recovery timeout
    /// has elapsed and claims the single trial slot.
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> Result<(), Rejection> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = self.last_failure_time.unwrap_or(now);
                let reopen_at = opened_at + to_chrono(self.config.recovery_timeout);
                if now >= reopen_at {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(Rejection::Open {
                        retry_after: reopen_at - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Rejection::TrialInFlight)
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure_time = Some(now);
        self.trial_in_flight = false;
        self.failure_count = self.failure_count.saturating_add(1);
        let trips = match self.state {
            CircuitState::Closed => self.failure_count >= self.config.failure_threshold.max(1),
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trips {
            self.state = CircuitState::Open;
            self.generation = self.generation.wrapping_add(1);
        }
    }

    /// Gives back an admitted call that produced no verdict.
    pub fn release(&mut self) {
        self.trial_in_flight = false;
    }
}
