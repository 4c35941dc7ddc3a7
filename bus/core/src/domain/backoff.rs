// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Exponential backoff shared by transport reconnects and store-and-forward retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_base")]
    pub base: Duration,

    /// Multiplier applied per attempt
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde", default = "default_cap")]
    pub cap: Duration,

    /// Attempt limit; `None` retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Fraction of the delay randomised in either direction (0.0 – 1.0)
    #[serde(default)]
    pub jitter: f64,
}

fn default_base() -> Duration {
    Duration::from_millis(500)
}

fn default_factor() -> f64 {
    2.0
}

fn default_cap() -> Duration {
    Duration::from_secs(30)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: default_base(),
            factor: default_factor(),
            cap: default_cap(),
            max_attempts: None,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Whether attempt number `attempt` (1-based) may still run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Un-jittered delay after `attempt` failures: `base * factor^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = if self.factor.is_finite() { self.factor.max(1.0) } else { 1.0 };
        let millis = self.base.as_millis() as f64 * factor.powi(exponent);
        let cap = self.cap.as_millis() as f64;
        Duration::from_millis(millis.min(cap).max(0.0) as u64)
    }

    /// Delay with jitter applied, never above `cap`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::rng().random_range(-jitter..=jitter);
        delay.mul_f64(1.0 + spread).min(self.cap)
    }
}

/// Converts a std duration to chrono, saturating at roughly a century.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_millis(1000),
            max_attempts: None,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_secs(10),
            max_attempts: None,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = policy.jittered_delay(3);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_attempt_limit() {
        let unlimited = BackoffPolicy::default();
        assert!(unlimited.allows(10_000));

        let limited = BackoffPolicy::default().with_max_attempts(3);
        assert!(limited.allows(3));
        assert!(!limited.allows(4));
    }
}
