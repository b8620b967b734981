//! Exponential backoff retry strategies with jitter.
//!
//! Drives the durable session's local retry queue: a transfer that fails
//! before any HTTP response is received waits according to the policy and
//! is attempted again until it succeeds, the policy gives up, or the
//! session's resource timeout elapses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for durable transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Returns the policy with jitter disabled.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Retry decision context for a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time.
    Retry {
        /// When the next attempt should be made.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying.
    GiveUp {
        /// Why the transfer is not retried.
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// Only transport failures are retried. Any HTTP response, including an
    /// error status, is final.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    /// Calculates the delay until the next attempt.
    pub fn calculate_delay(&self) -> Duration {
        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => {
                self.policy.base_delay * self.attempt_number.saturating_sub(1)
            },
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.policy.base_delay.saturating_mul(multiplier)
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor` so retries from many devices do
/// not line up.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    if jitter_range <= 0.0 {
        return duration;
    }
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(policy: &RetryPolicy, attempts: std::ops::RangeInclusive<u32>) -> Vec<Duration> {
        attempts
            .map(|attempt| {
                RetryContext::new(
                    attempt,
                    DeliveryError::transport("connection reset"),
                    Utc::now(),
                    policy.clone(),
                )
                .calculate_delay()
            })
            .collect()
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::default().without_jitter();

        let delays = delays(&policy, 1..=5);

        assert_eq!(delays, [1, 2, 4, 8, 16].map(Duration::from_secs));
    }

    #[test]
    fn retry_respects_maximum_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let context = RetryContext::new(3, DeliveryError::timeout(30), Utc::now(), policy);

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn http_responses_are_never_retried() {
        for error in [
            DeliveryError::unacceptable_status(404),
            DeliveryError::unacceptable_status(503),
            DeliveryError::Decrypt,
        ] {
            let context = RetryContext::new(1, error, Utc::now(), RetryPolicy::default());
            assert!(matches!(context.decide_retry(), RetryDecision::GiveUp { .. }));
        }
    }

    #[test]
    fn retry_is_scheduled_after_failure_time() {
        let failed_at = Utc::now();
        let policy = RetryPolicy::default().without_jitter();
        let context = RetryContext::new(2, DeliveryError::timeout(30), failed_at, policy);

        assert_eq!(context.decide_retry(), RetryDecision::Retry {
            next_attempt_at: failed_at + chrono::Duration::seconds(2)
        });
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base_delay, 0.5);
            seen.insert(jittered.as_millis());
            assert!(jittered >= Duration::from_secs(5), "delay too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(15), "delay too large: {jittered:?}");
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn max_delay_enforced() {
        let policy =
            RetryPolicy { max_delay: Duration::from_secs(60), ..Default::default() };

        assert!(delays(&policy, 10..=15).iter().all(|d| *d <= Duration::from_secs(60)));
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy {
            backoff_strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(delays(&linear, 1..=4), [0, 5, 10, 15].map(Duration::from_secs));

        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..linear };
        assert!(delays(&fixed, 1..=4).iter().all(|d| *d == Duration::from_secs(5)));
    }
}
