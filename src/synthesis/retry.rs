//! Bounded retry with exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ContextError;

/// Retry settings for the retrieval and model stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Fraction of the delay added or removed at random, 0 disables
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("retry.multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry.jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }

    /// Whether another attempt follows failed attempt number `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32, error: &ContextError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay before the attempt after `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    /// Delay before the attempt after `attempt`, jittered
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
            .min(Duration::from_millis(self.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff_ms: 500,
            ..Default::default()
        };
        assert_eq!(policy.base_delay(10), Duration::from_millis(500));
        assert!(policy.backoff(10) <= Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff(2);
            assert!(d >= Duration::from_millis(319) && d <= Duration::from_millis(481));
        }
    }

    #[test]
    fn test_only_retryable_errors_retry() {
        let policy = RetryPolicy::default();
        let timeout = ContextError::ModelTimeout {
            model: "m".to_string(),
            timeout: Duration::from_secs(1),
        };
        let grounding = ContextError::GroundingViolation { claims: vec![] };
        assert!(policy.should_retry(1, &timeout));
        assert!(!policy.should_retry(3, &timeout));
        assert!(!policy.should_retry(1, &grounding));
    }
}
