//! Per-profile availability tracking

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Backend healthy
    Closed,
    /// Backend skipped by routing
    Open,
    /// Reset timeout elapsed; the next call is a probe
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Marks a model profile unavailable after repeated failures
pub struct CircuitBreaker {
    entries: DashMap<String, BreakerEntry>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Whether routing may pick `profile`. Moves Open to HalfOpen once the
    /// reset timeout has passed.
    pub fn is_available(&self, profile: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(profile) else {
            return true;
        };
        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = entry
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout());
                if expired {
                    entry.state = BreakerState::HalfOpen;
                }
                expired
            }
        }
    }

    pub fn record_success(&self, profile: &str) {
        self.entries.remove(profile);
    }

    pub fn record_failure(&self, profile: &str) {
        let mut entry = self.entries.entry(profile.to_string()).or_default();
        entry.consecutive_failures += 1;

        // a failed probe reopens immediately
        let trip = entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold;
        if trip && entry.state != BreakerState::Open {
            warn!(
                "Circuit opened for model profile {} after {} failures",
                profile, entry.consecutive_failures
            );
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self, profile: &str) -> BreakerState {
        self.entries
            .get(profile)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failures(&self, profile: &str) -> u32 {
        self.entries
            .get(profile)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
        })
    }

    #[test]
    fn test_available_by_default() {
        let b = CircuitBreaker::default();
        assert!(b.is_available("fast"));
        assert_eq!(b.state("fast"), BreakerState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(2, 30_000);
        b.record_failure("fast");
        assert!(b.is_available("fast"));
        b.record_failure("fast");
        assert!(!b.is_available("fast"));
        assert_eq!(b.state("fast"), BreakerState::Open);
    }

    #[test]
    fn test_success_closes() {
        let b = breaker(2, 30_000);
        b.record_failure("fast");
        b.record_success("fast");
        assert_eq!(b.failures("fast"), 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let b = breaker(1, 50);
        b.record_failure("fast");
        assert!(!b.is_available("fast"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(b.is_available("fast"));
        assert_eq!(b.state("fast"), BreakerState::HalfOpen);

        b.record_failure("fast");
        assert_eq!(b.state("fast"), BreakerState::Open);
        assert!(!b.is_available("fast"));
    }
}
