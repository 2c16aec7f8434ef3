//! Deterministic model selection with staged fallback

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backend::{ModelRequest, ModelResponse};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::models::{ModelProfile, Relaxation, RelaxationLimit, RoutingDecision, TaskDescriptor};
use super::registry::ModelRegistry;
use crate::error::{ContextError, Result};
use crate::metrics::METRICS;

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub profiles: Vec<ModelProfile>,

    /// Used when a descriptor does not set its own limit
    #[serde(default)]
    pub default_max_relaxation: RelaxationLimit,

    /// Invocation timeout when a descriptor has no latency budget
    #[serde(default = "default_invoke_timeout_ms")]
    pub default_timeout_ms: u64,

    /// HTTP client timeout for configured endpoints
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
}

fn default_invoke_timeout_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            default_max_relaxation: RelaxationLimit::None,
            default_timeout_ms: default_invoke_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_timeout_ms == 0 {
            return Err("router.default_timeout_ms must be positive".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            return Err("router.breaker.failure_threshold must be at least 1".to_string());
        }
        for profile in &self.profiles {
            if profile.tasks.is_empty() {
                return Err(format!("model profile {} supports no tasks", profile.name));
            }
            if profile.context_window == 0 {
                return Err(format!("model profile {} has an empty context window", profile.name));
            }
        }
        Ok(())
    }
}

/// A profile measured against a descriptor
struct Candidate<'a> {
    profile: &'a ModelProfile,
    cost_overage: f64,
    latency_overage_ms: u64,
    missing: Vec<String>,
}

impl<'a> Candidate<'a> {
    fn measure(profile: &'a ModelProfile, descriptor: &TaskDescriptor) -> Self {
        let cost_overage = descriptor
            .max_cost_per_1k
            .map_or(0.0, |max| (profile.cost_per_1k_tokens - max).max(0.0));
        let latency_overage_ms = descriptor
            .max_latency_ms
            .map_or(0, |max| profile.expected_latency_ms.saturating_sub(max));
        Self {
            profile,
            cost_overage,
            latency_overage_ms,
            missing: profile.missing_capabilities(&descriptor.required_capabilities),
        }
    }

    fn fits(&self, stage: Option<Relaxation>) -> bool {
        let cost_ok = self.cost_overage == 0.0;
        let latency_ok = self.latency_overage_ms == 0;
        let caps_ok = self.missing.is_empty();
        match stage {
            None => cost_ok && latency_ok && caps_ok,
            Some(Relaxation::Cost) => latency_ok && caps_ok,
            Some(Relaxation::Latency) => caps_ok,
            Some(Relaxation::Capability) => true,
        }
    }

    /// Closest first: fewest missing capabilities, smallest overages, then
    /// cheapest, fastest and name
    fn closeness(&self, other: &Self) -> Ordering {
        self.missing
            .len()
            .cmp(&other.missing.len())
            .then(self.latency_overage_ms.cmp(&other.latency_overage_ms))
            .then(self.cost_overage.total_cmp(&other.cost_overage))
            .then(
                self.profile
                    .cost_per_1k_tokens
                    .total_cmp(&other.profile.cost_per_1k_tokens),
            )
            .then(
                self.profile
                    .expected_latency_ms
                    .cmp(&other.profile.expected_latency_ms),
            )
            .then(self.profile.name.cmp(&other.profile.name))
    }

    fn decision(&self) -> RoutingDecision {
        let mut relaxations = Vec::new();
        if self.cost_overage > 0.0 {
            relaxations.push(Relaxation::Cost);
        }
        if self.latency_overage_ms > 0 {
            relaxations.push(Relaxation::Latency);
        }
        if !self.missing.is_empty() {
            relaxations.push(Relaxation::Capability);
        }
        RoutingDecision {
            profile: self.profile.clone(),
            relaxations,
            cost_overage: self.cost_overage,
            latency_overage_ms: self.latency_overage_ms,
            missing_capabilities: self.missing.clone(),
        }
    }
}

const STAGES: [Option<Relaxation>; 4] = [
    None,
    Some(Relaxation::Cost),
    Some(Relaxation::Latency),
    Some(Relaxation::Capability),
];

/// Selects a model profile per task and invokes its backend
pub struct ModelRouter {
    registry: ModelRegistry,
    breaker: Arc<CircuitBreaker>,
    default_limit: RelaxationLimit,
    default_timeout: Duration,
}

impl ModelRouter {
    pub fn new(registry: ModelRegistry, config: &RouterConfig) -> Self {
        Self {
            registry,
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            default_limit: config.default_max_relaxation,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
        }
    }

    /// Registry built from the configured HTTP profiles
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let registry = ModelRegistry::from_profiles(
            &config.profiles,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self::new(registry, config))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Pick a profile for `descriptor`.
    ///
    /// Exact matches win; otherwise cost, latency and capability are relaxed
    /// in that order, each only if the descriptor's limit allows it. Task
    /// support is never relaxed.
    pub fn route(&self, descriptor: &TaskDescriptor) -> Result<RoutingDecision> {
        let limit = descriptor.max_relaxation.unwrap_or(self.default_limit);
        let candidates: Vec<Candidate<'_>> = self
            .registry
            .profiles()
            .filter(|p| p.supports(descriptor.task))
            .filter(|p| self.breaker.is_available(&p.name))
            .map(|p| Candidate::measure(p, descriptor))
            .collect();

        if candidates.is_empty() {
            return Err(ContextError::NoEligibleModel {
                task: descriptor.task.to_string(),
                reason: "no available profile supports the task".to_string(),
            });
        }

        for stage in STAGES {
            if let Some(relaxation) = stage {
                if !limit.allows(relaxation) {
                    break;
                }
            }
            let best = candidates
                .iter()
                .filter(|c| c.fits(stage))
                .min_by(|a, b| a.closeness(b));
            let Some(best) = best else {
                continue;
            };

            let decision = best.decision();
            METRICS
                .routing_decisions
                .with_label_values(&[decision.profile.name.as_str()])
                .inc();
            for relaxation in &decision.relaxations {
                let label = relaxation.to_string();
                METRICS
                    .routing_relaxations
                    .with_label_values(&[label.as_str()])
                    .inc();
            }
            if decision.is_exact() {
                debug!("Routed {} to {}", descriptor.task, decision.profile.name);
            } else {
                info!(
                    "Routed {} to {} with relaxations {:?}",
                    descriptor.task, decision.profile.name, decision.relaxations
                );
            }
            return Ok(decision);
        }

        Err(ContextError::NoEligibleModel {
            task: descriptor.task.to_string(),
            reason: format!(
                "{} candidate profile(s) exceed the budget and relaxation limit {:?}",
                candidates.len(),
                limit
            ),
        })
    }

    /// Invoke the routed profile's backend, bounded by `timeout` or the
    /// router default
    pub async fn invoke(
        &self,
        decision: &RoutingDecision,
        request: &ModelRequest,
        timeout: Option<Duration>,
    ) -> Result<ModelResponse> {
        let name = decision.profile.name.as_str();
        let backend = self.registry.backend_for(name).ok_or_else(|| {
            ContextError::Internal(format!("no backend registered for profile {}", name))
        })?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let started = Instant::now();
        match tokio::time::timeout(timeout, backend.invoke(request)).await {
            Ok(Ok(response)) => {
                self.breaker.record_success(name);
                METRICS.record_model_call(name, started.elapsed().as_secs_f64());
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!("Model {} failed: {}", name, e);
                self.breaker.record_failure(name);
                Err(e)
            }
            Err(_) => {
                warn!("Model {} timed out after {:?}", name, timeout);
                self.breaker.record_failure(name);
                Err(ContextError::ModelTimeout {
                    model: name.to_string(),
                    timeout,
                })
            }
        }
    }
}
