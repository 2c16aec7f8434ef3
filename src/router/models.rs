//! Model profiles, task descriptors and routing decisions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ContextError;

/// Kind of work a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Outline,
    TechnicalDetail,
    Qa,
    Embedding,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Outline => "outline",
            TaskType::TechnicalDetail => "technical_detail",
            TaskType::Qa => "qa",
            TaskType::Embedding => "embedding",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskType {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "outline" => Ok(TaskType::Outline),
            "technical" | "technical_detail" | "technical-detail" => Ok(TaskType::TechnicalDetail),
            "qa" | "q&a" => Ok(TaskType::Qa),
            "embedding" | "embed" => Ok(TaskType::Embedding),
            other => Err(ContextError::Configuration(format!("unknown task type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    Standard,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Low,
    Medium,
    High,
}

/// Static description of a registered model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub tasks: BTreeSet<TaskType>,
    pub latency_class: LatencyClass,
    pub expected_latency_ms: u64,
    pub cost_class: CostClass,
    pub cost_per_1k_tokens: f64,
    pub context_window: usize,
    /// OpenAI-compatible chat completions URL; profiles without one need a
    /// backend registered in code
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Upstream model id sent to the endpoint, defaults to `name`
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ModelProfile {
    pub fn new(name: impl Into<String>, tasks: &[TaskType]) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            tasks: tasks.iter().copied().collect(),
            latency_class: LatencyClass::Standard,
            expected_latency_ms: 2_000,
            cost_class: CostClass::Medium,
            cost_per_1k_tokens: 1.0,
            context_window: 8_192,
            endpoint: None,
            model: None,
            api_key_env: None,
        }
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_latency(mut self, class: LatencyClass, expected_ms: u64) -> Self {
        self.latency_class = class;
        self.expected_latency_ms = expected_ms;
        self
    }

    pub fn with_cost(mut self, class: CostClass, per_1k: f64) -> Self {
        self.cost_class = class;
        self.cost_per_1k_tokens = per_1k;
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn upstream_model(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.name)
    }

    pub fn supports(&self, task: TaskType) -> bool {
        self.tasks.contains(&task)
    }

    pub fn missing_capabilities(&self, required: &BTreeSet<String>) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.capabilities.contains(*c))
            .cloned()
            .collect()
    }
}

/// A constraint the router gave up to find a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relaxation {
    Cost,
    Latency,
    Capability,
}

impl fmt::Display for Relaxation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Relaxation::Cost => "cost",
            Relaxation::Latency => "latency",
            Relaxation::Capability => "capability",
        };
        f.write_str(name)
    }
}

/// How far fallback may go. Each level includes the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxationLimit {
    /// Budgets and capabilities are hard requirements
    #[default]
    None,
    Cost,
    Latency,
    Capability,
}

impl RelaxationLimit {
    pub fn allows(&self, relaxation: Relaxation) -> bool {
        let needed = match relaxation {
            Relaxation::Cost => RelaxationLimit::Cost,
            Relaxation::Latency => RelaxationLimit::Latency,
            Relaxation::Capability => RelaxationLimit::Capability,
        };
        *self >= needed
    }
}

/// Routing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task: TaskType,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Upper bound on expected latency; also the invocation timeout
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub max_cost_per_1k: Option<f64>,
    /// Falls back to the router default when unset
    #[serde(default)]
    pub max_relaxation: Option<RelaxationLimit>,
}

impl TaskDescriptor {
    pub fn new(task: TaskType) -> Self {
        Self {
            task,
            required_capabilities: BTreeSet::new(),
            max_latency_ms: None,
            max_cost_per_1k: None,
            max_relaxation: None,
        }
    }

    pub fn requiring(mut self, caps: &[&str]) -> Self {
        self.required_capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_max_latency(mut self, latency: Duration) -> Self {
        self.max_latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn with_max_cost(mut self, per_1k: f64) -> Self {
        self.max_cost_per_1k = Some(per_1k);
        self
    }

    pub fn allowing(mut self, limit: RelaxationLimit) -> Self {
        self.max_relaxation = Some(limit);
        self
    }

    pub fn max_latency(&self) -> Option<Duration> {
        self.max_latency_ms.map(Duration::from_millis)
    }
}

/// The selected profile and what was given up to select it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub profile: ModelProfile,
    pub relaxations: Vec<Relaxation>,
    pub cost_overage: f64,
    pub latency_overage_ms: u64,
    pub missing_capabilities: Vec<String>,
}

impl RoutingDecision {
    pub fn is_exact(&self) -> bool {
        self.relaxations.is_empty()
    }
}
