//! Model routing
//!
//! Profiles and their backends live in a static [`ModelRegistry`]. The
//! [`ModelRouter`] picks one per task under cost, latency and capability
//! constraints, skipping profiles whose circuit is open, and bounds each
//! invocation by the task's latency budget.

pub mod backend;
pub mod circuit_breaker;
pub mod models;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod router;

pub use backend::{HttpChatBackend, ModelBackend, ModelRequest, ModelResponse};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use models::{
    CostClass, LatencyClass, ModelProfile, Relaxation, RelaxationLimit, RoutingDecision,
    TaskDescriptor, TaskType,
};
pub use registry::ModelRegistry;
pub use router::{ModelRouter, RouterConfig};
