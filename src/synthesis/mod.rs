//! Content-block synthesis
//!
//! Drives a request from topic to grounded, cited content: retrieval,
//! fact checking, contradiction handling, routed model invocation and
//! validation, then a single commit to session memory.

pub mod escalation;
pub mod grounding;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod window;

pub use escalation::{EscalationHandler, ReviewQueue};
pub use grounding::{GroundingChecker, GroundingReport};
pub use models::{Citation, ContentBlock, ContentRequest, SynthesisFailure, SynthesisStage};
pub use orchestrator::{SynthesisConfig, Synthesizer};
pub use retry::RetryPolicy;
pub use window::{FactWindow, WindowEntry};
