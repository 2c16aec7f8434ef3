//! Contradiction detection and resolution

pub mod detector;
pub mod models;
pub mod policy;
pub mod tolerance;

pub use detector::{ContradictionDetector, DetectionOutcome};
pub use models::{
    ContradictionRecord, Resolution, ResolutionRule, ResolutionStatus, StatusTransition,
};
pub use policy::{ContradictionConfig, ResolutionPolicy};
pub use tolerance::ToleranceConfig;
