//! Context-aware retrieval and synthesis engine for grounded slide generation
//!
//! Documents are chunked and indexed for hybrid dense/lexical retrieval.
//! Facts extracted from retrieved chunks are checked for contradictions,
//! resolved by an explicit policy, and handed to a routed model that must
//! ground every claim it makes. Session memory records what each request
//! used through an append-only audit log.

pub mod chunking;
pub mod config;
pub mod context;
pub mod contradiction;
pub mod engine;
pub mod error;
pub mod facts;
pub mod index;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod router;
pub mod synthesis;

pub use config::Config;
pub use engine::{ContextEngine, DocumentOutcome, IngestReport};
pub use error::{ContextError, Result};

/// Common imports for engine users
pub mod prelude {
    pub use crate::chunking::{Document, DocumentMetadata};
    pub use crate::config::Config;
    pub use crate::engine::{ContextEngine, IngestReport};
    pub use crate::error::{ContextError, Result};
    pub use crate::index::{RetrievalQuery, SearchMode};
    pub use crate::router::{RelaxationLimit, TaskDescriptor, TaskType};
    pub use crate::synthesis::{ContentBlock, ContentRequest, SynthesisFailure, SynthesisStage};
}
