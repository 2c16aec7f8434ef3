//! Context memory
//!
//! Session-scoped facts, contradictions, retrieval history and running
//! summary, recorded through an append-only audit log, plus a long-term
//! store shared across sessions and written only by explicit commits.

pub mod log;
pub mod long_term;
pub mod models;
pub mod session;
pub mod store;

pub use log::AuditLog;
pub use long_term::{CommitReport, LongTermMemory};
pub use models::{
    GenerationStep, LogEntry, MemoryBatch, MemoryEvent, Recall, RetrievalRecord, SessionScope,
    SupersededFact,
};
pub use session::{CancelSignal, Session};
pub use store::{ContextMemory, MemoryConfig};
