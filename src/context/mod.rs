//! Token accounting and running-summary compression
//!
//! Shared by the chunker (bounded chunk length), the synthesizer
//! (context-window assembly) and context memory (running topic summary).

pub mod token_budget;
pub mod token_estimator;
pub mod summarizer;

pub use token_budget::{TokenBudgetManager, TokenBudgetConfig, BudgetAllocation, BudgetError};
pub use token_estimator::{TokenEstimator, TiktokenEstimator, WordBasedEstimator, estimator_from_name};
pub use summarizer::{Summarizer, ModelSummarizer, ConcatenationSummarizer, SummarizerError};
