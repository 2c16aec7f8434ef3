//! Token budget management for model context windows
//!
//! A synthesis prompt is split into four sections:
//! - Instructions: fixed system prompt and topic
//! - Running summary: the session's topic summary
//! - Facts: the grounded fact list (whatever is left)
//! - Completion: reserved for the model's answer
//!
//! The total is capped by the routed profile's context window.

use super::token_estimator::{TokenEstimator, WordBasedEstimator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Token budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    #[serde(default = "default_instructions")]
    pub instructions: usize,
    #[serde(default = "default_running_summary")]
    pub running_summary: usize,
    #[serde(default = "default_facts")]
    pub facts: usize,
    #[serde(default = "default_completion")]
    pub completion: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
}

fn default_instructions() -> usize {
    600
}

fn default_running_summary() -> usize {
    800
}

fn default_facts() -> usize {
    4000
}

fn default_completion() -> usize {
    1000
}

fn default_max_total() -> usize {
    8000
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            running_summary: default_running_summary(),
            facts: default_facts(),
            completion: default_completion(),
            max_total: default_max_total(),
        }
    }
}

impl TokenBudgetConfig {
    /// Validate that the budget configuration is consistent
    pub fn validate(&self) -> Result<(), BudgetError> {
        let total = self.instructions + self.running_summary + self.facts + self.completion;

        if total > self.max_total {
            return Err(BudgetError::ConfigurationInvalid {
                allocated: total,
                max: self.max_total,
            });
        }

        Ok(())
    }
}

/// Budget allocation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub instructions: usize,
    pub running_summary: usize,
    pub facts: usize,
    pub completion: usize,
    pub total_allocated: usize,
    pub remaining: usize,
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded: {used} tokens used, {max} tokens allowed")]
    BudgetExceeded { used: usize, max: usize },

    #[error("Configuration invalid: {allocated} tokens allocated, {max} tokens max")]
    ConfigurationInvalid { allocated: usize, max: usize },

    #[error("Insufficient budget: need {needed} tokens, have {available} tokens")]
    InsufficientBudget { needed: usize, available: usize },
}

/// Token budget manager
#[derive(Clone)]
pub struct TokenBudgetManager {
    config: TokenBudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl TokenBudgetManager {
    /// Create a new token budget manager
    pub fn new(
        config: TokenBudgetConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, BudgetError> {
        config.validate()?;
        Ok(Self { config, estimator })
    }

    /// Create with default configuration and the word-based estimator
    pub fn with_defaults() -> Result<Self, BudgetError> {
        Self::new(
            TokenBudgetConfig::default(),
            Arc::new(WordBasedEstimator::default()),
        )
    }

    /// Estimate tokens for text with the configured estimator
    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Tokens available for facts once the fixed sections are accounted for.
    ///
    /// `context_window` is the routed profile's limit; the smaller of it and
    /// `max_total` caps the whole prompt.
    pub fn facts_budget(
        &self,
        context_window: usize,
        instructions_used: usize,
        summary_used: usize,
    ) -> Result<usize, BudgetError> {
        let cap = context_window.min(self.config.max_total);
        let fixed = instructions_used + summary_used.min(self.config.running_summary)
            + self.config.completion;

        if fixed >= cap {
            return Err(BudgetError::InsufficientBudget {
                needed: fixed + 1,
                available: cap,
            });
        }

        Ok((cap - fixed).min(self.config.facts))
    }

    /// Allocate tokens based on current usage
    pub fn allocate(
        &self,
        context_window: usize,
        instructions_used: usize,
        summary_used: usize,
        facts_used: usize,
    ) -> Result<BudgetAllocation, BudgetError> {
        let cap = context_window.min(self.config.max_total);
        let total = instructions_used + summary_used + facts_used + self.config.completion;

        if total > cap {
            return Err(BudgetError::BudgetExceeded {
                used: total,
                max: cap,
            });
        }

        Ok(BudgetAllocation {
            instructions: instructions_used,
            running_summary: summary_used,
            facts: facts_used,
            completion: self.config.completion,
            total_allocated: total,
            remaining: cap - total,
        })
    }

    /// Get the maximum total tokens
    pub fn max_total(&self) -> usize {
        self.config.max_total
    }

    /// Get the configuration
    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }
}
