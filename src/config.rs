//! Engine configuration
//!
//! One section per component. Every field has a default, so an empty file
//! (or no file at all) yields a working local setup. Values are layered:
//! defaults, then the TOML file, then `DECK__SECTION__KEY` environment
//! variables (after loading `.env`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::chunking::ChunkingConfig;
use crate::context::TokenBudgetConfig;
use crate::contradiction::ContradictionConfig;
use crate::error::{ContextError, Result};
use crate::facts::FactsConfig;
use crate::index::IndexConfig;
use crate::memory::MemoryConfig;
use crate::router::RouterConfig;
use crate::synthesis::{RetryPolicy, SynthesisConfig};

pub const ENV_PREFIX: &str = "DECK";

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_level")]
    pub level: String,

    /// JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            with_target: default_with_target(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub facts: FactsConfig,

    #[serde(default)]
    pub contradiction: ContradictionConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub token_budget: TokenBudgetConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from an optional TOML file and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // a missing .env is fine
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without consulting the environment
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |section: &str, reason: String| {
            ContextError::Configuration(format!("[{}] {}", section, reason))
        };

        self.chunking.validate()?;
        self.index.validate().map_err(|e| invalid("index", e))?;
        self.facts.validate().map_err(|e| invalid("facts", e))?;
        self.contradiction
            .validate()
            .map_err(|e| invalid("contradiction", e))?;
        self.router.validate().map_err(|e| invalid("router", e))?;
        self.retry.validate().map_err(|e| invalid("retry", e))?;
        self.synthesis
            .validate()
            .map_err(|e| invalid("synthesis", e))?;
        self.token_budget.validate()?;

        if !matches!(self.facts.extractor.as_str(), "pattern" | "model") {
            return Err(invalid(
                "facts",
                format!("unknown extractor '{}'", self.facts.extractor),
            ));
        }
        if !matches!(self.memory.summarizer.as_str(), "concat" | "model") {
            return Err(invalid(
                "memory",
                format!("unknown summarizer '{}'", self.memory.summarizer),
            ));
        }
        if self.memory.summary_max_tokens == 0 {
            return Err(invalid(
                "memory",
                "summary_max_tokens must be positive".to_string(),
            ));
        }
        if self.chunking.max_tokens > self.token_budget.facts {
            return Err(invalid(
                "chunking",
                format!(
                    "max_tokens ({}) exceeds the facts budget ({})",
                    self.chunking.max_tokens, self.token_budget.facts
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            [chunking]
            max_tokens = 200
            overlap_tokens = 20

            [index]
            dense_weight = 0.7
            lexical_weight = 0.3

            [synthesis]
            top_k = 5

            [retry]
            max_attempts = 2

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.chunking.max_tokens, 200);
        assert_eq!(config.index.dense_weight, 0.7);
        assert_eq!(config.synthesis.top_k, 5);
        assert_eq!(config.synthesis.min_results, 1);
        assert_eq!(config.retry.max_attempts, 2);
        assert!(config.logging.json);
        assert_eq!(config.token_budget.completion, 1000);
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let err = Config::from_toml_str(
            r#"
            [index]
            dense_weight = 0.0
            lexical_weight = 0.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::Configuration(ref msg) if msg.contains("[index]")));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert!(config.synthesis.top_k > 0);
    }
}
