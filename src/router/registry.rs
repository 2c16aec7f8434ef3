//! Static registry of model profiles and their backends

use indexmap::IndexMap;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::backend::{HttpChatBackend, ModelBackend};
use super::models::ModelProfile;
use crate::error::{ContextError, Result};

#[derive(Clone)]
struct RegisteredModel {
    profile: ModelProfile,
    backend: Arc<dyn ModelBackend>,
}

/// Profiles by name, in registration order. Built once and read-only
/// afterwards.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: IndexMap<String, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP backends for every profile that names an endpoint
    pub fn from_profiles(profiles: &[ModelProfile], request_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        for profile in profiles {
            let Some(endpoint) = profile.endpoint.as_deref() else {
                warn!(
                    "Model profile {} has no endpoint; register a backend for it in code",
                    profile.name
                );
                continue;
            };
            let api_key = profile
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .map(SecretString::new);
            let backend = HttpChatBackend::new(
                profile.name.clone(),
                endpoint,
                profile.upstream_model(),
                api_key,
                request_timeout,
            )?;
            registry.register(profile.clone(), Arc::new(backend))?;
        }
        info!("Model registry built with {} profiles", registry.len());
        Ok(registry)
    }

    pub fn register(&mut self, profile: ModelProfile, backend: Arc<dyn ModelBackend>) -> Result<()> {
        if profile.tasks.is_empty() {
            return Err(ContextError::Configuration(format!(
                "model profile {} supports no tasks",
                profile.name
            )));
        }
        if profile.cost_per_1k_tokens < 0.0 || !profile.cost_per_1k_tokens.is_finite() {
            return Err(ContextError::Configuration(format!(
                "model profile {} has invalid cost {}",
                profile.name, profile.cost_per_1k_tokens
            )));
        }
        if self.models.contains_key(&profile.name) {
            return Err(ContextError::Configuration(format!(
                "model profile {} registered twice",
                profile.name
            )));
        }
        self.models
            .insert(profile.name.clone(), RegisteredModel { profile, backend });
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, profile: ModelProfile, backend: Arc<dyn ModelBackend>) -> Result<Self> {
        self.register(profile, backend)?;
        Ok(self)
    }

    pub fn profile(&self, name: &str) -> Option<&ModelProfile> {
        self.models.get(name).map(|m| &m.profile)
    }

    pub fn backend_for(&self, name: &str) -> Option<Arc<dyn ModelBackend>> {
        self.models.get(name).map(|m| m.backend.clone())
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ModelProfile> {
        self.models.values().map(|m| &m.profile)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
