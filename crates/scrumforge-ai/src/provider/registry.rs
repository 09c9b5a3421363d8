//! Provider registry with priority-based resolution

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::Provider;
use crate::error::{AiError, Result};

/// Default selection order, cheapest and most available first
pub const DEFAULT_PRIORITY: &[&str] = &["openai", "anthropic", "google"];

/// Registry of available adapters keyed by provider name
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    priority: Vec<String>,
}

impl ProviderRegistry {
    /// Create an empty registry using [`DEFAULT_PRIORITY`]
    pub fn new() -> Self {
        Self::with_priority(DEFAULT_PRIORITY.iter().map(|p| p.to_string()).collect())
    }

    /// Create an empty registry with a custom priority order
    pub fn with_priority(priority: Vec<String>) -> Self {
        Self {
            providers: DashMap::new(),
            priority,
        }
    }

    /// Build a registry from candidate adapters, keeping only available ones
    pub fn from_providers(
        providers: impl IntoIterator<Item = Arc<dyn Provider>>,
        priority: Vec<String>,
    ) -> Self {
        let registry = Self::with_priority(priority);
        for provider in providers {
            registry.register(provider);
        }
        info!(
            providers = ?registry.provider_names(),
            "Provider registry initialised"
        );
        registry
    }

    /// Register an adapter. Unavailable adapters are skipped; returns
    /// whether the adapter was added.
    pub fn register(&self, provider: Arc<dyn Provider>) -> bool {
        let name = provider.name().to_string();
        if !provider.is_available() {
            debug!(provider = %name, "Skipping unavailable provider");
            return false;
        }
        self.providers.insert(name, provider);
        true
    }

    /// Remove an adapter by name
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.providers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AiError::Config(format!("Provider not registered: {}", name)))
    }

    /// Get an adapter by exact name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve the adapter to use for a request.
    ///
    /// The preferred adapter wins if present and available; otherwise the
    /// highest-priority available adapter; otherwise any available adapter
    /// in name order.
    pub fn resolve(&self, preferred: Option<&str>) -> Result<Arc<dyn Provider>> {
        if let Some(name) = preferred {
            match self.get(name) {
                Some(provider) if provider.is_available() => return Ok(provider),
                _ => debug!(preferred = name, "Preferred provider absent, falling back"),
            }
        }

        for name in &self.priority {
            if let Some(provider) = self.get(name) {
                if provider.is_available() {
                    return Ok(provider);
                }
            }
        }

        let mut names = self.provider_names();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.get(name))
            .find(|provider| provider.is_available())
            .ok_or(AiError::NoProviderAvailable)
    }

    /// Names of registered adapters that currently report availability
    pub fn available_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Names of all registered adapters
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
