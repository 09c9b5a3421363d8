//! Configuration for the AI resilience layer
//!
//! Values come from an optional config file (any format the `config` crate
//! recognises by extension) overlaid with `SCRUMFORGE_AI_*` environment
//! variables, using `__` between nested keys:
//!
//! ```text
//! SCRUMFORGE_AI_RETRY__MAX_RETRIES=5
//! SCRUMFORGE_AI_CIRCUIT_BREAKER__RESET_TIMEOUT=60000
//! SCRUMFORGE_AI_CACHE__ENABLED=false
//! ```
//!
//! Durations are expressed in milliseconds.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::DEFAULT_CACHE_TTL;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::context::DEFAULT_NEAR_LIMIT_RATIO;
use crate::error::{AiError, Result};
use crate::provider::registry::DEFAULT_PRIORITY;
use crate::retry::RetryPolicy;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SCRUMFORGE_AI";

/// Output tokens reserved when a request sets no `max_tokens`
pub const DEFAULT_RESERVED_OUTPUT_TOKENS: usize = 1024;

/// Serde helpers for `Duration` stored as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Response cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Context budgeting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Reserve used when a request has no `max_tokens`
    pub default_reserved_output_tokens: usize,
    /// Fraction of the input budget above which a warning is logged
    pub near_limit_ratio: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_reserved_output_tokens: DEFAULT_RESERVED_OUTPUT_TOKENS,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
        }
    }
}

/// Settings for a single provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Provider selection and per-provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Resolution order when a request names no provider
    pub priority: Vec<String>,
    /// Keyed by provider name
    pub settings: HashMap<String, ProviderSettings>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY.iter().map(|s| s.to_string()).collect(),
            settings: HashMap::new(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub providers: ProvidersConfig,
}

impl AiConfig {
    /// Load from an optional file plus the environment, then validate.
    ///
    /// A path that is given must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading AI configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AiConfig = builder.build()?.try_deserialize()?;
        config.apply_env_api_keys();
        config.validate()?;
        Ok(config)
    }

    /// Fill missing API keys from `<PROVIDER>_API_KEY` variables
    pub fn apply_env_api_keys(&mut self) {
        let mut names: Vec<String> = self.providers.priority.clone();
        names.extend(self.providers.settings.keys().cloned());
        names.sort();
        names.dedup();

        for name in names {
            let env_var = format!("{}_API_KEY", name.to_uppercase().replace('-', "_"));
            let Ok(api_key) = std::env::var(&env_var) else {
                continue;
            };
            if api_key.is_empty() {
                continue;
            }
            let settings = self.providers.settings.entry(name).or_default();
            if settings.api_key.is_none() {
                debug!(env_var = %env_var, "Using API key from environment");
                settings.api_key = Some(api_key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AiError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(AiError::Config(
                "circuit_breaker.success_threshold must be greater than 0".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(AiError::Config("cache.ttl must be greater than 0".to_string()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(AiError::Config(
                "retry.max_delay must not be less than retry.base_delay".to_string(),
            ));
        }
        if !(self.context.near_limit_ratio > 0.0 && self.context.near_limit_ratio <= 1.0) {
            return Err(AiError::Config(
                "context.near_limit_ratio must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn provider_settings(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.settings.get(name)
    }

    pub fn api_key(&self, name: &str) -> Option<&str> {
        self.provider_settings(name)?.api_key.as_deref()
    }
}
