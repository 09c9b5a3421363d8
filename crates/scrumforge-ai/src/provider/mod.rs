//! Provider adapter contract and descriptor types

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    models::{CompletionRequest, CompletionResponse, StreamChunk},
};

pub mod registry;

pub use registry::ProviderRegistry;

/// Raw chunk stream produced by an adapter. Dropping it must release the
/// underlying connection.
pub type ProviderStream = futures::stream::BoxStream<'static, Result<StreamChunk>>;

/// Context window assumed for models a descriptor does not list
pub const DEFAULT_CONTEXT_WINDOW: usize = 8_192;

/// Pricing assumed for models a descriptor does not list (USD per 1M tokens)
pub const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_million: 10.0,
    output_per_million: 30.0,
};

/// Operations an adapter supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Complete,
    Stream,
    CountTokens,
    IsAvailable,
}

/// Cost per million tokens in USD
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Per-model limits and pricing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub context_window: usize,
    pub pricing: ModelPricing,
}

/// Static description of a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub default_model: String,
    pub capabilities: HashSet<Capability>,
    pub models: HashMap<String, ModelSpec>,
}

impl ProviderDescriptor {
    /// Descriptor with the full capability set and no known models
    pub fn new(name: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_model: default_model.into(),
            capabilities: [
                Capability::Complete,
                Capability::Stream,
                Capability::CountTokens,
                Capability::IsAvailable,
            ]
            .into_iter()
            .collect(),
            models: HashMap::new(),
        }
    }

    pub fn with_model(
        mut self,
        model: impl Into<String>,
        context_window: usize,
        pricing: ModelPricing,
    ) -> Self {
        self.models.insert(
            model.into(),
            ModelSpec {
                context_window,
                pricing,
            },
        );
        self
    }

    pub fn without_capability(mut self, capability: Capability) -> Self {
        self.capabilities.remove(&capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Context window for a model, falling back to a conservative default
    pub fn context_window(&self, model: &str) -> usize {
        self.models
            .get(model)
            .map(|spec| spec.context_window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    /// Pricing for a model, falling back to a conservative default
    pub fn pricing(&self, model: &str) -> ModelPricing {
        self.models
            .get(model)
            .map(|spec| spec.pricing)
            .unwrap_or(DEFAULT_PRICING)
    }
}

/// Core trait that every vendor adapter implements
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static description: name, default model, capabilities, model table
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Provider name, used as registry key and breaker name
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn default_model(&self) -> &str {
        &self.descriptor().default_model
    }

    /// Run a non-streaming completion
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Open a streaming completion
    async fn stream(&self, request: &CompletionRequest) -> Result<ProviderStream>;

    /// Estimate tokens for `text` under `model` (default model when `None`)
    fn count_tokens(&self, text: &str, model: Option<&str>) -> Result<usize>;

    /// Whether the adapter is configured with usable credentials
    fn is_available(&self) -> bool;
}
