//! ScrumForge AI - resilient, budgeted access to AI providers
//!
//! Turns "ask a model something" into a bounded, cost-accounted call against
//! one of several interchangeable providers: per-provider circuit breakers,
//! bounded exponential-backoff retries, a TTL response cache, context-window
//! budgeting, and usage accounting.
//!
//! ```ignore
//! let orchestrator = AiOrchestrator::from_config(AiConfig::load(None)?)?;
//! let response = orchestrator
//!     .complete(CompletionRequest::new(vec![
//!         ChatMessage::system("You write user stories."),
//!         ChatMessage::user("Checkout with saved cards"),
//!     ]))
//!     .await?;
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod streaming;
pub mod token_counter;
pub mod usage;

// Re-export commonly used types
pub use cache::{CacheSweeper, ResponseCache, DEFAULT_CACHE_TTL};
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use config::{AiConfig, CacheConfig, ContextConfig, ProviderSettings, ProvidersConfig};
pub use context::{BudgetedContext, ContextBudgeter};
pub use error::{AiError, Result};
pub use models::{
    ChatMessage, CompletionOptions, CompletionRequest, CompletionResponse, FinishReason,
    ResponseFormat, Role, StreamChunk, Usage, UsageAttribution, UsageRecord,
};
pub use orchestrator::{AiOrchestrator, AiOrchestratorBuilder};
pub use provider::{
    Capability, ModelPricing, ModelSpec, Provider, ProviderDescriptor, ProviderRegistry,
    ProviderStream,
};
pub use providers::OpenAiCompatibleProvider;
pub use retry::{RetryPolicy, RetryingExecutor};
pub use streaming::CompletionStream;
pub use token_counter::TokenCounter;
pub use usage::{
    calculate_cost, InMemoryUsageSink, JsonLinesUsageSink, TracingUsageSink, UsageAccountant,
    UsageSink,
};
