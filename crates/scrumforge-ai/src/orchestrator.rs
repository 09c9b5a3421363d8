//! Request orchestration
//!
//! [`AiOrchestrator`] is the single entry point for callers. A completion
//! goes through provider resolution, context budgeting, the response cache,
//! breaker-guarded retries and finally cost accounting. Breakers, cache
//! entries and adapters live in concurrent maps, so one orchestrator can be
//! shared across tasks behind an `Arc`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{CacheSweeper, ResponseCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::config::AiConfig;
use crate::context::{BudgetedContext, ContextBudgeter};
use crate::error::{AiError, Result};
use crate::models::{ChatMessage, CompletionOptions, CompletionRequest, CompletionResponse};
use crate::provider::{Capability, Provider, ProviderDescriptor, ProviderRegistry};
use crate::providers::{openai_descriptor, OpenAiCompatibleProvider};
use crate::retry::RetryingExecutor;
use crate::streaming::CompletionStream;
use crate::usage::{TracingUsageSink, UsageAccountant, UsageSink};

/// Entry point for AI completions
pub struct AiOrchestrator {
    providers: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Option<Arc<ResponseCache>>,
    sweeper: Option<CacheSweeper>,
    executor: RetryingExecutor,
    budgeter: ContextBudgeter,
    accountant: UsageAccountant,
    default_reserved_output_tokens: usize,
}

impl AiOrchestrator {
    pub fn builder() -> AiOrchestratorBuilder {
        AiOrchestratorBuilder::new()
    }

    /// Build an orchestrator with OpenAI-compatible adapters for every
    /// configured provider. Entries other than `openai` are skipped unless
    /// they set both `base_url` and `default_model`.
    pub fn from_config(config: AiConfig) -> Result<Self> {
        config.validate()?;

        let mut names: Vec<&String> = config.providers.settings.keys().collect();
        names.sort();

        let mut builder = Self::builder();
        for name in names {
            let Some(settings) = config.provider_settings(name) else {
                continue;
            };
            let descriptor = if name == "openai" {
                openai_descriptor()
            } else {
                // Other vendors must name their own endpoint and model
                match (&settings.base_url, &settings.default_model) {
                    (Some(_), Some(model)) if !model.is_empty() => {
                        ProviderDescriptor::new(name.as_str(), model.clone())
                    }
                    _ => {
                        warn!(
                            provider = %name,
                            "Skipping provider without base_url and default_model"
                        );
                        continue;
                    }
                }
            };
            let provider = OpenAiCompatibleProvider::from_settings(descriptor, settings)?;
            builder = builder.provider(Arc::new(provider));
        }

        builder.config(config).build()
    }

    /// Complete a request with the configured retry budget
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.complete_with_retries(request, self.executor.policy().max_retries)
            .await
    }

    /// Complete a request with an explicit retry budget
    pub async fn complete_with_retries(
        &self,
        request: CompletionRequest,
        max_retries: u32,
    ) -> Result<CompletionResponse> {
        validate(&request)?;
        let provider = self.providers.resolve(request.provider.as_deref())?;
        let model = resolve_model(provider.as_ref(), &request);

        let fitted = self.budgeter.fit_messages(
            provider.as_ref(),
            Some(&model),
            &request.messages,
            provider.descriptor().context_window(&model),
            self.reserved_output_tokens(&request),
        )?;
        let request = with_messages(request, fitted);

        self.execute_completion(provider, model, request, max_retries)
            .await
    }

    /// Complete a structured conversation, trimming `history` to fit the
    /// model's context window while keeping `system` and `user_message`
    pub async fn complete_conversation(
        &self,
        system: Option<&str>,
        history: &[ChatMessage],
        user_message: &str,
        options: CompletionOptions,
    ) -> Result<CompletionResponse> {
        let system = system.map(ChatMessage::system);
        let latest = ChatMessage::user(user_message);
        let request = options.into_request(Vec::new());

        let provider = self.providers.resolve(request.provider.as_deref())?;
        let model = resolve_model(provider.as_ref(), &request);

        let fitted = self.budgeter.fit(
            provider.as_ref(),
            Some(&model),
            system.as_ref(),
            history,
            &latest,
            provider.descriptor().context_window(&model),
            self.reserved_output_tokens(&request),
        )?;
        if fitted.dropped > 0 {
            info!(
                provider = provider.name(),
                model = %model,
                dropped = fitted.dropped,
                kept = fitted.messages.len(),
                "Conversation history trimmed to fit context window"
            );
        }
        let request = with_messages(request, fitted);
        validate(&request)?;

        let max_retries = self.executor.policy().max_retries;
        self.execute_completion(provider, model, request, max_retries)
            .await
    }

    /// Open a streaming completion. Streams never touch the response cache.
    pub async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        validate(&request)?;
        let provider = self.providers.resolve(request.provider.as_deref())?;
        if !provider.descriptor().supports(Capability::Stream) {
            return Err(AiError::InvalidRequest(format!(
                "provider {} does not support streaming",
                provider.name()
            )));
        }
        let model = resolve_model(provider.as_ref(), &request);

        let fitted = self.budgeter.fit_messages(
            provider.as_ref(),
            Some(&model),
            &request.messages,
            provider.descriptor().context_window(&model),
            self.reserved_output_tokens(&request),
        )?;
        let mut request = with_messages(request, fitted);
        request.stream = true;
        request.model = Some(model.clone());

        let breaker = self.breakers.get_or_create(provider.name());
        let inner = self
            .executor
            .execute(&breaker, || provider.stream(&request))
            .await?;

        debug!(provider = provider.name(), model = %model, "Stream opened");
        Ok(CompletionStream::new(
            inner,
            model.clone(),
            provider.descriptor().pricing(&model),
            breaker,
            self.accountant.clone(),
            request.attribution.clone(),
        ))
    }

    /// Estimate tokens with the named (or highest-priority) provider
    pub fn count_tokens(
        &self,
        text: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<usize> {
        let provider = self.providers.resolve(provider)?;
        provider.count_tokens(text, model)
    }

    /// Names of providers that can currently serve requests
    pub fn available_providers(&self) -> Vec<String> {
        self.providers.available_providers()
    }

    pub fn is_available(&self) -> bool {
        !self.providers.available_providers().is_empty()
    }

    /// Current state of every breaker, sorted by name
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The response cache, `None` when caching is disabled
    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// Whether the background cache sweep is running
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .as_ref()
            .map(CacheSweeper::is_running)
            .unwrap_or(false)
    }

    fn reserved_output_tokens(&self, request: &CompletionRequest) -> usize {
        request
            .max_tokens
            .unwrap_or(self.default_reserved_output_tokens)
    }

    async fn execute_completion(
        &self,
        provider: Arc<dyn Provider>,
        model: String,
        mut request: CompletionRequest,
        max_retries: u32,
    ) -> Result<CompletionResponse> {
        request.model = Some(model.clone());

        let cache = self.cache.as_ref();
        let cache_key = cache.and_then(|_| ResponseCache::key_for(&request, &model));
        if let (Some(cache), Some(key)) = (cache, cache_key.as_deref()) {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }

        let breaker = self.breakers.get_or_create(provider.name());
        let response = self
            .executor
            .execute_with_retries(&breaker, max_retries, || provider.complete(&request))
            .await?;

        let cost = self
            .accountant
            .cost(provider.descriptor().pricing(&model), &response.usage);
        let response = response.with_cost(cost);
        debug!(
            provider = provider.name(),
            model = %model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            cost,
            "Completion finished"
        );

        if let (Some(cache), Some(key)) = (cache, cache_key) {
            cache.set(key, response.clone());
        }
        if let Some(attribution) = &request.attribution {
            self.accountant.record(attribution, &model, &response.usage);
        }
        Ok(response)
    }
}

fn validate(request: &CompletionRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(AiError::InvalidRequest(
            "request must contain at least one message".to_string(),
        ));
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AiError::InvalidRequest(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                temperature
            )));
        }
    }
    if request.max_tokens == Some(0) {
        return Err(AiError::InvalidRequest(
            "max_tokens must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn resolve_model(provider: &dyn Provider, request: &CompletionRequest) -> String {
    request
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model().to_string())
}

fn with_messages(mut request: CompletionRequest, fitted: BudgetedContext) -> CompletionRequest {
    if fitted.dropped > 0 {
        debug!(
            dropped = fitted.dropped,
            tokens = fitted.estimated_tokens,
            budget = fitted.budget,
            "Request history trimmed"
        );
    }
    request.messages = fitted.messages;
    request
}

/// Builder for [`AiOrchestrator`]
pub struct AiOrchestratorBuilder {
    config: AiConfig,
    providers: Vec<Arc<dyn Provider>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    spawn_sweeper: bool,
}

impl AiOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: AiConfig::default(),
            providers: Vec::new(),
            breakers: None,
            usage_sink: None,
            spawn_sweeper: true,
        }
    }

    pub fn config(mut self, config: AiConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a candidate adapter; unavailable adapters are not registered
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Share a breaker registry with other orchestrators
    pub fn breaker_registry(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// Skip the background cache sweep; expired entries are still ignored
    /// on read
    pub fn without_sweeper(mut self) -> Self {
        self.spawn_sweeper = false;
        self
    }

    /// Validate the configuration and assemble the orchestrator
    pub fn build(self) -> Result<AiOrchestrator> {
        let config = self.config;
        config.validate()?;

        let providers = Arc::new(ProviderRegistry::from_providers(
            self.providers,
            config.providers.priority.clone(),
        ));
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakerRegistry::with_config(
                config.circuit_breaker.clone(),
            ))
        });

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache.ttl)));
        let sweeper = match &cache {
            Some(cache)
                if self.spawn_sweeper && tokio::runtime::Handle::try_current().is_ok() =>
            {
                Some(cache.spawn_sweeper())
            }
            Some(_) if self.spawn_sweeper => {
                debug!("No async runtime available, cache sweep not started");
                None
            }
            _ => None,
        };

        let sink = self
            .usage_sink
            .unwrap_or_else(|| Arc::new(TracingUsageSink) as Arc<dyn UsageSink>);

        Ok(AiOrchestrator {
            providers,
            breakers,
            cache,
            sweeper,
            executor: RetryingExecutor::new(config.retry.clone()),
            budgeter: ContextBudgeter::new(config.context.near_limit_ratio),
            accountant: UsageAccountant::new(sink),
            default_reserved_output_tokens: config.context.default_reserved_output_tokens,
        })
    }
}

impl Default for AiOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
