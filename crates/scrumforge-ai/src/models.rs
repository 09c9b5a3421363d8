//! Request/response data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Output format hint passed to the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Who a request is billed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAttribution {
    pub project_id: String,
    pub user_id: Option<String>,
    /// Free-form label such as "generate_stories" or "refine_epic"
    pub operation: String,
}

impl UsageAttribution {
    pub fn new(project_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: None,
            operation: operation.into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Provider-agnostic completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Ordered conversation; must not be empty
    pub messages: Vec<ChatMessage>,
    /// Model override, otherwise the provider's default model
    pub model: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: Option<usize>,
    /// Sampling temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Streamed requests never touch the response cache
    #[serde(default)]
    pub stream: bool,
    pub response_format: Option<ResponseFormat>,
    /// Preferred provider name
    pub provider: Option<String>,
    /// Billing attribution for usage records
    pub attribution: Option<UsageAttribution>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: None,
            temperature: None,
            stream: false,
            response_format: None,
            provider: None,
            attribution: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attribution(mut self, attribution: UsageAttribution) -> Self {
        self.attribution = Some(attribution);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Concatenated message contents, as used for token estimation
    pub fn joined_content(&self) -> String {
        join_contents(&self.messages)
    }
}

/// Request settings without the messages, for callers that assemble the
/// conversation separately
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub response_format: Option<ResponseFormat>,
    pub provider: Option<String>,
    pub attribution: Option<UsageAttribution>,
}

impl CompletionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_attribution(mut self, attribution: UsageAttribution) -> Self {
        self.attribution = Some(attribution);
        self
    }

    pub fn into_request(self, messages: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest {
            messages,
            model: self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
            response_format: self.response_format,
            provider: self.provider,
            attribution: self.attribution,
        }
    }
}

/// Join message contents with newlines
pub fn join_contents(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reason a completion finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// Map a vendor finish reason string
    pub fn from_vendor(reason: Option<&str>) -> Self {
        match reason {
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("error") => FinishReason::Error,
            _ => FinishReason::Stop,
        }
    }
}

/// Token usage and its estimated cost in USD
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub estimated_cost: f64,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            estimated_cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

/// Completed, immutable response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    /// Model that actually served the request
    pub model: String,
    /// True when served from the response cache
    pub cached: bool,
}

impl CompletionResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>, usage: Usage) -> Self {
        Self {
            content: content.into(),
            finish_reason: FinishReason::Stop,
            usage,
            model: model.into(),
            cached: false,
        }
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Copy of this response flagged as a cache hit
    pub(crate) fn as_cached(&self) -> Self {
        Self {
            cached: true,
            ..self.clone()
        }
    }

    /// Copy of this response with its usage cost filled in
    pub(crate) fn with_cost(self, cost: f64) -> Self {
        Self {
            usage: self.usage.with_cost(cost),
            ..self
        }
    }
}

/// One piece of a streamed completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial text
    pub delta: String,
    pub done: bool,
    /// Aggregate usage, carried by the final chunk
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            done: false,
            usage: None,
            finish_reason: None,
        }
    }

    pub fn finished(usage: Usage, finish_reason: FinishReason) -> Self {
        Self {
            delta: String::new(),
            done: true,
            usage: Some(usage),
            finish_reason: Some(finish_reason),
        }
    }
}

/// Billing record for one completed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub project_id: String,
    pub user_id: Option<String>,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cost: f64,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}
