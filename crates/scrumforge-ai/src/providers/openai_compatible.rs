//! OpenAI-compatible chat-completions adapter
//!
//! Works against api.openai.com and any server exposing the same
//! `/chat/completions` contract. Streaming reads the SSE body incrementally;
//! dropping the returned stream drops the HTTP response and closes the
//! connection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::ProviderSettings;
use crate::error::{AiError, Result};
use crate::models::{
    join_contents, ChatMessage, CompletionRequest, CompletionResponse, FinishReason,
    ResponseFormat, StreamChunk, Usage,
};
use crate::provider::{ModelPricing, Provider, ProviderDescriptor, ProviderStream};
use crate::token_counter::TokenCounter;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Descriptor for OpenAI's hosted models (pricing per 1M tokens)
pub fn openai_descriptor() -> ProviderDescriptor {
    ProviderDescriptor::new("openai", "gpt-4o-mini")
        .with_model("gpt-4o", 128_000, ModelPricing::new(2.50, 10.00))
        .with_model("gpt-4o-mini", 128_000, ModelPricing::new(0.15, 0.60))
        .with_model("gpt-4-turbo", 128_000, ModelPricing::new(10.00, 30.00))
        .with_model("gpt-4", 8_192, ModelPricing::new(30.00, 60.00))
        .with_model("gpt-3.5-turbo", 16_385, ModelPricing::new(0.50, 1.50))
}

/// Adapter for OpenAI-compatible endpoints
pub struct OpenAiCompatibleProvider {
    descriptor: ProviderDescriptor,
    api_key: Option<String>,
    base_url: String,
    client: Client,
    token_counter: TokenCounter,
}

impl OpenAiCompatibleProvider {
    pub fn new(descriptor: ProviderDescriptor, api_key: Option<String>) -> Self {
        Self {
            descriptor,
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
            client: Client::new(),
            token_counter: TokenCounter::new(),
        }
    }

    /// OpenAI with its hosted model table
    pub fn openai(api_key: Option<String>) -> Self {
        Self::new(openai_descriptor(), api_key)
    }

    /// Build from configured settings, overriding base URL, default model
    /// and request timeout where set
    pub fn from_settings(
        mut descriptor: ProviderDescriptor,
        settings: &ProviderSettings,
    ) -> Result<Self> {
        if let Some(model) = &settings.default_model {
            descriptor.default_model = model.clone();
        }
        let mut provider = Self::new(descriptor, settings.api_key.clone());
        if let Some(base_url) = &settings.base_url {
            provider = provider.with_base_url(base_url.clone());
        }
        if let Some(timeout_ms) = settings.timeout_ms {
            provider = provider.with_timeout(Duration::from_millis(timeout_ms))?;
        }
        Ok(provider)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve_model(&self, request: &CompletionRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.descriptor.default_model.clone())
    }

    fn build_body(&self, request: &CompletionRequest, model: &str, stream: bool) -> WireRequest {
        WireRequest {
            model: model.to_string(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: match request.response_format {
                Some(ResponseFormat::Json) => Some(WireResponseFormat {
                    kind: "json_object".to_string(),
                }),
                _ => None,
            },
            stream,
            stream_options: stream.then_some(WireStreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, body: &WireRequest) -> Result<reqwest::Response> {
        let api_key = self.api_key.as_deref().unwrap_or_default();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(provider = %self.descriptor.name, error = %e, "API request failed");
                AiError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(
                provider = %self.descriptor.name,
                status = status.as_u16(),
                body = %error_text,
                "API returned error status"
            );
            return Err(AiError::from_status(
                status.as_u16(),
                format!("{} API error ({}): {}", self.descriptor.name, status, error_text),
            ));
        }
        Ok(response)
    }

    fn estimate_prompt_tokens(&self, messages: &[ChatMessage]) -> usize {
        self.token_counter.count(&join_contents(messages))
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let model = self.resolve_model(request);
        debug!(provider = %self.descriptor.name, model = %model, "Sending completion request");

        let body = self.build_body(request, &model, false);
        let response = self.send(&body).await?;
        let wire: WireResponse = response.json().await.map_err(|e| {
            AiError::Serialization(format!("Invalid completion response: {}", e))
        })?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiError::transient("No choices in completion response"))?;
        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let usage = match wire.usage {
            Some(usage) => Usage::new(usage.prompt_tokens, usage.completion_tokens),
            None => Usage::new(
                self.estimate_prompt_tokens(&request.messages),
                self.token_counter.count(&content),
            ),
        };

        Ok(CompletionResponse::new(content, wire.model.unwrap_or(model), usage)
            .with_finish_reason(FinishReason::from_vendor(choice.finish_reason.as_deref())))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ProviderStream> {
        let model = self.resolve_model(request);
        debug!(provider = %self.descriptor.name, model = %model, "Opening completion stream");

        let body = self.build_body(request, &model, true);
        let response = self.send(&body).await?;

        let state = StreamState {
            response: Some(response),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            prompt_estimate: self.estimate_prompt_tokens(&request.messages),
            completion_text: String::new(),
            usage: None,
            finish_reason: None,
            finished: false,
            token_counter: self.token_counter,
        };

        let chunks = stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        });
        Ok(Box::pin(chunks))
    }

    fn count_tokens(&self, text: &str, _model: Option<&str>) -> Result<usize> {
        Ok(self.token_counter.count(text))
    }

    fn is_available(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

/// Splits a byte stream into SSE `data:` payloads
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed bytes, returning every complete `data:` payload
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::parse_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush an unterminated last line
    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::parse_line(&line)
    }

    fn parse_line(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        let data = line.strip_prefix("data:")?;
        Some(data.trim_start().to_string())
    }
}

struct StreamState {
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamChunk>>,
    prompt_estimate: usize,
    completion_text: String,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    finished: bool,
    token_counter: TokenCounter,
}

impl StreamState {
    async fn next_item(&mut self) -> Option<Result<StreamChunk>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }

            let Some(response) = self.response.as_mut() else {
                self.finish();
                continue;
            };

            let next = response.chunk().await;
            match next {
                Ok(Some(bytes)) => {
                    for payload in self.decoder.push(&bytes) {
                        self.handle_payload(&payload);
                    }
                }
                Ok(None) => {
                    if let Some(payload) = self.decoder.finish() {
                        self.handle_payload(&payload);
                    }
                    if self.finished || self.finish_reason.is_some() {
                        self.finish();
                    } else {
                        self.truncate();
                    }
                }
                Err(e) => {
                    error!(error = %e, "Stream read failed");
                    self.pending.push_back(Err(AiError::from(e)));
                    self.response = None;
                    self.finished = true;
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: &str) {
        if self.finished {
            return;
        }
        if payload == "[DONE]" {
            self.finish();
            return;
        }

        let chunk: WireStreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "Skipping unparseable stream event");
                return;
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.finish_reason = Some(FinishReason::from_vendor(Some(reason)));
            }
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                if !text.is_empty() {
                    self.completion_text.push_str(&text);
                    self.pending.push_back(Ok(StreamChunk::delta(text)));
                }
            }
        }
    }

    /// Body ended with neither `[DONE]` nor a finish reason
    fn truncate(&mut self) {
        warn!(
            received_chars = self.completion_text.len(),
            "Stream ended before completion"
        );
        self.pending
            .push_back(Err(AiError::transient("stream ended before completion")));
        self.response = None;
        self.finished = true;
    }

    /// Queue the terminal chunk and release the connection
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        let usage = self.usage.unwrap_or_else(|| {
            Usage::new(
                self.prompt_estimate,
                self.token_counter.count(&self.completion_text),
            )
        });
        let reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        self.pending.push_back(Ok(StreamChunk::finished(usage, reason)));
        self.response = None;
        self.finished = true;
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: Option<String>,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    content: Option<String>,
}
