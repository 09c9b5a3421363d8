//! Cancellable completion streams
//!
//! [`CompletionStream`] wraps an adapter's chunk stream. When the final chunk
//! arrives its usage is priced and, for attributed requests, recorded. A read
//! error mid-stream, or an adapter stream that ends before its final chunk,
//! surfaces as an error and counts as a failure against the provider's
//! breaker.
//! Calling [`CompletionStream::close`] or dropping the stream releases the
//! adapter stream and with it the underlying connection.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AiError, Result};
use crate::models::{StreamChunk, UsageAttribution};
use crate::provider::{ModelPricing, ProviderStream};
use crate::usage::UsageAccountant;

/// Chunk stream returned by the orchestrator
pub struct CompletionStream {
    inner: Option<ProviderStream>,
    provider: String,
    model: String,
    pricing: ModelPricing,
    breaker: Arc<CircuitBreaker>,
    accountant: UsageAccountant,
    attribution: Option<UsageAttribution>,
}

impl CompletionStream {
    pub(crate) fn new(
        inner: ProviderStream,
        model: impl Into<String>,
        pricing: ModelPricing,
        breaker: Arc<CircuitBreaker>,
        accountant: UsageAccountant,
        attribution: Option<UsageAttribution>,
    ) -> Self {
        Self {
            inner: Some(inner),
            provider: breaker.name().to_string(),
            model: model.into(),
            pricing,
            breaker,
            accountant,
            attribution,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the stream has finished, failed or been closed
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Stop consuming and release the provider connection. Later polls
    /// yield `None`.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!(provider = %self.provider, model = %self.model, "Stream closed by caller");
        }
    }

    fn on_chunk(&mut self, mut chunk: StreamChunk) -> StreamChunk {
        if !chunk.done {
            return chunk;
        }

        if let Some(usage) = chunk.usage.as_mut() {
            usage.estimated_cost = self.accountant.cost(self.pricing, usage);
            if let Some(attribution) = &self.attribution {
                self.accountant.record(attribution, &self.model, usage);
            }
        }
        debug!(provider = %self.provider, model = %self.model, "Stream completed");
        self.inner = None;
        chunk
    }
}

impl Stream for CompletionStream {
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(this.on_chunk(chunk)))),
            Poll::Ready(Some(Err(err))) => {
                this.breaker.record_failure();
                this.inner = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                warn!(
                    provider = %this.provider,
                    model = %this.model,
                    "Stream ended without a final chunk"
                );
                this.breaker.record_failure();
                this.inner = None;
                Poll::Ready(Some(Err(AiError::transient("stream ended before completion"))))
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.close();
    }
}
