//! Tests for the OpenAI-compatible adapter against a mock HTTP server

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use scrumforge_ai::{
    providers::openai_descriptor, AiConfig, AiError, AiOrchestrator, ChatMessage,
    CompletionRequest, FinishReason, InMemoryUsageSink, OpenAiCompatibleProvider, Provider,
    ResponseFormat, StreamChunk,
};

fn provider_for(server: &mockito::Server) -> OpenAiCompatibleProvider {
    OpenAiCompatibleProvider::openai(Some("sk-test".to_string())).with_base_url(server.url())
}

fn request() -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system("You write user stories."),
        ChatMessage::user("Checkout with saved cards"),
    ])
    .with_model("gpt-4o")
}

/// Test: Completion with mock responses
#[tokio::test]
async fn test_completion_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"model": "gpt-4o", "max_tokens": 200, "response_format": {"type": "json_object"}}"#
                .to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "As a shopper, I want saved cards"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
        }"#,
        )
        .expect(1)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let response = provider
        .complete(
            &request()
                .with_max_tokens(200)
                .with_response_format(ResponseFormat::Json),
        )
        .await
        .unwrap();

    assert_eq!(response.content, "As a shopper, I want saved cards");
    assert_eq!(response.model, "gpt-4o-2024-08-06");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.prompt_tokens, 1_000);
    assert_eq!(response.usage.completion_tokens, 500);
    assert_eq!(response.usage.total_tokens, 1_500);
    assert!(!response.cached);
    mock.assert_async().await;
}

/// Test: Missing usage falls back to the heuristic estimate
#[tokio::test]
async fn test_completion_without_usage_is_estimated() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices": [{"message": {"role": "assistant", "content": "12345678"}, "finish_reason": "length"}]}"#)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let response = provider.complete(&request()).await.unwrap();

    assert_eq!(response.model, "gpt-4o");
    assert_eq!(response.finish_reason, FinishReason::Length);
    assert_eq!(response.usage.completion_tokens, 2);
    assert!(response.usage.prompt_tokens > 0);
}

/// Test: Error handling - client errors are not retryable
#[tokio::test]
async fn test_auth_error_is_non_retryable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error": {"message": "Incorrect API key provided"}}"#)
        .create_async()
        .await;

    let result = provider_for(&server).complete(&request()).await;

    match result {
        Err(err @ AiError::NonRetryable { status: 401, .. }) => assert!(!err.is_retryable()),
        other => panic!("expected non-retryable 401, got {:?}", other),
    }
}

/// Test: Error handling - rate limits and server errors are transient
#[tokio::test]
async fn test_rate_limit_and_server_errors_are_transient() {
    for status in [429usize, 500, 503] {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(status)
            .with_body(r#"{"error": {"message": "try later"}}"#)
            .create_async()
            .await;

        let result = provider_for(&server).complete(&request()).await;
        match result {
            Err(err @ AiError::Transient { .. }) => {
                assert_eq!(err.status(), Some(status as u16));
                assert!(err.is_retryable());
            }
            other => panic!("expected transient error for {}, got {:?}", status, other),
        }
    }
}

/// Test: Streaming parses SSE deltas and the usage event
#[tokio::test]
async fn test_streaming_with_mock() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"As a shopper, \"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"I want saved cards\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":40,\"completion_tokens\":9,\"total_tokens\":49}}\n\n",
        "data: [DONE]\n\n",
    );
    let _mock = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"stream": true, "stream_options": {"include_usage": true}}"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let stream = provider.stream(&request().streaming()).await.unwrap();
    let chunks: Vec<StreamChunk> = stream.map(|chunk| chunk.unwrap()).collect().await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].delta, "As a shopper, ");
    assert_eq!(chunks[1].delta, "I want saved cards");
    let last = &chunks[2];
    assert!(last.done);
    assert_eq!(last.finish_reason, Some(FinishReason::Stop));
    let usage = last.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 40);
    assert_eq!(usage.completion_tokens, 9);
}

/// Test: A finish reason without [DONE] still completes the stream
#[tokio::test]
async fn test_streaming_finish_reason_without_done_marker() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(
            "data: {\"choices\":[{\"delta\":{\"content\":\"abcdefgh\"},\"finish_reason\":\"length\"}]}\n\n",
        )
        .create_async()
        .await;

    let stream = provider_for(&server).stream(&request()).await.unwrap();
    let chunks: Vec<StreamChunk> = stream.map(|chunk| chunk.unwrap()).collect().await;

    assert_eq!(chunks.len(), 2);
    let last = &chunks[1];
    assert!(last.done);
    assert_eq!(last.finish_reason, Some(FinishReason::Length));
    // estimated: 8 chars -> 2 tokens
    assert_eq!(last.usage.unwrap().completion_tokens, 2);
}

/// Test: A body cut off mid-answer is an error, not a finished stream
#[tokio::test]
async fn test_streaming_truncated_body_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"As a user I wa\"}}]}\n\n")
        .create_async()
        .await;

    let chunks: Vec<_> = provider_for(&server)
        .stream(&request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].as_ref().unwrap().delta, "As a user I wa");
    match &chunks[1] {
        Err(err @ AiError::Transient { .. }) => assert!(err.is_retryable()),
        other => panic!("expected transient error, got {:?}", other),
    }
}

/// Test: Streaming errors surface before any chunk
#[tokio::test]
async fn test_streaming_error_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(403)
        .with_body("forbidden")
        .create_async()
        .await;

    let result = provider_for(&server).stream(&request()).await;
    assert!(matches!(result, Err(AiError::NonRetryable { status: 403, .. })));
}

/// Test: The orchestrator retries server errors against the real adapter
#[tokio::test]
async fn test_orchestrator_retries_server_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body("upstream exploded")
        .expect(3)
        .create_async()
        .await;

    let mut config = AiConfig::default();
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);

    let orchestrator = AiOrchestrator::builder()
        .config(config)
        .provider(Arc::new(provider_for(&server)))
        .usage_sink(Arc::new(InMemoryUsageSink::new()))
        .without_sweeper()
        .build()
        .unwrap();

    let result = orchestrator.complete(request()).await;
    assert!(matches!(
        result,
        Err(AiError::Transient {
            status: Some(500),
            ..
        })
    ));
    mock.assert_async().await;
}

#[test]
fn test_descriptor_prices_gpt_4o() {
    let descriptor = openai_descriptor();
    let pricing = descriptor.pricing("gpt-4o");
    assert_eq!(pricing.input_per_million, 2.50);
    assert_eq!(pricing.output_per_million, 10.00);
}
