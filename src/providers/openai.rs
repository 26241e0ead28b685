// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OpenAI-compatible completion service.
//!
//! Works against OpenAI and any API that speaks the Chat Completions wire
//! format (Ollama, Together, Groq, vLLM, ...). Responses are always streamed:
//! SSE frames are decoded as body chunks arrive and translated into
//! [`StreamEvent`]s on the caller's channel.
//!
//! # API Reference
//!
//! See [OpenAI Chat Completions API](https://platform.openai.com/docs/api-reference/chat)

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[cfg(feature = "telemetry")]
use tracing::debug;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::ProviderError;
use crate::types::{
    CompletionRequest, Message, Provider, Role, StopReason, StreamEvent, TokenUsage,
    ToolDefinition,
};

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Ollama API base URL.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Default max tokens if the request does not set one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// OpenAI-compatible provider.
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    provider_name: String,
}

impl OpenAIProvider {
    /// Create a new provider.
    pub fn new(
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
            .build()
            .unwrap_or_else(|_| Client::new());

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let provider_name = Self::detect_provider_name(&base_url);

        Self {
            client,
            api_key,
            model: model.into(),
            base_url,
            provider_name,
        }
    }

    /// Create a provider for OpenAI.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(Some(api_key.into()), model, OPENAI_BASE_URL, None)
    }

    /// Create a provider for Ollama (no API key needed).
    pub fn ollama(model: impl Into<String>) -> Self {
        Self::new(None, model, OLLAMA_BASE_URL, None)
    }

    /// Detect provider name from base URL.
    fn detect_provider_name(base_url: &str) -> String {
        if base_url.contains("openai.com") {
            "OpenAI".to_string()
        } else if base_url.contains("localhost:11434") || base_url.contains("ollama") {
            "Ollama".to_string()
        } else if base_url.contains("together") {
            "Together".to_string()
        } else if base_url.contains("groq") {
            "Groq".to_string()
        } else {
            "OpenAI-Compatible".to_string()
        }
    }

    /// Build the request body for the Chat Completions API.
    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);

        if let Some(ref system) = request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        messages.extend(request.messages.iter().map(ChatMessage::from));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(ChatTool::from).collect())
        };

        ChatRequest {
            model: self.model.clone(),
            messages,
            tools,
            max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            temperature: request.temperature,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Classify an error response from the API.
    fn handle_error_response(&self, status_code: u16, body: &str) -> ProviderError {
        let parsed = serde_json::from_str::<ApiError>(body).ok();
        let message = parsed
            .as_ref()
            .map(|e| e.error.message.clone())
            .unwrap_or_else(|| body.to_string());
        let error_type = parsed.and_then(|e| e.error.error_type);

        match (status_code, error_type.as_deref()) {
            (401, _) | (_, Some("authentication_error")) | (_, Some("invalid_api_key")) => {
                ProviderError::AuthError(message)
            }
            (429, _) | (_, Some("rate_limit_error")) | (_, Some("rate_limit_exceeded")) => {
                ProviderError::RateLimited(message)
            }
            (_, Some("model_not_found")) => ProviderError::ModelNotFound(message),
            (_, Some("context_length_exceeded")) => {
                ProviderError::ContextWindowExceeded { used: 0, limit: 0 }
            }
            _ => ProviderError::api(message, status_code),
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn stream_chat(
        &self,
        request: &CompletionRequest,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = self.build_request(request);
        let start = Instant::now();

        #[cfg(feature = "telemetry")]
        debug!(model = %self.model, messages = request.messages.len(), "Sending streaming chat request");

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.header("authorization", format!("Bearer {}", api_key));
        }

        let mut response = req.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(start.elapsed().as_millis() as u64)
            } else {
                ProviderError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.handle_error_response(status.as_u16(), &error_text));
        }

        let mut decoder = SseDecoder::default();
        let mut state = StreamState::default();

        'body: while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| ProviderError::StreamError(e.to_string()))?
        {
            for data in decoder.push(&bytes) {
                if data == "[DONE]" {
                    break 'body;
                }
                match serde_json::from_str::<ChatStreamChunk>(&data) {
                    Ok(chunk) => state.process_chunk(&chunk, &events),
                    Err(e) => {
                        #[cfg(feature = "telemetry")]
                        debug!(error = %e, "Skipping undecodable stream chunk");
                        let _ = e;
                    }
                }
            }
        }

        let usage = state.finish(&events);

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation("provider.stream", start.elapsed());
            GLOBAL_METRICS.record_tokens(usage.input_tokens as u64, usage.output_tokens as u64);
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = usage;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// SSE Decoding
// ============================================================================

/// Splits a byte stream into SSE `data:` payloads.
///
/// Frames may be cut anywhere by the transport, so incomplete lines are held
/// until the next chunk arrives.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }

        payloads
    }
}

// ============================================================================
// Stream State
// ============================================================================

/// Translates Chat Completions deltas into [`StreamEvent`]s.
#[derive(Debug, Default)]
struct StreamState {
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
    open_tool: bool,
}

impl StreamState {
    fn process_chunk(&mut self, chunk: &ChatStreamChunk, events: &mpsc::UnboundedSender<StreamEvent>) {
        if let Some(usage) = &chunk.usage {
            self.usage = TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        for choice in &chunk.choices {
            if let Some(ref finish_reason) = choice.finish_reason {
                self.stop_reason = Some(match finish_reason.as_str() {
                    "tool_calls" => StopReason::ToolUse,
                    "length" => StopReason::MaxTokens,
                    _ => StopReason::EndTurn,
                });
            }

            if let Some(ref content) = choice.delta.content {
                if !content.is_empty() {
                    let _ = events.send(StreamEvent::TextDelta(content.clone()));
                }
            }

            for tc in choice.delta.tool_calls.iter().flatten() {
                if let Some(ref id) = tc.id {
                    self.close_tool(events);
                    let name = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    let _ = events.send(StreamEvent::ToolUseStart {
                        id: id.clone(),
                        name,
                    });
                    self.open_tool = true;
                }

                if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
                    if self.open_tool && !args.is_empty() {
                        let _ = events.send(StreamEvent::ToolInputDelta(args.clone()));
                    }
                }
            }
        }
    }

    fn close_tool(&mut self, events: &mpsc::UnboundedSender<StreamEvent>) {
        if self.open_tool {
            let _ = events.send(StreamEvent::ToolUseEnd);
            self.open_tool = false;
        }
    }

    /// Close any open tool call and emit the trailing usage and stop events.
    fn finish(mut self, events: &mpsc::UnboundedSender<StreamEvent>) -> TokenUsage {
        self.close_tool(events);
        let _ = events.send(StreamEvent::Usage(self.usage.clone()));
        let _ = events.send(StreamEvent::Done(
            self.stop_reason.unwrap_or(StopReason::EndTurn),
        ));
        self.usage
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    call_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<ChatFunction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatToolFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// ============================================================================
// Type Conversions
// ============================================================================

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        };

        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|call| ChatToolCall {
                        id: Some(call.id.clone()),
                        call_type: Some("function".to_string()),
                        function: Some(ChatFunction {
                            name: Some(call.name.clone()),
                            arguments: Some(call.input.to_string()),
                        }),
                    })
                    .collect(),
            )
        };

        // Assistant turns that only carry a tool call are sent with null content
        let content = if msg.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(msg.content.clone())
        };

        Self {
            role: role.to_string(),
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

impl From<&ToolDefinition> for ChatTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ChatToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: serde_json::to_value(&tool.input_schema).unwrap_or_default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCall, ToolResult};

    fn drain(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_provider_creation() {
        let provider = OpenAIProvider::openai("test-key", "gpt-4o");
        assert_eq!(provider.name(), "OpenAI");
        assert_eq!(provider.model(), "gpt-4o");

        let provider = OpenAIProvider::ollama("llama3.2");
        assert_eq!(provider.name(), "Ollama");
    }

    #[test]
    fn test_provider_name_detection() {
        assert_eq!(OpenAIProvider::detect_provider_name("https://api.openai.com/v1"), "OpenAI");
        assert_eq!(OpenAIProvider::detect_provider_name("http://localhost:11434/v1"), "Ollama");
        assert_eq!(
            OpenAIProvider::detect_provider_name("https://custom.example.com"),
            "OpenAI-Compatible"
        );
    }

    #[test]
    fn test_sse_decoder_handles_split_frames() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let payloads = decoder.push(b"1}\r\n\r\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_stream_state_emits_tool_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = StreamState::default();

        let frames = [
            r#"{"choices":[{"delta":{"content":"Writing files"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"terminal","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
        ];
        for frame in frames {
            let chunk: ChatStreamChunk = serde_json::from_str(frame).unwrap();
            state.process_chunk(&chunk, &tx);
        }
        let usage = state.finish(&tx);
        assert_eq!(usage.total(), 19);

        let events = drain(rx);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Writing files".to_string()),
                StreamEvent::ToolUseStart {
                    id: "call_1".to_string(),
                    name: "terminal".to_string()
                },
                StreamEvent::ToolInputDelta("{\"command\":".to_string()),
                StreamEvent::ToolInputDelta("\"ls\"}".to_string()),
                StreamEvent::ToolUseEnd,
                StreamEvent::Usage(TokenUsage {
                    input_tokens: 12,
                    output_tokens: 7
                }),
                StreamEvent::Done(StopReason::ToolUse),
            ]
        );
    }

    #[test]
    fn test_message_conversion() {
        let call = ToolCall {
            id: "call_1".to_string(),
            name: "readFiles".to_string(),
            input: serde_json::json!({"files": ["a.txt"]}),
        };
        let assistant: ChatMessage = (&Message::assistant_tool_call("", call)).into();
        assert_eq!(assistant.role, "assistant");
        assert!(assistant.content.is_none());
        assert_eq!(assistant.tool_calls.as_ref().map(Vec::len), Some(1));

        let tool: ChatMessage = (&Message::tool(&ToolResult::success("call_1", "hi"))).into();
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_build_request_includes_profile_settings() {
        let provider = OpenAIProvider::openai("k", "gpt-4o");
        let request = CompletionRequest {
            messages: vec![Message::user("build a todo list")],
            tools: vec![ToolDefinition::new("terminal", "Run a command")],
            system_prompt: Some("You are a coding agent".to_string()),
            temperature: Some(0.1),
            max_tokens: None,
        };
        let body = serde_json::to_value(provider.build_request(&request)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "build a todo list");
        assert_eq!(body["tools"][0]["function"]["name"], "terminal");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_error_classification() {
        let provider = OpenAIProvider::openai("k", "gpt-4o");
        let err = provider.handle_error_response(401, "unauthorized");
        assert!(matches!(err, ProviderError::AuthError(_)));

        let err = provider.handle_error_response(
            400,
            r#"{"error":{"message":"too long","type":"context_length_exceeded"}}"#,
        );
        assert!(matches!(err, ProviderError::ContextWindowExceeded { .. }));

        let err = provider.handle_error_response(429, "slow down");
        assert!(err.is_rate_limited());

        let err = provider.handle_error_response(503, "overloaded");
        assert!(err.is_retryable());
    }
}
