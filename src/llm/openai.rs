//! OpenAI-compatible chat-completions client
//!
//! Serves both hosted OpenAI (`{endpoint}/chat/completions`, bearer token)
//! and Azure OpenAI deployments
//! (`{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=...`,
//! `api-key` header). Requests always stream; see [`super::stream`].

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::stream::{parse_sse_line, LineBuffer, SseEvent, StreamAccumulator};
use super::{ChatMessage, LanguageModel, ModelReply, Role, TokenSink, ToolDefinition};
use crate::error::{AskError, Result};

/// Which flavor of the chat-completions API to call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Azure,
}

impl std::str::FromStr for Provider {
    type Err = AskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" | "azure-openai" => Ok(Self::Azure),
            other => Err(AskError::invalid_input(format!(
                "Unknown model provider '{other}' (expected openai or azure)"
            ))),
        }
    }
}

#[derive(Clone)]
enum Auth {
    Bearer(String),
    ApiKey(String),
}

/// Streaming chat-completions client
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    auth: Auth,
    model: String,
    temperature: f32,
}

impl std::fmt::Debug for OpenAiClient {
    // Hand-written so the key never reaches a log line
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    /// Client for OpenAI (or any server exposing the same API)
    pub fn openai(endpoint: &str, api_key: String, model: String) -> Result<Self> {
        let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));
        Self::build(url, Auth::Bearer(api_key), model)
    }

    /// Client for an Azure OpenAI deployment
    pub fn azure(
        endpoint: &str,
        api_key: String,
        deployment: String,
        api_version: &str,
    ) -> Result<Self> {
        let url = format!(
            "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
            endpoint.trim_end_matches('/')
        );
        Self::build(url, Auth::ApiKey(api_key), deployment)
    }

    fn build(url: String, auth: Auth, model: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AskError::config_error(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { http, url, auth, model, temperature: 0.0 })
    }

    /// Sampling temperature (default 0, the most deterministic setting)
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Request URL (without credentials)
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
            "temperature": self.temperature,
        });

        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

/// Chat-completions wire form of one message
fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = json!({ "role": role, "content": message.content });

    if !message.tool_calls.is_empty() {
        if message.content.is_empty() {
            wire["content"] = Value::Null;
        }
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    // The API expects arguments as a JSON-encoded string
                    let arguments = match &call.arguments {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    };
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": arguments },
                    })
                })
                .collect(),
        );
    }

    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }

    wire
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        sink: &mut dyn TokenSink,
    ) -> Result<ModelReply> {
        let body = self.request_body(messages, tools);
        tracing::debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let request = self.http.post(&self.url).json(&body);
        let request = match &self.auth {
            Auth::Bearer(key) => request.bearer_auth(key),
            Auth::ApiKey(key) => request.header("api-key", key),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AskError::model_unavailable(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let detail: String = text.chars().take(300).collect();
            return Err(AskError::model_unavailable(format!("HTTP {status}: {detail}")));
        }

        let mut accumulator = StreamAccumulator::new();
        let mut lines = LineBuffer::new();
        let mut bytes_stream = response.bytes_stream();

        'stream: while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = chunk_result
                .map_err(|e| AskError::model_unavailable(format!("Stream interrupted: {e}")))?;

            for line in lines.push(&chunk) {
                match parse_sse_line(&line)? {
                    Some(SseEvent::Chunk(chunk)) => accumulator.push(chunk, sink),
                    Some(SseEvent::Done) => {
                        accumulator.mark_done();
                        break 'stream;
                    }
                    None => {}
                }
            }
        }

        if !accumulator.is_done() {
            if let Some(rest) = lines.finish() {
                if let Some(SseEvent::Chunk(chunk)) = parse_sse_line(&rest)? {
                    accumulator.push(chunk, sink);
                }
            }
            tracing::warn!(model = %self.model, "stream ended without a completion marker");
        }

        let reply = accumulator.finish();
        tracing::debug!(
            content_len = reply.content.len(),
            tool_calls = reply.tool_calls.len(),
            "chat reply received"
        );

        Ok(reply)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
