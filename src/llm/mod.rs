//! Language Model Boundary
//!
//! The agent talks to the model only through [`LanguageModel`]: a message
//! history plus declared tools go in, a [`ModelReply`] comes out, and answer
//! text is streamed token by token into a [`TokenSink`] as it arrives.
//!
//! [`openai::OpenAiClient`] implements the trait for OpenAI and Azure OpenAI
//! chat-completions endpoints. Tests substitute scripted models.

pub mod openai;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use openai::{OpenAiClient, Provider};

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// For `Role::Tool` messages, the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new(), tool_call_id: None }
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

    /// Assistant message that requests tool calls
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { tool_calls, ..Self::new(Role::Assistant, content) }
    }

    /// Result of one tool call
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: Some(tool_call_id.into()), ..Self::new(Role::Tool, content) }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments; a `String` value holds arguments that were not valid JSON
    pub arguments: serde_json::Value,
}

/// A tool declared to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: serde_json::Value,
}

/// Complete reply to one model request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    /// Plain text answer with no tool calls
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), tool_calls: Vec::new() }
    }

    /// Reply that only requests tools
    #[must_use]
    pub fn tools(tool_calls: Vec<ToolCall>) -> Self {
        Self { content: String::new(), tool_calls }
    }
}

/// Receives answer text as it streams in
pub trait TokenSink: Send {
    fn token(&mut self, text: &str);
}

/// Collects streamed text into a string
impl TokenSink for String {
    fn token(&mut self, text: &str) {
        self.push_str(text);
    }
}

/// Discards streamed text
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn token(&mut self, _text: &str) {}
}

/// A chat model that supports tool calling
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Request the next assistant message
    ///
    /// Text content is passed to `sink` as it arrives; the returned reply
    /// repeats it in full together with any tool calls.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        sink: &mut dyn TokenSink,
    ) -> Result<ModelReply>;

    /// Model or deployment name, for logs
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::tool_result("call_1", "Tables in 'main':\n- Customers");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));

        let call = ToolCall {
            id: "call_1".to_string(),
            name: "list_databases".to_string(),
            arguments: serde_json::json!({}),
        };
        let msg = ChatMessage::assistant_with_tools("", vec![call]);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(ChatMessage::user("How many customers?")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "How many customers?"}));
    }

    #[test]
    fn test_string_sink_collects_tokens() {
        let mut sink = String::new();
        sink.token("There are ");
        sink.token("3 customers.");
        assert_eq!(sink, "There are 3 customers.");
    }
}
