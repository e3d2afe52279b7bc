//! Server-Sent Events decoding for streamed chat completions
//!
//! A streamed completion arrives as `data: {json}` lines ending with
//! `data: [DONE]`. Text deltas are forwarded to the token sink immediately.
//! Tool calls arrive in fragments keyed by `index` (id and name first, then
//! the arguments string piece by piece) and are assembled at the end.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::{ModelReply, TokenSink, ToolCall};
use crate::error::{AskError, Result};

// ============================================================================
// Wire types (OpenAI chat.completion.chunk)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// ============================================================================
// Line splitting
// ============================================================================

/// Splits a byte stream into lines, holding back an incomplete trailing line
///
/// Bytes are buffered rather than decoded per chunk so a UTF-8 sequence cut
/// by a chunk boundary survives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline_pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline_pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

/// One meaningful SSE line
#[derive(Debug, Clone)]
pub enum SseEvent {
    Chunk(ChatChunk),
    Done,
}

/// Parse one SSE line; comments, blank lines and non-data fields yield `None`
pub fn parse_sse_line(line: &str) -> Result<Option<SseEvent>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };

    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    serde_json::from_str(data)
        .map(|chunk| Some(SseEvent::Chunk(chunk)))
        .map_err(|e| AskError::model_unavailable(format!("Malformed stream chunk: {e}")))
}

// ============================================================================
// Accumulator
// ============================================================================

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Builds a [`ModelReply`] out of streamed chunks
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk in, streaming its text to `sink`
    pub fn push(&mut self, chunk: ChatChunk, sink: &mut dyn TokenSink) {
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                sink.token(&content);
                self.content.push_str(&content);
            }

            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                let call = self.calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }

            if choice.finish_reason.is_some() {
                self.done = true;
            }
        }
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Assemble the reply; tool calls keep their stream index order
    #[must_use]
    pub fn finish(self) -> ModelReply {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| {
                let arguments = if call.arguments.trim().is_empty() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    // Unparseable arguments are kept as text so the tool layer can report them
                    serde_json::from_str(&call.arguments)
                        .unwrap_or(serde_json::Value::String(call.arguments))
                };
                ToolCall {
                    id: if call.id.is_empty() { format!("call_{index}") } else { call.id },
                    name: call.name,
                    arguments,
                }
            })
            .collect();

        ModelReply { content: self.content, tool_calls }
    }
}
