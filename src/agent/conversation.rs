//! Conversation history
//!
//! The first message is always the system prompt. Everything after it is
//! the session's turns, including tool requests and tool results, so
//! follow-up questions can refer back to earlier answers.

use crate::llm::{ChatMessage, Role};

#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self { messages: vec![ChatMessage::system(system_prompt)] }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when only the system prompt is present
    pub fn is_empty(&self) -> bool {
        self.messages.len() <= 1
    }

    /// Drop everything after the first `len` messages; the system prompt always stays
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len.max(1));
    }

    /// Forget all turns
    pub fn clear(&mut self) {
        self.truncate(1);
    }

    /// Number of questions asked so far
    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }
}
