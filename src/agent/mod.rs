//! Agent Orchestrator
//!
//! Turns one natural-language question into a bounded tool-calling loop:
//!
//! ```text
//! AwaitingUserInput --question--> Planning --tool calls--> ToolCall --results--> Planning
//!                                    |
//!                                    +--text answer--> Responding --> AwaitingUserInput
//! ```
//!
//! Every tool call counts one hop. A turn that would need more than
//! `max_hops` hops, or that collects `max_query_failures` database errors,
//! ends with a graceful "could not complete" answer instead of looping.
//!
//! Turns are sequential by construction: [`Agent::ask`] takes `&mut self`
//! and resolves the whole turn before returning.

mod conversation;
mod prompt;

pub use conversation::Conversation;
pub use prompt::system_prompt;

use std::time::Duration;

use crate::engine::DatabaseEngine;
use crate::error::{AskError, Result};
use crate::llm::{ChatMessage, LanguageModel, ModelReply, TokenSink, ToolDefinition};
use crate::tools::{dispatch, tool_definitions, ToolOutcome, ToolRequest};

/// Limits applied to each turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    /// Maximum tool calls per turn
    pub max_hops: usize,
    /// Database errors tolerated per turn before giving up
    pub max_query_failures: usize,
    /// How long one model request may take, stream included
    pub model_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_hops: 8, max_query_failures: 3, model_timeout: Duration::from_secs(120) }
    }
}

/// Where the agent is within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingUserInput,
    Planning,
    ToolCall,
    Responding,
}

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model answered; the text was streamed to the sink
    Answered(String),
    /// The turn hit a limit; the error says which
    GaveUp(AskError),
}

impl TurnOutcome {
    /// Text to show the user
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Answered(text) => text.clone(),
            Self::GaveUp(err) => err.user_message(),
        }
    }
}

/// Natural-language question answering over one database
pub struct Agent<E, M> {
    engine: E,
    model: M,
    tools: Vec<ToolDefinition>,
    conversation: Conversation,
    settings: AgentSettings,
    state: TurnState,
}

impl<E: DatabaseEngine, M: LanguageModel> Agent<E, M> {
    pub fn new(engine: E, model: M, system_prompt: String, settings: AgentSettings) -> Self {
        Self {
            engine,
            model,
            tools: tool_definitions(),
            conversation: Conversation::new(system_prompt),
            settings,
            state: TurnState::AwaitingUserInput,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Forget all previous turns
    pub fn reset(&mut self) {
        self.conversation.clear();
        tracing::info!("conversation cleared");
    }

    /// Answer one question
    ///
    /// Answer text is streamed to `sink`. `Err` means the model or the
    /// database could not be reached; the conversation is then left exactly
    /// as it was before the question, and the next turn can proceed.
    pub async fn ask(&mut self, question: &str, sink: &mut dyn TokenSink) -> Result<TurnOutcome> {
        let checkpoint = self.conversation.len();
        self.conversation.push(ChatMessage::user(question));
        tracing::info!(turn = self.conversation.user_turns(), "question received");

        let result = self.run_turn(sink).await;
        self.state = TurnState::AwaitingUserInput;

        match result {
            Ok(TurnOutcome::GaveUp(err)) => {
                // Keep the question and the apology, not the failed tool exchange
                self.conversation.truncate(checkpoint);
                self.conversation.push(ChatMessage::user(question));
                self.conversation.push(ChatMessage::assistant(err.user_message()));
                Ok(TurnOutcome::GaveUp(err))
            }
            Ok(answered) => Ok(answered),
            Err(err) => {
                tracing::warn!(error = %err, "turn failed");
                self.conversation.truncate(checkpoint);
                Err(err)
            }
        }
    }

    async fn run_turn(&mut self, sink: &mut dyn TokenSink) -> Result<TurnOutcome> {
        let mut hops = 0;
        let mut failures = 0;

        loop {
            self.state = TurnState::Planning;
            let reply = self.request_reply(sink).await?;

            if reply.tool_calls.is_empty() {
                self.state = TurnState::Responding;
                tracing::info!(hops, "answered");
                self.conversation.push(ChatMessage::assistant(reply.content.clone()));
                return Ok(TurnOutcome::Answered(reply.content));
            }

            self.state = TurnState::ToolCall;
            self.conversation
                .push(ChatMessage::assistant_with_tools(reply.content, reply.tool_calls.clone()));

            for call in &reply.tool_calls {
                if hops >= self.settings.max_hops {
                    tracing::warn!(max_hops = self.settings.max_hops, "tool loop limit reached");
                    return Ok(TurnOutcome::GaveUp(AskError::ToolLoopExceeded {
                        hops: self.settings.max_hops,
                    }));
                }
                hops += 1;
                tracing::info!(hop = hops, tool = %call.name, "tool call");

                let outcome = match ToolRequest::parse(&call.name, &call.arguments) {
                    Ok(request) => dispatch(&self.engine, &request).await?,
                    Err(err) => ToolOutcome::Failed(err),
                };

                if let ToolOutcome::Failed(err) = &outcome {
                    if outcome.is_execution_failure() {
                        failures += 1;
                        if failures >= self.settings.max_query_failures {
                            tracing::warn!(failures, "giving up after repeated query failures");
                            return Ok(TurnOutcome::GaveUp(AskError::execution_failed(
                                err.message(),
                            )));
                        }
                    }
                }

                self.conversation.push(ChatMessage::tool_result(&call.id, outcome.observation()));
            }
        }
    }

    async fn request_reply(&self, sink: &mut dyn TokenSink) -> Result<ModelReply> {
        let request = self.model.complete(self.conversation.messages(), &self.tools, sink);

        tokio::time::timeout(self.settings.model_timeout, request).await.map_err(|_| {
            AskError::model_unavailable(format!(
                "{} did not respond within {}s",
                self.model.model_name(),
                self.settings.model_timeout.as_secs()
            ))
        })?
    }
}
