//! askdb - Plain-Language Questions over SQL Databases
//!
//! askdb answers natural-language questions about a relational database by
//! letting a language model explore the schema and run queries through a
//! fixed set of tools. Every query the model proposes passes a read-only
//! gate before it reaches the database, and runs inside a read-only
//! connection or transaction with a row cap and a timeout.
//!
//! # Module Organization
//! - [`validator`] - read-only SQL gate
//! - [`engine`] - `DatabaseEngine` trait: schema listings and query execution
//! - [`schema`] - whole-schema snapshots for prompt grounding
//! - [`tools`] - tool catalog declared to the model, and its dispatch
//! - [`llm`] - `LanguageModel` trait and the OpenAI / Azure OpenAI client
//! - [`agent`] - the per-turn tool-calling loop and conversation history
//! - [`repl`] - interactive session
//! - [`config`] - settings files and resolution
//! - [`output`] - JSON envelopes for the non-interactive commands
//! - [`error`] - error types

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod output;
pub mod repl;
pub mod schema;
pub mod tools;
pub mod validator;

pub use agent::{Agent, AgentSettings, TurnOutcome, TurnState};
pub use engine::{
    AnyEngine, ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType,
    QueryLimits, QueryResult,
};
pub use error::{AskError, Result, Upstream};
pub use llm::{ChatMessage, LanguageModel, ModelReply, OpenAiClient, Provider, TokenSink, ToolCall};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use schema::SchemaSnapshot;
pub use validator::{validate, Verdict};
