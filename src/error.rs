//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout askdb.
//! All errors are structured and map to stable error codes for JSON output.
//!
//! # Error Categories
//! - `ValidationRejected`: candidate SQL violates the read-only allow-list
//! - `ExecutionFailed`: database-reported query error (syntax, timeout)
//! - `ToolLoopExceeded`: a turn used up its tool-call hop budget
//! - `UpstreamUnavailable`: the language model or the database is unreachable
//! - `InvalidInput`: malformed input or missing required parameters
//! - `EngineError`: catalog (schema listing) failures
//! - `ConfigError`: configuration file or settings resolution errors
//!
//! Two renderings exist for every error. [`AskError::message`] keeps the full
//! detail (logs, tool observations fed back to the model), while
//! [`AskError::user_message`] is what a person at the REPL sees and never
//! contains driver error text.

use std::fmt;

use thiserror::Error;

/// The external collaborator that could not be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// The language model endpoint
    Model,
    /// The database server
    Database,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "Language model"),
            Self::Database => write!(f, "Database"),
        }
    }
}

/// Main error type for askdb operations
#[derive(Error, Debug)]
pub enum AskError {
    /// Candidate SQL rejected by the validator
    #[error("Query rejected: {0}")]
    ValidationRejected(String),

    /// Query execution failed on the database side
    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),

    /// The tool-calling loop hit its hop bound
    #[error("Tool loop exceeded {hops} hops without an answer")]
    ToolLoopExceeded { hops: usize },

    /// Model or database unreachable (or timed out)
    #[error("{upstream} unavailable: {detail}")]
    UpstreamUnavailable { upstream: Upstream, detail: String },

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific catalog error
    #[error("Engine error ({engine}): {detail}")]
    EngineError { engine: String, detail: String },

    /// Configuration error (file not found, invalid JSON, missing setting)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AskError {
    /// Convert error to error code string for JSON output
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationRejected(_) => "VALIDATION_REJECTED",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::ToolLoopExceeded { .. } => "TOOL_LOOP_EXCEEDED",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::EngineError { .. } => "ENGINE_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Full error message, including database-reported detail
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Message safe to show to the end user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::ValidationRejected(reason) => format!("That query is not allowed: {reason}."),
            Self::ExecutionFailed(_) => "I couldn't retrieve that information.".to_string(),
            Self::ToolLoopExceeded { hops } => format!(
                "I could not complete that request within {hops} steps. Try rephrasing the question."
            ),
            Self::UpstreamUnavailable { upstream, .. } => {
                format!("{upstream} is unavailable right now. Please try again.")
            }
            Self::EngineError { .. } => "I couldn't read the database structure.".to_string(),
            Self::InvalidInput(_) | Self::ConfigError(_) => self.to_string(),
        }
    }

    /// Whether the error ends the current turn instead of being fed back to the model
    #[must_use]
    pub const fn is_fatal_for_turn(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. } | Self::ConfigError(_))
    }

    /// Create a validation rejection error
    pub fn validation_rejected(reason: impl Into<String>) -> Self {
        Self::ValidationRejected(reason.into())
    }

    /// Create an execution failure error
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }

    /// Create a model-unreachable error
    pub fn model_unavailable(detail: impl Into<String>) -> Self {
        Self::UpstreamUnavailable { upstream: Upstream::Model, detail: detail.into() }
    }

    /// Create a database-unreachable error
    pub fn database_unavailable(detail: impl Into<String>) -> Self {
        Self::UpstreamUnavailable { upstream: Upstream::Database, detail: detail.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::EngineError { engine: engine.into(), detail: detail.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for askdb operations
pub type Result<T> = std::result::Result<T, AskError>;
