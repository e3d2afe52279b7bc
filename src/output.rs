//! JSON Output Envelope Types
//!
//! The non-interactive commands (`validate`, `query`, `schema --json`) print
//! exactly one JSON document to stdout, wrapped in a success or error envelope.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`

use serde::{Deserialize, Serialize};

use crate::engine::QueryResult;
use crate::error::AskError;

/// Success envelope, generic over the command's payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database engine (postgres, mysql, sqlite); empty when none was involved
    pub engine: String,

    /// Command that produced this output (validate, query, schema)
    pub command: String,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

impl SuccessEnvelope<QueryResult> {
    /// Envelope for an executed query; row count and timing come from the result
    #[must_use]
    pub fn query(engine: impl Into<String>, result: QueryResult) -> Self {
        let meta = Metadata::with_rows(result.execution_ms, result.row_count());
        Self::new(engine, "query", result, meta)
    }
}

/// Error envelope for failed commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub engine: String,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Envelope carrying an `AskError`'s stable code and full message
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &AskError) -> Self {
        Self::new(engine, command, ErrorInfo::new(err.error_code(), err.message()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. "VALIDATION_REJECTED", "UPSTREAM_UNAVAILABLE")
    pub code: String,

    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in success envelopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub execution_ms: u64,

    /// Only present for query results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}

/// Serialize an envelope to a single JSON line
pub fn to_json_line<T: Serialize>(envelope: &T) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        format!(
            r#"{{"ok":false,"engine":"","command":"","error":{{"code":"INVALID_INPUT","message":"Could not serialize output: {e}"}}}}"#
        )
    })
}
