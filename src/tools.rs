//! Tool Catalog
//!
//! The five tools declared to the language model, as an explicit dispatch
//! table: every tool is a [`ToolRequest`] variant carrying its typed
//! arguments, and [`dispatch`] routes each variant to the Schema Provider or
//! the Query Executor.
//!
//! Tool results are plain text observations for the model. Listings are
//! rendered as bullet lists, query results as a JSON array of row objects.
//! Recoverable failures (a rejected query, a database-reported error) are
//! observations too, so the model can correct itself. Only an unreachable
//! database ends the turn.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::{ColumnInfo, DatabaseEngine, QueryResult};
use crate::error::{AskError, Result};
use crate::llm::ToolDefinition;
use crate::validator::{validate, Verdict};

pub const LIST_DATABASES: &str = "list_databases";
pub const LIST_SCHEMAS: &str = "list_schemas";
pub const LIST_TABLES: &str = "list_tables";
pub const LIST_COLUMNS: &str = "list_columns";
pub const EXECUTE_QUERY: &str = "execute_query";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ListSchemasArgs {
    #[schemars(description = "Database name, as returned by list_databases")]
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ListTablesArgs {
    #[schemars(description = "Database name")]
    pub database: String,
    #[schemars(description = "Schema name, as returned by list_schemas")]
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ListColumnsArgs {
    #[schemars(description = "Database name")]
    pub database: String,
    #[schemars(description = "Schema name")]
    pub schema: String,
    #[schemars(description = "Table name, as returned by list_tables")]
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ExecuteQueryArgs {
    #[schemars(description = "A single read-only SELECT statement")]
    pub sql: String,
}

/// A tool invocation requested by the model, with parsed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    ListDatabases,
    ListSchemas(ListSchemasArgs),
    ListTables(ListTablesArgs),
    ListColumns(ListColumnsArgs),
    ExecuteQuery(ExecuteQueryArgs),
}

impl ToolRequest {
    /// Parse a tool call by name
    ///
    /// `arguments` may be a JSON object or a string containing one, which is
    /// how OpenAI-compatible APIs deliver them.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self> {
        let arguments = match arguments {
            Value::String(raw) if raw.trim().is_empty() => Value::Object(serde_json::Map::new()),
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                AskError::invalid_input(format!("Arguments for '{name}' are not valid JSON: {e}"))
            })?,
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };

        match name {
            LIST_DATABASES => Ok(Self::ListDatabases),
            LIST_SCHEMAS => Ok(Self::ListSchemas(parse_args(name, arguments)?)),
            LIST_TABLES => Ok(Self::ListTables(parse_args(name, arguments)?)),
            LIST_COLUMNS => Ok(Self::ListColumns(parse_args(name, arguments)?)),
            EXECUTE_QUERY => Ok(Self::ExecuteQuery(parse_args(name, arguments)?)),
            unknown => Err(AskError::invalid_input(format!("Unknown tool '{unknown}'"))),
        }
    }

    /// Declared tool name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ListDatabases => LIST_DATABASES,
            Self::ListSchemas(_) => LIST_SCHEMAS,
            Self::ListTables(_) => LIST_TABLES,
            Self::ListColumns(_) => LIST_COLUMNS,
            Self::ExecuteQuery(_) => EXECUTE_QUERY,
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(name: &str, arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| AskError::invalid_input(format!("Invalid arguments for '{name}': {e}")))
}

/// Declarations sent to the model with every request
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: LIST_DATABASES.to_string(),
            description: "List the databases available on the connected server.".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: LIST_SCHEMAS.to_string(),
            description: "List the schemas in a database.".to_string(),
            parameters: schema_of::<ListSchemasArgs>(),
        },
        ToolDefinition {
            name: LIST_TABLES.to_string(),
            description: "List the tables in a schema.".to_string(),
            parameters: schema_of::<ListTablesArgs>(),
        },
        ToolDefinition {
            name: LIST_COLUMNS.to_string(),
            description: "List the columns of a table with their data types.".to_string(),
            parameters: schema_of::<ListColumnsArgs>(),
        },
        ToolDefinition {
            name: EXECUTE_QUERY.to_string(),
            description: "Run a single read-only SELECT statement and return the rows as JSON. \
                          Any other kind of statement is rejected."
                .to_string(),
            parameters: schema_of::<ExecuteQueryArgs>(),
        },
    ]
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .map(|schema| clean_schema(&schema))
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

/// Drop the schema keys chat-completion endpoints do not expect
fn clean_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .filter(|(key, _)| !matches!(key.as_str(), "$schema" | "title" | "additionalProperties"))
                .map(|(key, value)| (key.clone(), clean_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema).collect()),
        other => other.clone(),
    }
}

/// Strip a Markdown code fence the model may have wrapped around its SQL
#[must_use]
pub fn clean_sql(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(fenced) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    // Skip an info string such as `sql`
    let body = fenced.split_once('\n').map_or(fenced, |(_, rest)| rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// Result of running one tool
#[derive(Debug)]
pub enum ToolOutcome {
    /// Successful listing or query result
    Output(String),
    /// The validator refused the query
    Rejected(String),
    /// The tool ran and failed (database-reported error, bad arguments)
    Failed(AskError),
}

impl ToolOutcome {
    /// Text returned to the model as the tool result
    #[must_use]
    pub fn observation(&self) -> String {
        match self {
            Self::Output(text) => text.clone(),
            Self::Rejected(reason) => format!(
                "Error: query rejected: {reason}. Only a single read-only SELECT statement is allowed."
            ),
            Self::Failed(err) => format!("Error: {}", err.message()),
        }
    }

    /// Whether this outcome counts towards the per-turn execution failure limit
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        matches!(self, Self::Failed(AskError::ExecutionFailed(_)))
    }
}

/// Run one tool against the database
///
/// Returns `Err` only for failures that end the turn (see
/// [`AskError::is_fatal_for_turn`]); everything else becomes a [`ToolOutcome`].
pub async fn dispatch<E: DatabaseEngine>(engine: &E, request: &ToolRequest) -> Result<ToolOutcome> {
    let outcome = match request {
        ToolRequest::ListDatabases => engine.list_databases().await.map(|names| {
            render_list("Databases on the server:", "No databases found.", &names)
        }),
        ToolRequest::ListSchemas(args) => engine.list_schemas(&args.database).await.map(|names| {
            render_list(
                &format!("Schemas in '{}':", args.database),
                &format!("No schemas found in database '{}'.", args.database),
                &names,
            )
        }),
        ToolRequest::ListTables(args) => {
            engine.list_tables(&args.database, &args.schema).await.map(|names| {
                render_list(
                    &format!("Tables in '{}':", args.schema),
                    &format!("No tables found in schema '{}'.", args.schema),
                    &names,
                )
            })
        }
        ToolRequest::ListColumns(args) => engine
            .list_columns(&args.database, &args.schema, &args.table)
            .await
            .map(|columns| render_columns(&args.schema, &args.table, &columns)),
        ToolRequest::ExecuteQuery(args) => {
            let sql = clean_sql(&args.sql);
            if let Verdict::Rejected(reason) = validate(&sql) {
                tracing::warn!(%reason, "model proposed a rejected query");
                return Ok(ToolOutcome::Rejected(reason));
            }
            tracing::info!(sql = %sql, "executing query");
            engine.execute(&sql).await.map(|result| render_result(&result))
        }
    };

    match outcome {
        Ok(text) => Ok(ToolOutcome::Output(text)),
        Err(err) if err.is_fatal_for_turn() => Err(err),
        Err(AskError::ValidationRejected(reason)) => Ok(ToolOutcome::Rejected(reason)),
        Err(err) => {
            tracing::debug!(tool = request.name(), error = %err, "tool failed");
            Ok(ToolOutcome::Failed(err))
        }
    }
}

fn render_list(heading: &str, empty: &str, names: &[String]) -> String {
    if names.is_empty() {
        return empty.to_string();
    }

    let mut out = heading.to_string();
    for name in names {
        out.push_str("\n- ");
        out.push_str(name);
    }
    out
}

fn render_columns(schema: &str, table: &str, columns: &[ColumnInfo]) -> String {
    if columns.is_empty() {
        return format!("No columns found in '{schema}.{table}'.");
    }

    let mut out = format!("Columns in '{schema}.{table}':");
    for column in columns {
        let nullable = if column.nullable { ", nullable" } else { "" };
        out.push_str(&format!("\n- {} ({}{nullable})", column.name, column.data_type));
    }
    out
}

fn render_result(result: &QueryResult) -> String {
    let records: Vec<Value> = result.records().into_iter().map(Value::Object).collect();
    let body = serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string());

    if result.truncated {
        format!("{body}\n(Only the first {} rows are shown.)", result.row_count())
    } else {
        body
    }
}
