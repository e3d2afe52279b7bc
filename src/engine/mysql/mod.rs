//! MySQL Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for MySQL databases (including MariaDB).
//!
//! # Features
//! - Client-server connections via TCP
//! - Schema listings via `information_schema`
//! - Read-only query execution inside `START TRANSACTION READ ONLY`
//! - MySQL and MariaDB version detection
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - In MySQL a database and a schema are the same namespace, so
//!   `list_schemas(db)` reports `db` itself
//! - The text protocol returns every value as bytes; column types decide
//!   whether a value becomes a JSON number
//! - BLOB data is Base64-encoded for JSON safety
//! - Timeouts enforced via `tokio::time::timeout`

use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Column, Conn, OptsBuilder, Row, Value};
use std::time::{Duration, Instant};

use crate::engine::{
    ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType, QueryLimits,
    QueryResult,
};
use crate::error::{AskError, Result};
use crate::validator::ensure_read_only;

/// Server-internal databases hidden from listings
const SYSTEM_DATABASES: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

/// MySQL database engine implementation
#[derive(Debug, Clone)]
pub struct MySqlEngine {
    config: ConnectionConfig,
    limits: QueryLimits,
}

impl MySqlEngine {
    /// Create an engine for the server named in `config`
    pub fn new(config: ConnectionConfig, limits: QueryLimits) -> Result<Self> {
        config.expect_engine(DatabaseType::MySQL)?;
        build_mysql_opts(&config)?;
        Ok(Self { config, limits })
    }

    async fn connect(&self) -> Result<Conn> {
        let opts = build_mysql_opts(&self.config)?;
        Conn::new(opts)
            .await
            .map_err(|e| AskError::database_unavailable(format!("Failed to connect to MySQL: {e}")))
    }
}

/// Close a scoped connection; a failed goodbye is not worth surfacing
async fn release(conn: Conn) {
    if let Err(e) = conn.disconnect().await {
        tracing::debug!(error = %e, "mysql disconnect failed");
    }
}

impl DatabaseEngine for MySqlEngine {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn describe_connection(&self) -> Result<ConnectionInfo> {
        let mut conn = self.connect().await?;

        let row: Option<(String, Option<String>, String)> = conn
            .query_first("SELECT VERSION(), DATABASE(), CURRENT_USER()")
            .await
            .map_err(|e| {
                AskError::engine_error("mysql", format!("Failed to query server metadata: {e}"))
            })?;
        release(conn).await;

        let (version_string, database, user) = row
            .ok_or_else(|| AskError::engine_error("mysql", "Server returned no metadata row"))?;
        let (database_version, server_info) = parse_mysql_version(&version_string);

        Ok(ConnectionInfo {
            database_version,
            server_info,
            connected_database: database.unwrap_or_else(|| "(none)".to_string()),
            user,
        })
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut conn = self.connect().await?;

        let names: Vec<String> = conn
            .query("SELECT SCHEMA_NAME FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME")
            .await
            .map_err(|e| AskError::engine_error("mysql", format!("Failed to list databases: {e}")))?;
        release(conn).await;

        Ok(names.into_iter().filter(|name| !SYSTEM_DATABASES.contains(&name.as_str())).collect())
    }

    async fn list_schemas(&self, database: &str) -> Result<Vec<String>> {
        let mut conn = self.connect().await?;

        let names: Vec<String> = conn
            .exec(
                "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
                (database,),
            )
            .await
            .map_err(|e| {
                AskError::engine_error("mysql", format!("Failed to look up database '{database}': {e}"))
            })?;
        release(conn).await;

        Ok(names)
    }

    async fn list_tables(&self, database: &str, schema: &str) -> Result<Vec<String>> {
        if database != schema {
            return Ok(Vec::new());
        }

        let mut conn = self.connect().await?;

        let tables: Vec<String> = conn
            .exec(
                "SELECT TABLE_NAME
                 FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
                 ORDER BY TABLE_NAME",
                (schema,),
            )
            .await
            .map_err(|e| {
                AskError::engine_error("mysql", format!("Failed to list tables in '{schema}': {e}"))
            })?;
        release(conn).await;

        Ok(tables)
    }

    async fn list_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        if database != schema {
            return Ok(Vec::new());
        }

        let mut conn = self.connect().await?;

        let rows: Vec<(String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE
                 FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                 ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await
            .map_err(|e| {
                AskError::engine_error(
                    "mysql",
                    format!("Failed to query columns for {schema}.{table}: {e}"),
                )
            })?;
        release(conn).await;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, nullable)| ColumnInfo {
                name,
                data_type,
                nullable: nullable == "YES",
            })
            .collect())
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        ensure_read_only(query)?;

        let mut conn = self.connect().await?;

        let start = Instant::now();
        let outcome = if let Some(timeout_ms) = self.limits.timeout_ms {
            let timed = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                execute_query(&mut conn, query, self.limits),
            )
            .await;

            let Ok(outcome) = timed else {
                // The connection is mid-result; drop it instead of a graceful disconnect
                drop(conn);
                return Err(AskError::execution_failed(format!(
                    "Query exceeded timeout of {timeout_ms}ms"
                )));
            };
            outcome
        } else {
            execute_query(&mut conn, query, self.limits).await
        };

        release(conn).await;

        let mut query_result = outcome?;
        query_result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(query_result)
    }
}

/// Build MySQL connection options from `ConnectionConfig`
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AskError::invalid_input("MySQL requires 'host' parameter"))?;

    let port = config
        .port
        .ok_or_else(|| AskError::invalid_input("MySQL requires 'port' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AskError::invalid_input("MySQL requires 'user' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(user))
        .pass(config.password.as_ref())
        .db_name(config.database.as_ref());

    Ok(opts)
}

/// Parse MySQL version string to detect MySQL vs MariaDB
fn parse_mysql_version(version_string: &str) -> (String, String) {
    let version = version_string.split('-').next().unwrap_or(version_string).to_string();

    let server_info = if version_string.to_ascii_lowercase().contains("mariadb") {
        format!("MariaDB {version}")
    } else {
        format!("MySQL {version}")
    };

    (version, server_info)
}

/// Run one statement inside a read-only transaction and roll it back
async fn execute_query(conn: &mut Conn, query: &str, limits: QueryLimits) -> Result<QueryResult> {
    conn.query_drop("START TRANSACTION READ ONLY").await.map_err(|e| {
        AskError::execution_failed(format!("Failed to start read-only transaction: {e}"))
    })?;

    let fetched = fetch_rows(conn, query, limits).await;

    conn.query_drop("ROLLBACK")
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to end transaction: {e}")))?;

    fetched
}

async fn fetch_rows(conn: &mut Conn, query: &str, limits: QueryLimits) -> Result<QueryResult> {
    let mut result = conn
        .query_iter(query)
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;

    // Column metadata is available even for an empty result set
    let columns: Vec<Column> = result.columns_ref().to_vec();
    let column_names: Vec<String> = columns.iter().map(|col| col.name_str().to_string()).collect();

    let mut rows_data = Vec::new();
    let mut truncated = false;

    while let Some(row) = result
        .next()
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to fetch row: {e}")))?
    {
        if rows_data.len() >= limits.max_rows {
            truncated = true;
            break;
        }
        rows_data.push(row_to_json(&row, &columns));
    }

    // The protocol requires the rest of the result to be read before the next command
    result
        .drop_result()
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to discard remaining rows: {e}")))?;

    Ok(QueryResult { columns: column_names, rows: rows_data, truncated, execution_ms: 0 })
}

/// Convert a MySQL row to a JSON-safe `Vec`
fn row_to_json(row: &Row, columns: &[Column]) -> Vec<serde_json::Value> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            row.as_ref(idx).map_or(serde_json::Value::Null, |value| {
                mysql_value_to_json(value, column.column_type())
            })
        })
        .collect()
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(value: &Value, column_type: ColumnType) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => bytes_to_json(bytes, column_type),

        Value::Int(i) => serde_json::Value::Number((*i).into()),

        Value::UInt(u) => serde_json::json!(*u),

        Value::Float(f) => float_to_json(f64::from(*f)),

        Value::Double(d) => float_to_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => {
            let text = if column_type == ColumnType::MYSQL_TYPE_DATE {
                format!("{year:04}-{month:02}-{day:02}")
            } else {
                format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}")
            };
            serde_json::Value::String(text)
        }

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"
            ))
        }
    }
}

fn float_to_json(v: f64) -> serde_json::Value {
    // NaN/Infinity as null
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Text-protocol bytes, typed by the column they came from
fn bytes_to_json(bytes: &[u8], column_type: ColumnType) -> serde_json::Value {
    let Ok(text) = std::str::from_utf8(bytes) else {
        use base64::Engine;
        return serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
    };

    let number = match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| text.parse::<u64>().map(serde_json::Value::from))
            .ok(),
        ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE
        | ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL => text.parse::<f64>().ok().map(float_to_json),
        _ => None,
    };

    number.unwrap_or_else(|| serde_json::Value::String(text.to_string()))
}
