//! `PostgreSQL` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `PostgreSQL` databases.
//!
//! # Features
//! - Client-server connections via TCP
//! - Schema listings via `pg_catalog.pg_database` and `information_schema`
//! - Read-only query execution inside a `READ ONLY` transaction
//! - Rich type system support (JSON/JSONB, timestamps, numeric, UUID)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - A database can only be inspected from a connection to it, so every
//!   listing call that names a database connects to that database
//! - JSON/JSONB preserved as nested JSON
//! - BYTEA data is Base64-encoded for JSON safety
//! - Timeouts enforced server-side (`SET LOCAL statement_timeout`) and
//!   client-side (`tokio::time::timeout`)
//! - Rows are streamed and the stream is abandoned one row past `max_rows`

use futures_util::TryStreamExt;
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::engine::{
    ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType, QueryLimits,
    QueryResult,
};
use crate::error::{AskError, Result};
use crate::validator::ensure_read_only;

/// Database used when the configuration names none (or uses the `*` wildcard)
const DEFAULT_DATABASE: &str = "postgres";

/// `PostgreSQL` database engine implementation
#[derive(Debug, Clone)]
pub struct PostgresEngine {
    config: ConnectionConfig,
    limits: QueryLimits,
}

impl PostgresEngine {
    /// Create an engine for the server named in `config`
    pub fn new(config: ConnectionConfig, limits: QueryLimits) -> Result<Self> {
        config.expect_engine(DatabaseType::Postgres)?;
        // Surface missing parameters now rather than on first use
        build_pg_config(&config, None)?;
        Ok(Self { config, limits })
    }

    /// Open a scoped connection, optionally to a database other than the configured one
    async fn connect(&self, database: Option<&str>) -> Result<Client> {
        let pg_config = build_pg_config(&self.config, database)?;

        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
            connect_error(e.code(), format!("Failed to connect to PostgreSQL: {e}"))
        })?;

        // Connection errors are not logged to prevent credential leakage.
        // The task ends when `client` is dropped.
        tokio::spawn(async move {
            let _ = connection.await;
        });

        Ok(client)
    }
}

impl DatabaseEngine for PostgresEngine {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn describe_connection(&self) -> Result<ConnectionInfo> {
        let client = self.connect(None).await?;

        let row = client
            .query_one("SELECT version(), current_database(), current_user::text", &[])
            .await
            .map_err(|e| {
                AskError::engine_error("postgres", format!("Failed to query server metadata: {e}"))
            })?;

        let version_string: String = row.get(0);

        // "PostgreSQL 15.3 on x86_64..." -> "15.3"
        let database_version =
            version_string.split_whitespace().nth(1).unwrap_or("unknown").to_string();

        Ok(ConnectionInfo {
            database_version,
            server_info: version_string,
            connected_database: row.get(1),
            user: row.get(2),
        })
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let client = self.connect(None).await?;

        let rows = client
            .query(
                "SELECT datname
                 FROM pg_catalog.pg_database
                 WHERE datistemplate = false AND datallowconn
                 ORDER BY datname",
                &[],
            )
            .await
            .map_err(|e| {
                AskError::engine_error("postgres", format!("Failed to list databases: {e}"))
            })?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_schemas(&self, database: &str) -> Result<Vec<String>> {
        let client = self.connect(Some(database)).await?;

        let rows = client
            .query(
                "SELECT schema_name
                 FROM information_schema.schemata
                 WHERE schema_name <> 'information_schema'
                 AND schema_name NOT LIKE 'pg\\_%'
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(|e| {
                AskError::engine_error(
                    "postgres",
                    format!("Failed to list schemas in '{database}': {e}"),
                )
            })?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_tables(&self, database: &str, schema: &str) -> Result<Vec<String>> {
        let client = self.connect(Some(database)).await?;

        let rows = client
            .query(
                "SELECT table_name
                 FROM information_schema.tables
                 WHERE table_schema = $1
                 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&schema],
            )
            .await
            .map_err(|e| {
                AskError::engine_error(
                    "postgres",
                    format!("Failed to list tables in schema '{schema}': {e}"),
                )
            })?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn list_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let client = self.connect(Some(database)).await?;

        let rows = client
            .query(
                "SELECT column_name, data_type, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(|e| {
                AskError::engine_error(
                    "postgres",
                    format!("Failed to query columns for {schema}.{table}: {e}"),
                )
            })?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get::<_, String>(2) == "YES",
            })
            .collect())
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        ensure_read_only(query)?;

        let mut client = self.connect(None).await?;

        let start = Instant::now();
        let mut query_result = if let Some(timeout_ms) = self.limits.timeout_ms {
            tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                execute_query(&mut client, query, self.limits),
            )
            .await
            .map_err(|_| {
                AskError::execution_failed(format!("Query exceeded timeout of {timeout_ms}ms"))
            })??
        } else {
            execute_query(&mut client, query, self.limits).await?
        };

        query_result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(query_result)
    }
}

/// Classify a failed connect by the SQLSTATE the server sent, if any
///
/// A database that does not exist or may not be opened is an ordinary
/// listing error the model can recover from. Everything else (refused
/// connections, TLS or authentication failures) means the server is unusable.
fn connect_error(code: Option<&SqlState>, detail: String) -> AskError {
    match code {
        Some(code)
            if *code == SqlState::INVALID_CATALOG_NAME
                || *code == SqlState::INSUFFICIENT_PRIVILEGE =>
        {
            AskError::engine_error("postgres", detail)
        }
        _ => AskError::database_unavailable(detail),
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig, database: Option<&str>) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| AskError::invalid_input("PostgreSQL requires 'host' parameter"))?;

    let port = config
        .port
        .ok_or_else(|| AskError::invalid_input("PostgreSQL requires 'port' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| AskError::invalid_input("PostgreSQL requires 'user' parameter"))?;

    let db_name = match database.or(config.database.as_deref()) {
        Some("*") | None => DEFAULT_DATABASE,
        Some(db) => db,
    };

    let mut pg_config = Config::new();
    pg_config.host(host).port(port).user(user).dbname(db_name).application_name("askdb");

    if let Some(password) = &config.password {
        pg_config.password(password);
    }

    Ok(pg_config)
}

/// Run one statement in a read-only transaction that is always rolled back
async fn execute_query(client: &mut Client, query: &str, limits: QueryLimits) -> Result<QueryResult> {
    let tx = client.build_transaction().read_only(true).start().await.map_err(|e| {
        AskError::execution_failed(format!("Failed to start read-only transaction: {e}"))
    })?;

    if let Some(timeout_ms) = limits.timeout_ms {
        tx.batch_execute(&format!("SET LOCAL statement_timeout = {timeout_ms}")).await.map_err(
            |e| AskError::execution_failed(format!("Failed to set statement timeout: {e}")),
        )?;
    }

    let stmt = tx
        .prepare(query)
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to prepare query: {e}")))?;

    let column_names: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

    let stream = tx
        .query_raw(&stmt, std::iter::empty::<&(dyn ToSql + Sync)>())
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;
    let mut stream = std::pin::pin!(stream);

    let mut rows_data = Vec::new();
    let mut truncated = false;

    while let Some(row) = stream
        .try_next()
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to fetch row: {e}")))?
    {
        if rows_data.len() >= limits.max_rows {
            truncated = true;
            break;
        }
        rows_data.push(row_to_json(&row)?);
    }

    // Nothing was written, but end the transaction explicitly rather than on drop
    tx.rollback()
        .await
        .map_err(|e| AskError::execution_failed(format!("Failed to end transaction: {e}")))?;

    Ok(QueryResult { columns: column_names, rows: rows_data, truncated, execution_ms: 0 })
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Read one nullable column value
fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        AskError::execution_failed(format!(
            "Failed to convert PostgreSQL type '{}' to JSON: {e}",
            row.columns()[idx].type_().name()
        ))
    })
}

/// Undecoded wire bytes of any column type
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn float_to_json(v: f64) -> serde_json::Value {
    // NaN/Infinity as null
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use serde_json::Value;

    let col_type = row.columns()[idx].type_().clone();

    let value = match col_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|v| Value::Number(v.into())),
        Type::INT4 => get::<i32>(row, idx)?.map(|v| Value::Number(v.into())),
        Type::INT8 => get::<i64>(row, idx)?.map(|v| Value::Number(v.into())),
        Type::OID => get::<u32>(row, idx)?.map(|v| Value::Number(v.into())),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(float_to_json),
        Type::NUMERIC => get::<RawValue>(row, idx)?.map(|raw| numeric_to_json(raw.0)),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(|v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339()))
        }
        Type::DATE => {
            get::<chrono::NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string()))
        }
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?
            .map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        // Enums, citext and other text-encoded types arrive as UTF-8; anything else as Base64
        _ => get::<RawValue>(row, idx)?.map(|raw| match std::str::from_utf8(raw.0) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => {
                use base64::Engine;
                Value::String(base64::engine::general_purpose::STANDARD.encode(raw.0))
            }
        }),
    };

    Ok(value.unwrap_or(serde_json::Value::Null))
}

/// Decode the binary NUMERIC wire format into a JSON number (or string when not finite)
///
/// Layout: ndigits, weight, sign, dscale (all 16-bit), then ndigits base-10000 digits.
fn numeric_to_json(raw: &[u8]) -> serde_json::Value {
    let text = decode_numeric(raw);
    match text.parse::<i64>() {
        Ok(int) => serde_json::Value::Number(int.into()),
        Err(_) => match text.parse::<f64>() {
            Ok(float) if float.is_finite() => float_to_json(float),
            _ => serde_json::Value::String(text),
        },
    }
}

fn decode_numeric(raw: &[u8]) -> String {
    let word = |i: usize| -> i32 {
        raw.get(i * 2..i * 2 + 2).map_or(0, |b| i32::from(i16::from_be_bytes([b[0], b[1]])))
    };

    let ndigits = usize::try_from(word(0)).unwrap_or(0);
    let weight = word(1);
    let sign = word(2) as u16;
    let dscale = usize::try_from(word(3)).unwrap_or(0);

    match sign {
        0xC000 => return "NaN".to_string(),
        0xD000 => return "Infinity".to_string(),
        0xF000 => return "-Infinity".to_string(),
        _ => {}
    }

    let digits: Vec<i32> = (0..ndigits).map(|i| word(4 + i)).collect();
    let digit_at = |pos: i32| -> i32 {
        usize::try_from(pos).ok().and_then(|p| digits.get(p).copied()).unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    // Integer part: groups 0..=weight
    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            let group = digit_at(pos);
            if pos == 0 {
                out.push_str(&group.to_string());
            } else {
                out.push_str(&format!("{group:04}"));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: tests marked #[ignore] require a running PostgreSQL instance:
    // cargo test --features postgres -- --ignored

    fn local_config() -> ConnectionConfig {
        ConnectionConfig::postgres(
            "localhost".to_string(),
            5432,
            "postgres".to_string(),
            "postgres".to_string(),
            "postgres".to_string(),
        )
    }

    #[test]
    fn test_wildcard_database_config() {
        let mut config = local_config();
        config.database = Some("*".to_string());

        let pg_config = build_pg_config(&config, None).unwrap();
        assert_eq!(pg_config.get_dbname(), Some("postgres"));
    }

    #[test]
    fn test_database_override() {
        let pg_config = build_pg_config(&local_config(), Some("sales")).unwrap();
        assert_eq!(pg_config.get_dbname(), Some("sales"));
    }

    #[test]
    fn test_unknown_database_is_recoverable() {
        let err = connect_error(
            Some(&SqlState::INVALID_CATALOG_NAME),
            "database \"Sales\" does not exist".to_string(),
        );
        assert_eq!(err.error_code(), "ENGINE_ERROR");
        assert!(!err.is_fatal_for_turn());

        let err =
            connect_error(Some(&SqlState::INSUFFICIENT_PRIVILEGE), "permission denied".to_string());
        assert!(!err.is_fatal_for_turn());
    }

    #[test]
    fn test_transport_and_auth_failures_end_the_turn() {
        let err = connect_error(None, "connection refused".to_string());
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
        assert!(err.is_fatal_for_turn());

        let err = connect_error(
            Some(&SqlState::INVALID_PASSWORD),
            "password authentication failed".to_string(),
        );
        assert!(err.is_fatal_for_turn());
    }

    #[test]
    fn test_missing_host_error() {
        let mut config = local_config();
        config.host = None;

        let err = PostgresEngine::new(config, QueryLimits::default()).unwrap_err();
        assert!(err.message().contains("PostgreSQL requires 'host' parameter"));
    }

    #[test]
    fn test_password_is_optional() {
        let mut config = local_config();
        config.password = None;
        assert!(build_pg_config(&config, None).is_ok());
    }

    fn numeric_bytes(words: &[i16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn test_decode_numeric() {
        // 12345.678 -> digits [1, 2345, 6780], weight 1, dscale 3
        let raw = numeric_bytes(&[3, 1, 0, 3, 1, 2345, 6780]);
        assert_eq!(decode_numeric(&raw), "12345.678");

        // -0.05 -> digits [500], weight -1, dscale 2
        let raw = numeric_bytes(&[1, -1, 0x4000, 2, 500]);
        assert_eq!(decode_numeric(&raw), "-0.05");

        // 20000 -> digits [2], weight 1, dscale 0
        let raw = numeric_bytes(&[1, 1, 0, 0, 2]);
        assert_eq!(decode_numeric(&raw), "20000");
        assert_eq!(numeric_to_json(&raw), serde_json::json!(20000));

        // NaN
        let raw = numeric_bytes(&[0, 0, 0xC000_u16 as i16, 0]);
        assert_eq!(numeric_to_json(&raw), serde_json::json!("NaN"));
    }

    #[tokio::test]
    async fn test_execute_rejects_without_connecting() {
        // Nothing listens on this port; the validator must answer first
        let mut config = local_config();
        config.port = Some(1);
        let engine = PostgresEngine::new(config, QueryLimits::default()).unwrap();

        let err = engine.execute("DROP TABLE customers").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_REJECTED");
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_describe_connection() {
        let engine = PostgresEngine::new(local_config(), QueryLimits::default()).unwrap();
        let info = engine.describe_connection().await.unwrap();

        assert!(info.server_info.contains("PostgreSQL"));
        assert_eq!(info.connected_database, "postgres");
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_listings_and_execute() {
        let engine = PostgresEngine::new(local_config(), QueryLimits::default()).unwrap();

        assert!(engine.list_databases().await.unwrap().contains(&"postgres".to_string()));
        assert!(engine.list_schemas("postgres").await.unwrap().contains(&"public".to_string()));
        assert!(engine.list_columns("postgres", "public", "no_such_table").await.unwrap().is_empty());

        let result = engine.execute("SELECT 1::int4 AS one, 2.50::numeric AS two").await.unwrap();
        assert_eq!(result.columns, vec!["one", "two"]);
        assert_eq!(result.rows[0][0], serde_json::json!(1));
        assert_eq!(result.rows[0][1], serde_json::json!(2.5));
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_execute_failure_is_execution_failed() {
        let engine = PostgresEngine::new(local_config(), QueryLimits::default()).unwrap();

        let err = engine.execute("SELECT * FROM askdb_no_such_table").await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
        assert_eq!(err.user_message(), "I couldn't retrieve that information.");
    }
}
