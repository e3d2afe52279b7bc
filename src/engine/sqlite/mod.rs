//! `SQLite` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `SQLite` databases.
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - In-memory connections (`:memory:`)
//! - Schema listings via `PRAGMA database_list`, `sqlite_master` and `PRAGMA table_info`
//! - Read-only query execution
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver). Queries run on the blocking pool so
//!   the timeout can interrupt them.
//! - Every connection is opened with `SQLITE_OPEN_READ_ONLY`
//! - BLOB data is Base64-encoded for JSON safety
//! - `SQLite` has no schema level below a database: each attached database
//!   (`main`, plus any `ATTACH`ed file) is reported as its own single schema

use rusqlite::{Connection, OpenFlags, Row};
use std::time::{Duration, Instant};

use crate::engine::{
    ColumnInfo, ConnectionConfig, ConnectionInfo, DatabaseEngine, DatabaseType, QueryLimits,
    QueryResult,
};
use crate::error::{AskError, Result};
use crate::validator::ensure_read_only;

/// `SQLite` database engine implementation
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    path: String,
    limits: QueryLimits,
}

impl SqliteEngine {
    /// Create an engine for the file named in `config`
    pub fn new(config: ConnectionConfig, limits: QueryLimits) -> Result<Self> {
        config.expect_engine(DatabaseType::SQLite)?;

        let file_path = config
            .file
            .as_ref()
            .ok_or_else(|| AskError::invalid_input("SQLite requires 'file' parameter"))?;

        let path = file_path
            .to_str()
            .ok_or_else(|| {
                AskError::invalid_input("SQLite file path contains invalid UTF-8 characters")
            })?
            .to_string();

        Ok(Self { path, limits })
    }

    /// Attached database names, in `PRAGMA database_list` order
    fn attached_databases(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("PRAGMA database_list").map_err(|e| {
            AskError::engine_error("sqlite", format!("Failed to list databases: {e}"))
        })?;

        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to fetch database names: {e}"))
            })?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to collect database names: {e}"))
            })?;

        Ok(names.into_iter().filter(|name| name != "temp").collect())
    }
}

impl DatabaseEngine for SqliteEngine {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn describe_connection(&self) -> Result<ConnectionInfo> {
        let conn = open_connection(&self.path)?;

        let version: String =
            conn.query_row("SELECT sqlite_version()", [], |row| row.get(0)).map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to query SQLite version: {e}"))
            })?;

        let db_name = std::path::Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
            .to_string();

        Ok(ConnectionInfo {
            database_version: version.clone(),
            server_info: format!("SQLite {version}"),
            connected_database: db_name,
            user: "N/A".to_string(), // SQLite has no user concept
        })
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let conn = open_connection(&self.path)?;
        Self::attached_databases(&conn)
    }

    async fn list_schemas(&self, database: &str) -> Result<Vec<String>> {
        let conn = open_connection(&self.path)?;
        let known = Self::attached_databases(&conn)?;

        Ok(known.into_iter().filter(|name| name == database).collect())
    }

    async fn list_tables(&self, database: &str, schema: &str) -> Result<Vec<String>> {
        let conn = open_connection(&self.path)?;
        let known = Self::attached_databases(&conn)?;
        if schema != database || !known.iter().any(|name| name == schema) {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT name FROM {}.sqlite_master
             WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
            quote_ident(schema)
        );

        let mut stmt = conn.prepare(&sql).map_err(|e| {
            AskError::engine_error("sqlite", format!("Failed to query tables: {e}"))
        })?;

        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to fetch table names: {e}"))
            })?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to collect table names: {e}"))
            })?;

        Ok(tables)
    }

    async fn list_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        let conn = open_connection(&self.path)?;
        let known = Self::attached_databases(&conn)?;
        if schema != database || !known.iter().any(|name| name == schema) {
            return Ok(Vec::new());
        }

        // PRAGMA table_info returns no rows for an unknown table
        let sql = format!("PRAGMA {}.table_info({})", quote_ident(schema), quote_ident(table));
        let mut stmt = conn.prepare(&sql).map_err(|e| {
            AskError::engine_error("sqlite", format!("Failed to prepare table_info for {table}: {e}"))
        })?;

        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get::<_, String>(1)?,
                    data_type: row.get::<_, String>(2)?,
                    nullable: row.get::<_, i32>(3)? == 0, // notnull column: 0 = nullable, 1 = not null
                })
            })
            .map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to query columns for {table}: {e}"))
            })?
            .collect::<std::result::Result<Vec<ColumnInfo>, _>>()
            .map_err(|e| {
                AskError::engine_error(
                    "sqlite",
                    format!("Failed to collect columns for {table}: {e}"),
                )
            })?;

        Ok(columns)
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        ensure_read_only(query)?;

        let conn = open_connection(&self.path)?;
        let limits = self.limits;

        if let Some(timeout_ms) = limits.timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout_ms)).map_err(|e| {
                AskError::engine_error("sqlite", format!("Failed to set timeout: {e}"))
            })?;
        }

        let interrupt = conn.get_interrupt_handle();
        let query = query.to_string();
        let start = Instant::now();

        let task = tokio::task::spawn_blocking(move || execute_query(&conn, &query, limits));

        let joined = match limits.timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        interrupt.interrupt();
                        tracing::warn!(timeout_ms, "sqlite query interrupted");
                        return Err(AskError::execution_failed(format!(
                            "Query timed out after {timeout_ms} ms"
                        )));
                    }
                }
            }
            None => task.await,
        };

        let mut result = joined
            .map_err(|e| AskError::execution_failed(format!("Query task failed: {e}")))??;
        result.execution_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(result)
    }
}

/// Open a read-only `SQLite` connection
fn open_connection(path: &str) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;

    Connection::open_with_flags(path, flags).map_err(|e| {
        AskError::database_unavailable(format!("Failed to open SQLite database: {e}"))
    })
}

/// Quote an identifier for interpolation into a PRAGMA or catalog statement
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Execute query and return `QueryResult`
fn execute_query(conn: &Connection, query: &str, limits: QueryLimits) -> Result<QueryResult> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| AskError::execution_failed(format!("Failed to prepare query: {e}")))?;

    // The connection is already read-only; this catches writes before they reach the pager
    if !stmt.readonly() {
        return Err(AskError::validation_rejected("statement would modify the database"));
    }

    let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| AskError::execution_failed(format!("Failed to execute query: {e}")))?;

    let mut rows_data = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows
        .next()
        .map_err(|e| AskError::execution_failed(format!("Failed to fetch row: {e}")))?
    {
        if rows_data.len() >= limits.max_rows {
            truncated = true;
            break;
        }

        let values = row_to_json(column_names.len(), row)
            .map_err(|e| AskError::execution_failed(format!("Failed to read row: {e}")))?;
        rows_data.push(values);
    }

    Ok(QueryResult { columns: column_names, rows: rows_data, truncated, execution_ms: 0 })
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(
    column_count: usize,
    row: &Row,
) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..column_count).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    let value_ref = row.get_ref(idx)?;

    Ok(match value_ref {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // NaN/Infinity as null
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db(name: &str, setup: &[&str]) -> PathBuf {
        let temp_file = std::env::temp_dir().join(format!("askdb_sqlite_{name}.db"));
        let _ = std::fs::remove_file(&temp_file);

        let conn = Connection::open(&temp_file).expect("Failed to create temp database");
        for sql in setup {
            conn.execute_batch(sql).expect("Failed to run setup SQL");
        }

        temp_file
    }

    fn engine_for(path: &std::path::Path, limits: QueryLimits) -> SqliteEngine {
        SqliteEngine::new(ConnectionConfig::sqlite(path.to_path_buf()), limits)
            .expect("valid sqlite config")
    }

    #[tokio::test]
    async fn test_describe_connection_memory() {
        let engine = engine_for(std::path::Path::new(":memory:"), QueryLimits::default());
        let info = engine.describe_connection().await.unwrap();

        assert!(info.database_version.starts_with("3.")); // SQLite version 3.x
        assert!(info.server_info.contains("SQLite"));
        assert_eq!(info.connected_database, ":memory:");
        assert_eq!(info.user, "N/A");
    }

    #[test]
    fn test_new_wrong_engine() {
        let mut config = ConnectionConfig::sqlite(":memory:".into());
        config.engine = DatabaseType::Postgres;

        let err = SqliteEngine::new(config, QueryLimits::default()).unwrap_err();
        assert!(err.message().contains("Expected SQLite engine"));
    }

    #[test]
    fn test_new_missing_file() {
        let mut config = ConnectionConfig::sqlite(":memory:".into());
        config.file = None;

        let err = SqliteEngine::new(config, QueryLimits::default()).unwrap_err();
        assert!(err.message().contains("SQLite requires 'file' parameter"));
    }

    #[tokio::test]
    async fn test_missing_file_is_database_unavailable() {
        let path = std::env::temp_dir().join("askdb_sqlite_does_not_exist.db");
        let _ = std::fs::remove_file(&path);
        let engine = engine_for(&path, QueryLimits::default());

        let err = engine.list_databases().await.unwrap_err();
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_listings() {
        let path = temp_db(
            "listings",
            &["CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, city TEXT);
               CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER);
               CREATE VIEW seattle AS SELECT * FROM customers WHERE city = 'Seattle';"],
        );
        let engine = engine_for(&path, QueryLimits::default());

        assert_eq!(engine.list_databases().await.unwrap(), vec!["main"]);
        assert_eq!(engine.list_schemas("main").await.unwrap(), vec!["main"]);
        assert!(engine.list_schemas("other").await.unwrap().is_empty());
        assert_eq!(engine.list_tables("main", "main").await.unwrap(), vec!["customers", "orders"]);

        let columns = engine.list_columns("main", "main", "customers").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[1].data_type, "TEXT");
        assert!(!columns[1].nullable);
        assert!(columns[2].nullable);

        assert!(engine.list_columns("main", "main", "missing").await.unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_listings_are_repeatable() {
        let path = temp_db(
            "repeatable",
            &["CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
               CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER);"],
        );
        let engine = engine_for(&path, QueryLimits::default());

        assert_eq!(engine.list_databases().await.unwrap(), engine.list_databases().await.unwrap());
        assert_eq!(
            engine.list_schemas("main").await.unwrap(),
            engine.list_schemas("main").await.unwrap()
        );
        assert_eq!(
            engine.list_tables("main", "main").await.unwrap(),
            engine.list_tables("main", "main").await.unwrap()
        );
        assert_eq!(
            engine.list_columns("main", "main", "orders").await.unwrap(),
            engine.list_columns("main", "main", "orders").await.unwrap()
        );

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_select_query() {
        let path = temp_db(
            "select",
            &["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
               INSERT INTO users (name) VALUES ('Alice');"],
        );
        let engine = engine_for(&path, QueryLimits::default());

        let result = engine.execute("SELECT * FROM users").await.unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows.len(), 1);
        assert!(!result.truncated);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_rejects_before_opening() {
        // The file does not exist: a rejection must come from the validator, not the driver
        let path = std::env::temp_dir().join("askdb_sqlite_never_created.db");
        let _ = std::fs::remove_file(&path);
        let engine = engine_for(&path, QueryLimits::default());

        for sql in [
            "INSERT INTO users (name) VALUES ('Bob')",
            "UPDATE users SET name = 'Bob' WHERE id = 1",
            "DELETE FROM users WHERE id = 1",
            "CREATE TABLE users (id INTEGER PRIMARY KEY)",
        ] {
            let err = engine.execute(sql).await.unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_REJECTED", "{sql}");
        }

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_execute_max_rows_sets_truncated() {
        let path = temp_db("max_rows", &["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"]);
        {
            let conn = Connection::open(&path).unwrap();
            for i in 1..=10 {
                conn.execute("INSERT INTO users (name) VALUES (?)", [format!("User {i}")])
                    .expect("Failed to insert");
            }
        }

        let engine = engine_for(&path, QueryLimits { max_rows: 5, timeout_ms: None });
        let result = engine.execute("SELECT * FROM users").await.unwrap();
        assert_eq!(result.rows.len(), 5);
        assert!(result.truncated);

        let exact = engine.execute("SELECT * FROM users LIMIT 5").await.unwrap();
        assert_eq!(exact.rows.len(), 5);
        assert!(!exact.truncated);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_syntax_error() {
        let path = temp_db("syntax", &["CREATE TABLE t (x INTEGER)"]);
        let engine = engine_for(&path, QueryLimits::default());

        let err = engine.execute("SELECT FROM WHERE").await.unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
        assert!(err.message().contains("syntax error"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_timeout_interrupts() {
        let path = temp_db("timeout", &["CREATE TABLE t (x INTEGER)"]);
        let engine = engine_for(&path, QueryLimits { max_rows: 10, timeout_ms: Some(100) });

        let err = engine
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT count(*) FROM c",
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXECUTION_FAILED");
        assert!(err.message().contains("timed out"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_execute_all_data_types() {
        let path = temp_db(
            "data_types",
            &["CREATE TABLE test_types (
                int_col INTEGER,
                real_col REAL,
                text_col TEXT,
                blob_col BLOB,
                null_col TEXT
            )"],
        );
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO test_types VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    42,
                    std::f64::consts::PI,
                    "hello",
                    vec![1u8, 2u8, 3u8],
                    Option::<String>::None
                ],
            )
            .expect("Failed to insert");
        }

        let engine = engine_for(&path, QueryLimits::default());
        let result = engine.execute("SELECT * FROM test_types").await.unwrap();
        let row = &result.rows[0];

        assert_eq!(row[0], serde_json::json!(42));
        assert!(row[1].is_number());
        assert_eq!(row[2], serde_json::json!("hello"));
        assert_eq!(row[3], serde_json::json!("AQID")); // base64 of [1, 2, 3]
        assert_eq!(row[4], serde_json::Value::Null);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("main"), "\"main\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
