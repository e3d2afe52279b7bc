//! Database Engine Traits and Core Types
//!
//! This module defines the database boundary of askdb: the schema listings
//! used to ground the language model and the read-only query executor.
//! Each engine (`PostgreSQL`, `MySQL`, `SQLite`) implements the `DatabaseEngine` trait.
//!
//! # Scoped Connections
//! Engines hold configuration only. Every trait method opens its own
//! connection, uses it, and releases it before returning, on success and on
//! error alike. No connection state is shared between calls.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions.
//!
//! # Defense in Depth
//! `execute` re-validates its input with [`crate::validator::ensure_read_only`]
//! before a connection is even opened, then runs the statement under the
//! engine's own read-only guard (read-only file handle or read-only transaction).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;

use crate::error::{AskError, Result};

#[cfg(not(any(feature = "sqlite", feature = "postgres", feature = "mysql")))]
compile_error!("askdb needs at least one database engine feature: sqlite, postgres or mysql");

// Engine-specific implementations
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }

    /// Human-readable SQL dialect name, used in the system prompt
    #[must_use]
    pub const fn dialect(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = AskError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            other => Err(AskError::invalid_input(format!(
                "Unknown engine '{other}' (expected postgres, mysql or sqlite)"
            ))),
        }
    }
}

/// Connection configuration for database engines
///
/// This struct contains all parameters needed to establish a database connection.
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Hostname (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (for postgres/mysql)
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Default database name (for postgres/mysql)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (for sqlite)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Create a new `PostgreSQL` connection config
    #[must_use]
    pub const fn postgres(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::Postgres,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
        }
    }

    /// Create a new `MySQL` connection config
    #[must_use]
    pub const fn mysql(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::MySQL,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub const fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: DatabaseType::SQLite,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: Some(file),
        }
    }

    /// Reject a config built for another engine
    pub(crate) fn expect_engine(&self, expected: DatabaseType) -> Result<()> {
        if self.engine == expected {
            Ok(())
        } else {
            Err(AskError::invalid_input(format!(
                "Expected {} engine, got {}",
                expected.dialect(),
                self.engine
            )))
        }
    }
}

/// Connection information returned by [`DatabaseEngine::describe_connection`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Database server version string
    pub database_version: String,

    /// Server information (implementation-specific)
    pub server_info: String,

    /// Name of the connected database
    pub connected_database: String,

    /// Connected user name
    pub user: String,
}

/// Limits applied to every executed query
///
/// Defaults are the most restrictive settings askdb ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Maximum number of rows returned (extra rows are dropped and `truncated` is set)
    pub max_rows: usize,

    /// Query timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self { max_rows: 50, timeout_ms: Some(30_000) }
    }
}

/// Column information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// Column data type (engine-specific)
    pub data_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,
}

/// Query execution result
///
/// Rows are positional and line up with `columns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result set order
    pub columns: Vec<String>,

    /// Result rows
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Set when rows beyond `QueryLimits::max_rows` were dropped
    #[serde(default)]
    pub truncated: bool,

    /// Wall-clock execution time
    #[serde(default)]
    pub execution_ms: u64,
}

impl QueryResult {
    /// Number of rows returned
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as column-name → value objects
    ///
    /// When a result has duplicate column names the last one wins.
    #[must_use]
    pub fn records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }
}

/// Database engine trait
///
/// The schema listing methods are the Schema Provider: each issues a catalog
/// query and returns a flat, ordered listing. Calling one twice with the
/// same arguments yields the same result as long as the schema is unchanged.
pub trait DatabaseEngine {
    /// Engine type
    fn database_type(&self) -> DatabaseType;

    /// Open a connection, read server metadata, and close it again
    fn describe_connection(&self) -> impl Future<Output = Result<ConnectionInfo>> + Send;

    /// Databases visible on the connected server
    fn list_databases(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Schemas within `database`
    fn list_schemas(&self, database: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Base tables within `database`.`schema`
    fn list_tables(
        &self,
        database: &str,
        schema: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Columns of one table, in ordinal order
    ///
    /// An unknown table yields an empty list rather than an error.
    fn list_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> impl Future<Output = Result<Vec<ColumnInfo>>> + Send;

    /// Execute a read-only query
    ///
    /// Validation failures MUST be reported before any connection is opened.
    fn execute(&self, query: &str) -> impl Future<Output = Result<QueryResult>> + Send;
}

/// Engine chosen at runtime from a [`ConnectionConfig`]
pub enum AnyEngine {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteEngine),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresEngine),
    #[cfg(feature = "mysql")]
    MySql(mysql::MySqlEngine),
}

impl AnyEngine {
    /// Build the engine matching `config.engine`
    pub fn from_config(config: ConnectionConfig, limits: QueryLimits) -> Result<Self> {
        match config.engine {
            #[cfg(feature = "sqlite")]
            DatabaseType::SQLite => Ok(Self::Sqlite(sqlite::SqliteEngine::new(config, limits)?)),
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => {
                Ok(Self::Postgres(postgres::PostgresEngine::new(config, limits)?))
            }
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => Ok(Self::MySql(mysql::MySqlEngine::new(config, limits)?)),
            #[allow(unreachable_patterns)]
            other => Err(AskError::config_error(format!(
                "askdb was built without support for the {other} engine"
            ))),
        }
    }
}

/// Forward a trait call to whichever engine is inside
macro_rules! dispatch {
    ($self:ident, $engine:ident => $call:expr) => {
        match $self {
            #[cfg(feature = "sqlite")]
            AnyEngine::Sqlite($engine) => $call,
            #[cfg(feature = "postgres")]
            AnyEngine::Postgres($engine) => $call,
            #[cfg(feature = "mysql")]
            AnyEngine::MySql($engine) => $call,
        }
    };
}

impl DatabaseEngine for AnyEngine {
    fn database_type(&self) -> DatabaseType {
        dispatch!(self, engine => engine.database_type())
    }

    async fn describe_connection(&self) -> Result<ConnectionInfo> {
        dispatch!(self, engine => engine.describe_connection().await)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        dispatch!(self, engine => engine.list_databases().await)
    }

    async fn list_schemas(&self, database: &str) -> Result<Vec<String>> {
        dispatch!(self, engine => engine.list_schemas(database).await)
    }

    async fn list_tables(&self, database: &str, schema: &str) -> Result<Vec<String>> {
        dispatch!(self, engine => engine.list_tables(database, schema).await)
    }

    async fn list_columns(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>> {
        dispatch!(self, engine => engine.list_columns(database, schema, table).await)
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        dispatch!(self, engine => engine.execute(query).await)
    }
}
