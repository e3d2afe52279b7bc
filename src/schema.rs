//! Schema Snapshot
//!
//! Walks the `DatabaseEngine` listings (databases → schemas → tables →
//! columns) into one nested, immutable descriptor that can be rendered as
//! prompt text or serialized as JSON.
//!
//! The agent normally grounds the model progressively through the listing
//! tools. A snapshot is taken only when the whole structure is wanted up
//! front (`askdb schema`, `askdb chat --preload-schema`).

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::engine::{ColumnInfo, DatabaseEngine};
use crate::error::Result;

/// Full structural description of what the connection can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Server description (`ConnectionInfo::server_info`)
    pub server: String,
    pub databases: Vec<DatabaseSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub name: String,
    pub schemas: Vec<SchemaEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl SchemaSnapshot {
    /// Capture the structure of one database, or of every visible database when `database` is `None`
    pub async fn capture<E: DatabaseEngine>(engine: &E, database: Option<&str>) -> Result<Self> {
        let server = engine.describe_connection().await?.server_info;

        let database_names = match database {
            Some(name) => vec![name.to_string()],
            None => engine.list_databases().await?,
        };

        let mut databases = Vec::with_capacity(database_names.len());
        for db in database_names {
            let mut schemas = Vec::new();
            for schema in engine.list_schemas(&db).await? {
                let mut tables = Vec::new();
                for table in engine.list_tables(&db, &schema).await? {
                    let columns = engine.list_columns(&db, &schema, &table).await?;
                    tables.push(TableSchema { name: table, columns });
                }
                schemas.push(SchemaEntry { name: schema, tables });
            }
            databases.push(DatabaseSchema { name: db, schemas });
        }

        let table_count: usize =
            databases.iter().flat_map(|d| &d.schemas).map(|s| s.tables.len()).sum();
        tracing::debug!(databases = databases.len(), tables = table_count, "schema snapshot captured");

        Ok(Self { server, databases })
    }

    /// Number of tables across all databases and schemas
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.databases.iter().flat_map(|d| &d.schemas).map(|s| s.tables.len()).sum()
    }

    /// Indented text form, suitable for a system prompt
    #[must_use]
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Server: {}", self.server);

        for db in &self.databases {
            let _ = writeln!(out, "Database: {}", db.name);
            for schema in &db.schemas {
                let _ = writeln!(out, "  Schema: {}", schema.name);
                for table in &schema.tables {
                    let _ = writeln!(out, "    Table: {}", table.name);
                    for column in &table.columns {
                        let nullable = if column.nullable { ", nullable" } else { "" };
                        let _ = writeln!(out, "      - {} ({}{nullable})", column.name, column.data_type);
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SchemaSnapshot {
        SchemaSnapshot {
            server: "SQLite 3.45.0".to_string(),
            databases: vec![DatabaseSchema {
                name: "main".to_string(),
                schemas: vec![SchemaEntry {
                    name: "main".to_string(),
                    tables: vec![TableSchema {
                        name: "Customers".to_string(),
                        columns: vec![
                            ColumnInfo {
                                name: "CustomerID".to_string(),
                                data_type: "INTEGER".to_string(),
                                nullable: false,
                            },
                            ColumnInfo {
                                name: "City".to_string(),
                                data_type: "TEXT".to_string(),
                                nullable: true,
                            },
                        ],
                    }],
                }],
            }],
        }
    }

    #[test]
    fn test_prompt_text_layout() {
        let expected = "\
Server: SQLite 3.45.0
Database: main
  Schema: main
    Table: Customers
      - CustomerID (INTEGER)
      - City (TEXT, nullable)
";
        assert_eq!(sample().to_prompt_text(), expected);
    }

    #[test]
    fn test_table_count() {
        assert_eq!(sample().table_count(), 1);
    }
}
