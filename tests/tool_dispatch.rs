//! Tool Dispatch Tests
//!
//! Runs each declared tool against a `SQLite` file and checks the text
//! observation the model would receive.

#![cfg(feature = "sqlite")]

use std::path::PathBuf;

use pretty_assertions::assert_eq;
use serde_json::json;

use askdb::engine::sqlite::SqliteEngine;
use askdb::tools::{dispatch, tool_definitions, ToolOutcome, ToolRequest};
use askdb::{ConnectionConfig, QueryLimits};

// ============================================================================
// Test Helpers
// ============================================================================

fn create_sales_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("askdb_tools_{name}.db"));
    let _ = std::fs::remove_file(&path);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Customer (CustomerID INTEGER PRIMARY KEY, CompanyName TEXT NOT NULL, City TEXT);
         CREATE TABLE SalesOrder (OrderID INTEGER PRIMARY KEY, CustomerID INTEGER, Total REAL);
         INSERT INTO Customer (CompanyName, City) VALUES ('Bike World', 'Seattle');
         INSERT INTO Customer (CompanyName, City) VALUES ('Cycle Hub', 'Seattle');
         INSERT INTO Customer (CompanyName, City) VALUES ('Pedal Co', 'Denver');",
    )
    .unwrap();

    path
}

fn engine(path: &PathBuf, max_rows: usize) -> SqliteEngine {
    let limits = QueryLimits { max_rows, timeout_ms: Some(5_000) };
    SqliteEngine::new(ConnectionConfig::sqlite(path.clone()), limits).unwrap()
}

async fn observe(engine: &SqliteEngine, name: &str, arguments: serde_json::Value) -> String {
    let request = ToolRequest::parse(name, &arguments).unwrap();
    dispatch(engine, &request).await.unwrap().observation()
}

// ============================================================================
// Listings
// ============================================================================

#[tokio::test]
async fn test_listing_observations() {
    let path = create_sales_db("listings");
    let engine = engine(&path, 50);

    assert_eq!(observe(&engine, "list_databases", json!({})).await, "Databases on the server:\n- main");
    assert_eq!(
        observe(&engine, "list_schemas", json!({"database": "main"})).await,
        "Schemas in 'main':\n- main"
    );
    assert_eq!(
        observe(&engine, "list_tables", json!({"database": "main", "schema": "main"})).await,
        "Tables in 'main':\n- Customer\n- SalesOrder"
    );
    assert_eq!(
        observe(&engine, "list_columns", json!({"database": "main", "schema": "main", "table": "Customer"}))
            .await,
        "Columns in 'main.Customer':\n- CustomerID (INTEGER, nullable)\n- CompanyName (TEXT)\n- City (TEXT, nullable)"
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_unknown_names_list_nothing() {
    let path = create_sales_db("unknown");
    let engine = engine(&path, 50);

    assert_eq!(
        observe(&engine, "list_tables", json!({"database": "main", "schema": "SalesLT"})).await,
        "No tables found in schema 'SalesLT'."
    );
    assert_eq!(
        observe(&engine, "list_columns", json!({"database": "main", "schema": "main", "table": "Nope"}))
            .await,
        "No columns found in 'main.Nope'."
    );

    // Listings are repeatable
    let first = observe(&engine, "list_tables", json!({"database": "main", "schema": "main"})).await;
    let second = observe(&engine, "list_tables", json!({"database": "main", "schema": "main"})).await;
    assert_eq!(first, second);

    let _ = std::fs::remove_file(&path);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_query_observation_is_json_records() {
    let path = create_sales_db("query");
    let engine = engine(&path, 50);

    let text = observe(
        &engine,
        "execute_query",
        json!({"sql": "SELECT COUNT(*) AS Customers FROM Customer WHERE City = 'Seattle'"}),
    )
    .await;
    assert_eq!(text, r#"[{"Customers":2}]"#);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_truncated_query_says_so() {
    let path = create_sales_db("truncated");
    let engine = engine(&path, 2);

    let text = observe(
        &engine,
        "execute_query",
        json!({"sql": "SELECT CompanyName FROM Customer ORDER BY CustomerID"}),
    )
    .await;
    assert_eq!(
        text,
        "[{\"CompanyName\":\"Bike World\"},{\"CompanyName\":\"Cycle Hub\"}]\n(Only the first 2 rows are shown.)"
    );

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_rejected_and_failed_queries() {
    let path = create_sales_db("errors");
    let engine = engine(&path, 50);

    let request = ToolRequest::parse("execute_query", &json!({"sql": "DROP TABLE Customer"})).unwrap();
    let outcome = dispatch(&engine, &request).await.unwrap();
    assert!(matches!(&outcome, ToolOutcome::Rejected(reason) if reason == "disallowed statement: DROP"));
    assert!(!outcome.is_execution_failure());

    let request =
        ToolRequest::parse("execute_query", &json!({"sql": "SELECT Nope FROM Customer"})).unwrap();
    let outcome = dispatch(&engine, &request).await.unwrap();
    assert!(outcome.is_execution_failure());
    assert!(outcome.observation().starts_with("Error: Query execution failed:"));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_every_declared_tool_parses() {
    let definitions = tool_definitions();
    assert_eq!(definitions.len(), 5);

    for definition in &definitions {
        let args = match definition.name.as_str() {
            "list_databases" => json!({}),
            "list_schemas" => json!({"database": "main"}),
            "list_tables" => json!({"database": "main", "schema": "main"}),
            "list_columns" => json!({"database": "main", "schema": "main", "table": "t"}),
            "execute_query" => json!({"sql": "SELECT 1"}),
            other => panic!("unexpected tool {other}"),
        };
        let request = ToolRequest::parse(&definition.name, &args).unwrap();
        assert_eq!(request.name(), definition.name);
        assert_eq!(definition.parameters["type"], "object");
    }
}
