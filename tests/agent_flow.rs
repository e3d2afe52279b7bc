//! Agent Orchestrator Tests
//!
//! Drives full turns against a real `SQLite` file with a scripted language
//! model standing in for the chat-completions endpoint. Covers:
//! - Schema lookup, query, answer
//! - Rejected queries fed back to the model
//! - Hop bound and repeated-failure bound
//! - Model outages and timeouts leaving the conversation untouched
//! - The interactive loop

#![cfg(feature = "sqlite")]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;

use askdb::agent::{system_prompt, Agent, AgentSettings, TurnOutcome, TurnState};
use askdb::engine::sqlite::SqliteEngine;
use askdb::llm::{ChatMessage, LanguageModel, ModelReply, Role, TokenSink, ToolCall, ToolDefinition};
use askdb::{repl, AskError, ConnectionConfig, DatabaseEngine, QueryLimits, Result};

// ============================================================================
// Test Helpers
// ============================================================================

fn create_customers_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("askdb_agent_{name}.db"));
    let _ = std::fs::remove_file(&path);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Customers (CustomerID INTEGER PRIMARY KEY, Name TEXT NOT NULL, City TEXT);
         INSERT INTO Customers (Name, City) VALUES ('Alice', 'Seattle');
         INSERT INTO Customers (Name, City) VALUES ('Bob', 'Seattle');
         INSERT INTO Customers (Name, City) VALUES ('Carol', 'Portland');",
    )
    .unwrap();

    path
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
}

fn engine_for(path: &PathBuf) -> SqliteEngine {
    SqliteEngine::new(ConnectionConfig::sqlite(path.clone()), QueryLimits::default()).unwrap()
}

fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall { id: id.to_string(), name: name.to_string(), arguments }
}

/// Replays canned replies and records every request it receives
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    calls: AtomicUsize,
    /// Reply used once the script runs out
    fallback: Option<ModelReply>,
    /// How long each request takes before replying
    delay: Option<Duration>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<ModelReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fallback: None,
            delay: None,
        }
    }

    fn stalled(delay: Duration, reply: ModelReply) -> Self {
        Self { delay: Some(delay), ..Self::new(vec![Ok(reply)]) }
    }

    fn repeating(reply: ModelReply) -> Self {
        Self { fallback: Some(reply), ..Self::new(Vec::new()) }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> Vec<ChatMessage> {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        sink: &mut dyn TokenSink,
    ) -> Result<ModelReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.replies.lock().unwrap().pop_front();
        let reply = match (next, &self.fallback) {
            (Some(reply), _) => reply?,
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => ModelReply::text("(script exhausted)"),
        };

        // Stream the answer text word by word
        for (i, word) in reply.content.split(' ').enumerate() {
            if i > 0 {
                sink.token(" ");
            }
            sink.token(word);
        }

        Ok(reply)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn agent_with(
    path: &PathBuf,
    model: ScriptedModel,
    settings: AgentSettings,
) -> Agent<SqliteEngine, ScriptedModel> {
    let prompt = system_prompt("SQLite", Some("main"), None);
    Agent::new(engine_for(path), model, prompt, settings)
}

fn customer_count(path: &PathBuf) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM Customers", [], |row| row.get(0)).unwrap()
}

// ============================================================================
// Successful Turns
// ============================================================================

#[tokio::test]
async fn test_lookup_then_query_then_answer() {
    let path = create_customers_db("seattle");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::tools(vec![call(
            "call_1",
            "list_tables",
            json!({"database": "main", "schema": "main"}),
        )])),
        Ok(ModelReply::tools(vec![call(
            "call_2",
            "execute_query",
            json!({"sql": "SELECT COUNT(*) AS n FROM Customers WHERE City = 'Seattle'"}),
        )])),
        Ok(ModelReply::text("There are 2 customers in Seattle.")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut streamed = String::new();
    let outcome = agent.ask("How many customers are in Seattle?", &mut streamed).await.unwrap();

    assert!(matches!(&outcome, TurnOutcome::Answered(text) if text == "There are 2 customers in Seattle."));
    assert_eq!(streamed, "There are 2 customers in Seattle.");
    assert_eq!(agent.state(), TurnState::AwaitingUserInput);

    // The model saw both tool results before answering
    let last = agent.model().last_request();
    let tool_results: Vec<&str> = last
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(tool_results, vec!["Tables in 'main':\n- Customers", r#"[{"n":2}]"#]);

    // system, user, assistant(tool), tool, assistant(tool), tool, assistant
    assert_eq!(agent.conversation().len(), 7);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_follow_up_sees_previous_turns() {
    let path = create_customers_db("follow_up");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::text("There are 3 customers.")),
        Ok(ModelReply::text("Two of them live in Seattle.")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut sink = String::new();
    agent.ask("How many customers are there?", &mut sink).await.unwrap();
    agent.ask("And in Seattle?", &mut sink).await.unwrap();

    assert_eq!(agent.conversation().user_turns(), 2);
    let contents: Vec<&str> =
        agent.conversation().messages().iter().skip(1).map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "How many customers are there?",
            "There are 3 customers.",
            "And in Seattle?",
            "Two of them live in Seattle."
        ]
    );

    agent.reset();
    assert!(agent.conversation().is_empty());

    cleanup_db(&path);
}

// ============================================================================
// Rejections and Failures
// ============================================================================

#[tokio::test]
async fn test_rejected_query_is_fed_back_and_database_untouched() {
    let path = create_customers_db("rejected");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::tools(vec![call("call_1", "execute_query", json!({"sql": "DELETE FROM Customers"}))])),
        Ok(ModelReply::tools(vec![call(
            "call_2",
            "execute_query",
            json!({"sql": "```sql\nSELECT COUNT(*) AS n FROM Customers\n```"}),
        )])),
        Ok(ModelReply::text("There are 3 customers.")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut sink = String::new();
    let outcome = agent.ask("Remove everyone, then count", &mut sink).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Answered(_)));

    let tool_results: Vec<String> = agent
        .conversation()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.content.clone())
        .collect();
    assert!(tool_results[0].starts_with("Error: query rejected:"));
    assert!(tool_results[0].contains("Only a single read-only SELECT statement is allowed."));
    assert_eq!(tool_results[1], r#"[{"n":3}]"#);

    assert_eq!(customer_count(&path), 3);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_hop_bound_ends_turn_gracefully() {
    let path = create_customers_db("hop_bound");

    let model = ScriptedModel::repeating(ModelReply::tools(vec![call(
        "call_x",
        "execute_query",
        json!({"sql": "DROP TABLE Customers"}),
    )]));
    let settings = AgentSettings { max_hops: 3, ..AgentSettings::default() };
    let mut agent = agent_with(&path, model, settings);

    let mut sink = String::new();
    let outcome = agent.ask("Please drop the table", &mut sink).await.unwrap();

    match &outcome {
        TurnOutcome::GaveUp(AskError::ToolLoopExceeded { hops }) => assert_eq!(*hops, 3),
        other => panic!("expected ToolLoopExceeded, got {other:?}"),
    }
    assert!(outcome.message().contains("within 3 steps"));

    // Three executed hops, then the fourth request is refused
    assert_eq!(agent.model().call_count(), 4);

    // Only the question and the apology stay in the history
    let messages = agent.conversation().messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[2].role, Role::Assistant);

    assert_eq!(customer_count(&path), 3);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_repeated_execution_failures_give_up() {
    let path = create_customers_db("failures");

    let model = ScriptedModel::repeating(ModelReply::tools(vec![call(
        "call_x",
        "execute_query",
        json!({"sql": "SELECT * FROM Orders"}),
    )]));
    let settings = AgentSettings { max_query_failures: 2, ..AgentSettings::default() };
    let mut agent = agent_with(&path, model, settings);

    let mut sink = String::new();
    let outcome = agent.ask("List the orders", &mut sink).await.unwrap();

    assert!(matches!(outcome, TurnOutcome::GaveUp(AskError::ExecutionFailed(_))));
    assert_eq!(outcome.message(), "I couldn't retrieve that information.");
    assert_eq!(agent.model().call_count(), 2);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_model() {
    let path = create_customers_db("unknown_tool");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::tools(vec![call("call_1", "drop_table", json!({"table": "Customers"}))])),
        Ok(ModelReply::text("I can only read data.")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut sink = String::new();
    agent.ask("Drop the customers table", &mut sink).await.unwrap();

    let last = agent.model().last_request();
    let tool = last.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool.content, "Error: Invalid input: Unknown tool 'drop_table'");

    cleanup_db(&path);
}

#[tokio::test]
async fn test_model_outage_rolls_back_turn() {
    let path = create_customers_db("outage");

    let model = ScriptedModel::new(vec![
        Err(AskError::model_unavailable("connection refused")),
        Ok(ModelReply::text("There are 3 customers.")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut sink = String::new();
    let err = agent.ask("How many customers?", &mut sink).await.unwrap_err();
    assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
    assert!(agent.conversation().is_empty());

    // The session continues with the next question
    let outcome = agent.ask("How many customers?", &mut sink).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Answered(_)));
    assert_eq!(agent.conversation().len(), 3);

    cleanup_db(&path);
}

#[tokio::test(start_paused = true)]
async fn test_model_timeout_rolls_back_turn() {
    let path = create_customers_db("model_timeout");

    let model = ScriptedModel::stalled(Duration::from_secs(60), ModelReply::text("Too late."));
    let settings = AgentSettings { model_timeout: Duration::from_secs(5), ..AgentSettings::default() };
    let mut agent = agent_with(&path, model, settings);
    let before = agent.conversation().len();

    let mut sink = String::new();
    let err = agent.ask("How many customers?", &mut sink).await.unwrap_err();

    assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
    assert_eq!(err.message(), "Language model unavailable: scripted did not respond within 5s");
    assert_eq!(agent.conversation().len(), before);
    assert_eq!(agent.state(), TurnState::AwaitingUserInput);
    assert!(sink.is_empty());

    cleanup_db(&path);
}

#[tokio::test]
async fn test_missing_database_file_ends_turn() {
    let path = std::env::temp_dir().join("askdb_agent_does_not_exist.db");
    let _ = std::fs::remove_file(&path);

    let model = ScriptedModel::new(vec![Ok(ModelReply::tools(vec![call(
        "call_1",
        "execute_query",
        json!({"sql": "SELECT 1"}),
    )]))]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut sink = String::new();
    let err = agent.ask("Anything there?", &mut sink).await.unwrap_err();
    assert!(matches!(err, AskError::UpstreamUnavailable { .. }));
    assert!(!path.exists());
}

// ============================================================================
// Interactive Loop
// ============================================================================

#[tokio::test]
async fn test_repl_session() {
    let path = create_customers_db("repl");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::text("There are 3 customers.")),
        Err(AskError::model_unavailable("timeout")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let input = "How many customers?\n\n/clear\nAnd now?\nexit\nnever read\n";
    let mut output: Vec<u8> = Vec::new();
    repl::run(&mut agent, input.as_bytes(), &mut output).await.unwrap();

    let output = String::from_utf8(output).unwrap();
    assert!(output.contains("There are 3 customers.\n"));
    assert!(output.contains("Conversation cleared."));
    assert!(output.contains("Language model is unavailable right now. Please try again."));
    assert_eq!(agent.model().call_count(), 2);

    cleanup_db(&path);
}

#[tokio::test]
async fn test_single_question_reports_outcome() {
    let path = create_customers_db("single_question");

    let model = ScriptedModel::new(vec![
        Ok(ModelReply::text("There are 3 customers.")),
        Err(AskError::model_unavailable("connection refused")),
    ]);
    let mut agent = agent_with(&path, model, AgentSettings::default());

    let mut output: Vec<u8> = Vec::new();
    assert!(repl::answer_once(&mut agent, "How many customers?", &mut output).await.unwrap());
    assert!(!repl::answer_once(&mut agent, "And in Seattle?", &mut output).await.unwrap());

    let looping = ScriptedModel::repeating(ModelReply::tools(vec![call(
        "call_x",
        "list_databases",
        json!({}),
    )]));
    let settings = AgentSettings { max_hops: 1, ..AgentSettings::default() };
    let mut agent = agent_with(&path, looping, settings);
    assert!(!repl::answer_once(&mut agent, "Anything?", &mut output).await.unwrap());

    let output = String::from_utf8(output).unwrap();
    assert!(output.starts_with("There are 3 customers.\n"));
    assert!(output.contains("Language model is unavailable right now. Please try again.\n"));
    assert!(output.contains("within 1 steps"));

    cleanup_db(&path);
}

#[tokio::test]
async fn test_engine_is_reachable_from_agent() {
    let path = create_customers_db("engine_access");
    let agent = agent_with(&path, ScriptedModel::new(Vec::new()), AgentSettings::default());

    let tables = agent.engine().list_tables("main", "main").await.unwrap();
    assert_eq!(tables, vec!["Customers".to_string()]);

    cleanup_db(&path);
}
