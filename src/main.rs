//! askdb CLI Entry Point
//!
//! Subcommands:
//! - `chat` - ask questions in plain language (interactive, or one `--question`)
//! - `validate` - check SQL against the read-only rules
//! - `query` - validate and execute SQL directly
//! - `schema` - print the schema snapshot
//! - `init` - write a settings file interactively
//!
//! Answers and JSON go to stdout. Logs go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use askdb::agent::{system_prompt, Agent};
use askdb::config::{
    self, ConfigLocation, ModelSettings, Overrides, Settings, StoredConnection,
};
use askdb::engine::{AnyEngine, ConnectionConfig, DatabaseEngine, DatabaseType};
use askdb::llm::Provider;
use askdb::output::{to_json_line, ErrorEnvelope, Metadata, SuccessEnvelope};
use askdb::schema::SchemaSnapshot;
use askdb::validator::{validate, Verdict};
use askdb::{repl, AskError};

/// Ask questions of a SQL database in plain language
#[derive(Parser)]
#[command(name = "askdb")]
#[command(about = "Ask questions of a SQL database in plain language, read-only")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args)]
struct GlobalArgs {
    /// Log debug detail to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Database engine (postgres, mysql, sqlite)
    #[arg(long, env = "ASKDB_ENGINE", global = true)]
    engine: Option<DatabaseType>,

    /// SQLite database file
    #[arg(long, env = "ASKDB_DB_FILE", global = true)]
    file: Option<PathBuf>,

    #[arg(long, env = "ASKDB_DB_HOST", global = true)]
    host: Option<String>,

    #[arg(long, env = "ASKDB_DB_PORT", global = true)]
    port: Option<u16>,

    #[arg(long, env = "ASKDB_DB_USER", global = true)]
    user: Option<String>,

    #[arg(long, env = "ASKDB_DB_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Database to connect to
    #[arg(long, env = "ASKDB_DB_NAME", global = true)]
    database: Option<String>,

    /// Model provider (openai, azure)
    #[arg(long, env = "ASKDB_MODEL_PROVIDER", global = true)]
    provider: Option<Provider>,

    /// Model endpoint URL
    #[arg(long, env = "ASKDB_MODEL_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Model name (OpenAI) or deployment name (Azure)
    #[arg(long, env = "ASKDB_MODEL", global = true)]
    model: Option<String>,

    #[arg(long, global = true)]
    temperature: Option<f32>,

    /// Maximum tool calls per question
    #[arg(long, global = true)]
    max_hops: Option<usize>,

    /// Maximum rows returned per query
    #[arg(long, global = true)]
    max_rows: Option<usize>,
}

impl GlobalArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            engine: self.engine,
            file: self.file.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            provider: self.provider,
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_hops: self.max_hops,
            max_rows: self.max_rows,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ask questions about the database
    Chat {
        /// Answer one question and exit
        #[arg(long, short)]
        question: Option<String>,

        /// Put the full schema into the system prompt up front
        #[arg(long)]
        preload_schema: bool,

        /// Text file describing the schema, put into the system prompt
        #[arg(long, conflicts_with = "preload_schema")]
        schema_file: Option<PathBuf>,
    },

    /// Check SQL against the read-only rules without running it
    Validate {
        sql: String,
    },

    /// Validate and execute SQL, printing a JSON envelope
    Query {
        sql: String,
    },

    /// Print the schema snapshot
    Schema {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write a settings file interactively
    Init {
        /// Write the per-user settings instead of `.askdb/config.json`
        #[arg(long)]
        global: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "askdb=debug" } else { "askdb=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let overrides = cli.global.overrides();

    match cli.command {
        Commands::Validate { sql } => Ok(run_validate(&sql)),
        Commands::Init { global } => {
            run_init(global)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Query { sql } => {
            let settings = config::load_with_precedence()?;
            Ok(run_query(&settings, &overrides, &sql).await)
        }
        Commands::Schema { json } => {
            let settings = config::load_with_precedence()?;
            run_schema(&settings, &overrides, json).await
        }
        Commands::Chat { question, preload_schema, schema_file } => {
            let settings = config::load_with_precedence()?;
            run_chat(&settings, &overrides, question, preload_schema, schema_file).await
        }
    }
}

fn run_validate(sql: &str) -> ExitCode {
    let start = Instant::now();
    let verdict = validate(sql);
    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let accepted = verdict.is_accepted();

    println!("{}", to_json_line(&SuccessEnvelope::new("", "validate", verdict, Metadata::new(elapsed))));

    if accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_query(settings: &Settings, overrides: &Overrides, sql: &str) -> ExitCode {
    let connection = match config::resolve_connection(settings, overrides, &config::process_env) {
        Ok(connection) => connection,
        Err(err) => return print_error("", "query", &err),
    };
    let engine_name = connection.engine.as_str();

    if let Verdict::Rejected(reason) = validate(sql) {
        return print_error(engine_name, "query", &AskError::validation_rejected(reason));
    }

    let (_, limits) = config::resolve_limits(settings, overrides);
    let result = match AnyEngine::from_config(connection, limits) {
        Ok(engine) => engine.execute(sql).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(result) => {
            println!("{}", to_json_line(&SuccessEnvelope::query(engine_name, result)));
            ExitCode::SUCCESS
        }
        Err(err) => print_error(engine_name, "query", &err),
    }
}

fn print_error(engine: &str, command: &str, err: &AskError) -> ExitCode {
    tracing::debug!(error = %err, "{command} failed");
    println!("{}", to_json_line(&ErrorEnvelope::from_error(engine, command, err)));
    ExitCode::FAILURE
}

async fn run_schema(settings: &Settings, overrides: &Overrides, json: bool) -> Result<ExitCode> {
    let connection = config::resolve_connection(settings, overrides, &config::process_env)?;
    let engine_name = connection.engine.as_str();
    let database = connection.database.clone();
    let (_, limits) = config::resolve_limits(settings, overrides);

    let start = Instant::now();
    let snapshot = match AnyEngine::from_config(connection, limits) {
        Ok(engine) => SchemaSnapshot::capture(&engine, database.as_deref()).await,
        Err(err) => Err(err),
    };

    match (snapshot, json) {
        (Ok(snapshot), true) => {
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            let envelope = SuccessEnvelope::new(engine_name, "schema", snapshot, Metadata::new(elapsed));
            println!("{}", to_json_line(&envelope));
            Ok(ExitCode::SUCCESS)
        }
        (Ok(snapshot), false) => {
            print!("{}", snapshot.to_prompt_text());
            Ok(ExitCode::SUCCESS)
        }
        (Err(err), true) => Ok(print_error(engine_name, "schema", &err)),
        (Err(err), false) => Err(err.into()),
    }
}

async fn run_chat(
    settings: &Settings,
    overrides: &Overrides,
    question: Option<String>,
    preload_schema: bool,
    schema_file: Option<PathBuf>,
) -> Result<ExitCode> {
    let connection = config::resolve_connection(settings, overrides, &config::process_env)?;
    let model_config = config::resolve_model(settings, overrides, &config::process_env)?;
    let (agent_settings, limits) = config::resolve_limits(settings, overrides);

    let dialect = connection.engine.dialect();
    let database = connection.database.clone();
    let engine = AnyEngine::from_config(connection, limits)?;

    let grounding = if let Some(path) = schema_file {
        Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("Could not read schema file {}", path.display()))?,
        )
    } else if preload_schema {
        let snapshot = SchemaSnapshot::capture(&engine, database.as_deref()).await?;
        tracing::info!(tables = snapshot.table_count(), "schema preloaded");
        Some(snapshot.to_prompt_text())
    } else {
        None
    };

    let model = model_config.client()?;
    tracing::debug!(client = ?model, "model client ready");

    let prompt = system_prompt(dialect, database.as_deref(), grounding.as_deref());
    let mut agent = Agent::new(engine, model, prompt, agent_settings);

    let mut out = io::stdout();

    let answered = match question {
        Some(question) => repl::answer_once(&mut agent, &question, &mut out).await?,
        None => {
            repl::run(&mut agent, io::stdin().lock(), &mut out).await?;
            true
        }
    };

    out.flush()?;
    Ok(if answered { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_init(global: bool) -> Result<()> {
    let location = if global { ConfigLocation::Global } else { ConfigLocation::Local };
    let path = config::config_path(location)?;
    let mut settings = config::load_settings(&path)?;

    let engines = [DatabaseType::SQLite, DatabaseType::Postgres, DatabaseType::MySQL];
    let choice = Select::new()
        .with_prompt("Database engine")
        .items(&engines.iter().map(DatabaseType::dialect).collect::<Vec<_>>())
        .default(0)
        .interact()?;
    let engine = engines[choice];

    let stored = if engine == DatabaseType::SQLite {
        let file: String = Input::new().with_prompt("Database file").interact_text()?;
        StoredConnection { config: ConnectionConfig::sqlite(PathBuf::from(file)), password_env: None }
    } else {
        let default_port = if engine == DatabaseType::Postgres { 5432 } else { 3306 };
        let host: String = Input::new().with_prompt("Host").default("localhost".to_string()).interact_text()?;
        let port: u16 = Input::new().with_prompt("Port").default(default_port).interact_text()?;
        let user: String = Input::new().with_prompt("User").interact_text()?;
        let database: String = Input::new().with_prompt("Database").interact_text()?;
        let password_env: String = Input::new()
            .with_prompt("Environment variable holding the password (empty for none)")
            .allow_empty(true)
            .interact_text()?;

        StoredConnection {
            config: ConnectionConfig {
                engine,
                host: Some(host),
                port: Some(port),
                user: Some(user),
                password: None,
                database: Some(database),
                file: None,
            },
            password_env: Some(password_env).filter(|name| !name.is_empty()),
        }
    };
    settings.connection = Some(stored);

    let providers = [Provider::OpenAi, Provider::Azure];
    let choice = Select::new()
        .with_prompt("Model provider")
        .items(&["OpenAI", "Azure OpenAI"])
        .default(0)
        .interact()?;
    let provider = providers[choice];

    let (endpoint, model, key_env) = match provider {
        Provider::OpenAi => {
            let endpoint: String = Input::new()
                .with_prompt("Endpoint")
                .default(config::DEFAULT_OPENAI_ENDPOINT.to_string())
                .interact_text()?;
            let model: String = Input::new()
                .with_prompt("Model")
                .default(config::DEFAULT_OPENAI_MODEL.to_string())
                .interact_text()?;
            (endpoint, model, "OPENAI_API_KEY")
        }
        Provider::Azure => {
            let endpoint: String = Input::new().with_prompt("Azure OpenAI endpoint").interact_text()?;
            let model: String = Input::new().with_prompt("Deployment name").interact_text()?;
            (endpoint, model, "AZURE_OPENAI_API_KEY")
        }
    };

    let api_key_env: String = Input::new()
        .with_prompt("Environment variable holding the API key")
        .default(key_env.to_string())
        .interact_text()?;

    settings.model = ModelSettings {
        provider: Some(provider),
        endpoint: Some(endpoint),
        model: Some(model),
        api_key_env: Some(api_key_env),
        ..settings.model
    };

    if path.exists()
        && !Confirm::new()
            .with_prompt(format!("Overwrite {}?", path.display()))
            .default(true)
            .interact()?
    {
        eprintln!("Nothing written.");
        return Ok(());
    }

    config::save_settings(&path, &settings)?;
    eprintln!("Settings written to {}", path.display());
    Ok(())
}
