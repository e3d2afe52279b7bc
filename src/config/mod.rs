//! Configuration Management
//!
//! This module loads, merges and resolves askdb settings: the database
//! connection, the language-model endpoint and the agent limits.
//!
//! # Configuration Locations
//! - Local: `.askdb/config.json` (per-project)
//! - Global: `<config_dir>/askdb/config.json` (per-user, via `dirs`)
//!
//! # Resolution Precedence
//! 1. Command-line flags (several fall back to `ASKDB_*` variables through clap)
//! 2. Environment variables, including the Azure OpenAI names
//!    (`AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_KEY`,
//!    `AZURE_OPENAI_DEPLOYMENT_NAME`) and `OPENAI_API_KEY`
//! 3. Local config file
//! 4. Global config file
//!
//! Secrets can be kept out of the files with `password_env` / `api_key_env`,
//! which name the environment variable to read instead.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentSettings;
use crate::engine::{ConnectionConfig, DatabaseType, QueryLimits};
use crate::error::{AskError, Result};
use crate::llm::{OpenAiClient, Provider};

pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Contents of a settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Database connection; a file that has one replaces a lower layer's entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<StoredConnection>,

    #[serde(default)]
    pub model: ModelSettings,

    #[serde(default)]
    pub agent: AgentLimits,
}

/// Stored connection configuration
///
/// Like `ConnectionConfig` but supports an environment variable reference
/// for the password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(flatten)]
    pub config: ConnectionConfig,

    /// Environment variable name for password (if not storing password directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl StoredConnection {
    /// Resolve `password_env` and return a `ConnectionConfig`
    pub fn resolve(&self, env: &dyn Fn(&str) -> Option<String>) -> Result<ConnectionConfig> {
        let mut config = self.config.clone();

        if let Some(env_var) = &self.password_env {
            let password = env(env_var).ok_or_else(|| {
                AskError::config_error(format!("Environment variable {env_var} not found for password"))
            })?;
            config.password = Some(password);
        }

        Ok(config)
    }
}

/// `model` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,

    /// Base URL (OpenAI) or resource endpoint (Azure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Model name (OpenAI) or deployment name (Azure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// WARNING: prefer `api_key_env`; a key stored here is plain text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// `agent` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hops: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_query_failures: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout_ms: Option<u64>,
}

impl Settings {
    /// Layer `over` on top of `self`; every value set in `over` wins
    #[must_use]
    pub fn merge(self, over: Self) -> Self {
        Self {
            connection: over.connection.or(self.connection),
            model: ModelSettings {
                provider: over.model.provider.or(self.model.provider),
                endpoint: over.model.endpoint.or(self.model.endpoint),
                model: over.model.model.or(self.model.model),
                api_version: over.model.api_version.or(self.model.api_version),
                api_key: over.model.api_key.or(self.model.api_key),
                api_key_env: over.model.api_key_env.or(self.model.api_key_env),
                temperature: over.model.temperature.or(self.model.temperature),
                timeout_secs: over.model.timeout_secs.or(self.model.timeout_secs),
            },
            agent: AgentLimits {
                max_hops: over.agent.max_hops.or(self.agent.max_hops),
                max_query_failures: over.agent.max_query_failures.or(self.agent.max_query_failures),
                max_rows: over.agent.max_rows.or(self.agent.max_rows),
                query_timeout_ms: over.agent.query_timeout_ms.or(self.agent.query_timeout_ms),
            },
        }
    }
}

/// Values given on the command line (or through their `ASKDB_*` fallbacks)
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub engine: Option<DatabaseType>,
    pub file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub provider: Option<Provider>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_hops: Option<usize>,
    pub max_rows: Option<usize>,
}

/// Everything needed to reach the model
#[derive(Clone, PartialEq)]
pub struct ModelConfig {
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub api_version: String,
    pub temperature: f32,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_version", &self.api_version)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl ModelConfig {
    /// Build the chat-completions client
    pub fn client(&self) -> Result<OpenAiClient> {
        let client = match self.provider {
            Provider::OpenAi => {
                OpenAiClient::openai(&self.endpoint, self.api_key.clone(), self.model.clone())?
            }
            Provider::Azure => OpenAiClient::azure(
                &self.endpoint,
                self.api_key.clone(),
                self.model.clone(),
                &self.api_version,
            )?,
        };
        Ok(client.with_temperature(self.temperature))
    }
}

/// Configuration file location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLocation {
    /// Local config: `.askdb/config.json`
    Local,
    /// Global config: `<config_dir>/askdb/config.json`
    Global,
}

/// Get path to local config file (`.askdb/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        AskError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".askdb").join("config.json"))
}

/// Get path to global config file (`<config_dir>/askdb/config.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AskError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("askdb").join("config.json"))
}

/// Path for a location
pub fn config_path(location: ConfigLocation) -> Result<PathBuf> {
    match location {
        ConfigLocation::Local => local_config_path(),
        ConfigLocation::Global => global_config_path(),
    }
}

/// Load settings from a file; a missing file yields empty settings
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| AskError::config_error(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents).map_err(|e| {
        AskError::config_error(format!("Invalid config file format in {}: {e}", path.display()))
    })
}

/// Save settings to a file, creating its directory
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AskError::config_error(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| AskError::config_error(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| AskError::config_error(format!("Could not write config file: {e}")))?;

    tracing::info!(path = %path.display(), "settings saved");
    Ok(())
}

/// Load global then local settings, local values winning
pub fn load_with_precedence() -> Result<Settings> {
    let global = load_settings(&global_config_path()?)?;
    let local = load_settings(&local_config_path()?)?;
    Ok(global.merge(local))
}

/// Process environment lookup
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Resolve the database connection
pub fn resolve_connection(
    settings: &Settings,
    overrides: &Overrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ConnectionConfig> {
    let stored = settings.connection.as_ref().map(|stored| stored.resolve(env)).transpose()?;

    let engine = overrides
        .engine
        .or_else(|| overrides.file.as_ref().map(|_| DatabaseType::SQLite))
        .or_else(|| stored.as_ref().map(|c| c.engine))
        .ok_or_else(|| {
            AskError::config_error(
                "No database connection configured. Run 'askdb init' or pass --engine / --file.",
            )
        })?;

    // Stored values only apply to the same engine
    let base = stored.filter(|c| c.engine == engine);
    let pick = |cli: &Option<String>, stored: Option<&String>| cli.clone().or_else(|| stored.cloned());

    let config = ConnectionConfig {
        engine,
        host: pick(&overrides.host, base.as_ref().and_then(|c| c.host.as_ref())),
        port: overrides.port.or_else(|| base.as_ref().and_then(|c| c.port)),
        user: pick(&overrides.user, base.as_ref().and_then(|c| c.user.as_ref())),
        password: pick(&overrides.password, base.as_ref().and_then(|c| c.password.as_ref())),
        database: pick(&overrides.database, base.as_ref().and_then(|c| c.database.as_ref())),
        file: overrides.file.clone().or_else(|| base.as_ref().and_then(|c| c.file.clone())),
    };

    Ok(match engine {
        DatabaseType::SQLite => {
            if config.file.is_none() {
                return Err(AskError::config_error("SQLite connection requires a database file"));
            }
            config
        }
        DatabaseType::Postgres => with_server_defaults(config, 5432),
        DatabaseType::MySQL => with_server_defaults(config, 3306),
    })
}

fn with_server_defaults(mut config: ConnectionConfig, port: u16) -> ConnectionConfig {
    config.host.get_or_insert_with(|| "localhost".to_string());
    config.port.get_or_insert(port);
    config
}

/// Resolve the language-model endpoint and credentials
pub fn resolve_model(
    settings: &Settings,
    overrides: &Overrides,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ModelConfig> {
    let file = &settings.model;

    let provider = overrides
        .provider
        .or(file.provider)
        .or_else(|| env("AZURE_OPENAI_ENDPOINT").map(|_| Provider::Azure))
        .unwrap_or_default();

    let (endpoint, model) = match provider {
        Provider::OpenAi => (
            overrides
                .endpoint
                .clone()
                .or_else(|| file.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_OPENAI_ENDPOINT.to_string()),
            overrides
                .model
                .clone()
                .or_else(|| file.model.clone())
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        ),
        Provider::Azure => (
            overrides
                .endpoint
                .clone()
                .or_else(|| env("AZURE_OPENAI_ENDPOINT"))
                .or_else(|| file.endpoint.clone())
                .ok_or_else(|| {
                    AskError::config_error(
                        "Azure OpenAI needs an endpoint (--endpoint or AZURE_OPENAI_ENDPOINT)",
                    )
                })?,
            overrides
                .model
                .clone()
                .or_else(|| env("AZURE_OPENAI_DEPLOYMENT_NAME"))
                .or_else(|| file.model.clone())
                .ok_or_else(|| {
                    AskError::config_error(
                        "Azure OpenAI needs a deployment name (--model or AZURE_OPENAI_DEPLOYMENT_NAME)",
                    )
                })?,
        ),
    };

    let api_key = resolve_api_key(file, provider, env)?;

    Ok(ModelConfig {
        provider,
        endpoint,
        model,
        api_key,
        api_version: file
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        temperature: overrides.temperature.or(file.temperature).unwrap_or(0.0),
    })
}

fn resolve_api_key(
    file: &ModelSettings,
    provider: Provider,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<String> {
    if let Some(key) = env("ASKDB_API_KEY") {
        return Ok(key);
    }

    if let Some(env_var) = &file.api_key_env {
        return env(env_var).ok_or_else(|| {
            AskError::config_error(format!("Environment variable {env_var} not found for API key"))
        });
    }

    let provider_var = match provider {
        Provider::OpenAi => "OPENAI_API_KEY",
        Provider::Azure => "AZURE_OPENAI_API_KEY",
    };

    env(provider_var).or_else(|| file.api_key.clone()).ok_or_else(|| {
        AskError::config_error(format!("No API key found. Set {provider_var} or ASKDB_API_KEY."))
    })
}

/// Resolve the per-turn and per-query limits
#[must_use]
pub fn resolve_limits(settings: &Settings, overrides: &Overrides) -> (AgentSettings, QueryLimits) {
    let defaults = AgentSettings::default();
    let query_defaults = QueryLimits::default();
    let file = &settings.agent;

    let agent = AgentSettings {
        max_hops: overrides.max_hops.or(file.max_hops).unwrap_or(defaults.max_hops),
        max_query_failures: file.max_query_failures.unwrap_or(defaults.max_query_failures),
        model_timeout: settings
            .model
            .timeout_secs
            .map_or(defaults.model_timeout, Duration::from_secs),
    };

    let limits = QueryLimits {
        max_rows: overrides.max_rows.or(file.max_rows).unwrap_or(query_defaults.max_rows),
        timeout_ms: file.query_timeout_ms.or(query_defaults.timeout_ms),
    };

    (agent, limits)
}
