use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "NoteScheduler";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retries granted after the first interpretation attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Per-request timeout for LLM calls, in seconds.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

/// Get the application data directory (~/NoteScheduler/).
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the patient appointment database.
pub fn default_database_path() -> PathBuf {
    app_data_dir().join("scheduler.db")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,note_scheduler=debug,reqwest=warn,hyper=warn"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be set when the openai backend is selected")]
    MissingKey(String),
}

/// Which LLM service backs the note interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// Local Ollama instance (`/api/generate`).
    Ollama,
    /// OpenAI-compatible chat completions endpoint.
    OpenAi,
}

impl LlmBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

/// Runtime configuration for the decision engine and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub backend: LlmBackend,
    pub model_name: String,
    pub base_url: String,
    /// Only required for the openai backend.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_retries: u32,
    /// Bound on a whole `evaluate` call. `None` = unbounded.
    pub evaluation_timeout_secs: Option<u64>,
    pub llm_timeout_secs: u64,
    pub database_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Ollama,
            model_name: DEFAULT_OLLAMA_MODEL.to_string(),
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            api_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            evaluation_timeout_secs: None,
            llm_timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            database_path: default_database_path(),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup (testable without
    /// touching the process environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("NOTE_SCHEDULER_LLM_BACKEND") {
            Some(raw) => LlmBackend::from_str(&raw).ok_or(ConfigError::InvalidValue {
                key: "NOTE_SCHEDULER_LLM_BACKEND".into(),
                value: raw,
            })?,
            None => LlmBackend::Ollama,
        };

        let (default_model, default_url) = match backend {
            LlmBackend::Ollama => (DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL),
            LlmBackend::OpenAi => (DEFAULT_OPENAI_MODEL, DEFAULT_OPENAI_URL),
        };
        let url_key = match backend {
            LlmBackend::Ollama => "OLLAMA_BASE_URL",
            LlmBackend::OpenAi => "OPENAI_BASE_URL",
        };

        let api_key = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty());
        if backend == LlmBackend::OpenAi && api_key.is_none() {
            return Err(ConfigError::MissingKey("OPENAI_API_KEY".into()));
        }

        let evaluation_timeout_secs = parse_optional::<u64>(&lookup, "NOTE_SCHEDULER_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0);

        Ok(Self {
            backend,
            model_name: lookup("MODEL_NAME").unwrap_or_else(|| default_model.to_string()),
            base_url: lookup(url_key).unwrap_or_else(|| default_url.to_string()),
            api_key,
            max_retries: parse_optional(&lookup, "NOTE_SCHEDULER_MAX_RETRIES")?
                .unwrap_or(DEFAULT_MAX_RETRIES),
            evaluation_timeout_secs,
            llm_timeout_secs: parse_optional(&lookup, "NOTE_SCHEDULER_LLM_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_LLM_TIMEOUT_SECS),
            database_path: lookup("NOTE_SCHEDULER_DB")
                .map(PathBuf::from)
                .unwrap_or_else(default_database_path),
        })
    }

    pub fn evaluation_timeout(&self) -> Option<Duration> {
        self.evaluation_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_optional<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
