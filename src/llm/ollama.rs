use std::sync::LazyLock;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{LlmClient, LlmError};

/// Ollama HTTP client for local LLM inference.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    options: GenerationOptions,
}

/// Generation parameters for Ollama `/api/generate`.
///
/// Scheduling decisions must be reproducible, so the default is fully greedy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    /// None = model default.
    pub num_predict: Option<i32>,
    /// Context window size. None = model default.
    pub num_ctx: Option<u32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.9,
            top_k: 40,
            num_predict: Some(1024),
            num_ctx: None,
        }
    }
}

impl OllamaClient {
    /// Create a client for a local Ollama instance.
    /// Rejects non-loopback URLs: clinical notes never leave the machine through this backend.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        validate_base_url(base_url)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
            options: GenerationOptions::default(),
        })
    }

    /// Default Ollama instance at localhost:11434 with a 2-minute timeout.
    pub fn default_local() -> Result<Self, LlmError> {
        Self::new(crate::config::DEFAULT_OLLAMA_URL, crate::config::DEFAULT_LLM_TIMEOUT_SECS)
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a str,
    options: &'a GenerationOptions,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

impl LlmClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError> {
        validate_model_name(model)?;

        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            format: "json",
            options: &self.options,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| LlmError::from_transport(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;

        Ok(parsed.response)
    }

    fn backend_name(&self) -> &'static str {
        "ollama"
    }
}

/// Validate that a base URL points to localhost only.
/// Accepts: localhost, 127.0.0.1, [::1].
pub fn validate_base_url(url: &str) -> Result<(), LlmError> {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| LlmError::InvalidUrl(url.to_string()))?;

    let host = if after_scheme.starts_with('[') {
        after_scheme
            .split(']')
            .next()
            .unwrap_or("")
            .trim_start_matches('[')
    } else {
        after_scheme
            .split(':')
            .next()
            .unwrap_or("")
            .split('/')
            .next()
            .unwrap_or("")
    };

    match host {
        "localhost" | "127.0.0.1" | "::1" => Ok(()),
        "" => Err(LlmError::InvalidUrl(url.to_string())),
        _ => Err(LlmError::NonLocalEndpoint),
    }
}

static MODEL_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(/[a-zA-Z0-9][a-zA-Z0-9._-]*)?(:[a-zA-Z0-9._-]+)?$")
        .expect("static regex")
});

/// Validate a model name against the `[namespace/]model[:tag]` convention.
pub fn validate_model_name(name: &str) -> Result<(), LlmError> {
    if MODEL_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(LlmError::InvalidModelName(name.to_string()))
    }
}

/// Mock LLM client for testing: replays scripted responses in order,
/// repeating the last one once the script runs out. Records every prompt.
pub struct MockLlmClient {
    responses: Vec<Result<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self::scripted(vec![response])
    }

    pub fn scripted(responses: Vec<&str>) -> Self {
        Self {
            responses: responses.into_iter().map(|r| Ok(r.to_string())).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A client whose every call fails with a connection error.
    pub fn unreachable() -> Self {
        Self {
            responses: vec![Err("http://localhost:11434".to_string())],
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, _model: &str, prompt: &str, _system: &str) -> Result<String, LlmError> {
        let index = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| LlmError::HttpClient("mock lock poisoned".into()))?;
            calls.push(prompt.to_string());
            calls.len() - 1
        };
        let scripted = self
            .responses
            .get(index)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or_else(|| Ok(String::new()));
        scripted.map_err(LlmError::Connection)
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}
