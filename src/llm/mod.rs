//! LLM clients used by the note interpreter.
//!
//! The engine only depends on the [`LlmClient`] trait; concrete backends
//! (local Ollama, OpenAI-compatible chat completions) are chosen by
//! configuration and injected at construction time.

pub mod ollama;
pub mod openai;
pub mod sanitize;

pub use ollama::{GenerationOptions, MockLlmClient, OllamaClient};
pub use openai::OpenAiClient;
pub use sanitize::{sanitize_llm_output, sanitize_note_for_llm};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM service is not reachable at {0}")]
    Connection(String),

    #[error("LLM service returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Only localhost connections are allowed for the Ollama backend")]
    NonLocalEndpoint,

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),

    #[error("Invalid model name: '{0}'")]
    InvalidModelName(String),
}

impl LlmError {
    /// Map a reqwest transport error onto the taxonomy.
    pub(crate) fn from_transport(err: reqwest::Error, base_url: &str, timeout_secs: u64) -> Self {
        if err.is_connect() {
            LlmError::Connection(base_url.to_string())
        } else if err.is_timeout() {
            LlmError::Timeout(timeout_secs)
        } else {
            LlmError::HttpClient(err.to_string())
        }
    }
}

/// Text-generation client abstraction (allows mocking).
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt` under the `system` instructions.
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError>;

    /// Short backend label for logs.
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_client_is_object_safe() {
        fn _assert(_: &dyn LlmClient) {}
    }

    #[test]
    fn error_messages_are_sentences() {
        let errors = vec![
            LlmError::Connection("http://localhost:11434".into()),
            LlmError::Api { status: 500, body: "boom".into() },
            LlmError::Timeout(120),
            LlmError::NonLocalEndpoint,
            LlmError::InvalidModelName("../x".into()),
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(msg.len() > 10, "Error message too short: {msg}");
        }
    }
}
