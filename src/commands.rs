//! Caller-facing operations.
//!
//! 1. `NoteScheduler::from_config`: wire store, LLM backend and loop from configuration
//! 2. `evaluate_note`: one evaluation, always returns an `Outcome`
//! 3. `maybe_evaluate_note`: form hook: only runs when agentic updates are enabled
//! 4. `evaluate_note_async`: same as (2) on a blocking thread

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig, LlmBackend, DEFAULT_MAX_RETRIES};
use crate::llm::ollama::validate_model_name;
use crate::llm::{LlmClient, LlmError, OllamaClient, OpenAiClient};
use crate::scheduling::{
    CorrectionLoop, EvaluateOptions, LlmNoteInterpreter, NoteInterpreter, Outcome,
    PatientAppointmentStore, ReferenceContext, SchedulingError, SqliteAppointmentStore,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM backend error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] SchedulingError),
}

/// A configured decision engine.
pub struct NoteScheduler {
    correction: CorrectionLoop,
    timeout: Option<Duration>,
}

impl NoteScheduler {
    /// Assemble from explicit collaborators.
    pub fn new(
        interpreter: Arc<dyn NoteInterpreter>,
        store: Arc<dyn PatientAppointmentStore>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            correction: CorrectionLoop::new(interpreter, store),
            timeout,
        }
    }

    /// Open the SQLite store and the configured LLM backend.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let llm = build_llm_client(config)?;
        let store: Arc<dyn PatientAppointmentStore> =
            Arc::new(SqliteAppointmentStore::open(&config.database_path)?);
        let interpreter = LlmNoteInterpreter::new(llm, config.model_name.clone())
            .with_store(store.clone());

        tracing::info!(
            backend = ?config.backend,
            model = %config.model_name,
            db = %config.database_path.display(),
            "Note scheduler ready"
        );

        Ok(Self::new(Arc::new(interpreter), store, config.evaluation_timeout()))
    }

    pub fn store(&self) -> &Arc<dyn PatientAppointmentStore> {
        self.correction.store()
    }

    pub fn evaluate(&self, note: &str, reference: &ReferenceContext, max_retries: u32) -> Outcome {
        self.correction.evaluate_with(
            note,
            reference,
            EvaluateOptions {
                max_retries,
                timeout: self.timeout,
            },
        )
    }
}

/// Instantiate the LLM client selected by `config.backend`.
pub fn build_llm_client(config: &EngineConfig) -> Result<Arc<dyn LlmClient>, EngineError> {
    match config.backend {
        LlmBackend::Ollama => {
            validate_model_name(&config.model_name)?;
            Ok(Arc::new(OllamaClient::new(&config.base_url, config.llm_timeout_secs)?))
        }
        LlmBackend::OpenAi => {
            let key = config
                .api_key
                .as_deref()
                .ok_or_else(|| ConfigError::MissingKey("OPENAI_API_KEY".into()))?;
            Ok(Arc::new(OpenAiClient::new(
                &config.base_url,
                key,
                config.llm_timeout_secs,
            )?))
        }
    }
}

/// Evaluate one note for one patient. Pass [`DEFAULT_MAX_RETRIES`] unless the
/// caller has a reason to allow more or fewer corrections.
pub fn evaluate_note(
    engine: &NoteScheduler,
    note: &str,
    patient_id: &str,
    current_appointment_date: NaiveDate,
    max_retries: u32,
) -> Outcome {
    let reference = ReferenceContext {
        patient_id: patient_id.to_string(),
        current_appointment_date,
    };
    engine.evaluate(note, &reference, max_retries)
}

/// Visit form payload as submitted by the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateNoteRequest {
    pub patient_id: String,
    pub current_appointment_date: NaiveDate,
    /// The doctor's free-text comments. Visit forms post this field as `comments`.
    #[serde(default, alias = "comments")]
    pub note: String,
    /// Form checkbox: `"on"` / `true` when the doctor opted in.
    #[serde(default)]
    pub agentic_updates: Option<serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl EvaluateNoteRequest {
    pub fn agentic_updates_enabled(&self) -> bool {
        match &self.agentic_updates {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "on" | "true" | "1" | "yes")
            }
            _ => false,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

/// Evaluate only when the doctor enabled agentic updates and wrote a note.
pub fn maybe_evaluate_note(engine: &NoteScheduler, request: &EvaluateNoteRequest) -> Option<Outcome> {
    if !request.agentic_updates_enabled() {
        tracing::debug!(patient_id = %request.patient_id, "Agentic updates disabled, skipping note");
        return None;
    }
    if request.note.trim().is_empty() {
        tracing::debug!(patient_id = %request.patient_id, "Empty note, skipping");
        return None;
    }
    Some(evaluate_note(
        engine,
        &request.note,
        &request.patient_id,
        request.current_appointment_date,
        request.max_retries(),
    ))
}

/// [`evaluate_note`] on the blocking pool; LLM and SQLite calls block.
///
/// An engine built on reqwest's blocking clients must have its last `Arc`
/// dropped outside the async runtime.
pub async fn evaluate_note_async(
    engine: Arc<NoteScheduler>,
    note: String,
    patient_id: String,
    current_appointment_date: NaiveDate,
    max_retries: u32,
) -> Outcome {
    tokio::task::spawn_blocking(move || {
        evaluate_note(&engine, &note, &patient_id, current_appointment_date, max_retries)
    })
    .await
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, "Evaluation task failed");
        Outcome::error(Uuid::new_v4(), 0, None, format!("Evaluation task failed: {e}"))
    })
}
