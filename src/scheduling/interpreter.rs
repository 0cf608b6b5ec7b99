//! LLM-backed `NoteInterpreter`.
//!
//! The model only reads the note: relative timeframes are resolved here with
//! `Timeframe::apply`, and the resulting decision is checked downstream by
//! `DecisionValidator`. Nothing the model says is trusted without that check.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;

use super::date_math::Timeframe;
use super::error::SchedulingError;
use super::prompt::{build_scheduling_prompt, SCHEDULING_SYSTEM_PROMPT};
use super::traits::{NoteInterpreter, PatientAppointmentStore};
use super::types::{DecisionAction, Interpretation, ProposedDecision};
use crate::llm::{sanitize_llm_output, sanitize_note_for_llm, LlmClient};

/// Date formats accepted from the model, tried in order.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];

pub struct LlmNoteInterpreter {
    llm: Arc<dyn LlmClient>,
    model: String,
    /// Optional read-only view used to show the model the stored date.
    store: Option<Arc<dyn PatientAppointmentStore>>,
}

impl LlmNoteInterpreter {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PatientAppointmentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn stored_next_appointment(&self, patient_id: &str) -> Option<Option<NaiveDate>> {
        let store = self.store.as_ref()?;
        match store.get_next_appointment(patient_id) {
            Ok(next) => Some(next),
            Err(e) => {
                tracing::warn!(patient_id, error = %e, "Stored appointment unavailable for prompt");
                None
            }
        }
    }
}

impl NoteInterpreter for LlmNoteInterpreter {
    fn interpret(
        &self,
        note: &str,
        patient_id: &str,
        current_appointment_date: NaiveDate,
        prior_feedback: Option<&str>,
    ) -> Result<Interpretation, SchedulingError> {
        let note = sanitize_note_for_llm(note, patient_id);
        if note.is_empty() {
            return Ok(Interpretation {
                explanation: "The note is empty; there is no follow-up suggestion.".to_string(),
                decision: ProposedDecision::no_suggestion("empty note"),
            });
        }

        let prompt = build_scheduling_prompt(
            &note,
            patient_id,
            current_appointment_date,
            self.stored_next_appointment(patient_id),
            prior_feedback,
        );

        let raw = self
            .llm
            .generate(&self.model, &prompt, SCHEDULING_SYSTEM_PROMPT)?;
        let cleaned = sanitize_llm_output(&raw);

        tracing::debug!(
            patient_id,
            backend = self.llm.backend_name(),
            response_len = cleaned.len(),
            retry = prior_feedback.is_some(),
            "Interpreter response received"
        );

        parse_interpretation(&cleaned, current_appointment_date)
    }
}

// ═══════════════════════════════════════════
// Response parsing
// ═══════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RawInterpretation {
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    suggested_date: Option<String>,
    #[serde(default)]
    timeframe: Option<RawTimeframe>,
    #[serde(default)]
    perceived_existing_date: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimeframe {
    /// Models emit both `"6"` and `6`.
    amount: serde_json::Value,
    unit: String,
}

/// Parse a model response into an `Interpretation`.
///
/// An explicit `suggested_date` wins over a `timeframe`; a timeframe is
/// resolved against the visit date.
pub(crate) fn parse_interpretation(
    response: &str,
    current_appointment_date: NaiveDate,
) -> Result<Interpretation, SchedulingError> {
    let json = extract_json_block(response)?;
    let raw: RawInterpretation = serde_json::from_str(json)
        .map_err(|e| SchedulingError::MalformedInterpretation(format!("invalid JSON: {e}")))?;

    let action_text = raw
        .action
        .as_deref()
        .ok_or_else(|| SchedulingError::MalformedInterpretation("missing 'action'".into()))?;
    let action = DecisionAction::from_str(action_text).ok_or_else(|| {
        SchedulingError::MalformedInterpretation(format!("unknown action '{action_text}'"))
    })?;

    let suggested_date = match parse_optional_date(raw.suggested_date.as_deref(), "suggested_date")? {
        Some(date) => Some(date),
        None => match raw.timeframe {
            Some(tf) if !tf.unit.trim().is_empty() => {
                let amount = match &tf.amount {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    other => {
                        return Err(SchedulingError::InvalidTimeframe(format!(
                            "amount {other} is not an integer"
                        )))
                    }
                };
                Some(Timeframe::from_parts(&amount, &tf.unit)?.apply(current_appointment_date)?)
            }
            _ => None,
        },
    };

    let perceived_existing_date =
        parse_optional_date(raw.perceived_existing_date.as_deref(), "perceived_existing_date")?;

    Ok(Interpretation {
        explanation: raw.explanation.unwrap_or_default(),
        decision: ProposedDecision {
            suggested_date,
            perceived_existing_date,
            action,
            rationale: raw.rationale.unwrap_or_default(),
        },
    })
}

fn parse_optional_date(value: Option<&str>, field: &str) -> Result<Option<NaiveDate>, SchedulingError> {
    let Some(text) = value.map(str::trim) else {
        return Ok(None);
    };
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .map(Some)
        .ok_or_else(|| {
            SchedulingError::MalformedInterpretation(format!("{field} '{text}' is not a calendar date"))
        })
}

/// Extract a JSON object from response text that may carry prose or code
/// fences around it.
fn extract_json_block(response: &str) -> Result<&str, SchedulingError> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') {
                return Ok(block);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return Ok(&trimmed[start..=end]);
        }
    }

    Err(SchedulingError::MalformedInterpretation(
        "no JSON object in model response".to_string(),
    ))
}
