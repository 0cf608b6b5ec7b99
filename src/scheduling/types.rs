//! Core types for one note evaluation.
//!
//! Lifecycle: ReferenceContext + ExistingAppointment → Interpretation
//! (ProposedDecision) → ValidationResult → Outcome.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ═══════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════

/// Immutable input scoped to one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceContext {
    pub patient_id: String,
    /// Date of the visit in which the note was written (today, for the engine).
    pub current_appointment_date: NaiveDate,
}

/// The patient's stored follow-up, read at evaluation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingAppointment {
    pub next_appointment_date: Option<NaiveDate>,
}

impl ExistingAppointment {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            next_appointment_date: Some(date),
        }
    }

    /// The stored date if it is still ahead of (or on) the visit date.
    /// Past appointments count as no appointment at all.
    pub fn upcoming(&self, current_appointment_date: NaiveDate) -> Option<NaiveDate> {
        self.next_appointment_date
            .filter(|date| *date >= current_appointment_date)
    }
}

// ═══════════════════════════════════════════
// Proposed decision (interpreter output)
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Update,
    NoUpdate,
    NoSuggestion,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::NoUpdate => "no_update",
            Self::NoSuggestion => "no_suggestion",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "update" => Some(Self::Update),
            "no_update" => Some(Self::NoUpdate),
            "no_suggestion" => Some(Self::NoSuggestion),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One interpretation attempt's (possibly wrong) decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedDecision {
    /// `None` iff the note carries no appointment-worthy suggestion.
    pub suggested_date: Option<NaiveDate>,
    /// What the interpreter believed the stored appointment to be.
    pub perceived_existing_date: Option<NaiveDate>,
    pub action: DecisionAction,
    pub rationale: String,
}

impl ProposedDecision {
    pub fn no_suggestion(rationale: impl Into<String>) -> Self {
        Self {
            suggested_date: None,
            perceived_existing_date: None,
            action: DecisionAction::NoSuggestion,
            rationale: rationale.into(),
        }
    }
}

/// What a single `NoteInterpreter::interpret` call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpretation {
    /// Natural-language explanation for the clinician.
    pub explanation: String,
    pub decision: ProposedDecision,
}

// ═══════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════

/// The deterministic rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    NoSuggestionConsistency,
    AbsentOrPastMustUpdate,
    EarliestWins,
    KeepEarlier,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuggestionConsistency => "no-suggestion consistency",
            Self::AbsentOrPastMustUpdate => "absent-or-past appointment must update",
            Self::EarliestWins => "earliest wins",
            Self::KeepEarlier => "keep earlier",
        }
    }
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// Human-readable sentence; fed verbatim to the next attempt.
    pub violation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<ValidationRule>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            valid: true,
            violation: None,
            rule: None,
        }
    }

    pub fn fail(rule: ValidationRule, violation: String) -> Self {
        Self {
            valid: false,
            violation: Some(violation),
            rule: Some(rule),
        }
    }
}

// ═══════════════════════════════════════════
// Outcome (caller-facing)
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    AppointmentUpdated,
    NoAction,
    ValidationFailed,
    Error,
}

impl ActionTaken {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppointmentUpdated => "appointment_updated",
            Self::NoAction => "no_action",
            Self::ValidationFailed => "validation_failed",
            Self::Error => "error",
        }
    }
}

/// Structured result of one evaluation. Every failure class ends up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub evaluation_id: Uuid,
    pub success: bool,
    pub action_taken: ActionTaken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_decision: Option<ProposedDecision>,
    pub attempts_used: u32,
    /// Stored date before this evaluation (when it was read).
    pub previous_appointment_date: Option<NaiveDate>,
    /// Stored date after this evaluation.
    pub next_appointment_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Last rule violation, on `validation_failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn error(
        evaluation_id: Uuid,
        attempts_used: u32,
        existing: Option<ExistingAppointment>,
        message: String,
    ) -> Self {
        let stored = existing.and_then(|e| e.next_appointment_date);
        Self {
            evaluation_id,
            success: false,
            action_taken: ActionTaken::Error,
            final_decision: None,
            attempts_used,
            previous_appointment_date: stored,
            next_appointment_date: stored,
            explanation: None,
            violation: None,
            error: Some(message),
        }
    }
}
