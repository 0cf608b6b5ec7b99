//! Failure classes of one evaluation.
//!
//! Rule violations are not errors: they are reported through
//! `ValidationResult` and recovered by retrying. Everything here ends the
//! evaluation immediately.

use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Interpretation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Interpretation returned a malformed decision: {0}")]
    MalformedInterpretation(String),

    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    #[error("Next appointment of patient {patient_id} changed during evaluation (read {expected:?}, now {actual:?})")]
    AppointmentChanged {
        patient_id: String,
        expected: Option<NaiveDate>,
        actual: Option<NaiveDate>,
    },

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Evaluation exceeded its {}ms deadline", .0.as_millis())]
    Timeout(Duration),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl SchedulingError {
    /// Errors raised while producing a decision (the interpretation layer),
    /// as opposed to errors raised while applying one.
    pub fn is_interpretation_error(&self) -> bool {
        matches!(
            self,
            Self::Llm(_) | Self::MalformedInterpretation(_) | Self::InvalidTimeframe(_)
        )
    }
}

impl From<DatabaseError> for SchedulingError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity_type, id } if entity_type == "Patient" => {
                SchedulingError::PatientNotFound(id)
            }
            DatabaseError::AppointmentChanged {
                patient_id,
                expected,
                actual,
            } => SchedulingError::AppointmentChanged {
                patient_id,
                expected,
                actual,
            },
            other => SchedulingError::Database(other),
        }
    }
}
