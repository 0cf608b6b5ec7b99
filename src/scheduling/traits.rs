//! Collaborator boundaries of the decision engine.
//!
//! Both are injected into `CorrectionLoop` as `Arc<dyn ...>`, so tests
//! swap in deterministic doubles without touching process-wide state.

use chrono::NaiveDate;

use super::error::SchedulingError;
use super::types::Interpretation;

/// Turns a clinical note into a best-effort decision. Non-deterministic and
/// possibly wrong; must be safe to call repeatedly with the same note.
pub trait NoteInterpreter: Send + Sync {
    /// `prior_feedback` is the most recent rule violation, verbatim, when
    /// this is a retry.
    fn interpret(
        &self,
        note: &str,
        patient_id: &str,
        current_appointment_date: NaiveDate,
        prior_feedback: Option<&str>,
    ) -> Result<Interpretation, SchedulingError>;
}

/// Read/write access to a patient's single `next_appointment_date` field.
pub trait PatientAppointmentStore: Send + Sync {
    fn get_next_appointment(&self, patient_id: &str) -> Result<Option<NaiveDate>, SchedulingError>;

    /// Fails with `PatientNotFound` when the identifier does not resolve.
    fn set_next_appointment(&self, patient_id: &str, date: NaiveDate) -> Result<(), SchedulingError>;

    /// Write `date` only if the stored value still equals `expected`, as one
    /// atomic step. Fails with `AppointmentChanged` and writes nothing
    /// when another writer changed the value in between.
    fn replace_next_appointment(
        &self,
        patient_id: &str,
        expected: Option<NaiveDate>,
        date: NaiveDate,
    ) -> Result<(), SchedulingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify traits are object-safe (can be used as `dyn Trait`)
    #[test]
    fn traits_are_object_safe() {
        fn _assert_interpreter(_: &dyn NoteInterpreter) {}
        fn _assert_store(_: &dyn PatientAppointmentStore) {}
    }
}
