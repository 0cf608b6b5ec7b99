//! Correction loop: interpret → validate → apply, retrying with feedback.
//!
//! ```text
//! Attempting(0) ─pass─→ Succeeded ─→ apply effect
//!      │fail (k < max)
//!      ▼
//! Attempting(k+1) ... ─fail (k == max)─→ Exhausted
//!      │interpreter error / deadline
//!      ▼
//!    Failed
//! ```
//!
//! Transitions are one-way. The store is only written after `Succeeded`,
//! only for an `update` decision, and only if the stored date is still the
//! one the decision was validated against.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::error::SchedulingError;
use super::store::PatientLocks;
use super::traits::{NoteInterpreter, PatientAppointmentStore};
use super::types::*;
use super::validator::DecisionValidator;
use crate::config::DEFAULT_MAX_RETRIES;

/// Per-call knobs for [`CorrectionLoop::evaluate_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Bound on the whole call. `None` = unbounded.
    pub timeout: Option<Duration>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
        }
    }
}

/// Where an evaluation stands.
#[derive(Debug)]
pub enum LoopState {
    /// About to run attempt `attempt` (0-based), carrying the previous violation.
    Attempting {
        attempt: u32,
        feedback: Option<String>,
    },
    /// A decision passed validation; its effect has not been applied yet.
    Succeeded {
        attempts_used: u32,
        interpretation: Interpretation,
    },
    /// Every permitted attempt was rejected.
    Exhausted {
        attempts_used: u32,
        violation: String,
        last: Interpretation,
    },
    /// Interpretation failed or the deadline passed.
    Failed {
        attempts_used: u32,
        error: SchedulingError,
    },
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempting { .. })
    }
}

struct Deadline {
    at: Option<Instant>,
    budget: Duration,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
            budget: timeout.unwrap_or_default(),
        }
    }

    fn check(&self) -> Result<(), SchedulingError> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(SchedulingError::Timeout(self.budget)),
            _ => Ok(()),
        }
    }
}

pub struct CorrectionLoop {
    interpreter: Arc<dyn NoteInterpreter>,
    store: Arc<dyn PatientAppointmentStore>,
    validator: DecisionValidator,
    locks: PatientLocks,
}

impl CorrectionLoop {
    pub fn new(
        interpreter: Arc<dyn NoteInterpreter>,
        store: Arc<dyn PatientAppointmentStore>,
    ) -> Self {
        Self {
            interpreter,
            store,
            validator: DecisionValidator::new(),
            locks: PatientLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PatientAppointmentStore> {
        &self.store
    }

    /// Evaluate `note` with `max_retries` retries and no deadline.
    pub fn evaluate(&self, note: &str, reference: &ReferenceContext, max_retries: u32) -> Outcome {
        self.evaluate_with(
            note,
            reference,
            EvaluateOptions {
                max_retries,
                timeout: None,
            },
        )
    }

    /// Evaluate `note`. Never fails: every error class is mapped to an `Outcome`.
    pub fn evaluate_with(
        &self,
        note: &str,
        reference: &ReferenceContext,
        options: EvaluateOptions,
    ) -> Outcome {
        let evaluation_id = Uuid::new_v4();
        let deadline = Deadline::new(options.timeout);
        let patient_id = reference.patient_id.as_str();

        tracing::info!(
            %evaluation_id,
            patient_id,
            max_retries = options.max_retries,
            "Evaluating note"
        );

        let lock = match self.locks.handle(patient_id) {
            Ok(lock) => lock,
            Err(e) => return Outcome::error(evaluation_id, 0, None, e.to_string()),
        };
        let outcome = {
            // The guarded data is `()`, so a poisoned lock carries no broken state.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.evaluate_locked(evaluation_id, note, reference, options, &deadline)
        };
        self.locks.release(patient_id, lock);
        outcome
    }

    /// Body of an evaluation, run while the patient's lock is held.
    fn evaluate_locked(
        &self,
        evaluation_id: Uuid,
        note: &str,
        reference: &ReferenceContext,
        options: EvaluateOptions,
        deadline: &Deadline,
    ) -> Outcome {
        let patient_id = reference.patient_id.as_str();

        let existing = match self.store.get_next_appointment(patient_id) {
            Ok(next) => ExistingAppointment {
                next_appointment_date: next,
            },
            Err(e) => {
                tracing::warn!(%evaluation_id, patient_id, error = %e, "Could not read stored appointment");
                return Outcome::error(evaluation_id, 0, None, e.to_string());
            }
        };

        let mut state = LoopState::Attempting {
            attempt: 0,
            feedback: None,
        };
        let terminal = loop {
            state = match state {
                LoopState::Attempting { attempt, feedback } => self.step(
                    note,
                    reference,
                    &existing,
                    attempt,
                    feedback,
                    options.max_retries,
                    deadline,
                ),
                terminal => break terminal,
            };
        };

        self.finish(evaluation_id, reference, existing, terminal, deadline)
    }

    /// Run one attempt and return the next state.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        note: &str,
        reference: &ReferenceContext,
        existing: &ExistingAppointment,
        attempt: u32,
        feedback: Option<String>,
        max_retries: u32,
        deadline: &Deadline,
    ) -> LoopState {
        let patient_id = reference.patient_id.as_str();

        if let Err(error) = deadline.check() {
            return LoopState::Failed {
                attempts_used: attempt,
                error,
            };
        }

        let attempts_used = attempt + 1;
        let interpretation = match self.interpreter.interpret(
            note,
            patient_id,
            reference.current_appointment_date,
            feedback.as_deref(),
        ) {
            Ok(i) => i,
            Err(error) => {
                tracing::warn!(patient_id, attempt, error = %error, "Interpretation failed");
                return LoopState::Failed {
                    attempts_used,
                    error,
                };
            }
        };

        let decision = &interpretation.decision;
        if decision.perceived_existing_date.is_some()
            && decision.perceived_existing_date != existing.next_appointment_date
        {
            tracing::warn!(
                patient_id,
                attempt,
                perceived = ?decision.perceived_existing_date,
                stored = ?existing.next_appointment_date,
                "Interpreter misread the stored appointment"
            );
        }

        let result = self.validator.validate(decision, existing, reference);
        if result.valid {
            tracing::debug!(patient_id, attempt, action = %decision.action, "Decision accepted");
            return LoopState::Succeeded {
                attempts_used,
                interpretation,
            };
        }

        let violation = result.violation.unwrap_or_default();
        tracing::warn!(
            patient_id,
            attempt,
            rule = result.rule.map(|r| r.as_str()).unwrap_or("unknown"),
            action = %decision.action,
            "Decision rejected"
        );

        if attempt < max_retries {
            LoopState::Attempting {
                attempt: attempt + 1,
                feedback: Some(violation),
            }
        } else {
            LoopState::Exhausted {
                attempts_used,
                violation,
                last: interpretation,
            }
        }
    }

    /// Apply the effect of a terminal state and build the outcome.
    fn finish(
        &self,
        evaluation_id: Uuid,
        reference: &ReferenceContext,
        existing: ExistingAppointment,
        terminal: LoopState,
        deadline: &Deadline,
    ) -> Outcome {
        let patient_id = reference.patient_id.as_str();
        let stored = existing.next_appointment_date;

        match terminal {
            LoopState::Succeeded {
                attempts_used,
                interpretation,
            } => {
                let Interpretation {
                    explanation,
                    decision,
                } = interpretation;

                let (action_taken, next) = match (decision.action, decision.suggested_date) {
                    (DecisionAction::Update, Some(date)) => {
                        // Conditional on the value this evaluation validated
                        // against; another process may have written since.
                        let written = deadline.check().and_then(|_| {
                            self.store.replace_next_appointment(patient_id, stored, date)
                        });
                        if let Err(e) = written {
                            tracing::error!(%evaluation_id, patient_id, error = %e, "Appointment update failed");
                            return Outcome::error(evaluation_id, attempts_used, Some(existing), e.to_string());
                        }
                        tracing::info!(
                            %evaluation_id,
                            patient_id,
                            attempts_used,
                            previous = ?stored,
                            next = %date,
                            "Appointment updated"
                        );
                        (ActionTaken::AppointmentUpdated, Some(date))
                    }
                    _ => {
                        tracing::info!(
                            %evaluation_id,
                            patient_id,
                            attempts_used,
                            action = %decision.action,
                            "No appointment change"
                        );
                        (ActionTaken::NoAction, stored)
                    }
                };

                Outcome {
                    evaluation_id,
                    success: true,
                    action_taken,
                    final_decision: Some(decision),
                    attempts_used,
                    previous_appointment_date: stored,
                    next_appointment_date: next,
                    explanation: Some(explanation),
                    violation: None,
                    error: None,
                }
            }
            LoopState::Exhausted {
                attempts_used,
                violation,
                last,
            } => {
                tracing::warn!(%evaluation_id, patient_id, attempts_used, "Retries exhausted");
                Outcome {
                    evaluation_id,
                    success: false,
                    action_taken: ActionTaken::ValidationFailed,
                    final_decision: Some(last.decision),
                    attempts_used,
                    previous_appointment_date: stored,
                    next_appointment_date: stored,
                    explanation: Some(last.explanation),
                    violation: Some(violation),
                    error: None,
                }
            }
            LoopState::Failed {
                attempts_used,
                error,
            } => Outcome::error(evaluation_id, attempts_used, Some(existing), error.to_string()),
            LoopState::Attempting { attempt, .. } => Outcome::error(
                evaluation_id,
                attempt,
                Some(existing),
                "evaluation stopped before reaching a decision".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::InMemoryAppointmentStore;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn visit() -> ReferenceContext {
        ReferenceContext {
            patient_id: "3".into(),
            current_appointment_date: date(2024, 2, 15),
        }
    }

    fn decision(suggested: Option<NaiveDate>, action: DecisionAction) -> ProposedDecision {
        ProposedDecision {
            suggested_date: suggested,
            perceived_existing_date: None,
            action,
            rationale: "test".into(),
        }
    }

    enum Scripted {
        Decide(ProposedDecision),
        Fail,
        Slow(Duration, ProposedDecision),
    }

    /// Replays scripted results in order, repeating the last. Records feedback.
    struct ScriptedInterpreter {
        script: Vec<Scripted>,
        feedback: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedInterpreter {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script,
                feedback: Mutex::new(Vec::new()),
            })
        }

        fn always(d: ProposedDecision) -> Arc<Self> {
            Self::new(vec![Scripted::Decide(d)])
        }

        fn calls(&self) -> usize {
            self.feedback.lock().unwrap().len()
        }

        fn feedback(&self) -> Vec<Option<String>> {
            self.feedback.lock().unwrap().clone()
        }
    }

    impl NoteInterpreter for ScriptedInterpreter {
        fn interpret(
            &self,
            _note: &str,
            _patient_id: &str,
            _current: NaiveDate,
            prior_feedback: Option<&str>,
        ) -> Result<Interpretation, SchedulingError> {
            let index = {
                let mut fb = self.feedback.lock().unwrap();
                fb.push(prior_feedback.map(str::to_string));
                fb.len() - 1
            };
            let entry = self.script.get(index).or(self.script.last()).unwrap();
            let decision = match entry {
                Scripted::Decide(d) => d.clone(),
                Scripted::Fail => {
                    return Err(SchedulingError::MalformedInterpretation("garbage".into()))
                }
                Scripted::Slow(delay, d) => {
                    std::thread::sleep(*delay);
                    d.clone()
                }
            };
            Ok(Interpretation {
                explanation: "scripted".into(),
                decision,
            })
        }
    }

    fn engine(
        interpreter: Arc<ScriptedInterpreter>,
        next: Option<NaiveDate>,
    ) -> (CorrectionLoop, Arc<InMemoryAppointmentStore>) {
        let store = Arc::new(InMemoryAppointmentStore::new().with_patient("3", next));
        (CorrectionLoop::new(interpreter, store.clone()), store)
    }

    // ── Scenarios ─────────────────────────────────────────

    #[test]
    fn scenario_a_no_existing_appointment_is_created() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let (engine, store) = engine(interp, None);

        let outcome = engine.evaluate("Pap in 6 months", &visit(), 2);

        assert!(outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.previous_appointment_date, None);
        assert_eq!(outcome.next_appointment_date, Some(date(2024, 8, 15)));
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 8, 15)));
    }

    #[test]
    fn scenario_b_earlier_suggestion_moves_appointment() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 10, 15)), DecisionAction::Update));
        let (engine, store) = engine(interp, Some(date(2024, 12, 15)));

        let outcome = engine.evaluate("note", &visit(), 2);

        assert_eq!(outcome.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 10, 15)));
    }

    #[test]
    fn scenario_c_later_suggestion_keeps_appointment() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 12, 15)), DecisionAction::NoUpdate));
        let (engine, store) = engine(interp, Some(date(2024, 10, 15)));

        let outcome = engine.evaluate("note", &visit(), 2);

        assert!(outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::NoAction);
        assert_eq!(outcome.next_appointment_date, Some(date(2024, 10, 15)));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn scenario_d_no_suggestion_leaves_store_untouched() {
        let interp = ScriptedInterpreter::always(decision(None, DecisionAction::NoSuggestion));
        let (engine, store) = engine(interp, Some(date(2024, 10, 15)));

        let outcome = engine.evaluate("BP normal", &visit(), 2);

        assert!(outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::NoAction);
        assert_eq!(
            outcome.final_decision.unwrap().action,
            DecisionAction::NoSuggestion
        );
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn scenario_e_stale_appointment_is_replaced() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 9, 1)), DecisionAction::Update));
        let (engine, store) = engine(interp, Some(date(2024, 1, 1)));

        let outcome = engine.evaluate("note", &visit(), 2);

        assert_eq!(outcome.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 9, 1)));
    }

    // ── Retry behavior ────────────────────────────────────

    #[test]
    fn rejected_decision_is_retried_with_verbatim_feedback() {
        let interp = ScriptedInterpreter::new(vec![
            Scripted::Decide(decision(Some(date(2024, 10, 15)), DecisionAction::NoUpdate)),
            Scripted::Decide(decision(Some(date(2024, 10, 15)), DecisionAction::Update)),
        ]);
        let (engine, store) = engine(interp.clone(), Some(date(2024, 12, 15)));

        let outcome = engine.evaluate("note", &visit(), 2);

        assert!(outcome.success);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 10, 15)));

        let feedback = interp.feedback();
        assert_eq!(feedback[0], None);
        assert_eq!(
            feedback[1].as_deref(),
            Some(
                "Rule 'earliest wins' violated: suggested_date (2024-10-15) is earlier than \
                 next_appointment_date (2024-12-15), so action must be 'update', but got 'no_update'."
            )
        );
    }

    #[test]
    fn exhaustion_reports_last_violation() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 12, 15)), DecisionAction::Update));
        let (engine, store) = engine(interp.clone(), Some(date(2024, 10, 15)));

        let outcome = engine.evaluate("note", &visit(), 2);

        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::ValidationFailed);
        assert_eq!(outcome.attempts_used, 3);
        assert!(outcome.violation.unwrap().contains("keep earlier"));
        assert_eq!(interp.calls(), 3);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn zero_retries_allows_single_attempt() {
        let interp = ScriptedInterpreter::always(decision(None, DecisionAction::Update));
        let (engine, _store) = engine(interp.clone(), None);

        let outcome = engine.evaluate("note", &visit(), 0);

        assert_eq!(outcome.action_taken, ActionTaken::ValidationFailed);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(interp.calls(), 1);
    }

    #[test]
    fn interpretation_error_stops_without_retry() {
        let interp = ScriptedInterpreter::new(vec![
            Scripted::Decide(decision(None, DecisionAction::Update)),
            Scripted::Fail,
            Scripted::Decide(decision(Some(date(2024, 8, 15)), DecisionAction::Update)),
        ]);
        let (engine, store) = engine(interp.clone(), None);

        let outcome = engine.evaluate("note", &visit(), 5);

        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::Error);
        assert_eq!(outcome.attempts_used, 2);
        assert!(outcome.error.unwrap().contains("malformed"));
        assert_eq!(interp.calls(), 2);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn repeated_evaluation_does_not_advance_twice() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let (engine, store) = engine(interp, None);

        let first = engine.evaluate("Pap in 6 months", &visit(), 2);
        let after_first = store.get_next_appointment("3").unwrap();
        let second = engine.evaluate("Pap in 6 months", &visit(), 2);

        assert_eq!(first.action_taken, ActionTaken::AppointmentUpdated);
        assert_ne!(second.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(store.get_next_appointment("3").unwrap(), after_first);
        assert_eq!(store.write_count(), 1);
    }

    // ── Store and deadline failures ───────────────────────

    #[test]
    fn unknown_patient_is_error_outcome() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let (engine, _store) = engine(interp.clone(), None);
        let reference = ReferenceContext {
            patient_id: "404".into(),
            current_appointment_date: date(2024, 2, 15),
        };

        let outcome = engine.evaluate("note", &reference, 2);

        assert_eq!(outcome.action_taken, ActionTaken::Error);
        assert!(outcome.error.unwrap().contains("404"));
        assert_eq!(interp.calls(), 0);
    }

    #[test]
    fn expired_deadline_never_calls_interpreter() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let (engine, store) = engine(interp.clone(), None);

        let outcome = engine.evaluate_with(
            "note",
            &visit(),
            EvaluateOptions {
                max_retries: 2,
                timeout: Some(Duration::ZERO),
            },
        );

        assert_eq!(outcome.action_taken, ActionTaken::Error);
        assert_eq!(outcome.attempts_used, 0);
        assert_eq!(interp.calls(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn deadline_passed_during_attempt_skips_write() {
        let interp = ScriptedInterpreter::new(vec![Scripted::Slow(
            Duration::from_millis(50),
            decision(Some(date(2024, 8, 15)), DecisionAction::Update),
        )]);
        let (engine, store) = engine(interp, None);

        let outcome = engine.evaluate_with(
            "note",
            &visit(),
            EvaluateOptions {
                max_retries: 2,
                timeout: Some(Duration::from_millis(10)),
            },
        );

        assert_eq!(outcome.action_taken, ActionTaken::Error);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(store.get_next_appointment("3").unwrap(), None);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn sub_second_deadline_is_reported_in_milliseconds() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let (expired, _store) = engine(interp, None);

        let outcome = expired.evaluate_with(
            "note",
            &visit(),
            EvaluateOptions {
                max_retries: 0,
                timeout: Some(Duration::ZERO),
            },
        );
        assert!(outcome.error.unwrap().contains("0ms"));

        let interp = ScriptedInterpreter::new(vec![Scripted::Slow(
            Duration::from_millis(30),
            decision(Some(date(2024, 8, 15)), DecisionAction::Update),
        )]);
        let (slow, _store) = engine(interp, None);
        let outcome = slow.evaluate_with(
            "note",
            &visit(),
            EvaluateOptions {
                max_retries: 0,
                timeout: Some(Duration::from_millis(10)),
            },
        );
        let message = outcome.error.unwrap();
        assert!(message.contains("10ms"), "{message}");
    }

    /// Reads succeed, every write is refused.
    struct ReadOnlyStore;

    impl PatientAppointmentStore for ReadOnlyStore {
        fn get_next_appointment(&self, _patient_id: &str) -> Result<Option<NaiveDate>, SchedulingError> {
            Ok(None)
        }

        fn set_next_appointment(&self, patient_id: &str, _date: NaiveDate) -> Result<(), SchedulingError> {
            Err(SchedulingError::PatientNotFound(patient_id.to_string()))
        }

        fn replace_next_appointment(
            &self,
            patient_id: &str,
            _expected: Option<NaiveDate>,
            _date: NaiveDate,
        ) -> Result<(), SchedulingError> {
            Err(SchedulingError::PatientNotFound(patient_id.to_string()))
        }
    }

    #[test]
    fn rejected_write_is_error_outcome() {
        let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update));
        let engine = CorrectionLoop::new(interp.clone(), Arc::new(ReadOnlyStore));

        let outcome = engine.evaluate("Pap in 6 months", &visit(), 2);

        assert!(!outcome.success);
        assert_eq!(outcome.action_taken, ActionTaken::Error);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.next_appointment_date, None);
        assert!(outcome.error.unwrap().contains('3'));
        assert_eq!(interp.calls(), 1);
    }

    // ── Concurrency ───────────────────────────────────────

    /// Run `slow` first, then `fast` once `slow` is inside its attempt.
    fn race(slow: impl FnOnce() -> Outcome + Send, fast: impl FnOnce() -> Outcome + Send) -> (Outcome, Outcome) {
        std::thread::scope(|scope| {
            let first = scope.spawn(slow);
            std::thread::sleep(Duration::from_millis(50));
            let second = scope.spawn(fast);
            (first.join().unwrap(), second.join().unwrap())
        })
    }

    #[test]
    fn stale_decision_from_other_engine_is_not_written() {
        let store = Arc::new(InMemoryAppointmentStore::new().with_patient("3", None));
        let slow = CorrectionLoop::new(
            ScriptedInterpreter::new(vec![Scripted::Slow(
                Duration::from_millis(200),
                decision(Some(date(2024, 10, 15)), DecisionAction::Update),
            )]),
            store.clone(),
        );
        let fast = CorrectionLoop::new(
            ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update)),
            store.clone(),
        );

        let (late, early) = race(
            || slow.evaluate("note", &visit(), 0),
            || fast.evaluate("note", &visit(), 0),
        );

        assert_eq!(early.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(late.action_taken, ActionTaken::Error);
        assert!(late.error.unwrap().contains("changed"));
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 8, 15)));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn stale_decision_across_sqlite_connections_is_not_written() {
        use crate::db;
        use crate::models::Patient;
        use crate::scheduling::SqliteAppointmentStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appointments.db");
        let first = Arc::new(SqliteAppointmentStore::open(&path).unwrap());
        first
            .with_connection(|conn| {
                db::insert_patient(
                    conn,
                    &Patient {
                        id: "3".into(),
                        first_name: "Maria".into(),
                        last_name: "K".into(),
                        next_appointment_date: None,
                    },
                )
            })
            .unwrap();
        let second = Arc::new(SqliteAppointmentStore::open(&path).unwrap());

        let slow = CorrectionLoop::new(
            ScriptedInterpreter::new(vec![Scripted::Slow(
                Duration::from_millis(200),
                decision(Some(date(2024, 10, 15)), DecisionAction::Update),
            )]),
            first.clone(),
        );
        let fast = CorrectionLoop::new(
            ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::Update)),
            second,
        );

        let (late, early) = race(
            || slow.evaluate("note", &visit(), 0),
            || fast.evaluate("note", &visit(), 0),
        );

        assert_eq!(early.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(late.action_taken, ActionTaken::Error);
        assert_eq!(first.get_next_appointment("3").unwrap(), Some(date(2024, 8, 15)));
        let history = first
            .with_connection(|conn| db::list_appointment_changes(conn, "3"))
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn same_engine_serializes_evaluations_of_one_patient() {
        let interp = ScriptedInterpreter::new(vec![
            Scripted::Slow(
                Duration::from_millis(200),
                decision(Some(date(2024, 10, 15)), DecisionAction::Update),
            ),
            Scripted::Decide(decision(Some(date(2024, 8, 15)), DecisionAction::Update)),
        ]);
        let (engine, store) = engine(interp, None);

        let (first, second) = race(
            || engine.evaluate("note", &visit(), 0),
            || engine.evaluate("note", &visit(), 0),
        );

        assert_eq!(first.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(second.action_taken, ActionTaken::AppointmentUpdated);
        assert_eq!(second.previous_appointment_date, Some(date(2024, 10, 15)));
        assert_eq!(store.get_next_appointment("3").unwrap(), Some(date(2024, 8, 15)));
        assert!(engine.locks.is_empty());
    }

    #[test]
    fn locks_do_not_accumulate_for_unknown_patients() {
        let interp = ScriptedInterpreter::always(decision(None, DecisionAction::NoSuggestion));
        let (engine, _store) = engine(interp, None);

        for i in 0..1000 {
            let reference = ReferenceContext {
                patient_id: format!("ghost-{i}"),
                current_appointment_date: date(2024, 2, 15),
            };
            let outcome = engine.evaluate("note", &reference, 0);
            assert_eq!(outcome.action_taken, ActionTaken::Error);
        }
        assert!(engine.locks.is_empty());
    }

    #[test]
    fn outcome_ids_are_unique() {
        let interp = ScriptedInterpreter::always(decision(None, DecisionAction::NoSuggestion));
        let (engine, _store) = engine(interp, None);
        let a = engine.evaluate("note", &visit(), 0);
        let b = engine.evaluate("note", &visit(), 0);
        assert_ne!(a.evaluation_id, b.evaluation_id);
    }

    #[test]
    fn terminal_states_are_classified() {
        assert!(!LoopState::Attempting { attempt: 0, feedback: None }.is_terminal());
        assert!(LoopState::Failed {
            attempts_used: 1,
            error: SchedulingError::Timeout(Duration::from_secs(1)),
        }
        .is_terminal());
    }

    // ── Properties ────────────────────────────────────────

    fn arb_decision() -> impl Strategy<Value = ProposedDecision> {
        let action = prop_oneof![
            Just(DecisionAction::Update),
            Just(DecisionAction::NoUpdate),
            Just(DecisionAction::NoSuggestion),
        ];
        (proptest::option::of(0u64..700), action).prop_map(|(offset, action)| {
            decision(
                offset.map(|o| date(2024, 1, 1) + chrono::Days::new(o)),
                action,
            )
        })
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_bound(
            max_retries in 0u32..6,
            script in proptest::collection::vec(arb_decision(), 1..8),
            existing in proptest::option::of(0u64..700),
        ) {
            let existing = existing.map(|o| date(2024, 1, 1) + chrono::Days::new(o));
            let interp = ScriptedInterpreter::new(script.into_iter().map(Scripted::Decide).collect());
            let (engine, store) = engine(interp.clone(), existing);

            let outcome = engine.evaluate("note", &visit(), max_retries);

            prop_assert!(outcome.attempts_used <= max_retries + 1);
            prop_assert_eq!(interp.calls() as u32, outcome.attempts_used);
            if outcome.action_taken == ActionTaken::ValidationFailed {
                prop_assert_eq!(outcome.attempts_used, max_retries + 1);
                prop_assert!(!outcome.success);
            }
            // Written only on a validated update.
            let updated = outcome.action_taken == ActionTaken::AppointmentUpdated;
            prop_assert_eq!(store.write_count(), u32::from(updated));
            if !updated {
                prop_assert_eq!(store.get_next_appointment("3").unwrap(), existing);
            }
        }

        #[test]
        fn always_invalid_interpreter_exhausts(max_retries in 0u32..6) {
            let interp = ScriptedInterpreter::always(decision(Some(date(2024, 8, 15)), DecisionAction::NoSuggestion));
            let (engine, store) = engine(interp.clone(), None);

            let outcome = engine.evaluate("note", &visit(), max_retries);

            prop_assert_eq!(outcome.action_taken, ActionTaken::ValidationFailed);
            prop_assert_eq!(outcome.attempts_used, max_retries + 1);
            prop_assert_eq!(store.write_count(), 0);
        }
    }
}
