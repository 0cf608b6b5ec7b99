//! Decision Validator: checks a proposed decision against the scheduling rules.
//!
//! Rules, first failure wins:
//! 1. No-suggestion consistency: `suggested_date` is absent iff action is `no_suggestion`
//! 2. Absent or past stored appointment: action must be `update`
//! 3. Earliest wins: suggestion before a future stored appointment → `update`
//! 4. Keep earlier: suggestion on/after a future stored appointment → `no_update`
//!
//! Pure: no I/O, no hidden state. The violation sentence is fed verbatim to
//! the next interpretation attempt, so it must name the rule and both dates.

use chrono::NaiveDate;

use super::types::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionValidator;

impl DecisionValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        proposed: &ProposedDecision,
        existing: &ExistingAppointment,
        reference: &ReferenceContext,
    ) -> ValidationResult {
        let action = proposed.action;

        // Rule 1
        let suggested = match (proposed.suggested_date, action) {
            (None, DecisionAction::NoSuggestion) => return ValidationResult::pass(),
            (None, other) => {
                return ValidationResult::fail(
                    ValidationRule::NoSuggestionConsistency,
                    format!(
                        "Rule '{}' violated: suggested_date is None but action is '{other}'; \
                         a decision without a suggested date must use action 'no_suggestion'.",
                        ValidationRule::NoSuggestionConsistency
                    ),
                )
            }
            (Some(date), DecisionAction::NoSuggestion) => {
                return ValidationResult::fail(
                    ValidationRule::NoSuggestionConsistency,
                    format!(
                        "Rule '{}' violated: action is 'no_suggestion' but suggested_date is {date}; \
                         either remove the suggested date or choose 'update' or 'no_update'.",
                        ValidationRule::NoSuggestionConsistency
                    ),
                )
            }
            (Some(date), _) => date,
        };

        let current = reference.current_appointment_date;
        let expected = expected_action(suggested, existing, current);
        if action == expected {
            return ValidationResult::pass();
        }

        // Rules 2-4: describe which comparison forced `expected`.
        match existing.next_appointment_date {
            None => ValidationResult::fail(
                ValidationRule::AbsentOrPastMustUpdate,
                format!(
                    "Rule '{}' violated: next_appointment_date is None (no follow-up scheduled) \
                     and suggested_date is {suggested}, so action must be 'update', but got '{action}'.",
                    ValidationRule::AbsentOrPastMustUpdate
                ),
            ),
            Some(stored) if stored < current => ValidationResult::fail(
                ValidationRule::AbsentOrPastMustUpdate,
                format!(
                    "Rule '{}' violated: next_appointment_date ({stored}) is before \
                     current_appointment_date ({current}), so the stored appointment is stale and \
                     action must be 'update' to suggested_date ({suggested}), but got '{action}'.",
                    ValidationRule::AbsentOrPastMustUpdate
                ),
            ),
            Some(stored) if suggested < stored => ValidationResult::fail(
                ValidationRule::EarliestWins,
                format!(
                    "Rule '{}' violated: suggested_date ({suggested}) is earlier than \
                     next_appointment_date ({stored}), so action must be 'update', but got '{action}'.",
                    ValidationRule::EarliestWins
                ),
            ),
            Some(stored) => ValidationResult::fail(
                ValidationRule::KeepEarlier,
                format!(
                    "Rule '{}' violated: suggested_date ({suggested}) is not earlier than \
                     next_appointment_date ({stored}), so action must be 'no_update' \
                     (an appointment is never moved later), but got '{action}'.",
                    ValidationRule::KeepEarlier
                ),
            ),
        }
    }
}

/// The only action rules 2-4 accept for a given suggestion.
pub fn expected_action(
    suggested: NaiveDate,
    existing: &ExistingAppointment,
    current_appointment_date: NaiveDate,
) -> DecisionAction {
    match existing.upcoming(current_appointment_date) {
        None => DecisionAction::Update,
        Some(stored) if suggested < stored => DecisionAction::Update,
        Some(_) => DecisionAction::NoUpdate,
    }
}
