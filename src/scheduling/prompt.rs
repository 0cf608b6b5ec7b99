//! Prompts for the LLM-backed note interpreter.

use chrono::NaiveDate;

use crate::llm::sanitize::{NOTE_FENCE_CLOSE, NOTE_FENCE_OPEN};

/// System instructions: terminology, decision rules and the JSON contract.
pub const SCHEDULING_SYSTEM_PROMPT: &str = "\
You are a medical appointment scheduling assistant that analyzes doctors' notes.

TERMINOLOGY:
- current_appointment_date = TODAY's visit date (the visit in which the note was written).
- next_appointment_date = the patient's already scheduled FUTURE appointment (from the database).
These are two different dates.

TASK:
1. Decide whether the note suggests a follow-up (for example a repeat Pap test). It can be:
   a. a timeframe: \"in 6 months\", \"in 1 year\", \"σε 3 μήνες\", \"σε 6 μήνες\"
   b. a specific date: \"on 2025-06-15\", \"στις 15/06/2025\", \"15 Ιουνίου 2025\"
2. For a timeframe, report it as {\"amount\": \"6\", \"unit\": \"months\"} and leave suggested_date null;
   it is added to current_appointment_date for you. For a specific date, report suggested_date as YYYY-MM-DD.
3. Apply these rules IN ORDER:
   RULE 1: no next_appointment_date, or next_appointment_date is before current_appointment_date
           -> action \"update\"
   RULE 2: suggested_date < next_appointment_date -> action \"update\" (see the patient sooner)
   RULE 3: suggested_date >= next_appointment_date -> action \"no_update\" (keep the earlier one)
   If the note has no follow-up suggestion -> action \"no_suggestion\" with suggested_date and timeframe null.
4. Always keep the EARLIEST date. Never move an appointment later.

Respond with ONE JSON object and nothing else:
{
  \"explanation\": \"short explanation for the doctor, showing suggested_date (YYYY-MM-DD) vs next_appointment_date (YYYY-MM-DD)\",
  \"suggested_date\": \"YYYY-MM-DD or null\",
  \"timeframe\": {\"amount\": \"integer as string\", \"unit\": \"days|weeks|months|years\"} or null,
  \"perceived_existing_date\": \"YYYY-MM-DD or null\",
  \"action\": \"update | no_update | no_suggestion\",
  \"rationale\": \"which rule decided the action\"
}";

/// Per-attempt user prompt. `note` must already be sanitized.
///
/// `stored_next_appointment` is `None` when the lookup was not possible;
/// `Some(None)` when the patient has no follow-up scheduled.
pub fn build_scheduling_prompt(
    note: &str,
    patient_id: &str,
    current_appointment_date: NaiveDate,
    stored_next_appointment: Option<Option<NaiveDate>>,
    prior_feedback: Option<&str>,
) -> String {
    let stored = match stored_next_appointment {
        Some(Some(date)) => date.to_string(),
        Some(None) => "None (no appointment scheduled)".to_string(),
        None => "unknown".to_string(),
    };

    let mut prompt = format!(
        "Doctor's note:\n{NOTE_FENCE_OPEN}\n{note}\n{NOTE_FENCE_CLOSE}\n\n\
         Patient ID: {patient_id}\n\
         Today's visit date (current_appointment_date): {current_appointment_date}\n\
         Stored next_appointment_date: {stored}\n\n\
         Analyze the note and decide on any follow-up suggestion (timeframe OR specific date). \
         We want the EARLIEST possible appointment date: if the patient already has an earlier \
         appointment than suggested, keep the existing one.\n"
    );

    if let Some(feedback) = prior_feedback {
        prompt.push_str(&format!(
            "\nYOUR PREVIOUS ANSWER WAS REJECTED:\n{feedback}\n\
             Correct the decision so that it satisfies this rule.\n"
        ));
    }

    prompt
}
