use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub next_appointment_date: Option<NaiveDate>,
}

/// One write of `next_appointment_date`, as recorded in `appointment_changes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentChange {
    pub id: String,
    pub patient_id: String,
    pub previous_date: Option<NaiveDate>,
    pub new_date: NaiveDate,
    /// RFC 3339 timestamp.
    pub changed_at: String,
}
