//! Patient appointment queries.
//!
//! Only the `next_appointment_date` column is read or written by the
//! decision engine; the rest of the row exists so fixtures look like
//! real patients. Dates are bound through rusqlite's chrono support
//! (`YYYY-MM-DD` TEXT).

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

use super::DatabaseError;
use crate::models::{AppointmentChange, Patient};

/// Map a column conversion failure onto `InvalidDate`.
fn date_error(field: &str) -> impl Fn(rusqlite::Error) -> DatabaseError + '_ {
    move |err| match err {
        rusqlite::Error::FromSqlConversionFailure(_, _, cause) => DatabaseError::InvalidDate {
            field: field.to_string(),
            value: cause.to_string(),
        },
        other => DatabaseError::Sqlite(other),
    }
}

fn patient_not_found(patient_id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity_type: "Patient".into(),
        id: patient_id.to_string(),
    }
}

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, first_name, last_name, next_appointment_date, last_updated_on)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            patient.id,
            patient.first_name,
            patient.last_name,
            patient.next_appointment_date,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, patient_id: &str) -> Result<Patient, DatabaseError> {
    conn.query_row(
        "SELECT id, first_name, last_name, next_appointment_date
         FROM patients WHERE id = ?1 AND is_active = 1",
        params![patient_id],
        |row| {
            Ok(Patient {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                next_appointment_date: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(date_error("next_appointment_date"))?
    .ok_or_else(|| patient_not_found(patient_id))
}

/// Read the patient's next scheduled appointment.
/// `NotFound` when the patient does not exist; `Ok(None)` when no follow-up is scheduled.
pub fn get_next_appointment_date(
    conn: &Connection,
    patient_id: &str,
) -> Result<Option<NaiveDate>, DatabaseError> {
    Ok(get_patient(conn, patient_id)?.next_appointment_date)
}

fn read_next_in(tx: &Transaction<'_>, patient_id: &str) -> Result<Option<NaiveDate>, DatabaseError> {
    tx.query_row(
        "SELECT next_appointment_date FROM patients WHERE id = ?1 AND is_active = 1",
        params![patient_id],
        |row| row.get::<_, Option<NaiveDate>>(0),
    )
    .optional()
    .map_err(date_error("next_appointment_date"))?
    .ok_or_else(|| patient_not_found(patient_id))
}

fn write_next_in(
    tx: &Transaction<'_>,
    patient_id: &str,
    previous: Option<NaiveDate>,
    date: NaiveDate,
) -> Result<AppointmentChange, DatabaseError> {
    let change = AppointmentChange {
        id: Uuid::new_v4().to_string(),
        patient_id: patient_id.to_string(),
        previous_date: previous,
        new_date: date,
        changed_at: Utc::now().to_rfc3339(),
    };
    tx.execute(
        "UPDATE patients SET next_appointment_date = ?1, last_updated_on = ?2 WHERE id = ?3",
        params![date, change.changed_at, patient_id],
    )?;
    tx.execute(
        "INSERT INTO appointment_changes (id, patient_id, previous_date, new_date, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            change.id,
            change.patient_id,
            change.previous_date,
            change.new_date,
            change.changed_at,
        ],
    )?;
    Ok(change)
}

/// Overwrite the patient's next appointment and record the change.
pub fn set_next_appointment_date(
    conn: &mut Connection,
    patient_id: &str,
    date: NaiveDate,
) -> Result<AppointmentChange, DatabaseError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let previous = read_next_in(&tx, patient_id)?;
    let change = write_next_in(&tx, patient_id, previous, date)?;
    tx.commit()?;
    Ok(change)
}

/// Write `date` only if the stored appointment still equals `expected`.
///
/// The check and the write share one `BEGIN IMMEDIATE` transaction, so two
/// connections to the same file cannot both pass the check.
/// `AppointmentChanged` when another writer got there first.
pub fn replace_next_appointment_date(
    conn: &mut Connection,
    patient_id: &str,
    expected: Option<NaiveDate>,
    date: NaiveDate,
) -> Result<AppointmentChange, DatabaseError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let actual = read_next_in(&tx, patient_id)?;
    if actual != expected {
        return Err(DatabaseError::AppointmentChanged {
            patient_id: patient_id.to_string(),
            expected,
            actual,
        });
    }
    let change = write_next_in(&tx, patient_id, actual, date)?;
    tx.commit()?;
    Ok(change)
}

/// Change history for a patient, oldest first.
pub fn list_appointment_changes(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<AppointmentChange>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, previous_date, new_date, changed_at
         FROM appointment_changes WHERE patient_id = ?1
         ORDER BY changed_at ASC, rowid ASC",
    )?;

    let changes = stmt
        .query_map(params![patient_id], |row| {
            Ok(AppointmentChange {
                id: row.get(0)?,
                patient_id: row.get(1)?,
                previous_date: row.get(2)?,
                new_date: row.get(3)?,
                changed_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(date_error("appointment_changes"))?;
    Ok(changes)
}
