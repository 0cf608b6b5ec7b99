//! `PatientAppointmentStore` implementations and per-patient serialization.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::Connection;

use super::error::SchedulingError;
use super::traits::PatientAppointmentStore;
use crate::db;

// ═══════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════

/// Store backed by the `patients` table. The connection is shared behind a
/// mutex; each call is a single statement or transaction.
pub struct SqliteAppointmentStore {
    conn: Mutex<Connection>,
}

impl SqliteAppointmentStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self, SchedulingError> {
        Ok(Self::new(db::open_database(path)?))
    }

    pub fn open_in_memory() -> Result<Self, SchedulingError> {
        Ok(Self::new(db::open_memory_database()?))
    }

    /// Direct connection access for seeding and inspection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, db::DatabaseError>,
    ) -> Result<T, SchedulingError> {
        let mut conn = self.lock()?;
        Ok(f(&mut conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SchedulingError> {
        self.conn.lock().map_err(|_| SchedulingError::LockPoisoned)
    }
}

impl PatientAppointmentStore for SqliteAppointmentStore {
    fn get_next_appointment(&self, patient_id: &str) -> Result<Option<NaiveDate>, SchedulingError> {
        let conn = self.lock()?;
        Ok(db::get_next_appointment_date(&conn, patient_id)?)
    }

    fn set_next_appointment(&self, patient_id: &str, date: NaiveDate) -> Result<(), SchedulingError> {
        let mut conn = self.lock()?;
        let change = db::set_next_appointment_date(&mut conn, patient_id, date)?;
        tracing::debug!(
            patient_id,
            previous = ?change.previous_date,
            new = %change.new_date,
            "Next appointment written"
        );
        Ok(())
    }

    fn replace_next_appointment(
        &self,
        patient_id: &str,
        expected: Option<NaiveDate>,
        date: NaiveDate,
    ) -> Result<(), SchedulingError> {
        let mut conn = self.lock()?;
        let change = db::replace_next_appointment_date(&mut conn, patient_id, expected, date)?;
        tracing::debug!(
            patient_id,
            previous = ?change.previous_date,
            new = %change.new_date,
            "Next appointment replaced"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════

/// HashMap-backed store for tests and embedding without a database.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    patients: Mutex<HashMap<String, Option<NaiveDate>>>,
    writes: Mutex<u32>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patient(self, patient_id: &str, next: Option<NaiveDate>) -> Self {
        if let Ok(mut patients) = self.patients.lock() {
            patients.insert(patient_id.to_string(), next);
        }
        self
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u32 {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    fn count_write(&self) -> Result<(), SchedulingError> {
        let mut writes = self.writes.lock().map_err(|_| SchedulingError::LockPoisoned)?;
        *writes += 1;
        Ok(())
    }
}

impl PatientAppointmentStore for InMemoryAppointmentStore {
    fn get_next_appointment(&self, patient_id: &str) -> Result<Option<NaiveDate>, SchedulingError> {
        let patients = self.patients.lock().map_err(|_| SchedulingError::LockPoisoned)?;
        patients
            .get(patient_id)
            .copied()
            .ok_or_else(|| SchedulingError::PatientNotFound(patient_id.to_string()))
    }

    fn set_next_appointment(&self, patient_id: &str, date: NaiveDate) -> Result<(), SchedulingError> {
        let mut patients = self.patients.lock().map_err(|_| SchedulingError::LockPoisoned)?;
        let slot = patients
            .get_mut(patient_id)
            .ok_or_else(|| SchedulingError::PatientNotFound(patient_id.to_string()))?;
        *slot = Some(date);
        self.count_write()
    }

    fn replace_next_appointment(
        &self,
        patient_id: &str,
        expected: Option<NaiveDate>,
        date: NaiveDate,
    ) -> Result<(), SchedulingError> {
        let mut patients = self.patients.lock().map_err(|_| SchedulingError::LockPoisoned)?;
        let slot = patients
            .get_mut(patient_id)
            .ok_or_else(|| SchedulingError::PatientNotFound(patient_id.to_string()))?;
        if *slot != expected {
            return Err(SchedulingError::AppointmentChanged {
                patient_id: patient_id.to_string(),
                expected,
                actual: *slot,
            });
        }
        *slot = Some(date);
        self.count_write()
    }
}

// ═══════════════════════════════════════════
// Per-patient locks
// ═══════════════════════════════════════════

/// One mutex per patient id. Held for a whole evaluation so that reading the
/// existing date and writing the new one never interleave with another
/// evaluation of the same patient through the same engine. Different
/// patients never contend. Entries are dropped once no evaluation holds
/// them, so the map only tracks patients currently in flight.
#[derive(Default)]
pub struct PatientLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PatientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for `patient_id`; callers lock it for the evaluation.
    pub fn handle(&self, patient_id: &str) -> Result<Arc<Mutex<()>>, SchedulingError> {
        let mut locks = self.locks.lock().map_err(|_| SchedulingError::LockPoisoned)?;
        Ok(locks
            .entry(patient_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Give back a handle from [`handle`](Self::handle). Removes the entry
    /// when no other caller still holds it.
    pub fn release(&self, patient_id: &str, handle: Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // One reference in the map plus the caller's.
        let last_holder = locks
            .get(patient_id)
            .is_some_and(|held| Arc::ptr_eq(held, &handle) && Arc::strong_count(&handle) == 2);
        if last_holder {
            locks.remove(patient_id);
        }
    }

    /// Number of patients with an evaluation in flight.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
