pub mod sqlite;
pub mod repository;

pub use sqlite::*;
pub use repository::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Stored value for {field} is not a valid date: {value}")]
    InvalidDate { field: String, value: String },

    #[error("Appointment for patient {patient_id} changed concurrently (expected {expected:?}, found {actual:?})")]
    AppointmentChanged {
        patient_id: String,
        expected: Option<chrono::NaiveDate>,
        actual: Option<chrono::NaiveDate>,
    },

    #[error("Could not create database directory: {0}")]
    Io(#[from] std::io::Error),
}
