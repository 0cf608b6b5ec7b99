//! Follow-up appointment decision engine.
//!
//! ## Architecture
//!
//! ```text
//! CorrectionLoop → NoteInterpreter → DecisionValidator → [apply | retry with feedback]
//!                        │                                    │
//!                    LlmClient                    PatientAppointmentStore
//! ```
//!
//! Non-determinism is confined to the interpreter. Everything downstream
//! (date arithmetic, rule validation, state transitions) is pure and
//! deterministic, and the store is only written on a validated decision.

pub mod error;
pub mod types;
pub mod date_math;
pub mod traits;
pub mod validator;
pub mod store;
pub mod prompt;
pub mod interpreter;
pub mod correction;

pub use error::SchedulingError;
pub use types::*;
pub use traits::*;
pub use date_math::{add_timeframe, TimeUnit, Timeframe};
pub use validator::DecisionValidator;
pub use store::{InMemoryAppointmentStore, PatientLocks, SqliteAppointmentStore};
pub use interpreter::LlmNoteInterpreter;
pub use correction::{CorrectionLoop, EvaluateOptions, LoopState};
