pub mod config;
pub mod db;
pub mod models;
pub mod llm;
pub mod scheduling;
pub mod commands;

use tracing_subscriber::EnvFilter;

pub use commands::{evaluate_note, maybe_evaluate_note, EvaluateNoteRequest, NoteScheduler};
pub use scheduling::{ActionTaken, Outcome};

/// Install the global tracing subscriber. Logs go to stderr; stdout is
/// reserved for command output. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
