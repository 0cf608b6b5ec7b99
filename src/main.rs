//! Reads one `EvaluateNoteRequest` as JSON on stdin and prints the `Outcome`
//! as JSON on stdout. Runs without a tokio runtime: reqwest's blocking client
//! cannot be created or dropped inside one.

use std::io::Read;
use std::process::ExitCode;
use note_scheduler::commands::{evaluate_note, EvaluateNoteRequest, NoteScheduler};
use note_scheduler::config::{self, EngineConfig};

fn main() -> ExitCode {
    note_scheduler::init_tracing();
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("Failed to read request: {e}");
        return ExitCode::from(2);
    }
    let request: EvaluateNoteRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Invalid request: {e}");
            return ExitCode::from(2);
        }
    };

    let engine = match NoteScheduler::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let max_retries = request.max_retries.unwrap_or(config.max_retries);
    let outcome = evaluate_note(
        &engine,
        &request.note,
        &request.patient_id,
        request.current_appointment_date,
        max_retries,
    );

    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to encode outcome: {e}");
            return ExitCode::FAILURE;
        }
    }

    if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
