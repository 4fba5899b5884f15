use std::path::Path;

use revbridge_core::config::{AppConfig, LoadOptions};
use revbridge_core::errors::{ApplicationError, EngineError};
use revbridge_core::pvm::{AttributionRuntime, DeterministicAttributionEngine, SubtreeFilter};
use tracing::{error, info};

use crate::commands::input::{describe, load_request};
use crate::commands::{CommandResult, EXIT_CONFIG, EXIT_ENGINE, EXIT_INPUT};

const COMMAND: &str = "attribute";

pub fn run(input: &Path, filter: Option<SubtreeFilter>, options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    let mut request = match load_request(input) {
        Ok(request) => request,
        Err(error) => {
            return CommandResult::failure(COMMAND, "input", describe(&error), EXIT_INPUT);
        }
    };
    if filter.is_some() {
        request.filter = filter;
    }

    let engine = DeterministicAttributionEngine::from_config(&config.engine);
    match engine.attribute(&request) {
        Ok(report) => {
            info!(
                event_name = "cli.attribute.completed",
                results = report.results.len(),
                fingerprint = %report.fingerprint,
                "attribution report ready"
            );
            CommandResult::with_body(COMMAND, "ok", &report, 0)
        }
        Err(engine_error) => engine_failure(engine_error),
    }
}

fn engine_failure(engine_error: EngineError) -> CommandResult {
    let error_class = match &engine_error {
        EngineError::Integrity(_) => "integrity",
        EngineError::Overflow { .. } => "overflow",
        _ => "request",
    };
    error!(event_name = "cli.attribute.failed", error_class, error = %engine_error, "attribution failed");
    let message = ApplicationError::from(engine_error).to_string();
    CommandResult::failure(COMMAND, error_class, message, EXIT_ENGINE)
}
