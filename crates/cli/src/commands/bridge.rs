use std::path::Path;

use revbridge_core::config::{AppConfig, LoadOptions};
use revbridge_core::pvm::bridge::RevenueBridge;
use revbridge_core::pvm::{AttributionRuntime, DeterministicAttributionEngine, SubtreeFilter};

use crate::commands::input::{describe, load_request};
use crate::commands::{CommandResult, EXIT_CONFIG, EXIT_ENGINE, EXIT_INPUT};

const COMMAND: &str = "bridge";

/// Renders the price/volume/mix walk from baseline to current revenue for one node.
pub fn run(input: &Path, filter: SubtreeFilter, options: LoadOptions) -> CommandResult {
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
    request.filter = Some(filter.clone());

    let engine = DeterministicAttributionEngine::from_config(&config.engine);
    let report = match engine.attribute(&request) {
        Ok(report) => report,
        Err(error) => {
            return CommandResult::failure(COMMAND, "request", error.to_string(), EXIT_ENGINE);
        }
    };

    match report.results.node(&filter.view, &filter.node) {
        Some(result) => {
            CommandResult::text(RevenueBridge::from_result(result).render_lines().join("\n"))
        }
        None => CommandResult::failure(
            COMMAND,
            "request",
            format!(
                "node `{}` in view `{}` has no result (all of its leaves were excluded)",
                filter.node, filter.view
            ),
            EXIT_ENGINE,
        ),
    }
}
