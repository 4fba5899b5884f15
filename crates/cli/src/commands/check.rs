use std::path::Path;

use revbridge_core::pvm::structure::ViewTree;
use serde::Serialize;

use crate::commands::input::{describe, load_request};
use crate::commands::{CommandResult, EXIT_INPUT, EXIT_INVALID_VIEW};

const COMMAND: &str = "check";

#[derive(Debug, Serialize)]
struct ViewStatus {
    view: String,
    valid: bool,
    nodes: usize,
    leaves: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    views: Vec<ViewStatus>,
}

pub fn run(input: &Path) -> CommandResult {
    let request = match load_request(input) {
        Ok(request) => request,
        Err(error) => {
            return CommandResult::failure(COMMAND, "input", describe(&error), EXIT_INPUT);
        }
    };

    let views: Vec<ViewStatus> = request
        .views
        .views
        .iter()
        .map(|view| match ViewTree::build(view) {
            Ok(tree) => ViewStatus {
                view: view.name.to_string(),
                valid: true,
                nodes: tree.len(),
                leaves: tree.leaves_under(tree.root()).len(),
                error: None,
            },
            Err(error) => ViewStatus {
                view: view.name.to_string(),
                valid: false,
                nodes: view.nodes.len(),
                leaves: 0,
                error: Some(error.to_string()),
            },
        })
        .collect();

    let all_valid = views.iter().all(|status| status.valid);
    let (status, exit_code) = if all_valid { ("ok", 0) } else { ("invalid", EXIT_INVALID_VIEW) };
    CommandResult::with_body(COMMAND, status, &CheckReport { views }, exit_code)
}
