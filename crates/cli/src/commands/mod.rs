pub mod attribute;
pub mod bridge;
pub mod check;
pub mod config;
pub mod input;

use serde::Serialize;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_INPUT: u8 = 3;
pub const EXIT_ENGINE: u8 = 4;
pub const EXIT_INVALID_VIEW: u8 = 5;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct CommandPayload<'a, T: Serialize> {
    command: &'a str,
    status: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

impl CommandResult {
    /// Successful result carrying a structured body next to `command` and `status`.
    pub fn with_body<T: Serialize>(command: &str, status: &str, body: &T, exit_code: u8) -> Self {
        let payload = CommandPayload { command, status, body };
        Self { exit_code, output: serialize_payload(&payload) }
    }

    pub fn text(output: impl Into<String>) -> Self {
        Self { exit_code: 0, output: output.into() }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: error_class.to_string(),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(&payload) }
    }
}

fn serialize_payload<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
