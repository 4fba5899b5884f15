use std::env;
use std::fs;
use std::path::Path;

use revbridge_core::config::{detect_config_path, AppConfig, LoadOptions};
use toml::Value;

use crate::commands::{CommandResult, EXIT_CONFIG};

pub fn run(options: LoadOptions) -> CommandResult {
    let explicit_path = options.config_path.clone();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                EXIT_CONFIG,
            )
        }
    };

    let config_file_path = detect_config_path(explicit_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let engine = &config.engine;
    let lines = [
        "effective config (source precedence: env > file > default):".to_string(),
        render_line(
            "engine.cross_term_policy",
            engine.cross_term_policy.as_str(),
            source("engine.cross_term_policy", &["REVBRIDGE_ENGINE_CROSS_TERM_POLICY"]),
        ),
        render_line(
            "engine.relative_tolerance",
            &engine.relative_tolerance.to_string(),
            source("engine.relative_tolerance", &["REVBRIDGE_ENGINE_RELATIVE_TOLERANCE"]),
        ),
        render_line(
            "engine.absolute_tolerance",
            &engine.absolute_tolerance.to_string(),
            source("engine.absolute_tolerance", &["REVBRIDGE_ENGINE_ABSOLUTE_TOLERANCE"]),
        ),
        render_line(
            "engine.parallel",
            &engine.parallel.to_string(),
            source("engine.parallel", &["REVBRIDGE_ENGINE_PARALLEL"]),
        ),
        render_line(
            "engine.verify_consistency",
            &engine.verify_consistency.to_string(),
            source("engine.verify_consistency", &["REVBRIDGE_ENGINE_VERIFY_CONSISTENCY"]),
        ),
        render_line(
            "logging.level",
            &config.logging.level,
            source("logging.level", &["REVBRIDGE_LOGGING_LEVEL", "REVBRIDGE_LOG_LEVEL"]),
        ),
        render_line(
            "logging.format",
            &format!("{:?}", config.logging.format),
            source("logging.format", &["REVBRIDGE_LOGGING_FORMAT", "REVBRIDGE_LOG_FORMAT"]),
        ),
    ];

    CommandResult::text(lines.join("\n"))
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
