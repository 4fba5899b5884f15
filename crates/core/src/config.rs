use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pvm::leaf::CrossTermPolicy;
use crate::pvm::validate::{DEFAULT_ABSOLUTE_TOLERANCE, DEFAULT_RELATIVE_TOLERANCE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub cross_term_policy: CrossTermPolicy,
    pub relative_tolerance: Decimal,
    pub absolute_tolerance: Decimal,
    pub parallel: bool,
    pub verify_consistency: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub cross_term_policy: Option<CrossTermPolicy>,
    pub parallel: Option<bool>,
    pub verify_consistency: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_CONFIG_FILE: &str = "revbridge.toml";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                cross_term_policy: CrossTermPolicy::Price,
                relative_tolerance: DEFAULT_RELATIVE_TOLERANCE,
                absolute_tolerance: DEFAULT_ABSOLUTE_TOLERANCE,
                parallel: true,
                verify_consistency: true,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(engine) = patch.engine {
            if let Some(cross_term_policy) = engine.cross_term_policy {
                self.engine.cross_term_policy = cross_term_policy;
            }
            if let Some(relative_tolerance) = engine.relative_tolerance {
                self.engine.relative_tolerance = relative_tolerance;
            }
            if let Some(absolute_tolerance) = engine.absolute_tolerance {
                self.engine.absolute_tolerance = absolute_tolerance;
            }
            if let Some(parallel) = engine.parallel {
                self.engine.parallel = parallel;
            }
            if let Some(verify_consistency) = engine.verify_consistency {
                self.engine.verify_consistency = verify_consistency;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("REVBRIDGE_ENGINE_CROSS_TERM_POLICY") {
            self.engine.cross_term_policy = value.parse().map_err(|_| {
                ConfigError::InvalidEnvOverride {
                    key: "REVBRIDGE_ENGINE_CROSS_TERM_POLICY".to_string(),
                    value: value.clone(),
                }
            })?;
        }
        if let Some(value) = read_env("REVBRIDGE_ENGINE_RELATIVE_TOLERANCE") {
            self.engine.relative_tolerance =
                parse_decimal("REVBRIDGE_ENGINE_RELATIVE_TOLERANCE", &value)?;
        }
        if let Some(value) = read_env("REVBRIDGE_ENGINE_ABSOLUTE_TOLERANCE") {
            self.engine.absolute_tolerance =
                parse_decimal("REVBRIDGE_ENGINE_ABSOLUTE_TOLERANCE", &value)?;
        }
        if let Some(value) = read_env("REVBRIDGE_ENGINE_PARALLEL") {
            self.engine.parallel = parse_bool("REVBRIDGE_ENGINE_PARALLEL", &value)?;
        }
        if let Some(value) = read_env("REVBRIDGE_ENGINE_VERIFY_CONSISTENCY") {
            self.engine.verify_consistency =
                parse_bool("REVBRIDGE_ENGINE_VERIFY_CONSISTENCY", &value)?;
        }

        let log_level =
            read_env("REVBRIDGE_LOGGING_LEVEL").or_else(|| read_env("REVBRIDGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("REVBRIDGE_LOGGING_FORMAT").or_else(|| read_env("REVBRIDGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(cross_term_policy) = overrides.cross_term_policy {
            self.engine.cross_term_policy = cross_term_policy;
        }
        if let Some(parallel) = overrides.parallel {
            self.engine.parallel = parallel;
        }
        if let Some(verify_consistency) = overrides.verify_consistency {
            self.engine.verify_consistency = verify_consistency;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_engine(&self.engine)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config").join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

/// Config file actually in effect for `explicit_path`, if any.
pub fn detect_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    resolve_config_path(explicit_path)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.relative_tolerance < Decimal::ZERO || engine.relative_tolerance >= Decimal::ONE {
        return Err(ConfigError::Validation(
            "engine.relative_tolerance must be in range 0 <= x < 1".to_string(),
        ));
    }

    if engine.absolute_tolerance < Decimal::ZERO {
        return Err(ConfigError::Validation(
            "engine.absolute_tolerance must not be negative".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(value.trim()).map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    engine: Option<EnginePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    cross_term_policy: Option<CrossTermPolicy>,
    relative_tolerance: Option<Decimal>,
    absolute_tolerance: Option<Decimal>,
    parallel: Option<bool>,
    verify_consistency: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::pvm::leaf::CrossTermPolicy;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_attribute_cross_term_to_price() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(
            config.engine.cross_term_policy == CrossTermPolicy::Price,
            "default cross term policy should be price",
        )?;
        ensure(config.engine.parallel, "parallel should default to true")?;
        ensure(config.engine.verify_consistency, "validation should default to on")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_REVBRIDGE_POLICY", "volume");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("revbridge.toml");
            fs::write(
                &path,
                r#"
[engine]
cross_term_policy = "${TEST_REVBRIDGE_POLICY}"
relative_tolerance = "0.00001"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.engine.cross_term_policy == CrossTermPolicy::Volume,
                "cross term policy should be loaded from environment",
            )?;
            ensure(
                config.engine.relative_tolerance == dec!(0.00001),
                "relative tolerance should be loaded from file",
            )
        })();

        clear_vars(&["TEST_REVBRIDGE_POLICY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("REVBRIDGE_LOG_LEVEL", "warn");
        env::set_var("REVBRIDGE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["REVBRIDGE_LOG_LEVEL", "REVBRIDGE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("REVBRIDGE_ENGINE_PARALLEL", "false");
        env::set_var("REVBRIDGE_ENGINE_ABSOLUTE_TOLERANCE", "0.5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("revbridge.toml");
            fs::write(
                &path,
                r#"
[engine]
cross_term_policy = "volume"
parallel = true
absolute_tolerance = "0.01"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    cross_term_policy: Some(CrossTermPolicy::Price),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.engine.cross_term_policy == CrossTermPolicy::Price,
                "override cross term policy should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(!config.engine.parallel, "env parallel flag should win over file")?;
            ensure(
                config.engine.absolute_tolerance == dec!(0.5),
                "env tolerance should win over file and defaults",
            )
        })();

        clear_vars(&["REVBRIDGE_ENGINE_PARALLEL", "REVBRIDGE_ENGINE_ABSOLUTE_TOLERANCE"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("REVBRIDGE_ENGINE_RELATIVE_TOLERANCE", "1.5");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("engine.relative_tolerance")
            );
            ensure(has_message, "validation failure should mention engine.relative_tolerance")
        })();

        clear_vars(&["REVBRIDGE_ENGINE_RELATIVE_TOLERANCE"]);
        result
    }

    #[test]
    fn malformed_env_override_names_the_variable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("REVBRIDGE_ENGINE_CROSS_TERM_POLICY", "split");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "REVBRIDGE_ENGINE_CROSS_TERM_POLICY",
                "error should name the offending variable",
            ),
            Ok(_) => Err("expected invalid override".to_string()),
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["REVBRIDGE_ENGINE_CROSS_TERM_POLICY"]);
        result
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let missing = dir.path().join("absent.toml");
        let error = AppConfig::load(LoadOptions {
            config_path: Some(missing),
            require_file: true,
            ..LoadOptions::default()
        });

        ensure(
            matches!(error, Err(ConfigError::MissingConfigFile(_))),
            "missing required file should be reported",
        )
    }
}
