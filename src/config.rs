//! Configuration System using Figment
//!
//! Strongly-typed settings for the controller. Settings are loaded from:
//! 1. a TOML file (default `gpib.toml`)
//! 2. environment variables prefixed with `GPIB_` (nested keys split on `__`)
//!
//! Every value that used to be process-wide state (path delimiter, poll interval,
//! pseudo-command prefixes, output formats) lives here and is threaded through the
//! constructors of the components that need it.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! GPIB_LOG_LEVEL=debug
//! GPIB_SCRIPT_NAME=sweep
//! GPIB_ENGINE__POLL_INTERVAL=5ms
//! GPIB_OUTPUT__SEPARATION=instrument_type
//! ```
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//! script_name = "ExampleScript"
//!
//! [engine]
//! path_delimiter = "."
//! poll_interval = "10ms"
//!
//! [output]
//! path = "output/{label}{timestamp}.csv"
//! separation = "instrument_name"
//! retries = 3
//! retry_delay = "300ms"
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Script to execute when none is given on the command line
    pub script_name: String,
    /// Where definition files live
    pub paths: PathSettings,
    /// Script engine settings
    pub engine: EngineSettings,
    /// Output pipeline settings
    pub output: OutputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            script_name: "ExampleScript".to_string(),
            paths: PathSettings::default(),
            engine: EngineSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

/// Directories holding the JSON definition files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Controller definitions
    pub controllers: PathBuf,
    /// Instrument command sets
    pub catalogs: PathBuf,
    /// Script definitions
    pub scripts: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            controllers: PathBuf::from("controllers"),
            catalogs: PathBuf::from("instruments"),
            scripts: PathBuf::from("scripts"),
        }
    }
}

/// Settings shared by controllers and lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Separator in `controller[.instrument].command` references
    pub path_delimiter: String,
    /// Step of the busy poll-wait
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Prefix of the delay pseudo-command (`delay=250`)
    pub delay_prefix: String,
    /// Prefix of the variable pseudo-command (`var:x=2+3`)
    pub variable_prefix: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            path_delimiter: ".".to_string(),
            poll_interval: Duration::from_millis(10),
            delay_prefix: "delay=".to_string(),
            variable_prefix: "var:".to_string(),
        }
    }
}

/// How response records are grouped into destination files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSeparation {
    /// One file for everything
    None,
    /// Group by the instrument's type tag
    InstrumentType,
    /// Group by the instrument's catalog name
    InstrumentModel,
    /// One file per instrument
    #[default]
    InstrumentName,
}

/// Output pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Destination template; `{label}` is the separation label, `{timestamp}` the session start
    pub path: String,
    /// `chrono` format for `{timestamp}` in paths
    pub path_timestamp_format: String,
    /// Line template with `{timestamp}`, `{controller}`, `{instrument}`, `{command}`, `{response}`
    pub line_format: String,
    /// `chrono` format for `{timestamp}` in lines
    pub line_timestamp_format: String,
    /// Grouping strategy
    pub separation: OutputSeparation,
    /// Label template with `{label}`
    pub label_format: String,
    /// Write attempts per record
    pub retries: u32,
    /// Pause between write attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Flush after every line
    pub flush_each_line: bool,
    /// Mirror record lines to stdout
    pub echo_to_console: bool,
    /// Terminal log template with `{controller}` and `{timestamp}`; `None` disables terminal logs
    pub terminal_log_path: Option<String>,
    /// Publish every record on the broadcast side channel
    pub broadcast: bool,
    /// Capacity of the broadcast side channel
    pub broadcast_capacity: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: "output/{label}{timestamp}.csv".to_string(),
            path_timestamp_format: "%Y-%m-%d_%H-%M-%S".to_string(),
            line_format: "{timestamp};{controller};{instrument};{command};{response}".to_string(),
            line_timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            separation: OutputSeparation::InstrumentName,
            label_format: "{label}_".to_string(),
            retries: 3,
            retry_delay: Duration::from_millis(300),
            flush_each_line: true,
            echo_to_console: false,
            terminal_log_path: Some("logs/terminal_{controller}_{timestamp}.log".to_string()),
            broadcast: true,
            broadcast_capacity: 256,
        }
    }
}

impl Settings {
    /// Load settings from `path` and `GPIB_` environment variables, then validate.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GPIB_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let engine = &self.engine;
        if engine.path_delimiter.is_empty() {
            return Err(ConfigError::ValidationError(
                "engine.path_delimiter cannot be empty".to_string(),
            ));
        }
        if engine.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "engine.poll_interval must be greater than zero".to_string(),
            ));
        }
        if engine.delay_prefix.is_empty() || engine.variable_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "Pseudo-command prefixes cannot be empty".to_string(),
            ));
        }
        if engine.delay_prefix == engine.variable_prefix {
            return Err(ConfigError::ValidationError(format!(
                "Delay and variable prefixes must differ (both '{}')",
                engine.delay_prefix
            )));
        }

        let output = &self.output;
        if output.retries == 0 {
            return Err(ConfigError::ValidationError(
                "output.retries must be at least 1".to_string(),
            ));
        }
        if output.separation != OutputSeparation::None && !output.path.contains("{label}") {
            return Err(ConfigError::ValidationError(format!(
                "output.path '{}' must contain {{label}} when separating output",
                output.path
            )));
        }
        if let Some(terminal) = &output.terminal_log_path {
            if !terminal.contains("{controller}") {
                return Err(ConfigError::ValidationError(format!(
                    "output.terminal_log_path '{terminal}' must contain {{controller}}"
                )));
            }
        }
        if output.broadcast && output.broadcast_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "output.broadcast_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.engine.poll_interval, Duration::from_millis(10));
        assert_eq!(settings.output.separation, OutputSeparation::InstrumentName);
    }

    #[test]
    fn loads_toml_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"
script_name = "sweep"

[engine]
poll_interval = "5ms"
variable_prefix = "set:"

[output]
separation = "instrument_type"
retry_delay = "1s"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.script_name, "sweep");
        assert_eq!(settings.engine.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.engine.variable_prefix, "set:");
        assert_eq!(settings.engine.delay_prefix, "delay=");
        assert_eq!(settings.output.separation, OutputSeparation::InstrumentType);
        assert_eq!(settings.output.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn rejects_bad_log_level() {
        let settings = Settings {
            log_level: "loud".into(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_unlabelled_separated_path() {
        let mut settings = Settings::default();
        settings.output.path = "output/all.csv".into();
        assert!(settings.validate().is_err());

        settings.output.separation = OutputSeparation::None;
        settings.validate().unwrap();
    }

    #[test]
    fn rejects_identical_prefixes() {
        let mut settings = Settings::default();
        settings.engine.variable_prefix = settings.engine.delay_prefix.clone();
        assert!(settings.validate().is_err());
    }
}
