//! Tracing subscriber setup shared by the rig binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if cli.verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _logging_guards = init_logging(&log_config)?;
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::env::EnvParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => Ok(Self::Pretty),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("cannot open log file {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level or full filter directive (`debug`, `rig_common=trace`).
    pub level: String,
    pub format: LogFormat,
    /// Also write events to this file (non-blocking).
    pub file: Option<PathBuf>,
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            stderr: false,
        }
    }
}

impl LogConfig {
    /// Read `RIG_LOG_LEVEL`, `RIG_LOG_FORMAT` and `RIG_LOG_FILE`.
    ///
    /// Bad values are reported on stderr and the defaults kept; logging is
    /// not installed yet at this point.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_parser(&mut EnvParser::new(), default_level)
    }

    pub fn from_parser(parser: &mut EnvParser, default_level: &str) -> Self {
        let level = parser.get_log_level("LOG_LEVEL", default_level).value;
        let format = parser
            .get_optional_string("LOG_FORMAT")
            .value
            .and_then(|raw| match raw.parse::<LogFormat>() {
                Ok(format) => Some(format),
                Err(err) => {
                    eprintln!("rig: ignoring RIG_LOG_FORMAT: {err}");
                    None
                }
            })
            .unwrap_or_default();
        let file = parser.get_optional_string("LOG_FILE").value.map(PathBuf::from);

        for err in parser.take_errors() {
            eprintln!("rig: {err}");
        }

        Self {
            level,
            format,
            file,
            stderr: false,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Filter directive: a bare level applies to the rig crates only and
    /// dependencies stay at `warn`; anything else is used verbatim.
    pub fn filter_directive(&self) -> String {
        let level = self.level.trim();
        if matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off") {
            format!("warn,rig={level},rig_common={level}")
        } else {
            level.to_string()
        }
    }
}

/// Keeps the non-blocking writers flushing; drop at process exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global tracing subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let directive = config.filter_directive();
    let filter = EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        filter: directive.clone(),
        message: e.to_string(),
    })?;

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(match (config.stderr, config.format) {
        (true, LogFormat::Pretty) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (true, LogFormat::Json) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (false, LogFormat::Pretty) => fmt::layer().with_target(true).boxed(),
        (false, LogFormat::Json) => fmt::layer().json().boxed(),
    });

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LoggingError::File {
                path: path.clone(),
                source,
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LoggingError::File {
                path: path.clone(),
                source,
            })?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        guards.push(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvParser::from_map(map)
    }

    #[test]
    fn test_from_parser_defaults() {
        let config = LogConfig::from_parser(&mut parser(&[]), "info");
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_from_parser_reads_variables() {
        let config = LogConfig::from_parser(
            &mut parser(&[
                ("RIG_LOG_LEVEL", "DEBUG"),
                ("RIG_LOG_FORMAT", "json"),
                ("RIG_LOG_FILE", "/tmp/rig.log"),
            ]),
            "info",
        );
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/rig.log")));
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = LogConfig::from_parser(
            &mut parser(&[("RIG_LOG_LEVEL", "chatty"), ("RIG_LOG_FORMAT", "xml")]),
            "warn",
        );
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_filter_directive() {
        let config = LogConfig::default().with_level("debug");
        assert_eq!(config.filter_directive(), "warn,rig=debug,rig_common=debug");

        let custom = LogConfig::default().with_level("rig_common::connection=trace");
        assert_eq!(custom.filter_directive(), "rig_common::connection=trace");
    }
}
