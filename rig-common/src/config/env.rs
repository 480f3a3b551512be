//! Environment variable parsing with type safety.
//!
//! Reads `RIG_*` overrides, collecting every bad value so all issues can be
//! reported at once instead of failing on the first.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment(String),
}

/// A value together with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment(var),
        }
    }

    fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    /// The value, noting the variable name in `overrides` when it came
    /// from the environment.
    pub fn noted(self, overrides: &mut Vec<String>) -> T {
        if let ConfigSource::Environment(var) = self.source {
            overrides.push(var);
        }
        self.value
    }
}

enum VarSource {
    Process,
    Map(HashMap<String, String>),
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    vars: VarSource,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser over the process environment with the `RIG_` prefix.
    pub fn new() -> Self {
        Self {
            prefix: "RIG_",
            vars: VarSource::Process,
            errors: Vec::new(),
        }
    }

    /// Parser over a fixed set of variables (full names, prefix included).
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            prefix: "RIG_",
            vars: VarSource::Map(vars),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, var_name: &str) -> Option<String> {
        match &self.vars {
            VarSource::Process => std::env::var(var_name).ok(),
            VarSource::Map(map) => map.get(var_name).cloned(),
        }
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" (case-insensitive).
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        let Some(value) = self.lookup(&var_name) else {
            return Sourced::default_value(default);
        };
        let parsed = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name.clone(),
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                default
            }
        };
        Sourced::from_env(parsed, var_name)
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var_name = self.var_name(name);
        let Some(value) = self.lookup(&var_name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var_name),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name.clone(),
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::from_env(default, var_name)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned 32-bit integer".to_string(),
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Parse a humantime duration such as `30s`, `2m` or `1h 30m`.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        let Some(value) = self.lookup(&var_name) else {
            return Sourced::default_value(default);
        };
        match humantime::parse_duration(value.trim()) {
            Ok(duration) => Sourced::from_env(duration, var_name),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration {
                    var: var_name,
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        let Some(value) = self.lookup(&var_name) else {
            return Sourced::default_value(default.to_string());
        };
        let lower = value.to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                Sourced::from_env(lower, var_name)
            }
            _ => {
                self.errors.push(EnvError::InvalidLogLevel {
                    var: var_name.clone(),
                    value,
                });
                Sourced::from_env(default.to_string(), var_name)
            }
        }
    }

    /// `None` if not set or empty.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Some(value) => Sourced::from_env(Some(value), var_name),
            None => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
