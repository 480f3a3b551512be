//! Configuration for rig: process-wide options, per-host entries and the
//! TOML inventory that carries both.
//!
//! Host property lookup is two-tier: the host's own value first, then the
//! global options. Well-known keys are typed fields; everything else lands
//! in a residual `extra` map on either side.

pub mod env;
pub mod inventory;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fanout::RunMode;
use crate::retry::RetryPolicy;
use crate::types::TransportKind;

pub use env::{EnvError, EnvParser};
pub use inventory::Inventory;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read inventory {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("host '{0}' is not in the inventory")]
    UnknownHost(String),

    #[error("invalid environment configuration:\n{}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("no home directory to locate the default inventory")]
    NoHomeDir,
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Process-wide options shared by every host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    /// Log commands instead of running them.
    pub dry_run: bool,
    /// Lines of output quoted in failure messages.
    pub trace_limit: usize,
    /// Login user when a host does not name one.
    pub user: Option<String>,
    pub ssh_port: u16,
    pub winrm_port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_connection_tries: u32,
    pub max_execute_tries: u32,
    /// Rounds spent probing for an expected disconnection.
    pub connection_failure_probes: u32,
    pub down_poll_rounds: u32,
    pub up_poll_rounds: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub identity_file: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    pub color: bool,
    pub run_mode: RunMode,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            trace_limit: 10,
            user: None,
            ssh_port: 22,
            winrm_port: 5985,
            connect_timeout: Duration::from_secs(30),
            max_connection_tries: 11,
            max_execute_tries: 7,
            connection_failure_probes: 10,
            down_poll_rounds: 60,
            up_poll_rounds: 60,
            poll_interval: Duration::from_secs(5),
            identity_file: None,
            strict_host_key_checking: false,
            color: true,
            run_mode: RunMode::Sequential,
            extra: BTreeMap::new(),
        }
    }
}

impl GlobalOptions {
    /// Apply `RIG_*` overrides, failing with every bad value at once.
    ///
    /// Returns the names of the variables that overrode an option.
    pub fn apply_env(&mut self, parser: &mut EnvParser) -> Result<Vec<String>, ConfigError> {
        let mut overrides = Vec::new();
        self.dry_run = parser.get_bool("DRY_RUN", self.dry_run).noted(&mut overrides);
        self.trace_limit = parser
            .get_u32_range("TRACE_LIMIT", self.trace_limit as u32, 0, 100_000)
            .noted(&mut overrides) as usize;
        self.max_connection_tries = parser
            .get_u32_range("MAX_CONNECTION_TRIES", self.max_connection_tries, 1, 1000)
            .noted(&mut overrides);
        self.max_execute_tries = parser
            .get_u32_range("MAX_EXECUTE_TRIES", self.max_execute_tries, 1, 1000)
            .noted(&mut overrides);
        self.connect_timeout = parser
            .get_duration("CONNECT_TIMEOUT", self.connect_timeout)
            .noted(&mut overrides);
        self.color = parser.get_bool("COLOR", self.color).noted(&mut overrides);
        if parser.get_bool("PARALLEL", false).noted(&mut overrides) {
            self.run_mode = RunMode::Parallel;
        }
        if let Some(user) = parser.get_optional_string("USER").noted(&mut overrides) {
            self.user = Some(user);
        }

        let errors = parser.take_errors();
        if errors.is_empty() {
            Ok(overrides)
        } else {
            Err(ConfigError::Env(errors))
        }
    }

    pub fn connection_policy(&self) -> RetryPolicy {
        RetryPolicy::connection().with_max_attempts(self.max_connection_tries)
    }

    pub fn execution_policy(&self) -> RetryPolicy {
        RetryPolicy::execution().with_max_attempts(self.max_execute_tries)
    }

    pub fn probe_policy(&self) -> RetryPolicy {
        RetryPolicy::probe().with_max_attempts(self.connection_failure_probes)
    }

    pub fn down_policy(&self) -> RetryPolicy {
        RetryPolicy::polling(self.down_poll_rounds, self.poll_interval)
    }

    pub fn up_policy(&self) -> RetryPolicy {
        RetryPolicy::polling(self.up_poll_rounds, self.poll_interval)
    }

    /// Global fallback for host property lookup.
    pub fn property(&self, key: &str) -> Option<String> {
        match key {
            "dry_run" => Some(self.dry_run.to_string()),
            "trace_limit" => Some(self.trace_limit.to_string()),
            "user" => self.user.clone(),
            "ssh_port" => Some(self.ssh_port.to_string()),
            "winrm_port" => Some(self.winrm_port.to_string()),
            _ => self.extra.get(key).map(value_to_string),
        }
    }
}

/// One inventory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Platform string, e.g. `el-9-x86_64` or `windows-2019-64`.
    pub platform: String,
    pub user: Option<String>,
    pub vmhostname: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub transport: Option<TransportKind>,
    /// Windows hosts only: reach them through Cygwin rather than cmd.exe.
    pub is_cygwin: bool,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub working_dir: Option<String>,
    pub prepend_cmds: Option<String>,
    pub append_cmds: Option<String>,
    pub winrm_https: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            platform: "linux".to_string(),
            user: None,
            vmhostname: None,
            ip: None,
            hostname: None,
            port: None,
            transport: None,
            is_cygwin: true,
            password: None,
            identity_file: None,
            working_dir: None,
            prepend_cmds: None,
            append_cmds: None,
            winrm_https: false,
            extra: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }

    /// Host-level value for `key`, without global fallback.
    pub fn property(&self, key: &str) -> Option<String> {
        match key {
            "platform" => Some(self.platform.clone()),
            "user" => self.user.clone(),
            "vmhostname" => self.vmhostname.clone(),
            "ip" => self.ip.clone(),
            "hostname" => self.hostname.clone(),
            "port" => self.port.map(|p| p.to_string()),
            "transport" => self.transport.map(|t| t.to_string()),
            "is_cygwin" => Some(self.is_cygwin.to_string()),
            "working_dir" => self.working_dir.clone(),
            "prepend_cmds" => self.prepend_cmds.clone(),
            "append_cmds" => self.append_cmds.clone(),
            _ => self.extra.get(key).map(value_to_string),
        }
    }

    /// Set a property; well-known keys update their typed field.
    pub fn set_property(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match key {
            "platform" => self.platform = value,
            "user" => self.user = Some(value),
            "vmhostname" => self.vmhostname = Some(value),
            "ip" => self.ip = Some(value),
            "hostname" => self.hostname = Some(value),
            "working_dir" => self.working_dir = Some(value),
            "prepend_cmds" => self.prepend_cmds = Some(value),
            "append_cmds" => self.append_cmds = Some(value),
            _ => {
                self.extra.insert(key.to_string(), toml::Value::String(value));
            }
        }
    }
}

/// Strings verbatim; other TOML values in their TOML rendering.
fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    /// Accepts `"30s"`-style strings or a bare number of seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parser(vars: &[(&str, &str)]) -> EnvParser {
        EnvParser::from_map(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    #[test]
    fn test_global_defaults() {
        let options = GlobalOptions::default();
        assert_eq!(options.trace_limit, 10);
        assert_eq!(options.max_connection_tries, 11);
        assert_eq!(options.connection_policy().max_attempts(), 11);
        assert_eq!(options.execution_policy().max_attempts(), 7);
        assert_eq!(options.probe_policy().max_attempts(), 10);
        assert!(!options.dry_run);
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut options = GlobalOptions::default();
        let overrides = options
            .apply_env(&mut parser(&[
                ("RIG_DRY_RUN", "yes"),
                ("RIG_TRACE_LIMIT", "25"),
                ("RIG_CONNECT_TIMEOUT", "5s"),
                ("RIG_PARALLEL", "1"),
            ]))
            .unwrap();
        assert_eq!(
            overrides,
            vec!["RIG_DRY_RUN", "RIG_TRACE_LIMIT", "RIG_CONNECT_TIMEOUT", "RIG_PARALLEL"]
        );
        assert!(options.dry_run);
        assert_eq!(options.trace_limit, 25);
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.run_mode, RunMode::Parallel);
    }

    #[test]
    fn test_apply_env_collects_all_errors() {
        let mut options = GlobalOptions::default();
        let err = options
            .apply_env(&mut parser(&[
                ("RIG_DRY_RUN", "perhaps"),
                ("RIG_CONNECT_TIMEOUT", "eventually"),
            ]))
            .unwrap_err();
        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_host_property_roundtrip() {
        let mut host = HostConfig::new("el-9-x86_64");
        host.set_property("ip", "10.0.0.7");
        host.set_property("build_id", "1234");

        assert_eq!(host.property("ip").as_deref(), Some("10.0.0.7"));
        assert_eq!(host.property("build_id").as_deref(), Some("1234"));
        assert_eq!(host.property("platform").as_deref(), Some("el-9-x86_64"));
        assert!(host.property("missing").is_none());
    }

    #[test]
    fn test_global_property_extra_values() {
        let mut options = GlobalOptions::default();
        options
            .extra
            .insert("retries".to_string(), toml::Value::Integer(3));
        options
            .extra
            .insert("suite".to_string(), toml::Value::String("smoke".to_string()));

        assert_eq!(options.property("retries").as_deref(), Some("3"));
        assert_eq!(options.property("suite").as_deref(), Some("smoke"));
        assert_eq!(options.property("trace_limit").as_deref(), Some("10"));
        assert!(options.property("user").is_none());
    }
}
