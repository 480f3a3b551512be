//! The façade test code talks to.
//!
//! A [`Host`] is one inventory entry plus the process-wide options. It
//! renders commands for its platform, owns at most one [`Connection`]
//! (created on first use, re-pointed when its addresses change), and turns
//! raw results into the harness failure taxonomy:
//!
//! - no exit code when none was expected: [`HarnessError::ConnectionFailure`]
//! - an expected disconnection that never came: [`HarnessError::ConnectionFailure`]
//! - an exit code outside the accepted set: [`HarnessError::CommandFailure`]

mod helpers;
mod transfer;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::command::{Command, RenderTarget};
use crate::config::{GlobalOptions, HostConfig};
use crate::connection::{
    Connection, ConnectionTargets, ExecRequest, OutputSink, StandardTransports, TransportFactory,
    TransportSettings,
};
use crate::errors::HarnessError;
use crate::logger::Logger;
use crate::result::{CommandResult, DEFAULT_ACCEPTABLE_EXIT_CODES};
use crate::types::{Platform, PlatformFamily, TransportKind};
use crate::util::mask_sensitive_command;

/// Per-call options for [`Host::exec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Log the command instead of running it.
    pub dry_run: bool,
    /// No logging, no output echo and no failure policy.
    pub silent: bool,
    pub pty: bool,
    pub stdin: Option<String>,
    pub accept_all_exit_codes: bool,
    /// Defaults to `{0, no exit code}`.
    pub acceptable_exit_codes: Option<Vec<Option<i32>>>,
    /// The command is expected to take the host (or its transport) down.
    pub expect_connection_failure: bool,
    /// Close the connection as soon as the command returns.
    pub reset_connection: bool,
    /// Output lines quoted in failures; defaults to the global trace limit.
    pub trace_limit: Option<usize>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn pty(mut self) -> Self {
        self.pty = true;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn accept_all_exit_codes(mut self) -> Self {
        self.accept_all_exit_codes = true;
        self
    }

    /// Accept these codes; pass `None` items to also accept a missing code.
    pub fn acceptable_exit_codes<I, C>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Option<i32>>,
    {
        self.acceptable_exit_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    pub fn expect_connection_failure(mut self) -> Self {
        self.expect_connection_failure = true;
        self
    }

    pub fn reset_connection(mut self) -> Self {
        self.reset_connection = true;
        self
    }

    pub fn trace_limit(mut self, lines: usize) -> Self {
        self.trace_limit = Some(lines);
        self
    }
}

pub struct Host {
    name: String,
    config: HostConfig,
    options: Arc<GlobalOptions>,
    platform: Platform,
    logger: Logger,
    transports: Arc<dyn TransportFactory>,
    connection: Option<Connection>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("connection", &self.connection)
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Host {
    pub fn new(
        name: impl Into<String>,
        config: HostConfig,
        options: Arc<GlobalOptions>,
        logger: Logger,
    ) -> Self {
        let platform = Platform::parse(&config.platform, config.is_cygwin);
        Self {
            name: name.into(),
            config,
            options,
            platform,
            logger,
            transports: Arc::new(StandardTransports),
            connection: None,
        }
    }

    /// Replace the transport factory (tests inject scripted transports).
    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn options(&self) -> &GlobalOptions {
        &self.options
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Property lookup: the host's own value, then the global options.
    pub fn get(&self, key: &str) -> Option<String> {
        self.config
            .property(key)
            .or_else(|| self.options.property(key))
    }

    /// Set a host-level property. Changing `platform` re-classifies the host.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.config.set_property(key, value);
        if key == "platform" {
            self.platform = Platform::parse(&self.config.platform, self.config.is_cygwin);
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.config
            .transport
            .unwrap_or(self.platform.defaults().transport)
    }

    /// Login user: host, then global options, then the platform default.
    pub fn user(&self) -> String {
        self.config
            .user
            .clone()
            .or_else(|| self.options.user.clone())
            .unwrap_or_else(|| self.platform.defaults().user.to_string())
    }

    pub fn port(&self) -> u16 {
        self.config.port.unwrap_or(match self.transport_kind() {
            TransportKind::Winrm => self.options.winrm_port,
            TransportKind::Ssh | TransportKind::Local => self.options.ssh_port,
        })
    }

    /// Address aliases; the host name is the last-resort hostname.
    pub fn targets(&self) -> ConnectionTargets {
        ConnectionTargets {
            vmhostname: self.config.vmhostname.clone(),
            ip: self.config.ip.clone(),
            hostname: self
                .config
                .hostname
                .clone()
                .or_else(|| Some(self.name.clone())),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            user: self.user(),
            port: self.port(),
            connect_timeout: self.options.connect_timeout,
            password: self.config.password.clone(),
            identity_file: self
                .config
                .identity_file
                .clone()
                .or_else(|| self.options.identity_file.clone()),
            strict_host_key_checking: self.options.strict_host_key_checking,
            use_tls: self.config.winrm_https,
            family: self.platform.family(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_connected)
    }

    /// The host's connection, created on first use. Existing connections
    /// are re-pointed when the host's addresses changed.
    pub async fn connection(&mut self) -> Result<&mut Connection, HarnessError> {
        let targets = self.targets();
        let connection = match self.connection.take() {
            Some(mut connection) => {
                connection.update_targets(targets).await;
                connection
            }
            None => {
                let kind = self.transport_kind();
                let transport = self.transports.create(kind, &self.transport_settings())?;
                debug!(host = %self.name, transport = %kind, "creating connection");
                Connection::new(&self.name, targets, transport)
                    .with_policies(
                        self.options.connection_policy(),
                        self.options.execution_policy(),
                        self.options.probe_policy(),
                    )
                    .with_separator(self.platform.defaults().path_separator)
            }
        };
        Ok(self.connection.insert(connection))
    }

    /// Close the connection if one is open. The next operation reconnects.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.close().await;
        }
    }

    /// Run `command` and apply the exit-code and connection-failure policy.
    pub async fn exec(
        &mut self,
        command: &Command,
        options: &ExecOptions,
    ) -> Result<CommandResult, HarnessError> {
        let command_line = command.render(&*self);
        let shown = mask_sensitive_command(&command_line);

        if command.is_elevated() && self.platform.defaults().elevation_prefix.is_none() {
            self.logger.debug(format!(
                "{}: no elevation prefix on {}; running as {}",
                self.name,
                self.platform.family(),
                self.user()
            ));
        }

        if options.dry_run || self.options.dry_run {
            self.logger
                .notify(format!("{} (dry run) $ {shown}", self.name));
            return Ok(CommandResult::skipped(&self.name, shown));
        }

        if !options.silent {
            self.logger.notify(format!(
                "\n{} {} $ {shown}",
                self.name,
                chrono::Local::now().format("%H:%M:%S")
            ));
        }

        let request = ExecRequest {
            pty: options.pty,
            stdin: options.stdin.clone(),
        };
        let logger = self.logger.clone();
        let sink: Option<&dyn OutputSink> = if options.silent { None } else { Some(&logger) };

        let started = Instant::now();
        let connection = self.connection().await?;
        let result = connection.execute(&command_line, &request, sink).await?;
        if options.reset_connection {
            connection.close().await;
        }

        if !options.silent {
            logger.debug(format!(
                "\n{} executed in {:.2} seconds",
                self.name,
                started.elapsed().as_secs_f64()
            ));
        }
        logger.set_last_result(&result);

        if !options.silent {
            self.apply_policy(&result, &shown, options).await?;
        }
        Ok(result)
    }

    async fn apply_policy(
        &mut self,
        result: &CommandResult,
        command_line: &str,
        options: &ExecOptions,
    ) -> Result<(), HarnessError> {
        let trace_limit = options.trace_limit.unwrap_or(self.options.trace_limit);

        if !options.expect_connection_failure && result.exit_code.is_none() {
            return Err(self.connection_failure(result, command_line, "connection failure", trace_limit));
        }

        if options.expect_connection_failure && result.exit_code.is_some() {
            // A reset connection is reopened by the probe.
            if !self.connection().await?.wait_for_connection_failure().await {
                return Err(self.connection_failure(
                    result,
                    command_line,
                    "should have resulted in a connection failure",
                    trace_limit,
                ));
            }
        }

        let mut accept_all = options.accept_all_exit_codes;
        if accept_all && options.acceptable_exit_codes.is_some() {
            self.logger.warn(format!(
                "{}: accept_all_exit_codes and acceptable_exit_codes are both set; using acceptable_exit_codes",
                self.name
            ));
            accept_all = false;
        }
        if accept_all {
            return Ok(());
        }

        let acceptable = options
            .acceptable_exit_codes
            .as_deref()
            .unwrap_or(&DEFAULT_ACCEPTABLE_EXIT_CODES);
        if result.exit_code_in(acceptable) {
            return Ok(());
        }

        Err(HarnessError::CommandFailure {
            host: self.name.clone(),
            command: command_line.to_string(),
            exit_code: result.exit_code,
            trace_limit,
            output_tail: result.formatted_output(trace_limit),
        })
    }

    fn connection_failure(
        &self,
        result: &CommandResult,
        command_line: &str,
        reason: &str,
        trace_limit: usize,
    ) -> HarnessError {
        HarnessError::ConnectionFailure {
            host: self.name.clone(),
            command: command_line.to_string(),
            reason: reason.to_string(),
            trace_limit,
            output_tail: result.formatted_output(trace_limit),
        }
    }
}

impl RenderTarget for Host {
    fn family(&self) -> PlatformFamily {
        self.platform.family()
    }

    fn prepend_cmds(&self) -> Option<&str> {
        self.config.prepend_cmds.as_deref()
    }

    fn append_cmds(&self) -> Option<&str> {
        self.config.append_cmds.as_deref()
    }

    fn property(&self, key: &str) -> Option<String> {
        self.get(key)
    }
}
