//! A host's connection: address aliases, one open transport handle, and the
//! retry loops around it.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Closed`, with
//! a failed connect falling back to `Disconnected`. Any operation on a
//! closed connection reconnects first.

pub mod local;
#[cfg(unix)]
pub mod ssh;
pub mod transport;
pub mod winrm;

use std::fmt;
use std::path::Path;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{HarnessError, TransportError};
use crate::result::{CommandResult, OutputStream};
use crate::retry::RetryPolicy;
use crate::types::TransportKind;
use crate::util::{join_remote, relative_slash_path};

pub use transport::{StandardTransports, Transport, TransportFactory, TransportSettings};

/// Trivial command used to check whether the remote end still answers.
const PROBE_COMMAND: &str = "echo .";

/// Progress of a running remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// The remote process was launched.
    Started,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The process ended; `None` when the remote side gave no status.
    Exit(Option<i32>),
}

impl OutputEvent {
    pub fn output(stream: OutputStream, bytes: Vec<u8>) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout(bytes),
            OutputStream::Stderr => Self::Stderr(bytes),
        }
    }
}

/// Live consumer of command output (console echo).
pub trait OutputSink: Send + Sync {
    fn on_output(&self, host: &str, stream: OutputStream, bytes: &[u8]);
}

/// Per-call execution options understood by transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Request a pseudo-terminal.
    pub pty: bool,
    /// Piped to the remote process, then stdin is closed.
    pub stdin: Option<String>,
}

/// The addresses a host can be reached at, tried in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionTargets {
    pub vmhostname: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

impl ConnectionTargets {
    /// Distinct, non-empty addresses: vmhostname, then ip, then hostname.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = Vec::with_capacity(3);
        for candidate in [&self.vmhostname, &self.ip, &self.hostname]
            .into_iter()
            .flatten()
        {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !addresses.iter().any(|a| a == candidate) {
                addresses.push(candidate.to_string());
            }
        }
        addresses
    }

    pub fn is_empty(&self) -> bool {
        self.addresses().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

pub struct Connection {
    host: String,
    targets: ConnectionTargets,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    address: Option<String>,
    /// Separator for remote paths built during tree transfers.
    separator: char,
    connect_policy: RetryPolicy,
    execute_policy: RetryPolicy,
    probe_policy: RetryPolicy,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("transport", &self.transport.kind())
            .field("targets", &self.targets)
            .field("state", &self.state)
            .field("address", &self.address)
            .finish()
    }
}

impl Connection {
    pub fn new(
        host: impl Into<String>,
        targets: ConnectionTargets,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            host: host.into(),
            targets,
            transport,
            state: ConnectionState::Disconnected,
            address: None,
            separator: '/',
            connect_policy: RetryPolicy::connection(),
            execute_policy: RetryPolicy::execution(),
            probe_policy: RetryPolicy::probe(),
        }
    }

    pub fn with_policies(
        mut self,
        connect: RetryPolicy,
        execute: RetryPolicy,
        probe: RetryPolicy,
    ) -> Self {
        self.connect_policy = connect;
        self.execute_policy = execute;
        self.probe_policy = probe;
        self
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn targets(&self) -> &ConnectionTargets {
        &self.targets
    }

    /// Address of the open handle, if any.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_open()
    }

    /// Point the connection at new addresses, dropping the open handle when
    /// they differ. Returns whether anything changed.
    pub async fn update_targets(&mut self, targets: ConnectionTargets) -> bool {
        if self.targets == targets {
            return false;
        }
        info!(host = %self.host, from = ?self.targets, to = ?targets, "connection targets changed");
        self.close().await;
        self.targets = targets;
        true
    }

    /// Open the transport, trying each address alias with its own retry
    /// loop. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<(), HarnessError> {
        if self.is_connected() {
            return Ok(());
        }

        let addresses = self.targets.addresses();
        if addresses.is_empty() {
            return Err(HarnessError::InvalidOption(format!(
                "host '{}' has no vmhostname, ip or hostname to connect to",
                self.host
            )));
        }

        self.state = ConnectionState::Connecting;
        let mut attempts = 0;
        let mut last_error = None;

        for address in addresses {
            let mut retry = self
                .connect_policy
                .start(format!("connect {}@{address}", self.transport.kind()));
            loop {
                attempts += 1;
                match self.transport.open(&address).await {
                    Ok(()) => {
                        info!(host = %self.host, %address, attempt = retry.attempt(), "connected");
                        self.state = ConnectionState::Connected;
                        self.address = Some(address);
                        return Ok(());
                    }
                    Err(err) => match retry.backoff(err).await {
                        Ok(()) => continue,
                        Err(err) if err.is_retryable() => {
                            last_error = Some(err);
                            break;
                        }
                        Err(err) => {
                            self.state = ConnectionState::Disconnected;
                            return Err(HarnessError::ConnectionEstablishment {
                                host: self.host.clone(),
                                attempts,
                                source: err,
                            });
                        }
                    },
                }
            }
            warn!(host = %self.host, %address, "giving up on address");
        }

        self.state = ConnectionState::Disconnected;
        Err(HarnessError::ConnectionEstablishment {
            host: self.host.clone(),
            attempts,
            source: last_error.unwrap_or(TransportError::NotConnected),
        })
    }

    /// Run `command_line` and capture its output.
    ///
    /// A transient failure before the command starts reconnects and
    /// retries. A transient failure after it started closes the connection
    /// and returns the partial result with no exit code.
    pub async fn execute(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandResult, HarnessError> {
        let mut retry = self.execute_policy.start(format!("execute on {}", self.host));

        loop {
            self.connect().await?;

            let (tx, rx) = mpsc::unbounded_channel();
            let mut result = CommandResult::new(&self.host, command_line);
            let (outcome, (started, exit)) = tokio::join!(
                self.transport.run(command_line, request, tx),
                drain_events(&self.host, rx, &mut result, sink),
            );

            match outcome {
                Ok(()) => {
                    result.exit_code = exit.flatten();
                    result.finalize();
                    return Ok(result);
                }
                Err(err) if exit.is_some() => {
                    debug!(host = %self.host, error = %err, "transport error after exit status; keeping result");
                    result.exit_code = exit.flatten();
                    result.finalize();
                    return Ok(result);
                }
                Err(err) if err.is_retryable() && started => {
                    warn!(host = %self.host, error = %err, "connection lost while command was running");
                    self.close().await;
                    result.exit_code = None;
                    result.finalize();
                    return Ok(result);
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.close().await;
                    }
                    if let Err(err) = retry.backoff(err).await {
                        return Err(self.failure(command_line, retry.attempt(), err));
                    }
                }
            }
        }
    }

    /// Probe until the remote end stops answering.
    ///
    /// Returns `true` (and closes the connection) the first time a transient
    /// transport error is seen, `false` after the probe rounds run out.
    pub async fn wait_for_connection_failure(&mut self) -> bool {
        let mut rounds = self.probe_policy.start(format!("probe {}", self.host));
        loop {
            match self.probe_once().await {
                Err(err) if err.is_retryable() => {
                    info!(host = %self.host, error = %err, "connection failure detected");
                    self.close().await;
                    return true;
                }
                Err(err) => debug!(host = %self.host, error = %err, "probe failed without disconnect"),
                Ok(()) => debug!(host = %self.host, round = rounds.attempt(), "host still reachable"),
            }
            if !rounds.wait().await {
                warn!(host = %self.host, rounds = rounds.max_attempts(), "connection never dropped");
                return false;
            }
        }
    }

    async fn probe_once(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_open() {
            let address = self
                .address
                .clone()
                .or_else(|| self.targets.addresses().into_iter().next())
                .ok_or(TransportError::NotConnected)?;
            self.transport.open(&address).await?;
            self.state = ConnectionState::Connected;
            self.address = Some(address);
        }

        let request = ExecRequest::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (outcome, ()) = tokio::join!(
            self.transport.run(PROBE_COMMAND, &request, tx),
            async { while rx.recv().await.is_some() {} },
        );
        outcome
    }

    /// Tear down the transport handle. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if !self.transport.is_open() {
            debug!(host = %self.host, "connection already closed");
        } else if let Err(err) = self.transport.close().await {
            warn!(host = %self.host, error = %err, "error while closing connection");
        } else {
            debug!(host = %self.host, "connection closed");
        }
        self.state = ConnectionState::Closed;
        self.address = None;
    }

    /// `mkdir -p` on the remote side.
    pub async fn make_dir(&mut self, remote_dir: &str) -> Result<(), HarnessError> {
        let description = format!("mkdir -p {remote_dir}");
        let mut retry = self.execute_policy.start(format!("mkdir on {}", self.host));
        loop {
            self.connect().await?;
            match self.transport.make_dir(remote_dir).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.is_retryable() {
                        self.close().await;
                    }
                    if let Err(err) = retry.backoff(err).await {
                        return Err(self.failure(&description, retry.attempt(), err));
                    }
                }
            }
        }
    }

    /// Copy a local file to `remote`, or a local directory's contents into
    /// the remote directory `remote`.
    pub async fn scp_to(&mut self, local: &Path, remote: &str) -> Result<CommandResult, HarnessError> {
        let description = format!("scp {} {}:{remote}", local.display(), self.host);
        let mut retry = self.execute_policy.start(format!("upload to {}", self.host));
        loop {
            self.connect().await?;
            match upload_tree(self.transport.as_mut(), local, remote, self.separator).await {
                Ok(count) => return Ok(self.transfer_result(&description, count)),
                Err(err) => {
                    if err.is_retryable() {
                        self.close().await;
                    }
                    if let Err(err) = retry.backoff(err).await {
                        return Err(self.failure(&description, retry.attempt(), err));
                    }
                }
            }
        }
    }

    /// Copy a remote file to `local`, or a remote directory's contents into
    /// the local directory `local`.
    pub async fn scp_from(&mut self, remote: &str, local: &Path) -> Result<CommandResult, HarnessError> {
        let description = format!("scp {}:{remote} {}", self.host, local.display());
        let mut retry = self.execute_policy.start(format!("download from {}", self.host));
        loop {
            self.connect().await?;
            match download_tree(self.transport.as_mut(), remote, local, self.separator).await {
                Ok(count) => return Ok(self.transfer_result(&description, count)),
                Err(err) => {
                    if err.is_retryable() {
                        self.close().await;
                    }
                    if let Err(err) = retry.backoff(err).await {
                        return Err(self.failure(&description, retry.attempt(), err));
                    }
                }
            }
        }
    }

    /// Transfers report success as exit code 0; failures are errors.
    fn transfer_result(&self, description: &str, files: usize) -> CommandResult {
        let mut result = CommandResult::new(&self.host, description);
        let note = format!("{description}: {files} file(s) copied\n");
        result.record_chunk(OutputStream::Stdout, note.as_bytes());
        result.exit_code = Some(0);
        result.finalize();
        result
    }

    fn failure(&self, command: &str, attempts: u32, err: TransportError) -> HarnessError {
        if err.is_retryable() {
            HarnessError::ExecutionFailure {
                host: self.host.clone(),
                command: command.to_string(),
                attempts,
                source: err,
            }
        } else {
            HarnessError::Transport(err)
        }
    }
}

/// Record events into `result` and echo them to `sink`.
///
/// Returns whether the command started and the exit event, if one arrived.
async fn drain_events(
    host: &str,
    mut events: UnboundedReceiver<OutputEvent>,
    result: &mut CommandResult,
    sink: Option<&dyn OutputSink>,
) -> (bool, Option<Option<i32>>) {
    let mut started = false;
    let mut exit = None;

    while let Some(event) = events.recv().await {
        let (stream, bytes) = match event {
            OutputEvent::Started => {
                started = true;
                continue;
            }
            OutputEvent::Exit(code) => {
                exit = Some(code);
                continue;
            }
            OutputEvent::Stdout(bytes) => (OutputStream::Stdout, bytes),
            OutputEvent::Stderr(bytes) => (OutputStream::Stderr, bytes),
        };
        started = true;
        result.record_chunk(stream, &bytes);
        if let Some(sink) = sink {
            sink.on_output(host, stream, &bytes);
        }
    }

    (started, exit)
}

async fn upload_tree(
    transport: &mut dyn Transport,
    local: &Path,
    remote: &str,
    separator: char,
) -> Result<usize, TransportError> {
    if !local.is_dir() {
        transport.upload(local, remote).await?;
        return Ok(1);
    }

    transport.make_dir(remote).await?;
    let mut copied = 0;
    for entry in WalkDir::new(local).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let Some(relative) = relative_slash_path(local, entry.path()) else {
            continue;
        };
        let target = join_remote(remote, &relative, separator);
        if entry.file_type().is_dir() {
            transport.make_dir(&target).await?;
        } else {
            transport.upload(entry.path(), &target).await?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn download_tree(
    transport: &mut dyn Transport,
    remote: &str,
    local: &Path,
    separator: char,
) -> Result<usize, TransportError> {
    if !transport.is_dir(remote).await? {
        transport.download(remote, local).await?;
        return Ok(1);
    }

    tokio::fs::create_dir_all(local).await?;
    let files = transport.list_files(remote).await?;
    for relative in &files {
        let source = join_remote(remote, relative, separator);
        let target = relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(local.to_path_buf(), |path, part| path.join(part));
        transport.download(&source, &target).await?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_order_and_dedup() {
        let targets = ConnectionTargets {
            vmhostname: Some("vm1.local".into()),
            ip: Some("10.0.0.5".into()),
            hostname: Some("vm1.local".into()),
        };
        assert_eq!(targets.addresses(), vec!["vm1.local", "10.0.0.5"]);
    }

    #[test]
    fn test_addresses_skip_blank() {
        let targets = ConnectionTargets {
            vmhostname: Some("  ".into()),
            ip: None,
            hostname: Some("web1".into()),
        };
        assert_eq!(targets.addresses(), vec!["web1"]);
        assert!(ConnectionTargets::default().is_empty());
    }

    #[test]
    fn test_output_event_constructor() {
        assert_eq!(
            OutputEvent::output(OutputStream::Stderr, b"x".to_vec()),
            OutputEvent::Stderr(b"x".to_vec())
        );
    }
}
