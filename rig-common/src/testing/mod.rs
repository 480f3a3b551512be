//! Test doubles for code built on rig-common.
//!
//! [`MockTransport`] is a scripted transport: queue responses, inject
//! connection failures, then inspect the recorded calls. Clones share
//! state, so a test keeps one handle while the [`crate::Host`] owns another
//! through [`MockTransportFactory`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::{ExecRequest, OutputEvent, Transport, TransportFactory, TransportSettings};
use crate::errors::TransportError;
use crate::logger::{LogLevel, LogSink};
use crate::result::OutputStream;
use crate::types::TransportKind;

/// Failure a mock injects, turned into a fresh [`TransportError`] each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Refused,
    Timeout,
    Reset,
    Disconnected,
    Auth,
    Protocol,
}

impl MockFailure {
    pub fn to_error(self) -> TransportError {
        match self {
            Self::Refused => TransportError::Refused("mock: connection refused".into()),
            Self::Timeout => TransportError::Timeout(Duration::from_secs(30)),
            Self::Reset => TransportError::Reset("mock: connection reset".into()),
            Self::Disconnected => TransportError::Disconnected("mock: stream closed".into()),
            Self::Auth => TransportError::Auth("mock: bad credentials".into()),
            Self::Protocol => TransportError::Protocol("mock: protocol error".into()),
        }
    }
}

/// Where a scripted failure hits a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    BeforeStart,
    AfterStart,
}

/// Scripted outcome of one `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Option<i32>,
    report_exit: bool,
    failure: Option<(MockFailure, FailPoint)>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::exit(0)
    }
}

impl MockResponse {
    pub fn exit(code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: Some(code),
            report_exit: true,
            failure: None,
        }
    }

    /// The stream ends cleanly but no exit status is reported.
    pub fn no_exit_code() -> Self {
        Self {
            report_exit: false,
            exit: None,
            ..Self::exit(0)
        }
    }

    /// The transport fails before the command starts.
    pub fn fail(failure: MockFailure) -> Self {
        Self {
            failure: Some((failure, FailPoint::BeforeStart)),
            ..Self::no_exit_code()
        }
    }

    /// The command starts, writes its output, then the connection drops.
    pub fn drop_after_start(failure: MockFailure) -> Self {
        Self {
            failure: Some((failure, FailPoint::AfterStart)),
            ..Self::no_exit_code()
        }
    }

    pub fn stdout(mut self, text: impl AsRef<[u8]>) -> Self {
        self.stdout = text.as_ref().to_vec();
        self
    }

    pub fn stderr(mut self, text: impl AsRef<[u8]>) -> Self {
        self.stderr = text.as_ref().to_vec();
        self
    }
}

/// A call the transport received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open(String),
    Run { command: String, pty: bool, stdin: Option<String> },
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    MakeDir(String),
    IsDir(String),
    ListFiles(String),
    Close,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    calls: Vec<MockCall>,
    open_failures: VecDeque<MockFailure>,
    always_fail_open: Option<MockFailure>,
    responses: VecDeque<MockResponse>,
    rules: Vec<(String, MockResponse)>,
    upload_failures: Vec<(String, MockFailure)>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Ssh)
    }

    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test poisons the lock; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` opens.
    pub fn fail_open(&self, times: usize, failure: MockFailure) -> &Self {
        self.state()
            .open_failures
            .extend(std::iter::repeat_n(failure, times));
        self
    }

    /// Fail every open.
    pub fn fail_open_always(&self, failure: MockFailure) -> &Self {
        self.state().always_fail_open = Some(failure);
        self
    }

    /// Queue a response for the next run not matched by a rule.
    pub fn push_response(&self, response: MockResponse) -> &Self {
        self.state().responses.push_back(response);
        self
    }

    /// Answer every command containing `pattern` with `response`.
    pub fn respond_to(&self, pattern: impl Into<String>, response: MockResponse) -> &Self {
        self.state().rules.push((pattern.into(), response));
        self
    }

    /// Fail uploads whose remote path contains `pattern`.
    pub fn fail_upload(&self, pattern: impl Into<String>, failure: MockFailure) -> &Self {
        self.state().upload_failures.push((pattern.into(), failure));
        self
    }

    /// Seed a remote file for downloads.
    pub fn add_remote_file(&self, path: impl Into<String>, contents: impl AsRef<[u8]>) -> &Self {
        self.state()
            .files
            .insert(path.into(), contents.as_ref().to_vec());
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Run { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Remote paths of every upload attempt, failed ones included.
    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Upload { remote, .. } => Some(remote),
                _ => None,
            })
            .collect()
    }

    pub fn made_dirs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::MakeDir(dir) => Some(dir),
                _ => None,
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Open(_)))
            .count()
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    fn record(&self, call: MockCall) {
        self.state().calls.push(call);
    }

    fn require_open(&self) -> Result<(), TransportError> {
        if self.state().open {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn next_response(&self, command: &str) -> MockResponse {
        let mut state = self.state();
        if let Some((_, response)) = state
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return response.clone();
        }
        state.responses.pop_front().unwrap_or_default()
    }

    fn drop_connection(&self, failure: MockFailure) -> TransportError {
        self.state().open = false;
        failure.to_error()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        self.record(MockCall::Open(address.to_string()));
        let mut state = self.state();
        if let Some(failure) = state.open_failures.pop_front().or(state.always_fail_open) {
            return Err(failure.to_error());
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn run(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        events: UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError> {
        self.record(MockCall::Run {
            command: command_line.to_string(),
            pty: request.pty,
            stdin: request.stdin.clone(),
        });
        self.require_open()?;

        let response = self.next_response(command_line);
        if let Some((failure, FailPoint::BeforeStart)) = response.failure {
            return Err(self.drop_connection(failure));
        }

        let _ = events.send(OutputEvent::Started);
        if !response.stdout.is_empty() {
            let _ = events.send(OutputEvent::output(OutputStream::Stdout, response.stdout));
        }
        if !response.stderr.is_empty() {
            let _ = events.send(OutputEvent::output(OutputStream::Stderr, response.stderr));
        }
        if let Some((failure, FailPoint::AfterStart)) = response.failure {
            return Err(self.drop_connection(failure));
        }
        if response.report_exit {
            let _ = events.send(OutputEvent::Exit(response.exit));
        }
        Ok(())
    }

    async fn upload(&mut self, local_file: &Path, remote_file: &str) -> Result<(), TransportError> {
        self.record(MockCall::Upload {
            local: local_file.to_path_buf(),
            remote: remote_file.to_string(),
        });
        self.require_open()?;

        let failure = self
            .state()
            .upload_failures
            .iter()
            .find(|(pattern, _)| remote_file.contains(pattern.as_str()))
            .map(|(_, failure)| *failure);
        if let Some(failure) = failure {
            return Err(self.drop_connection(failure));
        }

        let contents = tokio::fs::read(local_file).await?;
        self.state().files.insert(remote_file.to_string(), contents);
        Ok(())
    }

    async fn download(
        &mut self,
        remote_file: &str,
        local_file: &Path,
    ) -> Result<(), TransportError> {
        self.record(MockCall::Download {
            remote: remote_file.to_string(),
            local: local_file.to_path_buf(),
        });
        self.require_open()?;

        let contents = self
            .remote_file(remote_file)
            .ok_or_else(|| TransportError::Remote {
                path: remote_file.to_string(),
                message: "no such file".to_string(),
            })?;
        if let Some(parent) = local_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_file, contents).await?;
        Ok(())
    }

    async fn make_dir(&mut self, remote_dir: &str) -> Result<(), TransportError> {
        self.record(MockCall::MakeDir(remote_dir.to_string()));
        self.require_open()?;
        self.state().dirs.insert(remote_dir.to_string());
        Ok(())
    }

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool, TransportError> {
        self.record(MockCall::IsDir(remote_path.to_string()));
        self.require_open()?;

        let state = self.state();
        if state.dirs.contains(remote_path)
            || state.files.keys().any(|f| relative_to(remote_path, f).is_some())
        {
            Ok(true)
        } else if state.files.contains_key(remote_path) {
            Ok(false)
        } else {
            Err(TransportError::Remote {
                path: remote_path.to_string(),
                message: "no such file or directory".to_string(),
            })
        }
    }

    async fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>, TransportError> {
        self.record(MockCall::ListFiles(remote_dir.to_string()));
        self.require_open()?;

        Ok(self
            .state()
            .files
            .keys()
            .filter_map(|f| relative_to(remote_dir, f))
            .collect())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.record(MockCall::Close);
        self.state().open = false;
        Ok(())
    }
}

/// `file` relative to the directory `dir`, `/`-separated, for either
/// separator style.
fn relative_to(dir: &str, file: &str) -> Option<String> {
    let rest = file.strip_prefix(dir.trim_end_matches(['/', '\\']))?;
    let rest = rest.strip_prefix(['/', '\\'])?;
    (!rest.is_empty()).then(|| rest.replace('\\', "/"))
}

/// Hands out clones of one [`MockTransport`] and records what was asked for.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    transport: MockTransport,
    created: Arc<Mutex<Vec<(TransportKind, TransportSettings)>>>,
}

impl MockTransportFactory {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            created: Arc::default(),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Every `(kind, settings)` a transport was created for.
    pub fn created(&self) -> Vec<(TransportKind, TransportSettings)> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if let Ok(mut created) = self.created.lock() {
            created.push((kind, settings.clone()));
        }
        Ok(Box::new(self.transport.clone()))
    }
}

/// Records everything a [`crate::Logger`] emits.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String)>>,
    output: Mutex<Vec<(String, OutputStream, String)>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Host output echoed through the logger.
    pub fn echoed(&self) -> Vec<(String, OutputStream, String)> {
        self.output.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Whether any line at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }

    fn output(&self, host: &str, stream: OutputStream, text: &str) {
        if let Ok(mut output) = self.output.lock() {
            output.push((host.to_string(), stream, text.to_string()));
        }
    }
}

static TEST_LOGGING: Once = Once::new();

/// Route `tracing` output through the test harness writer. Safe to call
/// from every test; `RIG_TEST_LOG_LEVEL` overrides the `warn` default.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let level = std::env::var("RIG_TEST_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!("rig={level},rig_common={level}"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .compact()
            .try_init();
    });
}
