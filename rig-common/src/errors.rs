//! Error types for transports and the host execution layer.
//!
//! [`TransportError`] is what a transport reports; its retryable subset is
//! absorbed by the connection's retry loops. [`HarnessError`] is what callers
//! of [`crate::Host`] see once those loops give up or a policy check fails.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::retry::RetryableError;

/// Errors raised by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote operation on {path} failed: {message}")]
    Remote { path: String, message: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Whether this error belongs to the closed set of transient failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(err) => is_retryable_io(err.kind()),
            Self::Timeout(_)
            | Self::Refused(_)
            | Self::Reset(_)
            | Self::Unreachable(_)
            | Self::Disconnected(_) => true,
            Self::Auth(_)
            | Self::Protocol(_)
            | Self::Remote { .. }
            | Self::NotConnected
            | Self::Unsupported(_) => false,
        }
    }
}

impl RetryableError for TransportError {
    fn is_retryable(&self) -> bool {
        TransportError::is_retryable(self)
    }
}

fn is_retryable_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

/// Errors surfaced by [`crate::Host`] and [`crate::Connection`].
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Every address alias exhausted its connection attempts.
    #[error("failed to connect to {host} after {attempts} attempts: {source}")]
    ConnectionEstablishment {
        host: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The transport kept failing before the command could start.
    #[error("host '{host}' connection failure running:\n {command}\n{source}")]
    ExecutionFailure {
        host: String,
        command: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The output stream ended without an exit code, or an expected
    /// disconnection never happened.
    #[error(
        "host '{host}' {reason} running:\n {command}\nLast {trace_limit} lines of output were:\n{output_tail}"
    )]
    ConnectionFailure {
        host: String,
        command: String,
        reason: String,
        trace_limit: usize,
        output_tail: String,
    },

    /// The command finished with an exit code outside the accepted set.
    #[error(
        "host '{host}' exited with {} running:\n {command}\nLast {trace_limit} lines of output were:\n{output_tail}",
        display_exit_code(.exit_code)
    )]
    CommandFailure {
        host: String,
        command: String,
        exit_code: Option<i32>,
        trace_limit: usize,
        output_tail: String,
    },

    /// A host did not make an expected liveness transition.
    #[error("host '{host}' {message}")]
    RebootFailure { host: String, message: String },

    #[error("no such file or directory - {}", .0.display())]
    MissingSource(PathBuf),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HarnessError {
    /// True for [`HarnessError::CommandFailure`] and its specialization
    /// [`HarnessError::RebootFailure`].
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailure { .. } | Self::RebootFailure { .. })
    }

    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }

    /// Exit code carried by a command failure, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailure { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "no exit code".to_string(),
    }
}
