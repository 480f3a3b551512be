//! Shared library for rig, the acceptance-test orchestration harness.
//!
//! The heart of this crate is the remote execution path: a [`Command`] is
//! rendered for a [`Host`], the host lazily opens a [`Connection`] over one
//! of the supported transports (SSH, WinRM, local process), and the raw
//! output is captured into a [`CommandResult`] before the host applies its
//! exit-code and connection-failure policy.

#![forbid(unsafe_code)]

pub mod command;
pub mod config;
pub mod connection;
pub mod errors;
pub mod fanout;
pub mod host;
pub mod logger;
pub mod logging;
pub mod result;
pub mod retry;
pub mod testing;
pub mod types;
pub mod util;

pub use command::{Command, CommandKind, RenderTarget};
pub use config::{GlobalOptions, HostConfig, Inventory};
pub use connection::{
    Connection, ConnectionState, ConnectionTargets, ExecRequest, OutputEvent, OutputSink,
    StandardTransports, Transport, TransportFactory, TransportSettings,
};
pub use errors::{HarnessError, TransportError};
pub use fanout::{RunMode, on_hosts};
pub use host::{ExecOptions, Host};
pub use logger::{LogLevel, LogSink, Logger, TracingSink};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use result::{CommandResult, DEFAULT_ACCEPTABLE_EXIT_CODES, OutputStream};
pub use retry::{Backoff, RetryPolicy, RetryState, RetryableError, run_with_retry};
pub use types::{Platform, PlatformDefaults, PlatformFamily, TransportKind};
