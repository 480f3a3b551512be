//! The seam between a [`super::Connection`] and the wire.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use super::{ExecRequest, OutputEvent};
use crate::errors::TransportError;
use crate::types::{PlatformFamily, TransportKind};

/// One transport handle: a session to a single address at a time.
///
/// `run` reports progress on `events`: [`OutputEvent::Started`] once the
/// remote process exists, output chunks as they arrive, and
/// [`OutputEvent::Exit`] when the process ends. Returning `Ok(())` without
/// an exit event means the remote side never reported a status.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn open(&mut self, address: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn run(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        events: UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError>;

    /// Copy one local file to `remote_file`, creating parent directories.
    async fn upload(&mut self, local_file: &Path, remote_file: &str) -> Result<(), TransportError>;

    /// Copy one remote file to `local_file`, creating parent directories.
    async fn download(&mut self, remote_file: &str, local_file: &Path)
    -> Result<(), TransportError>;

    /// `mkdir -p` semantics.
    async fn make_dir(&mut self, remote_dir: &str) -> Result<(), TransportError>;

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool, TransportError>;

    /// Files below `remote_dir`, relative to it, `/`-separated.
    async fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Credentials and knobs a transport is built with.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    /// WinRM over HTTPS.
    pub use_tls: bool,
    pub family: PlatformFamily,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
            password: None,
            identity_file: None,
            strict_host_key_checking: false,
            use_tls: false,
            family: PlatformFamily::Unix,
        }
    }
}

/// Builds transports for hosts.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        kind: TransportKind,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// The real transports: OpenSSH, WinRM and local processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardTransports;

impl TransportFactory for StandardTransports {
    fn create(
        &self,
        kind: TransportKind,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match kind {
            #[cfg(unix)]
            TransportKind::Ssh => Ok(Box::new(super::ssh::SshTransport::new(settings.clone()))),
            #[cfg(not(unix))]
            TransportKind::Ssh => Err(TransportError::Unsupported(
                "ssh transport requires a unix control host",
            )),
            TransportKind::Winrm => Ok(Box::new(super::winrm::WinrmTransport::new(
                settings.clone(),
            )?)),
            TransportKind::Local => Ok(Box::new(super::local::LocalTransport::new())),
        }
    }
}
