//! OpenSSH transport over a multiplexed master connection.
//!
//! Commands go through `raw_command` so the rendered line reaches the remote
//! shell verbatim. File transfer streams bytes through `cat`, which works on
//! any POSIX host (including Cygwin) without an SFTP subsystem.

use std::borrow::Cow;
use std::path::Path;
use std::process::Stdio as StdStdio;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::local::pump;
use super::{ExecRequest, OutputEvent, Transport, TransportSettings};
use crate::errors::TransportError;
use crate::result::OutputStream;
use crate::types::TransportKind;

/// `ssh` exits with 255 when the connection itself failed.
const SSH_CONNECTION_ERROR: i32 = 255;

pub struct SshTransport {
    settings: TransportSettings,
    session: Option<Session>,
    destination: Option<String>,
}

impl SshTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            session: None,
            destination: None,
        }
    }

    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or(TransportError::NotConnected)
    }

    fn builder(&self) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .user(self.settings.user.clone())
            .port(self.settings.port)
            .connect_timeout(self.settings.connect_timeout)
            .server_alive_interval(self.settings.connect_timeout)
            .known_hosts_check(if self.settings.strict_host_key_checking {
                KnownHosts::Strict
            } else {
                KnownHosts::Accept
            });
        if let Some(identity) = &self.settings.identity_file {
            builder.keyfile(identity);
        }
        builder
    }

    /// Run a short helper command and collect its output.
    async fn helper(&self, command_line: &str) -> Result<std::process::Output, TransportError> {
        let session = self.session()?;
        debug!(command = %command_line, "ssh helper");
        session
            .raw_command(command_line)
            .output()
            .await
            .map_err(map_ssh_error)
    }

    /// PTY commands go through the system client on the master's socket.
    async fn run_with_pty(
        &self,
        command_line: &str,
        request: &ExecRequest,
        events: &UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError> {
        let session = self.session()?;
        let destination = self.destination.as_deref().ok_or(TransportError::NotConnected)?;

        let mut child = tokio::process::Command::new("ssh")
            .arg("-S")
            .arg(session.control_socket())
            .arg("-tt")
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-p")
            .arg(self.settings.port.to_string())
            .arg(format!("{}@{destination}", self.settings.user))
            .arg(command_line)
            .stdin(if request.stdin.is_some() {
                StdStdio::piped()
            } else {
                StdStdio::null()
            })
            .stdout(StdStdio::piped())
            .stderr(StdStdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let _ = events.send(OutputEvent::Started);

        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), request.stdin.as_deref()) {
            pipe.write_all(data.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let (out, err) = tokio::join!(
            pump(child.stdout.take(), OutputStream::Stdout, events),
            pump(child.stderr.take(), OutputStream::Stderr, events),
        );
        let status = child.wait().await?;
        out?;
        err?;

        if status.code() == Some(SSH_CONNECTION_ERROR) {
            return Err(TransportError::Disconnected(format!(
                "ssh client exited with {SSH_CONNECTION_ERROR}"
            )));
        }
        let _ = events.send(OutputEvent::Exit(status.code()));
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            let _ = session.close().await;
        }
        let session = self
            .builder()
            .connect(address)
            .await
            .map_err(map_ssh_error)?;
        info!(user = %self.settings.user, %address, port = self.settings.port, "ssh master connected");
        self.session = Some(session);
        self.destination = Some(address.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn run(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        events: UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError> {
        if request.pty {
            return self.run_with_pty(command_line, request, &events).await;
        }

        let session = self.session()?;
        let mut command = session.raw_command(command_line);
        command
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().await.map_err(map_ssh_error)?;
        let _ = events.send(OutputEvent::Started);

        let stdin = child.stdin().take();
        let feed = async {
            if let (Some(mut pipe), Some(data)) = (stdin, request.stdin.as_deref()) {
                pipe.write_all(data.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let stdout = child.stdout().take();
        let stderr = child.stderr().take();
        let (fed, out, err) = tokio::join!(
            feed,
            pump(stdout, OutputStream::Stdout, &events),
            pump(stderr, OutputStream::Stderr, &events),
        );

        let status = child.wait().await.map_err(map_ssh_error)?;
        out?;
        err?;
        if let Err(e) = fed {
            debug!(error = %e, "remote stdin closed early");
        }

        let _ = events.send(OutputEvent::Exit(status.code()));
        Ok(())
    }

    async fn upload(&mut self, local_file: &Path, remote_file: &str) -> Result<(), TransportError> {
        let session = self.session()?;
        let target = quote(remote_file);
        let script = match parent_dir(remote_file) {
            Some(parent) => format!("mkdir -p {} && cat > {target}", quote(parent)),
            None => format!("cat > {target}"),
        };

        let mut file = tokio::fs::File::open(local_file).await?;
        let mut child = session
            .raw_command(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(map_ssh_error)?;

        if let Some(mut pipe) = child.stdin().take() {
            tokio::io::copy(&mut file, &mut pipe).await?;
            pipe.shutdown().await?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr().take() {
            pipe.read_to_string(&mut stderr).await?;
        }
        let status = child.wait().await.map_err(map_ssh_error)?;
        if !status.success() {
            return Err(TransportError::Remote {
                path: remote_file.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn download(
        &mut self,
        remote_file: &str,
        local_file: &Path,
    ) -> Result<(), TransportError> {
        let output = self.helper(&format!("cat {}", quote(remote_file))).await?;
        if !output.status.success() {
            return Err(TransportError::Remote {
                path: remote_file.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if let Some(parent) = local_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_file, &output.stdout).await?;
        Ok(())
    }

    async fn make_dir(&mut self, remote_dir: &str) -> Result<(), TransportError> {
        let output = self.helper(&format!("mkdir -p {}", quote(remote_dir))).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Remote {
                path: remote_dir.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool, TransportError> {
        let quoted = quote(remote_path);
        let output = self
            .helper(&format!(
                "if test -d {quoted}; then echo d; elif test -e {quoted}; then echo f; else exit 2; fi"
            ))
            .await?;
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).trim() == "d"),
            _ => Err(TransportError::Remote {
                path: remote_path.to_string(),
                message: "no such file or directory".to_string(),
            }),
        }
    }

    async fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>, TransportError> {
        let output = self
            .helper(&format!("cd {} && find . -type f", quote(remote_dir)))
            .await?;
        if !output.status.success() {
            return Err(TransportError::Remote {
                path: remote_dir.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let mut files: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix("./"))
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.destination = None;
        match self.session.take() {
            Some(session) => session.close().await.map_err(map_ssh_error),
            None => Ok(()),
        }
    }
}

fn quote(path: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(path))
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

/// Connection-level failures are transient; everything else is not.
fn map_ssh_error(err: openssh::Error) -> TransportError {
    match err {
        openssh::Error::Connect(e) => TransportError::Unreachable(e.to_string()),
        openssh::Error::Disconnected => TransportError::Disconnected("ssh master went away".into()),
        openssh::Error::RemoteProcessTerminated => {
            TransportError::Disconnected("remote process terminated".into())
        }
        openssh::Error::ChildIo(e) => TransportError::Io(e),
        other => TransportError::Protocol(other.to_string()),
    }
}
