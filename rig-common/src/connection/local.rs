//! Runs commands as child processes of rig itself.
//!
//! Used for the control host and for end-to-end tests that need a real
//! process without a network.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use walkdir::WalkDir;

use super::{ExecRequest, OutputEvent, Transport};
use crate::errors::TransportError;
use crate::result::OutputStream;
use crate::types::TransportKind;
use crate::util::relative_slash_path;

#[derive(Debug, Default)]
pub struct LocalTransport {
    open: bool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn shell(command_line: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command_line);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command_line);
            cmd
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        debug!(%address, "local transport opened");
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn run(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        events: UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        if request.pty {
            debug!("pty requested; local commands inherit no terminal");
        }

        let mut child = Self::shell(command_line)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let _ = events.send(OutputEvent::Started);

        let stdin = child.stdin.take();
        let feed = async {
            if let (Some(mut pipe), Some(data)) = (stdin, request.stdin.as_deref()) {
                pipe.write_all(data.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, out, err) = tokio::join!(
            feed,
            pump(child.stdout.take(), OutputStream::Stdout, &events),
            pump(child.stderr.take(), OutputStream::Stderr, &events),
        );
        let status = child.wait().await?;
        out?;
        err?;
        if let Err(e) = fed {
            // The child may exit without reading its input.
            debug!(error = %e, "stdin not fully consumed");
        }

        let _ = events.send(OutputEvent::Exit(status.code()));
        Ok(())
    }

    async fn upload(&mut self, local_file: &Path, remote_file: &str) -> Result<(), TransportError> {
        copy_file(local_file, Path::new(remote_file)).await
    }

    async fn download(
        &mut self,
        remote_file: &str,
        local_file: &Path,
    ) -> Result<(), TransportError> {
        copy_file(Path::new(remote_file), local_file).await
    }

    async fn make_dir(&mut self, remote_dir: &str) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(remote_dir).await?;
        Ok(())
    }

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool, TransportError> {
        match tokio::fs::metadata(remote_path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransportError::Remote {
                path: remote_path.to_string(),
                message: "no such file or directory".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>, TransportError> {
        let root = PathBuf::from(remote_dir);
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file()
                && let Some(relative) = relative_slash_path(&root, entry.path())
            {
                files.push(relative);
            }
        }
        Ok(files)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}

/// Forward everything read from `reader` as output events.
pub(crate) async fn pump<R>(
    reader: Option<R>,
    stream: OutputStream,
    events: &UnboundedSender<OutputEvent>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let _ = events.send(OutputEvent::output(stream, buf[..n].to_vec()));
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), TransportError> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| TransportError::Remote {
            path: from.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(())
}
