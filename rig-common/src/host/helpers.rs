//! Small remote operations built on [`Host::exec`], plus the reboot and
//! liveness helpers.

use std::borrow::Cow;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExecOptions, Host};
use crate::command::Command;
use crate::errors::{HarnessError, TransportError};
use crate::result::CommandResult;
use crate::retry::{RetryPolicy, run_with_retry};
use crate::util::join_remote;

/// Upper bound for one TCP probe.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl Host {
    /// `mkdir -p`; returns whether the directory now exists.
    pub async fn mkdir_p(&mut self, path: &str) -> Result<bool, HarnessError> {
        let command = self.mkdir_command(path);
        let result = self
            .exec(&command, &ExecOptions::new().accept_all_exit_codes())
            .await?;
        Ok(result.is_success())
    }

    /// Remove a file or directory tree.
    pub async fn rm_rf(&mut self, path: &str) -> Result<CommandResult, HarnessError> {
        let command = if self.platform.family().is_posix() {
            Command::new("rm").arg("-rf").arg(self.quote(path))
        } else {
            let quoted = self.quote(path);
            Command::host_command(format!(
                "if exist {quoted}\\* (rmdir /s /q {quoted}) else (del /f /q {quoted})"
            ))
        };
        self.exec(&command, &ExecOptions::new()).await
    }

    pub async fn file_exists(&mut self, path: &str) -> Result<bool, HarnessError> {
        let command = if self.platform.family().is_posix() {
            Command::new("test").arg("-e").arg(self.quote(path))
        } else {
            Command::host_command(format!(
                "if exist {} (exit 0) else (exit 1)",
                self.quote(path)
            ))
        };
        let result = self
            .exec(&command, &ExecOptions::new().silent())
            .await?;
        Ok(result.is_success())
    }

    /// Create a uniquely named directory under the platform temp dir.
    pub async fn tmpdir(&mut self, name: &str) -> Result<String, HarnessError> {
        let defaults = self.platform.defaults();
        let unique = Uuid::new_v4().simple().to_string();
        let path = join_remote(
            defaults.tmp_dir,
            &format!("{name}.{}", &unique[..8]),
            defaults.path_separator,
        );
        let command = self.mkdir_command(&path);
        self.exec(&command, &ExecOptions::new()).await?;
        Ok(path)
    }

    /// Whether `port` accepts TCP connections on the host's first address.
    pub async fn port_open(&self, port: u16) -> bool {
        let Some(address) = self.probe_address() else {
            return false;
        };
        probe_port(&address, port, self.probe_timeout()).await.is_ok()
    }

    /// Poll `port` until it accepts connections or `policy` runs out.
    pub async fn wait_for_port(&self, port: u16, policy: &RetryPolicy) -> Result<(), HarnessError> {
        let address = self.probe_address().ok_or_else(|| {
            HarnessError::InvalidOption(format!("host '{}' has no address to probe", self.name))
        })?;
        let probe_timeout = self.probe_timeout();
        let phase = format!("wait for {address}:{port}");

        run_with_retry(&phase, policy, || {
            let address = address.clone();
            async move { probe_port(&address, port, probe_timeout).await }
        })
        .await
        .map_err(|source| HarnessError::ConnectionEstablishment {
            host: self.name.clone(),
            attempts: policy.max_attempts(),
            source,
        })
    }

    /// Reboot and wait for the host to go down and come back.
    pub async fn reboot(&mut self) -> Result<(), HarnessError> {
        let command = Command::new(self.platform.defaults().reboot_command);
        self.exec(
            &command,
            &ExecOptions::new()
                .expect_connection_failure()
                .reset_connection(),
        )
        .await?;
        self.down().await?;
        self.up().await
    }

    /// Wait until the host stops accepting connections on its transport
    /// port.
    pub async fn down(&mut self) -> Result<(), HarnessError> {
        self.close().await;
        let port = self.port();
        let mut rounds = self.options.down_policy().start(format!("{} going down", self.name));
        loop {
            if !self.port_open(port).await {
                info!(host = %self.name, round = rounds.attempt(), "host is down");
                return Ok(());
            }
            debug!(host = %self.name, round = rounds.attempt(), "host still up");
            if !rounds.wait().await {
                return Err(HarnessError::RebootFailure {
                    host: self.name.clone(),
                    message: format!("failed to go down after {} rounds", rounds.max_attempts()),
                });
            }
        }
    }

    /// Wait until the host accepts connections again, then reconnect.
    pub async fn up(&mut self) -> Result<(), HarnessError> {
        let policy = self.options.up_policy();
        if let Err(err) = self.wait_for_port(self.port(), &policy).await {
            return Err(HarnessError::RebootFailure {
                host: self.name.clone(),
                message: format!("failed to come back up: {err}"),
            });
        }
        info!(host = %self.name, "host is back up");
        self.connection().await?.connect().await
    }

    fn mkdir_command(&self, path: &str) -> Command {
        if self.platform.family().is_posix() {
            Command::new("mkdir").arg("-p").arg(self.quote(path))
        } else {
            let quoted = self.quote(path);
            Command::host_command(format!("if not exist {quoted} mkdir {quoted}"))
        }
    }

    fn quote(&self, path: &str) -> String {
        if self.platform.family().is_posix() {
            shell_escape::unix::escape(Cow::Borrowed(path)).into_owned()
        } else {
            format!("\"{path}\"")
        }
    }

    fn probe_address(&self) -> Option<String> {
        self.connection
            .as_ref()
            .and_then(|c| c.address().map(str::to_string))
            .or_else(|| self.targets().addresses().into_iter().next())
    }

    fn probe_timeout(&self) -> Duration {
        self.options.connect_timeout.min(PORT_PROBE_TIMEOUT)
    }
}

async fn probe_port(address: &str, port: u16, limit: Duration) -> Result<(), TransportError> {
    match timeout(limit, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
