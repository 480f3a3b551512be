//! Injectable logger adapter used by [`crate::Host`].
//!
//! A [`Logger`] wraps a [`LogSink`] and adds the harness-level switches:
//! quiet mode (only warnings and errors get through), colorized host output,
//! and the last finished result for the surrounding test layer. It never
//! fails.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::connection::OutputSink;
use crate::result::{CommandResult, OutputStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    /// Harness progress a user wants to see by default (command lines).
    Notify,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notify => "notify",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where log lines and echoed host output end up.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    /// Live output from a host; `text` may be a partial line.
    fn output(&self, host: &str, stream: OutputStream, text: &str);
}

/// Forwards log lines to `tracing` and echoes host output to the console.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Notify => tracing::info!(notify = true, "{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }

    fn output(&self, _host: &str, stream: OutputStream, text: &str) {
        // Console echo is best effort; a closed pipe must not fail the run.
        let _ = match stream {
            OutputStream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            OutputStream::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(text.as_bytes()).and_then(|()| err.flush())
            }
        };
    }
}

#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    quiet: Arc<AtomicBool>,
    color: bool,
    last_result: Arc<Mutex<Option<CommandResult>>>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("quiet", &self.is_quiet())
            .field("color", &self.color)
            .finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            quiet: Arc::new(AtomicBool::new(false)),
            color: false,
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message.as_ref());
    }

    pub fn notify(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Notify, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message.as_ref());
    }

    /// Quiet mode drops everything below warnings, including host output.
    /// Shared by every clone of this logger.
    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::Relaxed);
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    pub fn set_last_result(&self, result: &CommandResult) {
        if let Ok(mut slot) = self.last_result.lock() {
            *slot = Some(result.clone());
        }
    }

    pub fn last_result(&self) -> Option<CommandResult> {
        self.last_result.lock().ok().and_then(|slot| slot.clone())
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if self.is_quiet() && level < LogLevel::Warn {
            return;
        }
        let message = if self.color {
            match level {
                LogLevel::Debug => message.dimmed().to_string(),
                LogLevel::Info => message.to_string(),
                LogLevel::Notify => message.cyan().to_string(),
                LogLevel::Warn => message.yellow().to_string(),
                LogLevel::Error => message.red().bold().to_string(),
            }
        } else {
            message.to_string()
        };
        self.sink.log(level, &message);
    }
}

impl OutputSink for Logger {
    fn on_output(&self, host: &str, stream: OutputStream, bytes: &[u8]) {
        if self.is_quiet() {
            return;
        }
        let text = String::from_utf8_lossy(bytes);
        let text = match (self.color, stream) {
            (true, OutputStream::Stderr) => text.red().to_string(),
            _ => text.into_owned(),
        };
        self.sink.output(host, stream, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;

    #[test]
    fn test_levels_reach_sink() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(sink.clone());
        logger.debug("d");
        logger.notify("n");
        logger.error("e");

        assert_eq!(
            sink.lines(),
            vec![
                (LogLevel::Debug, "d".to_string()),
                (LogLevel::Notify, "n".to_string()),
                (LogLevel::Error, "e".to_string()),
            ]
        );
    }

    #[test]
    fn test_quiet_keeps_warnings_and_errors() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(sink.clone());
        let clone = logger.clone();
        clone.set_quiet(true);

        logger.info("hidden");
        logger.notify("hidden");
        logger.warn("shown");
        logger.on_output("web1", OutputStream::Stdout, b"hidden");

        assert!(logger.is_quiet());
        assert_eq!(sink.lines(), vec![(LogLevel::Warn, "shown".to_string())]);
        assert!(sink.echoed().is_empty());
    }

    #[test]
    fn test_output_echo() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(sink.clone());
        logger.on_output("web1", OutputStream::Stderr, b"oops\n");
        assert_eq!(
            sink.echoed(),
            vec![("web1".to_string(), OutputStream::Stderr, "oops\n".to_string())]
        );
    }

    #[test]
    fn test_last_result_is_shared_between_clones() {
        let logger = Logger::default();
        let clone = logger.clone();
        let mut result = CommandResult::new("web1", "true");
        result.exit_code = Some(0);
        result.finalize();

        clone.set_last_result(&result);
        assert_eq!(logger.last_result(), Some(result));
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Notify);
        assert!(LogLevel::Notify < LogLevel::Warn);
        assert_eq!(LogLevel::Notify.to_string(), "notify");
    }
}
