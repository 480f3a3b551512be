//! Captured output of a single remote operation.
//!
//! A [`CommandResult`] is created empty when an attempt starts, fed raw
//! chunks while the transport streams output, and finalized exactly once
//! when the operation ends. Finalizing copies the buffers to the `raw_*`
//! fields and derives the normalized text: invalid UTF-8 sequences are
//! dropped and `\r\n` / bare `\r` become `\n`.

use serde::{Deserialize, Serialize};

/// Exit codes accepted when the caller does not say otherwise: success, or
/// no exit code at all.
pub const DEFAULT_ACCEPTABLE_EXIT_CODES: [Option<i32>; 2] = [Some(0), None];

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Name of the host the operation ran on.
    pub host: String,
    /// Literal command line (or transfer description) that produced this result.
    pub command: String,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    output_buf: Vec<u8>,
    raw_stdout: Vec<u8>,
    raw_stderr: Vec<u8>,
    raw_output: Vec<u8>,
    stdout: String,
    stderr: String,
    output: String,
    /// `None` when the stream ended without reporting an exit status.
    pub exit_code: Option<i32>,
    finalized: bool,
}

impl CommandResult {
    pub fn new(host: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Result for an operation that was deliberately not executed.
    pub fn skipped(host: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        let mut result = Self::new(host, command.clone());
        let note = format!("dry run: '{command}' not executed\n");
        result.record_chunk(OutputStream::Stdout, note.as_bytes());
        result.finalize();
        result
    }

    /// Append a chunk to its stream and to the combined output.
    pub fn record_chunk(&mut self, stream: OutputStream, bytes: &[u8]) {
        match stream {
            OutputStream::Stdout => self.stdout_buf.extend_from_slice(bytes),
            OutputStream::Stderr => self.stderr_buf.extend_from_slice(bytes),
        }
        self.output_buf.extend_from_slice(bytes);
    }

    /// Derive the raw and normalized fields from the current buffers.
    ///
    /// Calling this twice is tolerated: the second call re-derives everything
    /// from the same buffers and produces identical values.
    pub fn finalize(&mut self) {
        if self.finalized {
            tracing::debug!(host = %self.host, "result finalized more than once");
        }
        self.raw_stdout = self.stdout_buf.clone();
        self.raw_stderr = self.stderr_buf.clone();
        self.raw_output = self.output_buf.clone();

        self.stdout = normalize_line_endings(&convert(&self.raw_stdout));
        self.stderr = normalize_line_endings(&convert(&self.raw_stderr));
        self.output = normalize_line_endings(&convert(&self.raw_output));
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Interleaved stdout and stderr, in arrival order.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn raw_stdout(&self) -> &[u8] {
        &self.raw_stdout
    }

    pub fn raw_stderr(&self) -> &[u8] {
        &self.raw_stderr
    }

    pub fn raw_output(&self) -> &[u8] {
        &self.raw_output
    }

    pub fn exit_code_in(&self, acceptable: &[Option<i32>]) -> bool {
        acceptable.contains(&self.exit_code)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last `limit` lines of combined output, each prefixed with a tab.
    pub fn formatted_output(&self, limit: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .map(|line| format!("\t{line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Decode as UTF-8, dropping byte sequences that are not valid characters.
fn convert(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
