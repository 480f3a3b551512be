//! Windows Remote Management transport (WS-Management SOAP over HTTP).
//!
//! One remote shell per open handle. A command is `Command`, optional
//! `Send` for stdin, then `Receive` until the command state is `Done`, then
//! `Signal terminate`. File transfer runs chunked base64 PowerShell through
//! the same path.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExecRequest, OutputEvent, Transport, TransportSettings};
use crate::errors::TransportError;
use crate::result::OutputStream;
use crate::types::TransportKind;

const NS_ENVELOPE: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Fault code for "no output within the operation timeout"; not an error.
const OPERATION_TIMEOUT_CODE: &str = "2150858793";
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Bytes per upload command, sized so the encoded command line stays under
/// the cmd.exe limit of 8191 characters.
const UPLOAD_CHUNK: usize = 1400;

static SHELL_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:<(?:\w+:)?ShellId>|<(?:\w+:)?Selector Name="ShellId">)([^<]+)<"#)
        .expect("valid regex")
});
static COMMAND_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?CommandId>([^<]+)<").expect("valid regex"));
static STREAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?Stream\s([^>]*?)(?:/>|>([^<]*)</(?:\w+:)?Stream>)")
        .expect("valid regex")
});
static STREAM_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Name="(\w+)""#).expect("valid regex"));
static DONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(?:\w+:)?CommandState[^>]*State="[^"]*/Done""#).expect("valid regex")
});
static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?ExitCode>(-?\d+)<").expect("valid regex"));
static FAULT_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?(?:Text|Message)[^>]*>([^<]+)<").expect("valid regex")
});

/// What one `Receive` round produced.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveChunk {
    output: Vec<(OutputStream, Vec<u8>)>,
    done: bool,
    exit_code: Option<i32>,
}

enum Reply {
    Body(String),
    /// Receive returned no output within the operation timeout.
    OperationTimeout,
}

pub struct WinrmTransport {
    settings: TransportSettings,
    client: reqwest::Client,
    endpoint: Option<String>,
    shell_id: Option<String>,
}

impl WinrmTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(OPERATION_TIMEOUT + settings.connect_timeout)
            .build()
            .map_err(|e| TransportError::Protocol(format!("cannot build http client: {e}")))?;
        Ok(Self {
            settings,
            client,
            endpoint: None,
            shell_id: None,
        })
    }

    fn endpoint_for(&self, address: &str) -> String {
        let scheme = if self.settings.use_tls { "https" } else { "http" };
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{address}]")
        } else {
            address.to_string()
        };
        format!("{scheme}://{host}:{}/wsman", self.settings.port)
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let endpoint = self.endpoint.as_deref().unwrap_or_default();
        let selector = shell_id
            .map(|id| {
                format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{id}</w:Selector></w:SelectorSet>"#)
            })
            .unwrap_or_default();
        format!(
            concat!(
                r#"<s:Envelope xmlns:s="{ns_s}" xmlns:a="{ns_a}" xmlns:w="{ns_w}" xmlns:rsp="{ns_rsp}">"#,
                "<s:Header>",
                "<a:To>{to}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">{anon}</a:Address></a:ReplyTo>"#,
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{options}",
                "</s:Header>",
                "<s:Body>{body}</s:Body>",
                "</s:Envelope>"
            ),
            ns_s = NS_ENVELOPE,
            ns_a = NS_ADDRESSING,
            ns_w = NS_WSMAN,
            ns_rsp = NS_SHELL,
            to = xml_escape(endpoint),
            anon = ANONYMOUS,
            max = MAX_ENVELOPE_SIZE,
            id = Uuid::new_v4().to_string().to_uppercase(),
            timeout = OPERATION_TIMEOUT.as_secs(),
            resource = RESOURCE_CMD,
            action = action,
            selector = selector,
            options = options,
            body = body,
        )
    }

    async fn post(&self, envelope: String) -> Result<Reply, TransportError> {
        let endpoint = self.endpoint.as_deref().ok_or(TransportError::NotConnected)?;
        let response = self
            .client
            .post(endpoint)
            .basic_auth(&self.settings.user, self.settings.password.as_deref())
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| self.map_http_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_http_error(e))?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Auth(format!(
                "winrm rejected credentials for {}",
                self.settings.user
            )));
        }
        if status.is_success() {
            return Ok(Reply::Body(text));
        }
        if text.contains(OPERATION_TIMEOUT_CODE) {
            return Ok(Reply::OperationTimeout);
        }
        Err(TransportError::Protocol(fault_message(status.as_u16(), &text)))
    }

    async fn post_body(&self, envelope: String) -> Result<String, TransportError> {
        match self.post(envelope).await? {
            Reply::Body(text) => Ok(text),
            Reply::OperationTimeout => Err(TransportError::Timeout(OPERATION_TIMEOUT)),
        }
    }

    fn map_http_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.settings.connect_timeout)
        } else if err.is_connect() {
            TransportError::Refused(err.to_string())
        } else if err.is_request() || err.is_body() {
            TransportError::Disconnected(err.to_string())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }

    fn shell_id(&self) -> Result<String, TransportError> {
        self.shell_id.clone().ok_or(TransportError::NotConnected)
    }

    /// Run a PowerShell script and collect exit code and output.
    async fn powershell(&mut self, script: &str) -> Result<(Option<i32>, Vec<u8>, Vec<u8>), TransportError> {
        let command = format!(
            "powershell -NoProfile -NonInteractive -EncodedCommand {}",
            encode_powershell(&format!("$ErrorActionPreference = 'Stop'; {script}"))
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.run(&command, &ExecRequest::default(), tx).await?;

        let (mut exit, mut stdout, mut stderr) = (None, Vec::new(), Vec::new());
        while let Ok(event) = rx.try_recv() {
            match event {
                OutputEvent::Stdout(bytes) => stdout.extend(bytes),
                OutputEvent::Stderr(bytes) => stderr.extend(bytes),
                OutputEvent::Exit(code) => exit = code,
                OutputEvent::Started => {}
            }
        }
        Ok((exit, stdout, stderr))
    }

    async fn powershell_ok(&mut self, path: &str, script: &str) -> Result<Vec<u8>, TransportError> {
        let (exit, stdout, stderr) = self.powershell(script).await?;
        if exit == Some(0) {
            Ok(stdout)
        } else {
            Err(TransportError::Remote {
                path: path.to_string(),
                message: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Transport for WinrmTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Winrm
    }

    async fn open(&mut self, address: &str) -> Result<(), TransportError> {
        if self.shell_id.is_some() {
            let _ = self.close().await;
        }
        self.endpoint = Some(self.endpoint_for(address));

        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let reply = match self.post_body(self.envelope(ACTION_CREATE, None, options, body)).await {
            Ok(reply) => reply,
            Err(err) => {
                self.endpoint = None;
                return Err(err);
            }
        };
        let shell_id = capture(&SHELL_ID_RE, &reply)
            .ok_or_else(|| TransportError::Protocol("create shell response has no ShellId".into()))?;

        info!(%address, shell_id = %shell_id, "winrm shell opened");
        self.shell_id = Some(shell_id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shell_id.is_some()
    }

    async fn run(
        &mut self,
        command_line: &str,
        request: &ExecRequest,
        events: UnboundedSender<OutputEvent>,
    ) -> Result<(), TransportError> {
        let shell_id = self.shell_id()?;
        if request.pty {
            debug!("pty is not applicable to winrm; ignored");
        }

        let options = concat!(
            "<w:OptionSet>",
            r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
            "</w:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command_line)
        );
        let reply = self
            .post_body(self.envelope(ACTION_COMMAND, Some(&shell_id), options, &body))
            .await?;
        let command_id = capture(&COMMAND_ID_RE, &reply)
            .ok_or_else(|| TransportError::Protocol("command response has no CommandId".into()))?;
        let _ = events.send(OutputEvent::Started);

        if let Some(input) = &request.stdin {
            let body = format!(
                r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{command_id}" End="true">{}</rsp:Stream></rsp:Send>"#,
                STANDARD.encode(input.as_bytes())
            );
            self.post_body(self.envelope(ACTION_SEND, Some(&shell_id), "", &body))
                .await?;
        }

        let receive = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
        );
        let exit_code = loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(&shell_id), "", &receive);
            let text = match self.post(envelope).await? {
                Reply::OperationTimeout => continue,
                Reply::Body(text) => text,
            };
            let chunk = parse_receive(&text)?;
            for (stream, bytes) in chunk.output {
                let _ = events.send(OutputEvent::output(stream, bytes));
            }
            if chunk.done {
                break chunk.exit_code;
            }
        };

        let signal = format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        );
        if let Err(err) = self
            .post(self.envelope(ACTION_SIGNAL, Some(&shell_id), "", &signal))
            .await
        {
            debug!(error = %err, "terminate signal failed");
        }

        let _ = events.send(OutputEvent::Exit(exit_code));
        Ok(())
    }

    async fn upload(&mut self, local_file: &Path, remote_file: &str) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(local_file).await?;
        let target = ps_quote(remote_file);

        self.powershell_ok(
            remote_file,
            &format!(
                "$d = [IO.Path]::GetDirectoryName({target}); if ($d) {{ [IO.Directory]::CreateDirectory($d) | Out-Null }}; [IO.File]::WriteAllBytes({target}, [byte[]]@())"
            ),
        )
        .await?;

        for chunk in bytes.chunks(UPLOAD_CHUNK) {
            self.powershell_ok(
                remote_file,
                &format!(
                    "$b = [Convert]::FromBase64String('{}'); $f = [IO.File]::Open({target}, [IO.FileMode]::Append); $f.Write($b, 0, $b.Length); $f.Close()",
                    STANDARD.encode(chunk)
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn download(
        &mut self,
        remote_file: &str,
        local_file: &Path,
    ) -> Result<(), TransportError> {
        let stdout = self
            .powershell_ok(
                remote_file,
                &format!(
                    "[Convert]::ToBase64String([IO.File]::ReadAllBytes({}))",
                    ps_quote(remote_file)
                ),
            )
            .await?;
        let encoded: String = String::from_utf8_lossy(&stdout)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| TransportError::Protocol(format!("bad base64 from {remote_file}: {e}")))?;

        if let Some(parent) = local_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_file, bytes).await?;
        Ok(())
    }

    async fn make_dir(&mut self, remote_dir: &str) -> Result<(), TransportError> {
        self.powershell_ok(
            remote_dir,
            &format!(
                "New-Item -ItemType Directory -Force -Path {} | Out-Null",
                ps_quote(remote_dir)
            ),
        )
        .await
        .map(|_| ())
    }

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool, TransportError> {
        let path = ps_quote(remote_path);
        let stdout = self
            .powershell_ok(
                remote_path,
                &format!(
                    "if (Test-Path -LiteralPath {path} -PathType Container) {{ 'd' }} elseif (Test-Path -LiteralPath {path}) {{ 'f' }} else {{ throw 'no such file or directory' }}"
                ),
            )
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim() == "d")
    }

    async fn list_files(&mut self, remote_dir: &str) -> Result<Vec<String>, TransportError> {
        let stdout = self
            .powershell_ok(
                remote_dir,
                &format!(
                    "$root = (Resolve-Path -LiteralPath {}).ProviderPath.TrimEnd('\\'); Get-ChildItem -LiteralPath $root -Recurse -File | ForEach-Object {{ $_.FullName.Substring($root.Length + 1) }}",
                    ps_quote(remote_dir)
                ),
            )
            .await?;
        let mut files: Vec<String> = String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.replace('\\', "/"))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(shell_id) = self.shell_id.take() else {
            return Ok(());
        };
        let outcome = self
            .post(self.envelope(ACTION_DELETE, Some(&shell_id), "", ""))
            .await
            .map(|_| ());
        self.endpoint = None;
        outcome
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn parse_receive(text: &str) -> Result<ReceiveChunk, TransportError> {
    let mut chunk = ReceiveChunk::default();
    for caps in STREAM_RE.captures_iter(text) {
        let attributes = caps.get(1).map_or("", |m| m.as_str());
        let stream = match capture(&STREAM_NAME_RE, attributes).as_deref() {
            Some("stdout") => OutputStream::Stdout,
            Some("stderr") => OutputStream::Stderr,
            _ => continue,
        };
        let encoded = caps.get(2).map_or("", |m| m.as_str().trim());
        if encoded.is_empty() {
            continue;
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| TransportError::Protocol(format!("bad base64 in stream: {e}")))?;
        chunk.output.push((stream, bytes));
    }
    chunk.done = DONE_RE.is_match(text);
    chunk.exit_code = capture(&EXIT_CODE_RE, text).and_then(|code| code.parse().ok());
    Ok(chunk)
}

fn fault_message(status: u16, text: &str) -> String {
    match capture(&FAULT_TEXT_RE, text) {
        Some(message) => format!("winrm fault (http {status}): {message}"),
        None => format!("winrm request failed with http {status}"),
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn ps_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects.
fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVE_RUNNING: &str = r#"<s:Envelope><s:Body><rsp:ReceiveResponse>
<rsp:Stream Name="stdout" CommandId="C1">aGVsbG8K</rsp:Stream>
<rsp:Stream Name="stderr" CommandId="C1">b29wcw==</rsp:Stream>
<rsp:Stream Name="stdout" CommandId="C1" End="true"/>
<rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>
</rsp:ReceiveResponse></s:Body></s:Envelope>"#;

    const RECEIVE_DONE: &str = r#"<s:Envelope><s:Body><ReceiveResponse>
<Stream Name="stdout" CommandId="C1" End="true"></Stream>
<CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><ExitCode>3</ExitCode></CommandState>
</ReceiveResponse></s:Body></s:Envelope>"#;

    #[test]
    fn test_parse_receive_streams() {
        let chunk = parse_receive(RECEIVE_RUNNING).unwrap();
        assert_eq!(
            chunk.output,
            vec![
                (OutputStream::Stdout, b"hello\n".to_vec()),
                (OutputStream::Stderr, b"oops".to_vec()),
            ]
        );
        assert!(!chunk.done);
        assert_eq!(chunk.exit_code, None);
    }

    #[test]
    fn test_parse_receive_done_without_prefixes() {
        let chunk = parse_receive(RECEIVE_DONE).unwrap();
        assert!(chunk.output.is_empty());
        assert!(chunk.done);
        assert_eq!(chunk.exit_code, Some(3));
    }

    #[test]
    fn test_shell_and_command_ids() {
        let created = r#"<s:Body><rsp:Shell><rsp:ShellId>11111111-AAAA</rsp:ShellId></rsp:Shell></s:Body>"#;
        assert_eq!(capture(&SHELL_ID_RE, created).as_deref(), Some("11111111-AAAA"));

        let selector = r#"<w:SelectorSet><w:Selector Name="ShellId">22-BB</w:Selector></w:SelectorSet>"#;
        assert_eq!(capture(&SHELL_ID_RE, selector).as_deref(), Some("22-BB"));

        let command = r#"<rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse>"#;
        assert_eq!(capture(&COMMAND_ID_RE, command).as_deref(), Some("CMD-1"));
    }

    #[test]
    fn test_fault_message() {
        let fault = r#"<s:Fault><s:Reason><s:Text xml:lang="en-US">Access is denied.</s:Text></s:Reason></s:Fault>"#;
        assert_eq!(
            fault_message(500, fault),
            "winrm fault (http 500): Access is denied."
        );
        assert_eq!(fault_message(502, ""), "winrm request failed with http 502");
    }

    #[test]
    fn test_quoting_helpers() {
        assert_eq!(xml_escape("a & <b> \"c\""), "a &amp; &lt;b&gt; &quot;c&quot;");
        assert_eq!(ps_quote("C:\\it's"), "'C:\\it''s'");
    }

    #[test]
    fn test_encode_powershell_is_utf16le() {
        let decoded = STANDARD.decode(encode_powershell("ls")).unwrap();
        assert_eq!(decoded, vec![b'l', 0, b's', 0]);
    }

    #[test]
    fn test_endpoint_brackets_ipv6() {
        let transport = WinrmTransport::new(TransportSettings {
            port: 5985,
            ..TransportSettings::default()
        })
        .unwrap();
        assert_eq!(transport.endpoint_for("10.0.0.9"), "http://10.0.0.9:5985/wsman");
        assert_eq!(transport.endpoint_for("fe80::1"), "http://[fe80::1]:5985/wsman");
    }

    #[test]
    fn test_envelope_carries_action_and_selector() {
        let transport = WinrmTransport::new(TransportSettings::default()).unwrap();
        let envelope = transport.envelope(ACTION_RECEIVE, Some("SHELL-9"), "", "<rsp:Receive/>");
        assert!(envelope.contains(ACTION_RECEIVE));
        assert!(envelope.contains(r#"<w:Selector Name="ShellId">SHELL-9</w:Selector>"#));
        assert!(envelope.contains("<s:Body><rsp:Receive/></s:Body>"));
    }
}
